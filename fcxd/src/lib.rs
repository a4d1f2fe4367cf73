pub mod config;
pub mod envsubst;
pub mod handler;
pub mod listener;
pub mod router;

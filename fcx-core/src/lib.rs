//! FastCGI responder plumbing: record framing, request assembly and a
//! readiness-driven connection driver.

pub mod assembler;
pub mod connection;
pub mod error;
pub mod handler;
pub mod reactor;
pub mod reassembler;
pub mod record;
pub mod records;

pub use assembler::{RequestAssembler, RequestLimits, State};
pub use connection::{Capabilities, Connection, ConnectionConfig, Reactor, ReadinessHandler, Transport};
pub use error::{FcgiError, Result};
pub use handler::{
    AsyncRequestHandler, HandlerError, HandlerResult, LogicalRequest, RequestHandler, Responder,
    ResponseEnvelope, Spawned, SyncHandler,
};
pub use reactor::{serve_connection, ReadyTransport};
pub use reassembler::FrameReassembler;
pub use record::{Record, RecordHeader, RecordType};
pub use records::{BeginRequest, EndRequest, ProtocolStatus, Role};

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;

use super::{Backend, CgiResponse, Routed};
use crate::config::StaticBackendConfig;

/// Answers every request with the same configured response.
pub struct FixedBackend {
    response: CgiResponse,
}

impl FixedBackend {
    pub fn new(config: &StaticBackendConfig) -> Self {
        Self {
            response: CgiResponse::new(
                config.status,
                &config.content_type,
                Bytes::from(config.body.clone()),
            ),
        }
    }
}

#[async_trait]
impl Backend for FixedBackend {
    async fn respond(&self, _routed: Routed<'_>) -> Result<CgiResponse> {
        Ok(self.response.clone())
    }
}

use anyhow::Result;
use async_trait::async_trait;
use fcx_core::{AsyncRequestHandler, HandlerError, HandlerResult, LogicalRequest, ResponseEnvelope};
use regex::Regex;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::{BackendConfig, FcxdConfig};
use crate::handler::echo::EchoBackend;
use crate::handler::files::FilesBackend;
use crate::handler::fixed::FixedBackend;
use crate::handler::{Backend, CgiResponse, Routed};

struct CompiledHandler {
    path_prefix: Option<String>,
    path_regex: Option<Regex>,
    host: Option<String>,
    backend: Arc<dyn Backend>,
}

pub struct Router {
    handlers: Vec<CompiledHandler>,
}

impl Router {
    pub fn new(config: &FcxdConfig) -> Result<Self> {
        let mut handlers = Vec::new();
        for h in &config.handlers {
            let backend: Arc<dyn Backend> = match &h.backend {
                BackendConfig::Static(cfg) => Arc::new(FixedBackend::new(cfg)),
                BackendConfig::Echo => Arc::new(EchoBackend),
                BackendConfig::Files(cfg) => Arc::new(FilesBackend::new(cfg)?),
            };

            let path_regex = h
                .r#match
                .path_regex
                .as_ref()
                .map(|p| Regex::new(p))
                .transpose()?;

            handlers.push(CompiledHandler {
                path_prefix: h.r#match.path_prefix.clone(),
                path_regex,
                host: h.r#match.host.clone(),
                backend,
            });
        }
        Ok(Self { handlers })
    }

    /// First handler matching the path and host, with the matched prefix (if any).
    pub fn route(&self, path: &str, host: Option<&str>) -> Option<(Arc<dyn Backend>, Option<&str>)> {
        for h in &self.handlers {
            if let Some(prefix) = &h.path_prefix {
                let prefix = prefix.as_str();
                let boundary_ok = path == prefix
                    || (path.starts_with(prefix)
                        && (prefix.ends_with('/')
                            || path.as_bytes().get(prefix.len()) == Some(&b'/')));
                if !boundary_ok {
                    continue;
                }
            }
            if let Some(regex) = &h.path_regex {
                if !regex.is_match(path) {
                    continue;
                }
            }
            if let Some(expected_host) = &h.host {
                match host {
                    Some(actual) if actual.eq_ignore_ascii_case(expected_host) => {}
                    _ => continue,
                }
            }
            return Some((Arc::clone(&h.backend), h.path_prefix.as_deref()));
        }
        None
    }
}

fn request_path(request: &LogicalRequest) -> &str {
    request
        .param("SCRIPT_NAME")
        .filter(|s| !s.is_empty())
        .or_else(|| request.param("DOCUMENT_URI").filter(|s| !s.is_empty()))
        .unwrap_or("/")
}

/// HTTP_HOST without a port.
fn request_host(request: &LogicalRequest) -> Option<&str> {
    let host = request.param("HTTP_HOST")?;
    if host.starts_with('[') {
        // [v6]:port
        return host.split_once(']').map(|(h, _)| &host[..h.len() + 1]);
    }
    Some(host.split_once(':').map_or(host, |(h, _)| h))
}

#[async_trait]
impl AsyncRequestHandler for Router {
    async fn handle(&self, request: LogicalRequest) -> HandlerResult {
        let path = request_path(&request);
        let host = request_host(&request);
        let Some((backend, matched_prefix)) = self.route(path, host) else {
            debug!(request_id = request.request_id, path, "no route");
            return Ok(ResponseEnvelope::new(CgiResponse::not_found().to_cgi_output(), 0));
        };

        let routed = Routed {
            request: &request,
            path,
            matched_prefix,
        };
        match backend.respond(routed).await {
            Ok(resp) => Ok(ResponseEnvelope::new(resp.to_cgi_output(), 0)),
            Err(e) => {
                warn!(request_id = request.request_id, path, error = %e, "backend failed");
                Err(HandlerError::failed(format!("{e:#}")))
            }
        }
    }
}

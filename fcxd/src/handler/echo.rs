use anyhow::Result;
use async_trait::async_trait;
use std::fmt::Write;

use super::{Backend, CgiResponse, Routed};

/// Reflects the request back: sorted PARAMS, a blank line, then STDIN.
pub struct EchoBackend;

#[async_trait]
impl Backend for EchoBackend {
    async fn respond(&self, routed: Routed<'_>) -> Result<CgiResponse> {
        let request = routed.request;
        let mut params: Vec<_> = request.params.iter().collect();
        params.sort();

        let mut text = String::new();
        for (name, value) in params {
            let _ = writeln!(text, "{name}={value}");
        }
        text.push('\n');

        let mut body = Vec::with_capacity(text.len() + request.stdin.len());
        body.extend_from_slice(text.as_bytes());
        body.extend_from_slice(&request.stdin);

        Ok(
            CgiResponse::new(200, "text/plain; charset=utf-8", body)
                .with_header("X-Fcx-Request-Id", request.request_id.to_string()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use fcx_core::{LogicalRequest, Role};
    use std::collections::HashMap;

    #[tokio::test]
    async fn echoes_params_then_stdin() {
        let request = LogicalRequest {
            request_id: 4,
            role: Role::Responder,
            keep_conn: false,
            params: HashMap::from([
                ("SCRIPT_NAME".to_string(), "/echo".to_string()),
                ("A".to_string(), "1".to_string()),
            ]),
            stdin: Bytes::from_static(b"body"),
        };
        let resp = EchoBackend
            .respond(Routed {
                request: &request,
                path: "/echo",
                matched_prefix: None,
            })
            .await
            .unwrap();
        assert_eq!(&resp.body[..], b"A=1\nSCRIPT_NAME=/echo\n\nbody");
        assert_eq!(resp.header("X-Fcx-Request-Id"), Some("4"));
    }
}

//! Contract between the connection driver and application code.
//!
//! A completed request is handed to a [`RequestHandler`] together with a
//! [`Responder`]. The handler may answer immediately or move the responder to
//! another task or thread; either way the result travels back through the
//! connection's completion queue and is applied by the connection's own task.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::records::Role;

/// A fully assembled request: BEGIN_REQUEST plus complete PARAMS and STDIN streams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalRequest {
    pub request_id: u16,
    pub role: Role,
    pub keep_conn: bool,
    pub params: HashMap<String, String>,
    pub stdin: Bytes,
}

impl LogicalRequest {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }
}

/// Output produced by a handler for one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseEnvelope {
    pub stdout: Bytes,
    pub stderr: Bytes,
    pub app_status: u32,
}

impl ResponseEnvelope {
    pub fn new(stdout: impl Into<Bytes>, app_status: u32) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: Bytes::new(),
            app_status,
        }
    }

    pub fn with_stderr(mut self, stderr: impl Into<Bytes>) -> Self {
        self.stderr = stderr.into();
        self
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandlerError {
    #[error("{message}")]
    Failed { message: String, app_status: u32 },

    #[error("handler finished without producing a response")]
    NoResponse,
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            app_status: 1,
        }
    }

    pub fn app_status(&self) -> u32 {
        match self {
            Self::Failed { app_status, .. } => (*app_status).max(1),
            Self::NoResponse => 1,
        }
    }

    /// Render the failure as a protocol response: message on STDERR, non-zero status.
    pub fn into_envelope(self) -> ResponseEnvelope {
        let status = self.app_status();
        ResponseEnvelope {
            stdout: Bytes::new(),
            stderr: Bytes::from(self.to_string()),
            app_status: status,
        }
    }
}

pub type HandlerResult = std::result::Result<ResponseEnvelope, HandlerError>;

/// A handler result on its way back to the connection that asked for it.
#[derive(Debug)]
pub struct Completion {
    pub request_id: u16,
    pub result: HandlerResult,
}

pub type CompletionSender = mpsc::UnboundedSender<Completion>;
pub type CompletionReceiver = mpsc::UnboundedReceiver<Completion>;

pub fn completion_queue() -> (CompletionSender, CompletionReceiver) {
    mpsc::unbounded_channel()
}

/// One-shot answer slot for a dispatched request. `Send`, so it may be
/// completed from any thread. Dropping it unanswered reports
/// [`HandlerError::NoResponse`].
#[derive(Debug)]
pub struct Responder {
    request_id: u16,
    tx: Option<CompletionSender>,
}

impl Responder {
    pub fn new(request_id: u16, tx: CompletionSender) -> Self {
        Self {
            request_id,
            tx: Some(tx),
        }
    }

    pub fn request_id(&self) -> u16 {
        self.request_id
    }

    pub fn respond(mut self, result: HandlerResult) {
        self.send(result);
    }

    fn send(&mut self, result: HandlerResult) {
        if let Some(tx) = self.tx.take() {
            // The connection may already be gone; the result is then discarded.
            let _ = tx.send(Completion {
                request_id: self.request_id,
                result,
            });
        }
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        self.send(Err(HandlerError::NoResponse));
    }
}

/// Application logic invoked once per assembled request.
pub trait RequestHandler: Send + Sync + 'static {
    fn handle(&self, request: LogicalRequest, responder: Responder);
}

impl<H: RequestHandler + ?Sized> RequestHandler for Arc<H> {
    fn handle(&self, request: LogicalRequest, responder: Responder) {
        (**self).handle(request, responder)
    }
}

/// Runs a closure inline on the connection's task. Only suitable for short work.
pub struct SyncHandler<F>(pub F);

impl<F> RequestHandler for SyncHandler<F>
where
    F: Fn(&LogicalRequest) -> HandlerResult + Send + Sync + 'static,
{
    fn handle(&self, request: LogicalRequest, responder: Responder) {
        responder.respond((self.0)(&request));
    }
}

/// Handlers that need to await I/O.
#[async_trait]
pub trait AsyncRequestHandler: Send + Sync + 'static {
    async fn handle(&self, request: LogicalRequest) -> HandlerResult;
}

/// Adapts an [`AsyncRequestHandler`] by spawning each request as its own task.
pub struct Spawned<H>(pub Arc<H>);

impl<H: AsyncRequestHandler> Spawned<H> {
    pub fn new(handler: H) -> Self {
        Self(Arc::new(handler))
    }
}

impl<H: AsyncRequestHandler> RequestHandler for Spawned<H> {
    fn handle(&self, request: LogicalRequest, responder: Responder) {
        let handler = Arc::clone(&self.0);
        tokio::spawn(async move {
            let result = handler.handle(request).await;
            responder.respond(result);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> LogicalRequest {
        LogicalRequest {
            request_id: 5,
            role: Role::Responder,
            keep_conn: false,
            params: HashMap::new(),
            stdin: Bytes::new(),
        }
    }

    #[test]
    fn dropped_responder_reports_no_response() {
        let (tx, mut rx) = completion_queue();
        drop(Responder::new(5, tx));
        let completion = rx.try_recv().unwrap();
        assert_eq!(completion.request_id, 5);
        assert_eq!(completion.result, Err(HandlerError::NoResponse));
    }

    #[test]
    fn responder_sends_once() {
        let (tx, mut rx) = completion_queue();
        Responder::new(5, tx).respond(Ok(ResponseEnvelope::new("OK", 0)));
        assert_eq!(
            rx.try_recv().unwrap().result,
            Ok(ResponseEnvelope::new("OK", 0))
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn handler_error_envelope() {
        let env = HandlerError::failed("boom").into_envelope();
        assert_eq!(env.app_status, 1);
        assert_eq!(&env.stderr[..], b"boom");
        assert!(env.stdout.is_empty());

        let zero = HandlerError::Failed {
            message: "x".into(),
            app_status: 0,
        };
        assert_eq!(zero.app_status(), 1);
    }

    #[test]
    fn sync_handler_answers_inline() {
        let (tx, mut rx) = completion_queue();
        let handler = SyncHandler(|req: &LogicalRequest| -> HandlerResult {
            Ok(ResponseEnvelope::new(format!("id={}", req.request_id), 0))
        });
        handler.handle(request(), Responder::new(5, tx));
        assert_eq!(&rx.try_recv().unwrap().result.unwrap().stdout[..], b"id=5");
    }

    struct Echo;

    #[async_trait]
    impl AsyncRequestHandler for Echo {
        async fn handle(&self, request: LogicalRequest) -> HandlerResult {
            tokio::task::yield_now().await;
            Ok(ResponseEnvelope::new(request.stdin, 0))
        }
    }

    #[tokio::test]
    async fn spawned_handler_completes_through_queue() {
        let (tx, mut rx) = completion_queue();
        let mut req = request();
        req.stdin = Bytes::from_static(b"payload");
        Spawned::new(Echo).handle(req, Responder::new(5, tx));
        let completion = rx.recv().await.unwrap();
        assert_eq!(&completion.result.unwrap().stdout[..], b"payload");
    }
}

//! Readiness driver on top of tokio.
//!
//! Each accepted socket gets one task. The task waits on socket readiness
//! and on the connection's completion queue, and forwards whichever fires
//! to the [`Connection`] callbacks. Because every callback for a socket
//! runs on that socket's task, connection state is never shared.

use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use tokio::io::{Interest, Ready};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tracing::trace;

use crate::connection::{Connection, ConnectionConfig, ReadinessHandler, Reactor, Transport};
use crate::error::Result;
use crate::handler::{completion_queue, Completion, RequestHandler};

/// A non-blocking socket that can also be awaited for readiness.
#[async_trait]
pub trait ReadyTransport: Transport + Send + Sync {
    async fn ready(&self, interest: Interest) -> io::Result<Ready>;
}

macro_rules! tokio_transport {
    ($ty:ty) => {
        impl Transport for $ty {
            fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                <$ty>::try_read(self, buf)
            }

            fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
                <$ty>::try_write(self, buf)
            }
        }

        #[async_trait]
        impl ReadyTransport for $ty {
            async fn ready(&self, interest: Interest) -> io::Result<Ready> {
                <$ty>::ready(self, interest).await
            }
        }
    };
}

tokio_transport!(TcpStream);
#[cfg(unix)]
tokio_transport!(UnixStream);

/// Interest set requested by the connection.
#[derive(Debug, Default)]
struct Registration {
    read: bool,
    write: bool,
}

impl Registration {
    fn interest(&self) -> Option<Interest> {
        match (self.read, self.write) {
            (true, true) => Some(Interest::READABLE.add(Interest::WRITABLE)),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

impl Reactor for Registration {
    fn register_read(&mut self) {
        self.read = true;
    }

    fn register_write(&mut self) {
        self.write = true;
    }

    fn unregister_write(&mut self) {
        self.write = false;
    }

    fn deregister(&mut self) {
        self.read = false;
        self.write = false;
    }
}

enum Event {
    Ready(io::Result<Ready>),
    Completion(Completion),
}

/// Serve one accepted socket until it closes.
///
/// Returns the error that ended the connection, if it was anything other
/// than an orderly close by the peer.
pub async fn serve_connection<S>(
    id: u64,
    stream: S,
    handler: Arc<dyn RequestHandler>,
    config: ConnectionConfig,
) -> Result<()>
where
    S: ReadyTransport + 'static,
{
    let (tx, mut rx) = completion_queue();
    let mut conn = Connection::new(id, stream, handler, tx, config);
    let mut registration = Registration::default();
    conn.start(&mut registration);

    loop {
        let Some(interest) = registration.interest() else {
            break;
        };
        let Some(stream) = conn.transport() else {
            break;
        };

        let event = tokio::select! {
            ready = stream.ready(interest) => Event::Ready(ready),
            Some(completion) = rx.recv() => Event::Completion(completion),
        };

        match event {
            Event::Ready(Ok(ready)) => {
                trace!(conn = id, ?ready, "socket ready");
                if ready.is_readable() || ready.is_read_closed() {
                    conn.on_readable(&mut registration);
                }
                if ready.is_writable() || ready.is_write_closed() {
                    conn.on_writable(&mut registration);
                }
            }
            Event::Ready(Err(e)) => conn.on_error(&mut registration, e.into()),
            Event::Completion(completion) => conn.on_completion(&mut registration, completion),
        }
    }

    match conn.take_failure() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

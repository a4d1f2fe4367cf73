use anyhow::{anyhow, Result};
use fcx_core::{serve_connection, ConnectionConfig, ReadyTransport, RequestHandler};
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// A bound listening socket.
pub enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener, std::path::PathBuf),
}

impl Listener {
    pub async fn bind(listen: &str) -> Result<Self> {
        if let Some(path) = listen.strip_prefix("unix://") {
            #[cfg(unix)]
            {
                use std::os::unix::fs::{FileTypeExt, PermissionsExt};

                // Only remove an existing path if it is a stale Unix socket.
                if let Ok(meta) = std::fs::symlink_metadata(path) {
                    if meta.file_type().is_socket() {
                        let _ = std::fs::remove_file(path);
                    } else {
                        return Err(anyhow!("path '{}' exists and is not a Unix socket", path));
                    }
                }
                let listener = UnixListener::bind(path)?;
                std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
                return Ok(Self::Unix(listener, path.into()));
            }
            #[cfg(not(unix))]
            {
                let _ = path;
                return Err(anyhow!("Unix sockets are not supported on this platform"));
            }
        }
        Ok(Self::Tcp(TcpListener::bind(listen).await?))
    }

    /// Printable local address (TCP address or socket path).
    pub fn local_addr(&self) -> Result<String> {
        match self {
            Self::Tcp(l) => Ok(l.local_addr()?.to_string()),
            #[cfg(unix)]
            Self::Unix(_, path) => Ok(format!("unix://{}", path.display())),
        }
    }

    /// Accept connections until `shutdown` resolves. Each connection runs in
    /// its own task; sockets beyond `max_connections` are dropped.
    pub async fn serve<F>(
        self,
        handler: Arc<dyn RequestHandler>,
        config: ConnectionConfig,
        max_connections: usize,
        shutdown: F,
    ) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let acceptor = Acceptor::new(handler, config, max_connections);
        match self {
            Self::Tcp(listener) => {
                let listener = &listener;
                accept_loop(
                    acceptor,
                    move || async move {
                        let (stream, peer) = listener.accept().await?;
                        Ok((stream, peer.to_string()))
                    },
                    shutdown,
                )
                .await;
            }
            #[cfg(unix)]
            Self::Unix(listener, path) => {
                let listener = &listener;
                accept_loop(
                    acceptor,
                    move || async move {
                        let (stream, _) = listener.accept().await?;
                        Ok((stream, "unix".to_string()))
                    },
                    shutdown,
                )
                .await;
                let _ = std::fs::remove_file(&path);
            }
        }
        info!("listener stopped");
        Ok(())
    }
}

/// Pause after a failed accept; EMFILE and friends usually clear once
/// connections finish.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Accept until `shutdown` resolves. Accept errors are logged and retried.
async fn accept_loop<S, A, Fut, F>(mut acceptor: Acceptor, mut accept: A, shutdown: F)
where
    S: ReadyTransport + 'static,
    A: FnMut() -> Fut,
    Fut: Future<Output = io::Result<(S, String)>>,
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    loop {
        let accepted = tokio::select! {
            accepted = accept() => accepted,
            _ = &mut shutdown => return,
        };
        match accepted {
            Ok((stream, peer)) => acceptor.spawn(stream, &peer),
            Err(err) => {
                warn!(error = ?err, "accept failed");
                tokio::select! {
                    _ = tokio::time::sleep(ACCEPT_RETRY_DELAY) => {}
                    _ = &mut shutdown => return,
                }
            }
        }
    }
}

struct Acceptor {
    handler: Arc<dyn RequestHandler>,
    config: ConnectionConfig,
    conn_semaphore: Arc<Semaphore>,
    next_id: u64,
}

impl Acceptor {
    fn new(handler: Arc<dyn RequestHandler>, config: ConnectionConfig, max_connections: usize) -> Self {
        Self {
            handler,
            config,
            conn_semaphore: Arc::new(Semaphore::new(max_connections)),
            next_id: 0,
        }
    }

    fn spawn<S>(&mut self, stream: S, peer: &str)
    where
        S: ReadyTransport + 'static,
    {
        let permit = match Arc::clone(&self.conn_semaphore).try_acquire_owned() {
            Ok(p) => p,
            Err(_) => {
                warn!(peer, "too many concurrent connections; dropping");
                return;
            }
        };
        self.next_id += 1;
        let id = self.next_id;
        let handler = Arc::clone(&self.handler);
        let config = self.config;
        let peer = peer.to_string();
        debug!(conn = id, peer = %peer, "connection accepted");
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = serve_connection(id, stream, handler, config).await {
                warn!(conn = id, peer = %peer, error = %e, "connection error");
            }
        });
    }
}

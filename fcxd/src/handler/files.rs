use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

use super::{Backend, CgiResponse, Routed};
use crate::config::FilesBackendConfig;

/// Serves files below a root directory.
pub struct FilesBackend {
    root: PathBuf,
    index: String,
}

impl FilesBackend {
    pub fn new(config: &FilesBackendConfig) -> Result<Self> {
        let root = std::fs::canonicalize(&config.root)
            .with_context(|| format!("files root {}", config.root.display()))?;
        if !root.is_dir() {
            return Err(anyhow!("files root '{}' is not a directory", root.display()));
        }
        Ok(Self {
            root,
            index: config.index.clone(),
        })
    }

    /// Map a request path below the matched prefix onto the root. `None` if the
    /// path tries to leave the root.
    fn resolve(&self, path: &str, prefix: Option<&str>) -> Option<PathBuf> {
        let rel = match prefix {
            Some(prefix) => path.strip_prefix(prefix.trim_end_matches('/')).unwrap_or(path),
            None => path,
        };
        let mut out = self.root.clone();
        for component in Path::new(rel.trim_start_matches('/')).components() {
            match component {
                Component::Normal(part) => out.push(part),
                Component::CurDir => {}
                _ => return None,
            }
        }
        Some(out)
    }
}

#[async_trait]
impl Backend for FilesBackend {
    async fn respond(&self, routed: Routed<'_>) -> Result<CgiResponse> {
        let Some(mut path) = self.resolve(routed.path, routed.matched_prefix) else {
            return Ok(CgiResponse::new(403, "text/plain; charset=utf-8", "forbidden\n"));
        };

        if tokio::fs::metadata(&path).await.is_ok_and(|m| m.is_dir()) {
            path.push(&self.index);
        }

        // Symlinks may still point outside the root.
        let canonical = match tokio::fs::canonicalize(&path).await {
            Ok(p) => p,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(CgiResponse::not_found()),
            Err(e) => return Err(e).with_context(|| format!("resolve {}", path.display())),
        };
        if !canonical.starts_with(&self.root) {
            debug!(path = %canonical.display(), "path escapes files root");
            return Ok(CgiResponse::new(403, "text/plain; charset=utf-8", "forbidden\n"));
        }

        let body = match tokio::fs::read(&canonical).await {
            Ok(body) => body,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(CgiResponse::not_found()),
            Err(e) => return Err(e).with_context(|| format!("read {}", canonical.display())),
        };
        let len = body.len();
        Ok(CgiResponse::new(200, content_type(&canonical), body)
            .with_header("Content-Length", len.to_string()))
    }
}

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html" | "htm") => "text/html; charset=utf-8",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("txt") => "text/plain; charset=utf-8",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("svg") => "image/svg+xml",
        _ => "application/octet-stream",
    }
}

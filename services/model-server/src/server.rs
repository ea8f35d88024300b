//! Serving the router on TCP or on a Unix domain socket.

use std::future::Future;
use std::path::PathBuf;

use anyhow::{Context, Result};
use axum::Router;
use tokio::net::TcpListener;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindTarget {
    Tcp { host: String, port: u16 },
    Unix(PathBuf),
}

impl std::fmt::Display for BindTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp { host, port } => write!(f, "http://{host}:{port}"),
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// Binds `target` and serves until `shutdown` resolves, then drains
/// in-flight requests.
pub async fn serve<F>(app: Router, target: &BindTarget, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    match target {
        BindTarget::Tcp { host, port } => {
            let listener = TcpListener::bind((host.as_str(), *port))
                .await
                .with_context(|| format!("binding {target}"))?;
            serve_tcp(listener, app, shutdown).await
        }
        #[cfg(unix)]
        BindTarget::Unix(path) => unix::serve_unix(path, app, shutdown).await,
        #[cfg(not(unix))]
        BindTarget::Unix(_) => anyhow::bail!("unix sockets are not supported on this platform"),
    }
}

pub async fn serve_tcp<F>(listener: TcpListener, app: Router, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!(addr = %listener.local_addr()?, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("http server")
}

#[cfg(unix)]
mod unix {
    use std::future::Future;
    use std::path::Path;
    use std::time::Duration;

    use anyhow::{Context, Result};
    use axum::extract::Request;
    use axum::Router;
    use hyper::body::Incoming;
    use hyper_util::rt::TokioIo;
    use tokio::net::UnixListener;
    use tokio::sync::watch;
    use tokio::task::JoinSet;
    use tower::ServiceExt;
    use tracing::{debug, info, warn};

    const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

    fn remove_stale(path: &Path) -> Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => {
                debug!(path = %path.display(), "removed stale socket");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing {}", path.display())),
        }
    }

    /// Yields the accepted stream, or waits out `ACCEPT_BACKOFF` after a
    /// failure such as running out of file descriptors.
    async fn accepted<S>(result: std::io::Result<S>) -> Option<S> {
        match result {
            Ok(stream) => Some(stream),
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                None
            }
        }
    }

    /// Collects connection tasks that already finished.
    fn reap(connections: &mut JoinSet<()>) -> usize {
        let mut reaped = 0;
        while let Some(res) = connections.try_join_next() {
            if let Err(e) = res {
                debug!(error = %e, "connection task failed");
            }
            reaped += 1;
        }
        reaped
    }

    pub(super) async fn serve_unix<F>(path: &Path, app: Router, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        remove_stale(path)?;
        let listener = UnixListener::bind(path).with_context(|| format!("binding unix:{}", path.display()))?;
        info!(path = %path.display(), "listening");

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            let result = tokio::select! {
                _ = &mut shutdown => break,
                result = listener.accept() => result.map(|(stream, _)| stream),
            };
            let Some(stream) = accepted(result).await else { continue };
            reap(&mut connections);
            let app = app.clone();
            let mut stop = stop_rx.clone();
            connections.spawn(async move {
                let service = hyper::service::service_fn(move |req: Request<Incoming>| {
                    app.clone().oneshot(req.map(axum::body::Body::new))
                });
                let conn = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service);
                tokio::pin!(conn);
                tokio::select! {
                    res = conn.as_mut() => {
                        if let Err(e) = res {
                            debug!(error = %e, "connection closed with error");
                        }
                    }
                    _ = stop.changed() => {
                        conn.as_mut().graceful_shutdown();
                        if let Err(e) = conn.await {
                            debug!(error = %e, "connection closed during shutdown");
                        }
                    }
                }
            });
        }

        drop(listener);
        let _ = stop_tx.send(true);
        while connections.join_next().await.is_some() {}
        remove_stale(path)?;
        info!(path = %path.display(), "unix listener closed");
        Ok(())
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_targets() {
        assert_eq!(BindTarget::Tcp { host: "localhost".into(), port: 8000 }.to_string(), "http://localhost:8000");
        assert_eq!(BindTarget::Unix(PathBuf::from("/tmp/rm.sock")).to_string(), "unix:/tmp/rm.sock");
    }
}

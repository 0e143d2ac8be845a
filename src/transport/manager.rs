//! Transport manager
//!
//! Chooses between stdio, HTTP, or both, owns the HTTP server task, and tears
//! down every session on shutdown.

use std::{future::Future, io, net::SocketAddr, sync::Mutex, sync::PoisonError, time::Duration};

use thiserror::Error;
use tokio::{net::TcpListener, runtime::Runtime, sync::oneshot, task::JoinHandle};
use tracing::{info, warn};

use crate::config::{ConfigError, TransportKind};
use crate::errors::AppError;
use crate::transport::stdio::StdioTransport;
use crate::{build_app, AppState};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Upper bound on waiting for blocking tasks once the server has stopped.
pub const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Drives `future` to completion, then shuts `runtime` down without waiting
/// on blocking tasks past [`RUNTIME_SHUTDOWN_TIMEOUT`]. Tokio reads stdin on a
/// blocking thread that cannot be cancelled, so dropping the runtime after
/// Ctrl+C in stdio mode would otherwise wait for the next input line.
pub fn block_on_then_release<F: Future>(runtime: Runtime, future: F) -> F::Output {
    let output = runtime.block_on(future);
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);
    output
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },
    #[error("http transport is already running")]
    AlreadyStarted,
    #[error("http server failed: {0}")]
    Serve(io::Error),
    #[error("stdio transport failed: {0}")]
    Stdio(#[source] AppError),
}

struct HttpHandle {
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<io::Result<()>>,
}

pub struct TransportManager {
    state: AppState,
    http: Mutex<Option<HttpHandle>>,
}

impl TransportManager {
    pub fn new(state: AppState) -> Self {
        Self {
            state,
            http: Mutex::new(None),
        }
    }

    pub fn transport(&self) -> TransportKind {
        self.state.config.transport
    }

    /// Address the HTTP server is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lock_http().as_ref().map(|handle| handle.local_addr)
    }

    /// Stdio blocks until stdin closes. HTTP returns once the listener is
    /// bound and serving in the background. `Both` serves HTTP in the
    /// background and stdio in the foreground.
    pub async fn start(&self) -> Result<(), TransportError> {
        match self.transport() {
            TransportKind::Stdio => self.run_stdio().await,
            TransportKind::Http => self.start_http().await.map(|_| ()),
            TransportKind::Both => {
                self.start_http().await?;
                self.run_stdio().await
            }
        }
    }

    pub async fn start_http(&self) -> Result<SocketAddr, TransportError> {
        if self.lock_http().is_some() {
            return Err(TransportError::AlreadyStarted);
        }

        let addr = self.state.config.bind_socket()?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| TransportError::Bind { addr, source })?;

        let app = build_app(self.state.clone());
        let (shutdown, signal) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            axum::serve(listener, app.into_make_service())
                .with_graceful_shutdown(async {
                    let _ = signal.await;
                })
                .await
        });

        info!(
            addr = %local_addr,
            session_mode = self.state.config.session_mode.as_str(),
            sse = self.state.config.sse.enabled,
            "http transport listening"
        );

        let mut slot = self.lock_http();
        if slot.is_some() {
            task.abort();
            return Err(TransportError::AlreadyStarted);
        }
        *slot = Some(HttpHandle {
            local_addr,
            shutdown,
            task,
        });
        Ok(local_addr)
    }

    /// Stops the HTTP server (if any) and closes every tracked session.
    /// Sessions are closed before waiting on the server so open event
    /// streams end and graceful shutdown can complete.
    pub async fn stop(&self) -> Result<(), TransportError> {
        let handle = self.lock_http().take();

        self.state.sessions.cleanup().await;
        self.state.sse_sessions.cleanup();

        let Some(handle) = handle else {
            return Ok(());
        };

        let _ = handle.shutdown.send(());
        let mut task = handle.task;
        match tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await {
            Ok(Ok(result)) => result.map_err(TransportError::Serve)?,
            Ok(Err(err)) => warn!(error = %err, "http server task ended abnormally"),
            Err(_) => {
                warn!("http server did not shut down in time, aborting");
                task.abort();
            }
        }

        info!(addr = %handle.local_addr, "http transport stopped");
        Ok(())
    }

    /// Starts, waits for `shutdown` (or stdin EOF in stdio mode), then stops.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> Result<(), TransportError> {
        let outcome = match self.transport() {
            TransportKind::Stdio => {
                tokio::select! {
                    result = self.run_stdio() => result,
                    _ = shutdown => Ok(()),
                }
            }
            TransportKind::Http => {
                self.start_http().await?;
                shutdown.await;
                Ok(())
            }
            TransportKind::Both => {
                self.start_http().await?;
                tokio::select! {
                    result = self.run_stdio() => result,
                    _ = shutdown => Ok(()),
                }
            }
        };

        let stopped = self.stop().await;
        outcome.and(stopped)
    }

    async fn run_stdio(&self) -> Result<(), TransportError> {
        StdioTransport::new(self.state.server.clone())
            .run()
            .await
            .map_err(TransportError::Stdio)
    }

    fn lock_http(&self) -> std::sync::MutexGuard<'_, Option<HttpHandle>> {
        self.http.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

//! Daemon listener — accepts connections and dispatches operations.
//!
//! Each accepted connection becomes exactly one session. Per protocol
//! turn the worker reads one request, dispatches it synchronously through
//! the engine, and writes one response; the connection then stays open for
//! the next request. Malformed or unknown requests produce a failure
//! response, never an abrupt close; only a transport-level disconnect ends
//! the session, and that triggers cleanup of everything the session owns.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::envelope::{self, Response};
use super::framing::{FramedStream, FramingError};
use crate::daemon::ShutdownSignal;
use crate::netstate::session::SessionId;
use crate::netstate::{NetState, OpError};

/// Errors from the daemon listener.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("another daemon is already listening on {0}")]
    AlreadyRunning(PathBuf),

    #[error("failed to bind socket at {path}: {source}")]
    Bind {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Bind the control socket and serve until the shutdown signal.
///
/// Exactly one daemon instance may own the socket path: when a live peer
/// is already answering on it, binding fails with
/// [`ServerError::AlreadyRunning`]; a socket file nobody answers on is
/// treated as stale and replaced.
pub async fn serve(
    socket_path: PathBuf,
    state: Arc<NetState>,
    mut shutdown_rx: broadcast::Receiver<ShutdownSignal>,
) -> Result<(), ServerError> {
    let listener = bind(&socket_path).await?;
    info!(path = %socket_path.display(), "control socket listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        let state = Arc::clone(&state);
                        tokio::spawn(async move {
                            handle_connection(stream, state).await;
                        });
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            }
            _ = shutdown_rx.recv() => {
                info!("control socket shutting down");
                break;
            }
        }
    }

    std::fs::remove_file(&socket_path).ok();
    Ok(())
}

async fn bind(socket_path: &Path) -> Result<UnixListener, ServerError> {
    if socket_path.exists() {
        // A connectable socket means a live daemon owns this path.
        if UnixStream::connect(socket_path).await.is_ok() {
            return Err(ServerError::AlreadyRunning(socket_path.to_path_buf()));
        }
        info!(path = %socket_path.display(), "removing stale socket file");
        std::fs::remove_file(socket_path)?;
    }
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    UnixListener::bind(socket_path).map_err(|source| ServerError::Bind {
        path: socket_path.to_path_buf(),
        source,
    })
}

/// Drive one connection: one session, one request/response per turn.
async fn handle_connection(stream: UnixStream, state: Arc<NetState>) {
    let mut framed = FramedStream::new(stream);
    let session = state.open_session().await;
    info!(session = %session, "client connected");

    loop {
        let bytes = match framed.receive().await {
            Ok(bytes) => bytes,
            Err(FramingError::ConnectionClosed) => {
                debug!(session = %session, "peer disconnected");
                break;
            }
            Err(e) => {
                warn!(session = %session, error = %e, "transport failure");
                break;
            }
        };

        let response = process_frame(&state, session, &bytes).await;
        if let Err(e) = framed.send(&envelope::encode_response(&response)).await {
            warn!(session = %session, error = %e, "failed to write response");
            break;
        }
    }

    if let Err(e) = state.cleanup(session).await {
        warn!(session = %session, error = %e, "session cleanup failed");
    }
}

/// Decode and dispatch one frame, always producing a response.
async fn process_frame(state: &NetState, session: SessionId, bytes: &[u8]) -> Response {
    let request = match envelope::decode_request(bytes) {
        Ok(request) => request,
        Err(e) => {
            debug!(session = %session, error = %e, "rejecting undecodable request");
            return Response::failure(envelope::peek_id(bytes), e.code(), e.to_string());
        }
    };

    debug!(session = %session, id = request.id, op = request.operation.name(), "dispatching");
    match state.execute(session, &request.operation).await {
        Ok(result) => Response::ok(request.id, result),
        Err(e @ OpError::ElevationRequired { .. }) => {
            let message = e.to_string();
            Response::elevation_required(request.id, e.elevation(), message)
        }
        Err(e) => Response::failure(request.id, e.code(), e.to_string()),
    }
}

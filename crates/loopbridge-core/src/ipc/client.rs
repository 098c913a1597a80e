//! Client stub — connects to the daemon over the framed socket protocol.
//!
//! Provides a typed client for the CLI and agent side. One client holds
//! one connection, and with it one daemon-side session: every resource
//! allocated through a client is rolled back by the daemon when the
//! connection drops.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use tokio::net::UnixStream;
use tracing::debug;

use super::envelope::{self, EnvelopeError, ErrorCode, Request, Response};
use super::framing::{FramedStream, FramingError};
use super::types::*;
use crate::elevation::ElevationRequest;

/// Errors from the daemon client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("daemon is not running (socket not found at {0})")]
    NotRunning(PathBuf),

    #[error("failed to connect to daemon socket at {path}: {source}")]
    Connect {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("transport error: {0}")]
    Transport(#[from] FramingError),

    #[error("codec error: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("response id {got} does not match request id {want}")]
    IdMismatch { want: u64, got: u64 },

    #[error("elevated privileges required")]
    ElevationRequired(Option<ElevationRequest>),

    #[error("operation failed ({code:?}): {message}")]
    Operation { code: ErrorCode, message: String },

    #[error("daemon response is missing its result payload")]
    MissingResult,
}

/// Client for the loopbridge daemon's control socket.
pub struct DaemonClient {
    socket_path: PathBuf,
    stream: Option<FramedStream>,
    next_id: u64,
}

impl DaemonClient {
    /// Create a client targeting the given socket path. No connection is
    /// made until the first call.
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            stream: None,
            next_id: 1,
        }
    }

    /// Check if the daemon socket exists (daemon is likely running).
    pub fn daemon_available(&self) -> bool {
        self.socket_path.exists()
    }

    /// Establish the connection, if not already connected.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        if self.stream.is_some() {
            return Ok(());
        }
        if !self.daemon_available() {
            return Err(ClientError::NotRunning(self.socket_path.clone()));
        }
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|source| ClientError::Connect {
                path: self.socket_path.clone(),
                source,
            })?;
        debug!(path = %self.socket_path.display(), "connected to daemon");
        self.stream = Some(FramedStream::new(stream));
        Ok(())
    }

    /// Close the connection. The daemon rolls back every resource this
    /// client's session owns.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.close().await;
        }
    }

    /// Send one operation and await its correlated response.
    async fn call(&mut self, operation: Operation) -> Result<OperationResult, ClientError> {
        self.connect().await?;
        let id = self.next_id;
        self.next_id += 1;

        let request = Request::new(id, operation);
        // Connection checked above; stream is always present here.
        let Some(stream) = self.stream.as_mut() else {
            return Err(ClientError::NotRunning(self.socket_path.clone()));
        };

        stream.send(&envelope::encode_request(&request)).await?;
        let response = envelope::decode_response(&stream.receive().await?)?;
        Self::unwrap_response(id, response)
    }

    fn unwrap_response(want: u64, response: Response) -> Result<OperationResult, ClientError> {
        if response.id != want {
            return Err(ClientError::IdMismatch {
                want,
                got: response.id,
            });
        }
        if !response.succeeded {
            let code = response.error_code.unwrap_or(ErrorCode::OsOperationFailed);
            if code == ErrorCode::ElevationRequired {
                return Err(ClientError::ElevationRequired(response.elevation));
            }
            return Err(ClientError::Operation {
                code,
                message: response.error_message.unwrap_or_default(),
            });
        }
        response.result.ok_or(ClientError::MissingResult)
    }

    // ── Typed API methods ──────────────────────────────────────────────

    /// Allocate a loopback address for each endpoint.
    pub async fn allocate_ip(
        &mut self,
        endpoints: Vec<EndpointDescriptor>,
    ) -> Result<Vec<EndpointAllocation>, ClientError> {
        match self
            .call(Operation::AllocateIp(AllocateIpArgs { endpoints }))
            .await?
        {
            OperationResult::Allocations(allocations) => Ok(allocations),
            _ => Err(ClientError::MissingResult),
        }
    }

    /// Release previously allocated loopback addresses.
    pub async fn free_ip(&mut self, addresses: Vec<Ipv4Addr>) -> Result<(), ClientError> {
        self.call(Operation::FreeIp(FreeIpArgs { addresses }))
            .await
            .map(|_| ())
    }

    /// Append session-tagged hosts entries for a workload namespace.
    pub async fn add_hosts_entries(
        &mut self,
        namespace: &str,
        entries: Vec<HostsEntrySpec>,
    ) -> Result<(), ClientError> {
        self.call(Operation::AddHostsEntries(AddHostsEntriesArgs {
            namespace: namespace.to_string(),
            entries,
        }))
        .await
        .map(|_| ())
    }

    /// Free ports held by user processes.
    pub async fn kill_process(
        &mut self,
        targets: Vec<ProcessTarget>,
    ) -> Result<Vec<TargetOutcome>, ClientError> {
        match self
            .call(Operation::KillProcess(KillProcessArgs { targets }))
            .await?
        {
            OperationResult::TargetOutcomes(outcomes) => Ok(outcomes),
            _ => Err(ClientError::MissingResult),
        }
    }

    /// Free ports held by OS-managed services.
    pub async fn disable_service(
        &mut self,
        targets: Vec<ServiceTarget>,
    ) -> Result<Vec<TargetOutcome>, ClientError> {
        match self
            .call(Operation::DisableService(DisableServiceArgs { targets }))
            .await?
        {
            OperationResult::TargetOutcomes(outcomes) => Ok(outcomes),
            _ => Err(ClientError::MissingResult),
        }
    }
}

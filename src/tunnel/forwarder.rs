//! Bidirectional byte copy between a relay data channel and the local service

use crate::error::ExposureError;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::debug;

/// Copy buffer size per direction
pub const FORWARD_BUFFER_SIZE: usize = 8 * 1024;

/// Result of one copy direction: bytes moved, or why it stopped early
pub type DirectionResult = Result<u64, ExposureError>;

/// Running forwarder; one task per direction
#[derive(Debug)]
pub struct ForwarderHandle {
    /// Relay → local copy
    pub relay_to_local: JoinHandle<DirectionResult>,
    /// Local → relay copy
    pub local_to_relay: JoinHandle<DirectionResult>,
}

impl ForwarderHandle {
    /// Wait for both directions to finish
    pub async fn join(self) -> (DirectionResult, DirectionResult) {
        let inbound = flatten(self.relay_to_local.await);
        let outbound = flatten(self.local_to_relay.await);
        (inbound, outbound)
    }

    /// Abort both directions
    pub fn abort(&self) {
        self.relay_to_local.abort();
        self.local_to_relay.abort();
    }
}

/// Forwards one relayed connection
///
/// Every byte written in either direction is added to the shared counter.
#[derive(Debug, Clone)]
pub struct TunnelConnectionForwarder {
    connection_id: String,
    bytes_transferred: Arc<AtomicU64>,
}

impl TunnelConnectionForwarder {
    /// Create a forwarder that reports into `bytes_transferred`
    pub fn new(connection_id: impl Into<String>, bytes_transferred: Arc<AtomicU64>) -> Self {
        Self {
            connection_id: connection_id.into(),
            bytes_transferred,
        }
    }

    /// Connection id from the relay
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Spawn both copy directions
    ///
    /// Each direction shuts down its write side when its read side reaches EOF
    /// or fails. The streams are released once both tasks finish.
    pub fn spawn<R, L>(self, relay: R, local: L) -> ForwarderHandle
    where
        R: AsyncRead + AsyncWrite + Send + 'static,
        L: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (relay_rd, relay_wr) = tokio::io::split(relay);
        let (local_rd, local_wr) = tokio::io::split(local);

        debug!("Forwarding relay connection {}", self.connection_id);

        let relay_to_local = tokio::spawn(pump(
            self.connection_id.clone(),
            "relay->local",
            relay_rd,
            local_wr,
            self.bytes_transferred.clone(),
        ));
        let local_to_relay = tokio::spawn(pump(
            self.connection_id,
            "local->relay",
            local_rd,
            relay_wr,
            self.bytes_transferred,
        ));

        ForwarderHandle {
            relay_to_local,
            local_to_relay,
        }
    }
}

async fn pump<R, W>(
    connection_id: String,
    direction: &'static str,
    mut reader: R,
    mut writer: W,
    counter: Arc<AtomicU64>,
) -> DirectionResult
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; FORWARD_BUFFER_SIZE];
    let mut total: u64 = 0;

    let outcome = loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break Ok(total),
            Ok(n) => n,
            Err(e) => break Err(format!("read failed: {}", e)),
        };

        let written = async {
            writer.write_all(&buf[..n]).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = written {
            break Err(format!("write failed: {}", e));
        }

        total += n as u64;
        counter.fetch_add(n as u64, Ordering::Relaxed);
    };

    let _ = writer.shutdown().await;

    match outcome {
        Ok(total) => {
            debug!("Connection {} {} closed after {} bytes", connection_id, direction, total);
            Ok(total)
        }
        Err(reason) => {
            debug!("Connection {} {} stopped: {}", connection_id, direction, reason);
            Err(ExposureError::Forwarding {
                id: connection_id,
                reason,
            })
        }
    }
}

fn flatten(joined: Result<DirectionResult, tokio::task::JoinError>) -> DirectionResult {
    joined.unwrap_or_else(|e| {
        Err(ExposureError::Forwarding {
            id: String::new(),
            reason: format!("task ended abnormally: {}", e),
        })
    })
}

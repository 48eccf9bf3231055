//! Per-connection HTTP transport for the stratus client.
//!
//! Each [`TransportHandle`] owns at most one HTTP/1 connection to the storage
//! endpoint, dialed lazily and kept alive across operations. The socket is
//! tuned for bulk transfer (TCP_NODELAY, 1 MB buffers, aggressive TCP
//! keepalive), requests go out as HTTP/1.0 so no server ever sees chunked
//! framing, TLS trust comes from a compiled-in AWS root list, a CA file, or
//! is disabled, and an HTTP proxy is traversed in absolute-form (plain HTTP)
//! or through a `CONNECT` tunnel (HTTPS).
//!
//! # Modules
//!
//! - [`handle`] - The connection handle: dialing, reuse, sending
//! - [`body`] - The streaming outbound request body
//! - [`tls`] - TLS connector construction and the embedded root list

pub mod body;
pub mod handle;
pub mod tls;

pub use body::OutboundBody;
pub use handle::TransportHandle;

use std::future::Future;
use std::time::Duration;

use stratus_core::error::{StorError, StorResult};

/// Run `fut` under the operation deadline.
///
/// # Errors
///
/// Produces a [`StorError::Transport`] whose message contains "timed out"
/// when the deadline elapses first.
pub async fn with_deadline<T, F>(timeout: Duration, fut: F) -> StorResult<T>
where
    F: Future<Output = StorResult<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(StorError::Transport(format!(
            "operation timed out after {} ms",
            timeout.as_millis()
        ))),
    }
}

//! One-shot JSON exchanges over Unix domain sockets.
//!
//! Every connection carries exactly one request followed by one response.
//! The sender signals the end of its document by shutting down its write
//! half; the receiver reads to end of stream under a size limit.

use std::future::Future;
use std::io;

use camino::Utf8Path;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};

/// Largest document accepted in either direction.
pub const MAX_FRAME_BYTES: u64 = 1024 * 1024;

/// Errors raised while exchanging documents.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connecting to or binding the socket failed.
    #[error("socket {path}: {source}")]
    Socket {
        /// Socket path.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// Reading or writing the stream failed.
    #[error("stream i/o failed: {0}")]
    Io(#[from] io::Error),
    /// The peer sent more than [`MAX_FRAME_BYTES`].
    #[error("document exceeds {MAX_FRAME_BYTES} bytes")]
    TooLarge,
    /// The document was not valid JSON for the expected type.
    #[error("malformed document: {0}")]
    Malformed(String),
}

/// Connects to `socket`, sends `request` and reads one response.
///
/// # Errors
///
/// Returns [`TransportError`] when the socket is unreachable, the stream
/// fails, or the response cannot be decoded.
pub async fn exchange<Req, Resp>(socket: &Utf8Path, request: &Req) -> Result<Resp, TransportError>
where
    Req: Serialize + Sync,
    Resp: DeserializeOwned,
{
    let mut stream = UnixStream::connect(socket.as_std_path())
        .await
        .map_err(|source| TransportError::Socket {
            path: socket.to_string(),
            source,
        })?;
    write_document(&mut stream, request).await?;
    read_document(&mut stream).await
}

/// Reads one request document from an accepted stream.
///
/// # Errors
///
/// Returns [`TransportError`] when the stream fails, the document is too
/// large, or it cannot be decoded.
pub async fn read_request<T: DeserializeOwned>(stream: &mut UnixStream) -> Result<T, TransportError> {
    read_document(stream).await
}

/// Writes the response document and closes the write half.
///
/// # Errors
///
/// Returns [`TransportError`] when serialisation or the write fails.
pub async fn write_response<T: Serialize + Sync>(
    stream: &mut UnixStream,
    response: &T,
) -> Result<(), TransportError> {
    write_document(stream, response).await
}

/// Binds a listener at `socket`, replacing a stale socket file left by a
/// previous process.
///
/// # Errors
///
/// Returns [`TransportError::Socket`] when the parent directory cannot be
/// created or the bind fails.
pub fn bind(socket: &Utf8Path) -> Result<UnixListener, TransportError> {
    let socket_error = |source| TransportError::Socket {
        path: socket.to_string(),
        source,
    };
    if let Some(parent) = socket.parent().filter(|dir| !dir.as_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(socket_error)?;
    }
    match std::fs::remove_file(socket) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(socket_error(err)),
    }
    UnixListener::bind(socket.as_std_path()).map_err(socket_error)
}

/// Returns a future that resolves on SIGINT or SIGTERM.
///
/// The SIGTERM handler is installed before this function returns, so a
/// terminate signal delivered before the future is first polled still ends
/// it. A signal that cannot be watched is logged and never fires.
#[must_use]
pub fn shutdown_signal() -> impl Future<Output = ()> + Send {
    let terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => Some(stream),
        Err(err) => {
            warn!(error = %err, "cannot listen for SIGTERM");
            None
        }
    };
    async move {
        let interrupt = async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "cannot listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        };
        let term = async move {
            match terminate {
                Some(mut stream) => {
                    stream.recv().await;
                }
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            () = interrupt => info!("interrupt received; shutting down"),
            () = term => info!("SIGTERM received; shutting down"),
        }
    }
}

async fn write_document<T: Serialize + Sync>(
    stream: &mut UnixStream,
    document: &T,
) -> Result<(), TransportError> {
    let payload =
        serde_json::to_vec(document).map_err(|err| TransportError::Malformed(err.to_string()))?;
    stream.write_all(&payload).await?;
    stream.shutdown().await?;
    Ok(())
}

async fn read_document<T: DeserializeOwned>(stream: &mut UnixStream) -> Result<T, TransportError> {
    let mut buffer = Vec::new();
    stream
        .take(MAX_FRAME_BYTES.saturating_add(1))
        .read_to_end(&mut buffer)
        .await?;
    if u64::try_from(buffer.len()).unwrap_or(u64::MAX) > MAX_FRAME_BYTES {
        return Err(TransportError::TooLarge);
    }
    serde_json::from_slice(&buffer).map_err(|err| TransportError::Malformed(err.to_string()))
}

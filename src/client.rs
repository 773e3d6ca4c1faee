//! Boundary to the protocol client and the user-facing notification sink.
//!
//! The message protocol itself is opaque here: `StreamBridge` only pumps bytes
//! between the editor's streams and whatever transport is currently attached.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use crate::error::SessionError;
use crate::transport::Transport;

/// Consumer of an opened transport.
pub trait ProtocolClient: Send {
    /// Take ownership of `transport` and start exchanging messages.
    fn attach(&mut self, transport: Transport) -> Result<(), SessionError>;
    /// Stop using the current transport. Must be safe to call when detached.
    fn detach(&mut self);
    fn is_attached(&self) -> bool;
}

/// User-facing error and status reporting.
pub trait Notifier: Send + Sync {
    fn error(&self, err: &SessionError);
    fn info(&self, message: &str);
}

/// Notifier that only writes to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn error(&self, err: &SessionError) {
        tracing::error!(code = err.error_code(), "{}", err);
    }

    fn info(&self, message: &str) {
        tracing::info!("{}", message);
    }
}

type SharedReader = Arc<Mutex<Box<dyn AsyncRead + Send + Unpin>>>;
type SharedWriter = Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

/// Forwards bytes between a long-lived editor connection and the transport
/// of the current server. The editor streams survive reattachment.
pub struct StreamBridge {
    editor_in: SharedReader,
    editor_out: SharedWriter,
    closed: Arc<Notify>,
    pumps: Vec<JoinHandle<()>>,
}

impl StreamBridge {
    pub fn new<R, W>(editor_in: R, editor_out: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            editor_in: Arc::new(Mutex::new(Box::new(editor_in))),
            editor_out: Arc::new(Mutex::new(Box::new(editor_out))),
            closed: Arc::new(Notify::new()),
            pumps: Vec::new(),
        }
    }

    /// Bridge this process's own stdin/stdout.
    pub fn stdio() -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout())
    }

    /// Notified once the editor side closes its input.
    pub fn closed_handle(&self) -> Arc<Notify> {
        self.closed.clone()
    }
}

impl ProtocolClient for StreamBridge {
    fn attach(&mut self, transport: Transport) -> Result<(), SessionError> {
        self.detach();

        let Transport {
            mut reader,
            mut writer,
            endpoint,
        } = transport;

        let editor_in = self.editor_in.clone();
        let closed = self.closed.clone();
        let upstream = tokio::spawn(async move {
            let mut input = editor_in.lock().await;
            match tokio::io::copy(&mut *input, &mut writer).await {
                Ok(bytes) => {
                    tracing::info!("Editor closed its input after {} bytes", bytes);
                    let _ = writer.shutdown().await;
                    closed.notify_one();
                }
                Err(e) => tracing::warn!("Forwarding to language server failed: {}", e),
            }
        });

        let editor_out = self.editor_out.clone();
        let downstream = tokio::spawn(async move {
            let mut output = editor_out.lock().await;
            match tokio::io::copy(&mut reader, &mut *output).await {
                Ok(_) => tracing::info!("[close] language server channel {} closed", endpoint),
                Err(e) => tracing::warn!("Forwarding from language server failed: {}", e),
            }
            let _ = output.flush().await;
        });

        self.pumps = vec![upstream, downstream];
        tracing::debug!("Protocol client attached to {}", endpoint);
        Ok(())
    }

    fn detach(&mut self) {
        for pump in self.pumps.drain(..) {
            pump.abort();
        }
    }

    fn is_attached(&self) -> bool {
        self.pumps.iter().any(|p| !p.is_finished())
    }
}

impl Drop for StreamBridge {
    fn drop(&mut self) {
        self.detach();
    }
}

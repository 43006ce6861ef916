//! Terminal session binding for the WebSocket attach proxy.
//!
//! The proxy is agnostic to what sits behind a sandbox terminal: it pumps
//! bytes between a WebSocket and a [`TerminalSession`]. Concrete bindings
//! are provided by a [`TerminalBinder`] — [`EchoBinder`] for the fake
//! provider and tests, and the Docker provider's tmux attach for live
//! sandboxes.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;

use crate::provider::ProviderError;

/// An open byte-stream session with a sandbox terminal.
///
/// `stderr` is absent for TTY-mode sessions where the terminal multiplexes
/// everything onto one stream.
pub struct TerminalSession {
    /// Writer feeding the terminal's stdin.
    pub input: Box<dyn AsyncWrite + Send + Unpin>,
    /// Reader over the terminal's stdout.
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    /// Reader over the terminal's stderr, when it is a distinct stream.
    pub stderr: Option<Box<dyn AsyncRead + Send + Unpin>>,
}

/// Opens terminal sessions against live instances.
#[async_trait]
pub trait TerminalBinder: Send + Sync {
    /// Bind to the terminal of the given instance.
    async fn bind(&self, instance_id: &str) -> Result<TerminalSession, ProviderError>;
}

/// Echo binder: everything written to stdin is read back from stdout.
///
/// Used with the fake provider and in proxy tests, where the interesting
/// behavior is authentication and frame pumping rather than the terminal.
pub struct EchoBinder;

#[async_trait]
impl TerminalBinder for EchoBinder {
    async fn bind(&self, _instance_id: &str) -> Result<TerminalSession, ProviderError> {
        let (client, server) = tokio::io::duplex(8192);
        let (mut server_read, mut server_write) = tokio::io::split(server);

        tokio::spawn(async move {
            let _ = tokio::io::copy(&mut server_read, &mut server_write).await;
        });

        let (client_read, client_write) = tokio::io::split(client);
        Ok(TerminalSession {
            input: Box::new(client_write),
            stdout: Box::new(client_read),
            stderr: None,
        })
    }
}

/// [`AsyncRead`] adapter over an `mpsc` channel of byte chunks.
///
/// Lets stream-shaped sources (Docker exec output) present as a plain
/// reader to the proxy pumps. Channel closure reads as EOF.
pub struct ChannelReader {
    rx: mpsc::Receiver<Vec<u8>>,
    buf: Vec<u8>,
    pos: usize,
}

impl ChannelReader {
    /// Wrap a receiver of byte chunks.
    pub fn new(rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            rx,
            buf: Vec::new(),
            pos: 0,
        }
    }

    fn drain_into(&mut self, out: &mut ReadBuf<'_>) {
        let available = self.buf.len().saturating_sub(self.pos);
        let n = out.remaining().min(available);
        let end = self.pos.saturating_add(n);
        out.put_slice(&self.buf[self.pos..end]);
        self.pos = end;
    }
}

impl AsyncRead for ChannelReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.pos < this.buf.len() {
            this.drain_into(buf);
            return Poll::Ready(Ok(()));
        }

        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => {
                this.buf = chunk;
                this.pos = 0;
                this.drain_into(buf);
                Poll::Ready(Ok(()))
            }
            // Sender dropped: EOF (zero bytes written).
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

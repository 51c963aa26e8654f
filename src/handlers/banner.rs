//! Client identification capture
//!
//! [`BannerTap`] sits between the socket and the SSH library and copies the
//! first `SSH-` line the client sends into a [`ClientBanner`] slot. Bytes are
//! passed through unchanged.

use std::io;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// RFC 4253 caps the identification string at 255 bytes including CR LF
const MAX_LINE: usize = 253;
/// Stop looking once this many bytes went by without an identification line
const MAX_INSPECT: usize = 8 * 1024;

/// Write-once slot for the peer's identification string
#[derive(Debug, Clone, Default)]
pub struct ClientBanner {
    slot: Arc<OnceLock<String>>,
}

impl ClientBanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only the first value is kept
    pub fn set(&self, banner: String) {
        let _ = self.slot.set(banner);
    }

    pub fn get(&self) -> Option<String> {
        self.slot.get().cloned()
    }
}

pub struct BannerTap<S> {
    inner: S,
    banner: ClientBanner,
    line: Vec<u8>,
    inspected: usize,
    done: bool,
}

impl<S> BannerTap<S> {
    pub fn new(inner: S, banner: ClientBanner) -> Self {
        Self {
            inner,
            banner,
            line: Vec::new(),
            inspected: 0,
            done: false,
        }
    }

    fn observe(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            if self.done {
                return;
            }
            self.inspected += 1;

            if byte == b'\n' {
                let text = String::from_utf8_lossy(&self.line);
                let text = text.trim_end_matches('\r');
                if text.starts_with("SSH-") {
                    self.banner.set(text.to_string());
                    self.done = true;
                }
                self.line.clear();
            } else if self.line.len() < MAX_LINE {
                self.line.push(byte);
            }

            if self.inspected >= MAX_INSPECT {
                self.done = true;
            }
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for BannerTap<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            if !this.done {
                let fresh = buf.filled()[before..].to_vec();
                this.observe(&fresh);
            }
        }
        poll
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for BannerTap<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}

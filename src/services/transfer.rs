//! Transfer copier: the single primitive used whenever upload bytes move,
//! whether from a request body into staging, between chunk files and the
//! reassembled artifact, or across volumes during finalization.
//!
//! The copy loop checks its [`CancellationToken`] before every read and
//! races each read against it, so an abandoned request stops writing within
//! one buffer.

use md5::Context;
use std::{
    io,
    pin::Pin,
    task::{self, Poll},
};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// Size of the copy buffer.
pub const COPY_BUFFER_SIZE: usize = 32 * 1024;

#[derive(Debug, Error)]
pub enum TransferError {
    /// The token fired. Carries the byte count written before it did.
    #[error("transfer cancelled after {0} bytes")]
    Cancelled(u64),
    #[error("short write: {written} of {read} bytes accepted")]
    ShortWrite { read: usize, written: usize },
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl TransferError {
    pub fn into_io(self) -> io::Error {
        match self {
            TransferError::Io(err) => err,
            TransferError::ShortWrite { .. } => io::Error::new(io::ErrorKind::WriteZero, self),
            TransferError::Cancelled(_) => io::Error::new(io::ErrorKind::Interrupted, self),
        }
    }
}

/// Copy `src` into `dst` until EOF, returning the number of bytes copied.
///
/// A write that accepts fewer bytes than were read is fatal for this
/// transfer and is never retried. `dst` is flushed before returning.
pub async fn copy<R, W>(
    dst: &mut W,
    src: &mut R,
    cancel: &CancellationToken,
) -> Result<u64, TransferError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut copied: u64 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled(copied));
        }

        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransferError::Cancelled(copied)),
            res = src.read(&mut buf) => res?,
        };
        if read == 0 {
            break;
        }

        let written = dst.write(&buf[..read]).await?;
        copied += written as u64;
        if written != read {
            return Err(TransferError::ShortWrite { read, written });
        }
    }

    dst.flush().await?;
    Ok(copied)
}

/// Writer adapter that computes an MD5 digest of every byte it accepts.
pub struct Md5Writer<W> {
    inner: W,
    digest: Context,
    bytes: u64,
}

impl<W> Md5Writer<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            digest: Context::new(),
            bytes: 0,
        }
    }

    /// Consume the adapter, returning the inner writer, the lowercase hex
    /// digest and the number of bytes seen.
    pub fn finish(self) -> (W, String, u64) {
        let etag = format!("{:x}", self.digest.compute());
        (self.inner, etag, self.bytes)
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for Md5Writer<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                this.digest.consume(&buf[..n]);
                this.bytes += n as u64;
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// Accepts only half of every write.
    struct HalfWriter(Vec<u8>);

    impl AsyncWrite for HalfWriter {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut task::Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            let n = (buf.len() / 2).max(1);
            self.get_mut().0.extend_from_slice(&buf[..n]);
            Poll::Ready(Ok(n))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut task::Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: Pin<&mut Self>,
            _cx: &mut task::Context<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn copies_everything_across_buffer_boundaries() {
        let data: Vec<u8> = (0..(COPY_BUFFER_SIZE * 3 + 17)).map(|i| i as u8).collect();
        let mut src = data.as_slice();
        let mut dst = Vec::new();

        let copied = copy(&mut dst, &mut src, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(copied, data.len() as u64);
        assert_eq!(dst, data);
    }

    #[tokio::test]
    async fn cancelled_token_copies_nothing() {
        let token = CancellationToken::new();
        token.cancel();
        let mut src: &[u8] = b"payload";
        let mut dst = Vec::new();

        let err = copy(&mut dst, &mut src, &token).await.unwrap_err();

        assert!(matches!(err, TransferError::Cancelled(0)));
        assert!(dst.is_empty());
    }

    #[tokio::test]
    async fn cancel_mid_transfer_stops_a_blocked_read() {
        let (mut tx, rx) = tokio::io::duplex(COPY_BUFFER_SIZE * 2);
        tx.write_all(&[7u8; 1000]).await.unwrap();

        let token = CancellationToken::new();
        let task = tokio::spawn({
            let token = token.clone();
            async move {
                let mut rx = rx;
                let mut out = Vec::new();
                let res = copy(&mut out, &mut rx, &token).await;
                (res, out)
            }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        let (res, out) = task.await.unwrap();

        assert!(matches!(res, Err(TransferError::Cancelled(1000))));
        assert_eq!(out.len(), 1000);
        drop(tx);
    }

    #[tokio::test]
    async fn short_write_is_fatal() {
        let mut src: &[u8] = b"0123456789";
        let mut dst = HalfWriter(Vec::new());

        let err = copy(&mut dst, &mut src, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            TransferError::ShortWrite {
                read: 10,
                written: 5
            }
        ));
        assert_eq!(dst.0.len(), 5);
    }

    #[tokio::test]
    async fn md5_writer_tracks_digest_and_length() {
        let mut src: &[u8] = b"hello";
        let mut writer = Md5Writer::new(Vec::new());

        copy(&mut writer, &mut src, &CancellationToken::new())
            .await
            .unwrap();
        let (inner, etag, bytes) = writer.finish();

        assert_eq!(inner, b"hello");
        assert_eq!(bytes, 5);
        assert_eq!(etag, "5d41402abc4b2a76b9719d911017c592");
    }
}

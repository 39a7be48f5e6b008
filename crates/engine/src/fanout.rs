//! Single-pass duplication of a record stream to several consumers.
//!
//! Each chunk read from the source is written to every open target before
//! the next read, so the slowest consumer paces the producer and memory use
//! stays at one chunk.

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

/// One consumer of the stream.
#[derive(Debug)]
pub struct TeeTarget<W> {
    pub label: String,
    writer: Option<W>,
    /// Bytes accepted before the target closed or failed.
    pub written: u64,
    /// First write error; the target is closed after it.
    pub error: Option<io::Error>,
}

impl<W> TeeTarget<W> {
    pub fn new(label: impl Into<String>, writer: W) -> Self {
        Self {
            label: label.into(),
            writer: Some(writer),
            written: 0,
            error: None,
        }
    }
}

/// What happened during one fan-out.
#[derive(Debug)]
pub struct FanOutReport<W> {
    pub bytes_read: u64,
    /// Targets in the order given, all writers closed.
    pub targets: Vec<TeeTarget<W>>,
}

/// Copy `source` to every target until end of stream.
///
/// A target that fails is closed and recorded while the others keep going;
/// the source is always drained so the producer never blocks on a full pipe.
/// Writers are shut down and dropped on return, which closes child stdin.
pub async fn fan_out<R, W>(
    mut source: R,
    mut targets: Vec<TeeTarget<W>>,
    chunk_size: usize,
) -> io::Result<FanOutReport<W>>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut bytes_read = 0u64;

    loop {
        let n = source.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        bytes_read += n as u64;

        for target in targets.iter_mut() {
            let Some(writer) = target.writer.as_mut() else {
                continue;
            };
            match writer.write_all(&buf[..n]).await {
                Ok(()) => target.written += n as u64,
                Err(e) => {
                    warn!("Stream consumer {} closed: {}", target.label, e);
                    target.error = Some(e);
                    target.writer = None;
                }
            }
        }
    }

    for target in targets.iter_mut() {
        if let Some(mut writer) = target.writer.take() {
            if let Err(e) = writer.shutdown().await {
                if target.error.is_none() && e.kind() != io::ErrorKind::BrokenPipe {
                    target.error = Some(e);
                }
            }
        }
    }

    debug!("Fan-out complete: {} bytes to {} targets", bytes_read, targets.len());
    Ok(FanOutReport { bytes_read, targets })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::sync::{Arc, Mutex};
    use std::task::{Context, Poll};

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl SharedBuf {
        fn contents(&self) -> Vec<u8> {
            self.0.lock().unwrap().clone()
        }
    }

    impl AsyncWrite for SharedBuf {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    /// Accepts `limit` bytes, then reports a broken pipe.
    struct Broken {
        limit: usize,
        seen: usize,
    }

    impl AsyncWrite for Broken {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            if self.seen >= self.limit {
                return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "sink gone")));
            }
            let n = buf.len().min(self.limit - self.seen);
            self.seen += n;
            Poll::Ready(Ok(n))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn records(n: usize) -> Vec<u8> {
        (0..n).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_every_target_gets_every_byte() {
        let data = records(10_000);
        let a = SharedBuf::default();
        let b = SharedBuf::default();
        let report = fan_out(
            &data[..],
            vec![TeeTarget::new("converter", a.clone()), TeeTarget::new("sink", b.clone())],
            1024,
        )
        .await
        .unwrap();

        assert_eq!(report.bytes_read, 10_000);
        assert_eq!(a.contents(), data);
        assert_eq!(b.contents(), data);
        assert!(report.targets.iter().all(|t| t.written == 10_000 && t.error.is_none()));
    }

    #[tokio::test]
    async fn test_failed_target_does_not_stop_others() {
        let data = records(5_000);
        let good = SharedBuf::default();

        let report = fan_out(
            &data[..],
            vec![
                TeeTarget::new("converter", Box::new(good.clone()) as Box<dyn AsyncWrite + Unpin + Send>),
                TeeTarget::new("sink", Box::new(Broken { limit: 1500, seen: 0 }) as Box<dyn AsyncWrite + Unpin + Send>),
            ],
            1000,
        )
        .await
        .unwrap();

        assert_eq!(report.bytes_read, 5_000);
        assert_eq!(good.contents(), data);
        let sink = &report.targets[1];
        assert!(sink.error.is_some());
        assert_eq!(sink.written, 1000);
        assert_eq!(sink.error.as_ref().unwrap().kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn test_no_targets_still_drains() {
        let data = records(3_000);
        let report = fan_out::<_, SharedBuf>(&data[..], Vec::new(), 512).await.unwrap();
        assert_eq!(report.bytes_read, 3_000);
    }
}

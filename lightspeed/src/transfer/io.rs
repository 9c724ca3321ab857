//! Byte stream plumbing shared by the stages.

use std::io;
use std::path::Path;
use std::pin::Pin;

use bytes::Bytes;
use futures::{Stream, StreamExt, TryStreamExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tokio_util::io::ReaderStream;
use tracing::{debug, trace};

use crate::{Error, Result};

/// A boxed stream of body chunks.
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Pass chunks through, reporting each chunk's length to `on_chunk`.
pub fn counted(stream: ByteStream, on_chunk: impl Fn(u64) + Send + 'static) -> ByteStream {
    Box::pin(stream.inspect_ok(move |chunk| on_chunk(chunk.len() as u64)))
}

/// Pass chunks through and call `on_end` once `stream` is exhausted.
pub fn on_end(stream: ByteStream, on_end: impl FnOnce() + Send + 'static) -> ByteStream {
    let trailer = futures::stream::once(async move {
        on_end();
        None::<io::Result<Bytes>>
    })
    .filter_map(futures::future::ready);

    Box::pin(stream.chain(trailer))
}

/// Body of an HTTP response as a [`ByteStream`].
pub fn response_stream(response: reqwest::Response) -> ByteStream {
    Box::pin(response.bytes_stream().map_err(io::Error::other))
}

/// Read `reader` to its end, then hold the end of stream until the producing
/// process has exited.
///
/// A failed exit turns into a trailing error so a consumer never mistakes a
/// truncated output for a complete one.
pub fn exit_gated<R>(reader: R, exit_rx: oneshot::Receiver<bool>, program: String) -> ByteStream
where
    R: AsyncRead + Send + 'static,
{
    let body = ReaderStream::new(reader);
    let trailer = futures::stream::once(async move {
        match exit_rx.await {
            Ok(true) => None,
            Ok(false) => Some(Err(io::Error::other(format!(
                "{program} failed; output is incomplete"
            )))),
            Err(_) => Some(Err(io::Error::other(format!(
                "{program} was stopped before it finished"
            )))),
        }
    })
    .filter_map(futures::future::ready);

    Box::pin(body.chain(trailer))
}

/// Copy `stream` into `writer`, then close the writer.
///
/// A reader that goes away early (broken pipe) ends the copy without error;
/// the reader's own exit status decides the outcome.
pub async fn feed<W>(mut stream: ByteStream, mut writer: W) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0u64;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| Error::source(format!("Source stream failed: {e}")))?;
        match writer.write_all(&chunk).await {
            Ok(()) => written += chunk.len() as u64,
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                debug!(written, "Reader closed its input early");
                return Ok(written);
            }
            Err(e) => return Err(Error::Io(e)),
        }
    }

    match writer.shutdown().await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {}
        Err(e) => return Err(Error::Io(e)),
    }
    trace!(written, "Input fully written");
    Ok(written)
}

/// Write `stream` to a new file at `path`.
pub async fn spool(stream: ByteStream, path: &Path) -> Result<u64> {
    let file = tokio::fs::File::create(path).await?;
    let mut writer = tokio::io::BufWriter::new(file);
    let written = feed(stream, &mut writer).await?;
    writer.into_inner().sync_all().await?;
    Ok(written)
}

/// Open `path` as a [`ByteStream`] and return it with the file size.
pub async fn file_stream(path: &Path) -> Result<(ByteStream, u64)> {
    let file = tokio::fs::File::open(path).await?;
    let len = file.metadata().await?.len();
    Ok((Box::pin(ReaderStream::new(file)), len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn chunks(parts: &[&'static [u8]]) -> ByteStream {
        let items: Vec<io::Result<Bytes>> = parts.iter().map(|p| Ok(Bytes::from_static(p))).collect();
        Box::pin(futures::stream::iter(items))
    }

    #[tokio::test]
    async fn test_counted_reports_every_chunk() {
        let total = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&total);
        let stream = counted(chunks(&[b"abc", b"de"]), move |n| {
            counter.fetch_add(n, Ordering::Relaxed);
        });

        let collected: Vec<Bytes> = stream.try_collect().await.unwrap();
        assert_eq!(collected.concat(), b"abcde");
        assert_eq!(total.load(Ordering::Relaxed), 5);
    }

    #[tokio::test]
    async fn test_on_end_fires_after_last_chunk() {
        let ended = Arc::new(AtomicU64::new(0));
        let flag = Arc::clone(&ended);
        let mut stream = on_end(chunks(&[b"abc"]), move || {
            flag.fetch_add(1, Ordering::Relaxed);
        });

        assert_eq!(stream.next().await.unwrap().unwrap(), &b"abc"[..]);
        assert_eq!(ended.load(Ordering::Relaxed), 0);
        assert!(stream.next().await.is_none());
        assert_eq!(ended.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_exit_gated_success_ends_cleanly() {
        let (tx, rx) = oneshot::channel();
        let stream = exit_gated(&b"output"[..], rx, "encoder".into());
        tx.send(true).unwrap();

        let collected: Vec<Bytes> = stream.try_collect().await.unwrap();
        assert_eq!(collected.concat(), b"output");
    }

    #[tokio::test]
    async fn test_exit_gated_failure_poisons_stream() {
        let (tx, rx) = oneshot::channel();
        let stream = exit_gated(&b"partial"[..], rx, "encoder".into());
        tx.send(false).unwrap();

        let result: io::Result<Vec<Bytes>> = stream.try_collect().await;
        assert!(result.unwrap_err().to_string().contains("incomplete"));
    }

    #[tokio::test]
    async fn test_exit_gated_dropped_supervisor_poisons_stream() {
        let (tx, rx) = oneshot::channel::<bool>();
        let stream = exit_gated(&b""[..], rx, "encoder".into());
        drop(tx);

        let result: io::Result<Vec<Bytes>> = stream.try_collect().await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_feed_closes_writer() {
        let (writer, mut reader) = tokio::io::duplex(64);
        let written = feed(chunks(&[b"hello ", b"world"]), writer).await.unwrap();
        assert_eq!(written, 11);

        let mut out = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut out)
            .await
            .unwrap();
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn test_feed_maps_source_errors() {
        let stream: ByteStream = Box::pin(futures::stream::iter(vec![
            Ok(Bytes::from_static(b"a")),
            Err(io::Error::other("connection reset")),
        ]));
        let err = feed(stream, tokio::io::sink()).await.unwrap_err();
        assert!(matches!(err, Error::SourceUnavailable(_)));
    }

    #[tokio::test]
    async fn test_spool_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.bin");

        assert_eq!(spool(chunks(&[b"12345"]), &path).await.unwrap(), 5);
        let (stream, len) = file_stream(&path).await.unwrap();
        assert_eq!(len, 5);
        let collected: Vec<Bytes> = stream.try_collect().await.unwrap();
        assert_eq!(collected.concat(), b"12345");
    }
}

//! Model file acquisition.
//!
//! Streams the model file from its remote source to the resolved location,
//! emitting percentage progress as it goes. Semantics are all-or-nothing: a
//! failure at any point removes the partial file, so the only durable
//! artifact on disk is either a complete model or nothing.
//!
//! The event stream is producer-driven: the download runs in a spawned task
//! and pushes events through a bounded channel. If the consumer goes away
//! (client disconnect mid-download), the failed send aborts the transfer and
//! triggers the same partial-file cleanup as a network error.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use futures_util::{Stream, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::paths::ModelLocation;

/// Where the model file is fetched from when not overridden.
pub const DEFAULT_MODEL_URL: &str =
    "https://huggingface.co/bartowski/Llama-3.2-3B-Instruct-GGUF/resolve/main/Llama-3.2-3B-Instruct-Q4_0.gguf";

/// Connect/read timeout for the download leg.
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// Progress event channel depth. The consumer is an SSE stream that drains
/// continuously, so a small buffer is enough.
const EVENT_BUFFER: usize = 32;

/// A discrete progress update for one acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    /// Completion percentage, 0..=100. Non-decreasing within one stream;
    /// `Percent(100)` is the successful terminal event.
    Percent(u8),
    /// Terminal failure with a human-readable description. The partial file
    /// has already been removed when this is emitted.
    Error(String),
}

/// Downloads the model file with progress reporting.
#[derive(Clone)]
pub struct Downloader {
    client: reqwest::Client,
    /// Destinations with a transfer in flight. Guards against two concurrent
    /// acquisitions racing on the same file.
    in_flight: Arc<Mutex<HashSet<PathBuf>>>,
}

impl Downloader {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(DOWNLOAD_TIMEOUT)
            .read_timeout(DOWNLOAD_TIMEOUT)
            .build()
            .context("failed to build download HTTP client")?;

        Ok(Self {
            client,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    /// Start acquiring the model file, returning the progress event stream.
    ///
    /// - If the file already exists the stream is exactly `[Percent(100)]`
    ///   and no network request is made.
    /// - Otherwise the body is streamed to disk chunk by chunk; a percentage
    ///   is emitted after every chunk when the total size is known.
    /// - Any failure deletes the partial file and ends the stream with a
    ///   single `Error` event. A later call starts over from zero.
    pub fn acquire(
        &self,
        location: &ModelLocation,
        url: &str,
    ) -> ReceiverStream<ProgressEvent> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);

        if location.exists() {
            tracing::debug!(path = %location.full_path.display(), "model already on disk");
            let _ = tx.try_send(ProgressEvent::Percent(100));
            return ReceiverStream::new(rx);
        }

        let Some(guard) = FlightGuard::begin(self.in_flight.clone(), &location.full_path)
        else {
            let _ = tx.try_send(ProgressEvent::Error(format!(
                "a download to {} is already in progress",
                location.full_path.display()
            )));
            return ReceiverStream::new(rx);
        };

        let client = self.client.clone();
        let dest = location.full_path.clone();
        let url = url.to_string();

        tokio::spawn(async move {
            let _guard = guard;

            tracing::info!(%url, "starting model download");
            match client.get(&url).send().await.and_then(|r| r.error_for_status()) {
                Ok(response) => {
                    let total = response.content_length();
                    let body = response.bytes_stream();
                    run_transfer(body, &dest, total, tx).await;
                }
                Err(e) => {
                    tracing::error!(%url, error = %e, "download request failed");
                    let _ = tx
                        .send(ProgressEvent::Error(format!("request failed: {e}")))
                        .await;
                }
            }
        });

        ReceiverStream::new(rx)
    }
}

/// Removes a destination from the in-flight set when the transfer ends,
/// however it ends.
struct FlightGuard {
    set: Arc<Mutex<HashSet<PathBuf>>>,
    path: PathBuf,
}

impl FlightGuard {
    /// Claim the destination, or `None` if another transfer holds it.
    fn begin(set: Arc<Mutex<HashSet<PathBuf>>>, path: &Path) -> Option<Self> {
        let claimed = set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.to_path_buf());
        claimed.then(|| Self {
            set,
            path: path.to_path_buf(),
        })
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.path);
    }
}

/// Drive a byte stream to disk and emit terminal events.
///
/// On success the last event is `Percent(100)`; on failure the partial file
/// is removed and the last event is `Error`. Factored over any fallible byte
/// stream so the chunk loop is testable without a network.
async fn run_transfer<S, B, E>(
    stream: S,
    dest: &Path,
    total_bytes: Option<u64>,
    tx: mpsc::Sender<ProgressEvent>,
) where
    S: Stream<Item = std::result::Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    match pump(stream, dest, total_bytes, &tx).await {
        Ok(written) => {
            tracing::info!(path = %dest.display(), bytes = written, "download complete");
            let _ = tx.send(ProgressEvent::Percent(100)).await;
        }
        Err(e) => {
            tracing::error!(path = %dest.display(), error = %e, "download failed");
            let _ = tokio::fs::remove_file(dest).await;
            let _ = tx.send(ProgressEvent::Error(e.to_string())).await;
        }
    }
}

/// Write chunks to `dest`, emitting a percentage after each one when the
/// total is known and positive. Percentages are non-decreasing because the
/// byte count only grows.
async fn pump<S, B, E>(
    mut stream: S,
    dest: &Path,
    total_bytes: Option<u64>,
    tx: &mpsc::Sender<ProgressEvent>,
) -> Result<u64>
where
    S: Stream<Item = std::result::Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let mut file = tokio::fs::File::create(dest)
        .await
        .with_context(|| format!("failed to create {}", dest.display()))?;

    let total = total_bytes.filter(|t| *t > 0);
    let mut downloaded: u64 = 0;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| anyhow!("transfer interrupted: {e}"))?;
        let bytes = chunk.as_ref();

        file.write_all(bytes)
            .await
            .with_context(|| format!("failed to write to {}", dest.display()))?;
        downloaded += bytes.len() as u64;

        if let Some(total) = total {
            let percent = (downloaded.saturating_mul(100) / total).min(100) as u8;
            if tx.send(ProgressEvent::Percent(percent)).await.is_err() {
                // Consumer is gone; abandon the transfer so the partial
                // file gets cleaned up.
                return Err(anyhow!("progress consumer disconnected"));
            }
        }
    }

    file.flush()
        .await
        .with_context(|| format!("failed to flush {}", dest.display()))?;

    Ok(downloaded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::ModelLocation;
    use futures_util::stream;
    use std::io;

    fn chunks(n: usize, size: usize) -> Vec<io::Result<Vec<u8>>> {
        (0..n).map(|_| Ok(vec![0u8; size])).collect()
    }

    async fn drain(mut rx: mpsc::Receiver<ProgressEvent>) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            events.push(ev);
        }
        events
    }

    #[tokio::test]
    async fn test_existing_file_short_circuits() {
        let tmp = tempfile::tempdir().unwrap();
        let location = ModelLocation::resolve_in(tmp.path()).unwrap();
        std::fs::write(&location.full_path, b"already here").unwrap();

        let downloader = Downloader::new().unwrap();
        let events: Vec<_> = downloader
            .acquire(&location, "http://invalid.localhost/never-contacted")
            .collect()
            .await;

        assert_eq!(events, vec![ProgressEvent::Percent(100)]);
    }

    #[tokio::test]
    async fn test_progress_is_monotonic_and_file_complete() {
        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join("model.gguf");
        let (tx, rx) = mpsc::channel(64);

        let body = stream::iter(chunks(8, 125));
        run_transfer(body, &dest, Some(1000), tx).await;
        let events = drain(rx).await;

        let percents: Vec<u8> = events
            .iter()
            .map(|ev| match ev {
                ProgressEvent::Percent(p) => *p,
                ProgressEvent::Error(msg) => panic!("unexpected error: {msg}"),
            })
            .collect();

        assert!(percents.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(percents.last(), Some(&100));
        assert_eq!(std::fs::metadata(&dest).unwrap().len(), 1000);
    }

    #[tokio::test]
    async fn test_unknown_total_emits_only_terminal_event() {
        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join("model.gguf");
        let (tx, rx) = mpsc::channel(64);

        let body = stream::iter(chunks(4, 100));
        run_transfer(body, &dest, None, tx).await;
        let events = drain(rx).await;

        assert_eq!(events, vec![ProgressEvent::Percent(100)]);
        assert_eq!(std::fs::metadata(&dest).unwrap().len(), 400);
    }

    #[tokio::test]
    async fn test_failure_removes_partial_file() {
        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join("model.gguf");
        let (tx, rx) = mpsc::channel(64);

        let mut body = chunks(3, 125);
        body.push(Err(io::Error::new(
            io::ErrorKind::ConnectionReset,
            "connection reset by peer",
        )));

        run_transfer(stream::iter(body), &dest, Some(1000), tx).await;
        let events = drain(rx).await;

        match events.last() {
            Some(ProgressEvent::Error(msg)) => {
                assert!(msg.contains("connection reset"), "got: {msg}")
            }
            other => panic!("expected terminal error, got {other:?}"),
        }
        assert!(!dest.exists(), "partial file must be removed");
    }

    #[tokio::test]
    async fn test_dropped_consumer_cleans_up_partial_file() {
        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join("model.gguf");
        // Capacity 1 and an immediately dropped receiver: the second send
        // fails, which is how a client disconnect shows up.
        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        let body = stream::iter(chunks(8, 125));
        run_transfer(body, &dest, Some(1000), tx).await;

        assert!(!dest.exists(), "partial file must be removed on disconnect");
    }

    #[test]
    fn test_single_flight_guard_excludes_second_claim() {
        let set = Arc::new(Mutex::new(HashSet::new()));
        let path = Path::new("/tmp/model.gguf");

        let first = FlightGuard::begin(set.clone(), path);
        assert!(first.is_some());
        assert!(FlightGuard::begin(set.clone(), path).is_none());

        drop(first);
        assert!(FlightGuard::begin(set, path).is_some());
    }
}

//! Upload-pack response cache.
//!
//! When serving from a local mirror, `git upload-pack` recompresses the
//! requested objects on every call, which is very CPU intensive.  The raw
//! response stream is therefore cached on disk, keyed by the fetch
//! fingerprint, and produced at most once per key no matter how many
//! identical fetches arrive concurrently.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, instrument, warn};

use crate::git::commands::{ensure_terminated, spawn_upload_pack, PROCESS_WAIT_GRACE};
use crate::lock::PathLocks;

use super::store::{
    ClientLossPolicy, EntryStore, Prepared, Producer, ProductionAbandoned, CHUNK_SIZE,
};

/// `git-upload-pack` exited non-zero, was killed, or overran its budget.
/// Surfaces as 500; the partial pack is discarded.
#[derive(Debug, thiserror::Error)]
#[error("upload-pack failed: {0}")]
pub struct UploadPackFailed(pub String);

// ---------------------------------------------------------------------------
// PackCache
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct PackCache {
    store: EntryStore,
    subprocess_timeout: Duration,
}

impl PackCache {
    pub fn new(root: PathBuf, locks: PathLocks, lock_timeout: Duration, subprocess_timeout: Duration) -> Self {
        Self {
            store: EntryStore::new(
                root,
                locks,
                lock_timeout,
                // A follower waits at most as long as the build it follows
                // may run.
                subprocess_timeout,
                ClientLossPolicy::AbandonIfSole,
            ),
            subprocess_timeout,
        }
    }

    pub fn store(&self) -> &EntryStore {
        &self.store
    }

    /// See [`EntryStore::prepare`].
    pub async fn prepare(&self, fingerprint: &str) -> Result<Prepared> {
        self.store.prepare(fingerprint).await
    }

    /// Build the pack for `producer`'s key by running
    /// `git-upload-pack --stateless-rpc` against `mirror_dir`, feeding it
    /// `request_body`, and teeing its stdout to the cache tempfile and the
    /// attached client.
    ///
    /// Commits the entry on success; on any failure the tempfile is
    /// removed and the subprocess is taken through the termination ladder.
    #[instrument(skip_all, fields(key = %producer.key(), mirror = %mirror_dir.display()))]
    pub async fn produce(
        &self,
        mut producer: Producer,
        mirror_dir: &Path,
        request_body: &[u8],
    ) -> Result<u64> {
        let mut child = spawn_upload_pack(mirror_dir)?;

        // Feed the request concurrently with reading the response so a
        // large negotiation cannot deadlock on full pipes.
        let mut stdin = child
            .stdin
            .take()
            .context("failed to open upload-pack stdin")?;
        let body = request_body.to_vec();
        let feed = tokio::spawn(async move {
            if let Err(e) = stdin.write_all(&body).await {
                // upload-pack exits early on e.g. "not our ref" and closes
                // its stdin; the error surfaces via status and stderr.
                warn!(error = %e, "short write to upload-pack stdin");
            }
        });

        let mut stderr = child
            .stderr
            .take()
            .context("failed to open upload-pack stderr")?;
        let capture_stderr = tokio::spawn(async move {
            let mut buf = Vec::with_capacity(1024);
            let _ = (&mut stderr).take(64 * 1024).read_to_end(&mut buf).await;
            buf
        });

        let mut stdout = child
            .stdout
            .take()
            .context("failed to open upload-pack stdout")?;

        let copy = async {
            let mut buf = vec![0u8; CHUNK_SIZE];
            loop {
                let n = stdout
                    .read(&mut buf)
                    .await
                    .context("failed to read upload-pack stdout")?;
                if n == 0 {
                    break;
                }
                producer.write(&buf[..n]).await?;
            }
            anyhow::Ok(producer)
        };

        let producer = match tokio::time::timeout(self.subprocess_timeout, copy).await {
            Ok(Ok(producer)) => producer,
            Ok(Err(e)) => {
                ensure_terminated(&mut child, "git-upload-pack", PROCESS_WAIT_GRACE).await;
                feed.abort();
                if e.downcast_ref::<ProductionAbandoned>().is_some() {
                    debug!("pack build abandoned, no readers left");
                } else {
                    warn!(error = %e, "pack build failed mid-stream");
                }
                return Err(e);
            }
            Err(_) => {
                ensure_terminated(&mut child, "git-upload-pack", PROCESS_WAIT_GRACE).await;
                feed.abort();
                return Err(UploadPackFailed(format!(
                    "timed out after {:?}",
                    self.subprocess_timeout
                ))
                .into());
            }
        };

        let _ = feed.await;
        let status = tokio::time::timeout(PROCESS_WAIT_GRACE, child.wait()).await;
        let stderr = capture_stderr.await.unwrap_or_default();
        let stderr = String::from_utf8_lossy(&stderr);

        match status {
            Ok(Ok(status)) if status.success() => {
                let written = producer.commit().await?;
                debug!(bytes = written, "pack produced and installed");
                Ok(written)
            }
            Ok(Ok(status)) => {
                producer.abort().await;
                Err(UploadPackFailed(format!(
                    "exited {status}: {}",
                    stderr.trim()
                ))
                .into())
            }
            Ok(Err(e)) => {
                producer.abort().await;
                Err(UploadPackFailed(format!("wait failed: {e}")).into())
            }
            Err(_) => {
                producer.abort().await;
                ensure_terminated(&mut child, "git-upload-pack", PROCESS_WAIT_GRACE).await;
                Err(UploadPackFailed("did not exit after closing stdout".into()).into())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::store::ByteSink;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    const FP: &str = "9c5f2a0000000000000000000000000000000000000000000000000000000000";

    fn cache(dir: &Path) -> PackCache {
        PackCache::new(
            dir.to_path_buf(),
            PathLocks::new(),
            Duration::from_secs(5),
            Duration::from_secs(30),
        )
    }

    async fn drain(mut rx: mpsc::Receiver<std::io::Result<Bytes>>) -> std::io::Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = rx.recv().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }

    /// Serve one request end to end with a scripted producer body, the way
    /// the HTTP handler drives the cache.
    async fn serve_scripted(
        cache: &PackCache,
        produced: Arc<AtomicUsize>,
        payload: &'static [u8],
        sink: ByteSink,
    ) -> Result<()> {
        match cache.prepare(FP).await? {
            Prepared::Ready(file) => {
                cache.store().stream_ready(FP, file, sink).await?;
            }
            Prepared::Follow => {
                cache.store().follow(FP, sink).await?;
            }
            Prepared::Produce(mut producer) => {
                produced.fetch_add(1, Ordering::SeqCst);
                producer.attach_sink(sink);
                // Chunked writes with small pauses, like a real pack build.
                for chunk in payload.chunks(4) {
                    producer.write(chunk).await?;
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                producer.commit().await?;
            }
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_identical_requests_build_once() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        let produced = Arc::new(AtomicUsize::new(0));
        let payload: &[u8] = b"0008\x01PACKdata0000";

        let mut clients = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let produced = Arc::clone(&produced);
            let (tx, rx) = mpsc::channel(64);
            clients.push((
                tokio::spawn(async move { serve_scripted(&cache, produced, payload, tx).await }),
                rx,
            ));
        }

        for (task, rx) in clients {
            task.await.unwrap().unwrap();
            assert_eq!(drain(rx).await.unwrap(), payload);
        }
        // Single-flight: exactly one build no matter how many clients raced.
        assert_eq!(produced.load(Ordering::SeqCst), 1);
        assert_eq!(
            std::fs::read(cache.store().entry_path(FP)).unwrap(),
            payload
        );
    }

    #[tokio::test]
    async fn warm_request_streams_identical_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        let produced = Arc::new(AtomicUsize::new(0));
        let payload: &[u8] = b"0008\x01PACKwarmbytes0000";

        let (tx, rx) = mpsc::channel(64);
        serve_scripted(&cache, Arc::clone(&produced), payload, tx)
            .await
            .unwrap();
        assert_eq!(drain(rx).await.unwrap(), payload);

        let (tx, rx) = mpsc::channel(64);
        serve_scripted(&cache, Arc::clone(&produced), payload, tx)
            .await
            .unwrap();
        assert_eq!(drain(rx).await.unwrap(), payload);
        assert_eq!(produced.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn warm_request_touches_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        let produced = Arc::new(AtomicUsize::new(0));

        let (tx, rx) = mpsc::channel(64);
        serve_scripted(&cache, Arc::clone(&produced), b"payload", tx)
            .await
            .unwrap();
        drain(rx).await.unwrap();

        let entry = cache.store().entry_path(FP);
        let past = std::time::SystemTime::now() - Duration::from_secs(7200);
        crate::cache::store::set_mtime(&entry, past);
        let before = std::fs::metadata(&entry).unwrap().modified().unwrap();

        let (tx, rx) = mpsc::channel(64);
        serve_scripted(&cache, Arc::clone(&produced), b"payload", tx)
            .await
            .unwrap();
        drain(rx).await.unwrap();
        let after = std::fs::metadata(&entry).unwrap().modified().unwrap();
        assert!(after > before, "hit must refresh the LRU clock");
    }

    #[tokio::test]
    async fn failed_build_leaves_no_entry_and_aborts_followers() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());

        let Prepared::Produce(mut producer) = cache.prepare(FP).await.unwrap() else {
            panic!("expected produce");
        };
        producer.write(b"partial-").await.unwrap();

        // A follower joins mid-build.
        let follower = {
            let cache = cache.clone();
            let (tx, rx) = mpsc::channel(64);
            (
                tokio::spawn(async move { cache.store().follow(FP, tx).await }),
                rx,
            )
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        producer.abort().await;

        let (task, rx) = follower;
        let err = task.await.unwrap().unwrap_err();
        assert!(err
            .downcast_ref::<crate::cache::follow::BuildAborted>()
            .is_some());
        // Partial bytes were delivered, then the stream died.
        assert_eq!(drain(rx).await.unwrap(), b"partial-");

        assert!(!cache.store().entry_path(FP).exists());
        assert!(!cache.store().tmp_path(FP).exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn produce_runs_real_subprocess_failure_path() {
        // Point upload-pack at a directory that is not a repository; it
        // must exit non-zero and the cache must stay empty.
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        let not_a_repo = dir.path().join("not-a-repo");
        std::fs::create_dir(&not_a_repo).unwrap();

        let Prepared::Produce(producer) = cache.prepare(FP).await.unwrap() else {
            panic!("expected produce");
        };
        cache
            .produce(producer, &not_a_repo, b"0000")
            .await
            .unwrap_err();
        assert!(!cache.store().entry_path(FP).exists());
        assert!(!cache.store().tmp_path(FP).exists());
    }
}

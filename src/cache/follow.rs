//! Fanout follower: replay a cache entry that is still being produced.
//!
//! A follower attaches to the producer's tempfile at offset 0 and tails it,
//! sleeping briefly at the moving end until new bytes arrive.  The build's
//! fate is read from the filesystem, which makes following work across
//! worker processes:
//!
//! - the final entry appears (atomic rename, same inode as the tempfile) --
//!   drain the remaining bytes and finish;
//! - the tempfile vanishes without a rename -- the producer failed; the
//!   follower's stream terminates with an error after the partial bytes it
//!   already delivered.

use std::io;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, trace};

use super::store::{ByteSink, CHUNK_SIZE};

/// Sleep between polls at the tail of the growing file.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// The producer this follower was attached to died before finishing.
#[derive(Debug, thiserror::Error)]
#[error("build aborted after {delivered} bytes")]
pub struct BuildAborted {
    pub delivered: u64,
}

/// Stream the entry being produced at `tmp_path` into `sink` from offset 0
/// until the build completes (entry renamed to `final_path`) or dies.
///
/// Returns the byte count delivered.  A closed sink (client disconnect) is
/// not an error; the follower just detaches.
pub async fn follow(
    tmp_path: &Path,
    final_path: &Path,
    sink: ByteSink,
    timeout: Duration,
) -> Result<u64> {
    let deadline = tokio::time::Instant::now() + timeout;

    // The tempfile may be renamed between the caller's check and our open;
    // the final file is the same inode, so either works.
    let mut file = match tokio::fs::File::open(tmp_path).await {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => tokio::fs::File::open(final_path)
            .await
            .context("build vanished before following started")?,
        Err(e) => return Err(e).context("failed to open tempfile for following"),
    };

    let mut delivered: u64 = 0;
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file
            .read(&mut buf)
            .await
            .context("failed to read followed tempfile")?;
        if n > 0 {
            delivered += n as u64;
            if sink.send(Ok(Bytes::copy_from_slice(&buf[..n]))).await.is_err() {
                debug!(delivered, "follower client disconnected");
                return Ok(delivered);
            }
            continue;
        }

        // At the current end of file: completed, aborted, or still growing?
        match tokio::fs::metadata(final_path).await {
            Ok(meta) if delivered >= meta.len() => {
                trace!(delivered, "followed build complete");
                return Ok(delivered);
            }
            Ok(meta) => {
                // The entry is ready but longer than what our fd has seen;
                // we must have attached to a tempfile from a dead producer
                // whose key was rebuilt.  Switch to the real entry.
                debug!(
                    delivered,
                    total = meta.len(),
                    "reattaching follower to installed entry"
                );
                let mut real = tokio::fs::File::open(final_path)
                    .await
                    .context("failed to reopen installed entry")?;
                real.seek(io::SeekFrom::Start(delivered))
                    .await
                    .context("failed to seek installed entry")?;
                file = real;
                continue;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).context("failed to stat final entry"),
        }

        if !tokio::fs::try_exists(tmp_path).await.unwrap_or(false) {
            // No tempfile and no final entry: the producer cleaned up after
            // a failure.  Partial bytes are already out; terminate hard so
            // the client retries instead of trusting a truncated stream.
            bail!(BuildAborted { delivered });
        }

        if tokio::time::Instant::now() >= deadline {
            bail!("timed out following build after {delivered} bytes");
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! LFS blob cache and batch-response rewriting.
//!
//! Two surfaces:
//!
//! 1. **Batch rewrite** -- the upstream's `objects/batch` JSON response is
//!    rewritten so every action `href` under the upstream base points back
//!    at this instance.  Clients then fetch blobs from us.
//! 2. **Blob cache** -- `<root>/<oid[0:2]>/<oid>` entries, downloaded from
//!    the upstream once, verified against the oid (the content's SHA-256)
//!    and the advertised length before installation.  Concurrent requests
//!    for the same oid coalesce exactly like pack builds.
//!
//! A ready entry is trusted on read; verification happens at install time
//! only.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use crate::lock::PathLocks;

use super::store::{ClientLossPolicy, EntryStore, Prepared, Producer};

/// Total budget for one upstream blob download.
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(600);

/// Downloaded LFS content did not match its advertised oid or size.
/// Surfaces as 502; the tempfile is discarded.
#[derive(Debug, thiserror::Error)]
pub enum ChecksumError {
    #[error("LFS content hash mismatch: expected {expected}, got {actual}")]
    Hash { expected: String, actual: String },
    #[error("LFS content length mismatch: expected {expected}, got {actual}")]
    Length { expected: u64, actual: u64 },
}

// ---------------------------------------------------------------------------
// Batch JSON model
// ---------------------------------------------------------------------------
//
// Unknown fields ride along through `flatten`ed maps so the rewrite only
// ever changes `href` values.

#[derive(Debug, Serialize, Deserialize)]
struct BatchResponse {
    #[serde(default)]
    objects: Vec<BatchObject>,
    #[serde(flatten)]
    rest: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct BatchObject {
    oid: String,
    size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    actions: Option<BTreeMap<String, BatchAction>>,
    #[serde(flatten)]
    rest: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct BatchAction {
    href: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    header: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    expires_at: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    expires_in: Option<serde_json::Value>,
    #[serde(flatten)]
    rest: BTreeMap<String, serde_json::Value>,
}

// ---------------------------------------------------------------------------
// LfsCache
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct LfsCache {
    store: EntryStore,
    upstream_base: String,
}

impl LfsCache {
    pub fn new(
        root: PathBuf,
        locks: PathLocks,
        lock_timeout: Duration,
        download_timeout: Duration,
        upstream_base: String,
    ) -> Self {
        Self {
            store: EntryStore::new(
                root,
                locks,
                lock_timeout,
                download_timeout,
                // Finish interrupted downloads: git-lfs clients give up
                // after 30s and retry; the retry should hit the cache.
                ClientLossPolicy::Finish,
            ),
            upstream_base,
        }
    }

    pub fn store(&self) -> &EntryStore {
        &self.store
    }

    /// See [`EntryStore::prepare`].
    pub async fn prepare(&self, oid: &str) -> Result<Prepared> {
        self.store.prepare(oid).await
    }

    /// Rewrite a batch response so action hrefs point at `local_base`
    /// instead of the upstream.  `oid`, `size`, `header` and expiry fields
    /// pass through untouched, as does anything this proxy does not model.
    #[instrument(skip_all, fields(bytes = body.len()))]
    pub fn rewrite_batch(&self, body: &[u8], local_base: &str) -> Result<Vec<u8>> {
        let mut batch: BatchResponse =
            serde_json::from_slice(body).context("failed to parse LFS batch response")?;

        let mut rewritten = 0usize;
        for object in &mut batch.objects {
            let Some(actions) = object.actions.as_mut() else {
                continue;
            };
            for action in actions.values_mut() {
                if let Some(rest) = action.href.strip_prefix(&self.upstream_base) {
                    action.href = format!("{}{}", local_base, rest.trim_start_matches('/'));
                    rewritten += 1;
                }
            }
        }
        debug!(objects = batch.objects.len(), rewritten, "batch rewritten");

        serde_json::to_vec(&batch).context("failed to serialize LFS batch response")
    }

    /// Stream `response` into the cache under `producer`, verifying the
    /// content hash against `oid` (and the length against Content-Length
    /// when the upstream sent one).  Installs on success.
    #[instrument(skip_all, fields(oid = %producer.key()))]
    pub async fn download(
        &self,
        mut producer: Producer,
        mut response: reqwest::Response,
    ) -> Result<u64> {
        let expected_len = response.content_length();
        let mut hasher = Sha256::new();

        loop {
            let chunk = match response.chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(e) => {
                    producer.abort().await;
                    return Err(e).context("upstream LFS download failed mid-stream");
                }
            };
            hasher.update(&chunk);
            if let Err(e) = producer.write(&chunk).await {
                producer.abort().await;
                return Err(e);
            }
        }

        let actual = hex::encode(hasher.finalize());
        if actual != producer.key() {
            let err = ChecksumError::Hash {
                expected: producer.key().to_string(),
                actual,
            };
            warn!(%err, "discarding corrupt LFS download");
            producer.abort().await;
            return Err(err.into());
        }
        if let Some(expected) = expected_len {
            if producer.written() != expected {
                let err = ChecksumError::Length {
                    expected,
                    actual: producer.written(),
                };
                warn!(%err, "discarding short LFS download");
                producer.abort().await;
                return Err(err.into());
            }
        }

        let written = producer.commit().await?;
        info!(bytes = written, "LFS object installed");
        Ok(written)
    }
}

/// An LFS oid is the lowercase hex SHA-256 of the blob.
pub fn is_valid_oid(oid: &str) -> bool {
    oid.len() == 64 && oid.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const UPSTREAM: &str = "https://git.example.com/";
    const LOCAL: &str = "https://cdn.example.com/";

    fn cache(dir: &std::path::Path) -> LfsCache {
        LfsCache::new(
            dir.to_path_buf(),
            PathLocks::new(),
            Duration::from_secs(1),
            Duration::from_secs(5),
            UPSTREAM.to_string(),
        )
    }

    fn sample_batch() -> serde_json::Value {
        serde_json::json!({
            "transfer": "basic",
            "objects": [
                {
                    "oid": "1111111111111111111111111111111111111111111111111111111111111111",
                    "size": 123,
                    "authenticated": true,
                    "actions": {
                        "download": {
                            "href": "https://git.example.com/group/project.git/gitlab-lfs/objects/1111111111111111111111111111111111111111111111111111111111111111",
                            "header": {"Authorization": "Basic abc"},
                            "expires_at": "2030-01-01T00:00:00Z"
                        }
                    }
                },
                {
                    "oid": "2222222222222222222222222222222222222222222222222222222222222222",
                    "size": 456,
                    "actions": {
                        "download": {
                            "href": "https://objects.example.net/external/2222"
                        }
                    }
                }
            ]
        })
    }

    #[test]
    fn rewrite_points_upstream_hrefs_at_local_base() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        let body = serde_json::to_vec(&sample_batch()).unwrap();

        let rewritten = cache.rewrite_batch(&body, LOCAL).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&rewritten).unwrap();

        let first = &json["objects"][0]["actions"]["download"];
        assert_eq!(
            first["href"],
            "https://cdn.example.com/group/project.git/gitlab-lfs/objects/1111111111111111111111111111111111111111111111111111111111111111"
        );
        // Foreign hosts are left alone.
        let second = &json["objects"][1]["actions"]["download"];
        assert_eq!(second["href"], "https://objects.example.net/external/2222");
    }

    #[test]
    fn rewrite_preserves_everything_but_href() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        let body = serde_json::to_vec(&sample_batch()).unwrap();

        let rewritten = cache.rewrite_batch(&body, LOCAL).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&rewritten).unwrap();

        assert_eq!(json["transfer"], "basic");
        assert_eq!(
            json["objects"][0]["oid"],
            "1111111111111111111111111111111111111111111111111111111111111111"
        );
        assert_eq!(json["objects"][0]["size"], 123);
        assert_eq!(json["objects"][0]["authenticated"], true);
        assert_eq!(
            json["objects"][0]["actions"]["download"]["header"]["Authorization"],
            "Basic abc"
        );
        assert_eq!(
            json["objects"][0]["actions"]["download"]["expires_at"],
            "2030-01-01T00:00:00Z"
        );
    }

    #[test]
    fn rewrite_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        let body = serde_json::to_vec(&sample_batch()).unwrap();

        let once = cache.rewrite_batch(&body, LOCAL).unwrap();
        let twice = cache.rewrite_batch(&once, LOCAL).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn rewrite_handles_objects_without_actions() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        let body = serde_json::to_vec(&serde_json::json!({
            "objects": [{"oid": "aa", "size": 1, "error": {"code": 404, "message": "not found"}}]
        }))
        .unwrap();

        let rewritten = cache.rewrite_batch(&body, LOCAL).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&rewritten).unwrap();
        assert_eq!(json["objects"][0]["error"]["code"], 404);
    }

    #[test]
    fn oid_validation() {
        assert!(is_valid_oid(
            "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef"
        ));
        assert!(!is_valid_oid("short"));
        assert!(!is_valid_oid(
            "0123456789ABCDEF0123456789abcdef0123456789abcdef0123456789abcdef"
        ));
        assert!(!is_valid_oid(
            "../3456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef"
        ));
    }
}

//! Environment-driven configuration.
//!
//! Every option is an environment variable with a CLI flag twin; the
//! front proxy deployment sets the environment, the flags exist for local
//! runs.  Startup fails (non-zero exit) on invalid configuration.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Parser, Debug, Clone)]
#[command(name = "gitcdn", about = "Caching, coalescing Git reverse proxy")]
pub struct Config {
    /// Base URL of the upstream Git server (e.g. `https://gitlab.example.com/`).
    #[arg(long, env = "GITSERVER_UPSTREAM")]
    pub upstream: String,

    /// Root directory for repository mirrors and cache trees.
    #[arg(long, env = "WORKING_DIRECTORY", default_value = "/tmp/workdir")]
    pub working_directory: PathBuf,

    /// Socket address for the HTTP listener.
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:8000")]
    pub listen_addr: String,

    /// Upstream connection pool size.
    #[arg(long, env = "MAX_CONNECTIONS", default_value_t = 10)]
    pub max_connections: usize,

    /// Pack cache size bound in GiB.
    #[arg(long, env = "PACK_CACHE_SIZE_GB", default_value_t = 20)]
    pub pack_cache_size_gb: u64,

    /// Maximum age of a pack cache entry in days.
    #[arg(long, env = "PACK_CACHE_MAX_AGE_DAYS", default_value_t = 14)]
    pub pack_cache_max_age_days: u64,

    /// LFS cache size bound in GiB.
    #[arg(long, env = "LFS_CACHE_SIZE_GB", default_value_t = 20)]
    pub lfs_cache_size_gb: u64,

    /// Log filter directive (tracing `EnvFilter` syntax).
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Total budget for one `git-upload-pack` run, in seconds.
    #[arg(long, env = "UPLOAD_PACK_TIMEOUT_SECS", default_value_t = 3600)]
    pub upload_pack_timeout_secs: u64,

    /// Budget for acquiring a cache entry lock, in seconds.
    #[arg(long, env = "LOCK_TIMEOUT_SECS", default_value_t = 300)]
    pub lock_timeout_secs: u64,

    /// Upper bound on an upload-pack request body, in bytes.
    #[arg(long, env = "MAX_BODY_BYTES", default_value_t = 16 * 1024 * 1024)]
    pub max_body_bytes: usize,
}

impl Config {
    /// Upstream base URL, normalized to end with a single `/`.
    pub fn upstream_base(&self) -> String {
        format!("{}/", self.upstream.trim_end_matches('/'))
    }

    /// `<working_directory>/git` -- bare mirror clones.
    pub fn git_root(&self) -> PathBuf {
        self.working_directory.join("git")
    }

    /// `<working_directory>/pack_cache` -- cached upload-pack responses.
    pub fn pack_cache_root(&self) -> PathBuf {
        self.working_directory.join("pack_cache")
    }

    /// `<working_directory>/lfs` -- cached LFS blobs.
    pub fn lfs_root(&self) -> PathBuf {
        self.working_directory.join("lfs")
    }

    /// Pack cache bound in bytes.  A 512 MiB margin is reserved so a sweep
    /// triggered at the bound does not overshoot the disk budget.
    pub fn pack_cache_max_bytes(&self) -> u64 {
        (self.pack_cache_size_gb * 1024).saturating_sub(512) * 1024 * 1024
    }

    /// LFS cache bound in bytes, with the same margin as the pack cache.
    pub fn lfs_cache_max_bytes(&self) -> u64 {
        (self.lfs_cache_size_gb * 1024).saturating_sub(512) * 1024 * 1024
    }

    pub fn pack_cache_max_age(&self) -> Duration {
        Duration::from_secs(self.pack_cache_max_age_days * 24 * 3600)
    }

    pub fn upload_pack_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_pack_timeout_secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    /// Sanity checks that cannot be expressed through clap alone.
    pub fn validate(&self) -> Result<()> {
        let url = url::Url::parse(&self.upstream)
            .with_context(|| format!("invalid GITSERVER_UPSTREAM: {}", self.upstream))?;
        anyhow::ensure!(
            matches!(url.scheme(), "http" | "https"),
            "GITSERVER_UPSTREAM must be http(s), got {}",
            url.scheme(),
        );
        anyhow::ensure!(
            self.pack_cache_size_gb > 0,
            "PACK_CACHE_SIZE_GB must be non-zero"
        );
        anyhow::ensure!(
            self.lfs_cache_size_gb > 0,
            "LFS_CACHE_SIZE_GB must be non-zero"
        );
        anyhow::ensure!(
            self.pack_cache_max_age_days > 0,
            "PACK_CACHE_MAX_AGE_DAYS must be non-zero"
        );
        anyhow::ensure!(self.max_connections > 0, "MAX_CONNECTIONS must be non-zero");
        self.listen_addr
            .parse::<std::net::SocketAddr>()
            .with_context(|| format!("invalid LISTEN_ADDR: {}", self.listen_addr))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

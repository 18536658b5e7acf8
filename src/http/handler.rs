//! Request routing and orchestration.
//!
//! Repo paths nest arbitrarily (`/group/sub/project.git/...`), so routing
//! is done by suffix classification on a catch-all route rather than with
//! fixed path segments:
//!
//! - `GET  <repo>/info/refs`                -- 401 challenge without creds, else proxy
//! - `POST <repo>/git-upload-pack`          -- intercept `fetch`, proxy the rest
//! - `POST <repo>/git-receive-pack`         -- proxy verbatim, never cached
//! - `POST <repo>/info/lfs/objects/batch`   -- proxy, rewrite download hrefs
//! - `GET  <repo>/gitlab-lfs/objects/<oid>` -- serve from the LFS cache
//! - everything else                        -- proxy verbatim
//! - `GET /`                                -- liveness; `GET /metrics` -- Prometheus

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context as _;
use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, instrument, warn};

use crate::cache::lfs::{is_valid_oid, ChecksumError};
use crate::cache::pack::UploadPackFailed;
use crate::cache::store::{ByteSink, ProductionAbandoned};
use crate::cache::Prepared;
use crate::git::commands::GitError;
use crate::lock::LockTimeout;
use crate::metrics::{CacheLabels, CacheStatus};
use crate::protocol::{self, Command, ProtocolError};
use crate::AppState;

use super::proxy;

const UPLOAD_PACK_RESULT: &str = "application/x-git-upload-pack-result";

/// Buffered chunks per client stream; producers briefly stall when a slow
/// client falls this far behind.
const SINK_DEPTH: usize = 16;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(handle_liveness))
        .route("/metrics", get(handle_metrics))
        .fallback(route_request)
        .with_state(state)
}

async fn handle_liveness() -> &'static str {
    "live"
}

/// `GET /metrics` -- OpenMetrics text exposition.
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let buf = state
        .metrics
        .encode()
        .map_err(|e| AppError::Internal(anyhow::anyhow!("metrics encoding failed: {e}")))?;
    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buf,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Path classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    InfoRefs,
    UploadPack,
    ReceivePack,
    LfsBatch,
    LfsObject { oid: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitRoute {
    /// URL path component up to and including `.git`, no leading slash.
    pub repo: String,
    pub endpoint: Endpoint,
}

/// Map a URL path onto a Git smart-HTTP endpoint.
///
/// Returns `Ok(None)` for paths that are not Git traffic (proxied
/// verbatim).  Traversal attempts are rejected outright.
pub fn classify_path(path: &str) -> Result<Option<GitRoute>, AppError> {
    let path = path.trim_matches('/');
    if path.contains('\0') || path.split('/').any(|seg| seg == "..") {
        return Err(AppError::BadPath(path.to_string()));
    }

    if let Some((repo, oid)) = split_lfs_object_path(path) {
        return Ok(Some(GitRoute {
            repo,
            endpoint: Endpoint::LfsObject { oid },
        }));
    }

    const SUFFIXES: [(&str, Endpoint); 4] = [
        ("/info/refs", Endpoint::InfoRefs),
        ("/git-upload-pack", Endpoint::UploadPack),
        ("/git-receive-pack", Endpoint::ReceivePack),
        ("/info/lfs/objects/batch", Endpoint::LfsBatch),
    ];
    for (suffix, endpoint) in SUFFIXES {
        let Some(prefix) = path.strip_suffix(suffix) else {
            continue;
        };
        if prefix.is_empty() {
            return Ok(None);
        }
        return Ok(Some(GitRoute {
            repo: ensure_git_suffix(prefix),
            endpoint,
        }));
    }
    Ok(None)
}

/// `<repo>.git/gitlab-lfs/objects/<64-hex-oid>`.
fn split_lfs_object_path(path: &str) -> Option<(String, String)> {
    let marker = ".git/gitlab-lfs/objects/";
    let idx = path.find(marker)?;
    let repo = &path[..idx + 4];
    let oid = &path[idx + marker.len()..];
    if !is_valid_oid(oid) {
        return None;
    }
    Some((repo.to_string(), oid.to_string()))
}

/// Git clients sometimes omit the `.git` suffix; the upstream exposes both
/// forms for the same repository, the mirror should too.
fn ensure_git_suffix(prefix: &str) -> String {
    if prefix.ends_with(".git") {
        prefix.to_string()
    } else {
        format!("{prefix}.git")
    }
}

// ---------------------------------------------------------------------------
// Top-level routing
// ---------------------------------------------------------------------------

async fn route_request(State(state): State<Arc<AppState>>, req: Request) -> Response {
    let (parts, body) = req.into_parts();
    let path = parts.uri.path().to_string();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| path.clone());

    // Browsers (and anything that is not a Git or LFS client) are sent to
    // the upstream's own UI.
    if let Some(redirect) = redirect_browsers(&parts.headers, &state.config.upstream_base(), &path)
    {
        return redirect;
    }

    let route = match classify_path(&path) {
        Ok(route) => route,
        Err(e) => return e.into_response(),
    };

    debug!(method = %parts.method, %path, ?route, "routing request");

    let result = match route {
        Some(GitRoute { repo, endpoint }) => match endpoint {
            Endpoint::UploadPack => {
                handle_upload_pack(&state, &repo, &parts.headers, body, &path_and_query).await
            }
            Endpoint::LfsBatch => {
                handle_lfs_batch(&state, &parts.headers, body, &path_and_query).await
            }
            Endpoint::LfsObject { oid } => {
                handle_lfs_object(&state, &repo, &oid, &parts.headers).await
            }
            // info/refs and receive-pack flow through untouched; the
            // challenge below is the only intervention.
            Endpoint::InfoRefs | Endpoint::ReceivePack => {
                match require_auth(&parts.headers) {
                    Ok(_) => {
                        state.metrics.proxied_requests.inc();
                        Ok(proxy::forward(
                            &state.http_client,
                            &state.config.upstream_base(),
                            parts.method.clone(),
                            &path_and_query,
                            &parts.headers,
                            reqwest::Body::wrap_stream(body.into_data_stream()),
                        )
                        .await)
                    }
                    Err(e) => Err(e),
                }
            }
        },
        None => {
            state.metrics.proxied_requests.inc();
            Ok(proxy::forward(
                &state.http_client,
                &state.config.upstream_base(),
                parts.method.clone(),
                &path_and_query,
                &parts.headers,
                reqwest::Body::wrap_stream(body.into_data_stream()),
            )
            .await)
        }
    };

    result.unwrap_or_else(|e| {
        note_error(&state, &e);
        e.into_response()
    })
}

/// Non-Git user agents get a permanent redirect to the upstream UI.
fn redirect_browsers(headers: &HeaderMap, upstream_base: &str, path: &str) -> Option<Response> {
    let ua = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("git")
        .to_ascii_lowercase();
    // "git" also matches JGit and git-lfs agents.
    if ua.contains("git") {
        return None;
    }
    let location = format!("{}{}", upstream_base, path.trim_start_matches('/'));
    Some(
        (
            StatusCode::PERMANENT_REDIRECT,
            [(header::LOCATION, location)],
            "",
        )
            .into_response(),
    )
}

fn require_auth(headers: &HeaderMap) -> Result<String, AppError> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .ok_or_else(|| AppError::Unauthorized("missing Authorization header".into()))
}

/// This instance's external base URL, reconstructed from the front proxy's
/// headers, for LFS href rewriting.
fn request_base(headers: &HeaderMap) -> Option<String> {
    let host = headers.get(header::HOST)?.to_str().ok()?;
    let proto = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("https");
    Some(format!("{proto}://{host}/"))
}

/// Terminate a client stream with an error so the client sees a failed
/// transfer instead of a clean-looking truncated one.
async fn abort_stream(sink: &ByteSink, reason: String) {
    let _ = sink.send(Err(std::io::Error::other(reason))).await;
}

// ---------------------------------------------------------------------------
// upload-pack
// ---------------------------------------------------------------------------

#[instrument(skip_all, fields(%repo))]
async fn handle_upload_pack(
    state: &Arc<AppState>,
    repo: &str,
    headers: &HeaderMap,
    body: Body,
    path_and_query: &str,
) -> Result<Response, AppError> {
    let auth = require_auth(headers)?;

    let body = axum::body::to_bytes(body, state.config.max_body_bytes)
        .await
        .map_err(|_| AppError::PayloadTooLarge)?;

    let fetch = match protocol::classify(&body) {
        Ok(Command::Fetch(fetch)) if !fetch.wants.is_empty() => fetch,
        Ok(command) => {
            if let Command::Fetch(_) = command {
                warn!("fetch without wants, proxying");
            } else {
                debug!(?command, "non-fetch upload-pack command, proxying");
            }
            state.metrics.proxied_requests.inc();
            return Ok(proxy::forward(
                &state.http_client,
                &state.config.upstream_base(),
                axum::http::Method::POST,
                path_and_query,
                headers,
                reqwest::Body::from(body),
            )
            .await);
        }
        Err(e) => return Err(e.into()),
    };

    let fingerprint = fetch.fingerprint();
    info!(hash = %&fingerprint[..8], summary = %fetch.summary(), "upload-pack fetch");

    // Stateless credential and existence check: replay an info/refs probe
    // upstream before serving anything from local state.
    upstream_preflight(state, repo, &auth).await?;

    let prepared = state.pack_cache.prepare(&fingerprint).await.map_err(AppError::from)?;
    let (tx, rx) = mpsc::channel(SINK_DEPTH);

    match prepared {
        Prepared::Ready(file) => {
            state.metrics.pack_requests.get_or_create(&CacheLabels { status: CacheStatus::Hit }).inc();
            debug!(hash = %&fingerprint[..8], "pack cache hit");
            let state = Arc::clone(state);
            let fingerprint = fingerprint.clone();
            tokio::spawn(async move {
                if let Err(e) = state
                    .pack_cache
                    .store()
                    .stream_ready(&fingerprint, file, tx.clone())
                    .await
                {
                    warn!(error = %e, "pack cache read failed");
                    abort_stream(&tx, "pack cache read failed".into()).await;
                }
            });
        }
        Prepared::Follow => {
            state.metrics.pack_requests.get_or_create(&CacheLabels { status: CacheStatus::Coalesced }).inc();
            debug!(hash = %&fingerprint[..8], "joining pack build in progress");
            let state = Arc::clone(state);
            let fingerprint = fingerprint.clone();
            tokio::spawn(async move {
                if let Err(e) = state.pack_cache.store().follow(&fingerprint, tx.clone()).await {
                    warn!(error = %e, "followed pack build failed");
                    abort_stream(&tx, "pack build aborted".into()).await;
                }
            });
        }
        Prepared::Produce(mut producer) => {
            state.metrics.pack_requests.get_or_create(&CacheLabels { status: CacheStatus::Miss }).inc();

            // The mirror refresh happens before the response status goes
            // out, so upstream/auth failures still map to proper codes.
            // It runs as its own task: a refresh in flight benefits the
            // next caller and must survive this client disconnecting.
            let refresh = tokio::spawn({
                let mirror = state.mirror.clone();
                let repo = repo.to_string();
                let auth = auth.clone();
                async move { mirror.ensure_fresh(&repo, Some(&auth)).await }
            });
            let mirror_dir = match refresh.await {
                Ok(Ok(dir)) => dir,
                Ok(Err(e)) => {
                    producer.abort().await;
                    return Err(e.into());
                }
                Err(e) => {
                    producer.abort().await;
                    return Err(AppError::Internal(anyhow::anyhow!(
                        "mirror refresh task failed: {e}"
                    )));
                }
            };

            producer.attach_sink(tx.clone());
            let state = Arc::clone(state);
            tokio::spawn(async move {
                let started = Instant::now();
                match state.pack_cache.produce(producer, &mirror_dir, &body).await {
                    Ok(bytes) => {
                        state
                            .metrics
                            .pack_build_duration_seconds
                            .observe(started.elapsed().as_secs_f64());
                        debug!(bytes, elapsed = ?started.elapsed(), "pack build complete");
                    }
                    Err(e) if e.downcast_ref::<ProductionAbandoned>().is_some() => {
                        debug!("pack build abandoned by disconnecting client");
                    }
                    Err(e) => {
                        warn!(error = %e, "pack build failed");
                        abort_stream(&tx, "pack build failed".into()).await;
                    }
                }
            });
        }
    }

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, UPLOAD_PACK_RESULT),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(ReceiverStream::new(rx)),
    )
        .into_response())
}

/// Replay `GET <repo>/info/refs?service=git-upload-pack` upstream with the
/// client's credentials.  Repo existence and authorization are re-checked
/// on every fetch because this proxy is stateless about both.
async fn upstream_preflight(state: &Arc<AppState>, repo: &str, auth: &str) -> Result<(), AppError> {
    let url = format!(
        "{}{}/info/refs?service=git-upload-pack",
        state.config.upstream_base(),
        repo,
    );
    let response = state
        .http_client
        .get(&url)
        .header(header::AUTHORIZATION, auth)
        .header("Git-Protocol", "version=2")
        .send()
        .await
        .map_err(|e| AppError::Upstream(format!("preflight failed: {e}")))?;

    let status = response.status();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(AppError::Unauthorized(format!(
            "upstream rejected credentials for {repo}"
        )));
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(AppError::UpstreamStatus(status, body));
    }
    // Drain so the pooled connection is reusable.
    let _ = response.bytes().await;
    Ok(())
}

// ---------------------------------------------------------------------------
// LFS
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
async fn handle_lfs_batch(
    state: &Arc<AppState>,
    headers: &HeaderMap,
    body: Body,
    path_and_query: &str,
) -> Result<Response, AppError> {
    require_auth(headers)?;

    let local_base = request_base(headers)
        .ok_or_else(|| AppError::BadPath("missing Host header".into()))?;

    let upstream_url = format!(
        "{}{}",
        state.config.upstream_base(),
        path_and_query.trim_start_matches('/')
    );
    let mut fwd_headers = proxy::filter_request_headers(headers);
    // The body gets parsed and rewritten, so it must arrive uncompressed.
    fwd_headers.remove(header::ACCEPT_ENCODING);

    let response = state
        .http_client
        .post(&upstream_url)
        .headers(fwd_headers)
        .body(reqwest::Body::wrap_stream(body.into_data_stream()))
        .send()
        .await
        .map_err(|e| AppError::Upstream(format!("LFS batch proxy failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        // Forward upstream errors verbatim.
        let body = response.bytes().await.unwrap_or_default();
        return Ok((StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY), body).into_response());
    }

    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/vnd.git-lfs+json")
        .to_string();
    let upstream_body = response
        .bytes()
        .await
        .context("failed to read LFS batch response")?;

    let rewritten = state.lfs_cache.rewrite_batch(&upstream_body, &local_base)?;
    debug!(
        upstream_bytes = upstream_body.len(),
        rewritten_bytes = rewritten.len(),
        "LFS batch rewritten"
    );

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, content_type)],
        rewritten,
    )
        .into_response())
}

#[instrument(skip_all, fields(%repo, %oid))]
async fn handle_lfs_object(
    state: &Arc<AppState>,
    repo: &str,
    oid: &str,
    headers: &HeaderMap,
) -> Result<Response, AppError> {
    // Presence-only, like every other Git route.  What this endpoint skips
    // is the upstream credential round-trip on hits, not the challenge;
    // misses still carry the forwarded Authorization to the upstream.
    require_auth(headers)?;

    let lfs_labels = |status: CacheStatus| CacheLabels { status };

    let prepared = state.lfs_cache.prepare(oid).await.map_err(AppError::from)?;
    let (tx, rx) = mpsc::channel(SINK_DEPTH);

    let content_length = match prepared {
        Prepared::Ready(file) => {
            state.metrics.lfs_requests.get_or_create(&lfs_labels(CacheStatus::Hit)).inc();
            let len = file
                .metadata()
                .await
                .context("failed to stat LFS entry")?
                .len();
            let state = Arc::clone(state);
            let oid = oid.to_string();
            tokio::spawn(async move {
                if let Err(e) = state.lfs_cache.store().stream_ready(&oid, file, tx.clone()).await {
                    warn!(error = %e, "LFS cache read failed");
                    abort_stream(&tx, "LFS cache read failed".into()).await;
                }
            });
            Some(len)
        }
        Prepared::Follow => {
            state.metrics.lfs_requests.get_or_create(&lfs_labels(CacheStatus::Coalesced)).inc();
            let state = Arc::clone(state);
            let oid = oid.to_string();
            tokio::spawn(async move {
                if let Err(e) = state.lfs_cache.store().follow(&oid, tx.clone()).await {
                    warn!(error = %e, "followed LFS download failed");
                    abort_stream(&tx, "LFS download aborted".into()).await;
                }
            });
            None
        }
        Prepared::Produce(mut producer) => {
            state.metrics.lfs_requests.get_or_create(&lfs_labels(CacheStatus::Miss)).inc();

            // The batch response pointed the client at us; the same path on
            // the upstream is where the blob actually lives.
            let upstream_url = format!(
                "{}{}/gitlab-lfs/objects/{}",
                state.config.upstream_base(),
                repo,
                oid,
            );
            let fwd_headers = proxy::filter_request_headers(headers);
            let response = match state
                .http_client
                .get(&upstream_url)
                .headers(fwd_headers)
                .timeout(crate::cache::lfs::DOWNLOAD_TIMEOUT)
                .send()
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    producer.abort().await;
                    return Err(AppError::Upstream(format!("LFS download failed: {e}")));
                }
            };

            let status = response.status();
            if !status.is_success() {
                producer.abort().await;
                let body = response.text().await.unwrap_or_default();
                return Err(AppError::UpstreamStatus(status, body));
            }

            let len = response.content_length();
            producer.attach_sink(tx.clone());
            let state = Arc::clone(state);
            tokio::spawn(async move {
                if let Err(e) = state.lfs_cache.download(producer, response).await {
                    warn!(error = %e, "LFS download failed");
                    abort_stream(&tx, "LFS download failed".into()).await;
                }
            });
            len
        }
    };

    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream");
    if let Some(len) = content_length {
        response = response.header(header::CONTENT_LENGTH, len);
    }
    response
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .context("failed to assemble LFS response")
        .map_err(AppError::Internal)
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Application-level error type that maps cleanly to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// Malformed Git protocol framing or command encoding.
    Protocol(String),
    /// Path traversal or an otherwise unusable request path.
    BadPath(String),
    /// Missing or upstream-rejected credentials.
    Unauthorized(String),
    /// Upload-pack request body over the configured bound.
    PayloadTooLarge,
    /// A cache entry lock could not be acquired in time.
    LockBusy,
    /// The upstream was unreachable or misbehaved.
    Upstream(String),
    /// The upstream answered with a definite error status; relay it.
    UpstreamStatus(StatusCode, String),
    /// Local `git` subprocess failure.
    Subprocess(String),
    /// Downloaded LFS content failed verification.
    Checksum(String),
    /// An unexpected internal error.
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Protocol(msg) => {
                // Carry a pkt-line ERR so Git clients print something
                // useful next to the 400.
                let body = protocol::pktline::encode_err_pkt(&format!("invalid request: {msg}"));
                (StatusCode::BAD_REQUEST, body).into_response()
            }
            AppError::BadPath(path) => {
                (StatusCode::BAD_REQUEST, format!("bad path: {path}")).into_response()
            }
            AppError::Unauthorized(msg) => (
                StatusCode::UNAUTHORIZED,
                [(header::WWW_AUTHENTICATE, "Basic realm=\"GitCDN\"")],
                msg,
            )
                .into_response(),
            AppError::PayloadTooLarge => {
                (StatusCode::PAYLOAD_TOO_LARGE, "request body too large").into_response()
            }
            AppError::LockBusy => (
                StatusCode::SERVICE_UNAVAILABLE,
                [(header::RETRY_AFTER, "5")],
                "cache entry busy, retry shortly",
            )
                .into_response(),
            AppError::Upstream(msg) => {
                warn!(error = %msg, "upstream error");
                (StatusCode::BAD_GATEWAY, msg).into_response()
            }
            AppError::UpstreamStatus(status, body) => (
                StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY),
                body,
            )
                .into_response(),
            AppError::Subprocess(msg) => {
                warn!(error = %msg, "subprocess error");
                (StatusCode::INTERNAL_SERVER_ERROR, msg).into_response()
            }
            AppError::Checksum(msg) => {
                warn!(error = %msg, "checksum error");
                (StatusCode::BAD_GATEWAY, msg).into_response()
            }
            AppError::Internal(err) => {
                warn!(error = %err, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("internal server error: {err:#}"),
                )
                    .into_response()
            }
        }
    }
}

impl From<ProtocolError> for AppError {
    fn from(err: ProtocolError) -> Self {
        AppError::Protocol(err.0)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        if err.downcast_ref::<LockTimeout>().is_some() {
            return AppError::LockBusy;
        }
        if let Some(protocol) = err.downcast_ref::<ProtocolError>() {
            return AppError::Protocol(protocol.0.clone());
        }
        if let Some(git) = err.downcast_ref::<GitError>() {
            return match git {
                GitError::AccessDenied(msg) => AppError::Unauthorized(msg.clone()),
                GitError::Failed { .. } => AppError::Upstream(git.to_string()),
            };
        }
        if let Some(subprocess) = err.downcast_ref::<UploadPackFailed>() {
            return AppError::Subprocess(subprocess.to_string());
        }
        if let Some(checksum) = err.downcast_ref::<ChecksumError>() {
            return AppError::Checksum(checksum.to_string());
        }
        AppError::Internal(err)
    }
}

/// Error-kind counters, incremented where responses are finalized.
fn note_error(state: &Arc<AppState>, err: &AppError) {
    let metrics = &state.metrics;
    match err {
        AppError::LockBusy => metrics.lock_timeouts.inc(),
        AppError::Protocol(_) => metrics.protocol_errors.inc(),
        AppError::Upstream(_) | AppError::UpstreamStatus(..) | AppError::Checksum(_) => {
            metrics.upstream_errors.inc()
        }
        _ => 0,
    };
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn route(path: &str) -> Option<GitRoute> {
        classify_path(path).unwrap()
    }

    #[test]
    fn classify_upload_pack() {
        let r = route("/group/sub/project.git/git-upload-pack").unwrap();
        assert_eq!(r.repo, "group/sub/project.git");
        assert_eq!(r.endpoint, Endpoint::UploadPack);
    }

    #[test]
    fn classify_receive_pack_is_distinct() {
        let r = route("/group/project.git/git-receive-pack").unwrap();
        assert_eq!(r.endpoint, Endpoint::ReceivePack);
    }

    #[test]
    fn classify_info_refs() {
        let r = route("/group/project.git/info/refs").unwrap();
        assert_eq!(r.repo, "group/project.git");
        assert_eq!(r.endpoint, Endpoint::InfoRefs);
    }

    #[test]
    fn classify_adds_missing_git_suffix() {
        let r = route("/group/project/info/refs").unwrap();
        assert_eq!(r.repo, "group/project.git");
    }

    #[test]
    fn classify_lfs_batch() {
        let r = route("/group/project.git/info/lfs/objects/batch").unwrap();
        assert_eq!(r.repo, "group/project.git");
        assert_eq!(r.endpoint, Endpoint::LfsBatch);
    }

    #[test]
    fn classify_lfs_object() {
        let oid = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";
        let r = route(&format!("/group/project.git/gitlab-lfs/objects/{oid}")).unwrap();
        assert_eq!(r.repo, "group/project.git");
        assert_eq!(
            r.endpoint,
            Endpoint::LfsObject {
                oid: oid.to_string()
            }
        );
    }

    #[test]
    fn classify_rejects_bad_oid() {
        assert!(route("/group/project.git/gitlab-lfs/objects/nothex").is_none());
        assert!(route("/group/project.git/gitlab-lfs/objects/0123").is_none());
    }

    #[test]
    fn classify_other_paths_proxy() {
        assert!(route("/").is_none());
        assert!(route("/group/project/-/blob/main/README.md").is_none());
        assert!(route("/info/refs").is_none());
    }

    #[test]
    fn classify_rejects_traversal() {
        assert!(classify_path("/group/../etc/passwd/info/refs").is_err());
        assert!(classify_path("/../project.git/git-upload-pack").is_err());
    }

    #[test]
    fn unauthorized_carries_the_challenge() {
        let response = AppError::Unauthorized("x".into()).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response
                .headers()
                .get(header::WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok()),
            Some("Basic realm=\"GitCDN\"")
        );
    }

    #[test]
    fn lock_busy_suggests_retry() {
        let response = AppError::LockBusy.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(response.headers().contains_key(header::RETRY_AFTER));
    }

    #[test]
    fn upstream_status_is_relayed() {
        let response =
            AppError::UpstreamStatus(StatusCode::NOT_FOUND, "missing".into()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn anyhow_mapping_picks_the_typed_kind() {
        let err: anyhow::Error = LockTimeout {
            path: "/tmp/x.lock".into(),
            waited: std::time::Duration::from_secs(5),
        }
        .into();
        assert!(matches!(AppError::from(err), AppError::LockBusy));

        let err: anyhow::Error = ProtocolError::new("bad frame").into();
        assert!(matches!(AppError::from(err), AppError::Protocol(_)));

        let err: anyhow::Error = GitError::AccessDenied("denied".into()).into();
        assert!(matches!(AppError::from(err), AppError::Unauthorized(_)));

        let err: anyhow::Error = UploadPackFailed("exit 128".into()).into();
        assert!(matches!(AppError::from(err), AppError::Subprocess(_)));

        let err: anyhow::Error = ChecksumError::Length {
            expected: 2,
            actual: 1,
        }
        .into();
        assert!(matches!(AppError::from(err), AppError::Checksum(_)));
    }

    #[test]
    fn browser_redirect_only_for_non_git_agents() {
        let upstream = "https://git.example.com/";
        let mut headers = HeaderMap::new();
        headers.insert(
            header::USER_AGENT,
            "Mozilla/5.0 (X11; Linux x86_64)".parse().unwrap(),
        );
        let redirect = redirect_browsers(&headers, upstream, "/group/project").unwrap();
        assert_eq!(redirect.status(), StatusCode::PERMANENT_REDIRECT);

        headers.insert(header::USER_AGENT, "git/2.43.0".parse().unwrap());
        assert!(redirect_browsers(&headers, upstream, "/group/project").is_none());

        headers.insert(header::USER_AGENT, "git-lfs/3.4.0".parse().unwrap());
        assert!(redirect_browsers(&headers, upstream, "/x").is_none());

        // No UA at all: assume a Git client.
        headers.remove(header::USER_AGENT);
        assert!(redirect_browsers(&headers, upstream, "/x").is_none());
    }

    #[test]
    fn request_base_prefers_forwarded_proto() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, "cdn.example.com".parse().unwrap());
        assert_eq!(
            request_base(&headers).as_deref(),
            Some("https://cdn.example.com/")
        );
        headers.insert("x-forwarded-proto", "http".parse().unwrap());
        assert_eq!(
            request_base(&headers).as_deref(),
            Some("http://cdn.example.com/")
        );
        headers.remove(header::HOST);
        assert!(request_base(&headers).is_none());
    }
}

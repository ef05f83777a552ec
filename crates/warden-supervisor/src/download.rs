//! Cancellable HTTP fetches with bounded redirects and atomic installs.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use reqwest::header::LOCATION;
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, SupervisorError};
use crate::paths::temp_path;
use crate::state::DownloadProgress;

/// Minimum spacing between progress callbacks.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Progress callback invoked while a download streams.
pub type ProgressFn<'a> = &'a (dyn Fn(DownloadProgress) + Send + Sync);

/// Options for a single artifact download.
#[derive(Debug, Clone, Default)]
pub struct DownloadOptions {
    /// Size to report when the server omits content-length.
    pub known_size: Option<u64>,
    /// Expected hex SHA-256 of the complete file.
    pub sha256: Option<String>,
    /// Maximum redirects followed before giving up.
    pub max_redirects: usize,
}

/// HTTP client owning at most one cancellable request at a time.
pub struct Downloader {
    client: reqwest::Client,
    active: Mutex<Option<(u64, CancellationToken)>>,
    /// Parent of every request token. Stays cancelled while closed.
    scope: Mutex<CancellationToken>,
    next_id: AtomicU64,
}

/// Clears the active slot when the request finishes.
struct ActiveRequest<'a> {
    owner: &'a Downloader,
    id: u64,
    token: CancellationToken,
}

impl Drop for ActiveRequest<'_> {
    fn drop(&mut self) {
        let mut active = self.owner.active.lock().unwrap_or_else(|e| e.into_inner());
        if matches!(active.as_ref(), Some((id, _)) if *id == self.id) {
            *active = None;
        }
    }
}

impl Downloader {
    /// Create an open downloader with no active request.
    pub fn new() -> Self {
        // Redirects are followed by hand so the bound and the cancel token
        // apply to every hop.
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(concat!("warden/", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("Invalid HTTP client configuration");

        Self {
            client,
            active: Mutex::new(None),
            scope: Mutex::new(CancellationToken::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Cancel the active request and every request started until
    /// [`reopen`](Self::reopen) is called.
    pub fn close(&self) {
        let scope = self.scope.lock().unwrap_or_else(|e| e.into_inner());
        if !scope.is_cancelled() {
            debug!("Closing downloader");
            scope.cancel();
        }
    }

    /// Accept requests again after [`close`](Self::close).
    pub fn reopen(&self) {
        let mut scope = self.scope.lock().unwrap_or_else(|e| e.into_inner());
        if scope.is_cancelled() {
            *scope = CancellationToken::new();
        }
    }

    /// Abort the active request, if any. Returns whether one was running.
    pub fn cancel(&self) -> bool {
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        match active.as_ref() {
            Some((_, token)) => {
                info!("Cancelling active download");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Whether a request is currently in flight.
    pub fn is_active(&self) -> bool {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    fn begin(&self) -> ActiveRequest<'_> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = self
            .scope
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .child_token();

        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((_, previous)) = active.replace((id, token.clone())) {
            warn!("Starting a request while another is active; cancelling the older one");
            previous.cancel();
        }

        ActiveRequest {
            owner: self,
            id,
            token,
        }
    }

    /// GET `url` and decode the JSON body.
    pub async fn fetch_json<T: DeserializeOwned>(&self, url: &str, max_redirects: usize) -> Result<T> {
        let request = self.begin();
        let response = self.follow(url, max_redirects, &request.token).await?;

        let body = tokio::select! {
            biased;
            _ = request.token.cancelled() => return Err(SupervisorError::Cancelled),
            body = response.bytes() => body.map_err(|e| {
                SupervisorError::Network(format!("Reading {} failed: {}", url, e))
            })?,
        };

        Ok(serde_json::from_slice(&body)?)
    }

    /// Download `url` into `dest`.
    ///
    /// Bytes land in a `.tmp` sibling that is renamed over `dest` only after
    /// the body and checksum are complete. On any failure the temp file is
    /// removed and `dest` is left untouched.
    pub async fn download(
        &self,
        url: &str,
        dest: &Path,
        options: &DownloadOptions,
        on_progress: ProgressFn<'_>,
    ) -> Result<u64> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SupervisorError::fs(parent, e))?;
        }

        let tmp = temp_path(dest);
        let request = self.begin();

        let bytes = match self
            .stream_to_file(url, &tmp, options, &request.token, on_progress)
            .await
        {
            Ok(bytes) => bytes,
            Err(e) => {
                if let Err(rm) = tokio::fs::remove_file(&tmp).await {
                    if rm.kind() != std::io::ErrorKind::NotFound {
                        warn!("Failed to remove partial download {:?}: {}", tmp, rm);
                    }
                }
                return Err(e);
            }
        };

        tokio::fs::rename(&tmp, dest)
            .await
            .map_err(|e| SupervisorError::fs(dest, e))?;

        info!("Downloaded {} bytes to {:?}", bytes, dest);
        Ok(bytes)
    }

    async fn stream_to_file(
        &self,
        url: &str,
        tmp: &Path,
        options: &DownloadOptions,
        token: &CancellationToken,
        on_progress: ProgressFn<'_>,
    ) -> Result<u64> {
        let response = self.follow(url, options.max_redirects, token).await?;

        let announced = response.content_length();
        let total = announced.or(options.known_size);

        let file = tokio::fs::File::create(tmp)
            .await
            .map_err(|e| SupervisorError::fs(tmp, e))?;
        let mut file = tokio::io::BufWriter::new(file);
        let mut hasher = Sha256::new();
        let mut stream = response.bytes_stream();
        let mut downloaded: u64 = 0;
        let mut last_emit = Instant::now();

        on_progress(DownloadProgress::new(0, total));

        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(SupervisorError::Cancelled),
                next = stream.next() => next,
            };
            let Some(chunk) = next else { break };
            let chunk = chunk
                .map_err(|e| SupervisorError::Network(format!("Download of {} interrupted: {}", url, e)))?;

            file.write_all(&chunk)
                .await
                .map_err(|e| SupervisorError::fs(tmp, e))?;
            hasher.update(&chunk);
            downloaded += chunk.len() as u64;

            if last_emit.elapsed() >= PROGRESS_INTERVAL {
                on_progress(DownloadProgress::new(downloaded, total));
                last_emit = Instant::now();
            }
        }

        file.flush().await.map_err(|e| SupervisorError::fs(tmp, e))?;
        file.into_inner()
            .sync_all()
            .await
            .map_err(|e| SupervisorError::fs(tmp, e))?;

        if let Some(expected) = announced {
            if downloaded < expected {
                return Err(SupervisorError::Network(format!(
                    "Download of {} ended after {} of {} bytes",
                    url, downloaded, expected
                )));
            }
        }

        on_progress(DownloadProgress::new(downloaded, total));

        if let Some(expected) = &options.sha256 {
            let actual = hex::encode(hasher.finalize());
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(SupervisorError::ChecksumMismatch {
                    name: url.to_string(),
                    expected: expected.clone(),
                    actual,
                });
            }
            debug!("Checksum verified: {}", actual);
        }

        Ok(downloaded)
    }

    /// Issue GETs, following at most `max_redirects` redirects, until a
    /// terminal 200 response.
    async fn follow(
        &self,
        url: &str,
        max_redirects: usize,
        token: &CancellationToken,
    ) -> Result<reqwest::Response> {
        let mut current = Url::parse(url)
            .map_err(|e| SupervisorError::Network(format!("Invalid URL {}: {}", url, e)))?;
        let mut redirects = 0;

        loop {
            let response = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(SupervisorError::Cancelled),
                sent = self.client.get(current.clone()).send() => sent.map_err(|e| {
                    SupervisorError::Network(format!("GET {} failed: {}", current, e))
                })?,
            };

            let status = response.status();
            if status.is_redirection() {
                if let Some(location) = response.headers().get(LOCATION) {
                    if redirects >= max_redirects {
                        return Err(SupervisorError::TooManyRedirects {
                            url: url.to_string(),
                            limit: max_redirects,
                        });
                    }
                    let location = location.to_str().map_err(|_| {
                        SupervisorError::Network(format!("Invalid redirect from {}", current))
                    })?;
                    let next = current.join(location).map_err(|e| {
                        SupervisorError::Network(format!("Invalid redirect to {}: {}", location, e))
                    })?;
                    debug!("Redirect {} -> {}", current, next);
                    current = next;
                    redirects += 1;
                    continue;
                }
            }

            if status != StatusCode::OK {
                return Err(SupervisorError::Network(format!(
                    "{} returned HTTP {}",
                    current, status
                )));
            }

            return Ok(response);
        }
    }
}

impl Default for Downloader {
    fn default() -> Self {
        Self::new()
    }
}

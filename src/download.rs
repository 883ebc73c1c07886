//! HTTP downloader
//!
//! Streaming GET with progress reporting, redirect following, retry with
//! exponential back-off, and cooperative cancellation. The body is streamed
//! to a temporary file in the destination directory and atomically renamed
//! into place on success, so an observer never sees a partial file under the
//! final name. The SHA-256 of the body is computed during streaming.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;

use crate::cancel::CancelToken;
use crate::constants::{
    DEFAULT_MAX_RETRIES, HEAD_TIMEOUT, MAX_REDIRECTS, RETRY_BASE_DELAY, USER_AGENT,
};
use crate::error::{classify_http_status, classify_http_transport, Error, Result};
use crate::temp_file_guard::TempFileGuard;

/// Progress is reported at most this often (10 Hz), plus one final event.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

/// Progress event payload.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadProgress {
    pub downloaded: u64,
    pub total: Option<u64>,
    pub percent: Option<f32>,
}

/// Observer for progress events; the null implementation is `()`.
pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, progress: DownloadProgress);
}

impl ProgressObserver for () {
    fn on_progress(&self, _progress: DownloadProgress) {}
}

/// Per-call download options.
#[derive(Debug, Clone)]
pub struct DownloadOptions {
    pub max_retries: u32,
    /// Budget for one attempt, connection to last byte. `None` means no cap.
    pub timeout: Option<Duration>,
    pub cancel: CancelToken,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            timeout: None,
            cancel: CancelToken::new(),
        }
    }
}

/// A completed download.
#[derive(Debug, Clone)]
pub struct Downloaded {
    pub path: PathBuf,
    pub sha256: String,
    pub bytes: u64,
}

fn client(timeout: Option<Duration>) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS));
    if let Some(t) = timeout {
        builder = builder.timeout(t);
    }
    builder
        .build()
        .map_err(|e| Error::Internal(format!("HTTP client: {e}")))
}

/// Download `url` to `dest`, retrying transient failures with exponential
/// back-off (1 s base, doubling). A partial file is always discarded before a
/// retry; cancellation aborts the in-flight request and unlinks the partial.
pub async fn download(
    url: &str,
    dest: &Path,
    observer: &dyn ProgressObserver,
    opts: &DownloadOptions,
) -> Result<Downloaded> {
    let mut attempt = 0;
    loop {
        opts.cancel.check()?;

        match download_once(url, dest, observer, opts).await {
            Ok(done) => return Ok(done),
            Err(e) if e.is_retryable() && attempt < opts.max_retries => {
                let delay = RETRY_BASE_DELAY * 2u32.pow(attempt);
                warn!(
                    "download of {url} failed ({e}); retry {}/{} in {:?}",
                    attempt + 1,
                    opts.max_retries,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn download_once(
    url: &str,
    dest: &Path,
    observer: &dyn ProgressObserver,
    opts: &DownloadOptions,
) -> Result<Downloaded> {
    debug!("GET {url} -> {}", dest.display());

    let parent = dest
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    std::fs::create_dir_all(&parent)?;

    let file_name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| Error::Internal(format!("not a file path: {}", dest.display())))?;
    let temp_path = parent.join(format!(".{file_name}.part"));
    let guard = TempFileGuard::new(&temp_path);

    let response = client(opts.timeout)?
        .get(url)
        .send()
        .await
        .map_err(|e| classify_http_transport(url, &e))?;

    let status = response.status();
    if !status.is_success() {
        return Err(classify_http_status(url, status.as_u16()));
    }

    let total = response.content_length();
    observer.on_progress(DownloadProgress {
        downloaded: 0,
        total,
        percent: total.map(|_| 0.0),
    });

    let mut file = tokio::fs::File::create(&temp_path).await?;
    let mut hasher = Sha256::new();
    let mut downloaded: u64 = 0;
    let mut last_emit = Instant::now();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        opts.cancel.check()?;

        let chunk = chunk.map_err(|e| classify_http_transport(url, &e))?;
        file.write_all(&chunk).await?;
        hasher.update(&chunk);
        downloaded += chunk.len() as u64;

        if last_emit.elapsed() >= PROGRESS_INTERVAL {
            last_emit = Instant::now();
            observer.on_progress(DownloadProgress {
                downloaded,
                total,
                percent: percent_of(downloaded, total),
            });
        }
    }

    file.flush().await?;
    drop(file);

    opts.cancel.check()?;

    // Visible under the final name only once fully written.
    std::fs::rename(&temp_path, dest)?;
    drop(guard);

    observer.on_progress(DownloadProgress {
        downloaded,
        total,
        percent: total.map(|_| 100.0),
    });

    let sha256 = format!("{:x}", hasher.finalize());
    info!("downloaded {url} ({downloaded} bytes, sha256 {sha256})");

    Ok(Downloaded {
        path: dest.to_path_buf(),
        sha256,
        bytes: downloaded,
    })
}

fn percent_of(downloaded: u64, total: Option<u64>) -> Option<f32> {
    total.filter(|t| *t > 0).map(|t| {
        (downloaded as f32 / t as f32) * 100.0
    })
}

/// Probe the Content-Length of `url` with a short HEAD request.
///
/// Used only for UI sizing; every failure collapses to `None` and must never
/// prevent a subsequent download.
pub async fn head_size(url: &str) -> Option<u64> {
    let client = client(Some(HEAD_TIMEOUT)).ok()?;
    let response = client.head(url).send().await.ok()?;
    if !response.status().is_success() {
        return None;
    }
    response.content_length().filter(|len| *len > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Recorder {
        events: Mutex<Vec<DownloadProgress>>,
    }

    impl Recorder {
        fn new() -> Self {
            Self {
                events: Mutex::new(Vec::new()),
            }
        }

        fn events(&self) -> Vec<DownloadProgress> {
            self.events.lock().unwrap().clone()
        }
    }

    impl ProgressObserver for Recorder {
        fn on_progress(&self, progress: DownloadProgress) {
            self.events.lock().unwrap().push(progress);
        }
    }

    fn sha256_hex(data: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(data);
        format!("{:x}", hasher.finalize())
    }

    #[tokio::test]
    async fn downloads_and_hashes_the_body() {
        let server = MockServer::start().await;
        let body = vec![7u8; 64 * 1024];
        Mock::given(method("GET"))
            .and(path("/rootfs.tar.gz"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("rootfs.tar.gz");
        let recorder = Recorder::new();

        let done = download(
            &format!("{}/rootfs.tar.gz", server.uri()),
            &dest,
            &recorder,
            &DownloadOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(done.bytes, body.len() as u64);
        assert_eq!(done.sha256, sha256_hex(&body));
        assert_eq!(std::fs::read(&dest).unwrap(), body);

        let events = recorder.events();
        assert!(events.len() >= 2);
        assert_eq!(events.first().unwrap().downloaded, 0);
        assert_eq!(events.last().unwrap().percent, Some(100.0));
        // Monotonically non-decreasing byte counts.
        assert!(events.windows(2).all(|w| w[0].downloaded <= w[1].downloaded));
    }

    #[tokio::test]
    async fn follows_redirects() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/moved"))
            .respond_with(
                ResponseTemplate::new(302).insert_header("Location", "/final.tar"),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/final.tar"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"tar bytes".to_vec()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.tar");

        let done = download(
            &format!("{}/moved", server.uri()),
            &dest,
            &(),
            &DownloadOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(done.bytes, 9);
        assert!(dest.exists());
    }

    #[tokio::test]
    async fn http_404_is_terminal_and_leaves_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gone"))
            .respond_with(ResponseTemplate::new(404))
            // A 4xx must not be retried.
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("gone.tar");

        let err = download(
            &format!("{}/gone", server.uri()),
            &dest,
            &(),
            &DownloadOptions::default(),
        )
        .await
        .unwrap_err();

        assert_eq!(err.kind(), crate::error::ErrorKind::SourceUnavailable);
        assert!(!dest.exists());
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn http_5xx_retries_then_escalates() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("flaky.tar");

        let opts = DownloadOptions {
            max_retries: 2,
            ..Default::default()
        };
        let err = download(&format!("{}/flaky", server.uri()), &dest, &(), &opts)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), crate::error::ErrorKind::TransientNetwork);
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn retry_recovers_after_transient_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/recovers"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/recovers"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"ok".to_vec()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("recovers.tar");

        let opts = DownloadOptions {
            max_retries: 2,
            ..Default::default()
        };
        let done = download(&format!("{}/recovers", server.uri()), &dest, &(), &opts)
            .await
            .unwrap();
        assert_eq!(done.bytes, 2);
    }

    #[tokio::test]
    async fn pre_cancelled_token_short_circuits() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("never.tar");

        let opts = DownloadOptions::default();
        opts.cancel.cancel();

        let err = download("http://127.0.0.1:9/never", &dest, &(), &opts)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Cancelled);
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn head_size_reports_content_length() {
        let server = MockServer::start().await;
        // The server advertises the body size; HEAD responses carry only the
        // Content-Length.
        Mock::given(method("HEAD"))
            .and(path("/sized"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![7u8; 650_000]))
            .mount(&server)
            .await;

        let size = head_size(&format!("{}/sized", server.uri())).await;
        assert_eq!(size, Some(650_000));
    }

    #[tokio::test]
    async fn head_size_failure_is_none() {
        assert_eq!(head_size("http://127.0.0.1:9/unreachable").await, None);

        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/err"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        assert_eq!(head_size(&format!("{}/err", server.uri())).await, None);
    }
}

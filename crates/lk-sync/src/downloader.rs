//! Generic scheduled-download engine
//!
//! Tracks expiration state for a set of downloadable resources supplied by
//! a handler and performs HTTP fetch with retry, redirect and error
//! classification, on a periodic schedule or on demand. The engine never
//! touches the filter graph; handlers translate results into whatever
//! state they own.
//!
//! All timestamps are milliseconds since the epoch.

use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, warn};
use rand::Rng;
use thiserror::Error;

pub const MILLIS_IN_SECOND: u64 = 1000;
pub const MILLIS_IN_MINUTE: u64 = 60 * MILLIS_IN_SECOND;
pub const MILLIS_IN_HOUR: u64 = 60 * MILLIS_IN_MINUTE;
pub const MILLIS_IN_DAY: u64 = 24 * MILLIS_IN_HOUR;

/// Download failure classification. The display form is the status code
/// recorded on subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DownloadError {
    #[error("synchronize_invalid_url")]
    InvalidUrl,
    #[error("synchronize_connection_error")]
    ConnectionError,
    #[error("synchronize_invalid_data")]
    InvalidData,
    #[error("synchronize_checksum_mismatch")]
    ChecksumMismatch,
}

impl DownloadError {
    pub fn code(&self) -> &'static str {
        match self {
            DownloadError::InvalidUrl => "synchronize_invalid_url",
            DownloadError::ConnectionError => "synchronize_connection_error",
            DownloadError::InvalidData => "synchronize_invalid_data",
            DownloadError::ChecksumMismatch => "synchronize_checksum_mismatch",
        }
    }
}

/// Milliseconds since the epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// =============================================================================
// Downloadable
// =============================================================================

/// Expiration and error state for one tracked resource. Created transiently
/// per check or manual download; the handler writes the fields back into
/// whatever owns them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Downloadable {
    pub url: String,
    /// Where the download chain currently points after `redirect` handling.
    pub redirect_url: Option<String>,
    /// Time of the last failed download, 0 after a success.
    pub last_error: u64,
    pub last_check: u64,
    pub last_version: u64,
    pub soft_expiration: u64,
    pub hard_expiration: u64,
    /// Manually requested downloads skip error bookkeeping.
    pub manual: bool,
}

impl Downloadable {
    pub fn new(url: &str) -> Downloadable {
        Downloadable { url: url.to_string(), ..Downloadable::default() }
    }

    /// The URL the next request goes to.
    pub fn target_url(&self) -> &str {
        self.redirect_url.as_deref().unwrap_or(&self.url)
    }
}

// =============================================================================
// Engine Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    pub initial_delay: Duration,
    pub check_interval: Duration,
    /// Check gaps longer than this shift the soft expiration forward to
    /// avoid load peaks after the process was offline.
    pub max_absence_interval: u64,
    pub min_retry_interval: u64,
    pub max_expiration_interval: u64,
    pub max_redirects: u32,
    /// Appended to every request as `app=` / `app_version=`.
    pub app: String,
    pub app_version: String,
}

impl DownloaderConfig {
    pub fn new(initial_delay: Duration, check_interval: Duration, app: &str, app_version: &str) -> Self {
        DownloaderConfig {
            initial_delay,
            check_interval,
            max_absence_interval: MILLIS_IN_DAY,
            min_retry_interval: MILLIS_IN_DAY,
            max_expiration_interval: 14 * MILLIS_IN_DAY,
            max_redirects: 5,
            app: app.to_string(),
            app_version: app_version.to_string(),
        }
    }

    /// Turn a supplied expiration interval into a `(soft, hard)` deadline
    /// pair: the soft deadline is jittered by ±20% to desynchronize
    /// refreshes across installations, the hard deadline is a fixed
    /// multiple.
    pub fn process_expiration_interval(&self, now: u64, interval: u64) -> (u64, u64) {
        let interval = interval.min(self.max_expiration_interval);
        let jitter = rand::thread_rng().gen_range(0.8..1.2);
        let soft = (interval as f64 * jitter).round() as u64;
        (now + soft, now + 2 * interval)
    }
}

// =============================================================================
// Seams
// =============================================================================

#[derive(Debug, Clone)]
pub struct DownloadResponse {
    pub status: u16,
    pub body: String,
}

/// HTTP seam; transport failures map to `ConnectionError`.
pub trait DownloadClient {
    async fn get(&self, url: &str) -> Result<DownloadResponse, DownloadError>;
}

/// Real client backed by reqwest.
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    pub fn new() -> Self {
        ReqwestClient { client: reqwest::Client::new() }
    }
}

impl Default for ReqwestClient {
    fn default() -> Self {
        ReqwestClient::new()
    }
}

impl DownloadClient for ReqwestClient {
    async fn get(&self, url: &str) -> Result<DownloadResponse, DownloadError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|_| DownloadError::ConnectionError)?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|_| DownloadError::ConnectionError)?;
        Ok(DownloadResponse { status, body })
    }
}

/// What a successful fetch wants the engine to do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SuccessOutcome {
    Done,
    /// Follow a redirect announced inside the fetched content.
    Redirect(String),
    /// The body was fetched but rejected.
    Failed(DownloadError),
}

/// Consumer of the engine: yields what to download and absorbs results.
pub trait DownloadHandler {
    /// Resources to consider on a periodic check.
    fn downloadables(&self) -> Vec<Downloadable>;

    /// Expiration fields changed during a check and need writing back.
    fn on_expiration_change(&self, downloadable: &Downloadable);

    fn on_download_started(&self, _downloadable: &Downloadable) {}

    fn on_download_success(&self, downloadable: &Downloadable, body: &str) -> SuccessOutcome;

    /// A download failed. Returning a URL requests one redirect
    /// continuation, honored only while the redirect budget allows it.
    fn on_download_error(
        &self,
        downloadable: &Downloadable,
        download_url: &str,
        error: DownloadError,
        status: Option<u16>,
    ) -> Option<String>;
}

// =============================================================================
// Engine
// =============================================================================

pub struct Downloader<C: DownloadClient, H: DownloadHandler> {
    client: Rc<C>,
    handler: Rc<H>,
    config: DownloaderConfig,
    in_flight: Rc<RefCell<HashSet<String>>>,
}

impl<C: DownloadClient, H: DownloadHandler> Clone for Downloader<C, H> {
    fn clone(&self) -> Self {
        Downloader {
            client: self.client.clone(),
            handler: self.handler.clone(),
            config: self.config.clone(),
            in_flight: self.in_flight.clone(),
        }
    }
}

impl<C: DownloadClient, H: DownloadHandler> Downloader<C, H> {
    pub fn new(client: Rc<C>, handler: Rc<H>, config: DownloaderConfig) -> Self {
        Downloader { client, handler, config, in_flight: Rc::new(RefCell::new(HashSet::new())) }
    }

    pub fn config(&self) -> &DownloaderConfig {
        &self.config
    }

    pub fn is_downloading(&self, url: &str) -> bool {
        self.in_flight.borrow().contains(url)
    }

    /// Periodic loop: one check after the initial delay, then one per
    /// check interval. A running check cannot be cancelled mid-cycle, only
    /// future cycles stop when the task is dropped.
    pub async fn run(&self)
    where
        C: 'static,
        H: 'static,
    {
        tokio::time::sleep(self.config.initial_delay).await;
        loop {
            self.check_now(now_millis());
            tokio::time::sleep(self.config.check_interval).await;
        }
    }

    /// One scheduling pass over the handler's resources.
    pub fn check_now(&self, now: u64)
    where
        C: 'static,
        H: 'static,
    {
        for mut downloadable in self.handler.downloadables() {
            let gap = now.saturating_sub(downloadable.last_check);
            if downloadable.last_check != 0 && gap > self.config.max_absence_interval {
                // No checks for a long time, the process must have been
                // offline. Shift the soft expiration to spread the load.
                downloadable.soft_expiration += gap;
            }
            downloadable.last_check = now;

            // Clock changes must not leave expirations unreachably far out.
            let limit = now + self.config.max_expiration_interval;
            downloadable.hard_expiration = downloadable.hard_expiration.min(limit);
            downloadable.soft_expiration = downloadable.soft_expiration.min(limit);

            self.handler.on_expiration_change(&downloadable);

            if downloadable.soft_expiration > now && downloadable.hard_expiration > now {
                continue;
            }
            if downloadable.last_error != 0
                && now.saturating_sub(downloadable.last_error) < self.config.min_retry_interval
            {
                debug!("skipping {} (retry interval)", downloadable.url);
                continue;
            }
            self.download(downloadable);
        }
    }

    /// Start a download detached from the caller's execution context. It
    /// proceeds regardless of expiration state and is skipped only when
    /// the same URL is already in flight.
    pub fn download(&self, downloadable: Downloadable)
    where
        C: 'static,
        H: 'static,
    {
        let this = self.clone();
        tokio::task::spawn_local(async move {
            this.fetch(downloadable).await;
        });
    }

    /// Build the request URL, appending the tracking query parameters.
    pub fn build_download_url(&self, downloadable: &Downloadable) -> String {
        let base = downloadable.target_url();
        let separator = if base.contains('?') { '&' } else { '?' };
        format!(
            "{base}{separator}app={}&app_version={}",
            encode_query(&self.config.app),
            encode_query(&self.config.app_version)
        )
    }

    /// Fetch a resource, following content-level redirects up to the
    /// redirect budget. The in-flight mark is cleared before any handler
    /// callback fires, so a callback-initiated redirect re-download is not
    /// rejected as a duplicate.
    pub async fn fetch(&self, mut downloadable: Downloadable) {
        let mut redirects: u32 = 0;
        loop {
            if self.is_downloading(&downloadable.url) {
                return;
            }
            let download_url = self.build_download_url(&downloadable);
            self.in_flight.borrow_mut().insert(downloadable.url.clone());
            self.handler.on_download_started(&downloadable);

            let result = self.client.get(&download_url).await;
            self.in_flight.borrow_mut().remove(&downloadable.url);

            let failure = match result {
                Ok(response) if (200..300).contains(&response.status) => {
                    match self.handler.on_download_success(&downloadable, &response.body) {
                        SuccessOutcome::Done => return,
                        SuccessOutcome::Redirect(url) => {
                            if redirects >= self.config.max_redirects {
                                warn!("redirect limit reached for {}", downloadable.url);
                                self.handler.on_download_error(
                                    &downloadable,
                                    &download_url,
                                    DownloadError::ConnectionError,
                                    Some(response.status),
                                );
                                return;
                            }
                            downloadable.redirect_url = Some(url);
                            redirects += 1;
                            continue;
                        }
                        SuccessOutcome::Failed(error) => (error, Some(response.status)),
                    }
                }
                Ok(response) => (DownloadError::ConnectionError, Some(response.status)),
                Err(error) => (error, None),
            };

            let (error, status) = failure;
            warn!(
                "downloading {} failed ({}), download address {download_url}",
                downloadable.url,
                error.code()
            );
            let continuation =
                self.handler.on_download_error(&downloadable, &download_url, error, status);
            match continuation {
                // One extra redirect is allowed when the error handler
                // supplies a target.
                Some(url) if redirects <= self.config.max_redirects => {
                    downloadable.redirect_url = Some(url);
                    redirects += 1;
                }
                _ => return,
            }
        }
    }
}

fn encode_query(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn config() -> DownloaderConfig {
        DownloaderConfig::new(
            Duration::from_millis(0),
            Duration::from_secs(3600),
            "listkeeper",
            "1.0",
        )
    }

    #[derive(Default)]
    struct MockClient {
        responses: RefCell<Vec<Result<DownloadResponse, DownloadError>>>,
        requests: RefCell<Vec<String>>,
        gate: Option<tokio::sync::Notify>,
    }

    impl DownloadClient for MockClient {
        async fn get(&self, url: &str) -> Result<DownloadResponse, DownloadError> {
            self.requests.borrow_mut().push(url.to_string());
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            let mut responses = self.responses.borrow_mut();
            if responses.is_empty() {
                Ok(DownloadResponse { status: 200, body: String::new() })
            } else {
                responses.remove(0)
            }
        }
    }

    #[derive(Default)]
    struct MockHandler {
        items: RefCell<Vec<Downloadable>>,
        expiration_changes: RefCell<Vec<Downloadable>>,
        outcome: RefCell<Option<SuccessOutcome>>,
        successes: Cell<usize>,
        errors: RefCell<Vec<DownloadError>>,
    }

    impl DownloadHandler for MockHandler {
        fn downloadables(&self) -> Vec<Downloadable> {
            self.items.borrow().clone()
        }

        fn on_expiration_change(&self, downloadable: &Downloadable) {
            self.expiration_changes.borrow_mut().push(downloadable.clone());
        }

        fn on_download_success(&self, _downloadable: &Downloadable, _body: &str) -> SuccessOutcome {
            self.successes.set(self.successes.get() + 1);
            self.outcome.borrow().clone().unwrap_or(SuccessOutcome::Done)
        }

        fn on_download_error(
            &self,
            _downloadable: &Downloadable,
            _download_url: &str,
            error: DownloadError,
            _status: Option<u16>,
        ) -> Option<String> {
            self.errors.borrow_mut().push(error);
            None
        }
    }

    fn engine(handler: Rc<MockHandler>, client: Rc<MockClient>) -> Downloader<MockClient, MockHandler> {
        Downloader::new(client, handler, config())
    }

    #[tokio::test]
    async fn test_absence_gap_shifts_soft_expiration() {
        let now = 10 * MILLIS_IN_DAY;
        let gap = 3 * MILLIS_IN_DAY;
        let handler = Rc::new(MockHandler::default());
        let mut item = Downloadable::new("https://list.example.com/l.txt");
        item.last_check = now - gap;
        item.soft_expiration = now + MILLIS_IN_HOUR;
        item.hard_expiration = now + 4 * MILLIS_IN_DAY;
        handler.items.borrow_mut().push(item);

        let downloader = engine(handler.clone(), Rc::new(MockClient::default()));
        let local = tokio::task::LocalSet::new();
        local.run_until(async { downloader.check_now(now) }).await;

        let changes = handler.expiration_changes.borrow();
        assert_eq!(changes.len(), 1);
        assert!(changes[0].soft_expiration >= now + MILLIS_IN_HOUR + gap);
        assert_eq!(changes[0].last_check, now);
        // Shifted past now: nothing was downloaded.
        local.await;
        assert_eq!(handler.successes.get(), 0);
    }

    #[tokio::test]
    async fn test_expirations_clamped() {
        let now = 10 * MILLIS_IN_DAY;
        let handler = Rc::new(MockHandler::default());
        let mut item = Downloadable::new("https://list.example.com/l.txt");
        item.last_check = now;
        item.soft_expiration = now + 100 * MILLIS_IN_DAY;
        item.hard_expiration = now + 200 * MILLIS_IN_DAY;
        handler.items.borrow_mut().push(item);

        let downloader = engine(handler.clone(), Rc::new(MockClient::default()));
        let local = tokio::task::LocalSet::new();
        local.run_until(async { downloader.check_now(now) }).await;

        let changes = handler.expiration_changes.borrow();
        assert_eq!(changes[0].soft_expiration, now + 14 * MILLIS_IN_DAY);
        assert_eq!(changes[0].hard_expiration, now + 14 * MILLIS_IN_DAY);
    }

    #[tokio::test]
    async fn test_expired_resource_downloads_and_retry_backoff() {
        let now = 10 * MILLIS_IN_DAY;
        let handler = Rc::new(MockHandler::default());
        let mut item = Downloadable::new("https://list.example.com/l.txt");
        item.last_check = now;
        item.soft_expiration = now - 1;
        item.hard_expiration = now + MILLIS_IN_DAY;
        handler.items.borrow_mut().push(item.clone());

        let client = Rc::new(MockClient::default());
        let downloader = engine(handler.clone(), client.clone());
        let local = tokio::task::LocalSet::new();
        local.run_until(async { downloader.check_now(now) }).await;
        local.await;
        assert_eq!(handler.successes.get(), 1);

        // A recent error suppresses the retry.
        item.last_error = now - MILLIS_IN_HOUR;
        *handler.items.borrow_mut() = vec![item];
        let local = tokio::task::LocalSet::new();
        local.run_until(async { downloader.check_now(now) }).await;
        local.await;
        assert_eq!(handler.successes.get(), 1);
    }

    #[test]
    fn test_process_expiration_interval() {
        let cfg = config();
        let now = 42 * MILLIS_IN_DAY;
        for &interval in &[0, MILLIS_IN_HOUR, 5 * MILLIS_IN_DAY, 100 * MILLIS_IN_DAY] {
            let (soft, hard) = cfg.process_expiration_interval(now, interval);
            let clamped = interval.min(cfg.max_expiration_interval);
            assert!(soft <= hard);
            assert_eq!(hard - now, 2 * clamped);
            assert!(soft >= now + (clamped as f64 * 0.8).round() as u64 - 1);
            assert!(soft <= now + (clamped as f64 * 1.2).round() as u64 + 1);
        }
    }

    #[test]
    fn test_build_download_url() {
        let handler = Rc::new(MockHandler::default());
        let downloader = engine(handler, Rc::new(MockClient::default()));
        let plain = Downloadable::new("https://list.example.com/l.txt");
        assert_eq!(
            downloader.build_download_url(&plain),
            "https://list.example.com/l.txt?app=listkeeper&app_version=1.0"
        );
        let query = Downloadable::new("https://list.example.com/l.txt?lang=en");
        assert_eq!(
            downloader.build_download_url(&query),
            "https://list.example.com/l.txt?lang=en&app=listkeeper&app_version=1.0"
        );
        let mut redirected = Downloadable::new("https://list.example.com/l.txt");
        redirected.redirect_url = Some("https://mirror.example.com/l.txt".to_string());
        assert!(downloader
            .build_download_url(&redirected)
            .starts_with("https://mirror.example.com/l.txt?"));
    }

    #[tokio::test]
    async fn test_redirect_limit_is_terminal_connection_error() {
        let handler = Rc::new(MockHandler::default());
        *handler.outcome.borrow_mut() =
            Some(SuccessOutcome::Redirect("https://mirror.example.com/l.txt".to_string()));
        let client = Rc::new(MockClient::default());
        let downloader = engine(handler.clone(), client.clone());

        downloader.fetch(Downloadable::new("https://list.example.com/l.txt")).await;

        // Initial request plus one per allowed redirect.
        assert_eq!(client.requests.borrow().len(), 6);
        assert_eq!(*handler.errors.borrow(), vec![DownloadError::ConnectionError]);
    }

    #[tokio::test]
    async fn test_non_success_status_is_connection_error() {
        let handler = Rc::new(MockHandler::default());
        let client = Rc::new(MockClient::default());
        client
            .responses
            .borrow_mut()
            .push(Ok(DownloadResponse { status: 404, body: String::new() }));
        let downloader = engine(handler.clone(), client);

        downloadable_fetch(&downloader).await;
        assert_eq!(handler.successes.get(), 0);
        assert_eq!(*handler.errors.borrow(), vec![DownloadError::ConnectionError]);
    }

    async fn downloadable_fetch(downloader: &Downloader<MockClient, MockHandler>) {
        downloader.fetch(Downloadable::new("https://list.example.com/l.txt")).await;
    }

    #[tokio::test]
    async fn test_in_flight_url_skips_duplicate() {
        let handler = Rc::new(MockHandler::default());
        let client = Rc::new(MockClient { gate: Some(tokio::sync::Notify::new()), ..MockClient::default() });
        let downloader = engine(handler.clone(), client.clone());

        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                downloader.download(Downloadable::new("https://list.example.com/l.txt"));
                tokio::task::yield_now().await;
                assert!(downloader.is_downloading("https://list.example.com/l.txt"));

                // Same URL again: rejected while in flight.
                downloader.download(Downloadable::new("https://list.example.com/l.txt"));
                tokio::task::yield_now().await;
                assert_eq!(client.requests.borrow().len(), 1);

                client.gate.as_ref().unwrap().notify_waiters();
                tokio::task::yield_now().await;
                assert!(!downloader.is_downloading("https://list.example.com/l.txt"));
            })
            .await;
        local.await;
        assert_eq!(handler.successes.get(), 1);
    }
}

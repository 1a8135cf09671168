//! Subscription content synchronization
//!
//! Layers rule-list semantics on the download engine: one downloadable per
//! enabled remote subscription, header and metadata parsing for fetched
//! lists, checksum validation, redirect migration, and the atomic filter
//! replacement in the graph. This is the only component that turns network
//! responses into graph mutations.

use std::rc::Rc;
use std::time::Duration;

use log::warn;

use lk_core::storage::{FilterGraph, FilterStore, StorageBackend, SubscriptionId};
use lk_core::FilterNotifier;

use crate::config::Config;
use crate::downloader::{
    now_millis, DownloadClient, DownloadError, DownloadHandler, Downloadable, Downloader,
    DownloaderConfig, SuccessOutcome, MILLIS_IN_DAY, MILLIS_IN_HOUR, MILLIS_IN_MINUTE,
    MILLIS_IN_SECOND,
};

pub const INITIAL_DELAY: Duration = Duration::from_millis(6 * MILLIS_IN_MINUTE);
pub const CHECK_INTERVAL: Duration = Duration::from_millis(MILLIS_IN_HOUR);
pub const DEFAULT_EXPIRATION_INTERVAL: u64 = 5 * MILLIS_IN_DAY;

/// Digest function for embedded `! Checksum:` validation. Applied to the
/// normalized list content; when absent, embedded checksums are ignored.
pub type ChecksumFn = Box<dyn Fn(&str) -> String>;

fn now_secs() -> u64 {
    now_millis() / MILLIS_IN_SECOND
}

fn to_secs(millis: u64) -> u64 {
    (millis + MILLIS_IN_SECOND / 2) / MILLIS_IN_SECOND
}

// =============================================================================
// List Text Parsing
// =============================================================================

/// Metadata comments recognized in fetched lists.
#[derive(Debug, Default)]
struct ListParams {
    redirect: Option<String>,
    homepage: Option<String>,
    title: Option<String>,
    version: Option<String>,
    expires: Option<String>,
}

/// Parse the required `[Adblock...]` header marker, yielding the optional
/// minimum-version token.
fn parse_header(line: &str) -> Option<Option<String>> {
    let inner = line.trim().strip_prefix('[')?.strip_suffix(']')?.trim();
    let lower = inner.to_ascii_lowercase();
    if !lower.starts_with("adblock") {
        return None;
    }
    let rest = inner["adblock".len()..].trim_start();
    let rest = if rest.to_ascii_lowercase().starts_with("plus") {
        rest["plus".len()..].trim_start()
    } else {
        rest
    };
    let version: String = rest
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    if version.is_empty() {
        Some(None)
    } else {
        Some(Some(version))
    }
}

/// Parse a `! key: value` metadata comment.
fn parse_metadata(line: &str) -> Option<(String, String)> {
    let rest = line.trim_start().strip_prefix('!')?.trim_start();
    let (key, value) = rest.split_once(':')?;
    let key = key.trim();
    if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }
    Some((key.to_ascii_lowercase(), value.trim().to_string()))
}

/// Leading numeric prefix of a dotted version, for the float-style
/// comparison the original update checks use.
fn version_number(version: &str) -> f64 {
    let mut seen_dot = false;
    let numeric: String = version
        .trim()
        .chars()
        .take_while(|c| {
            if c.is_ascii_digit() {
                true
            } else if *c == '.' && !seen_dot {
                seen_dot = true;
                true
            } else {
                false
            }
        })
        .collect();
    numeric.parse().unwrap_or(0.0)
}

/// `"<N>h"` means hours, a plain count means days.
fn parse_expiration(value: &str) -> Option<u64> {
    let trimmed = value.trim();
    let digits: String = trimmed.chars().take_while(|c| c.is_ascii_digit()).collect();
    let count: u64 = digits.parse().ok()?;
    let unit = trimmed[digits.len()..].trim_start();
    if unit.to_ascii_lowercase().starts_with('h') {
        Some(count * MILLIS_IN_HOUR)
    } else {
        Some(count * MILLIS_IN_DAY)
    }
}

// =============================================================================
// Synchronizer
// =============================================================================

/// Handler state shared with the download engine.
pub struct SyncCore<B: StorageBackend> {
    store: Rc<FilterStore<B>>,
    autoupdate: bool,
    app_version: String,
    downloader_config: DownloaderConfig,
    checksum: Option<ChecksumFn>,
}

pub struct Synchronizer<B: StorageBackend, C: DownloadClient> {
    core: Rc<SyncCore<B>>,
    downloader: Downloader<C, SyncCore<B>>,
}

impl<B: StorageBackend, C: DownloadClient> Synchronizer<B, C> {
    pub fn new(
        store: Rc<FilterStore<B>>,
        client: Rc<C>,
        config: &Config,
        checksum: Option<ChecksumFn>,
    ) -> Self {
        let downloader_config =
            DownloaderConfig::new(INITIAL_DELAY, CHECK_INTERVAL, &config.app, &config.app_version);
        let core = Rc::new(SyncCore {
            store,
            autoupdate: config.subscriptions_autoupdate,
            app_version: config.app_version.clone(),
            downloader_config: downloader_config.clone(),
            checksum,
        });
        let downloader = Downloader::new(client, core.clone(), downloader_config);
        Synchronizer { core, downloader }
    }

    pub fn downloader(&self) -> &Downloader<C, SyncCore<B>> {
        &self.downloader
    }

    /// Whether a subscription URL is currently being fetched.
    pub fn is_executing(&self, url: &str) -> bool {
        self.downloader.is_downloading(url)
    }

    /// The periodic refresh loop.
    pub async fn run(&self)
    where
        B: 'static,
        C: 'static,
    {
        self.downloader.run().await
    }

    /// One scheduling pass, outside the periodic loop.
    pub fn check_now(&self)
    where
        B: 'static,
        C: 'static,
    {
        self.downloader.check_now(now_millis());
    }

    /// Start a download for one subscription, regardless of expirations.
    pub fn execute(&self, url: &str, manual: bool)
    where
        B: 'static,
        C: 'static,
    {
        let downloadable = {
            let graph = self.core.store.graph.borrow();
            match graph.subscription_by_url(url) {
                Some(id) => self.core.downloadable_for(&graph, id, manual),
                None => Some(Downloadable::new(url)),
            }
        };
        if let Some(downloadable) = downloadable {
            self.downloader.download(downloadable);
        }
    }
}

impl<B: StorageBackend> SyncCore<B> {
    fn downloadable_for(
        &self,
        graph: &FilterGraph,
        id: SubscriptionId,
        manual: bool,
    ) -> Option<Downloadable> {
        let subscription = graph.subscription(id);
        let details = subscription.downloadable()?;
        let mut downloadable = Downloadable::new(&subscription.url);
        if details.last_download != details.last_success {
            downloadable.last_error = details.last_download * MILLIS_IN_SECOND;
        }
        downloadable.last_check = details.last_check * MILLIS_IN_SECOND;
        downloadable.last_version = details.version;
        downloadable.soft_expiration = details.soft_expiration * MILLIS_IN_SECOND;
        downloadable.hard_expiration = details.expires * MILLIS_IN_SECOND;
        downloadable.manual = manual;
        Some(downloadable)
    }

    /// Resolve the subscription a completed download belongs to, migrating
    /// state to the redirect target when the chain moved. A URL nobody ever
    /// listed stays unlisted; its content is discarded.
    fn resolve_subscription(
        &self,
        graph: &mut FilterGraph,
        notifier: &FilterNotifier,
        downloadable: &Downloadable,
    ) -> Option<SubscriptionId> {
        let old = graph.subscription_by_url(&downloadable.url)?;
        let final_url = downloadable.target_url().to_string();
        if final_url == downloadable.url {
            return Some(old);
        }

        let carried = {
            let subscription = graph.subscription(old);
            (
                subscription.title.clone(),
                subscription.disabled,
                subscription.downloadable().map(|d| d.last_check).unwrap_or(0),
            )
        };
        graph.remove_subscription(notifier, &downloadable.url);
        let id = graph.add_subscription(notifier, &final_url);
        let (title, disabled, last_check) = carried;
        graph.subscription_mut(id).title = title;
        graph.subscription_mut(id).disabled = disabled;
        if let Some(details) = graph.subscription_mut(id).downloadable_mut() {
            details.last_check = last_check;
        }
        Some(id)
    }
}

impl<B: StorageBackend> DownloadHandler for SyncCore<B> {
    fn downloadables(&self) -> Vec<Downloadable> {
        if !self.autoupdate {
            return Vec::new();
        }
        let graph = self.store.graph.borrow();
        graph
            .listed_subscriptions()
            .filter(|&id| !graph.subscription(id).disabled)
            .filter_map(|id| self.downloadable_for(&graph, id, false))
            .collect()
    }

    fn on_expiration_change(&self, downloadable: &Downloadable) {
        let mut graph = self.store.graph.borrow_mut();
        let id = match graph.subscription_by_url(&downloadable.url) {
            Some(id) => id,
            None => return,
        };
        if let Some(details) = graph.subscription_mut(id).downloadable_mut() {
            details.last_check = to_secs(downloadable.last_check);
            details.soft_expiration = to_secs(downloadable.soft_expiration);
            details.expires = to_secs(downloadable.hard_expiration);
        }
    }

    fn on_download_success(&self, downloadable: &Downloadable, body: &str) -> SuccessOutcome {
        // Blank lines never count, neither for filters nor for checksums.
        let mut lines: Vec<String> = body
            .split(['\r', '\n'])
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect();

        let min_version = match lines.first().and_then(|line| parse_header(line)) {
            Some(min_version) => min_version,
            None => return SuccessOutcome::Failed(DownloadError::InvalidData),
        };

        // The checksum line itself is excluded from the digest; metadata
        // comments are not.
        if let Some(index) = lines.iter().position(
            |line| matches!(parse_metadata(line), Some((key, _)) if key == "checksum"),
        ) {
            let line = lines.remove(index);
            if let Some(digest) = &self.checksum {
                let expected = match parse_metadata(&line) {
                    Some((_, value)) => value,
                    None => String::new(),
                };
                let actual = digest(&lines.join("\n"));
                if actual.trim_end_matches('=') != expected.trim_end_matches('=') {
                    return SuccessOutcome::Failed(DownloadError::ChecksumMismatch);
                }
            }
        }

        let mut params = ListParams::default();
        lines.retain(|line| {
            let (key, value) = match parse_metadata(line) {
                Some(entry) => entry,
                None => return true,
            };
            let slot = match key.as_str() {
                "redirect" => &mut params.redirect,
                "homepage" => &mut params.homepage,
                "title" => &mut params.title,
                "version" => &mut params.version,
                "expires" => &mut params.expires,
                _ => return true,
            };
            *slot = Some(value);
            false
        });

        // A redirect parameter supersedes all other processing.
        if let Some(target) = params.redirect {
            return SuccessOutcome::Redirect(target);
        }

        let mut graph = self.store.graph.borrow_mut();
        let notifier = &self.store.notifier;
        let id = match self.resolve_subscription(&mut graph, notifier, downloadable) {
            Some(id) => id,
            None => {
                warn!("discarding content for unlisted {}", downloadable.url);
                return SuccessOutcome::Done;
            }
        };

        let now = now_secs();
        let expiration_interval = params
            .expires
            .as_deref()
            .and_then(parse_expiration)
            .unwrap_or(DEFAULT_EXPIRATION_INTERVAL);
        let (soft, hard) = self
            .downloader_config
            .process_expiration_interval(now_millis(), expiration_interval);

        {
            let subscription = graph.subscription_mut(id);
            match &params.title {
                Some(_) => subscription.fixed_title = true,
                None => subscription.fixed_title = false,
            }
            let details = match subscription.downloadable_mut() {
                Some(details) => details,
                None => {
                    warn!("downloaded content for non-downloadable {}", downloadable.url);
                    return SuccessOutcome::Done;
                }
            };
            details.last_success = now;
            details.errors = 0;
            details.version = params
                .version
                .as_deref()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            details.soft_expiration = to_secs(soft);
            details.expires = to_secs(hard);
            match &min_version {
                Some(version) => {
                    details.required_version = Some(version.clone());
                    details.upgrade_required =
                        version_number(version) > version_number(&self.app_version);
                }
                None => {
                    details.required_version = None;
                    details.upgrade_required = false;
                }
            }
        }
        graph.set_last_download(notifier, id, now);
        graph.set_download_status(notifier, id, "synchronize_ok");
        if let Some(homepage) = &params.homepage {
            graph.set_subscription_homepage(notifier, id, homepage);
        }
        if let Some(title) = &params.title {
            graph.set_subscription_title(notifier, id, title);
        }

        let filters = lines[1..]
            .iter()
            .filter_map(|line| {
                let normalized = lk_core::Filter::normalize(line);
                if normalized.is_empty() {
                    None
                } else {
                    Some(graph.filter_from_text(&normalized))
                }
            })
            .collect();
        graph.update_subscription_filters(notifier, id, filters);

        SuccessOutcome::Done
    }

    fn on_download_error(
        &self,
        downloadable: &Downloadable,
        _download_url: &str,
        error: DownloadError,
        _status: Option<u16>,
    ) -> Option<String> {
        let mut graph = self.store.graph.borrow_mut();
        let notifier = &self.store.notifier;
        let id = match graph.subscription_by_url(&downloadable.url) {
            Some(id) => id,
            None => return None,
        };
        graph.set_last_download(notifier, id, now_secs());
        graph.set_download_status(notifier, id, error.code());
        if !downloadable.manual {
            if let Some(details) = graph.subscription_mut(id).downloadable_mut() {
                details.errors += 1;
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::io;
    use std::path::{Path, PathBuf};

    use crate::downloader::DownloadResponse;
    use lk_core::Subscription;

    struct NullBackend;

    impl StorageBackend for NullBackend {
        async fn read(&self, _path: &Path) -> io::Result<String> {
            Err(io::Error::new(io::ErrorKind::NotFound, "missing"))
        }

        async fn write(&self, _path: &Path, _content: &str) -> io::Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct ScriptedClient {
        responses: RefCell<Vec<Result<DownloadResponse, DownloadError>>>,
        requests: RefCell<Vec<String>>,
    }

    impl ScriptedClient {
        fn replying(body: &str) -> Rc<Self> {
            let client = ScriptedClient::default();
            client
                .responses
                .borrow_mut()
                .push(Ok(DownloadResponse { status: 200, body: body.to_string() }));
            Rc::new(client)
        }
    }

    impl DownloadClient for ScriptedClient {
        async fn get(&self, url: &str) -> Result<DownloadResponse, DownloadError> {
            self.requests.borrow_mut().push(url.to_string());
            let mut responses = self.responses.borrow_mut();
            if responses.is_empty() {
                Err(DownloadError::ConnectionError)
            } else {
                responses.remove(0)
            }
        }
    }

    const LIST_URL: &str = "https://list.example.com/l.txt";

    fn setup(
        client: Rc<ScriptedClient>,
        checksum: Option<ChecksumFn>,
    ) -> Synchronizer<NullBackend, ScriptedClient> {
        let store = FilterStore::new(NullBackend, PathBuf::from("patterns.ini"));
        {
            let mut graph = store.graph.borrow_mut();
            graph.add_subscription(&store.notifier, LIST_URL);
        }
        let config = Config { app_version: "1.0".to_string(), ..Config::default() };
        Synchronizer::new(store, client, &config, checksum)
    }

    fn subscription_snapshot(
        synchronizer: &Synchronizer<NullBackend, ScriptedClient>,
        url: &str,
    ) -> Subscription {
        let graph = synchronizer.core.store.graph.borrow();
        let id = graph.subscription_by_url(url).unwrap();
        graph.subscription(id).clone()
    }

    fn filter_texts(
        synchronizer: &Synchronizer<NullBackend, ScriptedClient>,
        url: &str,
    ) -> Vec<String> {
        let graph = synchronizer.core.store.graph.borrow();
        let id = graph.subscription_by_url(url).unwrap();
        graph
            .subscription(id)
            .filters
            .iter()
            .map(|&f| graph.filter(f).text.clone())
            .collect()
    }

    #[tokio::test]
    async fn test_successful_sync_applies_metadata_and_filters() {
        let body = "[Adblock Plus 0.7]\n! Title: Example List\n! Homepage: https://example.com\n! Version: 42\n! Expires: 2h\n||ads.example.com^\nexample.com##.ad\n";
        let client = ScriptedClient::replying(body);
        let synchronizer = setup(client, None);

        synchronizer.downloader.fetch(Downloadable::new(LIST_URL)).await;

        let subscription = subscription_snapshot(&synchronizer, LIST_URL);
        assert_eq!(subscription.title, "Example List");
        assert!(subscription.fixed_title);
        let details = subscription.downloadable().unwrap();
        assert_eq!(details.download_status.as_deref(), Some("synchronize_ok"));
        assert_eq!(details.errors, 0);
        assert_eq!(details.version, 42);
        assert_eq!(details.homepage.as_deref(), Some("https://example.com"));
        assert!(details.soft_expiration <= details.expires);
        // Hard deadline is twice the two-hour interval.
        let interval_secs = 2 * MILLIS_IN_HOUR / MILLIS_IN_SECOND;
        let hard_offset = details.expires - details.last_download;
        assert!(hard_offset >= 2 * interval_secs - 2 && hard_offset <= 2 * interval_secs + 2);
        assert_eq!(details.required_version.as_deref(), Some("0.7"));
        assert!(!details.upgrade_required);

        assert_eq!(
            filter_texts(&synchronizer, LIST_URL),
            vec!["||ads.example.com^", "example.com##.ad"]
        );
    }

    #[tokio::test]
    async fn test_missing_header_is_invalid_data() {
        let client = ScriptedClient::replying("||ads.example.com^\n");
        let synchronizer = setup(client, None);

        synchronizer.downloader.fetch(Downloadable::new(LIST_URL)).await;

        let subscription = subscription_snapshot(&synchronizer, LIST_URL);
        let details = subscription.downloadable().unwrap();
        assert_eq!(details.download_status.as_deref(), Some("synchronize_invalid_data"));
        assert_eq!(details.errors, 1);
        assert!(subscription.filters.is_empty());
    }

    #[tokio::test]
    async fn test_checksum_mismatch_is_terminal() {
        let body = "[Adblock]\n! Checksum: bogus\n||ads.example.com^\n";
        let client = ScriptedClient::replying(body);
        let synchronizer = setup(client, Some(Box::new(|_| "right".to_string())));

        synchronizer.downloader.fetch(Downloadable::new(LIST_URL)).await;

        let subscription = subscription_snapshot(&synchronizer, LIST_URL);
        let details = subscription.downloadable().unwrap();
        assert_eq!(details.download_status.as_deref(), Some("synchronize_checksum_mismatch"));
        assert_eq!(details.errors, 1);
        assert!(subscription.filters.is_empty());
    }

    #[tokio::test]
    async fn test_checksum_match_and_ignored_without_digest() {
        let body = "[Adblock]\n! Checksum: right==\n||ads.example.com^\n";
        let expected = "[Adblock]\n||ads.example.com^";
        let client = ScriptedClient::replying(body);
        let synchronizer = setup(
            client,
            Some(Box::new(move |content: &str| {
                assert_eq!(content, expected);
                "right".to_string()
            })),
        );
        synchronizer.downloader.fetch(Downloadable::new(LIST_URL)).await;
        assert_eq!(filter_texts(&synchronizer, LIST_URL), vec!["||ads.example.com^"]);

        // No digest function: the embedded checksum is ignored.
        let client = ScriptedClient::replying("[Adblock]\n! Checksum: bogus\n##.ad\n");
        let synchronizer = setup(client, None);
        synchronizer.downloader.fetch(Downloadable::new(LIST_URL)).await;
        assert_eq!(filter_texts(&synchronizer, LIST_URL), vec!["##.ad"]);
    }

    #[tokio::test]
    async fn test_redirect_metadata_migrates_subscription() {
        let moved = "https://mirror.example.com/l.txt";
        let client = ScriptedClient::default();
        client.responses.borrow_mut().push(Ok(DownloadResponse {
            status: 200,
            body: format!("[Adblock]\n! Redirect: {moved}\n"),
        }));
        client.responses.borrow_mut().push(Ok(DownloadResponse {
            status: 200,
            body: "[Adblock]\n||ads.example.com^\n".to_string(),
        }));
        let client = Rc::new(client);
        let synchronizer = setup(client.clone(), None);
        {
            let core = &synchronizer.core;
            let mut graph = core.store.graph.borrow_mut();
            let id = graph.subscription_by_url(LIST_URL).unwrap();
            graph.set_subscription_title(&core.store.notifier, id, "Carried Title");
        }

        synchronizer.downloader.fetch(Downloadable::new(LIST_URL)).await;

        assert_eq!(client.requests.borrow().len(), 2);
        assert!(client.requests.borrow()[1].starts_with(moved));
        let graph = synchronizer.core.store.graph.borrow();
        assert!(graph.subscription_by_url(LIST_URL).is_none());
        let id = graph.subscription_by_url(moved).unwrap();
        assert_eq!(graph.subscription(id).title, "Carried Title");
        assert_eq!(graph.subscription(id).filters.len(), 1);
    }

    #[tokio::test]
    async fn test_unlisted_url_is_not_inserted() {
        let client = ScriptedClient::replying("[Adblock]\n##.ad\n");
        let synchronizer = setup(client, None);

        let stray = "https://stray.example.com/l.txt";
        synchronizer.downloader.fetch(Downloadable::new(stray)).await;

        let graph = synchronizer.core.store.graph.borrow();
        assert!(graph.subscription_by_url(stray).is_none());
        assert_eq!(graph.listed_subscriptions().count(), 1);
    }

    #[tokio::test]
    async fn test_manual_download_errors_exempt() {
        let client = Rc::new(ScriptedClient::default());
        let synchronizer = setup(client, None);

        let mut downloadable = Downloadable::new(LIST_URL);
        downloadable.manual = true;
        synchronizer.downloader.fetch(downloadable).await;

        let subscription = subscription_snapshot(&synchronizer, LIST_URL);
        let details = subscription.downloadable().unwrap();
        assert_eq!(details.download_status.as_deref(), Some("synchronize_connection_error"));
        assert_eq!(details.errors, 0);
        assert!(details.last_download > 0);
    }

    #[tokio::test]
    async fn test_autoupdate_gate() {
        let store = FilterStore::new(NullBackend, PathBuf::from("patterns.ini"));
        {
            let mut graph = store.graph.borrow_mut();
            graph.add_subscription(&store.notifier, LIST_URL);
        }
        let config = Config { subscriptions_autoupdate: false, ..Config::default() };
        let synchronizer =
            Synchronizer::new(store, Rc::new(ScriptedClient::default()), &config, None);
        assert!(synchronizer.core.downloadables().is_empty());
    }

    #[test]
    fn test_header_and_expiration_parsing() {
        assert_eq!(parse_header("[Adblock]"), Some(None));
        assert_eq!(parse_header(" [adblock plus 2.0] "), Some(Some("2.0".to_string())));
        assert_eq!(parse_header("[Adblock Plus]"), Some(None));
        assert_eq!(parse_header("[Something Else]"), None);
        assert_eq!(parse_header("||ads.example.com^"), None);

        assert_eq!(parse_expiration("5"), Some(5 * MILLIS_IN_DAY));
        assert_eq!(parse_expiration("12 h"), Some(12 * MILLIS_IN_HOUR));
        assert_eq!(parse_expiration("3 hours"), Some(3 * MILLIS_IN_HOUR));
        assert_eq!(parse_expiration("soon"), None);

        assert!(version_number("2.1") > version_number("1.9.9"));
        assert_eq!(version_number("1.2.3"), 1.2);
    }
}

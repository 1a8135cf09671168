//! Application update checks
//!
//! Periodically fetches a JSON manifest describing the latest released
//! version per application and remembers the download URL when a newer
//! version is available. Scheduling state lives in the runtime
//! configuration so checks survive restarts.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use log::{debug, warn};
use serde::Deserialize;

use crate::config::Config;
use crate::downloader::{
    now_millis, DownloadClient, DownloadError, DownloadHandler, Downloadable, Downloader,
    DownloaderConfig, SuccessOutcome, MILLIS_IN_HOUR,
};

pub const INITIAL_DELAY: Duration = Duration::from_millis(MILLIS_IN_HOUR / 10);
pub const CHECK_INTERVAL: Duration = Duration::from_millis(MILLIS_IN_HOUR);
pub const EXPIRATION_INTERVAL: u64 = 24 * MILLIS_IN_HOUR;

/// `%TYPE%` value for scheduled checks.
const TYPE_AUTOMATIC: &str = "0";
/// `%TYPE%` value for user-requested checks.
const TYPE_MANUAL: &str = "1";

/// Scheduling state persisted in the configuration file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateState {
    pub last_error: u64,
    pub last_check: u64,
    pub soft_expiration: u64,
    pub hard_expiration: u64,
}

impl UpdateState {
    pub fn from_config(config: &Config) -> Self {
        UpdateState {
            last_error: config.update_last_error,
            last_check: config.update_last_check,
            soft_expiration: config.update_soft_expiration,
            hard_expiration: config.update_hard_expiration,
        }
    }

    pub fn apply_to(&self, config: &mut Config) {
        config.update_last_error = self.last_error;
        config.update_last_check = self.last_check;
        config.update_soft_expiration = self.soft_expiration;
        config.update_hard_expiration = self.hard_expiration;
    }
}

/// One application's entry in the update manifest.
#[derive(Debug, Clone, Deserialize)]
struct ManifestEntry {
    version: String,
    url: String,
}

/// Leading numeric prefix of a dotted version string.
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

/// Handler state shared with the download engine.
pub struct UpdateCore {
    app: String,
    app_version: String,
    update_url: String,
    manual: Cell<bool>,
    state: RefCell<UpdateState>,
    available: RefCell<Option<String>>,
    downloader_config: DownloaderConfig,
}

impl UpdateCore {
    fn check_url(&self) -> String {
        let kind = if self.manual.get() { TYPE_MANUAL } else { TYPE_AUTOMATIC };
        self.update_url.replace("%TYPE%", kind)
    }
}

pub struct Updater<C: DownloadClient> {
    core: Rc<UpdateCore>,
    downloader: Downloader<C, UpdateCore>,
}

impl<C: DownloadClient> Updater<C> {
    pub fn new(client: Rc<C>, config: &Config) -> Self {
        let downloader_config =
            DownloaderConfig::new(INITIAL_DELAY, CHECK_INTERVAL, &config.app, &config.app_version);
        let core = Rc::new(UpdateCore {
            app: config.app.clone(),
            app_version: config.app_version.clone(),
            update_url: config.update_url.clone(),
            manual: Cell::new(false),
            state: RefCell::new(UpdateState::from_config(config)),
            available: RefCell::new(None),
            downloader_config: downloader_config.clone(),
        });
        let downloader = Downloader::new(client, core.clone(), downloader_config);
        Updater { core, downloader }
    }

    /// Download URL of a newer version, when the last check found one.
    pub fn update_available(&self) -> Option<String> {
        self.core.available.borrow().clone()
    }

    /// Current scheduling state, for writing back to the configuration.
    pub fn state(&self) -> UpdateState {
        *self.core.state.borrow()
    }

    /// The periodic check loop.
    pub async fn run(&self)
    where
        C: 'static,
    {
        if self.core.update_url.is_empty() {
            debug!("no update URL configured, skipping update checks");
            return;
        }
        self.downloader.run().await
    }

    /// One immediate check. Manual checks are announced as such to the
    /// manifest server and skip error bookkeeping.
    pub async fn check(&self, manual: bool) {
        if self.core.update_url.is_empty() {
            return;
        }
        self.core.manual.set(manual);
        let mut downloadable = Downloadable::new(&self.core.check_url());
        downloadable.manual = manual;
        self.downloader.fetch(downloadable).await;
        self.core.manual.set(false);
    }
}

impl DownloadHandler for UpdateCore {
    fn downloadables(&self) -> Vec<Downloadable> {
        if self.update_url.is_empty() {
            return Vec::new();
        }
        let state = self.state.borrow();
        let mut downloadable = Downloadable::new(&self.check_url());
        downloadable.last_error = state.last_error;
        downloadable.last_check = state.last_check;
        downloadable.soft_expiration = state.soft_expiration;
        downloadable.hard_expiration = state.hard_expiration;
        vec![downloadable]
    }

    fn on_expiration_change(&self, downloadable: &Downloadable) {
        let mut state = self.state.borrow_mut();
        state.last_check = downloadable.last_check;
        state.soft_expiration = downloadable.soft_expiration;
        state.hard_expiration = downloadable.hard_expiration;
    }

    fn on_download_success(&self, _downloadable: &Downloadable, body: &str) -> SuccessOutcome {
        let manifest: HashMap<String, ManifestEntry> = match serde_json::from_str(body) {
            Ok(manifest) => manifest,
            Err(err) => {
                warn!("malformed update manifest: {err}");
                return SuccessOutcome::Failed(DownloadError::InvalidData);
            }
        };

        if let Some(entry) = manifest.get(&self.app) {
            if version_number(&entry.version) > version_number(&self.app_version) {
                *self.available.borrow_mut() = Some(entry.url.clone());
            }
        }

        let (soft, hard) = self
            .downloader_config
            .process_expiration_interval(now_millis(), EXPIRATION_INTERVAL);
        let mut state = self.state.borrow_mut();
        state.last_error = 0;
        state.soft_expiration = soft;
        state.hard_expiration = hard;
        SuccessOutcome::Done
    }

    fn on_download_error(
        &self,
        downloadable: &Downloadable,
        _download_url: &str,
        error: DownloadError,
        _status: Option<u16>,
    ) -> Option<String> {
        warn!("update check failed: {}", error.code());
        if !downloadable.manual {
            self.state.borrow_mut().last_error = now_millis();
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::DownloadResponse;

    #[derive(Default)]
    struct ManifestClient {
        body: RefCell<Option<String>>,
        requests: RefCell<Vec<String>>,
    }

    impl DownloadClient for ManifestClient {
        async fn get(&self, url: &str) -> Result<DownloadResponse, DownloadError> {
            self.requests.borrow_mut().push(url.to_string());
            match self.body.borrow().clone() {
                Some(body) => Ok(DownloadResponse { status: 200, body }),
                None => Err(DownloadError::ConnectionError),
            }
        }
    }

    fn config() -> Config {
        Config {
            app: "listkeeper".to_string(),
            app_version: "1.0".to_string(),
            update_url: "https://update.example.com/manifest.json?type=%TYPE%".to_string(),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_newer_version_is_reported() {
        let client = Rc::new(ManifestClient::default());
        *client.body.borrow_mut() = Some(
            r#"{"listkeeper": {"version": "1.1", "url": "https://example.com/lk-1.1.tar.gz"},
                "other": {"version": "9.9", "url": "https://example.com/other"}}"#
                .to_string(),
        );
        let updater = Updater::new(client.clone(), &config());

        updater.check(false).await;

        assert_eq!(
            updater.update_available().as_deref(),
            Some("https://example.com/lk-1.1.tar.gz")
        );
        assert!(client.requests.borrow()[0].contains("type=0"));
        let state = updater.state();
        assert_eq!(state.last_error, 0);
        assert!(state.soft_expiration <= state.hard_expiration);
        assert!(state.hard_expiration >= now_millis() + 2 * EXPIRATION_INTERVAL - 1000);
    }

    #[tokio::test]
    async fn test_current_version_reports_nothing() {
        let client = Rc::new(ManifestClient::default());
        *client.body.borrow_mut() =
            Some(r#"{"listkeeper": {"version": "1.0", "url": "https://example.com/lk"}}"#.to_string());
        let updater = Updater::new(client, &config());

        updater.check(false).await;
        assert!(updater.update_available().is_none());

        // Unknown application key means no update either.
        let client = Rc::new(ManifestClient::default());
        *client.body.borrow_mut() = Some(r#"{"other": {"version": "9.9", "url": "u"}}"#.to_string());
        let updater = Updater::new(client, &config());
        updater.check(false).await;
        assert!(updater.update_available().is_none());
    }

    #[tokio::test]
    async fn test_manual_check_type_and_error_exemption() {
        let client = Rc::new(ManifestClient::default());
        let updater = Updater::new(client.clone(), &config());

        updater.check(true).await;
        assert!(client.requests.borrow()[0].contains("type=1"));
        // Connection failure on a manual check leaves the backoff alone.
        assert_eq!(updater.state().last_error, 0);

        updater.check(false).await;
        assert!(client.requests.borrow()[1].contains("type=0"));
        assert!(updater.state().last_error > 0);
    }

    #[tokio::test]
    async fn test_malformed_manifest_is_invalid_data() {
        let client = Rc::new(ManifestClient::default());
        *client.body.borrow_mut() = Some("not json".to_string());
        let updater = Updater::new(client, &config());

        updater.check(false).await;
        assert!(updater.update_available().is_none());
        assert!(updater.state().last_error > 0);
    }

    #[test]
    fn test_state_config_round_trip() {
        let mut config = config();
        let state = UpdateState {
            last_error: 1,
            last_check: 2,
            soft_expiration: 3,
            hard_expiration: 4,
        };
        state.apply_to(&mut config);
        assert_eq!(UpdateState::from_config(&config), state);
    }

    #[tokio::test]
    async fn test_no_update_url_disables_checks() {
        let client = Rc::new(ManifestClient::default());
        let config = Config { update_url: String::new(), ..config() };
        let updater = Updater::new(client.clone(), &config);
        updater.check(false).await;
        assert!(client.requests.borrow().is_empty());
        assert!(updater.core.downloadables().is_empty());
    }
}

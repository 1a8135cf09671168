//! Subscription data model
//!
//! A subscription is a named, ordered collection of filters, identified by
//! its URL. Special subscriptions (synthetic `~` URLs) hold user-authored
//! filters and can be tagged as the default destination for a filter kind;
//! downloadable subscriptions track the full refresh state machine.

use std::collections::HashMap;

use crate::filter::{Filter, FilterKind};
use crate::storage::FilterId;

// =============================================================================
// Default Group Tags
// =============================================================================

/// Filter kinds a special subscription can claim as its default content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultTag {
    Blocking,
    Whitelist,
    ElemHide,
}

impl DefaultTag {
    pub fn from_name(name: &str) -> Option<DefaultTag> {
        match name {
            "blocking" => Some(DefaultTag::Blocking),
            "whitelist" => Some(DefaultTag::Whitelist),
            "elemhide" => Some(DefaultTag::ElemHide),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DefaultTag::Blocking => "blocking",
            DefaultTag::Whitelist => "whitelist",
            DefaultTag::ElemHide => "elemhide",
        }
    }

    /// The tag a filter would be classified under, if any.
    pub fn for_filter(filter: &Filter) -> Option<DefaultTag> {
        match &filter.kind {
            FilterKind::Blocking(_) => Some(DefaultTag::Blocking),
            FilterKind::Whitelist(_) => Some(DefaultTag::Whitelist),
            FilterKind::ElemHide(_) | FilterKind::ElemHideException(_) => {
                Some(DefaultTag::ElemHide)
            }
            _ => None,
        }
    }

    /// Whether a filter belongs under this tag. The blocking group also
    /// takes comments and invalid rules so they always have a home.
    pub fn accepts(&self, filter: &Filter) -> bool {
        match DefaultTag::for_filter(filter) {
            Some(tag) => tag == *self,
            None => *self == DefaultTag::Blocking,
        }
    }
}

// =============================================================================
// Subscription Variants
// =============================================================================

/// Refresh state of a remotely hosted subscription. All timestamps are
/// seconds since the epoch; zero means never.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadableDetails {
    pub homepage: Option<String>,
    pub last_download: u64,
    /// Classification string of the last download attempt, e.g.
    /// `synchronize_ok` or `synchronize_connection_error`.
    pub download_status: Option<String>,
    pub last_success: u64,
    pub last_check: u64,
    /// Hard expiration deadline.
    pub expires: u64,
    pub soft_expiration: u64,
    /// Consecutive failed downloads.
    pub errors: u32,
    pub version: u64,
    pub required_version: Option<String>,
    pub upgrade_required: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionKind {
    /// User-authored filter group with an optional default-tag set.
    Special { defaults: Vec<DefaultTag> },
    /// Remote list refreshed by the synchronizer.
    Downloadable(DownloadableDetails),
    /// Managed by an external party; never serialized.
    External,
}

/// A named, ordered collection of filters, identified by URL.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub url: String,
    pub title: String,
    pub fixed_title: bool,
    pub disabled: bool,
    /// Ordered filter list; duplicates are permitted.
    pub filters: Vec<FilterId>,
    pub kind: SubscriptionKind,
}

/// Synthetic URL for a fresh user filter group.
pub fn user_group_url(n: u32) -> String {
    format!("~user~{n}")
}

impl Subscription {
    /// Create a subscription for a URL: synthetic URLs (empty or starting
    /// with `~`) become special groups, everything else a downloadable list.
    pub fn from_url(url: &str) -> Subscription {
        let kind = if url.is_empty() || url.starts_with('~') {
            SubscriptionKind::Special { defaults: Vec::new() }
        } else {
            SubscriptionKind::Downloadable(DownloadableDetails::default())
        };
        Subscription {
            url: url.to_string(),
            title: url.to_string(),
            fixed_title: false,
            disabled: false,
            filters: Vec::new(),
            kind,
        }
    }

    pub fn is_special(&self) -> bool {
        matches!(self.kind, SubscriptionKind::Special { .. })
    }

    pub fn downloadable(&self) -> Option<&DownloadableDetails> {
        match &self.kind {
            SubscriptionKind::Downloadable(details) => Some(details),
            _ => None,
        }
    }

    pub fn downloadable_mut(&mut self) -> Option<&mut DownloadableDetails> {
        match &mut self.kind {
            SubscriptionKind::Downloadable(details) => Some(details),
            _ => None,
        }
    }

    /// Whether newly created user filters of this kind should land here.
    /// Only tagged special groups ever claim a filter.
    pub fn is_default_for(&self, filter: &Filter) -> bool {
        match &self.kind {
            SubscriptionKind::Special { defaults } => {
                defaults.iter().any(|tag| tag.accepts(filter))
            }
            _ => false,
        }
    }

    // =========================================================================
    // Serialization
    // =========================================================================

    /// Append the `[Subscription]` block for this subscription. External
    /// subscriptions are the caller's responsibility to skip.
    pub fn serialize(&self, out: &mut Vec<String>) {
        out.push("[Subscription]".to_string());
        out.push(format!("url={}", self.url));
        out.push(format!("title={}", self.title));
        if self.fixed_title {
            out.push("fixedTitle=true".to_string());
        }
        if self.disabled {
            out.push("disabled=true".to_string());
        }
        match &self.kind {
            SubscriptionKind::Special { defaults } => {
                if !defaults.is_empty() {
                    let names: Vec<&str> = defaults.iter().map(|t| t.name()).collect();
                    out.push(format!("defaults={}", names.join(" ")));
                }
            }
            SubscriptionKind::Downloadable(d) => {
                if let Some(homepage) = &d.homepage {
                    out.push(format!("homepage={homepage}"));
                }
                if d.last_download != 0 {
                    out.push(format!("lastDownload={}", d.last_download));
                }
                if let Some(status) = &d.download_status {
                    out.push(format!("downloadStatus={status}"));
                }
                if d.last_success != 0 {
                    out.push(format!("lastSuccess={}", d.last_success));
                }
                if d.last_check != 0 {
                    out.push(format!("lastCheck={}", d.last_check));
                }
                if d.expires != 0 {
                    out.push(format!("expires={}", d.expires));
                }
                if d.soft_expiration != 0 {
                    out.push(format!("softExpiration={}", d.soft_expiration));
                }
                if d.errors != 0 {
                    out.push(format!("errors={}", d.errors));
                }
                if d.version != 0 {
                    out.push(format!("version={}", d.version));
                }
                if let Some(required) = &d.required_version {
                    out.push(format!("requiredVersion={required}"));
                }
            }
            SubscriptionKind::External => {}
        }
    }

    /// Rebuild a subscription from a parsed property block. Returns `None`
    /// when the block carries no URL.
    pub fn from_properties(props: &HashMap<String, String>) -> Option<Subscription> {
        let url = props.get("url")?.clone();
        let mut subscription = Subscription::from_url(&url);

        if subscription.is_special() {
            // Legacy fixed groups predate the defaults key.
            let defaults_text = props.get("defaults").cloned().or(match url.as_str() {
                "~fl~" => Some("blocking".to_string()),
                "~wl~" => Some("whitelist".to_string()),
                "~eh~" => Some("elemhide".to_string()),
                _ => None,
            });
            if let Some(text) = &defaults_text {
                let defaults = text
                    .split_whitespace()
                    .filter_map(DefaultTag::from_name)
                    .collect();
                subscription.kind = SubscriptionKind::Special { defaults };
            }
            if let Some(text) = defaults_text {
                subscription.title = format!("{text} filters");
            }
        } else if let Some(d) = subscription.downloadable_mut() {
            d.homepage = props.get("homepage").cloned();
            d.last_download = parse_number(props, "lastDownload");
            d.download_status = props.get("downloadStatus").cloned();
            d.last_success = parse_number(props, "lastSuccess");
            d.last_check = parse_number(props, "lastCheck");
            d.expires = parse_number(props, "expires");
            d.soft_expiration = parse_number(props, "softExpiration");
            d.errors = parse_number(props, "errors") as u32;
            d.version = parse_number(props, "version");
            d.required_version = props.get("requiredVersion").cloned();
        }

        if let Some(title) = props.get("title") {
            subscription.title = title.clone();
        }
        subscription.fixed_title = props.get("fixedTitle").map(String::as_str) == Some("true");
        subscription.disabled = props.get("disabled").map(String::as_str) == Some("true");
        Some(subscription)
    }
}

fn parse_number(props: &HashMap<String, String>, key: &str) -> u64 {
    props
        .get(key)
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_from_url_kinds() {
        assert!(Subscription::from_url("~user~12345").is_special());
        assert!(Subscription::from_url("").is_special());
        let remote = Subscription::from_url("https://list.example.com/easylist.txt");
        assert!(remote.downloadable().is_some());
        assert_eq!(remote.title, remote.url);
    }

    #[test]
    fn test_is_default_for() {
        let group = Subscription {
            kind: SubscriptionKind::Special { defaults: vec![DefaultTag::Blocking] },
            ..Subscription::from_url("~user~1")
        };
        assert!(group.is_default_for(&Filter::from_text("||ads.example.com^")));
        // Comments fall back to the blocking group.
        assert!(group.is_default_for(&Filter::from_text("! note")));
        assert!(!group.is_default_for(&Filter::from_text("example.com##.ad")));

        let untagged = Subscription::from_url("~user~2");
        assert!(!untagged.is_default_for(&Filter::from_text("||ads.example.com^")));
    }

    #[test]
    fn test_serialize_downloadable_round_trip() {
        let mut subscription = Subscription::from_url("https://list.example.com/l.txt");
        subscription.title = "Example List".to_string();
        subscription.disabled = true;
        {
            let d = subscription.downloadable_mut().unwrap();
            d.homepage = Some("https://example.com".to_string());
            d.last_download = 1000;
            d.download_status = Some("synchronize_ok".to_string());
            d.expires = 2000;
            d.soft_expiration = 1500;
            d.errors = 3;
            d.version = 42;
        }

        let mut lines = Vec::new();
        subscription.serialize(&mut lines);
        assert_eq!(lines[0], "[Subscription]");

        let parsed: HashMap<String, String> = lines[1..]
            .iter()
            .map(|line| {
                let (k, v) = line.split_once('=').unwrap();
                (k.to_string(), v.to_string())
            })
            .collect();
        let restored = Subscription::from_properties(&parsed).unwrap();
        assert_eq!(restored.title, "Example List");
        assert!(restored.disabled);
        assert_eq!(restored.downloadable(), subscription.downloadable());
    }

    #[test]
    fn test_legacy_group_urls() {
        let subscription = Subscription::from_properties(&props(&[("url", "~wl~")])).unwrap();
        match &subscription.kind {
            SubscriptionKind::Special { defaults } => {
                assert_eq!(defaults, &vec![DefaultTag::Whitelist]);
            }
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn test_defaults_unknown_tags_dropped() {
        let subscription = Subscription::from_properties(&props(&[
            ("url", "~user~9"),
            ("defaults", "blocking bogus elemhide"),
        ]))
        .unwrap();
        match &subscription.kind {
            SubscriptionKind::Special { defaults } => {
                assert_eq!(defaults, &vec![DefaultTag::Blocking, DefaultTag::ElemHide]);
            }
            other => panic!("unexpected kind: {other:?}"),
        }
    }
}

//! Filter & subscription graph with text persistence
//!
//! The graph owns every filter and subscription in the process. Filters are
//! interned in an append-only arena keyed by normalized text, subscriptions
//! in an arena keyed by URL plus a display order. All mutations go through
//! graph methods, which publish change events after applying them.
//!
//! Persistence is a line-oriented INI-like format (`version=5`), written
//! atomically as one string and parsed forward/backward tolerantly.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use log::{error, warn};
use rand::Rng;

use crate::error::StorageError;
use crate::filter::Filter;
use crate::notifier::{FilterNotifier, StorageEvent};
use crate::subscription::{user_group_url, DefaultTag, Subscription, SubscriptionKind};

pub const FORMAT_VERSION: u32 = 5;
const FILE_HEADER: &str = "# listkeeper preferences";

/// Handle to an interned filter. Stable for the life of the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FilterId(pub u32);

/// Handle to a subscription arena entry. Stays valid after the
/// subscription is removed from the listing so that event payloads can
/// still be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u32);

// =============================================================================
// Graph
// =============================================================================

/// The authoritative filter/subscription entity graph.
#[derive(Debug, Default)]
pub struct FilterGraph {
    filters: Vec<Filter>,
    filter_ids: HashMap<String, FilterId>,
    subscriptions: Vec<Subscription>,
    subscription_ids: HashMap<String, SubscriptionId>,
    /// Display order; only subscriptions listed here are part of the graph.
    order: Vec<SubscriptionId>,
    /// Whether hit statistics are collected and persisted.
    pub save_stats: bool,
}

impl FilterGraph {
    pub fn new() -> Self {
        FilterGraph::default()
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    pub fn filter(&self, id: FilterId) -> &Filter {
        &self.filters[id.0 as usize]
    }

    pub fn filter_mut(&mut self, id: FilterId) -> &mut Filter {
        &mut self.filters[id.0 as usize]
    }

    pub fn subscription(&self, id: SubscriptionId) -> &Subscription {
        &self.subscriptions[id.0 as usize]
    }

    pub fn subscription_mut(&mut self, id: SubscriptionId) -> &mut Subscription {
        &mut self.subscriptions[id.0 as usize]
    }

    pub fn subscription_by_url(&self, url: &str) -> Option<SubscriptionId> {
        self.subscription_ids.get(url).copied()
    }

    /// Subscriptions currently part of the graph, in display order.
    pub fn listed_subscriptions(&self) -> impl Iterator<Item = SubscriptionId> + '_ {
        self.order.iter().copied()
    }

    pub fn is_listed(&self, id: SubscriptionId) -> bool {
        self.order.contains(&id)
    }

    /// Whether the filter is reachable from at least one enabled listed
    /// subscription. The reconciler's activation criterion.
    pub fn filter_reachable(&self, id: FilterId) -> bool {
        self.filter(id)
            .subscriptions
            .iter()
            .any(|&sub| self.is_listed(sub) && !self.subscription(sub).disabled)
    }

    // =========================================================================
    // Interning
    // =========================================================================

    /// Resolve rule text to its unique filter, creating it on first use.
    /// Equal normalized text always yields the same ID.
    pub fn filter_from_text(&mut self, text: &str) -> FilterId {
        let normalized = Filter::normalize(text);
        if let Some(&id) = self.filter_ids.get(&normalized) {
            return id;
        }
        let id = FilterId(self.filters.len() as u32);
        self.filters.push(Filter::from_text(&normalized));
        self.filter_ids.insert(normalized, id);
        id
    }

    fn intern_subscription(&mut self, subscription: Subscription) -> SubscriptionId {
        let id = SubscriptionId(self.subscriptions.len() as u32);
        self.subscription_ids.insert(subscription.url.clone(), id);
        self.subscriptions.push(subscription);
        id
    }

    // =========================================================================
    // Subscription Mutations
    // =========================================================================

    /// Add a subscription for a URL. No-op (returns the existing ID) when
    /// the URL is already known.
    pub fn add_subscription(&mut self, notifier: &FilterNotifier, url: &str) -> SubscriptionId {
        if let Some(&id) = self.subscription_ids.get(url) {
            return id;
        }
        self.insert_subscription(notifier, Subscription::from_url(url))
            .unwrap_or_else(|| self.subscription_ids[url])
    }

    /// Insert a fully formed subscription. Returns `None` without publishing
    /// when its URL is already known.
    pub fn insert_subscription(
        &mut self,
        notifier: &FilterNotifier,
        subscription: Subscription,
    ) -> Option<SubscriptionId> {
        if self.subscription_ids.contains_key(&subscription.url) {
            return None;
        }
        let filters = subscription.filters.clone();
        let id = self.intern_subscription(subscription);
        for filter in filters {
            let backrefs = &mut self.filter_mut(filter).subscriptions;
            if !backrefs.contains(&id) {
                backrefs.push(id);
            }
        }
        self.order.push(id);
        notifier.publish(self, &StorageEvent::SubscriptionAdded { subscription: id });
        Some(id)
    }

    /// Remove a subscription from the graph. No-op when the URL is unknown.
    pub fn remove_subscription(&mut self, notifier: &FilterNotifier, url: &str) {
        let id = match self.subscription_ids.get(url) {
            Some(&id) if self.is_listed(id) => id,
            _ => return,
        };
        let filters = self.subscription(id).filters.clone();
        for filter in filters {
            self.filter_mut(filter).subscriptions.retain(|&s| s != id);
        }
        self.order.retain(|&s| s != id);
        self.subscription_ids.remove(url);
        notifier.publish(self, &StorageEvent::SubscriptionRemoved { subscription: id });
    }

    /// Reposition a subscription in the display order; out-of-range targets
    /// are clamped.
    pub fn move_subscription(
        &mut self,
        notifier: &FilterNotifier,
        id: SubscriptionId,
        position: usize,
    ) {
        let current = match self.order.iter().position(|&s| s == id) {
            Some(index) => index,
            None => return,
        };
        let target = position.min(self.order.len() - 1);
        if target == current {
            return;
        }
        self.order.remove(current);
        self.order.insert(target, id);
        notifier.publish(self, &StorageEvent::SubscriptionMoved { subscription: id });
    }

    /// Atomically replace a subscription's filter list. Used by the
    /// synchronizer after a successful fetch.
    pub fn update_subscription_filters(
        &mut self,
        notifier: &FilterNotifier,
        id: SubscriptionId,
        new_filters: Vec<FilterId>,
    ) {
        let old_filters = std::mem::take(&mut self.subscription_mut(id).filters);
        for &filter in &old_filters {
            self.filter_mut(filter).subscriptions.retain(|&s| s != id);
        }
        for &filter in &new_filters {
            let backrefs = &mut self.filter_mut(filter).subscriptions;
            if !backrefs.contains(&id) {
                backrefs.push(id);
            }
        }
        self.subscription_mut(id).filters = new_filters;
        notifier.publish(
            self,
            &StorageEvent::SubscriptionUpdated { subscription: id, old_filters },
        );
    }

    // =========================================================================
    // Filter Mutations
    // =========================================================================

    /// Find the group a user filter should be added to: the first enabled
    /// special subscription claiming the filter's kind, else the first
    /// enabled untagged special subscription.
    fn default_group_for(&self, filter: FilterId) -> Option<SubscriptionId> {
        let filter = self.filter(filter);
        let mut general = None;
        for &id in &self.order {
            let subscription = self.subscription(id);
            if subscription.disabled {
                continue;
            }
            match &subscription.kind {
                SubscriptionKind::Special { defaults } => {
                    if subscription.is_default_for(filter) {
                        return Some(id);
                    }
                    if general.is_none() && defaults.is_empty() {
                        general = Some(id);
                    }
                }
                _ => {}
            }
        }
        general
    }

    fn create_group_for(&mut self, filter: FilterId) -> SubscriptionId {
        let mut rng = rand::thread_rng();
        let url = loop {
            let candidate = user_group_url(rng.gen_range(0..1_000_000));
            if !self.subscription_ids.contains_key(&candidate) {
                break candidate;
            }
        };
        let tag = DefaultTag::for_filter(self.filter(filter)).unwrap_or(DefaultTag::Blocking);
        let mut subscription = Subscription::from_url(&url);
        subscription.kind = SubscriptionKind::Special { defaults: vec![tag] };
        subscription.title = format!("{} filters", tag.name());
        let id = self.intern_subscription(subscription);
        self.order.push(id);
        id
    }

    fn attach_filter(&mut self, filter: FilterId, subscription: SubscriptionId, position: usize) {
        let backrefs = &mut self.filter_mut(filter).subscriptions;
        if !backrefs.contains(&subscription) {
            backrefs.push(subscription);
        }
        self.subscription_mut(subscription).filters.insert(position, filter);
    }

    /// Attach a filter to its default group without publishing. Used while
    /// rebuilding the graph from disk.
    fn attach_filter_silent(&mut self, filter: FilterId) {
        if self
            .filter(filter)
            .subscriptions
            .iter()
            .any(|&s| self.subscription(s).is_special() && !self.subscription(s).disabled)
        {
            return;
        }
        let group = match self.default_group_for(filter) {
            Some(group) => group,
            None => self.create_group_for(filter),
        };
        let position = self.subscription(group).filters.len();
        self.attach_filter(filter, group, position);
    }

    /// Add a filter to a subscription, or to its default group when none is
    /// given. A filter already housed in an enabled special subscription is
    /// never duplicated into another group.
    pub fn add_filter(
        &mut self,
        notifier: &FilterNotifier,
        filter: FilterId,
        subscription: Option<SubscriptionId>,
        position: Option<usize>,
    ) {
        let subscription = match subscription {
            Some(id) => id,
            None => {
                let already_housed = self
                    .filter(filter)
                    .subscriptions
                    .iter()
                    .any(|&s| self.subscription(s).is_special() && !self.subscription(s).disabled);
                if already_housed {
                    return;
                }
                match self.default_group_for(filter) {
                    Some(group) => group,
                    None => {
                        let group = self.create_group_for(filter);
                        self.attach_filter(filter, group, 0);
                        notifier.publish(
                            self,
                            &StorageEvent::FilterAdded {
                                filter,
                                subscription: group,
                                position: 0,
                            },
                        );
                        return;
                    }
                }
            }
        };
        let len = self.subscription(subscription).filters.len();
        let position = position.unwrap_or(len).min(len);
        self.attach_filter(filter, subscription, position);
        notifier.publish(
            self,
            &StorageEvent::FilterAdded { filter, subscription, position },
        );
    }

    /// Remove one occurrence (given a position) or all occurrences of a
    /// filter, from one subscription or from every subscription containing
    /// it. One event is published per removed occurrence.
    pub fn remove_filter(
        &mut self,
        notifier: &FilterNotifier,
        filter: FilterId,
        subscription: Option<SubscriptionId>,
        position: Option<usize>,
    ) {
        let targets: Vec<SubscriptionId> = match subscription {
            Some(id) => vec![id],
            None => self.filter(filter).subscriptions.clone(),
        };
        for target in targets {
            let positions: Vec<usize> = match position {
                Some(p) => vec![p],
                None => self
                    .subscription(target)
                    .filters
                    .iter()
                    .enumerate()
                    .filter(|(_, &f)| f == filter)
                    .map(|(i, _)| i)
                    .collect(),
            };
            // Back to front so earlier positions stay valid.
            for &p in positions.iter().rev() {
                if self.subscription(target).filters.get(p) != Some(&filter) {
                    continue;
                }
                self.subscription_mut(target).filters.remove(p);
                if !self.subscription(target).filters.contains(&filter) {
                    self.filter_mut(filter).subscriptions.retain(|&s| s != target);
                }
                notifier.publish(
                    self,
                    &StorageEvent::FilterRemoved { filter, subscription: target, position: p },
                );
            }
        }
    }

    /// Reposition a filter inside a subscription's list; out-of-range
    /// targets are clamped.
    pub fn move_filter(
        &mut self,
        notifier: &FilterNotifier,
        filter: FilterId,
        subscription: SubscriptionId,
        from: usize,
        to: usize,
    ) {
        let filters = &self.subscription(subscription).filters;
        if filters.get(from) != Some(&filter) {
            return;
        }
        let to = to.min(filters.len() - 1);
        if to == from {
            return;
        }
        let filters = &mut self.subscription_mut(subscription).filters;
        filters.remove(from);
        filters.insert(to, filter);
        notifier.publish(
            self,
            &StorageEvent::FilterMoved { filter, subscription, from, to },
        );
    }

    // =========================================================================
    // Statistics
    // =========================================================================

    /// Record a hit at `now` (seconds since epoch). Gated on the
    /// statistics policy flag.
    pub fn increase_hit_count(&mut self, notifier: &FilterNotifier, filter: FilterId, now: u64) {
        if !self.save_stats {
            return;
        }
        {
            let entry = self.filter_mut(filter);
            entry.hit_count += 1;
            entry.last_hit = now;
        }
        notifier.publish(self, &StorageEvent::FilterHitCount { filter });
        notifier.publish(self, &StorageEvent::FilterLastHit { filter });
    }

    /// Reset hit statistics for the given filters, or for all of them.
    pub fn reset_hit_counts(&mut self, notifier: &FilterNotifier, filters: Option<&[FilterId]>) {
        let targets: Vec<FilterId> = match filters {
            Some(ids) => ids.to_vec(),
            None => (0..self.filters.len() as u32).map(FilterId).collect(),
        };
        for filter in targets {
            let entry = self.filter_mut(filter);
            if entry.hit_count == 0 && entry.last_hit == 0 {
                continue;
            }
            entry.hit_count = 0;
            entry.last_hit = 0;
            notifier.publish(self, &StorageEvent::FilterHitCount { filter });
            notifier.publish(self, &StorageEvent::FilterLastHit { filter });
        }
    }

    // =========================================================================
    // Evented Setters
    // =========================================================================

    pub fn set_filter_disabled(&mut self, notifier: &FilterNotifier, id: FilterId, disabled: bool) {
        let old = self.filter(id).disabled;
        if old == disabled {
            return;
        }
        self.filter_mut(id).disabled = disabled;
        notifier.publish(self, &StorageEvent::FilterDisabled { filter: id, old });
    }

    pub fn set_subscription_disabled(
        &mut self,
        notifier: &FilterNotifier,
        id: SubscriptionId,
        disabled: bool,
    ) {
        let old = self.subscription(id).disabled;
        if old == disabled {
            return;
        }
        self.subscription_mut(id).disabled = disabled;
        notifier.publish(self, &StorageEvent::SubscriptionDisabled { subscription: id, old });
    }

    pub fn set_subscription_title(
        &mut self,
        notifier: &FilterNotifier,
        id: SubscriptionId,
        title: &str,
    ) {
        if self.subscription(id).title == title {
            return;
        }
        self.subscription_mut(id).title = title.to_string();
        notifier.publish(self, &StorageEvent::SubscriptionTitle { subscription: id });
    }

    pub fn set_subscription_homepage(
        &mut self,
        notifier: &FilterNotifier,
        id: SubscriptionId,
        homepage: &str,
    ) {
        let changed = match self.subscription_mut(id).downloadable_mut() {
            Some(details) if details.homepage.as_deref() != Some(homepage) => {
                details.homepage = Some(homepage.to_string());
                true
            }
            _ => false,
        };
        if changed {
            notifier.publish(self, &StorageEvent::SubscriptionHomepage { subscription: id });
        }
    }

    pub fn set_download_status(
        &mut self,
        notifier: &FilterNotifier,
        id: SubscriptionId,
        status: &str,
    ) {
        let changed = match self.subscription_mut(id).downloadable_mut() {
            Some(details) if details.download_status.as_deref() != Some(status) => {
                details.download_status = Some(status.to_string());
                true
            }
            _ => false,
        };
        if changed {
            notifier.publish(self, &StorageEvent::SubscriptionDownloadStatus { subscription: id });
        }
    }

    pub fn set_last_download(&mut self, notifier: &FilterNotifier, id: SubscriptionId, when: u64) {
        let changed = match self.subscription_mut(id).downloadable_mut() {
            Some(details) if details.last_download != when => {
                details.last_download = when;
                true
            }
            _ => false,
        };
        if changed {
            notifier.publish(self, &StorageEvent::SubscriptionLastDownload { subscription: id });
        }
    }

    // =========================================================================
    // Persistence Codec
    // =========================================================================

    /// Serialize the graph to the on-disk text format.
    pub fn serialize(&self) -> String {
        let mut lines = Vec::new();
        lines.push(FILE_HEADER.to_string());
        lines.push(format!("version={FORMAT_VERSION}"));

        // Filters with non-default properties get their own blocks, once
        // each even when shared between subscriptions.
        let mut seen = HashSet::new();
        for &subscription in &self.order {
            for &filter in &self.subscription(subscription).filters {
                if !seen.insert(filter) {
                    continue;
                }
                let entry = self.filter(filter);
                if !entry.disabled && entry.hit_count == 0 && entry.last_hit == 0 {
                    continue;
                }
                lines.push(String::new());
                lines.push("[Filter]".to_string());
                lines.push(format!("text={}", entry.text));
                if entry.disabled {
                    lines.push("disabled=true".to_string());
                }
                if entry.hit_count != 0 {
                    lines.push(format!("hitCount={}", entry.hit_count));
                }
                if entry.last_hit != 0 {
                    lines.push(format!("lastHit={}", entry.last_hit));
                }
            }
        }

        for &id in &self.order {
            let subscription = self.subscription(id);
            if matches!(subscription.kind, SubscriptionKind::External) {
                continue;
            }
            lines.push(String::new());
            subscription.serialize(&mut lines);
            if !subscription.filters.is_empty() {
                lines.push(String::new());
                lines.push("[Subscription filters]".to_string());
                for &filter in &subscription.filters {
                    lines.push(self.filter(filter).text.replace('[', "\\["));
                }
            }
        }

        lines.push(String::new());
        lines.join("\n")
    }

    /// Parse the on-disk text format into a fresh graph. Unknown keys and
    /// sections are ignored; legacy `[filter]`/`[pattern]`/`[user patterns]`
    /// sections are understood on read.
    pub fn parse(text: &str) -> FilterGraph {
        #[derive(PartialEq)]
        enum Section {
            FileHeader,
            Filter,
            Subscription,
            SubscriptionFilters,
            UserPatterns,
            Unknown,
        }

        let mut graph = FilterGraph::new();
        let mut section = Section::FileHeader;
        let mut props: HashMap<String, String> = HashMap::new();
        let mut filter_lines: Vec<String> = Vec::new();
        let mut user_filters: Vec<String> = Vec::new();
        let mut parsed: Vec<Subscription> = Vec::new();

        fn flush(
            graph: &mut FilterGraph,
            section: &Section,
            props: &mut HashMap<String, String>,
            filter_lines: &mut Vec<String>,
            user_filters: &mut Vec<String>,
            parsed: &mut Vec<Subscription>,
        ) {
            match section {
                Section::Filter => {
                    if let Some(text) = props.get("text") {
                        let id = graph.filter_from_text(text);
                        let entry = graph.filter_mut(id);
                        entry.disabled = props.get("disabled").map(String::as_str) == Some("true");
                        entry.hit_count = props
                            .get("hitCount")
                            .and_then(|v| v.parse().ok())
                            .unwrap_or(0);
                        entry.last_hit = props
                            .get("lastHit")
                            .and_then(|v| v.parse().ok())
                            .unwrap_or(0);
                    }
                }
                Section::Subscription => {
                    match Subscription::from_properties(props) {
                        Some(subscription) => parsed.push(subscription),
                        None => warn!("skipping subscription block without url"),
                    }
                }
                Section::SubscriptionFilters => {
                    if let Some(subscription) = parsed.last_mut() {
                        for text in filter_lines.drain(..) {
                            let id = graph.filter_from_text(&text);
                            subscription.filters.push(id);
                        }
                    }
                }
                Section::UserPatterns => {
                    user_filters.append(filter_lines);
                }
                _ => {}
            }
            props.clear();
            filter_lines.clear();
        }

        for raw in text.lines() {
            let line = raw.trim_end_matches('\r');
            if let Some(name) = section_name(line) {
                flush(&mut graph, &section, &mut props, &mut filter_lines, &mut user_filters, &mut parsed);
                section = match name.to_ascii_lowercase().as_str() {
                    "filter" | "pattern" => Section::Filter,
                    "subscription" => Section::Subscription,
                    "subscription filters" | "subscription patterns" => {
                        Section::SubscriptionFilters
                    }
                    "user patterns" => Section::UserPatterns,
                    _ => Section::Unknown,
                };
                continue;
            }
            match section {
                Section::FileHeader | Section::Filter | Section::Subscription => {
                    if let Some((key, value)) = line.split_once('=') {
                        props.insert(key.to_string(), value.to_string());
                    }
                }
                Section::SubscriptionFilters | Section::UserPatterns => {
                    if !line.is_empty() {
                        filter_lines.push(line.replace("\\[", "["));
                    }
                }
                Section::Unknown => {}
            }
        }
        flush(&mut graph, &section, &mut props, &mut filter_lines, &mut user_filters, &mut parsed);

        for subscription in parsed {
            // Old fixed special groups are dropped once empty.
            let legacy = matches!(subscription.url.as_str(), "~il~" | "~wl~" | "~fl~" | "~eh~");
            if legacy && subscription.filters.is_empty() {
                continue;
            }
            if graph.subscription_ids.contains_key(&subscription.url) {
                warn!("duplicate subscription in store: {}", subscription.url);
                continue;
            }
            let filters = subscription.filters.clone();
            let id = graph.intern_subscription(subscription);
            graph.order.push(id);
            for filter in filters {
                let backrefs = &mut graph.filter_mut(filter).subscriptions;
                if !backrefs.contains(&id) {
                    backrefs.push(id);
                }
            }
        }

        for text in user_filters {
            let id = graph.filter_from_text(&text);
            graph.attach_filter_silent(id);
        }

        graph
    }
}

fn section_name(line: &str) -> Option<&str> {
    let trimmed = line.trim();
    let inner = trimmed.strip_prefix('[')?.strip_suffix(']')?;
    // Escaped brackets mark filter text, not a section.
    if line.trim_start().starts_with("\\[") {
        return None;
    }
    Some(inner)
}

// =============================================================================
// Disk I/O
// =============================================================================

/// Persistence seam: reads and writes the store as one string.
pub trait StorageBackend {
    async fn read(&self, path: &Path) -> io::Result<String>;
    async fn write(&self, path: &Path, content: &str) -> io::Result<()>;
}

/// Real filesystem backend.
#[derive(Debug, Default)]
pub struct FsBackend;

impl StorageBackend for FsBackend {
    async fn read(&self, path: &Path) -> io::Result<String> {
        tokio::fs::read_to_string(path).await
    }

    async fn write(&self, path: &Path, content: &str) -> io::Result<()> {
        tokio::fs::write(path, content).await
    }
}

/// The graph plus its notifier and persistence state.
///
/// Shared as `Rc<FilterStore<B>>` across the single-threaded runtime.
/// Listeners receive `&FilterGraph` during dispatch and must not reborrow
/// the store's graph; deferred work (like a requested save) goes through
/// spawned tasks instead.
pub struct FilterStore<B: StorageBackend> {
    pub graph: RefCell<FilterGraph>,
    pub notifier: FilterNotifier,
    backend: B,
    default_path: PathBuf,
    loading: Cell<bool>,
    saving: Cell<bool>,
    pending_save: Cell<bool>,
}

impl<B: StorageBackend> FilterStore<B> {
    pub fn new(backend: B, default_path: PathBuf) -> Rc<Self> {
        Rc::new(FilterStore {
            graph: RefCell::new(FilterGraph::new()),
            notifier: FilterNotifier::new(),
            backend,
            default_path,
            loading: Cell::new(false),
            saving: Cell::new(false),
            pending_save: Cell::new(false),
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn default_path(&self) -> &Path {
        &self.default_path
    }

    /// Load the store from disk, replacing the graph wholesale.
    ///
    /// Re-entrant calls while a load is running are no-ops. A failed read
    /// keeps the prior in-memory state; the `Loaded` event is published
    /// either way so dependent indices initialize deterministically.
    /// Loading from an explicit non-default path triggers a follow-up save
    /// to the default location.
    pub async fn load_from_disk(&self, path: Option<&Path>) -> Result<(), StorageError> {
        if self.loading.get() {
            return Ok(());
        }
        self.loading.set(true);

        let source = path.unwrap_or(&self.default_path).to_path_buf();
        let result = self.backend.read(&source).await;
        let outcome = match result {
            Ok(text) => {
                let save_stats = self.graph.borrow().save_stats;
                let mut graph = FilterGraph::parse(&text);
                graph.save_stats = save_stats;
                *self.graph.borrow_mut() = graph;
                Ok(())
            }
            Err(err) => {
                error!("failed to read {}: {err}", source.display());
                Err(StorageError::Read(err))
            }
        };

        self.loading.set(false);
        self.notifier.publish(&self.graph.borrow(), &StorageEvent::Loaded);

        if outcome.is_ok() && source != self.default_path {
            self.save_to_disk(None).await?;
        }
        outcome
    }

    /// Serialize the graph and write it out.
    ///
    /// For the default location, concurrent requests coalesce: while a
    /// write is in flight further requests only set a pending flag, and
    /// exactly one more write runs when the in-flight one completes. An
    /// explicit path bypasses coalescing and the `Saved` event.
    pub async fn save_to_disk(&self, path: Option<&Path>) -> Result<(), StorageError> {
        if let Some(path) = path {
            let data = self.graph.borrow().serialize();
            return self.backend.write(path, &data).await.map_err(StorageError::Write);
        }

        if self.saving.get() {
            self.pending_save.set(true);
            return Ok(());
        }
        self.saving.set(true);

        loop {
            let data = self.graph.borrow().serialize();
            let result = self.backend.write(&self.default_path, &data).await;
            if let Err(err) = &result {
                error!("failed to write {}: {err}", self.default_path.display());
            }
            if self.pending_save.get() {
                self.pending_save.set(false);
                continue;
            }
            self.saving.set(false);
            self.notifier.publish(&self.graph.borrow(), &StorageEvent::Saved);
            return result.map_err(StorageError::Write);
        }
    }
}

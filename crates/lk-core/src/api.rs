//! Request classification surface
//!
//! What the embedding integration layer calls into: classify a request
//! against the matching index, fetch hiding selectors for a document, and
//! manage the per-site kill switch (a synthetic `@@||host^$document`
//! whitelist filter).

use crate::domain::{HostCache, SuffixList};
use crate::filter::{ContentType, FilterKind};
use crate::listener::FilterListener;
use crate::notifier::FilterNotifier;
use crate::storage::{FilterGraph, FilterId};

/// Outcome of classifying one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    NoMatch,
    Invalid,
    Comment,
    Blocking,
    Whitelist,
    ElemHideRule,
    ElemHideException,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterDescriptor {
    pub kind: MatchKind,
    pub text: Option<String>,
    pub collapse: bool,
}

impl FilterDescriptor {
    fn no_match() -> Self {
        FilterDescriptor { kind: MatchKind::NoMatch, text: None, collapse: false }
    }

    fn for_filter(graph: &FilterGraph, id: FilterId) -> Self {
        let filter = graph.filter(id);
        let kind = match &filter.kind {
            FilterKind::Comment => MatchKind::Comment,
            FilterKind::Invalid { .. } => MatchKind::Invalid,
            FilterKind::Blocking(_) => MatchKind::Blocking,
            FilterKind::Whitelist(_) => MatchKind::Whitelist,
            FilterKind::ElemHide(_) => MatchKind::ElemHideRule,
            FilterKind::ElemHideException(_) => MatchKind::ElemHideException,
        };
        let collapse = filter.url_filter().map(|f| f.collapse).unwrap_or(false);
        FilterDescriptor { kind, text: Some(filter.text.clone()), collapse }
    }
}

/// Per-document selector answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HidingSelectors {
    pub host: String,
    pub base_domain: String,
    pub selectors: Vec<String>,
}

/// Stateless-ish classification front end: suffix rules plus the one-entry
/// host memo.
#[derive(Debug, Default)]
pub struct RequestClassifier {
    pub suffixes: SuffixList,
    pub hosts: HostCache,
}

impl RequestClassifier {
    pub fn new(suffixes: SuffixList) -> Self {
        RequestClassifier { suffixes, hosts: HostCache::new() }
    }

    /// Classify a request against the matching index.
    pub fn check_filter_match(
        &self,
        graph: &FilterGraph,
        listener: &FilterListener,
        url: &str,
        content_type: ContentType,
        document_url: &str,
    ) -> FilterDescriptor {
        let request_host = self.hosts.extract_host(url);
        let document_host = self.hosts.extract_host(document_url);
        let third_party = self.suffixes.is_third_party(&request_host, &document_host);
        match listener.matcher.borrow().matches_any(
            graph,
            url,
            content_type,
            &document_host,
            third_party,
        ) {
            Some(id) => FilterDescriptor::for_filter(graph, id),
            None => FilterDescriptor::no_match(),
        }
    }

    /// Hiding selectors for a document URL, with the host split the
    /// integration layer wants alongside.
    pub fn element_hiding_selectors(
        &self,
        graph: &FilterGraph,
        listener: &FilterListener,
        url: &str,
    ) -> HidingSelectors {
        let host = self.hosts.extract_host(url);
        let base_domain = self.suffixes.base_domain(&host);
        let selectors = listener.elemhide.borrow().selectors_for_domain(graph, &host, false);
        HidingSelectors { host, base_domain, selectors }
    }

    /// Whether a whitelist filter covers this URL. The parent URL supplies
    /// the document context; without one the URL is its own document.
    pub fn is_whitelisted(
        &self,
        graph: &FilterGraph,
        listener: &FilterListener,
        url: &str,
        parent_url: Option<&str>,
        content_type: Option<ContentType>,
    ) -> bool {
        let request_host = self.hosts.extract_host(url);
        let document_host = self.hosts.extract_host(parent_url.unwrap_or(url));
        let third_party = self.suffixes.is_third_party(&request_host, &document_host);
        let content_type = content_type.unwrap_or(ContentType::DOCUMENT);
        match listener.matcher.borrow().matches_any(
            graph,
            url,
            content_type,
            &document_host,
            third_party,
        ) {
            Some(id) => matches!(graph.filter(id).kind, FilterKind::Whitelist(_)),
            None => false,
        }
    }

    /// Turn filtering off or back on for a site by managing its synthetic
    /// `@@||host^$document` whitelist filter. Returns the filter involved,
    /// or `None` when the URL has no usable host.
    pub fn toggle_site_enabled(
        &self,
        graph: &mut FilterGraph,
        notifier: &FilterNotifier,
        url: &str,
        enabled: bool,
    ) -> Option<FilterId> {
        let host = self.hosts.extract_host(url);
        if host.is_empty() {
            return None;
        }
        let text = format!("@@||{host}^$document");
        let filter = graph.filter_from_text(&text);
        if enabled {
            // Filtering back on: drop the whitelist entry everywhere.
            graph.remove_filter(notifier, filter, None, None);
        } else {
            graph.set_filter_disabled(notifier, filter, false);
            graph.add_filter(notifier, filter, None, None);
        }
        Some(filter)
    }
}

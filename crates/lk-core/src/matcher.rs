//! URL matching index
//!
//! A deliberately simple index over the active blocking and whitelisting
//! filters: the reconciler feeds it, request classification queries it.
//! Whitelist filters always win over blocking filters.

use crate::filter::{ContentType, FilterKind};
use crate::storage::{FilterGraph, FilterId};

#[derive(Debug, Default)]
pub struct Matcher {
    blocking: Vec<FilterId>,
    whitelist: Vec<FilterId>,
}

impl Matcher {
    pub fn new() -> Self {
        Matcher::default()
    }

    pub fn clear(&mut self) {
        self.blocking.clear();
        self.whitelist.clear();
    }

    pub fn len(&self) -> usize {
        self.blocking.len() + self.whitelist.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocking.is_empty() && self.whitelist.is_empty()
    }

    pub fn contains(&self, id: FilterId) -> bool {
        self.blocking.contains(&id) || self.whitelist.contains(&id)
    }

    /// Index a URL filter. Duplicate adds and non-URL filters are no-ops.
    pub fn add(&mut self, graph: &FilterGraph, id: FilterId) {
        if self.contains(id) {
            return;
        }
        match &graph.filter(id).kind {
            FilterKind::Blocking(_) => self.blocking.push(id),
            FilterKind::Whitelist(_) => self.whitelist.push(id),
            _ => {}
        }
    }

    pub fn remove(&mut self, id: FilterId) {
        self.blocking.retain(|&f| f != id);
        self.whitelist.retain(|&f| f != id);
    }

    /// The filter deciding this request, if any. Whitelist hits shadow
    /// blocking hits.
    pub fn matches_any(
        &self,
        graph: &FilterGraph,
        url: &str,
        content_type: ContentType,
        doc_domain: &str,
        third_party: bool,
    ) -> Option<FilterId> {
        for &id in &self.whitelist {
            if graph.filter(id).matches(url, content_type, doc_domain, third_party) {
                return Some(id);
            }
        }
        for &id in &self.blocking {
            if graph.filter(id).matches(url, content_type, doc_domain, third_party) {
                return Some(id);
            }
        }
        None
    }
}

//! Element-hide selector index
//!
//! Hiding filters are registered under a freshly generated random key that
//! doubles as a stable external handle; exceptions are indexed per selector
//! and evaluated most-recently-added-first. The index is rebuilt only by
//! the reconciler, never mutated directly by callers.

use std::collections::HashMap;

use rand::Rng;

use crate::filter::FilterKind;
use crate::storage::{FilterGraph, FilterId};

#[derive(Debug, Default)]
pub struct ElemHideIndex {
    filter_by_key: HashMap<u32, FilterId>,
    key_by_filter: HashMap<FilterId, u32>,
    /// Exception filters per selector, in add order.
    exceptions: HashMap<String, Vec<FilterId>>,
}

impl ElemHideIndex {
    pub fn new() -> Self {
        ElemHideIndex::default()
    }

    pub fn clear(&mut self) {
        self.filter_by_key.clear();
        self.key_by_filter.clear();
        self.exceptions.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.filter_by_key.is_empty() && self.exceptions.is_empty()
    }

    /// Index an element-hide filter or exception. Duplicate adds are
    /// no-ops; other filter kinds are ignored.
    pub fn add(&mut self, graph: &FilterGraph, id: FilterId) {
        match &graph.filter(id).kind {
            FilterKind::ElemHide(_) => {
                if self.key_by_filter.contains_key(&id) {
                    return;
                }
                let mut rng = rand::thread_rng();
                let key = loop {
                    let candidate: u32 = rng.gen();
                    if !self.filter_by_key.contains_key(&candidate) {
                        break candidate;
                    }
                };
                self.filter_by_key.insert(key, id);
                self.key_by_filter.insert(id, key);
            }
            FilterKind::ElemHideException(data) => {
                let list = self.exceptions.entry(data.selector.clone()).or_default();
                if !list.contains(&id) {
                    list.push(id);
                }
            }
            _ => {}
        }
    }

    pub fn remove(&mut self, graph: &FilterGraph, id: FilterId) {
        match &graph.filter(id).kind {
            FilterKind::ElemHide(_) => {
                if let Some(key) = self.key_by_filter.remove(&id) {
                    self.filter_by_key.remove(&key);
                }
            }
            FilterKind::ElemHideException(data) => {
                if let Some(list) = self.exceptions.get_mut(&data.selector) {
                    list.retain(|&f| f != id);
                    if list.is_empty() {
                        self.exceptions.remove(&data.selector);
                    }
                }
            }
            _ => {}
        }
    }

    pub fn filter_by_key(&self, key: u32) -> Option<FilterId> {
        self.filter_by_key.get(&key).copied()
    }

    pub fn key_for(&self, id: FilterId) -> Option<u32> {
        self.key_by_filter.get(&id).copied()
    }

    /// The last-added exception for a selector that is active on `domain`.
    pub fn get_exception(
        &self,
        graph: &FilterGraph,
        selector: &str,
        domain: &str,
    ) -> Option<FilterId> {
        let list = self.exceptions.get(selector)?;
        list.iter()
            .rev()
            .copied()
            .find(|&id| graph.filter(id).is_active_on_domain(domain))
    }

    /// All non-excepted selectors active on a domain. With `specific_only`,
    /// filters without an explicit domain restriction are skipped (used on
    /// hosts where generic hiding breaks rendering).
    pub fn selectors_for_domain(
        &self,
        graph: &FilterGraph,
        domain: &str,
        specific_only: bool,
    ) -> Vec<String> {
        let mut result = Vec::new();
        for &id in self.filter_by_key.values() {
            let data = match &graph.filter(id).kind {
                FilterKind::ElemHide(data) => data,
                _ => continue,
            };
            if specific_only && data.domains.is_generic() {
                continue;
            }
            if !data.domains.is_active_on(domain) {
                continue;
            }
            if self.get_exception(graph, &data.selector, domain).is_some() {
                continue;
            }
            result.push(data.selector.clone());
        }
        result
    }
}

//! Storage-to-index reconciler
//!
//! Subscribes once to the notifier and keeps the matching and element-hide
//! indices consistent with the graph. All updates are incremental in the
//! number of changed filters; only a full load rebuilds from scratch.
//!
//! The reconciler also accumulates a dirty factor from change events and
//! requests a persistence pass once enough change has piled up. The save
//! itself runs deferred through the injected callback, never during
//! dispatch.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::elemhide::ElemHideIndex;
use crate::matcher::Matcher;
use crate::notifier::{FilterNotifier, StorageEvent, StorageListener};
use crate::storage::{FilterGraph, FilterId, SubscriptionId};

pub struct FilterListener {
    pub elemhide: RefCell<ElemHideIndex>,
    pub matcher: RefCell<Matcher>,
    dirty: Cell<f64>,
    request_save: Box<dyn Fn()>,
}

impl FilterListener {
    pub fn new(request_save: Box<dyn Fn()>) -> Rc<Self> {
        Rc::new(FilterListener {
            elemhide: RefCell::new(ElemHideIndex::new()),
            matcher: RefCell::new(Matcher::new()),
            dirty: Cell::new(0.0),
            request_save,
        })
    }

    pub fn install(self: &Rc<Self>, notifier: &FilterNotifier) {
        notifier.subscribe(self.clone() as Rc<dyn StorageListener>);
    }

    fn add_to_indices(&self, graph: &FilterGraph, id: FilterId) {
        let filter = graph.filter(id);
        if filter.is_url_filter() {
            self.matcher.borrow_mut().add(graph, id);
        } else if filter.is_elemhide() {
            self.elemhide.borrow_mut().add(graph, id);
        }
    }

    fn remove_from_indices(&self, graph: &FilterGraph, id: FilterId) {
        let filter = graph.filter(id);
        if filter.is_url_filter() {
            self.matcher.borrow_mut().remove(id);
        } else if filter.is_elemhide() {
            self.elemhide.borrow_mut().remove(graph, id);
        }
    }

    /// Bring one filter's index contribution in line with its current
    /// enabled-reachability. A filter present in both an enabled and a
    /// disabled subscription stays indexed.
    fn reconcile_filter(&self, graph: &FilterGraph, id: FilterId) {
        let filter = graph.filter(id);
        if filter.is_active() && !filter.disabled && graph.filter_reachable(id) {
            self.add_to_indices(graph, id);
        } else {
            self.remove_from_indices(graph, id);
        }
    }

    fn reconcile_subscription(&self, graph: &FilterGraph, id: SubscriptionId) {
        for &filter in &graph.subscription(id).filters {
            self.reconcile_filter(graph, filter);
        }
    }

    fn rebuild(&self, graph: &FilterGraph) {
        self.matcher.borrow_mut().clear();
        self.elemhide.borrow_mut().clear();
        for subscription in graph.listed_subscriptions() {
            if graph.subscription(subscription).disabled {
                continue;
            }
            for &filter in &graph.subscription(subscription).filters {
                if !graph.filter(filter).disabled {
                    self.add_to_indices(graph, filter);
                }
            }
        }
    }
}

impl StorageListener for FilterListener {
    fn on_event(&self, graph: &FilterGraph, event: &StorageEvent) {
        match event {
            StorageEvent::Loaded => {
                self.rebuild(graph);
                self.dirty.set(0.0);
                return;
            }
            StorageEvent::Saved => {
                self.dirty.set(0.0);
                return;
            }
            StorageEvent::FilterAdded { filter, .. }
            | StorageEvent::FilterRemoved { filter, .. }
            | StorageEvent::FilterDisabled { filter, .. } => {
                self.reconcile_filter(graph, *filter);
            }
            StorageEvent::SubscriptionAdded { subscription }
            | StorageEvent::SubscriptionRemoved { subscription }
            | StorageEvent::SubscriptionDisabled { subscription, .. } => {
                self.reconcile_subscription(graph, *subscription);
            }
            StorageEvent::SubscriptionUpdated { subscription, old_filters } => {
                for &filter in old_filters {
                    self.reconcile_filter(graph, filter);
                }
                self.reconcile_subscription(graph, *subscription);
            }
            _ => {}
        }

        let dirty = self.dirty.get() + event.dirty_weight();
        if dirty >= 1.0 {
            self.dirty.set(0.0);
            (self.request_save)();
        } else {
            self.dirty.set(dirty);
        }
    }
}

//! Change notification bus
//!
//! Synchronous, single-threaded publish/subscribe connecting the filter
//! graph to derived indices. Every graph mutation publishes a typed event;
//! listeners run in subscription order before the publish call returns.

use std::cell::RefCell;
use std::rc::Rc;

use crate::storage::{FilterGraph, FilterId, SubscriptionId};

/// Typed change event published by the filter graph.
///
/// Payloads carry IDs, not references; listeners resolve them against the
/// graph handed to the callback. Old values are captured before mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageEvent {
    /// The graph was replaced wholesale from disk.
    Loaded,
    /// A save to the default store location completed.
    Saved,
    FilterAdded {
        filter: FilterId,
        subscription: SubscriptionId,
        position: usize,
    },
    FilterRemoved {
        filter: FilterId,
        subscription: SubscriptionId,
        position: usize,
    },
    FilterMoved {
        filter: FilterId,
        subscription: SubscriptionId,
        from: usize,
        to: usize,
    },
    FilterDisabled {
        filter: FilterId,
        old: bool,
    },
    FilterHitCount {
        filter: FilterId,
    },
    FilterLastHit {
        filter: FilterId,
    },
    SubscriptionAdded {
        subscription: SubscriptionId,
    },
    SubscriptionRemoved {
        subscription: SubscriptionId,
    },
    SubscriptionMoved {
        subscription: SubscriptionId,
    },
    SubscriptionDisabled {
        subscription: SubscriptionId,
        old: bool,
    },
    /// The subscription's filter list was atomically replaced.
    SubscriptionUpdated {
        subscription: SubscriptionId,
        old_filters: Vec<FilterId>,
    },
    SubscriptionTitle {
        subscription: SubscriptionId,
    },
    SubscriptionHomepage {
        subscription: SubscriptionId,
    },
    SubscriptionDownloadStatus {
        subscription: SubscriptionId,
    },
    SubscriptionLastDownload {
        subscription: SubscriptionId,
    },
}

impl StorageEvent {
    /// Weight this event contributes toward triggering a persistence pass.
    /// Structural changes count fully, pure statistics barely.
    pub fn dirty_weight(&self) -> f64 {
        match self {
            StorageEvent::Loaded | StorageEvent::Saved => 0.0,
            StorageEvent::FilterHitCount { .. } | StorageEvent::FilterLastHit { .. } => 0.002,
            _ => 1.0,
        }
    }
}

/// Observer of graph change events.
pub trait StorageListener {
    fn on_event(&self, graph: &FilterGraph, event: &StorageEvent);
}

/// Synchronous publish/subscribe bus for [`StorageEvent`]s.
///
/// Listener identity is the `Rc` allocation; duplicate subscribes are
/// no-ops. The listener list is snapshotted per publish, so a listener
/// added or removed during dispatch does not affect the current pass.
#[derive(Default)]
pub struct FilterNotifier {
    listeners: RefCell<Vec<Rc<dyn StorageListener>>>,
}

impl FilterNotifier {
    pub fn new() -> Self {
        FilterNotifier::default()
    }

    pub fn subscribe(&self, listener: Rc<dyn StorageListener>) {
        let mut listeners = self.listeners.borrow_mut();
        if !listeners.iter().any(|known| Rc::ptr_eq(known, &listener)) {
            listeners.push(listener);
        }
    }

    pub fn unsubscribe(&self, listener: &Rc<dyn StorageListener>) {
        self.listeners
            .borrow_mut()
            .retain(|known| !Rc::ptr_eq(known, listener));
    }

    /// Dispatch an event to every currently subscribed listener, in
    /// subscription order, before returning.
    pub fn publish(&self, graph: &FilterGraph, event: &StorageEvent) {
        let snapshot: Vec<Rc<dyn StorageListener>> = self.listeners.borrow().clone();
        for listener in snapshot {
            listener.on_event(graph, event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder {
        tag: &'static str,
        log: Rc<RefCell<Vec<&'static str>>>,
    }

    impl StorageListener for Recorder {
        fn on_event(&self, _graph: &FilterGraph, _event: &StorageEvent) {
            self.log.borrow_mut().push(self.tag);
        }
    }

    #[test]
    fn test_dispatch_order_and_idempotent_subscribe() {
        let notifier = FilterNotifier::new();
        let graph = FilterGraph::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        let first: Rc<dyn StorageListener> =
            Rc::new(Recorder { tag: "first", log: log.clone() });
        let second: Rc<dyn StorageListener> =
            Rc::new(Recorder { tag: "second", log: log.clone() });

        notifier.subscribe(first.clone());
        notifier.subscribe(second.clone());
        notifier.subscribe(first.clone());

        notifier.publish(&graph, &StorageEvent::Loaded);
        assert_eq!(*log.borrow(), vec!["first", "second"]);

        notifier.unsubscribe(&first);
        notifier.publish(&graph, &StorageEvent::Loaded);
        assert_eq!(*log.borrow(), vec!["first", "second", "second"]);
    }

    struct Unsubscriber {
        notifier: Rc<FilterNotifier>,
        victim: RefCell<Option<Rc<dyn StorageListener>>>,
        log: Rc<RefCell<Vec<&'static str>>>,
    }

    impl StorageListener for Unsubscriber {
        fn on_event(&self, _graph: &FilterGraph, _event: &StorageEvent) {
            self.log.borrow_mut().push("unsubscriber");
            if let Some(victim) = self.victim.borrow_mut().take() {
                self.notifier.unsubscribe(&victim);
            }
        }
    }

    #[test]
    fn test_unsubscribe_during_dispatch_keeps_current_pass() {
        let notifier = Rc::new(FilterNotifier::new());
        let graph = FilterGraph::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        let victim: Rc<dyn StorageListener> =
            Rc::new(Recorder { tag: "victim", log: log.clone() });
        let unsubscriber: Rc<dyn StorageListener> = Rc::new(Unsubscriber {
            notifier: notifier.clone(),
            victim: RefCell::new(Some(victim.clone())),
            log: log.clone(),
        });

        notifier.subscribe(unsubscriber);
        notifier.subscribe(victim);

        // The victim is unsubscribed mid-dispatch but still sees this pass.
        notifier.publish(&graph, &StorageEvent::Loaded);
        assert_eq!(*log.borrow(), vec!["unsubscriber", "victim"]);

        notifier.publish(&graph, &StorageEvent::Loaded);
        assert_eq!(*log.borrow(), vec!["unsubscriber", "victim", "unsubscriber"]);
    }

    #[test]
    fn test_dirty_weights() {
        let stat = StorageEvent::FilterHitCount { filter: FilterId(0) };
        assert!(stat.dirty_weight() < 0.01);
        let structural = StorageEvent::SubscriptionAdded { subscription: SubscriptionId(0) };
        assert_eq!(structural.dirty_weight(), 1.0);
        assert_eq!(StorageEvent::Loaded.dirty_weight(), 0.0);
    }
}

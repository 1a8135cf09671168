//! Listkeeper Core Library
//!
//! This crate is the persistence and change-propagation core of the
//! listkeeper content-filtering engine: the authoritative filter and
//! subscription graph, its on-disk text format, and the event-driven
//! reconciliation that keeps derived matching indices consistent.
//!
//! Everything runs on a single-threaded cooperative runtime; shared state
//! is `Rc`/`RefCell`, and "concurrency" is interleaved awaits on timers,
//! network completions and disk I/O.
//!
//! # Modules
//!
//! - `domain`: URI parsing, public-suffix base domains, third-party checks
//! - `filter`: filter rule data model and text parsing
//! - `subscription`: user groups and downloadable list state
//! - `notifier`: synchronous change-event bus
//! - `storage`: the entity graph, persistence codec and disk store
//! - `elemhide`: element-hiding selector index
//! - `matcher`: URL matching index
//! - `listener`: storage-to-index reconciler
//! - `api`: request classification surface for the integration layer

pub mod api;
pub mod domain;
pub mod elemhide;
pub mod error;
pub mod filter;
pub mod listener;
pub mod matcher;
pub mod notifier;
pub mod storage;
pub mod subscription;

// Re-export commonly used types
pub use api::{FilterDescriptor, HidingSelectors, MatchKind, RequestClassifier};
pub use domain::{HostCache, ParsedUri, SuffixList};
pub use error::{StorageError, UriError};
pub use filter::{ContentType, Filter, FilterKind};
pub use listener::FilterListener;
pub use notifier::{FilterNotifier, StorageEvent, StorageListener};
pub use storage::{FilterGraph, FilterId, FilterStore, FsBackend, StorageBackend, SubscriptionId};
pub use subscription::{DefaultTag, Subscription, SubscriptionKind};

//! A process-wide data cache whose entries invalidate themselves.
//!
//! Producers cache a computed payload under a [`Key`] built from the inputs it
//! was computed from. Objects embedded in a key record their modification time,
//! and the cache subscribes to every such object plus the producing context:
//! calling [`Observable::modified`] on any of them evicts the entry before
//! `modified` returns.
//!
//! The objects themselves are reference counted ([`Strong`], [`AnyObject`]) and
//! hand out weak handles ([`Weak`], [`WeakAny`]) through a shared control block,
//! so that neither keys nor observers ever extend the lifetime of what they
//! watch.
//!
//! ```
//! use std::sync::Mutex;
//! use depcache::{key, CacheConfig, DataCache, Observable, Strong};
//!
//! let cache = DataCache::new(CacheConfig::default());
//! let context = Strong::new(());
//! let input = Strong::new(Mutex::new(vec![1, 2, 3]));
//!
//! let data_key = key!["sum", &input];
//! let observer_key = key!["sum", &input, &context];
//! let sum: i32 = input.lock().unwrap().iter().sum();
//! cache.insert(&context, Strong::new(sum), data_key.clone(), observer_key).unwrap();
//! assert_eq!(cache.lookup::<i32>(&data_key).as_deref(), Some(&6));
//!
//! input.lock().unwrap().push(4);
//! input.modified();
//! assert!(cache.lookup::<i32>(&data_key).is_none());
//! ```
//!
//! A process-wide instance is available through [`Runtime`] (or
//! [`cache_manager`]) when the `global` feature is enabled.

pub(crate) mod cache;
pub(crate) mod config;
pub(crate) mod control;
pub(crate) mod error;
pub(crate) mod key;
pub(crate) mod notify;
pub(crate) mod object;
pub(crate) mod observer;
pub(crate) mod singleton;
pub(crate) mod stats;

#[cfg(test)]
mod tests;

pub use cache::{DataCache, Insertion};
pub use config::{CacheConfig, InsertPolicy};
pub use control::{Weak, WeakAny};
pub use error::CacheError;
pub use key::{Component, Key, ObjectRef};
pub use notify::{ModifiedEvent, ObserverToken};
pub use object::{AnyObject, ObjectId, Observable, Strong};
pub use singleton::{Manager, Singleton};
#[cfg(feature = "global")]
pub use singleton::{cache_manager, global_cache, Runtime};
pub use stats::CacheStats;

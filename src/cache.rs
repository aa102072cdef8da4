//! The data cache.
//!
//! Maps data keys to payloads. Each entry owns an [`Observer`] subscribed to the
//! entry's context and to every object its keys mention; modifying any of them
//! evicts the entry.
//!
//! All indexes sit behind one mutex. Observer callbacks, payload destructors
//! and observer teardown always run after that mutex has been released.

use std::{
    mem,
    sync::{self, Arc},
};

use ahash::{AHashMap, AHashSet};
use parking_lot::Mutex;

use crate::{
    config::{CacheConfig, InsertPolicy},
    error::CacheError,
    key::Key,
    object::{AnyObject, ObjectId, Observable, Strong},
    observer::Observer,
    stats::{CacheStats, Counters},
};

/// Result of a successful `insert`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Insertion
{
    /// A new entry was created.
    Inserted,
    /// An entry with an equal data key was already present and kept.
    Kept,
    /// An entry with an equal data key was evicted in favour of the new one.
    Replaced,
}

struct Entry
{
    payload: AnyObject,
    observer: Arc<Observer>,
}

#[derive(Default)]
struct CacheIndex
{
    by_data: AHashMap<Key, Entry>,
    by_observer: AHashMap<Key, Arc<Observer>>,
    watching: AHashMap<ObjectId, AHashSet<Key>>,
}

impl CacheIndex
{
    fn attach(&mut self, entry: Entry)
    {
        let observer = &entry.observer;
        for id in observer.watches() {
            self.watching
                .entry(id)
                .or_default()
                .insert(observer.observer_key().clone());
        }
        self.by_observer
            .insert(observer.observer_key().clone(), Arc::clone(observer));
        self.by_data.insert(observer.data_key().clone(), entry);
    }

    fn detach(&mut self, data_key: &Key) -> Option<Entry>
    {
        let entry = self.by_data.remove(data_key)?;
        let observer_key = entry.observer.observer_key();
        if let Some(bound) = self.by_observer.get(observer_key) {
            if Arc::ptr_eq(bound, &entry.observer) {
                self.by_observer.remove(observer_key);
            }
        }
        for id in entry.observer.watches() {
            if let Some(set) = self.watching.get_mut(&id) {
                set.remove(observer_key);
                if set.is_empty() {
                    self.watching.remove(&id);
                }
            }
        }
        Some(entry)
    }

    fn detach_observer(&mut self, observer_key: &Key) -> Option<Entry>
    {
        let data_key = self.by_observer.get(observer_key)?.data_key().clone();
        self.detach(&data_key)
    }

    /// Detaches the entry under `data_key` only if it is still the one owned
    /// by the observer with this serial.
    fn detach_owned(&mut self, data_key: &Key, serial: u64) -> Option<Entry>
    {
        match self.by_data.get(data_key) {
            Some(entry) if entry.observer.serial() == serial => self.detach(data_key),
            _ => None,
        }
    }

    fn detach_all<'a, I>(&mut self, owners: I) -> Vec<Entry>
    where
        I: IntoIterator<Item = (&'a Key, u64)>,
    {
        owners
            .into_iter()
            .filter_map(|(data_key, serial)| self.detach_owned(data_key, serial))
            .collect()
    }
}

/// Process-wide keyed cache with automatic invalidation.
///
/// Constructed behind an `Arc`; observers refer back to it weakly.
///
/// An entry whose context or dependency is destroyed without being modified
/// first can no longer be invalidated, and stays indexed until
/// [`purge_expired`](Self::purge_expired) or [`clear`](Self::clear) runs.
/// Long-lived caches that see many short-lived contexts should call
/// `purge_expired` periodically.
pub struct DataCache
{
    config: CacheConfig,
    index: Mutex<CacheIndex>,
    counters: Counters,
    this: sync::Weak<DataCache>,
}

impl DataCache
{
    pub fn new(config: CacheConfig) -> Arc<Self>
    {
        Arc::new_cyclic(|this| DataCache {
            config,
            index: Mutex::new(CacheIndex::default()),
            counters: Counters::default(),
            this: this.clone(),
        })
    }

    pub fn config(&self) -> &CacheConfig { &self.config }

    /// Cache `payload` under `data_key`.
    ///
    /// The entry is evicted as soon as `context`, or any object mentioned by
    /// either key, is modified. Every such object must be alive and, when
    /// `validate_mtimes` is set, unmodified since the keys were built;
    /// otherwise the insert is refused, logged, and the cache left untouched.
    ///
    /// A live entry already bound to `observer_key` under another data key is
    /// evicted, observers being one-to-one with entries.
    pub fn insert<C, P>(
        &self,
        context: &C,
        payload: P,
        data_key: Key,
        observer_key: Key,
    ) -> Result<Insertion, CacheError>
    where
        C: Observable,
        P: Observable,
    {
        if self.config.insert_policy == InsertPolicy::Keep
            && self.index.lock().by_data.contains_key(&data_key)
        {
            log::trace!("keeping cached entry for {:?}", data_key);
            return Ok(Insertion::Kept);
        }

        let watched = match self.watched(context, &data_key, &observer_key) {
            Ok(watched) => watched,
            Err(e) => return Err(self.reject(&data_key, e)),
        };
        let observer = Arc::new(Observer::bind(
            self.this.clone(),
            data_key.clone(),
            observer_key.clone(),
            &watched,
        ));
        let payload = payload.as_any();

        let mut evicted = Vec::new();
        let res = {
            let mut index = self.index.lock();
            // Subscriptions are live by now: a modification that slips in after
            // this check blocks on the index lock and evicts what we insert.
            match self.check_current(&watched, &data_key, &observer_key) {
                Err(e) => Err(e),
                Ok(()) => {
                    let outcome = if index.by_data.contains_key(&data_key) {
                        match self.config.insert_policy {
                            InsertPolicy::Keep => Insertion::Kept,
                            InsertPolicy::Replace => {
                                evicted.extend(index.detach(&data_key));
                                Insertion::Replaced
                            }
                        }
                    } else {
                        Insertion::Inserted
                    };
                    if outcome != Insertion::Kept {
                        evicted.extend(index.detach_observer(&observer_key));
                        index.attach(Entry {
                            payload,
                            observer,
                        });
                    }
                    Ok(outcome)
                }
            }
        };

        match res {
            Ok(outcome) => {
                if outcome != Insertion::Kept {
                    self.counters.insert();
                }
                self.counters.evict(evicted.len());
                log::debug!(
                    "{:?} {:?} watching {} objects",
                    outcome,
                    data_key,
                    watched.len()
                );
                Ok(outcome)
            }
            Err(e) => Err(self.reject(&data_key, e)),
        }
    }

    /// The context plus every object mentioned by the keys, deduplicated.
    fn watched<C: Observable>(
        &self,
        context: &C,
        data_key: &Key,
        observer_key: &Key,
    ) -> Result<Vec<AnyObject>, CacheError>
    {
        let mut seen = AHashSet::new();
        let mut watched = Vec::new();
        seen.insert(context.id());
        watched.push(context.as_any());
        for o in data_key.objects().into_iter().chain(observer_key.objects()) {
            if seen.insert(o.id()) {
                watched.push(o.lock().ok_or(CacheError::Expired(o.id()))?);
            }
        }
        Ok(watched)
    }

    fn check_current(
        &self,
        watched: &[AnyObject],
        data_key: &Key,
        observer_key: &Key,
    ) -> Result<(), CacheError>
    {
        if !self.config.validate_mtimes {
            return Ok(());
        }
        for o in data_key.objects().into_iter().chain(observer_key.objects()) {
            let current = watched
                .iter()
                .find(|w| w.id() == o.id())
                .map_or(o.mtime(), |w| w.mtime());
            if current != o.mtime() {
                return Err(CacheError::StaleKey {
                    object: o.id(),
                    captured: o.mtime(),
                    current,
                });
            }
        }
        Ok(())
    }

    fn reject(&self, data_key: &Key, e: CacheError) -> CacheError
    {
        self.counters.reject();
        log::warn!("refusing to cache {:?}: {}", data_key, e);
        e
    }

    /// The payload cached under `data_key`, if any and if it is a `T`.
    ///
    /// A payload of another type is a miss; the entry stays.
    pub fn lookup<T: Send + Sync + 'static>(&self, data_key: &Key) -> Option<Strong<T>>
    {
        let payload = self.index.lock().by_data.get(data_key).map(|e| e.payload.clone());
        match payload.as_ref().and_then(AnyObject::downcast::<T>) {
            Some(res) => {
                self.counters.hit();
                Some(res)
            }
            None => {
                self.counters.miss();
                if let Some(payload) = &payload {
                    log::trace!(
                        "{:?} holds a {}, not a {}",
                        data_key,
                        payload.type_name(),
                        std::any::type_name::<T>()
                    );
                }
                None
            }
        }
    }

    /// The payload cached under `data_key`, whatever its type.
    pub fn lookup_any(&self, data_key: &Key) -> Option<AnyObject>
    {
        let res = self.index.lock().by_data.get(data_key).map(|e| e.payload.clone());
        if res.is_some() {
            self.counters.hit();
        } else {
            self.counters.miss();
        }
        res
    }

    pub fn contains(&self, data_key: &Key) -> bool
    {
        self.index.lock().by_data.contains_key(data_key)
    }

    /// Evict the entry cached under `data_key` and the entry bound to
    /// `observer_key`. Idempotent; returns whether anything was removed.
    pub fn evict(&self, data_key: &Key, observer_key: &Key) -> bool
    {
        let evicted = {
            let mut index = self.index.lock();
            let mut evicted = Vec::with_capacity(2);
            evicted.extend(index.detach(data_key));
            evicted.extend(index.detach_observer(observer_key));
            evicted
        };
        self.released(evicted) > 0
    }

    /// Evict the entry cached under `data_key`.
    pub fn remove(&self, data_key: &Key) -> bool
    {
        let evicted = self.index.lock().detach(data_key);
        self.released(evicted.into_iter().collect()) > 0
    }

    /// Evict the entry under `data_key` if it is still owned by the observer
    /// with this serial. Called from observer callbacks.
    pub(crate) fn evict_observer(&self, data_key: &Key, serial: u64) -> bool
    {
        let evicted = self.index.lock().detach_owned(data_key, serial);
        self.released(evicted.into_iter().collect()) > 0
    }

    /// Evict every entry watching the object `id`, as a modification of that
    /// object would. Returns the number of entries evicted.
    pub fn evict_watching(&self, id: ObjectId) -> usize
    {
        let evicted = {
            let mut index = self.index.lock();
            let owners: Vec<(Key, u64)> = match index.watching.get(&id) {
                Some(keys) => keys
                    .iter()
                    .filter_map(|k| index.by_observer.get(k))
                    .map(|o| (o.data_key().clone(), o.serial()))
                    .collect(),
                None => Vec::new(),
            };
            index.detach_all(owners.iter().map(|(k, serial)| (k, *serial)))
        };
        self.released(evicted)
    }

    /// Evict every entry whose context or one of whose dependencies has been
    /// destroyed. Such entries can no longer be reached by a freshly built key.
    pub fn purge_expired(&self) -> usize
    {
        let evicted = {
            let mut index = self.index.lock();
            let owners: Vec<(Key, u64)> = index
                .by_observer
                .values()
                .filter(|o| o.has_expired_target())
                .map(|o| (o.data_key().clone(), o.serial()))
                .collect();
            index.detach_all(owners.iter().map(|(k, serial)| (k, *serial)))
        };
        self.released(evicted)
    }

    /// Evict everything. Returns the number of entries evicted.
    pub fn clear(&self) -> usize
    {
        let index = mem::take(&mut *self.index.lock());
        let evicted = index.by_data.len();
        self.counters.evict(evicted);
        mem::drop(index);
        if evicted > 0 {
            log::debug!("cleared {} entries", evicted);
        }
        evicted
    }

    /// Number of live entries.
    pub fn len(&self) -> usize { self.index.lock().by_data.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn stats(&self) -> CacheStats
    {
        let mut res = {
            let index = self.index.lock();
            CacheStats {
                entries: index.by_data.len(),
                observers: index.by_observer.len(),
                watched_objects: index.watching.len(),
                ..CacheStats::default()
            }
        };
        self.counters.fill(&mut res);
        res
    }

    /// Drops evicted entries, which unsubscribes their observers and may run
    /// payload destructors. Must be called without the index lock held.
    fn released(&self, evicted: Vec<Entry>) -> usize
    {
        let n = evicted.len();
        if n > 0 {
            self.counters.evict(n);
            for e in &evicted {
                log::debug!("evicted {:?}", e.observer.data_key());
            }
        }
        mem::drop(evicted);
        n
    }
}

impl std::fmt::Debug for DataCache
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        f.debug_struct("DataCache")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

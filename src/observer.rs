//! Binding between a cache entry and the objects it depends on.

use std::{
    fmt,
    sync::{
        self,
        atomic::{AtomicU64, Ordering},
    },
};

use crate::{
    cache::DataCache,
    control::WeakAny,
    key::Key,
    notify::{Callback, ModifiedEvent, ObserverToken},
    object::{sealed::Sealed, AnyObject, ObjectId, Observable},
};

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(0);

struct Subscription
{
    object: ObjectId,
    target: WeakAny,
    token: ObserverToken,
}

/// Watches the context and every dependency of one cache entry, and evicts the
/// entry when any of them is modified.
///
/// Holds only weak references: neither the cache nor the watched objects are
/// kept alive by an observer.
pub(crate) struct Observer
{
    serial: u64,
    data_key: Key,
    observer_key: Key,
    subscriptions: Vec<Subscription>,
}

impl Observer
{
    /// Subscribes to every object in `watched`, which must not contain
    /// duplicates.
    pub(crate) fn bind(
        cache: sync::Weak<DataCache>,
        data_key: Key,
        observer_key: Key,
        watched: &[AnyObject],
    ) -> Self
    {
        let serial = NEXT_SERIAL.fetch_add(1, Ordering::Relaxed);
        // Notifications run from a snapshot, so this may fire after the entry
        // was replaced; only the entry bound to this serial is evicted.
        let callback: Callback = {
            let data_key = data_key.clone();
            sync::Arc::new(move |event: &ModifiedEvent| {
                if let Some(cache) = cache.upgrade() {
                    log::trace!(
                        "{} modified at mtime {}, evicting {:?}",
                        event.object,
                        event.mtime,
                        data_key
                    );
                    cache.evict_observer(&data_key, serial);
                }
            })
        };

        let subscriptions = watched
            .iter()
            .map(|object| Subscription {
                object: object.id(),
                target: object.weak_any(),
                token: object.header().subscribe(sync::Arc::clone(&callback)),
            })
            .collect();

        Observer {
            serial,
            data_key,
            observer_key,
            subscriptions,
        }
    }

    pub(crate) fn serial(&self) -> u64 { self.serial }

    pub(crate) fn data_key(&self) -> &Key { &self.data_key }

    pub(crate) fn observer_key(&self) -> &Key { &self.observer_key }

    pub(crate) fn watches(&self) -> impl Iterator<Item = ObjectId> + '_
    {
        self.subscriptions.iter().map(|s| s.object)
    }

    /// Some watched object has been destroyed, so the entry can never be
    /// invalidated through it again.
    pub(crate) fn has_expired_target(&self) -> bool
    {
        self.subscriptions.iter().any(|s| s.target.expired())
    }
}

impl Drop for Observer
{
    fn drop(&mut self)
    {
        for s in self.subscriptions.drain(..) {
            // A destroyed object took its observer list with it.
            if let Some(object) = s.target.lock() {
                object.remove_observer(s.token);
            }
        }
    }
}

impl fmt::Debug for Observer
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("Observer")
            .field("serial", &self.serial)
            .field("data_key", &self.data_key)
            .field("observer_key", &self.observer_key)
            .field("watches", &self.watches().collect::<Vec<_>>())
            .finish()
    }
}

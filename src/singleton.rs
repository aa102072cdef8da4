//! Process-wide singletons with managed lifetimes.
//!
//! A [`Singleton`] is constructed when its first [`Manager`] is created and
//! finalized when its last manager is dropped. Code that depends on the
//! singleton holds a manager for as long as it needs it; code that merely
//! might run late (destructors, exit hooks) uses [`Singleton::get`], which
//! returns `None` while no manager is live.
//!
//! After finalization the accessor keeps returning `None`. A later `manage`
//! starts a fresh lifetime with a freshly constructed instance; nothing is
//! ever re-constructed behind a caller's back.

use std::{fmt, sync::Arc};

use parking_lot::Mutex;

struct Slot<T>
{
    managers: usize,
    lifetimes: u64,
    instance: Option<Arc<T>>,
}

pub struct Singleton<T: Send + Sync + 'static>
{
    name: &'static str,
    init: fn() -> Arc<T>,
    finalize: fn(&T),
    slot: Mutex<Slot<T>>,
}

impl<T: Send + Sync + 'static> Singleton<T>
{
    pub fn new(name: &'static str, init: fn() -> Arc<T>, finalize: fn(&T)) -> Self
    {
        Singleton {
            name,
            init,
            finalize,
            slot: Mutex::new(Slot {
                managers: 0,
                lifetimes: 0,
                instance: None,
            }),
        }
    }

    pub fn name(&self) -> &'static str { self.name }

    /// Register a new dependent, constructing the instance if this is the
    /// first one.
    pub fn manage(&'static self) -> Manager<T>
    {
        let mut slot = self.slot.lock();
        let instance = match &slot.instance {
            Some(instance) => Arc::clone(instance),
            None => {
                let instance = (self.init)();
                slot.instance = Some(Arc::clone(&instance));
                slot.lifetimes += 1;
                log::debug!("{} initialized (lifetime {})", self.name, slot.lifetimes);
                instance
            }
        };
        slot.managers += 1;
        Manager {
            singleton: self,
            instance,
        }
    }

    fn release(&self)
    {
        let finalized = {
            let mut slot = self.slot.lock();
            slot.managers -= 1;
            if slot.managers == 0 {
                slot.instance.take()
            } else {
                None
            }
        };
        if let Some(instance) = finalized {
            (self.finalize)(&instance);
            log::debug!("{} finalized", self.name);
        }
    }

    /// The live instance, or `None` before the first manager or after the
    /// last one has gone.
    pub fn get(&self) -> Option<Arc<T>> { self.slot.lock().instance.clone() }

    pub fn is_live(&self) -> bool { self.slot.lock().instance.is_some() }

    /// Number of live managers.
    pub fn managers(&self) -> usize { self.slot.lock().managers }

    /// Number of times the instance has been constructed.
    pub fn lifetimes(&self) -> u64 { self.slot.lock().lifetimes }
}

impl<T: Send + Sync + 'static> fmt::Debug for Singleton<T>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let slot = self.slot.lock();
        f.debug_struct("Singleton")
            .field("name", &self.name)
            .field("managers", &slot.managers)
            .field("lifetimes", &slot.lifetimes)
            .finish()
    }
}

/// Keeps a singleton alive. The instance is reachable through the manager
/// without a null check.
pub struct Manager<T: Send + Sync + 'static>
{
    singleton: &'static Singleton<T>,
    instance: Arc<T>,
}

impl<T: Send + Sync + 'static> Manager<T>
{
    pub fn get(&self) -> &Arc<T> { &self.instance }
}

impl<T: Send + Sync + 'static> Clone for Manager<T>
{
    fn clone(&self) -> Self { self.singleton.manage() }
}

impl<T: Send + Sync + 'static> Drop for Manager<T>
{
    fn drop(&mut self) { self.singleton.release() }
}

impl<T: Send + Sync + 'static> std::ops::Deref for Manager<T>
{
    type Target = T;

    fn deref(&self) -> &Self::Target { &self.instance }
}

impl<T: Send + Sync + 'static> fmt::Debug for Manager<T>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("Manager")
            .field("singleton", &self.singleton.name)
            .finish()
    }
}

#[cfg(feature = "global")]
pub use self::global::*;

#[cfg(feature = "global")]
mod global
{
    use std::sync::Arc;

    use lazy_static::lazy_static;

    use super::{Manager, Singleton};
    use crate::{cache::DataCache, config::CacheConfig};

    lazy_static! {
        static ref DATA_CACHE: Singleton<DataCache> = Singleton::new(
            "DataCache",
            || DataCache::new(CacheConfig::default()),
            |cache: &DataCache| {
                cache.clear();
            },
        );
    }

    /// Keep the process-wide cache alive.
    pub fn cache_manager() -> Manager<DataCache> { DATA_CACHE.manage() }

    /// The process-wide cache, or `None` while no manager or [`Runtime`] is
    /// live.
    pub fn global_cache() -> Option<Arc<DataCache>> { DATA_CACHE.get() }

    /// Process-wide state, acquired once at application entry and passed by
    /// reference from there.
    #[derive(Debug, Clone)]
    pub struct Runtime
    {
        cache: Manager<DataCache>,
    }

    impl Runtime
    {
        pub fn enter() -> Self
        {
            Runtime {
                cache: cache_manager(),
            }
        }

        pub fn cache(&self) -> &Arc<DataCache> { self.cache.get() }
    }
}

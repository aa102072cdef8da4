//! Weak control blocks and weak handles.
//!
//! An object allocates its [`ControlBlock`] the first time a weak handle is
//! requested. The block is co-owned by the object and by every weak handle, so
//! it outlives the object for as long as any handle remains. When the object is
//! destroyed it nulls the block's back-pointer under the block's lock; from then
//! on the block only answers "expired".

use std::{cmp::Ordering, fmt, marker::PhantomData, ptr::NonNull, sync::Arc};

use parking_lot::Mutex;

use crate::object::{AnyObject, Header, Observable, Strong};

#[derive(Clone, Copy)]
#[repr(transparent)]
pub(crate) struct RawObject(pub(crate) NonNull<Header>);

unsafe impl Send for RawObject {}

pub(crate) struct ControlBlock
{
    target: Mutex<Option<RawObject>>,
}

impl ControlBlock
{
    pub(crate) fn new(target: RawObject) -> Self
    {
        ControlBlock {
            target: Mutex::new(Some(target)),
        }
    }

    /// Once expired, a block never points at an object again.
    pub(crate) fn expire(&self) { *self.target.lock() = None; }

    pub(crate) fn is_expired(&self) -> bool
    {
        match *self.target.lock() {
            Some(RawObject(ptr)) => unsafe { ptr.as_ref() }.strong_count() == 0,
            None => true,
        }
    }

    /// Claims a strong count on the target, if it is still alive.
    ///
    /// The strong count is tested under the block's lock, which the destructor
    /// must take before it can free the object.
    fn upgrade(&self) -> Option<NonNull<Header>>
    {
        let target = self.target.lock();
        let RawObject(ptr) = (*target)?;
        if unsafe { ptr.as_ref() }.try_increment() {
            Some(ptr)
        } else {
            None
        }
    }
}

impl fmt::Debug for ControlBlock
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("ControlBlock")
            .field("expired", &self.is_expired())
            .finish()
    }
}

/// Untyped weak handle.
///
/// Does not extend the lifetime of the object, only of its control block.
#[derive(Clone, Default)]
pub struct WeakAny
{
    control: Option<Arc<ControlBlock>>,
}

impl WeakAny
{
    /// A handle that has never tracked anything.
    pub fn new() -> Self { Self::default() }

    pub(crate) fn from_control(control: Arc<ControlBlock>) -> Self
    {
        WeakAny {
            control: Some(control),
        }
    }

    /// `true` once the tracked object is gone or going, or if nothing was ever
    /// tracked.
    pub fn expired(&self) -> bool { self.control.as_ref().map_or(true, |c| c.is_expired()) }

    /// Attempt to obtain a strong reference.
    pub fn lock(&self) -> Option<AnyObject>
    {
        let ptr = self.control.as_ref()?.upgrade()?;
        Some(unsafe { AnyObject::from_header(ptr) })
    }

    /// Typed view of this handle, if the object is alive and holds a `T`.
    pub fn downcast<T: Send + Sync + 'static>(&self) -> Option<Weak<T>>
    {
        self.lock()?.downcast::<T>().map(|strong| strong.weak())
    }

    fn owner_addr(&self) -> usize
    {
        self.control
            .as_ref()
            .map_or(0, |c| Arc::as_ptr(c) as *const () as usize)
    }

    /// Strict weak order over control block addresses. Handles obtained from
    /// the same object are equivalent; empty handles precede all others.
    pub fn owner_before(&self, other: &WeakAny) -> bool { self.owner_addr() < other.owner_addr() }

    pub fn owner_cmp(&self, other: &WeakAny) -> Ordering
    {
        self.owner_addr().cmp(&other.owner_addr())
    }
}

impl fmt::Debug for WeakAny
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("WeakAny")
            .field("owner", &(self.owner_addr() as *const ()))
            .field("expired", &self.expired())
            .finish()
    }
}

/// Weak reference to a `Strong<T>`.
pub struct Weak<T: Send + Sync + 'static>
{
    inner: WeakAny,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Send + Sync + 'static> Weak<T>
{
    /// A handle that has never tracked anything. Always expired.
    pub fn new() -> Self
    {
        Weak {
            inner: WeakAny::new(),
            _marker: PhantomData,
        }
    }

    /// # Safety
    ///
    /// `inner` must track an object whose payload is a `T`.
    pub(crate) unsafe fn from_any(inner: WeakAny) -> Self
    {
        Weak {
            inner,
            _marker: PhantomData,
        }
    }

    pub fn expired(&self) -> bool { self.inner.expired() }

    /// Attempt to obtain a strong reference. Returns `None` once the object
    /// has been destroyed or its last strong reference is being dropped.
    pub fn lock(&self) -> Option<Strong<T>>
    {
        let ptr = self.inner.control.as_ref()?.upgrade()?;
        Some(unsafe { Strong::from_header(ptr) })
    }

    pub fn owner_before<U: Send + Sync + 'static>(&self, other: &Weak<U>) -> bool
    {
        self.inner.owner_before(&other.inner)
    }

    pub fn owner_cmp<U: Send + Sync + 'static>(&self, other: &Weak<U>) -> Ordering
    {
        self.inner.owner_cmp(&other.inner)
    }

    pub fn erase(self) -> WeakAny { self.inner }

    pub fn as_any(&self) -> &WeakAny { &self.inner }
}

impl<T: Send + Sync + 'static> Clone for Weak<T>
{
    fn clone(&self) -> Self
    {
        Weak {
            inner: self.inner.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: Send + Sync + 'static> Default for Weak<T>
{
    fn default() -> Self { Self::new() }
}

impl<T: Send + Sync + 'static> From<&Strong<T>> for Weak<T>
{
    fn from(strong: &Strong<T>) -> Self { strong.weak() }
}

impl<T: Send + Sync + 'static> fmt::Debug for Weak<T>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_tuple("Weak").field(&self.inner).finish()
    }
}

impl From<&AnyObject> for WeakAny
{
    fn from(object: &AnyObject) -> Self { object.weak_any() }
}

//! Reference-counted objects.
//!
//! Every object lives in a single heap allocation holding a [`Header`] followed
//! by the user data. The header carries the strong count, the modification time,
//! the observer list and the lazily allocated weak control block.
//!
//! [`Strong<T>`] is the typed owning handle, [`AnyObject`] the type-erased one.
//! Both expose the shared object operations through [`Observable`].

use std::{
    any::{type_name, TypeId},
    fmt,
    marker::PhantomData,
    mem,
    num::NonZeroU64,
    ops::Deref,
    ptr::NonNull,
    sync::{
        atomic::{self, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;

use self::sealed::Sealed;
use crate::{
    control::{ControlBlock, RawObject, Weak, WeakAny},
    notify::{Callback, ModifiedEvent, ObserverList, ObserverToken},
};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of an object.
///
/// Identities are handed out from a serial counter and never reused, unlike
/// addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(NonZeroU64);

impl ObjectId
{
    fn fresh() -> Self
    {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        ObjectId(NonZeroU64::new(id).unwrap_or(NonZeroU64::MAX))
    }

    pub fn get(self) -> u64 { self.0.get() }
}

impl fmt::Display for ObjectId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "#{}", self.0) }
}

pub struct Header
{
    strong: AtomicUsize,
    mtime: AtomicU64,
    id: ObjectId,
    type_id: TypeId,
    type_name: &'static str,
    destroy: unsafe fn(NonNull<Header>),
    control: Mutex<Option<Arc<ControlBlock>>>,
    observers: Mutex<ObserverList>,
}

impl Header
{
    fn new<T: Send + Sync + 'static>() -> Self
    {
        Header {
            strong: AtomicUsize::new(1),
            mtime: AtomicU64::new(0),
            id: ObjectId::fresh(),
            type_id: TypeId::of::<T>(),
            type_name: type_name::<T>(),
            destroy: destroy::<T>,
            control: Mutex::new(None),
            observers: Mutex::new(ObserverList::default()),
        }
    }

    pub(crate) fn id(&self) -> ObjectId { self.id }

    pub(crate) fn mtime(&self) -> u64 { self.mtime.load(Ordering::Acquire) }

    pub(crate) fn strong_count(&self) -> usize { self.strong.load(Ordering::Acquire) }

    fn increment(&self)
    {
        if self.strong.fetch_add(1, Ordering::Relaxed) > isize::MAX as usize {
            std::process::abort();
        }
    }

    /// Increments the strong count unless it already reached zero, in which
    /// case the object is being torn down and must not be revived.
    pub(crate) fn try_increment(&self) -> bool
    {
        let mut n = self.strong.load(Ordering::Relaxed);
        loop {
            if n == 0 {
                return false;
            }
            match self.strong.compare_exchange_weak(
                n,
                n + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(m) => n = m,
            }
        }
    }

    /// # Safety
    ///
    /// `ptr` must point to a live header whose strong count this call owns.
    unsafe fn release(ptr: NonNull<Header>)
    {
        if ptr.as_ref().strong.fetch_sub(1, Ordering::Release) != 1 {
            return;
        }
        atomic::fence(Ordering::Acquire);
        (ptr.as_ref().destroy)(ptr)
    }

    fn weak(&self, ptr: NonNull<Header>) -> WeakAny
    {
        let mut control = self.control.lock();
        let control = control.get_or_insert_with(|| Arc::new(ControlBlock::new(RawObject(ptr))));
        WeakAny::from_control(Arc::clone(control))
    }

    pub(crate) fn subscribe(&self, callback: Callback) -> ObserverToken
    {
        self.observers.lock().add(callback)
    }

    pub(crate) fn unsubscribe(&self, token: ObserverToken) -> bool
    {
        self.observers.lock().remove(token)
    }

    fn modified(&self) -> u64
    {
        let mtime = self.mtime.fetch_add(1, Ordering::AcqRel) + 1;
        let snapshot = self.observers.lock().snapshot();
        if !snapshot.is_empty() {
            log::trace!(
                "{} {} modified, notifying {} observers",
                self.type_name,
                self.id,
                snapshot.len()
            );
            let event = ModifiedEvent {
                object: self.id,
                mtime,
            };
            for callback in snapshot {
                callback(&event);
            }
        }
        mtime
    }
}

/// Allocation layout of an object. The header comes first so that a
/// `NonNull<Header>` can be cast back once the type tag has been checked.
#[repr(C)]
struct ObjectBox<T: 'static>
{
    header: Header,
    data: T,
}

/// Runs once the strong count has reached zero.
///
/// The control block is expired under its own lock before the allocation is
/// released, so a concurrent `Weak::lock` either completes its upgrade check
/// first (and fails it, the count being zero) or finds the back-pointer gone.
unsafe fn destroy<T: 'static>(ptr: NonNull<Header>)
{
    let control = ptr.as_ref().control.lock().take();
    if let Some(control) = control {
        control.expire();
    }
    mem::drop(Box::from_raw(ptr.cast::<ObjectBox<T>>().as_ptr()));
}

pub(crate) mod sealed
{
    use std::ptr::NonNull;

    use super::Header;

    pub trait Sealed
    {
        fn header_ptr(&self) -> NonNull<Header>;

        fn header(&self) -> &Header { unsafe { self.header_ptr().as_ref() } }
    }
}

/// Operations shared by every strong object handle.
pub trait Observable: Sealed
{
    /// Process-unique identity.
    fn id(&self) -> ObjectId { self.header().id() }

    /// Current modification time. Starts at zero and only ever grows.
    fn mtime(&self) -> u64 { self.header().mtime() }

    /// Bumps the modification time and synchronously notifies every observer,
    /// in subscription order. Returns the new modification time.
    fn modified(&self) -> u64 { self.header().modified() }

    /// Subscribes `callback` to modification events of this object.
    fn add_observer<F>(&self, callback: F) -> ObserverToken
    where
        F: Fn(&ModifiedEvent) + Send + Sync + 'static,
        Self: Sized,
    {
        self.header().subscribe(Arc::new(callback))
    }

    /// Unsubscribes. Returns `false` if the token was not subscribed.
    fn remove_observer(&self, token: ObserverToken) -> bool { self.header().unsubscribe(token) }

    /// Number of subscribed observers.
    fn observer_count(&self) -> usize { self.header().observers.lock().len() }

    /// Number of strong handles, including this one.
    fn strong_count(&self) -> usize { self.header().strong_count() }

    /// Name of the concrete payload type.
    fn type_name(&self) -> &'static str { self.header().type_name }

    /// An untyped weak handle to this object.
    fn weak_any(&self) -> WeakAny { self.header().weak(self.header_ptr()) }

    /// A new type-erased strong handle to this object.
    fn as_any(&self) -> AnyObject
    {
        self.header().increment();
        AnyObject {
            ptr: self.header_ptr(),
        }
    }
}

/// Strong, typed reference to a reference-counted object.
///
/// Dereferences to the payload. Payloads are shared, so mutation goes through
/// interior mutability followed by a call to [`Observable::modified`].
pub struct Strong<T: Send + Sync + 'static>
{
    ptr: NonNull<ObjectBox<T>>,
    _marker: PhantomData<ObjectBox<T>>,
}

unsafe impl<T: Send + Sync + 'static> Send for Strong<T> {}
unsafe impl<T: Send + Sync + 'static> Sync for Strong<T> {}

impl<T: Send + Sync + 'static> Strong<T>
{
    pub fn new(data: T) -> Self
    {
        let boxed = Box::new(ObjectBox {
            header: Header::new::<T>(),
            data,
        });
        Strong {
            ptr: NonNull::from(Box::leak(boxed)),
            _marker: PhantomData,
        }
    }

    /// Produce a weak handle that does not keep the object alive.
    pub fn weak(&self) -> Weak<T>
    {
        // SAFETY: the control block tracks this very allocation.
        unsafe { Weak::from_any(self.weak_any()) }
    }

    pub fn into_any(self) -> AnyObject
    {
        let ptr = self.ptr.cast();
        mem::forget(self);
        AnyObject { ptr }
    }

    pub fn ptr_eq(this: &Self, other: &Self) -> bool { this.ptr == other.ptr }

    /// # Safety
    ///
    /// `ptr` must head an `ObjectBox<T>` and the caller must own one strong
    /// count on it.
    pub(crate) unsafe fn from_header(ptr: NonNull<Header>) -> Self
    {
        Strong {
            ptr: ptr.cast(),
            _marker: PhantomData,
        }
    }
}

impl<T: Send + Sync + 'static> Sealed for Strong<T>
{
    fn header_ptr(&self) -> NonNull<Header> { self.ptr.cast() }
}

impl<T: Send + Sync + 'static> Observable for Strong<T> {}

impl<T: Send + Sync + 'static> Deref for Strong<T>
{
    type Target = T;

    fn deref(&self) -> &Self::Target { unsafe { &self.ptr.as_ref().data } }
}

impl<T: Send + Sync + 'static> Clone for Strong<T>
{
    fn clone(&self) -> Self
    {
        self.header().increment();
        Strong {
            ptr: self.ptr,
            _marker: PhantomData,
        }
    }
}

impl<T: Send + Sync + 'static> Drop for Strong<T>
{
    fn drop(&mut self) { unsafe { Header::release(self.ptr.cast()) } }
}

impl<T: Send + Sync + 'static> From<T> for Strong<T>
{
    fn from(data: T) -> Self { Strong::new(data) }
}

impl<T: Send + Sync + fmt::Debug + 'static> fmt::Debug for Strong<T>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("Strong")
            .field("id", &self.id())
            .field("mtime", &self.mtime())
            .field("data", &**self)
            .finish()
    }
}

/// Type-erased strong reference, as stored by the cache.
pub struct AnyObject
{
    ptr: NonNull<Header>,
}

unsafe impl Send for AnyObject {}
unsafe impl Sync for AnyObject {}

impl AnyObject
{
    /// # Safety
    ///
    /// The caller must own one strong count on `ptr`.
    pub(crate) unsafe fn from_header(ptr: NonNull<Header>) -> Self { AnyObject { ptr } }

    pub fn is<T: Send + Sync + 'static>(&self) -> bool
    {
        self.header().type_id == TypeId::of::<T>()
    }

    /// A typed strong handle, if the payload is a `T`.
    pub fn downcast<T: Send + Sync + 'static>(&self) -> Option<Strong<T>>
    {
        if self.is::<T>() {
            self.header().increment();
            Some(unsafe { Strong::from_header(self.ptr) })
        } else {
            None
        }
    }

    pub fn ptr_eq(this: &Self, other: &Self) -> bool { this.ptr == other.ptr }
}

impl Sealed for AnyObject
{
    fn header_ptr(&self) -> NonNull<Header> { self.ptr }
}

impl Observable for AnyObject {}

impl Clone for AnyObject
{
    fn clone(&self) -> Self { self.as_any() }
}

impl Drop for AnyObject
{
    fn drop(&mut self) { unsafe { Header::release(self.ptr) } }
}

impl<T: Send + Sync + 'static> From<Strong<T>> for AnyObject
{
    fn from(it: Strong<T>) -> Self { it.into_any() }
}

impl fmt::Debug for AnyObject
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("AnyObject")
            .field("id", &self.id())
            .field("type_name", &self.type_name())
            .field("mtime", &self.mtime())
            .finish()
    }
}

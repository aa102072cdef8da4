//! Cache keys.
//!
//! A [`Key`] is an ordered list of [`Component`]s: strings, integers, object
//! identities and nested keys. An object component captures the object's
//! modification time when the key is built, so a key built after
//! `modified()` never equals one built before it.

use std::{
    fmt,
    hash::{BuildHasher, Hash, Hasher},
    mem,
    sync::Arc,
};

use ahash::RandomState;

use crate::{
    control::WeakAny,
    object::{AnyObject, ObjectId, Observable, Strong},
};

const SEEDS: [u64; 4] = [
    0x243f_6a88_85a3_08d3,
    0x1319_8a2e_0370_7344,
    0xa409_3822_299f_31d0,
    0x082e_fa98_ec4e_6c89,
];

fn hasher() -> impl Hasher
{
    RandomState::with_seeds(SEEDS[0], SEEDS[1], SEEDS[2], SEEDS[3]).build_hasher()
}

/// An object as seen by a key: its identity, the modification time it had when
/// the key was built, and a weak handle used to find it again.
#[derive(Clone)]
pub struct ObjectRef
{
    id: ObjectId,
    mtime: u64,
    handle: WeakAny,
}

impl ObjectRef
{
    pub fn capture<O: Observable>(object: &O) -> Self
    {
        ObjectRef {
            id: object.id(),
            mtime: object.mtime(),
            handle: object.weak_any(),
        }
    }

    pub fn id(&self) -> ObjectId { self.id }

    /// Modification time at capture.
    pub fn mtime(&self) -> u64 { self.mtime }

    pub fn lock(&self) -> Option<AnyObject> { self.handle.lock() }

    /// Object still alive and not modified since capture.
    pub fn is_current(&self) -> bool
    {
        self.lock()
            .map_or(false, |object| object.mtime() == self.mtime)
    }
}

impl PartialEq for ObjectRef
{
    fn eq(&self, other: &Self) -> bool { self.id == other.id && self.mtime == other.mtime }
}

impl Eq for ObjectRef {}

impl Hash for ObjectRef
{
    fn hash<H: Hasher>(&self, state: &mut H)
    {
        self.id.hash(state);
        self.mtime.hash(state);
    }
}

impl fmt::Debug for ObjectRef
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}@{}", self.id, self.mtime)
    }
}

/// One element of a key.
///
/// Signed and unsigned integers are distinct kinds: `Int(1) != UInt(1)`.
#[derive(Clone, PartialEq, Eq)]
pub enum Component
{
    Str(Arc<str>),
    Int(i64),
    UInt(u64),
    Object(ObjectRef),
    Key(Key),
}

impl Hash for Component
{
    fn hash<H: Hasher>(&self, state: &mut H)
    {
        mem::discriminant(self).hash(state);
        match self {
            Component::Str(s) => s.hash(state),
            Component::Int(i) => i.hash(state),
            Component::UInt(u) => u.hash(state),
            Component::Object(o) => o.hash(state),
            Component::Key(k) => k.hash.hash(state),
        }
    }
}

impl fmt::Debug for Component
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            Component::Str(s) => write!(f, "{:?}", s),
            Component::Int(i) => write!(f, "{}", i),
            Component::UInt(u) => write!(f, "{}u", u),
            Component::Object(o) => write!(f, "{:?}", o),
            Component::Key(k) => write!(f, "{:?}", k),
        }
    }
}

impl From<&str> for Component
{
    fn from(s: &str) -> Self { Component::Str(Arc::from(s)) }
}

impl From<String> for Component
{
    fn from(s: String) -> Self { Component::Str(Arc::from(s)) }
}

impl From<&String> for Component
{
    fn from(s: &String) -> Self { Component::Str(Arc::from(s.as_str())) }
}

macro_rules! int_components {
    ($variant:ident as $wide:ty: $($int:ty),*) => {
        $(
            impl From<$int> for Component
            {
                fn from(i: $int) -> Self { Component::$variant(i as $wide) }
            }
        )*
    };
}

int_components!(Int as i64: i8, i16, i32, i64, isize);
int_components!(UInt as u64: u8, u16, u32, u64, usize);

impl<T: Send + Sync + 'static> From<&Strong<T>> for Component
{
    fn from(object: &Strong<T>) -> Self { Component::Object(ObjectRef::capture(object)) }
}

impl From<&AnyObject> for Component
{
    fn from(object: &AnyObject) -> Self { Component::Object(ObjectRef::capture(object)) }
}

impl From<ObjectRef> for Component
{
    fn from(object: ObjectRef) -> Self { Component::Object(object) }
}

impl From<Key> for Component
{
    fn from(key: Key) -> Self { Component::Key(key) }
}

impl From<&Key> for Component
{
    fn from(key: &Key) -> Self { Component::Key(key.clone()) }
}

/// Identity of a cache request.
///
/// Hash and equality cover every component, in order. Keys do not own the
/// objects they mention.
#[derive(Clone)]
pub struct Key
{
    hash: u64,
    components: Vec<Component>,
}

impl Key
{
    pub fn empty() -> Self { Self::from_components(Vec::new()) }

    pub fn from_components(components: Vec<Component>) -> Self
    {
        Key {
            hash: Self::hash_components(&components),
            components,
        }
    }

    fn hash_components(components: &[Component]) -> u64
    {
        let mut state = hasher();
        components.len().hash(&mut state);
        for c in components {
            c.hash(&mut state);
        }
        state.finish()
    }

    pub fn push(&mut self, component: impl Into<Component>)
    {
        self.components.push(component.into());
        self.hash = Self::hash_components(&self.components);
    }

    pub fn with(mut self, component: impl Into<Component>) -> Self
    {
        self.push(component);
        self
    }

    /// The precomputed hash.
    pub fn hash_value(&self) -> u64 { self.hash }

    pub fn components(&self) -> &[Component] { &self.components }

    pub fn len(&self) -> usize { self.components.len() }

    pub fn is_empty(&self) -> bool { self.components.is_empty() }

    /// Every object mentioned by this key, including those in nested keys,
    /// in order of appearance.
    pub fn objects(&self) -> Vec<&ObjectRef>
    {
        let mut res = Vec::new();
        self.collect_objects(&mut res);
        res
    }

    fn collect_objects<'a>(&'a self, res: &mut Vec<&'a ObjectRef>)
    {
        for c in &self.components {
            match c {
                Component::Object(o) => res.push(o),
                Component::Key(k) => k.collect_objects(res),
                _ => {}
            }
        }
    }

    /// Every mentioned object is alive at its captured modification time.
    pub fn is_current(&self) -> bool { self.objects().iter().all(|o| o.is_current()) }
}

impl PartialEq for Key
{
    fn eq(&self, other: &Self) -> bool
    {
        self.hash == other.hash && self.components == other.components
    }
}

impl Eq for Key {}

impl Hash for Key
{
    fn hash<H: Hasher>(&self, state: &mut H) { state.write_u64(self.hash) }
}

impl fmt::Debug for Key
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let mut t = f.debug_tuple("");
        for c in &self.components {
            t.field(c);
        }
        t.finish()
    }
}

impl Default for Key
{
    fn default() -> Self { Self::empty() }
}

impl FromIterator<Component> for Key
{
    fn from_iter<I: IntoIterator<Item = Component>>(iter: I) -> Self
    {
        Self::from_components(iter.into_iter().collect())
    }
}

/// Builds a [`Key`](crate::Key) from anything convertible into a
/// [`Component`](crate::Component).
///
/// ```
/// use depcache::{key, Observable, Strong};
///
/// let o = Strong::new(0u8);
/// let k1 = key!["alpha", 10, &o];
/// let k2 = key!["alpha", 10, &o];
/// assert_eq!(k1, k2);
///
/// o.modified();
/// assert_ne!(k1, key!["alpha", 10, &o]);
/// ```
#[macro_export]
macro_rules! key {
    () => {
        $crate::Key::empty()
    };
    ($($component:expr),+ $(,)?) => {
        $crate::Key::from_components(vec![$($crate::Component::from($component)),+])
    };
}

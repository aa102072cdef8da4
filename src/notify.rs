//! Modification events and per-object observer lists.

use std::{fmt, sync::Arc};

use crate::object::ObjectId;

/// Delivered to every observer of an object when it is marked modified.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModifiedEvent
{
    /// The object that was modified.
    pub object: ObjectId,

    /// Its modification time after the change.
    pub mtime: u64,
}

/// Handle returned by `add_observer`, used to unsubscribe again.
///
/// Tokens are only meaningful for the object that issued them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverToken(u64);

impl fmt::Display for ObserverToken
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "token#{}", self.0) }
}

pub(crate) type Callback = Arc<dyn Fn(&ModifiedEvent) + Send + Sync>;

/// Subscribers of a single object, in subscription order.
#[derive(Default)]
pub(crate) struct ObserverList
{
    next: u64,
    callbacks: Vec<(ObserverToken, Callback)>,
}

impl ObserverList
{
    pub(crate) fn add(&mut self, callback: Callback) -> ObserverToken
    {
        let token = ObserverToken(self.next);
        self.next += 1;
        self.callbacks.push((token, callback));
        token
    }

    pub(crate) fn remove(&mut self, token: ObserverToken) -> bool
    {
        match self.callbacks.iter().position(|(t, _)| *t == token) {
            Some(i) => {
                self.callbacks.remove(i);
                true
            }
            None => false,
        }
    }

    pub(crate) fn len(&self) -> usize { self.callbacks.len() }

    /// Callbacks are invoked from a copy so that observers may unsubscribe
    /// (themselves or others) while a notification is being delivered.
    pub(crate) fn snapshot(&self) -> Vec<Callback>
    {
        self.callbacks.iter().map(|(_, cb)| Arc::clone(cb)).collect()
    }
}

impl fmt::Debug for ObserverList
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("ObserverList")
            .field("next", &self.next)
            .field("len()", &self.len())
            .finish()
    }
}

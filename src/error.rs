use crate::object::ObjectId;

/// Reasons an insert was refused. The cache is left untouched in every case.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError
{
    #[error("stale key: object {object} captured at mtime {captured}, now at mtime {current}")]
    StaleKey
    {
        object: ObjectId,
        captured: u64,
        current: u64,
    },
    #[error("object {0} referenced by the key has been destroyed")]
    Expired(ObjectId),
}

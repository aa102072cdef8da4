use serde::{Deserialize, Serialize};

/// What `insert` does when the data key is already cached.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsertPolicy
{
    /// Leave the existing entry in place. Equal keys embed equal modification
    /// times, so the existing payload is assumed current.
    #[default]
    Keep,
    /// Evict the existing entry and cache the new payload.
    Replace,
}

/// Configuration for `DataCache` instances.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig
{
    /// Handling of a second insert under an equal data key.
    pub insert_policy: InsertPolicy,
    /// Reject inserts whose keys embed modification times older than the
    /// objects' current ones.
    pub validate_mtimes: bool,
}

impl Default for CacheConfig
{
    fn default() -> Self
    {
        Self {
            insert_policy: InsertPolicy::Keep,
            validate_mtimes: true,
        }
    }
}

impl CacheConfig
{
    #[must_use]
    pub const fn new(insert_policy: InsertPolicy, validate_mtimes: bool) -> Self
    {
        Self {
            insert_policy,
            validate_mtimes,
        }
    }

    #[must_use]
    pub const fn with_insert_policy(mut self, insert_policy: InsertPolicy) -> Self
    {
        self.insert_policy = insert_policy;
        self
    }

    #[must_use]
    pub const fn with_validate_mtimes(mut self, validate_mtimes: bool) -> Self
    {
        self.validate_mtimes = validate_mtimes;
        self
    }
}

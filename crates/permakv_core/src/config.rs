//! Typed configuration bag for opening a database.
//!
//! Options are held in a tagged map keyed by name. Integral getters
//! convert freely between signed and unsigned as long as the value is
//! representable; anything else is a [`Error::ConfigTypeError`].

use crate::comparator::Comparator;
use crate::error::{Error, Result};
use permakv_pool::Pool;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Recognized option: path to the backing file.
pub const OPT_PATH: &str = "path";
/// Recognized option: pool size in bytes, used at creation.
pub const OPT_SIZE: &str = "size";
/// Recognized option: create the pool when absent (0/1).
pub const OPT_FORCE_CREATE: &str = "force_create";
/// Recognized option: comparator for ordered engines.
pub const OPT_COMPARATOR: &str = "comparator";
/// Recognized option: an already-open pool handle.
pub const OPT_OID: &str = "oid";

/// A single configuration value.
enum ConfigValue {
    String(String),
    Int64(i64),
    UInt64(u64),
    Data(Vec<u8>),
    Object(Box<dyn Any + Send + Sync>),
    Comparator(Arc<dyn Comparator>),
    Oid(Arc<Pool>),
}

impl fmt::Debug for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(v) => f.debug_tuple("String").field(v).finish(),
            Self::Int64(v) => f.debug_tuple("Int64").field(v).finish(),
            Self::UInt64(v) => f.debug_tuple("UInt64").field(v).finish(),
            Self::Data(v) => f.debug_tuple("Data").field(&v.len()).finish(),
            Self::Object(_) => f.write_str("Object(..)"),
            Self::Comparator(c) => f.debug_tuple("Comparator").field(&c.name()).finish(),
            Self::Oid(_) => f.write_str("Oid(..)"),
        }
    }
}

/// Configuration for opening a database.
///
/// Consumed by [`crate::Db::open`]; the engine owns it afterwards.
///
/// # Example
///
/// ```rust,ignore
/// let config = Config::new()
///     .put_path("/mnt/pmem/store")
///     .put_size(64 * 1024 * 1024)
///     .put_force_create(true);
/// let db = Db::open("cmap", config)?;
/// ```
#[derive(Debug, Default)]
pub struct Config {
    entries: HashMap<String, ConfigValue>,
}

impl Config {
    /// Creates an empty configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a string option.
    #[must_use]
    pub fn put_string(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.entries
            .insert(key.into(), ConfigValue::String(value.into()));
        self
    }

    /// Stores a signed integer option.
    #[must_use]
    pub fn put_int64(mut self, key: impl Into<String>, value: i64) -> Self {
        self.entries.insert(key.into(), ConfigValue::Int64(value));
        self
    }

    /// Stores an unsigned integer option.
    #[must_use]
    pub fn put_uint64(mut self, key: impl Into<String>, value: u64) -> Self {
        self.entries.insert(key.into(), ConfigValue::UInt64(value));
        self
    }

    /// Stores a raw byte blob option.
    #[must_use]
    pub fn put_data(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.entries.insert(key.into(), ConfigValue::Data(value.into()));
        self
    }

    /// Stores an arbitrary owned object option.
    #[must_use]
    pub fn put_object<T: Any + Send + Sync>(mut self, key: impl Into<String>, value: T) -> Self {
        self.entries
            .insert(key.into(), ConfigValue::Object(Box::new(value)));
        self
    }

    /// Stores the comparator for an ordered engine.
    #[must_use]
    pub fn put_comparator(mut self, comparator: Arc<dyn Comparator>) -> Self {
        self.entries
            .insert(OPT_COMPARATOR.into(), ConfigValue::Comparator(comparator));
        self
    }

    /// Stores the path to the backing file.
    #[must_use]
    pub fn put_path(self, path: impl Into<String>) -> Self {
        self.put_string(OPT_PATH, path)
    }

    /// Stores the pool size used at creation.
    #[must_use]
    pub fn put_size(self, size: u64) -> Self {
        self.put_uint64(OPT_SIZE, size)
    }

    /// Stores the force-create flag.
    #[must_use]
    pub fn put_force_create(self, force: bool) -> Self {
        self.put_uint64(OPT_FORCE_CREATE, u64::from(force))
    }

    /// Stores an already-open pool handle instead of a path.
    #[must_use]
    pub fn put_oid(mut self, pool: Arc<Pool>) -> Self {
        self.entries.insert(OPT_OID.into(), ConfigValue::Oid(pool));
        self
    }

    /// Fetches a string option.
    pub fn get_string(&self, key: &str) -> Result<&str> {
        match self.entries.get(key) {
            None => Err(Error::NotFound),
            Some(ConfigValue::String(v)) => Ok(v),
            Some(other) => Err(Error::config_type(format!(
                "{key:?} holds {other:?}, requested string"
            ))),
        }
    }

    /// Fetches a signed integer option.
    ///
    /// Unsigned values convert when they fit in `i64`.
    pub fn get_int64(&self, key: &str) -> Result<i64> {
        match self.entries.get(key) {
            None => Err(Error::NotFound),
            Some(ConfigValue::Int64(v)) => Ok(*v),
            Some(ConfigValue::UInt64(v)) => i64::try_from(*v).map_err(|_| {
                Error::config_type(format!("{key:?} value {v} overflows int64"))
            }),
            Some(other) => Err(Error::config_type(format!(
                "{key:?} holds {other:?}, requested int64"
            ))),
        }
    }

    /// Fetches an unsigned integer option.
    ///
    /// Signed values convert when non-negative.
    pub fn get_uint64(&self, key: &str) -> Result<u64> {
        match self.entries.get(key) {
            None => Err(Error::NotFound),
            Some(ConfigValue::UInt64(v)) => Ok(*v),
            Some(ConfigValue::Int64(v)) => u64::try_from(*v).map_err(|_| {
                Error::config_type(format!("{key:?} value {v} is negative"))
            }),
            Some(other) => Err(Error::config_type(format!(
                "{key:?} holds {other:?}, requested uint64"
            ))),
        }
    }

    /// Fetches a raw byte blob option.
    pub fn get_data(&self, key: &str) -> Result<&[u8]> {
        match self.entries.get(key) {
            None => Err(Error::NotFound),
            Some(ConfigValue::Data(v)) => Ok(v),
            Some(other) => Err(Error::config_type(format!(
                "{key:?} holds {other:?}, requested data"
            ))),
        }
    }

    /// Fetches an object option of concrete type `T`.
    pub fn get_object<T: Any>(&self, key: &str) -> Result<&T> {
        match self.entries.get(key) {
            None => Err(Error::NotFound),
            Some(ConfigValue::Object(v)) => v.downcast_ref::<T>().ok_or_else(|| {
                Error::config_type(format!("{key:?} holds an object of a different type"))
            }),
            Some(other) => Err(Error::config_type(format!(
                "{key:?} holds {other:?}, requested object"
            ))),
        }
    }

    /// Removes and returns the configured comparator, if any.
    pub(crate) fn take_comparator(&mut self) -> Result<Option<Arc<dyn Comparator>>> {
        match self.entries.remove(OPT_COMPARATOR) {
            None => Ok(None),
            Some(ConfigValue::Comparator(c)) => Ok(Some(c)),
            Some(other) => Err(Error::config_type(format!(
                "{OPT_COMPARATOR:?} holds {other:?}, expected a comparator"
            ))),
        }
    }

    /// Removes and returns the configured pool handle, if any.
    pub(crate) fn take_oid(&mut self) -> Result<Option<Arc<Pool>>> {
        match self.entries.remove(OPT_OID) {
            None => Ok(None),
            Some(ConfigValue::Oid(p)) => Ok(Some(p)),
            Some(other) => Err(Error::config_type(format!(
                "{OPT_OID:?} holds {other:?}, expected a pool handle"
            ))),
        }
    }

    pub(crate) fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_and_get_all_kinds() {
        struct Custom {
            a: i32,
        }

        let cfg = Config::new()
            .put_string("string", "abc")
            .put_int64("int", 123)
            .put_data("blob", vec![1u8, 15, 77])
            .put_object("object", Custom { a: 7 });

        assert_eq!(cfg.get_string("string").unwrap(), "abc");
        assert_eq!(cfg.get_int64("int").unwrap(), 123);
        assert_eq!(cfg.get_data("blob").unwrap(), &[1, 15, 77]);
        assert_eq!(cfg.get_object::<Custom>("object").unwrap().a, 7);
    }

    #[test]
    fn missing_keys_are_not_found() {
        let cfg = Config::new().put_int64("init", 0);

        assert!(cfg.get_string("nope").unwrap_err().is_not_found());
        assert!(cfg.get_int64("nope").unwrap_err().is_not_found());
        assert!(cfg.get_uint64("nope").unwrap_err().is_not_found());
        assert!(cfg.get_data("nope").unwrap_err().is_not_found());
        assert!(cfg.get_object::<u32>("nope").unwrap_err().is_not_found());
    }

    #[test]
    fn integral_conversion_rules() {
        let cfg = Config::new()
            .put_int64("int", 123)
            .put_uint64("uint", 123)
            .put_int64("negative-int", -123)
            .put_uint64("uint-max", u64::MAX);

        assert_eq!(cfg.get_int64("int").unwrap(), 123);
        assert_eq!(cfg.get_uint64("int").unwrap(), 123);
        assert_eq!(cfg.get_int64("uint").unwrap(), 123);
        assert_eq!(cfg.get_uint64("uint").unwrap(), 123);
        assert_eq!(cfg.get_int64("negative-int").unwrap(), -123);

        assert!(matches!(
            cfg.get_uint64("negative-int").unwrap_err(),
            Error::ConfigTypeError { .. }
        ));
        assert!(matches!(
            cfg.get_int64("uint-max").unwrap_err(),
            Error::ConfigTypeError { .. }
        ));
        assert_eq!(cfg.get_uint64("uint-max").unwrap(), u64::MAX);
    }

    #[test]
    fn category_mismatch_is_a_type_error() {
        let cfg = Config::new().put_int64("int", 1);
        assert!(matches!(
            cfg.get_string("int").unwrap_err(),
            Error::ConfigTypeError { .. }
        ));
        assert!(matches!(
            cfg.get_data("int").unwrap_err(),
            Error::ConfigTypeError { .. }
        ));
    }

    #[test]
    fn object_downcast_mismatch_is_a_type_error() {
        let cfg = Config::new().put_object("object", 42u32);
        assert!(matches!(
            cfg.get_object::<String>("object").unwrap_err(),
            Error::ConfigTypeError { .. }
        ));
    }
}

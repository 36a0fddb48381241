//! Named comparators and the process-wide registry.
//!
//! Ordered engines persist the name of their comparator in the pool
//! header so recovery can re-bind the same ordering. Comparators must be
//! thread-safe and side-effect-free; a comparator that disagrees with
//! the one the container was built under silently corrupts the order,
//! which is why an unresolvable or conflicting name is a fatal open
//! error.

use crate::error::{Error, Result};
use parking_lot::RwLock;
use permakv_pool::Pool;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

/// A named three-way comparison over byte strings.
pub trait Comparator: Send + Sync {
    /// Stable name persisted with the container.
    fn name(&self) -> &str;

    /// Compares two keys.
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;
}

/// Plain byte-order comparison; the default for ordered engines.
#[derive(Debug, Default)]
pub struct LexicographicComparator;

/// Name under which the default comparator is registered.
pub const LEXICOGRAPHIC: &str = "lexicographic";

impl Comparator for LexicographicComparator {
    fn name(&self) -> &str {
        LEXICOGRAPHIC
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}

fn registry() -> &'static RwLock<HashMap<String, Arc<dyn Comparator>>> {
    static REGISTRY: OnceLock<RwLock<HashMap<String, Arc<dyn Comparator>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut map: HashMap<String, Arc<dyn Comparator>> = HashMap::new();
        map.insert(LEXICOGRAPHIC.to_string(), Arc::new(LexicographicComparator));
        RwLock::new(map)
    })
}

/// Registers a comparator so recovery can re-bind it by name.
///
/// Registering a second comparator under the same name replaces the
/// first.
pub fn register_comparator(comparator: Arc<dyn Comparator>) {
    let name = comparator.name().to_string();
    registry().write().insert(name, comparator);
}

/// Looks up a registered comparator by name.
#[must_use]
pub fn lookup_comparator(name: &str) -> Option<Arc<dyn Comparator>> {
    registry().read().get(name).cloned()
}

/// Resolves the comparator an ordered engine must run under.
///
/// The name persisted in the pool wins: a configured comparator must
/// match it, and with no configured comparator the name is resolved
/// through the registry. A fresh pool (no persisted name) binds the
/// configured comparator, defaulting to [`LexicographicComparator`].
pub(crate) fn bind_comparator(
    pool: &Pool,
    configured: Option<Arc<dyn Comparator>>,
) -> Result<Arc<dyn Comparator>> {
    let persisted = pool.comparator_name()?;
    match (persisted, configured) {
        (None, None) => Ok(Arc::new(LexicographicComparator)),
        (None, Some(configured)) => Ok(configured),
        (Some(name), Some(configured)) => {
            if configured.name() == name {
                Ok(configured)
            } else {
                Err(Error::comparator_mismatch(format!(
                    "pool was built under {name:?}, configured comparator is {:?}",
                    configured.name()
                )))
            }
        }
        (Some(name), None) => lookup_comparator(&name).ok_or_else(|| {
            Error::comparator_mismatch(format!(
                "pool was built under {name:?}, which is not registered"
            ))
        }),
    }
}

//! Database handle: open-time validation, engine dispatch, and the
//! public operation surface.

use crate::config::{Config, OPT_FORCE_CREATE, OPT_PATH, OPT_SIZE};
use crate::engines::{cmap, csmap, radix, stree};
use crate::engines::{BatchTransaction, Cmap, Csmap, KvEngine, Radix, Stree};
use crate::error::{Error, Result};
use crate::iterator::{KvIterator, ReadIterator, WriteIterator};
use permakv_pool::{Pool, PoolError};
use std::ops::ControlFlow;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// A database: one engine bound to one pool.
///
/// Opened with [`Db::open`]; closing is dropping the handle. Multiple
/// handles over distinct pools may coexist in a process.
///
/// Every operation first verifies the calling thread is not inside a
/// pool transaction, so callbacks must not re-enter the database.
pub struct Db {
    pool: Arc<Pool>,
    engine: Box<dyn KvEngine>,
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db").field("engine", &self.engine.name()).finish()
    }
}

fn layout_of(engine: &str) -> Result<&'static str> {
    match engine {
        "cmap" => Ok(cmap::LAYOUT),
        "stree" => Ok(stree::LAYOUT),
        "csmap" => Ok(csmap::LAYOUT),
        "radix" => Ok(radix::LAYOUT),
        other => Err(Error::wrong_engine(format!("unknown engine {other:?}"))),
    }
}

fn open_pool(config: &Config, layout: &str) -> Result<Pool> {
    let path_str = match config.get_string(OPT_PATH) {
        Ok(path) => path.to_string(),
        Err(Error::NotFound) => {
            return Err(Error::invalid_argument("neither path nor oid supplied"))
        }
        Err(err) => return Err(err),
    };
    let path = Path::new(&path_str);

    let force_create = match config.get_uint64(OPT_FORCE_CREATE) {
        Ok(value) => value != 0,
        Err(Error::NotFound) => false,
        Err(err) => return Err(err),
    };

    if path.exists() {
        return Pool::open(path, layout).map_err(|err| match err {
            PoolError::LayoutMismatch { found, requested } => Error::wrong_engine(format!(
                "pool at {path_str:?} holds layout {found:?}, engine wants {requested:?}"
            )),
            PoolError::Io(io) => Error::wrong_path(&path_str, io.to_string()),
            PoolError::InvalidPool { message } => Error::wrong_path(&path_str, message),
            other => Error::from(other),
        });
    }

    if !force_create {
        return Err(Error::wrong_path(
            &path_str,
            "pool file does not exist and force_create is not set",
        ));
    }

    let size = match config.get_uint64(OPT_SIZE) {
        Ok(size) => size,
        Err(Error::NotFound) => {
            return Err(Error::invalid_argument(
                "size is required to create a pool",
            ))
        }
        Err(err) => return Err(err),
    };

    info!(path = %path_str, size, layout, "creating pool");
    Pool::create(path, layout, size).map_err(|err| match err {
        PoolError::InvalidSize { size } => {
            Error::wrong_size(size, "outside the supported pool size range")
        }
        PoolError::Io(io) => Error::wrong_path(&path_str, io.to_string()),
        other => Error::from(other),
    })
}

impl Db {
    /// Opens the named engine over the configured pool.
    ///
    /// Exactly one of `path` and `oid` must be configured. With a path,
    /// an existing pool is attached (its layout name must belong to
    /// `engine`); a missing file is created when `force_create` is set
    /// and `size` is given.
    pub fn open(engine: &str, mut config: Config) -> Result<Self> {
        let layout = layout_of(engine)?;
        let comparator = config.take_comparator()?;
        let oid = config.take_oid()?;

        let pool = match oid {
            Some(pool) => {
                if config.contains(OPT_PATH) {
                    return Err(Error::invalid_argument(
                        "path and oid are mutually exclusive",
                    ));
                }
                if pool.layout() != layout {
                    return Err(Error::wrong_engine(format!(
                        "supplied pool holds layout {:?}, engine wants {layout:?}",
                        pool.layout()
                    )));
                }
                pool
            }
            None => Arc::new(open_pool(&config, layout)?),
        };

        let engine: Box<dyn KvEngine> = match engine {
            "cmap" => Box::new(Cmap::open(Arc::clone(&pool), comparator)?),
            "stree" => Box::new(Stree::open(Arc::clone(&pool), comparator)?),
            "csmap" => Box::new(Csmap::open(Arc::clone(&pool), comparator)?),
            "radix" => Box::new(Radix::open(Arc::clone(&pool), comparator)?),
            other => return Err(Error::wrong_engine(format!("unknown engine {other:?}"))),
        };

        debug!(engine = engine.name(), "database open");
        Ok(Self { pool, engine })
    }

    fn check_outside_tx(&self) -> Result<()> {
        self.pool
            .check_outside_tx()
            .map_err(|_| Error::TransactionScope)
    }

    /// Name of the engine backing this database.
    #[must_use]
    pub fn engine_name(&self) -> &'static str {
        self.engine.name()
    }

    /// Number of entries.
    pub fn count_all(&self) -> Result<usize> {
        self.check_outside_tx()?;
        self.engine.count_all()
    }

    /// Number of entries with keys strictly greater than `key`.
    pub fn count_above(&self, key: &[u8]) -> Result<usize> {
        self.check_outside_tx()?;
        self.engine.count_above(key)
    }

    /// Number of entries with keys greater than or equal to `key`.
    pub fn count_equal_above(&self, key: &[u8]) -> Result<usize> {
        self.check_outside_tx()?;
        self.engine.count_equal_above(key)
    }

    /// Number of entries with keys less than or equal to `key`.
    pub fn count_equal_below(&self, key: &[u8]) -> Result<usize> {
        self.check_outside_tx()?;
        self.engine.count_equal_below(key)
    }

    /// Number of entries with keys strictly less than `key`.
    pub fn count_below(&self, key: &[u8]) -> Result<usize> {
        self.check_outside_tx()?;
        self.engine.count_below(key)
    }

    /// Number of entries in `[key1, key2)` under the active order.
    pub fn count_between(&self, key1: &[u8], key2: &[u8]) -> Result<usize> {
        self.check_outside_tx()?;
        self.engine.count_between(key1, key2)
    }

    /// Visits every entry.
    pub fn get_all(
        &self,
        mut callback: impl FnMut(&[u8], &[u8]) -> ControlFlow<()>,
    ) -> Result<()> {
        self.check_outside_tx()?;
        self.engine.get_all(&mut callback)
    }

    /// Visits entries with keys strictly greater than `key`.
    pub fn get_above(
        &self,
        key: &[u8],
        mut callback: impl FnMut(&[u8], &[u8]) -> ControlFlow<()>,
    ) -> Result<()> {
        self.check_outside_tx()?;
        self.engine.get_above(key, &mut callback)
    }

    /// Visits entries with keys greater than or equal to `key`.
    pub fn get_equal_above(
        &self,
        key: &[u8],
        mut callback: impl FnMut(&[u8], &[u8]) -> ControlFlow<()>,
    ) -> Result<()> {
        self.check_outside_tx()?;
        self.engine.get_equal_above(key, &mut callback)
    }

    /// Visits entries with keys less than or equal to `key`.
    pub fn get_equal_below(
        &self,
        key: &[u8],
        mut callback: impl FnMut(&[u8], &[u8]) -> ControlFlow<()>,
    ) -> Result<()> {
        self.check_outside_tx()?;
        self.engine.get_equal_below(key, &mut callback)
    }

    /// Visits entries with keys strictly less than `key`.
    pub fn get_below(
        &self,
        key: &[u8],
        mut callback: impl FnMut(&[u8], &[u8]) -> ControlFlow<()>,
    ) -> Result<()> {
        self.check_outside_tx()?;
        self.engine.get_below(key, &mut callback)
    }

    /// Visits entries in `[key1, key2)` under the active order.
    pub fn get_between(
        &self,
        key1: &[u8],
        key2: &[u8],
        mut callback: impl FnMut(&[u8], &[u8]) -> ControlFlow<()>,
    ) -> Result<()> {
        self.check_outside_tx()?;
        self.engine.get_between(key1, key2, &mut callback)
    }

    /// Whether `key` is present.
    pub fn exists(&self, key: &[u8]) -> Result<bool> {
        self.check_outside_tx()?;
        self.engine.exists(key)
    }

    /// Delivers the value of `key` to `callback`.
    pub fn get(&self, key: &[u8], mut callback: impl FnMut(&[u8])) -> Result<()> {
        self.check_outside_tx()?;
        self.engine.get(key, &mut callback)
    }

    /// Returns a copy of the value of `key`.
    pub fn get_copy(&self, key: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.get(key, |value| out = value.to_vec())?;
        Ok(out)
    }

    /// Inserts `key` or replaces its value, atomically.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_outside_tx()?;
        self.engine.put(key, value)
    }

    /// Removes `key`; `Ok(false)` when it was absent.
    pub fn remove(&self, key: &[u8]) -> Result<bool> {
        self.check_outside_tx()?;
        self.engine.remove(key)
    }

    /// Visits the entry with the greatest key less than or equal to `key`.
    pub fn get_floor_entry(
        &self,
        key: &[u8],
        mut callback: impl FnMut(&[u8], &[u8]) -> ControlFlow<()>,
    ) -> Result<()> {
        self.check_outside_tx()?;
        self.engine.get_floor_entry(key, &mut callback)
    }

    /// Visits the entry with the greatest key strictly less than `key`.
    pub fn get_lower_entry(
        &self,
        key: &[u8],
        mut callback: impl FnMut(&[u8], &[u8]) -> ControlFlow<()>,
    ) -> Result<()> {
        self.check_outside_tx()?;
        self.engine.get_lower_entry(key, &mut callback)
    }

    /// Visits the entry with the least key greater than or equal to `key`.
    pub fn get_ceiling_entry(
        &self,
        key: &[u8],
        mut callback: impl FnMut(&[u8], &[u8]) -> ControlFlow<()>,
    ) -> Result<()> {
        self.check_outside_tx()?;
        self.engine.get_ceiling_entry(key, &mut callback)
    }

    /// Visits the entry with the least key strictly greater than `key`.
    pub fn get_higher_entry(
        &self,
        key: &[u8],
        mut callback: impl FnMut(&[u8], &[u8]) -> ControlFlow<()>,
    ) -> Result<()> {
        self.check_outside_tx()?;
        self.engine.get_higher_entry(key, &mut callback)
    }

    /// Creates a bidirectional cursor.
    pub fn iter(&self) -> Result<Box<dyn KvIterator + '_>> {
        self.check_outside_tx()?;
        self.engine.iter()
    }

    /// Creates a seek-capable read cursor (radix).
    pub fn read_iter(&self) -> Result<Box<dyn ReadIterator + '_>> {
        self.check_outside_tx()?;
        self.engine.read_iter()
    }

    /// Creates a seek-capable write cursor (radix).
    pub fn write_iter(&self) -> Result<Box<dyn WriteIterator + '_>> {
        self.check_outside_tx()?;
        self.engine.write_iter()
    }

    /// Begins a batched transaction (radix).
    pub fn begin_tx(&self) -> Result<Box<dyn BatchTransaction + '_>> {
        self.check_outside_tx()?;
        self.engine.begin_tx()
    }

    /// Compacts a bucket range given as percentages (cmap).
    pub fn defrag(&self, start_percent: u64, amount_percent: u64) -> Result<()> {
        self.check_outside_tx()?;
        self.engine.defrag(start_percent, amount_percent)
    }
}

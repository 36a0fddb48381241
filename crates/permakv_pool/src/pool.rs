//! Pool lifecycle, header layout and shared read access.

use crate::error::PoolError;
use crate::error::PoolResult;
use crate::media::{FsPoolFile, PoolFile};
use crate::tx::{self, PoolTx};
use parking_lot::{Mutex, RwLock};
use std::cell::Cell;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

/// Magic bytes at the start of every pool file.
pub const MAGIC: [u8; 8] = *b"PMKVPOOL";

/// Current pool format version.
pub const FORMAT_VERSION: u16 = 1;

/// Smallest accepted pool size.
pub const MIN_POOL: u64 = 8 * 1024 * 1024;

/// Largest accepted pool size.
pub const MAX_POOL: u64 = 1 << 44;

// Header field offsets. The header occupies the first HEADER_SIZE bytes
// of the arena and is mutated through transactions like any other range.
pub(crate) const OFF_MAGIC: u64 = 0;
pub(crate) const OFF_VERSION: u64 = 8;
pub(crate) const OFF_LAYOUT: u64 = 16;
pub(crate) const OFF_CMP_NAME: u64 = 48;
pub(crate) const OFF_POOL_SIZE: u64 = 80;
pub(crate) const OFF_LOG_CAP: u64 = 88;
pub(crate) const OFF_HEAP_TAIL: u64 = 96;
pub(crate) const OFF_FREE_HEAD: u64 = 104;
pub(crate) const OFF_ROOT: u64 = 112;

pub(crate) const NAME_FIELD_SIZE: usize = 32;
pub(crate) const HEADER_SIZE: u64 = 256;

/// The undo log region starts right after the header.
pub(crate) const LOG_OFF: u64 = HEADER_SIZE;

const MIN_LOG_CAP: u64 = 64 * 1024;
const MAX_LOG_CAP: u64 = 4 * 1024 * 1024;

thread_local! {
    // Depth of pool transactions on the current thread. Engine operations
    // refuse to start while this is non-zero.
    static TX_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Shared read access to pool bytes.
///
/// Implemented by [`Pool`] (reads outside any transaction) and
/// [`PoolTx`] (reads that observe the transaction's own writes), so
/// container codecs can be written once against either context.
pub trait PoolReader {
    /// Reads `len` bytes starting at `offset`.
    fn read(&self, offset: u64, len: usize) -> PoolResult<Vec<u8>>;

    /// Reads a little-endian `u64` at `offset`.
    fn read_u64(&self, offset: u64) -> PoolResult<u64> {
        let bytes = self.read(offset, 8)?;
        let arr: [u8; 8] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| PoolError::corrupted("short u64 read"))?;
        Ok(u64::from_le_bytes(arr))
    }
}

/// A byte-addressable persistent memory pool.
///
/// The pool keeps a full in-memory image of the backing file. Reads are
/// served from the image; mutations go through [`Pool::run`], which
/// applies them to the image immediately and writes them back to the
/// file at commit under the undo-log protocol. After a crash, the next
/// open rolls back any interrupted commit, so the arena is always
/// observed in a transaction boundary state.
pub struct Pool {
    file: Box<dyn PoolFile>,
    image: RwLock<Vec<u8>>,
    tx_lock: Mutex<()>,
    layout: String,
    size: u64,
    log_cap: u64,
    heap_off: u64,
    // Set when a commit failed against the media; the in-memory image no
    // longer mirrors the file and the pool must be reopened.
    poisoned: AtomicBool,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("layout", &self.layout)
            .field("size", &self.size)
            .finish()
    }
}

impl Pool {
    /// Creates a new pool file at `path` for the given engine layout.
    pub fn create(path: &Path, layout: &str, size: u64) -> PoolResult<Self> {
        // Validate before touching the filesystem so a rejected size
        // leaves no empty file behind.
        if !(MIN_POOL..=MAX_POOL).contains(&size) {
            return Err(PoolError::InvalidSize { size });
        }
        let file = FsPoolFile::create(path)?;
        Self::create_with_file(Box::new(file), layout, size)
    }

    /// Creates a new pool on already-opened media.
    pub fn create_with_file(
        file: Box<dyn PoolFile>,
        layout: &str,
        size: u64,
    ) -> PoolResult<Self> {
        if !(MIN_POOL..=MAX_POOL).contains(&size) {
            return Err(PoolError::InvalidSize { size });
        }
        if layout.len() > NAME_FIELD_SIZE {
            return Err(PoolError::invalid_pool(format!(
                "layout name too long: {layout:?}"
            )));
        }

        let log_cap = (size / 16).clamp(MIN_LOG_CAP, MAX_LOG_CAP);
        let heap_off = LOG_OFF + log_cap;

        let mut image = vec![0u8; size as usize];
        image[OFF_MAGIC as usize..OFF_MAGIC as usize + 8].copy_from_slice(&MAGIC);
        image[OFF_VERSION as usize..OFF_VERSION as usize + 2]
            .copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        write_name_field(&mut image, OFF_LAYOUT as usize, layout);
        put_u64(&mut image, OFF_POOL_SIZE, size);
        put_u64(&mut image, OFF_LOG_CAP, log_cap);
        put_u64(&mut image, OFF_HEAP_TAIL, heap_off);
        put_u64(&mut image, OFF_FREE_HEAD, 0);
        put_u64(&mut image, OFF_ROOT, 0);

        file.set_len(size)?;
        // The heap is all zeroes from set_len; only the header and log
        // region need an explicit write.
        file.write_at(0, &image[..heap_off as usize])?;
        file.sync()?;

        info!(layout, size, "created pool");

        Ok(Self {
            file,
            image: RwLock::new(image),
            tx_lock: Mutex::new(()),
            layout: layout.to_string(),
            size,
            log_cap,
            heap_off,
            poisoned: AtomicBool::new(false),
        })
    }

    /// Opens an existing pool file, verifying its layout name.
    pub fn open(path: &Path, layout: &str) -> PoolResult<Self> {
        let file = FsPoolFile::open(path)?;
        Self::open_with_file(Box::new(file), layout)
    }

    /// Opens a pool on already-opened media, verifying its layout name.
    ///
    /// If the previous process died inside a commit, the interrupted
    /// transaction is rolled back here before the pool is returned.
    pub fn open_with_file(file: Box<dyn PoolFile>, layout: &str) -> PoolResult<Self> {
        let mut header = vec![0u8; HEADER_SIZE as usize];
        file.read_at(0, &mut header)?;

        if header[OFF_MAGIC as usize..OFF_MAGIC as usize + 8] != MAGIC {
            return Err(PoolError::invalid_pool("bad magic"));
        }
        let version = u16::from_le_bytes([
            header[OFF_VERSION as usize],
            header[OFF_VERSION as usize + 1],
        ]);
        if version != FORMAT_VERSION {
            return Err(PoolError::invalid_pool(format!(
                "unsupported format version {version}"
            )));
        }

        let found_layout = read_name_field(&header, OFF_LAYOUT as usize);
        if found_layout != layout {
            return Err(PoolError::LayoutMismatch {
                found: found_layout,
                requested: layout.to_string(),
            });
        }

        let size = get_u64(&header, OFF_POOL_SIZE);
        let log_cap = get_u64(&header, OFF_LOG_CAP);
        let heap_off = LOG_OFF + log_cap;
        if size < heap_off || size > MAX_POOL || file.size()? < size {
            return Err(PoolError::corrupted("inconsistent pool geometry"));
        }

        let mut image = vec![0u8; size as usize];
        file.read_at(0, &mut image)?;

        let rolled_back = tx::recover(file.as_ref(), &mut image, log_cap)?;
        if rolled_back {
            info!(layout, "rolled back interrupted transaction at open");
        } else {
            debug!(layout, "opened pool");
        }

        Ok(Self {
            file,
            image: RwLock::new(image),
            tx_lock: Mutex::new(()),
            layout: layout.to_string(),
            size,
            log_cap,
            heap_off,
            poisoned: AtomicBool::new(false),
        })
    }

    /// Returns the layout name stored in the header.
    #[must_use]
    pub fn layout(&self) -> &str {
        &self.layout
    }

    /// Returns the total pool size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Returns the offset of the root object, or 0 when unset.
    pub fn root(&self) -> PoolResult<u64> {
        PoolReader::read_u64(self, OFF_ROOT)
    }

    /// Returns the persisted comparator name, if one was recorded.
    pub fn comparator_name(&self) -> PoolResult<Option<String>> {
        let bytes = self.read(OFF_CMP_NAME, NAME_FIELD_SIZE)?;
        let name = read_name_field(&bytes, 0);
        Ok(if name.is_empty() { None } else { Some(name) })
    }

    /// Fails if the calling thread is inside a pool transaction.
    ///
    /// Engine operations call this on entry so user callbacks cannot
    /// re-enter the database mid-transaction.
    pub fn check_outside_tx(&self) -> PoolResult<()> {
        if TX_DEPTH.with(Cell::get) > 0 {
            return Err(PoolError::InTransaction);
        }
        Ok(())
    }

    /// Runs `f` inside a pool transaction.
    ///
    /// Every write inside the transaction snapshots its pre-image first.
    /// If `f` returns `Ok`, the transaction commits: undo records are made
    /// durable, dirty ranges are written back, and the log is disarmed.
    /// If `f` returns `Err`, the in-memory image is restored from the
    /// snapshots and nothing reaches the media.
    ///
    /// Transactions serialize on a pool-wide mutex; containers express
    /// nesting by threading the [`PoolTx`] through their call chains, so
    /// there is exactly one transaction scope per mutating operation.
    ///
    /// The error type is generic so callers can thread their own error
    /// enum through the closure, as long as it can absorb [`PoolError`].
    pub fn run<R, E, F>(&self, f: F) -> Result<R, E>
    where
        E: From<PoolError>,
        F: FnOnce(&mut PoolTx<'_>) -> Result<R, E>,
    {
        if self.poisoned.load(Ordering::Acquire) {
            return Err(E::from(PoolError::corrupted(
                "a commit failed against the media; reopen the pool",
            )));
        }

        let _guard = self.tx_lock.lock();
        let _depth = DepthGuard::enter();

        let mut tx = PoolTx::new(self);
        match f(&mut tx) {
            Ok(value) => tx.commit().map(|()| value).map_err(E::from),
            Err(err) => {
                tx.rollback();
                Err(err)
            }
        }
    }

    pub(crate) fn poison(&self) {
        self.poisoned.store(true, Ordering::Release);
    }

    pub(crate) fn file(&self) -> &dyn PoolFile {
        self.file.as_ref()
    }

    pub(crate) fn image(&self) -> &RwLock<Vec<u8>> {
        &self.image
    }

    pub(crate) fn log_cap(&self) -> u64 {
        self.log_cap
    }

    pub(crate) fn heap_off(&self) -> u64 {
        self.heap_off
    }

    pub(crate) fn check_bounds(&self, offset: u64, len: usize) -> PoolResult<()> {
        let end = offset.checked_add(len as u64);
        match end {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(PoolError::OutOfBounds {
                offset,
                len,
                size: self.size,
            }),
        }
    }
}

impl PoolReader for Pool {
    fn read(&self, offset: u64, len: usize) -> PoolResult<Vec<u8>> {
        self.check_bounds(offset, len)?;
        let image = self.image.read();
        Ok(image[offset as usize..offset as usize + len].to_vec())
    }
}

struct DepthGuard;

impl DepthGuard {
    fn enter() -> Self {
        TX_DEPTH.with(|d| d.set(d.get() + 1));
        Self
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        TX_DEPTH.with(|d| d.set(d.get() - 1));
    }
}

fn put_u64(image: &mut [u8], offset: u64, value: u64) {
    let start = offset as usize;
    image[start..start + 8].copy_from_slice(&value.to_le_bytes());
}

fn get_u64(image: &[u8], offset: u64) -> u64 {
    let start = offset as usize;
    let mut arr = [0u8; 8];
    arr.copy_from_slice(&image[start..start + 8]);
    u64::from_le_bytes(arr)
}

pub(crate) fn write_name_field(image: &mut [u8], start: usize, name: &str) {
    let field = &mut image[start..start + NAME_FIELD_SIZE];
    field.fill(0);
    field[..name.len()].copy_from_slice(name.as_bytes());
}

pub(crate) fn read_name_field(bytes: &[u8], start: usize) -> String {
    let field = &bytes[start..start + NAME_FIELD_SIZE];
    let end = field.iter().position(|&b| b == 0).unwrap_or(NAME_FIELD_SIZE);
    String::from_utf8_lossy(&field[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pool");

        let pool = Pool::create(&path, "permakv_test", MIN_POOL).unwrap();
        assert_eq!(pool.root().unwrap(), 0);
        pool.run(|tx| -> PoolResult<u64> {
            let off = tx.alloc(16)?;
            tx.write(off, b"persistent bytes")?;
            tx.set_root(off)?;
            Ok(off)
        })
        .unwrap();
        drop(pool);

        let pool = Pool::open(&path, "permakv_test").unwrap();
        let root = pool.root().unwrap();
        assert_ne!(root, 0);
        assert_eq!(pool.read(root, 16).unwrap(), b"persistent bytes");
    }

    #[test]
    fn layout_mismatch_is_fatal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pool");

        Pool::create(&path, "permakv_stree", MIN_POOL).unwrap();
        let err = Pool::open(&path, "permakv_radix").unwrap_err();
        assert!(matches!(err, PoolError::LayoutMismatch { .. }));
    }

    #[test]
    fn size_bounds_enforced() {
        let dir = tempdir().unwrap();

        let err = Pool::create(&dir.path().join("a"), "t", MIN_POOL - 1).unwrap_err();
        assert!(matches!(err, PoolError::InvalidSize { .. }));

        let err = Pool::create(&dir.path().join("b"), "t", MAX_POOL + 1).unwrap_err();
        assert!(matches!(err, PoolError::InvalidSize { .. }));
    }

    #[test]
    fn failed_transaction_rolls_back_image() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pool");

        let pool = Pool::create(&path, "t", MIN_POOL).unwrap();
        let off = pool
            .run(|tx| -> PoolResult<u64> {
                let off = tx.alloc(8)?;
                tx.write(off, b"original")?;
                tx.set_root(off)?;
                Ok(off)
            })
            .unwrap();

        let err = pool.run(|tx| {
            tx.write(off, b"clobber!")?;
            Err::<(), _>(PoolError::corrupted("forced abort"))
        });
        assert!(err.is_err());
        assert_eq!(pool.read(off, 8).unwrap(), b"original");
    }

    #[test]
    fn interrupted_commit_is_rolled_back_at_open() {
        use crate::media::{FsPoolFile, PoolFile};
        use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};
        use std::sync::Arc;

        // Media that dies after a fixed number of writes, stranding the
        // file mid-commit with the log armed.
        struct DyingFile {
            inner: FsPoolFile,
            budget: Arc<AtomicI64>,
        }

        impl PoolFile for DyingFile {
            fn read_at(&self, offset: u64, buf: &mut [u8]) -> PoolResult<()> {
                self.inner.read_at(offset, buf)
            }
            fn write_at(&self, offset: u64, data: &[u8]) -> PoolResult<()> {
                if self.budget.fetch_sub(1, AtomicOrdering::SeqCst) <= 0 {
                    return Err(std::io::Error::other("simulated crash").into());
                }
                self.inner.write_at(offset, data)
            }
            fn set_len(&self, len: u64) -> PoolResult<()> {
                self.inner.set_len(len)
            }
            fn size(&self) -> PoolResult<u64> {
                self.inner.size()
            }
            fn sync(&self) -> PoolResult<()> {
                if self.budget.load(AtomicOrdering::SeqCst) <= 0 {
                    return Err(std::io::Error::other("simulated crash").into());
                }
                self.inner.sync()
            }
        }

        let dir = tempdir().unwrap();
        let path = dir.path().join("pool");

        let off = {
            let pool = Pool::create(&path, "t", MIN_POOL).unwrap();
            pool.run(|tx| -> PoolResult<u64> {
                let off = tx.alloc(8)?;
                tx.write(off, b"original")?;
                tx.set_root(off)?;
                Ok(off)
            })
            .unwrap()
        };

        // Three writes: log records, arm flag, one dirty range. The
        // write-back never completes and the log stays armed.
        let budget = Arc::new(AtomicI64::new(3));
        let dying = DyingFile {
            inner: FsPoolFile::open(&path).unwrap(),
            budget,
        };
        let pool = Pool::open_with_file(Box::new(dying), "t").unwrap();
        let err = pool.run(|tx| -> PoolResult<()> {
            tx.write(off, b"clobber!")?;
            tx.write_u64(off + 8, 0xDEAD)
        });
        assert!(err.is_err());
        drop(pool);

        let pool = Pool::open(&path, "t").unwrap();
        assert_eq!(pool.read(off, 8).unwrap(), b"original");
        // A fresh transaction works after recovery.
        pool.run(|tx| tx.write(off, b"replaced")).unwrap();
        assert_eq!(pool.read(off, 8).unwrap(), b"replaced");
    }

    #[test]
    fn check_outside_tx_detects_scope() {
        let dir = tempdir().unwrap();
        let pool = Pool::create(&dir.path().join("pool"), "t", MIN_POOL).unwrap();

        pool.check_outside_tx().unwrap();
        pool.run(|tx| -> PoolResult<()> {
            assert!(matches!(
                tx.pool().check_outside_tx(),
                Err(PoolError::InTransaction)
            ));
            Ok(())
        })
        .unwrap();
        pool.check_outside_tx().unwrap();
    }
}

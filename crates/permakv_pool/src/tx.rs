//! Undo-log transactions.
//!
//! A transaction records the pre-image of every range it writes. Writes
//! land in the pool's in-memory image immediately; the backing file is
//! only touched at commit, in this order:
//!
//! 1. undo records and a terminator are written to the log region, then
//!    synced
//! 2. the log is armed (flag word), then synced
//! 3. dirty ranges are written back to the heap, then synced
//! 4. the log is disarmed, then synced
//!
//! A crash before step 2 leaves the heap untouched. A crash between
//! steps 2 and 4 is repaired at the next open by applying the undo
//! records in reverse, which restores the pre-transaction state. Either
//! way the arena is observed at a transaction boundary.

use crate::error::{PoolError, PoolResult};
use crate::media::PoolFile;
use crate::pool::{Pool, PoolReader, LOG_OFF, OFF_CMP_NAME, OFF_ROOT};
use crate::pool::{write_name_field, NAME_FIELD_SIZE};

// Log record: length, checksum over offset and pre-image bytes, target
// offset, pre-image bytes. A zero length terminates the record stream.
const RECORD_HEADER: usize = 16;

struct UndoRecord {
    offset: u64,
    bytes: Vec<u8>,
}

/// An open pool transaction.
///
/// Obtained through [`Pool::run`]. Containers thread this through their
/// mutation paths; every write is snapshotted, so returning an error
/// from the closure restores the exact pre-call state.
pub struct PoolTx<'a> {
    pool: &'a Pool,
    undo: Vec<UndoRecord>,
    dirty: Vec<(u64, usize)>,
}

impl<'a> PoolTx<'a> {
    pub(crate) fn new(pool: &'a Pool) -> Self {
        Self {
            pool,
            undo: Vec::new(),
            dirty: Vec::new(),
        }
    }

    /// Returns the pool this transaction runs against.
    #[must_use]
    pub fn pool(&self) -> &Pool {
        self.pool
    }

    /// Writes `data` at `offset`, snapshotting the previous contents.
    pub fn write(&mut self, offset: u64, data: &[u8]) -> PoolResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.pool.check_bounds(offset, data.len())?;
        if data.len() as u64 > u64::from(u32::MAX) {
            return Err(PoolError::OutOfBounds {
                offset,
                len: data.len(),
                size: self.pool.size(),
            });
        }
        // The log region belongs to the transaction machinery itself.
        let end = offset + data.len() as u64;
        if offset < self.pool.heap_off() && end > LOG_OFF {
            return Err(PoolError::OutOfBounds {
                offset,
                len: data.len(),
                size: self.pool.size(),
            });
        }

        let mut image = self.pool.image().write();
        let start = offset as usize;
        let old = image[start..start + data.len()].to_vec();
        image[start..start + data.len()].copy_from_slice(data);
        drop(image);

        self.undo.push(UndoRecord { offset, bytes: old });
        self.dirty.push((offset, data.len()));
        Ok(())
    }

    /// Writes a little-endian `u64` at `offset`.
    pub fn write_u64(&mut self, offset: u64, value: u64) -> PoolResult<()> {
        self.write(offset, &value.to_le_bytes())
    }

    /// Sets the pool's root object offset.
    pub fn set_root(&mut self, offset: u64) -> PoolResult<()> {
        self.write_u64(OFF_ROOT, offset)
    }

    /// Records the comparator name in the pool header.
    pub fn set_comparator_name(&mut self, name: &str) -> PoolResult<()> {
        if name.len() > NAME_FIELD_SIZE {
            return Err(PoolError::invalid_pool(format!(
                "comparator name too long: {name:?}"
            )));
        }
        let mut field = vec![0u8; NAME_FIELD_SIZE];
        write_name_field(&mut field, 0, name);
        self.write(OFF_CMP_NAME, &field)
    }

    pub(crate) fn commit(self) -> PoolResult<()> {
        if self.undo.is_empty() {
            return Ok(());
        }

        let mut log = Vec::new();
        for rec in &self.undo {
            let mut crc = Crc32::new();
            crc.update(&rec.offset.to_le_bytes());
            crc.update(&rec.bytes);
            log.extend_from_slice(&(rec.bytes.len() as u32).to_le_bytes());
            log.extend_from_slice(&crc.finish().to_le_bytes());
            log.extend_from_slice(&rec.offset.to_le_bytes());
            log.extend_from_slice(&rec.bytes);
        }
        log.extend_from_slice(&0u32.to_le_bytes());

        let required = 8 + log.len() as u64;
        if required > self.pool.log_cap() {
            let capacity = self.pool.log_cap();
            self.rollback();
            return Err(PoolError::LogOverflow { required, capacity });
        }

        if let Err(err) = self.write_back(&log) {
            // The media is in an unknown state between log arm and disarm;
            // the next open repairs it, this handle must not be reused.
            self.pool.poison();
            return Err(err);
        }
        Ok(())
    }

    fn write_back(&self, log: &[u8]) -> PoolResult<()> {
        let file = self.pool.file();

        file.write_at(LOG_OFF + 8, log)?;
        file.sync()?;
        file.write_at(LOG_OFF, &1u64.to_le_bytes())?;
        file.sync()?;

        {
            let image = self.pool.image().read();
            for &(offset, len) in &self.dirty {
                let start = offset as usize;
                file.write_at(offset, &image[start..start + len])?;
            }
        }
        file.sync()?;

        file.write_at(LOG_OFF, &0u64.to_le_bytes())?;
        file.sync()?;
        Ok(())
    }

    pub(crate) fn rollback(self) {
        let mut image = self.pool.image().write();
        // Later snapshots may capture bytes written earlier in the same
        // transaction; reverse order restores the true pre-image.
        for rec in self.undo.iter().rev() {
            let start = rec.offset as usize;
            image[start..start + rec.bytes.len()].copy_from_slice(&rec.bytes);
        }
    }
}

impl PoolReader for PoolTx<'_> {
    fn read(&self, offset: u64, len: usize) -> PoolResult<Vec<u8>> {
        self.pool.check_bounds(offset, len)?;
        let image = self.pool.image().read();
        Ok(image[offset as usize..offset as usize + len].to_vec())
    }
}

/// Rolls back an interrupted commit found in the log region.
///
/// Returns `true` if a rollback was performed. `image` must hold the
/// full pool contents as read from `file`; both are repaired together.
pub(crate) fn recover(
    file: &dyn PoolFile,
    image: &mut [u8],
    log_cap: u64,
) -> PoolResult<bool> {
    let armed = u64_at(image, LOG_OFF as usize);
    if armed == 0 {
        return Ok(false);
    }

    let log_end = (LOG_OFF + log_cap) as usize;
    let mut pos = LOG_OFF as usize + 8;
    let mut records: Vec<(u64, Vec<u8>)> = Vec::new();

    loop {
        if pos + 4 > log_end {
            return Err(PoolError::corrupted("undo log missing terminator"));
        }
        let len = u32_at(image, pos) as usize;
        if len == 0 {
            break;
        }
        if pos + RECORD_HEADER + len > log_end {
            return Err(PoolError::corrupted("undo record overruns log region"));
        }
        let stored_crc = u32_at(image, pos + 4);
        let offset = u64_at(image, pos + 8);
        let bytes = image[pos + RECORD_HEADER..pos + RECORD_HEADER + len].to_vec();

        let mut crc = Crc32::new();
        crc.update(&offset.to_le_bytes());
        crc.update(&bytes);
        if crc.finish() != stored_crc {
            return Err(PoolError::corrupted("undo record checksum mismatch"));
        }
        if offset as usize + len > image.len() {
            return Err(PoolError::corrupted("undo record points outside pool"));
        }

        records.push((offset, bytes));
        pos += RECORD_HEADER + len;
    }

    for (offset, bytes) in records.iter().rev() {
        let start = *offset as usize;
        image[start..start + bytes.len()].copy_from_slice(bytes);
        file.write_at(*offset, bytes)?;
    }
    file.sync()?;

    image[LOG_OFF as usize..LOG_OFF as usize + 8].copy_from_slice(&0u64.to_le_bytes());
    file.write_at(LOG_OFF, &0u64.to_le_bytes())?;
    file.sync()?;

    Ok(true)
}

fn u32_at(bytes: &[u8], pos: usize) -> u32 {
    let mut arr = [0u8; 4];
    arr.copy_from_slice(&bytes[pos..pos + 4]);
    u32::from_le_bytes(arr)
}

fn u64_at(bytes: &[u8], pos: usize) -> u64 {
    let mut arr = [0u8; 8];
    arr.copy_from_slice(&bytes[pos..pos + 8]);
    u64::from_le_bytes(arr)
}

// CRC32 (IEEE polynomial) with a const lookup table.
struct Crc32 {
    state: u32,
}

impl Crc32 {
    const TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    fn new() -> Self {
        Self { state: 0xFFFF_FFFF }
    }

    fn update(&mut self, data: &[u8]) {
        for &byte in data {
            let index = ((self.state ^ u32::from(byte)) & 0xFF) as usize;
            self.state = (self.state >> 8) ^ Self::TABLE[index];
        }
    }

    fn finish(&self) -> u32 {
        !self.state
    }
}

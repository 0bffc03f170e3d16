// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Scoped access to guest physical memory.
//!
//! The ring and GPADL code never see raw host addresses. They map a guest
//! physical range, access it through [`MappedRange`], and unmap it by dropping
//! the mapping.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use thiserror::Error;

/// The intended use of a mapping.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    ReadWrite,
}

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("guest range {gpa:#x}+{len:#x} cannot be mapped")]
    Unmappable { gpa: u64, len: usize },
    #[error("offset {0:#x} is beyond the end of the page list")]
    OutOfRange(usize),
}

/// A source of guest memory mappings.
pub trait GuestMemoryAccess: Send + Sync {
    /// Maps `len` bytes of guest memory starting at `gpa`.
    ///
    /// Fails if the range is not backed by guest RAM, for example because the
    /// guest revoked it.
    fn map(
        &self,
        gpa: u64,
        len: usize,
        access: Access,
    ) -> Result<Box<dyn MappedRange + '_>, MemoryError>;
}

/// A mapped range of guest memory. Dropping the value unmaps it.
///
/// The guest may access the same memory concurrently, so the integer
/// accessors must be single-copy atomic. Ordering against other accesses is
/// the caller's job, using explicit fences.
pub trait MappedRange {
    fn len(&self) -> usize;
    fn read(&self, offset: usize, buf: &mut [u8]);
    fn write(&self, offset: usize, data: &[u8]);
    fn load_u32(&self, offset: usize) -> u32;
    fn store_u32(&self, offset: usize, value: u32);
    /// Sets `bits`, returning the previous value.
    fn fetch_or_u64(&self, offset: usize, bits: u64) -> u64;
    /// Clears every bit not in `mask`, returning the previous value.
    fn fetch_and_u64(&self, offset: usize, mask: u64) -> u64;
}

/// A cloneable handle to guest memory.
#[derive(Clone)]
pub struct GuestMemory {
    inner: Arc<dyn GuestMemoryAccess>,
}

impl std::fmt::Debug for GuestMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad("GuestMemory")
    }
}

impl GuestMemory {
    pub fn new(inner: Arc<dyn GuestMemoryAccess>) -> Self {
        Self { inner }
    }

    pub fn map(
        &self,
        gpa: u64,
        len: usize,
        access: Access,
    ) -> Result<Box<dyn MappedRange + '_>, MemoryError> {
        self.inner.map(gpa, len, access)
    }

    pub fn read_at(&self, gpa: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
        self.map(gpa, buf.len(), Access::Read)?.read(0, buf);
        Ok(())
    }

    pub fn write_at(&self, gpa: u64, data: &[u8]) -> Result<(), MemoryError> {
        self.map(gpa, data.len(), Access::Write)?.write(0, data);
        Ok(())
    }
}

/// Guest memory backed by a single host buffer starting at guest physical
/// address zero.
///
/// Individual pages can be made unmappable to model ranges the guest has
/// taken away. The number of live mappings is tracked so callers can check
/// that nothing is left mapped.
#[derive(Debug)]
pub struct FlatGuestMemory {
    data: Mutex<Vec<u8>>,
    unmappable: Mutex<HashSet<u64>>,
    live: AtomicUsize,
    peak: AtomicUsize,
}

impl FlatGuestMemory {
    pub fn new(size: usize) -> Arc<Self> {
        Arc::new(Self {
            data: Mutex::new(vec![0; size]),
            unmappable: Mutex::new(HashSet::new()),
            live: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    /// Makes every mapping that touches guest page `gpn` fail.
    pub fn set_unmappable(&self, gpn: u64, unmappable: bool) {
        let mut pages = self.unmappable.lock();
        if unmappable {
            pages.insert(gpn);
        } else {
            pages.remove(&gpn);
        }
    }

    /// The number of mappings currently outstanding.
    pub fn live_mappings(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    /// The largest number of simultaneous mappings observed since the last
    /// call, which resets the count.
    pub fn take_peak_mappings(&self) -> usize {
        self.peak
            .swap(self.live.load(Ordering::Relaxed), Ordering::Relaxed)
    }
}

impl GuestMemoryAccess for FlatGuestMemory {
    fn map(
        &self,
        gpa: u64,
        len: usize,
        _access: Access,
    ) -> Result<Box<dyn MappedRange + '_>, MemoryError> {
        let err = || MemoryError::Unmappable { gpa, len };
        let start = usize::try_from(gpa).map_err(|_| err())?;
        let end = start.checked_add(len).ok_or_else(err)?;
        if end > self.data.lock().len() {
            return Err(err());
        }
        let first = gpa / crate::PAGE_SIZE as u64;
        let last = (end as u64).div_ceil(crate::PAGE_SIZE as u64);
        {
            let unmappable = self.unmappable.lock();
            if (first..last).any(|gpn| unmappable.contains(&gpn)) {
                return Err(err());
            }
        }
        let live = self.live.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak.fetch_max(live, Ordering::Relaxed);
        Ok(Box::new(FlatMapping {
            mem: self,
            start,
            len,
        }))
    }
}

struct FlatMapping<'a> {
    mem: &'a FlatGuestMemory,
    start: usize,
    len: usize,
}

impl FlatMapping<'_> {
    fn range(&self, offset: usize, len: usize) -> std::ops::Range<usize> {
        assert!(offset + len <= self.len, "access beyond mapping");
        self.start + offset..self.start + offset + len
    }

    fn update_u64(&self, offset: usize, f: impl FnOnce(u64) -> u64) -> u64 {
        let range = self.range(offset, 8);
        let mut data = self.mem.data.lock();
        let mut bytes = [0; 8];
        bytes.copy_from_slice(&data[range.clone()]);
        let old = u64::from_le_bytes(bytes);
        data[range].copy_from_slice(&f(old).to_le_bytes());
        old
    }
}

impl MappedRange for FlatMapping<'_> {
    fn len(&self) -> usize {
        self.len
    }

    fn read(&self, offset: usize, buf: &mut [u8]) {
        let range = self.range(offset, buf.len());
        buf.copy_from_slice(&self.mem.data.lock()[range]);
    }

    fn write(&self, offset: usize, data: &[u8]) {
        let range = self.range(offset, data.len());
        self.mem.data.lock()[range].copy_from_slice(data);
    }

    fn load_u32(&self, offset: usize) -> u32 {
        let mut bytes = [0; 4];
        self.read(offset, &mut bytes);
        u32::from_le_bytes(bytes)
    }

    fn store_u32(&self, offset: usize, value: u32) {
        self.write(offset, &value.to_le_bytes());
    }

    fn fetch_or_u64(&self, offset: usize, bits: u64) -> u64 {
        self.update_u64(offset, |v| v | bits)
    }

    fn fetch_and_u64(&self, offset: usize, mask: u64) -> u64 {
        self.update_u64(offset, |v| v & mask)
    }
}

impl Drop for FlatMapping<'_> {
    fn drop(&mut self) {
        self.mem.live.fetch_sub(1, Ordering::Relaxed);
    }
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Guest physical address descriptor lists (GPADLs).
//!
//! A GPADL is a list of guest page numbers the guest shares with the host,
//! assembled from one header message and any number of body messages. Once
//! the host has acknowledged it, the GPADL can be reserved by one user at a
//! time, for example to back a channel's ring buffers.

use serde::Deserialize;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use vmbus_core::protocol::ChannelId;
use vmbus_core::protocol::GpadlId;
use vmbus_ring::GpadlCursor;
use vmbus_ring::PAGE_SIZE;
use vmbus_ring::mem::Access;
use vmbus_ring::mem::GuestMemory;
use vmbus_ring::mem::MemoryError;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GpadlError {
    #[error("unknown GPADL {}", (.0).0)]
    NotFound(GpadlId),
    #[error("GPADL {} has not been acknowledged", (.0).0)]
    NotAlive(GpadlId),
    #[error("GPADL {} is in use", (.0).0)]
    InUse(GpadlId),
    #[error("GPADL {} is incomplete", (.0).0)]
    Incomplete(GpadlId),
}

#[derive(Debug)]
pub struct Gpadl {
    id: GpadlId,
    owner: ChannelId,
    total_pages: usize,
    pages: Vec<u64>,
    alive: bool,
    in_use: bool,
    tearing_down: bool,
}

impl Gpadl {
    fn new(id: GpadlId, owner: ChannelId, total_pages: usize) -> Self {
        Self {
            id,
            owner,
            total_pages,
            pages: Vec::new(),
            alive: false,
            in_use: false,
            tearing_down: false,
        }
    }

    pub fn id(&self) -> GpadlId {
        self.id
    }

    /// The channel the guest created this GPADL for.
    pub fn owner(&self) -> ChannelId {
        self.owner
    }

    pub fn pages(&self) -> &[u64] {
        &self.pages
    }

    pub fn total_pages(&self) -> usize {
        self.total_pages
    }

    pub fn is_full(&self) -> bool {
        self.pages.len() == self.total_pages
    }

    /// A broken GPADL has no pages. It exists only so that its creation can
    /// be answered with a failure status.
    pub fn is_broken(&self) -> bool {
        self.total_pages == 0
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    pub fn is_in_use(&self) -> bool {
        self.in_use
    }

    pub fn is_tearing_down(&self) -> bool {
        self.tearing_down
    }

    /// Appends pages, ignoring any beyond the declared total. Returns true if
    /// the GPADL is now full.
    fn append(&mut self, pages: &[u64]) -> bool {
        let n = pages.len().min(self.total_pages - self.pages.len());
        self.pages.extend_from_slice(&pages[..n]);
        self.is_full()
    }
}

/// Exclusive use of a live GPADL's pages.
///
/// Hand the reservation back with [`GpadlRegistry::release`] when done;
/// until then the guest cannot tear the GPADL down.
#[derive(Debug)]
#[must_use]
pub struct GpadlReservation {
    id: GpadlId,
    generation: u64,
    pages: Arc<[u64]>,
}

impl GpadlReservation {
    pub fn id(&self) -> GpadlId {
        self.id
    }

    pub fn pages(&self) -> &Arc<[u64]> {
        &self.pages
    }

    /// The size of the described buffer in bytes.
    pub fn len(&self) -> usize {
        self.pages.len() * PAGE_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Reads from the buffer at byte `offset`.
    pub fn read(&self, mem: &GuestMemory, offset: usize, buf: &mut [u8]) -> Result<(), MemoryError> {
        self.check_range(offset, buf.len())?;
        GpadlCursor::new(mem, self.pages.clone(), Access::Read).read(offset, buf)
    }

    /// Writes to the buffer at byte `offset`.
    pub fn write(&self, mem: &GuestMemory, offset: usize, data: &[u8]) -> Result<(), MemoryError> {
        self.check_range(offset, data.len())?;
        GpadlCursor::new(mem, self.pages.clone(), Access::Write).write(offset, data)
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<(), MemoryError> {
        if offset.checked_add(len).is_none_or(|end| end > self.len()) {
            return Err(MemoryError::OutOfRange(offset));
        }
        Ok(())
    }
}

/// The saved form of a [`Gpadl`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedGpadl {
    pub id: u32,
    pub owner: u32,
    pub total_pages: usize,
    pub pages: Vec<u64>,
    pub alive: bool,
    pub tearing_down: bool,
}

/// All GPADLs known to the bus.
///
/// GPADLs are kept newest first. The guest is free to reuse an ID while a
/// failed creation with the same ID is still being reported, so lookups
/// return the most recent match.
#[derive(Debug, Default)]
pub struct GpadlRegistry {
    gpadls: VecDeque<Gpadl>,
    /// Bumped whenever the registry is cleared or replaced, so that
    /// reservations taken before then are recognized as stale.
    generation: u64,
}

impl GpadlRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a GPADL from a header message.
    ///
    /// Only a single range covering whole pages is accepted. Anything else,
    /// including an ID that is already in use, produces a broken GPADL.
    pub fn create(
        &mut self,
        id: GpadlId,
        owner: ChannelId,
        range_count: u16,
        byte_offset: u32,
        byte_count: u32,
    ) -> &mut Gpadl {
        let total_pages = if range_count != 1 {
            tracing::warn!(gpadl_id = id.0, range_count, "unsupported GPADL range count");
            0
        } else if byte_offset != 0 {
            tracing::warn!(gpadl_id = id.0, byte_offset, "GPADL range does not start on a page");
            0
        } else if byte_count as usize % PAGE_SIZE != 0 {
            tracing::warn!(gpadl_id = id.0, byte_count, "unaligned GPADL range");
            0
        } else if self.get(id).is_some() {
            tracing::warn!(gpadl_id = id.0, "duplicate GPADL id");
            0
        } else {
            byte_count as usize / PAGE_SIZE
        };
        self.gpadls.push_front(Gpadl::new(id, owner, total_pages));
        &mut self.gpadls[0]
    }

    /// Starts a broken GPADL for a body message that arrived without a
    /// header.
    pub fn create_broken(&mut self, id: GpadlId) -> &mut Gpadl {
        self.gpadls.push_front(Gpadl::new(id, ChannelId(0), 0));
        &mut self.gpadls[0]
    }

    /// Appends pages from a header or body message to GPADL `id`.
    ///
    /// Returns `None` if there is no such GPADL, and otherwise whether it is
    /// now full.
    pub fn append(&mut self, id: GpadlId, pages: &[u64]) -> Option<bool> {
        Some(self.get_mut(id)?.append(pages))
    }

    pub fn get(&self, id: GpadlId) -> Option<&Gpadl> {
        self.gpadls.iter().find(|g| g.id == id)
    }

    pub fn get_mut(&mut self, id: GpadlId) -> Option<&mut Gpadl> {
        self.gpadls.iter_mut().find(|g| g.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Gpadl> {
        self.gpadls.iter()
    }

    pub fn len(&self) -> usize {
        self.gpadls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gpadls.is_empty()
    }

    /// Reserves the pages of live GPADL `id`.
    pub fn acquire(&mut self, id: GpadlId) -> Result<GpadlReservation, GpadlError> {
        let generation = self.generation;
        let gpadl = self.get_mut(id).ok_or(GpadlError::NotFound(id))?;
        if !gpadl.alive {
            return Err(GpadlError::NotAlive(id));
        }
        if gpadl.in_use {
            return Err(GpadlError::InUse(id));
        }
        gpadl.in_use = true;
        Ok(GpadlReservation {
            id,
            generation,
            pages: gpadl.pages.as_slice().into(),
        })
    }

    /// Gives back a reservation. A reservation taken before the registry was
    /// last cleared or restored is ignored, since its GPADL is gone even if
    /// the guest has since reused the ID.
    pub fn release(&mut self, reservation: GpadlReservation) {
        if reservation.generation != self.generation {
            tracing::debug!(gpadl_id = reservation.id.0, "released stale GPADL reservation");
            return;
        }
        match self.get_mut(reservation.id) {
            Some(gpadl) => gpadl.in_use = false,
            None => tracing::warn!(gpadl_id = reservation.id.0, "released unknown GPADL"),
        }
    }

    /// Handles a teardown request from the guest.
    ///
    /// The GPADL stops being usable immediately but stays registered until
    /// [`complete_teardown`](Self::complete_teardown). A GPADL that is in use
    /// is left alone.
    pub fn teardown(&mut self, id: GpadlId) -> Result<(), GpadlError> {
        let gpadl = self.get_mut(id).ok_or(GpadlError::NotFound(id))?;
        if gpadl.in_use {
            return Err(GpadlError::InUse(id));
        }
        gpadl.alive = false;
        gpadl.tearing_down = true;
        Ok(())
    }

    /// Removes GPADL `id` outright.
    pub fn destroy(&mut self, id: GpadlId) -> Result<Gpadl, GpadlError> {
        let index = self
            .gpadls
            .iter()
            .position(|g| g.id == id)
            .ok_or(GpadlError::NotFound(id))?;
        if self.gpadls[index].in_use {
            return Err(GpadlError::InUse(id));
        }
        Ok(self.gpadls.remove(index).expect("index is in range"))
    }

    /// The full GPADL whose creation has yet to be acknowledged.
    pub fn pending_create(&self) -> Option<&Gpadl> {
        self.gpadls
            .iter()
            .find(|g| g.is_full() && !g.alive && !g.tearing_down)
    }

    /// The GPADL whose teardown has yet to be acknowledged.
    pub fn pending_teardown(&self) -> Option<&Gpadl> {
        self.gpadls.iter().find(|g| g.tearing_down)
    }

    /// Marks the pending GPADL live once the guest has been told about it.
    /// Broken GPADLs are dropped instead.
    pub fn complete_create(&mut self) {
        let Some(index) = self
            .gpadls
            .iter()
            .position(|g| g.is_full() && !g.alive && !g.tearing_down)
        else {
            return;
        };
        if self.gpadls[index].is_broken() {
            self.gpadls.remove(index);
        } else {
            self.gpadls[index].alive = true;
        }
    }

    pub fn complete_teardown(&mut self) {
        if let Some(index) = self.gpadls.iter().position(|g| g.tearing_down) {
            self.gpadls.remove(index);
        }
    }

    /// Forgets every GPADL. Reservations still held elsewhere keep their
    /// page lists but no longer block anything.
    pub fn clear(&mut self) {
        self.gpadls.clear();
        self.generation += 1;
    }

    pub fn save(&self) -> Vec<SavedGpadl> {
        self.gpadls
            .iter()
            .map(|g| SavedGpadl {
                id: g.id.0,
                owner: g.owner.0,
                total_pages: g.total_pages,
                pages: g.pages.clone(),
                alive: g.alive,
                tearing_down: g.tearing_down,
            })
            .collect()
    }

    /// Replaces the registry contents with saved GPADLs. None of them are in
    /// use afterwards.
    pub fn restore(&mut self, saved: Vec<SavedGpadl>) -> Result<(), GpadlError> {
        let mut gpadls = VecDeque::with_capacity(saved.len());
        for g in saved {
            let id = GpadlId(g.id);
            if g.pages.len() > g.total_pages || (g.alive && g.pages.len() != g.total_pages) {
                return Err(GpadlError::Incomplete(id));
            }
            gpadls.push_back(Gpadl {
                id,
                owner: ChannelId(g.owner),
                total_pages: g.total_pages,
                pages: g.pages,
                alive: g.alive,
                in_use: false,
                tearing_down: g.tearing_down,
            });
        }
        self.gpadls = gpadls;
        self.generation += 1;
        Ok(())
    }
}

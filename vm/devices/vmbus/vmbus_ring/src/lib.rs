// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The VMBus ring buffer protocol.
//!
//! A ring occupies a run of pages from a GPADL: one control page holding the
//! shared indices, followed by the data region. Each side caches its own
//! index and publishes it to the control page between full memory barriers;
//! the peer's index is always read fresh.

#![expect(missing_docs)]
#![forbid(unsafe_code)]

pub mod gparange;
pub mod mem;

use bitfield_struct::bitfield;
use mem::Access;
use mem::GuestMemory;
use mem::MappedRange;
use mem::MemoryError;
use static_assertions::const_assert_eq;
use std::mem::offset_of;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::sync::atomic::fence;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::FromZeros;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

pub const PAGE_SIZE: usize = 4096;

/// The shared control header at the start of each ring's first page.
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct Control {
    pub write_index: u32,
    pub read_index: u32,
    pub interrupt_mask: u32,
    pub pending_send_size: u32,
    pub reserved: [u32; 12],
    pub feature_bits: FeatureBits,
}

const_assert_eq!(offset_of!(Control, feature_bits), 64);

const WRITE_INDEX: usize = offset_of!(Control, write_index);
const READ_INDEX: usize = offset_of!(Control, read_index);
const INTERRUPT_MASK: usize = offset_of!(Control, interrupt_mask);
const PENDING_SEND_SIZE: usize = offset_of!(Control, pending_send_size);
const FEATURE_BITS: usize = offset_of!(Control, feature_bits);

#[bitfield(u32)]
#[derive(IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct FeatureBits {
    /// The writer publishes `pending_send_size` when it runs out of room.
    pub pending_send_size: bool,
    #[bits(31)]
    _reserved: u32,
}

#[repr(transparent)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct PacketType(pub u16);

impl PacketType {
    pub const DATA_INBAND: Self = Self(6);
    pub const DATA_USING_GPA_DIRECT: Self = Self(9);
    pub const COMPLETION: Self = Self(11);
}

#[bitfield(u16)]
#[derive(IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct PacketFlags {
    pub completion_requested: bool,
    #[bits(15)]
    _reserved: u16,
}

/// The fixed header at the start of every packet.
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct PacketHeader {
    pub packet_type: PacketType,
    /// Offset of the payload from the start of the packet, in 8-byte units.
    pub data_offset8: u16,
    /// Length of the packet excluding the trailer, in 8-byte units.
    pub len8: u16,
    pub flags: PacketFlags,
    pub transaction_id: u64,
}

pub const PACKET_HEADER_SIZE: usize = size_of::<PacketHeader>();
pub const TRAILER_SIZE: usize = size_of::<u64>();

const_assert_eq!(PACKET_HEADER_SIZE, 16);

/// Returns the number of ring bytes a packet with the given descriptor and
/// payload lengths occupies, including header, padding and trailer.
pub fn framed_len(desc_len: usize, payload_len: usize) -> usize {
    PACKET_HEADER_SIZE + desc_len.next_multiple_of(8) + payload_len.next_multiple_of(8) + TRAILER_SIZE
}

/// Returns the number of bytes available going from index `from` towards
/// index `to` in a ring of `len` bytes.
///
/// The writer passes `reserve_one` so that a full ring is never confused with
/// an empty one. The result is always less than `len`.
pub fn distance(from: u32, to: u32, len: u32, reserve_one: bool) -> u32 {
    let len = len as u64;
    let d = (to as u64 % len + len - from as u64 % len + len - reserve_one as u64) % len;
    d as u32
}

#[derive(Debug, Error)]
pub enum RingError {
    #[error("a ring of {0} pages is not usable")]
    InvalidSize(usize),
    #[error("ring index {index:#x} is outside a ring of {len:#x} bytes")]
    IndexOutOfRange { index: u32, len: u32 },
    #[error("ring needs {needed:#x} bytes of free space")]
    Full { needed: u32 },
    #[error("packet of {0:#x} bytes cannot be framed")]
    PacketTooLarge(usize),
    #[error("malformed packet: {0}")]
    Malformed(&'static str),
    #[error("guest memory access failed")]
    Memory(#[from] MemoryError),
}

/// Which side of the ring this endpoint is.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Role {
    Producer,
    Consumer,
}

/// One endpoint of a ring buffer.
#[derive(Debug)]
pub struct RingBuffer {
    role: Role,
    pages: Arc<[u64]>,
    control_gpa: u64,
    /// Byte offset of the data region within `pages`.
    base: usize,
    len: u32,
    my_index: u32,
    pending_send_size: u32,
}

impl RingBuffer {
    /// Attaches to the ring occupying `page_count` pages of `pages`, starting
    /// at `first_page`. The first of those pages is the control page.
    pub fn new(
        mem: &GuestMemory,
        pages: Arc<[u64]>,
        first_page: usize,
        page_count: usize,
        role: Role,
    ) -> Result<Self, RingError> {
        if page_count < 2
            || first_page
                .checked_add(page_count)
                .is_none_or(|end| end > pages.len())
        {
            return Err(RingError::InvalidSize(page_count));
        }
        let len = u32::try_from((page_count - 1) * PAGE_SIZE)
            .map_err(|_| RingError::InvalidSize(page_count))?;
        let control_gpa = gpn_to_gpa(pages[first_page], 0)?;

        let mut ring = Self {
            role,
            pages,
            control_gpa,
            base: (first_page + 1) * PAGE_SIZE,
            len,
            my_index: 0,
            pending_send_size: 0,
        };

        let control = ring.map_control(mem)?;
        let index = match role {
            Role::Producer => {
                let features = FeatureBits::from(control.load_u32(FEATURE_BITS));
                control.store_u32(FEATURE_BITS, features.with_pending_send_size(true).into());
                ring.pending_send_size = control.load_u32(PENDING_SEND_SIZE);
                control.load_u32(WRITE_INDEX)
            }
            Role::Consumer => control.load_u32(READ_INDEX),
        };
        drop(control);

        if index >= len {
            return Err(RingError::IndexOutOfRange { index, len });
        }
        ring.my_index = index;
        Ok(ring)
    }

    /// The host's outgoing ring: the pages from `receive_offset` on.
    pub fn outgoing(
        mem: &GuestMemory,
        pages: Arc<[u64]>,
        receive_offset: usize,
    ) -> Result<Self, RingError> {
        let count = pages.len().saturating_sub(receive_offset);
        Self::new(mem, pages, receive_offset, count, Role::Producer)
    }

    /// The host's incoming ring: the pages before `receive_offset`.
    pub fn incoming(
        mem: &GuestMemory,
        pages: Arc<[u64]>,
        receive_offset: usize,
    ) -> Result<Self, RingError> {
        Self::new(mem, pages, 0, receive_offset, Role::Consumer)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// The size of the data region in bytes.
    pub fn data_len(&self) -> u32 {
        self.len
    }

    /// The locally cached index of this endpoint.
    pub fn my_index(&self) -> u32 {
        self.my_index
    }

    /// The free space this producer last asked the consumer to provide.
    pub fn pending_send_size(&self) -> u32 {
        self.pending_send_size
    }

    fn map_control<'a>(
        &self,
        mem: &'a GuestMemory,
    ) -> Result<Box<dyn MappedRange + 'a>, MemoryError> {
        mem.map(self.control_gpa, size_of::<Control>(), Access::ReadWrite)
    }

    /// Starts a packet operation at this endpoint's current index. Nothing is
    /// published to the peer until [`RingIter::commit`].
    pub fn iter<'a>(&'a mut self, mem: &'a GuestMemory) -> Result<RingIter<'a>, RingError> {
        let control = self.map_control(mem)?;
        let access = match self.role {
            Role::Producer => Access::Write,
            Role::Consumer => Access::Read,
        };
        let cursor = GpadlCursor::new(mem, self.pages.clone(), access);
        let pos = self.my_index;
        Ok(RingIter {
            ring: self,
            control,
            cursor,
            pos,
        })
    }

    /// Checks that `needed` bytes are free for the producer.
    ///
    /// If they are not, `needed` is published as the pending send size so
    /// that the consumer signals once enough space has been freed. A
    /// successful check withdraws any earlier request.
    pub fn request_room(&mut self, mem: &GuestMemory, needed: u32) -> Result<(), RingError> {
        assert_eq!(self.role, Role::Producer);
        let control = self.map_control(mem)?;
        let avail = distance(self.my_index, control.load_u32(READ_INDEX), self.len, true);
        let mut pending = if needed <= avail { 0 } else { needed };
        if pending != self.pending_send_size {
            self.publish_pending(&*control, pending);
            if pending != 0 {
                // The consumer may have freed space before it could observe
                // the request.
                let avail = distance(self.my_index, control.load_u32(READ_INDEX), self.len, true);
                if needed <= avail {
                    pending = 0;
                    self.publish_pending(&*control, 0);
                }
            }
        }
        if pending != 0 {
            return Err(RingError::Full { needed });
        }
        Ok(())
    }

    fn publish_pending(&mut self, control: &dyn MappedRange, pending: u32) {
        self.pending_send_size = pending;
        fence(Ordering::SeqCst);
        control.store_u32(PENDING_SEND_SIZE, pending);
        fence(Ordering::SeqCst);
    }
}

fn gpn_to_gpa(gpn: u64, offset: usize) -> Result<u64, MemoryError> {
    gpn.checked_mul(PAGE_SIZE as u64)
        .map(|gpa| gpa + offset as u64)
        .ok_or(MemoryError::Unmappable {
            gpa: u64::MAX,
            len: PAGE_SIZE - offset,
        })
}

struct MappedPage<'a> {
    index: usize,
    start: usize,
    map: Box<dyn MappedRange + 'a>,
}

/// Sequential access to the byte space described by a page list, keeping at
/// most one page mapped at a time.
pub struct GpadlCursor<'a> {
    mem: &'a GuestMemory,
    pages: Arc<[u64]>,
    access: Access,
    mapped: Option<MappedPage<'a>>,
}

impl<'a> GpadlCursor<'a> {
    pub fn new(mem: &'a GuestMemory, pages: Arc<[u64]>, access: Access) -> Self {
        Self {
            mem,
            pages,
            access,
            mapped: None,
        }
    }

    /// Returns the mapping covering `offset`, the offset of `offset` within
    /// it, and the number of bytes left in the page.
    fn map_at(&mut self, offset: usize) -> Result<(&dyn MappedRange, usize, usize), MemoryError> {
        let index = offset / PAGE_SIZE;
        let page_offset = offset % PAGE_SIZE;
        let mapped = match self.mapped.take() {
            Some(mapped) if mapped.index == index && mapped.start <= page_offset => mapped,
            old => {
                drop(old);
                let gpn = *self
                    .pages
                    .get(index)
                    .ok_or(MemoryError::OutOfRange(offset))?;
                let gpa = gpn_to_gpa(gpn, page_offset)?;
                let map = self.mem.map(gpa, PAGE_SIZE - page_offset, self.access)?;
                MappedPage {
                    index,
                    start: page_offset,
                    map,
                }
            }
        };
        let mapped = self.mapped.insert(mapped);
        Ok((
            &*mapped.map,
            page_offset - mapped.start,
            PAGE_SIZE - page_offset,
        ))
    }

    pub fn read(&mut self, mut offset: usize, buf: &mut [u8]) -> Result<(), MemoryError> {
        let mut done = 0;
        while done < buf.len() {
            let (page, at, left) = self.map_at(offset)?;
            let n = left.min(buf.len() - done);
            page.read(at, &mut buf[done..done + n]);
            done += n;
            offset += n;
        }
        Ok(())
    }

    pub fn write(&mut self, mut offset: usize, data: &[u8]) -> Result<(), MemoryError> {
        let mut done = 0;
        while done < data.len() {
            let (page, at, left) = self.map_at(offset)?;
            let n = left.min(data.len() - done);
            page.write(at, &data[done..done + n]);
            done += n;
            offset += n;
        }
        Ok(())
    }
}

/// A packet to write to a ring.
#[derive(Debug, Copy, Clone)]
pub struct OutgoingPacket<'a> {
    pub packet_type: PacketType,
    pub transaction_id: u64,
    pub completion_requested: bool,
    pub desc: &'a [u8],
    pub payload: &'a [u8],
}

/// A packet read from a ring. The descriptor and payload include any
/// padding the writer added.
#[derive(Debug, Clone)]
pub struct IncomingPacket {
    pub packet_type: PacketType,
    pub transaction_id: u64,
    pub flags: PacketFlags,
    pub desc: Vec<u8>,
    pub payload: Vec<u8>,
}

/// An in-progress read or write on a ring.
///
/// The guest memory mappings are released when the iterator is dropped. If
/// it is dropped without [`commit`](Self::commit), the ring's shared index is
/// left untouched, so a failed operation is invisible to the peer.
pub struct RingIter<'a> {
    ring: &'a mut RingBuffer,
    control: Box<dyn MappedRange + 'a>,
    cursor: GpadlCursor<'a>,
    /// Current offset within the data region.
    pos: u32,
}

impl RingIter<'_> {
    fn peer_index(&self) -> Result<u32, RingError> {
        let offset = match self.ring.role {
            Role::Producer => READ_INDEX,
            Role::Consumer => WRITE_INDEX,
        };
        let index = self.control.load_u32(offset);
        fence(Ordering::Acquire);
        if index >= self.ring.len {
            return Err(RingError::IndexOutOfRange {
                index,
                len: self.ring.len,
            });
        }
        Ok(index)
    }

    /// Moves to `offset` bytes past the index this operation started at.
    fn seek(&mut self, offset: usize) {
        let len = self.ring.len as u64;
        self.pos = ((self.ring.my_index as u64 + offset as u64) % len) as u32;
    }

    fn advance(&mut self, n: usize) {
        self.pos += n as u32;
        if self.pos == self.ring.len {
            self.pos = 0;
        }
    }

    fn write(&mut self, mut data: &[u8]) -> Result<(), RingError> {
        while !data.is_empty() {
            let n = data.len().min((self.ring.len - self.pos) as usize);
            self.cursor
                .write(self.ring.base + self.pos as usize, &data[..n])?;
            self.advance(n);
            data = &data[n..];
        }
        Ok(())
    }

    fn read(&mut self, mut buf: &mut [u8]) -> Result<(), RingError> {
        while !buf.is_empty() {
            let n = buf.len().min((self.ring.len - self.pos) as usize);
            let (this, rest) = buf.split_at_mut(n);
            self.cursor.read(self.ring.base + self.pos as usize, this)?;
            self.advance(n);
            buf = rest;
        }
        Ok(())
    }

    /// Writes a packet after the current position.
    pub fn write_packet(&mut self, packet: &OutgoingPacket<'_>) -> Result<(), RingError> {
        assert_eq!(self.ring.role, Role::Producer);
        let total = framed_len(packet.desc.len(), packet.payload.len());
        let too_large = || RingError::PacketTooLarge(total);
        let data_offset8 = u16::try_from((PACKET_HEADER_SIZE + packet.desc.len().next_multiple_of(8)) / 8)
            .map_err(|_| too_large())?;
        let len8 = u16::try_from((total - TRAILER_SIZE) / 8).map_err(|_| too_large())?;

        let read_index = self.peer_index()?;
        let start = self.pos_offset();
        let avail = distance(self.pos, read_index, self.ring.len, true);
        if total > avail as usize {
            return Err(RingError::Full {
                needed: total as u32,
            });
        }

        let header = PacketHeader {
            packet_type: packet.packet_type,
            data_offset8,
            len8,
            flags: PacketFlags::new().with_completion_requested(packet.completion_requested),
            transaction_id: packet.transaction_id,
        };
        self.write(header.as_bytes())?;
        self.write(packet.desc)?;
        self.seek(start + data_offset8 as usize * 8);
        self.write(packet.payload)?;
        self.seek(start + len8 as usize * 8);
        self.write(&(total as u64).to_le_bytes())?;
        Ok(())
    }

    /// Reads the next packet, or returns `None` if the ring is empty.
    pub fn read_packet(&mut self) -> Result<Option<IncomingPacket>, RingError> {
        assert_eq!(self.ring.role, Role::Consumer);
        let write_index = self.peer_index()?;
        let start = self.pos_offset();
        let avail = distance(self.pos, write_index, self.ring.len, false) as usize;
        if avail < PACKET_HEADER_SIZE {
            return Ok(None);
        }

        let mut header = PacketHeader::new_zeroed();
        self.read(header.as_mut_bytes())?;
        let packet_len = header.len8 as usize * 8;
        let payload_offset = header.data_offset8 as usize * 8;
        if packet_len + TRAILER_SIZE > avail {
            return Err(RingError::Malformed("packet extends past the write index"));
        }
        if payload_offset < PACKET_HEADER_SIZE || payload_offset > packet_len {
            return Err(RingError::Malformed("invalid payload offset"));
        }

        let mut desc = vec![0; payload_offset - PACKET_HEADER_SIZE];
        self.read(&mut desc)?;
        let mut payload = vec![0; packet_len - payload_offset];
        self.read(&mut payload)?;
        self.seek(start + packet_len + TRAILER_SIZE);
        Ok(Some(IncomingPacket {
            packet_type: header.packet_type,
            transaction_id: header.transaction_id,
            flags: header.flags,
            desc,
            payload,
        }))
    }

    /// Bytes between the index this operation started at and the current
    /// position.
    fn pos_offset(&self) -> usize {
        distance(self.ring.my_index, self.pos, self.ring.len, false) as usize
    }

    /// Publishes everything read or written so far to the peer.
    ///
    /// Returns whether the peer should be signaled.
    pub fn commit(mut self) -> bool {
        let new_index = self.pos;
        let signal = match self.ring.role {
            Role::Producer => self.commit_write(new_index),
            Role::Consumer => self.commit_read(new_index),
        };
        tracing::trace!(new_index, signal, role = ?self.ring.role, "ring index published");
        signal
    }

    fn commit_write(&mut self, new_index: u32) -> bool {
        let ring = &mut *self.ring;
        let len = ring.len;
        let written = distance(ring.my_index, new_index, len, false);
        if ring.pending_send_size != 0 {
            ring.pending_send_size = ring.pending_send_size.saturating_sub(written);
            self.control
                .store_u32(PENDING_SEND_SIZE, ring.pending_send_size);
        }

        fence(Ordering::SeqCst);
        self.control.store_u32(WRITE_INDEX, new_index);
        ring.my_index = new_index;
        fence(Ordering::SeqCst);

        if self.control.load_u32(INTERRUPT_MASK) != 0 {
            return false;
        }
        // Only signal if the consumer had caught up with everything that was
        // written before this packet.
        let read_index = self.control.load_u32(READ_INDEX);
        distance(read_index, new_index, len, false) <= written
    }

    fn commit_read(&mut self, new_index: u32) -> bool {
        let ring = &mut *self.ring;
        let len = ring.len;
        let old_index = ring.my_index;

        fence(Ordering::SeqCst);
        self.control.store_u32(READ_INDEX, new_index);
        ring.my_index = new_index;
        fence(Ordering::SeqCst);

        if self.control.load_u32(INTERRUPT_MASK) != 0 {
            return false;
        }
        let features = FeatureBits::from(self.control.load_u32(FEATURE_BITS));
        if !features.pending_send_size() {
            return true;
        }
        let wanted = self.control.load_u32(PENDING_SEND_SIZE);
        if wanted == 0 {
            return false;
        }
        fence(Ordering::Acquire);
        let write_index = self.control.load_u32(WRITE_INDEX);
        // Signal only on the transition from blocked to unblocked.
        distance(write_index, old_index, len, true) < wanted
            && distance(write_index, new_index, len, true) >= wanted
    }
}

#[cfg(test)]
mod tests;

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The interface between the bus and the devices that provide its channels.
//!
//! A device declares its offer through [`VmbusDevice::info`] and is called
//! back as its channels are opened, closed and signaled. Packet I/O goes
//! through a [`ChannelIo`], which is only handed out while the bus is not
//! otherwise borrowed.

use crate::EventPort;
use crate::Guid;
use crate::channels::Channel;
use crate::channels::ChannelState;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use vmbus_core::protocol::ChannelId;
use vmbus_core::protocol::OfferFlags;
use vmbus_ring::OutgoingPacket;
use vmbus_ring::PacketType;
use vmbus_ring::RingError;
use vmbus_ring::framed_len;
use vmbus_ring::gparange;
use vmbus_ring::gparange::ScatterGatherList;
use vmbus_ring::gparange::SgEntry;
use vmbus_ring::mem::Access;
use vmbus_ring::mem::GuestMemory;

/// Identifies an attached device.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct DeviceId(pub(crate) usize);

/// What a device offers to the guest.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub interface_id: Guid,
    pub instance_id: Guid,
    pub flags: OfferFlags,
    pub mmio_megabytes: u16,
    /// The number of channels, including the primary channel. Must be at
    /// least one.
    pub channel_count: u16,
}

/// A device exposing one or more VMBus channels.
pub trait VmbusDevice: Send {
    fn info(&self) -> DeviceInfo;

    /// Called when the guest opens channel `index`, after its rings have
    /// been bound. Failing the open reports failure to the guest.
    fn open(&mut self, index: u16) -> anyhow::Result<()> {
        let _ = index;
        Ok(())
    }

    /// Called when an open channel is closed, by the guest or by a reset.
    fn close(&mut self, index: u16) {
        let _ = index;
    }

    /// Called when the guest signals one of the device's open channels.
    fn notify(&mut self, channel: &mut ChannelIo<'_>);

    /// Called when the bus is reset.
    fn reset(&mut self) {}
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("channel is not open")]
    NotOpen,
    #[error("not enough room in the outgoing ring")]
    Backpressure,
    #[error("the guest did not request a completion")]
    CompletionNotRequested,
    #[error("completion of {0} bytes exceeds the reserved space")]
    CompletionTooLarge(usize),
    #[error("request is from an earlier open of the channel")]
    StaleRequest,
    #[error("ring error")]
    Ring(#[source] RingError),
}

impl From<RingError> for SendError {
    fn from(err: RingError) -> Self {
        match err {
            RingError::Full { .. } => Self::Backpressure,
            err => Self::Ring(err),
        }
    }
}

#[derive(Debug, Error)]
pub enum RecvError {
    #[error("channel is not open")]
    NotOpen,
    #[error("not enough room in the outgoing ring for the completion")]
    Backpressure,
    #[error("unsupported packet type {0:?}")]
    UnknownPacketType(PacketType),
    #[error("invalid gpa direct descriptor")]
    GpaDirect(#[from] gparange::Error),
    #[error("saved request is for channel index {saved}, not {actual}")]
    WrongChannel { saved: u16, actual: u16 },
    #[error("ring error")]
    Ring(#[from] RingError),
}

/// A packet received from the guest.
///
/// If the guest asked for a completion, room for it was reserved in the
/// outgoing ring when the packet was received. The request must be finished
/// with [`ChannelIo::send_completion`] or [`ChannelIo::release`] so that the
/// room is given back.
#[derive(Debug)]
#[must_use]
pub struct Request {
    subchannel_index: u16,
    packet_type: PacketType,
    transaction_id: u64,
    completion_requested: bool,
    message: Vec<u8>,
    payload_len: usize,
    sgl: ScatterGatherList,
    completion_reserved: u32,
    generation: u64,
}

/// The saved form of a [`Request`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedRequest {
    pub subchannel_index: u16,
    pub packet_type: u16,
    pub transaction_id: u64,
    pub completion_requested: bool,
    pub message: Vec<u8>,
    pub sgl: Vec<SgEntry>,
}

impl Request {
    pub fn subchannel_index(&self) -> u16 {
        self.subchannel_index
    }

    pub fn packet_type(&self) -> PacketType {
        self.packet_type
    }

    pub fn transaction_id(&self) -> u64 {
        self.transaction_id
    }

    pub fn completion_requested(&self) -> bool {
        self.completion_requested
    }

    /// The packet payload, zero-extended to the size asked for when
    /// receiving.
    pub fn message(&self) -> &[u8] {
        &self.message
    }

    pub fn message_mut(&mut self) -> &mut [u8] {
        &mut self.message
    }

    /// The length of the payload the guest sent, including padding.
    pub fn payload_len(&self) -> usize {
        self.payload_len
    }

    /// The guest buffers of a GPA-direct packet.
    pub fn sgl(&self) -> &[SgEntry] {
        &self.sgl
    }

    pub fn save(&self) -> SavedRequest {
        SavedRequest {
            subchannel_index: self.subchannel_index,
            packet_type: self.packet_type.0,
            transaction_id: self.transaction_id,
            completion_requested: self.completion_requested,
            message: self.message[..self.payload_len].to_vec(),
            sgl: self.sgl.to_vec(),
        }
    }
}

fn framed(desc_len: usize, payload_len: usize) -> Result<u32, RingError> {
    let len = framed_len(desc_len, payload_len);
    u32::try_from(len).map_err(|_| RingError::PacketTooLarge(len))
}

/// Packet I/O on one channel.
pub struct ChannelIo<'a> {
    pub(crate) channel: &'a mut Channel,
    pub(crate) mem: &'a GuestMemory,
    pub(crate) events: &'a dyn EventPort,
    pub(crate) interrupt_page: Option<u64>,
}

impl ChannelIo<'_> {
    pub fn subchannel_index(&self) -> u16 {
        self.channel.offer.subchannel_index
    }

    pub fn relid(&self) -> ChannelId {
        self.channel.relid
    }

    pub fn is_open(&self) -> bool {
        self.channel.state == ChannelState::Open
    }

    /// Guest memory, for accessing the buffers of GPA-direct requests.
    pub fn guest_memory(&self) -> &GuestMemory {
        self.mem
    }

    /// Reserves room in the outgoing ring for a packet of the given sizes,
    /// on top of any room already reserved.
    ///
    /// If there is not enough room, the guest is asked to signal once there
    /// is, at which point the device is notified.
    pub fn reserve(&mut self, desc_len: usize, payload_len: usize) -> Result<(), SendError> {
        let len = framed(desc_len, payload_len)?;
        self.request_room(len)?;
        self.channel.send_reserved += len;
        Ok(())
    }

    /// Checks that `len` bytes are free in the outgoing ring beyond
    /// everything already reserved.
    fn request_room(&mut self, len: u32) -> Result<(), SendError> {
        if self.channel.state != ChannelState::Open {
            return Err(SendError::NotOpen);
        }
        let rings = self.channel.rings.as_mut().ok_or(SendError::NotOpen)?;
        let needed = self
            .channel
            .send_reserved
            .checked_add(self.channel.completions_reserved)
            .and_then(|n| n.checked_add(len))
            .ok_or(RingError::PacketTooLarge(len as usize))?;
        rings.outgoing.request_room(self.mem, needed)?;
        Ok(())
    }

    /// Sends a packet. Room set aside with [`reserve`](Self::reserve) is
    /// used if there is enough of it; otherwise the packet must fit beside
    /// all outstanding reservations.
    pub fn send(
        &mut self,
        packet_type: PacketType,
        desc: &[u8],
        payload: &[u8],
        completion_requested: bool,
        transaction_id: u64,
    ) -> Result<(), SendError> {
        let len = framed(desc.len(), payload.len())?;
        let from_reserved = len <= self.channel.send_reserved;
        if !from_reserved {
            self.request_room(len)?;
        }
        self.write(&OutgoingPacket {
            packet_type,
            transaction_id,
            completion_requested,
            desc,
            payload,
        })?;
        if from_reserved {
            self.channel.send_reserved -= len;
        }
        Ok(())
    }

    fn write(&mut self, packet: &OutgoingPacket<'_>) -> Result<(), SendError> {
        if self.channel.state != ChannelState::Open {
            return Err(SendError::NotOpen);
        }
        let rings = self.channel.rings.as_mut().ok_or(SendError::NotOpen)?;
        let mut iter = rings.outgoing.iter(self.mem)?;
        iter.write_packet(packet)?;
        if iter.commit() {
            self.signal_guest();
        }
        Ok(())
    }

    /// Receives the next packet from the guest.
    ///
    /// The returned message buffer is at least `min_size` bytes long. A
    /// packet that cannot be received is left in the ring; if that is
    /// because there is no room for its completion, the device is notified
    /// again once the guest frees some.
    pub fn recv(&mut self, min_size: usize) -> Option<Request> {
        match self.try_recv(min_size) {
            Ok(request) => request,
            Err(RecvError::Backpressure) => {
                tracing::trace!(relid = self.channel.relid.0, "no room for completion");
                None
            }
            Err(err) => {
                tracing::warn!(
                    relid = self.channel.relid.0,
                    error = &err as &dyn std::error::Error,
                    "failed to receive packet"
                );
                None
            }
        }
    }

    fn try_recv(&mut self, min_size: usize) -> Result<Option<Request>, RecvError> {
        if self.channel.state != ChannelState::Open {
            return Err(RecvError::NotOpen);
        }
        let rings = self.channel.rings.as_mut().ok_or(RecvError::NotOpen)?;
        let mut iter = rings.incoming.iter(self.mem)?;
        let Some(packet) = iter.read_packet()? else {
            return Ok(None);
        };

        let sgl = match packet.packet_type {
            PacketType::DATA_USING_GPA_DIRECT => gparange::parse_gpa_direct(&packet.desc)?,
            PacketType::DATA_INBAND | PacketType::COMPLETION => ScatterGatherList::new(),
            ty => return Err(RecvError::UnknownPacketType(ty)),
        };

        let completion_requested = packet.flags.completion_requested();
        let mut completion_reserved = 0;
        if completion_requested {
            let len = framed(0, packet.payload.len())?;
            let needed = self
                .channel
                .send_reserved
                .checked_add(self.channel.completions_reserved)
                .and_then(|n| n.checked_add(len))
                .ok_or(RingError::PacketTooLarge(len as usize))?;
            rings
                .outgoing
                .request_room(self.mem, needed)
                .map_err(|err| match err {
                    RingError::Full { .. } => RecvError::Backpressure,
                    err => RecvError::Ring(err),
                })?;
            self.channel.completions_reserved += len;
            completion_reserved = len;
        }

        if iter.commit() {
            self.signal_guest();
        }

        let payload_len = packet.payload.len();
        let mut message = packet.payload;
        if message.len() < min_size {
            message.resize(min_size, 0);
        }
        Ok(Some(Request {
            subchannel_index: self.channel.offer.subchannel_index,
            packet_type: packet.packet_type,
            transaction_id: packet.transaction_id,
            completion_requested,
            message,
            payload_len,
            sgl,
            completion_reserved,
            generation: self.channel.generation,
        }))
    }

    /// Returns the completion room held by `request` if it belongs to the
    /// current open of this channel.
    fn take_reservation(&mut self, request: &Request) -> Option<u32> {
        if self.channel.rings.is_none()
            || request.generation != self.channel.generation
            || request.subchannel_index != self.channel.offer.subchannel_index
        {
            return None;
        }
        let reserved = request.completion_reserved;
        self.channel.completions_reserved -= reserved;
        Some(reserved)
    }

    /// Completes a request, sending `data` back to the guest in the room
    /// reserved for it.
    pub fn send_completion(&mut self, request: Request, data: &[u8]) -> Result<(), SendError> {
        if !request.completion_requested {
            return Err(SendError::CompletionNotRequested);
        }
        let reserved = self
            .take_reservation(&request)
            .ok_or(SendError::StaleRequest)?;
        let len = framed(0, data.len())?;
        if len > reserved {
            return Err(SendError::CompletionTooLarge(data.len()));
        }
        self.write(&OutgoingPacket {
            packet_type: PacketType::COMPLETION,
            transaction_id: request.transaction_id,
            completion_requested: false,
            desc: &[],
            payload: data,
        })
    }

    /// Drops a request without completing it, giving back its reserved
    /// room.
    pub fn release(&mut self, request: Request) {
        self.take_reservation(&request);
    }

    /// Recreates a request saved with [`Request::save`], reserving room for
    /// its completion again.
    pub fn load_request(&mut self, saved: &SavedRequest) -> Result<Request, RecvError> {
        let actual = self.channel.offer.subchannel_index;
        if saved.subchannel_index != actual {
            return Err(RecvError::WrongChannel {
                saved: saved.subchannel_index,
                actual,
            });
        }
        let mut completion_reserved = 0;
        if saved.completion_requested {
            let len = framed(0, saved.message.len())?;
            self.request_room(len).map_err(|err| match err {
                SendError::Backpressure => RecvError::Backpressure,
                SendError::Ring(err) => RecvError::Ring(err),
                _ => RecvError::NotOpen,
            })?;
            self.channel.completions_reserved += len;
            completion_reserved = len;
        }
        Ok(Request {
            subchannel_index: saved.subchannel_index,
            packet_type: PacketType(saved.packet_type),
            transaction_id: saved.transaction_id,
            completion_requested: saved.completion_requested,
            message: saved.message.clone(),
            payload_len: saved.message.len(),
            sgl: saved.sgl.iter().copied().collect(),
            completion_reserved,
            generation: self.channel.generation,
        })
    }

    /// Signals the guest that this channel needs attention.
    pub fn signal_guest(&self) {
        if let Err(err) = signal_channel(
            self.mem,
            self.events,
            self.interrupt_page,
            self.channel.relid,
            self.channel.target_vp,
        ) {
            tracing::warn!(
                relid = self.channel.relid.0,
                error = err.as_ref() as &dyn std::error::Error,
                "failed to signal guest"
            );
        }
    }
}

/// Signals channel `relid` to the guest.
///
/// Guests using the legacy interrupt page get the channel's bit set in the
/// host-to-guest half of the page, and an interrupt only if it was not
/// already pending. Other guests get the channel's event flag.
pub(crate) fn signal_channel(
    mem: &GuestMemory,
    events: &dyn EventPort,
    interrupt_page: Option<u64>,
    relid: ChannelId,
    target_vp: u32,
) -> anyhow::Result<()> {
    match interrupt_page {
        Some(page) => {
            let word = page
                .checked_add((relid.0 / 64) as u64 * 8)
                .ok_or_else(|| anyhow::anyhow!("invalid interrupt page {page:#x}"))?;
            let mask = 1 << (relid.0 % 64);
            let map = mem.map(word, 8, Access::ReadWrite)?;
            if map.fetch_or_u64(0, mask) & mask == 0 {
                events.assert_sint(target_vp)?;
            }
        }
        None => events.set_event_flag(target_vp, relid.0)?,
    }
    Ok(())
}

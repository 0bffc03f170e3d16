// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

mod saved_state;
#[cfg(test)]
mod tests;

use crate::Guid;
use crate::device::DeviceId;
use crate::gpadl::GpadlError;
use crate::gpadl::GpadlRegistry;
use crate::gpadl::GpadlReservation;
pub use saved_state::RestoreError;
pub use saved_state::SavedChannel;
pub use saved_state::SavedState;
use slab::Slab;
use std::collections::VecDeque;
use std::fmt::Display;
use thiserror::Error;
use vmbus_core::OutgoingMessage;
use vmbus_core::protocol;
use vmbus_core::protocol::ChannelId;
use vmbus_core::protocol::GpadlId;
use vmbus_core::protocol::MAX_MESSAGE_SIZE;
use vmbus_core::protocol::MONITOR_CONNECTION_ID;
use vmbus_core::protocol::Message;
use vmbus_core::protocol::MessageHeader;
use vmbus_core::protocol::OfferFlags;
use vmbus_core::protocol::Version;
use vmbus_ring::RingBuffer;
use vmbus_ring::RingError;
use vmbus_ring::mem::GuestMemory;
use zerocopy::FromBytes;

/// The size of the ID space shared by channel IDs and connection IDs. Both
/// index the guest's event flags.
pub const MAX_CHANNELS: usize = 2048;

const FIRST_CHANNEL_ID: u32 = 1;
const FIRST_CONNECTION_ID: u32 = MONITOR_CONNECTION_ID + 1;

/// The default number of guest messages that can wait to be processed.
pub const DEFAULT_INCOMING_QUEUE_CAPACITY: usize = 16;

/// An error caused by a channel operation.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("ring buffer GPADL is not usable")]
    Gpadl(#[from] GpadlError),
    #[error("invalid ring buffer layout")]
    Ring(#[from] RingError),
    #[error("device failed to open the channel")]
    DeviceOpen(#[source] anyhow::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OfferError {
    #[error("the ID {0} is not valid")]
    InvalidId(u32),
    #[error("the ID {0} is already in use")]
    IdInUse(u32),
    #[error("too many channels have been offered")]
    TooManyChannels,
}

/// Why a guest message was not accepted into the incoming queue.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IncomingMessageError {
    #[error("message of {0} bytes is too short")]
    TooShort(usize),
    #[error("message of {0} bytes is too long")]
    TooLong(usize),
    #[error("unknown message type {0:?}")]
    UnknownType(protocol::MessageType),
    #[error("incoming message queue is full")]
    QueueFull,
}

/// Why a message could not be handed to the guest.
#[derive(Debug, Error)]
pub enum PostError {
    /// The guest's message slot is occupied. The message is posted again on
    /// the next pass.
    #[error("message slot is busy")]
    Busy,
    #[error("message delivery failed")]
    Fatal(#[source] anyhow::Error),
}

/// The outcome of delivering the message that was last posted.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DeliveryStatus {
    Delivered,
    /// The guest did not take the message; post it again.
    Retry,
    Failed,
}

/// A unique identifier for an offered channel.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OfferId(usize);

/// The static properties of an offered channel.
#[derive(Debug, Clone)]
pub struct OfferParams {
    pub interface_id: Guid,
    pub instance_id: Guid,
    pub subchannel_index: u16,
    pub flags: OfferFlags,
    pub mmio_megabytes: u16,
}

/// Where a channel is in being offered to the guest.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OfferState {
    Init,
    Sending,
    Sent,
}

impl Display for OfferState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self {
            Self::Init => "Init",
            Self::Sending => "Sending",
            Self::Sent => "Sent",
        };
        write!(f, "{}", state)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChannelState {
    /// Closed.
    Init,
    /// The guest asked to open the channel and the result has not been
    /// delivered yet.
    Opening,
    Open,
}

impl Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self {
            Self::Init => "Init",
            Self::Opening => "Opening",
            Self::Open => "Open",
        };
        write!(f, "{}", state)
    }
}

/// The state of the bus connection with the guest. Every state other than
/// `Listen` has exactly one reply to deliver before the next guest message
/// is processed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Listen,
    Handshake,
    Offer,
    CreateGpadl,
    TeardownGpadl,
    OpenChannel,
    Unload,
}

impl Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self {
            Self::Listen => "Listen",
            Self::Handshake => "Handshake",
            Self::Offer => "Offer",
            Self::CreateGpadl => "CreateGpadl",
            Self::TeardownGpadl => "TeardownGpadl",
            Self::OpenChannel => "OpenChannel",
            Self::Unload => "Unload",
        };
        write!(f, "{}", state)
    }
}

/// The ring buffers of a channel whose GPADL has been bound.
#[derive(Debug)]
pub(crate) struct OpenRings {
    pub reservation: GpadlReservation,
    pub incoming: RingBuffer,
    pub outgoing: RingBuffer,
}

#[derive(Debug)]
pub struct Channel {
    pub(crate) device: DeviceId,
    pub(crate) offer: OfferParams,
    pub(crate) relid: ChannelId,
    pub(crate) connection_id: u32,
    pub(crate) offer_state: OfferState,
    pub(crate) state: ChannelState,
    pub(crate) target_vp: u32,
    pub(crate) open_id: u32,
    pub(crate) ring_gpadl_id: GpadlId,
    pub(crate) receive_offset: u32,
    pub(crate) rings: Option<OpenRings>,
    /// Bytes of the outgoing ring reserved by the device for its own sends.
    pub(crate) send_reserved: u32,
    /// Bytes of the outgoing ring held for completions of received requests.
    pub(crate) completions_reserved: u32,
    /// Incremented each time the rings are bound, so that requests from an
    /// earlier open can be told apart.
    pub(crate) generation: u64,
}

impl Channel {
    fn new(device: DeviceId, offer: OfferParams, relid: ChannelId, connection_id: u32) -> Self {
        Self {
            device,
            offer,
            relid,
            connection_id,
            offer_state: OfferState::Init,
            state: ChannelState::Init,
            target_vp: 0,
            open_id: 0,
            ring_gpadl_id: GpadlId(0),
            receive_offset: 0,
            rings: None,
            send_reserved: 0,
            completions_reserved: 0,
            generation: 0,
        }
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn subchannel_index(&self) -> u16 {
        self.offer.subchannel_index
    }

    pub fn relid(&self) -> ChannelId {
        self.relid
    }

    pub fn connection_id(&self) -> u32 {
        self.connection_id
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn offer_state(&self) -> OfferState {
        self.offer_state
    }

    pub fn target_vp(&self) -> u32 {
        self.target_vp
    }

    fn offer_message(&self) -> protocol::OfferChannel {
        protocol::OfferChannel {
            interface_id: self.offer.interface_id.to_bytes_le(),
            instance_id: self.offer.instance_id.to_bytes_le(),
            rsvd: [0; 4],
            flags: self.offer.flags,
            mmio_megabytes: self.offer.mmio_megabytes,
            user_defined: [0; 120],
            subchannel_index: self.offer.subchannel_index,
            mmio_megabytes_optional: 0,
            channel_id: self.relid,
            monitor_id: 0,
            monitor_allocated: 0,
            is_dedicated: protocol::OFFER_INTERRUPT_DEDICATED,
            connection_id: self.connection_id,
        }
    }
}

/// Tracks which IDs of one ID space are in use, and by which channel.
#[derive(Debug)]
struct AssignedIds {
    first: u32,
    assignments: Vec<Option<OfferId>>,
}

impl AssignedIds {
    fn new(first: u32) -> Self {
        Self {
            first,
            assignments: vec![None; MAX_CHANNELS - first as usize],
        }
    }

    fn index(&self, id: u32) -> Option<usize> {
        let index = id.checked_sub(self.first)? as usize;
        (index < self.assignments.len()).then_some(index)
    }

    fn get(&self, id: u32) -> Option<OfferId> {
        self.assignments[self.index(id)?]
    }

    /// Assigns the lowest free ID to `offer_id`.
    fn allocate(&mut self, offer_id: OfferId) -> Option<u32> {
        let index = self.assignments.iter().position(|x| x.is_none())?;
        self.assignments[index] = Some(offer_id);
        Some(self.first + index as u32)
    }

    /// Assigns a specific ID to `offer_id`.
    fn claim(&mut self, id: u32, offer_id: OfferId) -> Result<(), OfferError> {
        let index = self.index(id).ok_or(OfferError::InvalidId(id))?;
        let slot = &mut self.assignments[index];
        if slot.is_some() {
            return Err(OfferError::IdInUse(id));
        }
        *slot = Some(offer_id);
        Ok(())
    }

    fn free(&mut self, id: u32, offer_id: OfferId) {
        let index = self.index(id).expect("assigned ids are in range");
        assert_eq!(self.assignments[index].take(), Some(offer_id));
    }
}

/// The bus's side effects on the outside world.
pub trait Notifier {
    /// Posts a message to the guest's synic on `target_vp`. On success,
    /// delivery is reported later through
    /// [`ServerWithNotifier::complete_message`].
    fn send_message(&mut self, message: &OutgoingMessage, target_vp: u32) -> Result<(), PostError>;

    /// Runs the device's open hook for a channel whose rings are bound.
    fn open_channel(&mut self, device: DeviceId, subchannel_index: u16) -> anyhow::Result<()>;

    /// Runs the device's close hook for a channel that was opened.
    fn close_channel(&mut self, device: DeviceId, subchannel_index: u16);

    /// Runs every device's reset hook.
    fn reset(&mut self);
}

/// A struct modeling the server side of the VMBus control plane.
pub struct Server {
    state: ConnectionState,
    /// The version the guest requested, which may be unsupported. Zero
    /// before the first handshake.
    version: u32,
    max_version: u32,
    target_vp: u32,
    interrupt_page: Option<u64>,
    message_in_flight: bool,
    incoming: VecDeque<Vec<u8>>,
    incoming_capacity: usize,
    channels: Slab<Channel>,
    assigned_channels: AssignedIds,
    assigned_connections: AssignedIds,
    gpadls: GpadlRegistry,
    mem: GuestMemory,
}

pub struct ServerWithNotifier<'a, T> {
    inner: &'a mut Server,
    notifier: &'a mut T,
}

impl Server {
    /// Creates a new VMBus server.
    pub fn new(mem: GuestMemory, max_version: u32, incoming_capacity: usize) -> Self {
        Self {
            state: ConnectionState::Listen,
            version: 0,
            max_version,
            target_vp: 0,
            interrupt_page: None,
            message_in_flight: false,
            incoming: VecDeque::new(),
            incoming_capacity,
            channels: Slab::new(),
            assigned_channels: AssignedIds::new(FIRST_CHANNEL_ID),
            assigned_connections: AssignedIds::new(FIRST_CONNECTION_ID),
            gpadls: GpadlRegistry::new(),
            mem,
        }
    }

    /// Associates a `Notifier` with the server.
    pub fn with_notifier<'a, T: Notifier>(
        &'a mut self,
        notifier: &'a mut T,
    ) -> ServerWithNotifier<'a, T> {
        ServerWithNotifier {
            inner: self,
            notifier,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Returns true if the guest negotiated a version this server supports.
    pub fn is_connected(&self) -> bool {
        self.version != 0 && self.version <= self.max_version
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn target_vp(&self) -> u32 {
        self.target_vp
    }

    /// The legacy interrupt page, for guests older than Windows 8.
    pub fn interrupt_page(&self) -> Option<u64> {
        self.interrupt_page
    }

    pub fn message_in_flight(&self) -> bool {
        self.message_in_flight
    }

    pub fn incoming_len(&self) -> usize {
        self.incoming.len()
    }

    pub fn gpadls(&self) -> &GpadlRegistry {
        &self.gpadls
    }

    pub fn gpadls_mut(&mut self) -> &mut GpadlRegistry {
        &mut self.gpadls
    }

    pub fn channel(&self, offer_id: OfferId) -> &Channel {
        &self.channels[offer_id.0]
    }

    pub fn channel_mut(&mut self, offer_id: OfferId) -> &mut Channel {
        &mut self.channels[offer_id.0]
    }

    pub fn channels(&self) -> impl Iterator<Item = (OfferId, &Channel)> {
        self.channels.iter().map(|(id, channel)| (OfferId(id), channel))
    }

    pub fn channel_by_relid(&self, relid: ChannelId) -> Option<OfferId> {
        self.assigned_channels.get(relid.0)
    }

    pub fn channel_by_connection_id(&self, connection_id: u32) -> Option<OfferId> {
        self.assigned_connections.get(connection_id)
    }

    /// Queues a message from the guest for processing.
    ///
    /// Messages of an unknown type or with an impossible size are refused
    /// here. Messages too short for their type's body are accepted and
    /// dropped when processed.
    pub fn post_message(&mut self, data: &[u8]) -> Result<(), IncomingMessageError> {
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(IncomingMessageError::TooLong(data.len()));
        }
        let Ok((header, _)) = MessageHeader::read_from_prefix(data) else {
            return Err(IncomingMessageError::TooShort(data.len()));
        };
        if !header.message_type().is_known() {
            return Err(IncomingMessageError::UnknownType(header.message_type()));
        }
        if self.incoming.len() >= self.incoming_capacity {
            return Err(IncomingMessageError::QueueFull);
        }
        self.incoming.push_back(data.to_vec());
        Ok(())
    }

    /// Offers a new channel. The guest sees it the next time it requests
    /// offers.
    pub fn offer_channel(
        &mut self,
        device: DeviceId,
        offer: OfferParams,
    ) -> Result<OfferId, OfferError> {
        let entry = self.channels.vacant_entry();
        let offer_id = OfferId(entry.key());
        let relid = self
            .assigned_channels
            .allocate(offer_id)
            .ok_or(OfferError::TooManyChannels)?;
        let Some(connection_id) = self.assigned_connections.allocate(offer_id) else {
            self.assigned_channels.free(relid, offer_id);
            return Err(OfferError::TooManyChannels);
        };
        tracing::debug!(
            relid,
            connection_id,
            instance_id = %offer.instance_id,
            subchannel_index = offer.subchannel_index,
            "offering channel"
        );
        entry.insert(Channel::new(device, offer, ChannelId(relid), connection_id));
        Ok(offer_id)
    }

    /// Removes a closed channel and releases its IDs.
    pub fn revoke_channel(&mut self, offer_id: OfferId) {
        let channel = self.channels.remove(offer_id.0);
        assert!(channel.rings.is_none(), "channel must be closed");
        self.assigned_channels.free(channel.relid.0, offer_id);
        self.assigned_connections
            .free(channel.connection_id, offer_id);
    }

    /// Builds the reply owed for the current state.
    fn reply(&self) -> Option<OutgoingMessage> {
        let message = match self.state {
            ConnectionState::Listen => return None,
            ConnectionState::Handshake => OutgoingMessage::new(&protocol::VersionResponse {
                version_supported: self.is_connected().into(),
                connection_state: 0,
                padding: 0,
                message_connection_id: 0,
            }),
            ConnectionState::Offer => {
                match self
                    .channels
                    .iter()
                    .find(|(_, c)| c.offer_state == OfferState::Sending)
                {
                    Some((_, channel)) => OutgoingMessage::new(&channel.offer_message()),
                    None => OutgoingMessage::new(&protocol::AllOffersDelivered {}),
                }
            }
            ConnectionState::CreateGpadl => {
                let gpadl = self.gpadls.pending_create()?;
                OutgoingMessage::new(&protocol::GpadlCreated {
                    channel_id: gpadl.owner(),
                    gpadl_id: gpadl.id(),
                    status: if gpadl.is_broken() {
                        protocol::STATUS_UNSUCCESSFUL
                    } else {
                        protocol::STATUS_SUCCESS
                    },
                })
            }
            ConnectionState::TeardownGpadl => {
                let gpadl = self.gpadls.pending_teardown()?;
                OutgoingMessage::new(&protocol::GpadlTorndown {
                    gpadl_id: gpadl.id(),
                })
            }
            ConnectionState::OpenChannel => {
                let (_, channel) = self
                    .channels
                    .iter()
                    .find(|(_, c)| c.state == ChannelState::Opening)?;
                OutgoingMessage::new(&protocol::OpenResult {
                    channel_id: channel.relid,
                    open_id: channel.open_id,
                    status: if channel.rings.is_some() {
                        protocol::STATUS_SUCCESS
                    } else {
                        protocol::STATUS_UNSUCCESSFUL
                    },
                })
            }
            ConnectionState::Unload => OutgoingMessage::new(&protocol::UnloadComplete {}),
        };
        Some(message)
    }

    /// Moves on from an offer that the guest has received.
    fn complete_offer(&mut self) {
        let Some(sent) = self
            .channels
            .iter()
            .find(|(_, c)| c.offer_state == OfferState::Sending)
            .map(|(id, _)| id)
        else {
            // That was the end-of-offers message.
            self.state = ConnectionState::Listen;
            return;
        };
        self.channels[sent].offer_state = OfferState::Sent;
        if let Some((_, next)) = self
            .channels
            .iter_mut()
            .find(|(id, c)| *id > sent && c.offer_state == OfferState::Init)
        {
            next.offer_state = OfferState::Sending;
        }
    }
}

impl<T: Notifier> ServerWithNotifier<'_, T> {
    /// Makes one step of progress: processes the next guest message, or
    /// posts the reply owed for the current state.
    ///
    /// Returns false when nothing more can be done until a message arrives
    /// or the outstanding delivery completes.
    pub fn run(&mut self) -> bool {
        if self.inner.message_in_flight {
            return false;
        }
        if self.inner.state == ConnectionState::Listen {
            let Some(data) = self.inner.incoming.pop_front() else {
                return false;
            };
            self.handle_message(&data);
            true
        } else {
            self.send_reply()
        }
    }

    /// Reports the outcome of the delivery started by the last post.
    pub fn complete_message(&mut self, status: DeliveryStatus) {
        if !self.inner.message_in_flight {
            tracing::warn!(?status, "unexpected message delivery completion");
            return;
        }
        self.inner.message_in_flight = false;
        match status {
            DeliveryStatus::Delivered => self.complete_reply(),
            DeliveryStatus::Retry => {
                tracing::debug!(state = %self.inner.state, "guest message slot busy, retrying");
            }
            DeliveryStatus::Failed => {
                tracing::error!(state = %self.inner.state, "message delivery failed");
                self.reset();
            }
        }
    }

    /// Closes all channels and returns the bus to its initial state. Offers
    /// are kept but will be sent again.
    pub fn reset(&mut self) {
        tracing::info!("resetting vmbus");
        let offer_ids: Vec<_> = self.inner.channels().map(|(id, _)| id).collect();
        for offer_id in offer_ids {
            self.close_channel(offer_id);
            self.inner.channels[offer_id.0].offer_state = OfferState::Init;
        }
        self.notifier.reset();

        let inner = &mut *self.inner;
        inner.gpadls.clear();
        inner.version = 0;
        inner.target_vp = 0;
        inner.interrupt_page = None;
        inner.state = ConnectionState::Listen;
        inner.message_in_flight = false;
    }

    fn send_reply(&mut self) -> bool {
        let Some(message) = self.inner.reply() else {
            tracing::warn!(state = %self.inner.state, "no reply to send");
            self.inner.state = ConnectionState::Listen;
            return true;
        };
        match self.notifier.send_message(&message, self.inner.target_vp) {
            Ok(()) => {
                tracing::trace!(?message, "posted vmbus message");
                self.inner.message_in_flight = true;
                true
            }
            Err(PostError::Busy) => false,
            Err(PostError::Fatal(err)) => {
                tracing::error!(
                    error = err.as_ref() as &dyn std::error::Error,
                    state = %self.inner.state,
                    "failed to post message"
                );
                self.reset();
                true
            }
        }
    }

    fn complete_reply(&mut self) {
        match self.inner.state {
            ConnectionState::Listen => {}
            ConnectionState::Handshake => self.inner.state = ConnectionState::Listen,
            ConnectionState::Offer => self.inner.complete_offer(),
            ConnectionState::CreateGpadl => {
                self.inner.gpadls.complete_create();
                self.inner.state = ConnectionState::Listen;
            }
            ConnectionState::TeardownGpadl => {
                self.inner.gpadls.complete_teardown();
                self.inner.state = ConnectionState::Listen;
            }
            ConnectionState::OpenChannel => {
                if let Some((_, channel)) = self
                    .inner
                    .channels
                    .iter_mut()
                    .find(|(_, c)| c.state == ChannelState::Opening)
                {
                    channel.state = if channel.rings.is_some() {
                        ChannelState::Open
                    } else {
                        ChannelState::Init
                    };
                    tracing::debug!(relid = channel.relid.0, state = %channel.state, "open complete");
                }
                self.inner.state = ConnectionState::Listen;
            }
            ConnectionState::Unload => self.reset(),
        }
    }

    fn handle_message(&mut self, data: &[u8]) {
        let msg = match Message::parse(data) {
            Ok(msg) => msg,
            Err(err) => {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    "dropping invalid vmbus message"
                );
                return;
            }
        };
        tracing::trace!(?msg, "received vmbus message");

        if !matches!(msg, Message::InitiateContact(_) | Message::Unload) && !self.inner.is_connected()
        {
            tracing::warn!(?msg, "message received before version negotiation");
            return;
        }

        match msg {
            Message::InitiateContact(input) => self.handle_initiate_contact(&input),
            Message::RequestOffers => self.handle_request_offers(),
            Message::GpadlHeader(input, range) => self.handle_gpadl_header(&input, &range),
            Message::GpadlBody(input, pages) => self.handle_gpadl_body(&input, &pages),
            Message::GpadlTeardown(input) => self.handle_gpadl_teardown(&input),
            Message::OpenChannel(input) => self.handle_open_channel(&input),
            Message::CloseChannel(input) => self.handle_close_channel(&input),
            Message::Unload => self.handle_unload(),
        }
    }

    fn handle_initiate_contact(&mut self, input: &protocol::InitiateContact) {
        self.reset();
        let inner = &mut *self.inner;
        inner.version = input.version_requested;
        inner.target_vp = input.target_message_vp;
        inner.interrupt_page = (input.version_requested < Version::Win8 as u32
            && input.interrupt_page != 0)
            .then_some(input.interrupt_page);
        inner.state = ConnectionState::Handshake;
        tracing::info!(
            version = inner.version,
            supported = inner.is_connected(),
            target_vp = inner.target_vp,
            "guest initiated contact"
        );
    }

    fn handle_request_offers(&mut self) {
        if let Some((_, channel)) = self
            .inner
            .channels
            .iter_mut()
            .find(|(_, c)| c.offer_state == OfferState::Init)
        {
            channel.offer_state = OfferState::Sending;
        }
        self.inner.state = ConnectionState::Offer;
    }

    fn handle_gpadl_header(&mut self, input: &protocol::GpadlHeader, range: &protocol::GpadlRange) {
        tracing::debug!(
            gpadl_id = input.gpadl_id.0,
            channel_id = input.channel_id.0,
            byte_count = range.range.byte_count,
            "gpadl header"
        );
        self.inner.gpadls.create(
            input.gpadl_id,
            input.channel_id,
            input.count,
            range.range.byte_offset,
            range.range.byte_count,
        );
        if self.inner.gpadls.append(input.gpadl_id, &range.pages) == Some(true) {
            self.inner.state = ConnectionState::CreateGpadl;
        }
    }

    fn handle_gpadl_body(&mut self, input: &protocol::GpadlBody, pages: &[u64]) {
        let id = input.gpadl_id;
        let full = match self.inner.gpadls.get(id) {
            None => {
                tracing::warn!(gpadl_id = id.0, "gpadl body for unknown gpadl");
                self.inner.gpadls.create_broken(id);
                true
            }
            Some(gpadl) if gpadl.is_full() => {
                tracing::warn!(gpadl_id = id.0, "gpadl body for complete gpadl");
                return;
            }
            Some(_) => self.inner.gpadls.append(id, pages) == Some(true),
        };
        if full {
            self.inner.state = ConnectionState::CreateGpadl;
        }
    }

    fn handle_gpadl_teardown(&mut self, input: &protocol::GpadlTeardown) {
        match self.inner.gpadls.teardown(input.gpadl_id) {
            Ok(()) => self.inner.state = ConnectionState::TeardownGpadl,
            Err(GpadlError::InUse(id)) => {
                // The guest must close the channel using it and try again.
                tracing::debug!(gpadl_id = id.0, "ignoring teardown of gpadl in use");
            }
            Err(err) => {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    "invalid gpadl teardown"
                );
            }
        }
    }

    fn handle_open_channel(&mut self, input: &protocol::OpenChannel) {
        let Some(offer_id) = self.inner.channel_by_relid(input.channel_id) else {
            tracing::warn!(relid = input.channel_id.0, "open of unknown channel");
            return;
        };
        let channel = &mut self.inner.channels[offer_id.0];
        if channel.state != ChannelState::Init {
            tracing::warn!(relid = channel.relid.0, state = %channel.state, "open of channel that is not closed");
            return;
        }
        channel.state = ChannelState::Opening;
        channel.open_id = input.open_id;
        channel.ring_gpadl_id = input.ring_buffer_gpadl_id;
        channel.receive_offset = input.downstream_ring_buffer_page_offset;
        channel.target_vp = input.target_vp;

        if let Err(err) = self.open_channel(offer_id) {
            tracing::warn!(
                relid = input.channel_id.0,
                error = &err as &dyn std::error::Error,
                "failed to open channel"
            );
        }
        self.inner.state = ConnectionState::OpenChannel;
    }

    fn handle_close_channel(&mut self, input: &protocol::CloseChannel) {
        let Some(offer_id) = self.inner.channel_by_relid(input.channel_id) else {
            tracing::warn!(relid = input.channel_id.0, "close of unknown channel");
            return;
        };
        let state = self.inner.channels[offer_id.0].state;
        if state != ChannelState::Open {
            tracing::debug!(relid = input.channel_id.0, %state, "close of channel that is not open");
            return;
        }
        self.close_channel(offer_id);
    }

    fn handle_unload(&mut self) {
        self.inner.incoming.clear();
        self.inner.state = ConnectionState::Unload;
    }

    /// Binds the channel's rings to its GPADL and runs the device open hook.
    /// On failure the channel is left without rings.
    fn open_channel(&mut self, offer_id: OfferId) -> Result<(), ChannelError> {
        let inner = &mut *self.inner;
        let channel = &mut inner.channels[offer_id.0];
        let reservation = inner.gpadls.acquire(channel.ring_gpadl_id)?;
        let pages = reservation.pages().clone();
        let offset = channel.receive_offset as usize;
        let rings = RingBuffer::incoming(&inner.mem, pages.clone(), offset).and_then(|incoming| {
            Ok((incoming, RingBuffer::outgoing(&inner.mem, pages, offset)?))
        });
        let (incoming, outgoing) = match rings {
            Ok(rings) => rings,
            Err(err) => {
                inner.gpadls.release(reservation);
                return Err(err.into());
            }
        };
        channel.rings = Some(OpenRings {
            reservation,
            incoming,
            outgoing,
        });
        channel.send_reserved = 0;
        channel.completions_reserved = 0;
        channel.generation += 1;

        let (device, index) = (channel.device, channel.offer.subchannel_index);
        if let Err(err) = self.notifier.open_channel(device, index) {
            let inner = &mut *self.inner;
            if let Some(rings) = inner.channels[offer_id.0].rings.take() {
                inner.gpadls.release(rings.reservation);
            }
            return Err(ChannelError::DeviceOpen(err));
        }
        Ok(())
    }

    /// Closes a channel, running the device close hook if it was opened.
    ///
    /// Returns false if the channel was already closed.
    pub fn close_channel(&mut self, offer_id: OfferId) -> bool {
        let channel = &mut self.inner.channels[offer_id.0];
        if channel.state == ChannelState::Init {
            return false;
        }
        tracing::debug!(relid = channel.relid.0, state = %channel.state, "closing channel");
        channel.state = ChannelState::Init;
        channel.send_reserved = 0;
        channel.completions_reserved = 0;
        let (device, index) = (channel.device, channel.offer.subchannel_index);
        if let Some(rings) = channel.rings.take() {
            self.notifier.close_channel(device, index);
            self.inner.gpadls.release(rings.reservation);
        }
        true
    }
}

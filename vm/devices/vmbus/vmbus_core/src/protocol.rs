// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! VMBus control-plane message definitions.
//!
//! Every message starts with a [`MessageHeader`] followed by a fixed body.
//! GPADL messages additionally carry a trailing page-number list, which
//! [`Message::parse`] decodes into an owned buffer.

use bitfield_struct::bitfield;
use static_assertions::const_assert_eq;
use std::fmt;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// The maximum size of a synic message payload, including the VMBus header.
pub const MAX_MESSAGE_SIZE: usize = 240;

pub const HEADER_SIZE: usize = size_of::<MessageHeader>();

/// Connection ID the guest posts control messages to.
pub const MESSAGE_CONNECTION_ID: u32 = 1;
/// Connection ID used for guest signals multiplexed through the legacy
/// interrupt page.
pub const EVENT_CONNECTION_ID: u32 = 2;
pub const MONITOR_CONNECTION_ID: u32 = 3;

/// The SINT the host uses for VMBus messages and events.
pub const SINT: u8 = 2;

pub const STATUS_SUCCESS: u32 = 0;
pub const STATUS_UNSUCCESSFUL: u32 = 0xc0000001;

/// Set in [`OfferChannel::is_dedicated`] when the channel uses its own event
/// flag instead of the legacy interrupt page.
pub const OFFER_INTERRUPT_DEDICATED: u16 = 1;

#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct MessageType(pub u32);

impl MessageType {
    pub const INVALID: Self = Self(0);
    pub const OFFER_CHANNEL: Self = Self(1);
    pub const RESCIND_CHANNEL_OFFER: Self = Self(2);
    pub const REQUEST_OFFERS: Self = Self(3);
    pub const ALL_OFFERS_DELIVERED: Self = Self(4);
    pub const OPEN_CHANNEL: Self = Self(5);
    pub const OPEN_CHANNEL_RESULT: Self = Self(6);
    pub const CLOSE_CHANNEL: Self = Self(7);
    pub const GPADL_HEADER: Self = Self(8);
    pub const GPADL_BODY: Self = Self(9);
    pub const GPADL_CREATED: Self = Self(10);
    pub const GPADL_TEARDOWN: Self = Self(11);
    pub const GPADL_TORNDOWN: Self = Self(12);
    pub const REL_ID_RELEASED: Self = Self(13);
    pub const INITIATE_CONTACT: Self = Self(14);
    pub const VERSION_RESPONSE: Self = Self(15);
    pub const UNLOAD: Self = Self(16);
    pub const UNLOAD_COMPLETE: Self = Self(17);

    /// Returns true if this is a message type defined by the protocol.
    pub fn is_known(self) -> bool {
        self != Self::INVALID && self <= Self::UNLOAD_COMPLETE
    }

    fn name(self) -> Option<&'static str> {
        let name = match self {
            Self::INVALID => "INVALID",
            Self::OFFER_CHANNEL => "OFFER_CHANNEL",
            Self::RESCIND_CHANNEL_OFFER => "RESCIND_CHANNEL_OFFER",
            Self::REQUEST_OFFERS => "REQUEST_OFFERS",
            Self::ALL_OFFERS_DELIVERED => "ALL_OFFERS_DELIVERED",
            Self::OPEN_CHANNEL => "OPEN_CHANNEL",
            Self::OPEN_CHANNEL_RESULT => "OPEN_CHANNEL_RESULT",
            Self::CLOSE_CHANNEL => "CLOSE_CHANNEL",
            Self::GPADL_HEADER => "GPADL_HEADER",
            Self::GPADL_BODY => "GPADL_BODY",
            Self::GPADL_CREATED => "GPADL_CREATED",
            Self::GPADL_TEARDOWN => "GPADL_TEARDOWN",
            Self::GPADL_TORNDOWN => "GPADL_TORNDOWN",
            Self::REL_ID_RELEASED => "REL_ID_RELEASED",
            Self::INITIATE_CONTACT => "INITIATE_CONTACT",
            Self::VERSION_RESPONSE => "VERSION_RESPONSE",
            Self::UNLOAD => "UNLOAD",
            Self::UNLOAD_COMPLETE => "UNLOAD_COMPLETE",
            _ => return None,
        };
        Some(name)
    }
}

impl fmt::Debug for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.pad(name),
            None => write!(f, "MessageType({})", self.0),
        }
    }
}

/// Protocol versions, in negotiation order.
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Version {
    V1 = 0x0000000d,
    Win7 = 0x00010001,
    Win8 = 0x00020004,
    Win8_1 = 0x00030000,
    Win10 = 0x00040000,
}

impl Version {
    /// The newest version this implementation speaks.
    pub const CURRENT: Self = Self::Win10;
}

#[repr(transparent)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct ChannelId(pub u32);

#[repr(transparent)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct GpadlId(pub u32);

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct MessageHeader {
    message_type: MessageType,
    padding: u32,
}

impl MessageHeader {
    pub fn new(message_type: MessageType) -> Self {
        Self {
            message_type,
            padding: 0,
        }
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }
}

#[bitfield(u16)]
#[derive(PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct OfferFlags {
    pub enumerate_device_interface: bool,
    #[bits(3)]
    _reserved: u8,
    pub named_pipe_mode: bool,
    #[bits(3)]
    _reserved2: u8,
    pub loopback: bool,
    pub parent_offer: bool,
    pub request_monitored_notification: bool,
    #[bits(2)]
    _reserved3: u8,
    pub tlnpi_provider: bool,
    #[bits(2)]
    _reserved4: u8,
}

pub type UserDefinedData = [u8; 120];

/// Associates a message body with its message type.
pub trait VmbusMessage: Sized {
    const MESSAGE_TYPE: MessageType;
}

macro_rules! vmbus_messages {
    ($($name:ident => $ty:ident,)*) => {
        $(
            impl VmbusMessage for $name {
                const MESSAGE_TYPE: MessageType = MessageType::$ty;
            }
        )*
    };
}

vmbus_messages! {
    InitiateContact => INITIATE_CONTACT,
    VersionResponse => VERSION_RESPONSE,
    RequestOffers => REQUEST_OFFERS,
    OfferChannel => OFFER_CHANNEL,
    AllOffersDelivered => ALL_OFFERS_DELIVERED,
    GpadlHeader => GPADL_HEADER,
    GpadlBody => GPADL_BODY,
    GpadlCreated => GPADL_CREATED,
    GpadlTeardown => GPADL_TEARDOWN,
    GpadlTorndown => GPADL_TORNDOWN,
    OpenChannel => OPEN_CHANNEL,
    OpenResult => OPEN_CHANNEL_RESULT,
    CloseChannel => CLOSE_CHANNEL,
    Unload => UNLOAD,
    UnloadComplete => UNLOAD_COMPLETE,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct InitiateContact {
    pub version_requested: u32,
    pub target_message_vp: u32,
    pub interrupt_page: u64,
    pub parent_to_child_monitor_page_gpa: u64,
    pub child_to_parent_monitor_page_gpa: u64,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct VersionResponse {
    pub version_supported: u8,
    pub connection_state: u8,
    pub padding: u16,
    pub message_connection_id: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct RequestOffers {}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct OfferChannel {
    pub interface_id: [u8; 16],
    pub instance_id: [u8; 16],
    pub rsvd: [u32; 4],
    pub flags: OfferFlags,
    pub mmio_megabytes: u16,
    pub user_defined: UserDefinedData,
    pub subchannel_index: u16,
    pub mmio_megabytes_optional: u16,
    pub channel_id: ChannelId,
    pub monitor_id: u8,
    pub monitor_allocated: u8,
    pub is_dedicated: u16,
    pub connection_id: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct AllOffersDelivered {}

/// The fixed part of a GPADL header. It is followed by a [`GpaRange`]
/// header and the first page numbers of the range.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct GpadlHeader {
    pub channel_id: ChannelId,
    pub gpadl_id: GpadlId,
    pub len: u16,
    pub count: u16,
}

/// The leading range descriptor in a GPADL header.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct GpaRange {
    pub byte_count: u32,
    pub byte_offset: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct GpadlBody {
    pub rsvd: u32,
    pub gpadl_id: GpadlId,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct GpadlCreated {
    pub channel_id: ChannelId,
    pub gpadl_id: GpadlId,
    pub status: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct GpadlTeardown {
    pub channel_id: ChannelId,
    pub gpadl_id: GpadlId,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct GpadlTorndown {
    pub gpadl_id: GpadlId,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct OpenChannel {
    pub channel_id: ChannelId,
    pub open_id: u32,
    pub ring_buffer_gpadl_id: GpadlId,
    pub target_vp: u32,
    pub downstream_ring_buffer_page_offset: u32,
    pub user_data: UserDefinedData,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct OpenResult {
    pub channel_id: ChannelId,
    pub open_id: u32,
    pub status: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct CloseChannel {
    pub channel_id: ChannelId,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct Unload {}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct UnloadComplete {}

const_assert_eq!(size_of::<MessageHeader>(), 8);
const_assert_eq!(size_of::<InitiateContact>(), 32);
const_assert_eq!(size_of::<OfferChannel>(), 188);
const_assert_eq!(size_of::<GpadlHeader>() + size_of::<GpaRange>(), 20);
const_assert_eq!(size_of::<OpenChannel>(), 140);
const_assert_eq!(HEADER_SIZE + size_of::<OfferChannel>(), 196);

/// The page list carried by a GPADL header: the declared range shape plus the
/// page numbers that fit in the message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GpadlRange {
    pub range: GpaRange,
    pub pages: Vec<u64>,
}

/// A parsed guest-to-host control message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    InitiateContact(InitiateContact),
    RequestOffers,
    GpadlHeader(GpadlHeader, GpadlRange),
    GpadlBody(GpadlBody, Vec<u64>),
    GpadlTeardown(GpadlTeardown),
    OpenChannel(OpenChannel),
    CloseChannel(CloseChannel),
    Unload,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("message is too small for its header")]
    MissingHeader,
    #[error("{0:?} message is too small")]
    MessageTooSmall(MessageType),
    #[error("unexpected message type {0:?}")]
    UnexpectedType(MessageType),
}

fn read_body<T: FromBytes + KnownLayout + Immutable + VmbusMessage>(
    data: &[u8],
) -> Result<(T, &[u8]), ParseError> {
    T::read_from_prefix(data).map_err(|_| ParseError::MessageTooSmall(T::MESSAGE_TYPE))
}

/// Decodes a trailing list of little-endian page numbers. A partial final
/// entry is ignored.
fn page_list(data: &[u8]) -> Vec<u64> {
    let mut pages = vec![0u64; data.len() / 8];
    let len = pages.len() * 8;
    pages.as_mut_bytes().copy_from_slice(&data[..len]);
    pages
}

impl Message {
    /// Parses a control message, including its header.
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let (header, data) =
            MessageHeader::read_from_prefix(data).map_err(|_| ParseError::MissingHeader)?;

        let message = match header.message_type {
            MessageType::INITIATE_CONTACT => Self::InitiateContact(read_body(data)?.0),
            MessageType::REQUEST_OFFERS => Self::RequestOffers,
            MessageType::GPADL_HEADER => {
                let (input, rest) = read_body::<GpadlHeader>(data)?;
                let (range, rest) = GpaRange::read_from_prefix(rest)
                    .map_err(|_| ParseError::MessageTooSmall(MessageType::GPADL_HEADER))?;
                Self::GpadlHeader(
                    input,
                    GpadlRange {
                        range,
                        pages: page_list(rest),
                    },
                )
            }
            MessageType::GPADL_BODY => {
                let (input, rest) = read_body::<GpadlBody>(data)?;
                Self::GpadlBody(input, page_list(rest))
            }
            MessageType::GPADL_TEARDOWN => Self::GpadlTeardown(read_body(data)?.0),
            MessageType::OPEN_CHANNEL => Self::OpenChannel(read_body(data)?.0),
            MessageType::CLOSE_CHANNEL => Self::CloseChannel(read_body(data)?.0),
            MessageType::UNLOAD => Self::Unload,
            ty => return Err(ParseError::UnexpectedType(ty)),
        };
        Ok(message)
    }
}

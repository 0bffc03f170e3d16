// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Wire-level definitions shared by the VMBus host components.

#![expect(missing_docs)]
#![forbid(unsafe_code)]

pub mod protocol;

use protocol::HEADER_SIZE;
use protocol::MAX_MESSAGE_SIZE;
use protocol::MessageHeader;
use protocol::VmbusMessage;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// A control message queued for delivery to the guest.
#[derive(Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    len: u8,
    data: [u8; MAX_MESSAGE_SIZE],
}

impl std::fmt::Debug for OutgoingMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutgoingMessage")
            .field("data", &self.data())
            .finish()
    }
}

impl OutgoingMessage {
    /// Builds a message from a fixed body, prefixing the header for the
    /// body's message type.
    pub fn new<T: IntoBytes + Immutable + KnownLayout + VmbusMessage>(message: &T) -> Self {
        Self::with_data(message, &[])
    }

    /// Builds a message from a fixed body followed by variable data. The data
    /// is truncated to fit in a single synic message.
    pub fn with_data<T: IntoBytes + Immutable + KnownLayout + VmbusMessage>(
        message: &T,
        data: &[u8],
    ) -> Self {
        const { assert!(HEADER_SIZE + size_of::<T>() <= MAX_MESSAGE_SIZE) };
        let mut buf = [0; MAX_MESSAGE_SIZE];
        let header = MessageHeader::new(T::MESSAGE_TYPE);
        buf[..HEADER_SIZE].copy_from_slice(header.as_bytes());
        let body = message.as_bytes();
        let body_end = HEADER_SIZE + body.len();
        buf[HEADER_SIZE..body_end].copy_from_slice(body);
        let data_len = data.len().min(MAX_MESSAGE_SIZE - body_end);
        buf[body_end..body_end + data_len].copy_from_slice(&data[..data_len]);
        Self {
            len: (body_end + data_len) as u8,
            data: buf,
        }
    }

    /// Returns the message bytes, including the header.
    pub fn data(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }
}

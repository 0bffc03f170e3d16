// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The host side of VMBus.
//!
//! [`Bus`] owns the control-plane state machine and the attached devices. It
//! is driven from a single control loop: guest messages, delivery
//! completions and guest signals are fed in as [`BusEvent`]s, and replies go
//! out one at a time through the [`MessagePort`].

#![expect(missing_docs)]
#![forbid(unsafe_code)]

pub mod channels;
pub mod device;
pub mod gpadl;

/// The GUID type used for vmbus channel identifiers.
pub type Guid = uuid::Uuid;

use channels::ChannelState;
pub use channels::DeliveryStatus;
pub use channels::IncomingMessageError;
use channels::Notifier;
use channels::OfferError;
use channels::OfferId;
use channels::OfferParams;
pub use channels::PostError;
pub use channels::RestoreError;
pub use channels::SavedState;
use channels::ServerWithNotifier;
use device::ChannelIo;
use device::DeviceId;
use device::DeviceInfo;
use device::VmbusDevice;
use gpadl::GpadlError;
use gpadl::GpadlReservation;
use slab::Slab;
use std::sync::Arc;
use thiserror::Error;
use vmbus_core::OutgoingMessage;
use vmbus_core::protocol::EVENT_CONNECTION_ID;
pub use vmbus_core::protocol::GpadlId;
use vmbus_core::protocol::Version;
use vmbus_ring::PAGE_SIZE;
use vmbus_ring::mem::Access;
use vmbus_ring::mem::GuestMemory;

/// Delivers control messages to the guest's synic message slot.
pub trait MessagePort: Send {
    /// Starts delivering `message` to `target_vp`. The outcome is reported
    /// back later as [`BusEvent::DeliveryComplete`].
    fn post_message(&mut self, target_vp: u32, message: &OutgoingMessage) -> Result<(), PostError>;
}

/// Raises synic interrupts in the guest.
pub trait EventPort: Send + Sync {
    /// Sets event flag `flag` on `target_vp` and raises the VMBus SINT if
    /// the flag was clear.
    fn set_event_flag(&self, target_vp: u32, flag: u32) -> anyhow::Result<()>;

    /// Raises the VMBus SINT on `target_vp`.
    fn assert_sint(&self, target_vp: u32) -> anyhow::Result<()>;
}

/// Input to the bus control loop.
#[derive(Debug)]
pub enum BusEvent {
    /// A control message the guest posted to the message connection.
    Message(Vec<u8>),
    /// The outcome of delivering the last message posted to the guest.
    DeliveryComplete(DeliveryStatus),
    /// The guest signaled a connection ID.
    GuestSignal(u32),
}

#[derive(Debug, Error)]
pub enum AttachError {
    #[error("device exposes no channels")]
    NoChannels,
    #[error("device {0} is already attached")]
    AlreadyAttached(Guid),
    #[error("failed to offer channel")]
    Offer(#[from] OfferError),
}

pub struct BusBuilder {
    mem: GuestMemory,
    message_port: Box<dyn MessagePort>,
    events: Arc<dyn EventPort>,
    max_version: Version,
    incoming_queue_capacity: usize,
}

impl BusBuilder {
    /// Creates a new builder for `Bus` with the default options.
    pub fn new(
        mem: GuestMemory,
        message_port: Box<dyn MessagePort>,
        events: Arc<dyn EventPort>,
    ) -> Self {
        Self {
            mem,
            message_port,
            events,
            max_version: Version::CURRENT,
            incoming_queue_capacity: channels::DEFAULT_INCOMING_QUEUE_CAPACITY,
        }
    }

    /// Sets the newest protocol version the bus accepts.
    pub fn max_version(mut self, max_version: Version) -> Self {
        self.max_version = max_version;
        self
    }

    /// Sets how many guest messages can wait to be processed before further
    /// messages are refused.
    pub fn incoming_queue_capacity(mut self, capacity: usize) -> Self {
        self.incoming_queue_capacity = capacity;
        self
    }

    pub fn build(self) -> Bus {
        Bus {
            server: channels::Server::new(
                self.mem.clone(),
                self.max_version as u32,
                self.incoming_queue_capacity,
            ),
            devices: Slab::new(),
            message_port: self.message_port,
            events: self.events,
            mem: self.mem,
        }
    }
}

struct DeviceEntry {
    device: Box<dyn VmbusDevice>,
    info: DeviceInfo,
    offers: Vec<OfferId>,
}

pub struct Bus {
    server: channels::Server,
    devices: Slab<DeviceEntry>,
    message_port: Box<dyn MessagePort>,
    events: Arc<dyn EventPort>,
    mem: GuestMemory,
}

struct ServerNotifier<'a> {
    message_port: &'a mut dyn MessagePort,
    devices: &'a mut Slab<DeviceEntry>,
}

impl Notifier for ServerNotifier<'_> {
    fn send_message(&mut self, message: &OutgoingMessage, target_vp: u32) -> Result<(), PostError> {
        self.message_port.post_message(target_vp, message)
    }

    fn open_channel(&mut self, device: DeviceId, subchannel_index: u16) -> anyhow::Result<()> {
        let entry = self
            .devices
            .get_mut(device.0)
            .ok_or_else(|| anyhow::anyhow!("device {device:?} is not attached"))?;
        entry.device.open(subchannel_index)
    }

    fn close_channel(&mut self, device: DeviceId, subchannel_index: u16) {
        if let Some(entry) = self.devices.get_mut(device.0) {
            entry.device.close(subchannel_index);
        }
    }

    fn reset(&mut self) {
        for (_, entry) in self.devices.iter_mut() {
            entry.device.reset();
        }
    }
}

impl Bus {
    fn with_notifier<R>(
        &mut self,
        f: impl FnOnce(&mut ServerWithNotifier<'_, ServerNotifier<'_>>) -> R,
    ) -> R {
        let mut notifier = ServerNotifier {
            message_port: &mut *self.message_port,
            devices: &mut self.devices,
        };
        f(&mut self.server.with_notifier(&mut notifier))
    }

    /// The control-plane state, for inspection.
    pub fn server(&self) -> &channels::Server {
        &self.server
    }

    /// Handles one input and then runs the control loop until it is idle.
    pub fn dispatch(&mut self, event: BusEvent) {
        match event {
            BusEvent::Message(data) => {
                if let Err(err) = self.post_message(&data) {
                    tracing::warn!(
                        error = &err as &dyn std::error::Error,
                        "refused guest message"
                    );
                }
            }
            BusEvent::DeliveryComplete(status) => {
                self.with_notifier(|server| server.complete_message(status));
            }
            BusEvent::GuestSignal(connection_id) => self.signal_from_guest(connection_id),
        }
        self.run_until_idle();
    }

    /// Queues a guest control message without processing it.
    pub fn post_message(&mut self, data: &[u8]) -> Result<(), IncomingMessageError> {
        self.server.post_message(data)
    }

    /// Makes one pass of the control loop. Returns false once no progress is
    /// possible until the next event.
    pub fn run(&mut self) -> bool {
        self.with_notifier(|server| server.run())
    }

    pub fn run_until_idle(&mut self) {
        while self.run() {}
    }

    /// Resets the bus: all channels are closed and every device's reset
    /// hook is run. Offers are kept.
    pub fn reset(&mut self) {
        self.with_notifier(|server| server.reset());
    }

    /// Attaches a device and offers its channels.
    pub fn attach_device(&mut self, device: Box<dyn VmbusDevice>) -> Result<DeviceId, AttachError> {
        let info = device.info();
        if info.channel_count == 0 {
            return Err(AttachError::NoChannels);
        }
        if self.devices.iter().any(|(_, entry)| {
            entry.info.interface_id == info.interface_id
                && entry.info.instance_id == info.instance_id
        }) {
            return Err(AttachError::AlreadyAttached(info.instance_id));
        }

        let entry = self.devices.vacant_entry();
        let id = DeviceId(entry.key());
        let mut offers = Vec::with_capacity(info.channel_count.into());
        for subchannel_index in 0..info.channel_count {
            let offer = OfferParams {
                interface_id: info.interface_id,
                instance_id: info.instance_id,
                subchannel_index,
                flags: info.flags,
                mmio_megabytes: info.mmio_megabytes,
            };
            match self.server.offer_channel(id, offer) {
                Ok(offer_id) => offers.push(offer_id),
                Err(err) => {
                    for offer_id in offers {
                        self.server.revoke_channel(offer_id);
                    }
                    return Err(err.into());
                }
            }
        }

        tracing::info!(
            interface_id = %info.interface_id,
            instance_id = %info.instance_id,
            channels = info.channel_count,
            "attached vmbus device"
        );
        entry.insert(DeviceEntry {
            device,
            info,
            offers,
        });
        Ok(id)
    }

    /// Closes a device's channels and releases their IDs.
    pub fn detach_device(&mut self, id: DeviceId) -> Option<Box<dyn VmbusDevice>> {
        let offers = self.devices.get(id.0)?.offers.clone();
        self.with_notifier(|server| {
            for &offer_id in &offers {
                server.close_channel(offer_id);
            }
        });
        for offer_id in offers {
            self.server.revoke_channel(offer_id);
        }
        let entry = self.devices.remove(id.0);
        tracing::info!(instance_id = %entry.info.instance_id, "detached vmbus device");
        Some(entry.device)
    }

    /// Returns the I/O handle for channel `index` of a device.
    pub fn channel_io(&mut self, device: DeviceId, index: u16) -> Option<ChannelIo<'_>> {
        let offer_id = *self.devices.get(device.0)?.offers.get(usize::from(index))?;
        let interrupt_page = self.server.interrupt_page();
        Some(ChannelIo {
            channel: self.server.channel_mut(offer_id),
            mem: &self.mem,
            events: &*self.events,
            interrupt_page,
        })
    }

    /// Handles a signal the guest sent to `connection_id`.
    pub fn signal_from_guest(&mut self, connection_id: u32) {
        let offer_ids = if connection_id == EVENT_CONNECTION_ID {
            self.scan_interrupt_page()
        } else {
            match self.server.channel_by_connection_id(connection_id) {
                Some(offer_id) => vec![offer_id],
                None => {
                    tracing::debug!(connection_id, "signal for unknown connection");
                    return;
                }
            }
        };
        for offer_id in offer_ids {
            self.notify_channel(offer_id);
        }
    }

    /// Collects and clears the channels flagged in the guest-to-host half of
    /// the legacy interrupt page.
    fn scan_interrupt_page(&self) -> Vec<OfferId> {
        let Some(page) = self.server.interrupt_page() else {
            tracing::debug!("shared event signal without an interrupt page");
            return Vec::new();
        };
        let Some(guest_to_host) = page.checked_add((PAGE_SIZE / 2) as u64) else {
            tracing::warn!(page, "invalid interrupt page");
            return Vec::new();
        };
        let map = match self.mem.map(guest_to_host, PAGE_SIZE / 2, Access::ReadWrite) {
            Ok(map) => map,
            Err(err) => {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    "failed to map interrupt page"
                );
                return Vec::new();
            }
        };
        self.server
            .channels()
            .filter(|(_, channel)| {
                let relid = channel.relid().0;
                let mask = 1 << (relid % 64);
                map.fetch_and_u64((relid / 64) as usize * 8, !mask) & mask != 0
            })
            .filter(|(_, channel)| channel.state() == ChannelState::Open)
            .map(|(offer_id, _)| offer_id)
            .collect()
    }

    fn notify_channel(&mut self, offer_id: OfferId) {
        let interrupt_page = self.server.interrupt_page();
        let channel = self.server.channel_mut(offer_id);
        if channel.state() != ChannelState::Open {
            return;
        }
        let Some(entry) = self.devices.get_mut(channel.device().0) else {
            return;
        };
        let mut io = ChannelIo {
            channel,
            mem: &self.mem,
            events: &*self.events,
            interrupt_page,
        };
        entry.device.notify(&mut io);
    }

    /// Reserves a live GPADL for a device's own use.
    pub fn acquire_gpadl(&mut self, id: GpadlId) -> Result<GpadlReservation, GpadlError> {
        self.server.gpadls_mut().acquire(id)
    }

    pub fn release_gpadl(&mut self, reservation: GpadlReservation) {
        self.server.gpadls_mut().release(reservation);
    }

    pub fn guest_memory(&self) -> &GuestMemory {
        &self.mem
    }

    pub fn save(&self) -> SavedState {
        self.server.save()
    }

    /// Restores saved state into a freshly built bus with the same devices
    /// attached.
    pub fn restore(&mut self, state: SavedState) -> Result<(), RestoreError> {
        let opened = self.with_notifier(|server| server.restore(state))?;
        // The guest may have queued work before the save that no one has
        // seen a signal for.
        let interrupt_page = self.server.interrupt_page();
        for offer_id in opened {
            let channel = self.server.channel(offer_id);
            if let Err(err) = device::signal_channel(
                &self.mem,
                &*self.events,
                interrupt_page,
                channel.relid(),
                channel.target_vp(),
            ) {
                tracing::warn!(
                    relid = channel.relid().0,
                    error = err.as_ref() as &dyn std::error::Error,
                    "failed to signal restored channel"
                );
            }
        }
        Ok(())
    }
}

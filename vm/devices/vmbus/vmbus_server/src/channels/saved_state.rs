// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use super::AssignedIds;
use super::ChannelError;
use super::ChannelState;
use super::ConnectionState;
use super::FIRST_CHANNEL_ID;
use super::FIRST_CONNECTION_ID;
use super::Notifier;
use super::OfferError;
use super::OfferId;
use super::OfferState;
use super::Server;
use super::ServerWithNotifier;
use crate::Guid;
use crate::gpadl::GpadlError;
use crate::gpadl::SavedGpadl;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use vmbus_core::protocol::ChannelId;
use vmbus_core::protocol::GpadlId;

#[derive(Debug, Error)]
pub enum RestoreError {
    #[error("the bus has open channels or GPADLs")]
    NotReset,
    #[error("no offer for saved channel {0} index {1}")]
    MissingChannel(Guid, u16),
    #[error("saved channel {0} index {1} appears more than once")]
    DuplicateChannel(Guid, u16),
    #[error("channel ID conflict")]
    Offer(#[from] OfferError),
    #[error("invalid saved gpadl")]
    Gpadl(#[from] GpadlError),
    #[error("failed to reopen channel {0}")]
    OpenFailed(u32, #[source] ChannelError),
}

/// The bus state that survives a save and restore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedState {
    pub state: SavedConnectionState,
    pub version: u32,
    pub target_vp: u32,
    pub interrupt_page: Option<u64>,
    /// Guest messages that had not been processed yet.
    pub incoming: Vec<Vec<u8>>,
    pub gpadls: Vec<SavedGpadl>,
    pub channels: Vec<SavedChannel>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SavedConnectionState {
    Listen,
    Handshake,
    Offer,
    CreateGpadl,
    TeardownGpadl,
    OpenChannel,
    Unload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedChannel {
    pub instance_id: Guid,
    pub subchannel_index: u16,
    pub relid: u32,
    pub connection_id: u32,
    pub offer_state: SavedOfferState,
    pub state: SavedChannelState,
    pub target_vp: u32,
    pub open_id: u32,
    pub ring_gpadl_id: u32,
    pub receive_offset: u32,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SavedOfferState {
    Init,
    Sending,
    Sent,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SavedChannelState {
    Init,
    Opening,
    Open,
}

impl From<ConnectionState> for SavedConnectionState {
    fn from(state: ConnectionState) -> Self {
        match state {
            ConnectionState::Listen => Self::Listen,
            ConnectionState::Handshake => Self::Handshake,
            ConnectionState::Offer => Self::Offer,
            ConnectionState::CreateGpadl => Self::CreateGpadl,
            ConnectionState::TeardownGpadl => Self::TeardownGpadl,
            ConnectionState::OpenChannel => Self::OpenChannel,
            ConnectionState::Unload => Self::Unload,
        }
    }
}

impl From<SavedConnectionState> for ConnectionState {
    fn from(state: SavedConnectionState) -> Self {
        match state {
            SavedConnectionState::Listen => Self::Listen,
            SavedConnectionState::Handshake => Self::Handshake,
            SavedConnectionState::Offer => Self::Offer,
            SavedConnectionState::CreateGpadl => Self::CreateGpadl,
            SavedConnectionState::TeardownGpadl => Self::TeardownGpadl,
            SavedConnectionState::OpenChannel => Self::OpenChannel,
            SavedConnectionState::Unload => Self::Unload,
        }
    }
}

impl From<OfferState> for SavedOfferState {
    fn from(state: OfferState) -> Self {
        match state {
            OfferState::Init => Self::Init,
            OfferState::Sending => Self::Sending,
            OfferState::Sent => Self::Sent,
        }
    }
}

impl From<SavedOfferState> for OfferState {
    fn from(state: SavedOfferState) -> Self {
        match state {
            SavedOfferState::Init => Self::Init,
            SavedOfferState::Sending => Self::Sending,
            SavedOfferState::Sent => Self::Sent,
        }
    }
}

impl From<ChannelState> for SavedChannelState {
    fn from(state: ChannelState) -> Self {
        match state {
            ChannelState::Init => Self::Init,
            ChannelState::Opening => Self::Opening,
            ChannelState::Open => Self::Open,
        }
    }
}

impl From<SavedChannelState> for ChannelState {
    fn from(state: SavedChannelState) -> Self {
        match state {
            SavedChannelState::Init => Self::Init,
            SavedChannelState::Opening => Self::Opening,
            SavedChannelState::Open => Self::Open,
        }
    }
}

impl Server {
    pub fn save(&self) -> SavedState {
        SavedState {
            state: self.state.into(),
            version: self.version,
            target_vp: self.target_vp,
            interrupt_page: self.interrupt_page,
            incoming: self.incoming.iter().cloned().collect(),
            gpadls: self.gpadls.save(),
            channels: self
                .channels
                .iter()
                .map(|(_, channel)| SavedChannel {
                    instance_id: channel.offer.instance_id,
                    subchannel_index: channel.offer.subchannel_index,
                    relid: channel.relid.0,
                    connection_id: channel.connection_id,
                    offer_state: channel.offer_state.into(),
                    state: channel.state.into(),
                    target_vp: channel.target_vp,
                    open_id: channel.open_id,
                    ring_gpadl_id: channel.ring_gpadl_id.0,
                    receive_offset: channel.receive_offset,
                })
                .collect(),
        }
    }

    /// Works out the ID tables that restoring `saved` would produce. Saved
    /// channels get their IDs back and offers without saved state get fresh
    /// ones. Nothing is changed until [`apply_assignments`] is called.
    ///
    /// [`apply_assignments`]: Self::apply_assignments
    fn plan_assignments(&self, saved: &[SavedChannel]) -> Result<RestoredIds, RestoreError> {
        let mut matched: Vec<OfferId> = Vec::with_capacity(saved.len());
        for channel in saved {
            let offer_id = self
                .channels()
                .find(|(_, c)| {
                    c.offer.instance_id == channel.instance_id
                        && c.offer.subchannel_index == channel.subchannel_index
                })
                .map(|(id, _)| id)
                .ok_or(RestoreError::MissingChannel(
                    channel.instance_id,
                    channel.subchannel_index,
                ))?;
            if matched.contains(&offer_id) {
                return Err(RestoreError::DuplicateChannel(
                    channel.instance_id,
                    channel.subchannel_index,
                ));
            }
            matched.push(offer_id);
        }

        let mut channels = AssignedIds::new(FIRST_CHANNEL_ID);
        let mut connections = AssignedIds::new(FIRST_CONNECTION_ID);
        for (&offer_id, channel) in matched.iter().zip(saved) {
            channels.claim(channel.relid, offer_id)?;
            connections.claim(channel.connection_id, offer_id)?;
        }

        let mut fresh = Vec::new();
        for (offer_id, _) in self.channels() {
            if matched.contains(&offer_id) {
                continue;
            }
            let relid = channels
                .allocate(offer_id)
                .ok_or(OfferError::TooManyChannels)?;
            let connection_id = connections
                .allocate(offer_id)
                .ok_or(OfferError::TooManyChannels)?;
            fresh.push((offer_id, relid, connection_id));
        }
        Ok(RestoredIds {
            matched,
            channels,
            connections,
            fresh,
        })
    }

    /// Installs planned ID tables and the saved channel state. Returns the
    /// offers that had saved state.
    fn apply_assignments(&mut self, ids: RestoredIds, saved: &[SavedChannel]) -> Vec<OfferId> {
        self.assigned_channels = ids.channels;
        self.assigned_connections = ids.connections;
        for (&offer_id, channel) in ids.matched.iter().zip(saved) {
            let c = &mut self.channels[offer_id.0];
            c.relid = ChannelId(channel.relid);
            c.connection_id = channel.connection_id;
            c.offer_state = channel.offer_state.into();
            c.state = channel.state.into();
            c.target_vp = channel.target_vp;
            c.open_id = channel.open_id;
            c.ring_gpadl_id = GpadlId(channel.ring_gpadl_id);
            c.receive_offset = channel.receive_offset;
        }
        for (offer_id, relid, connection_id) in ids.fresh {
            let c = &mut self.channels[offer_id.0];
            c.relid = ChannelId(relid);
            c.connection_id = connection_id;
            c.offer_state = OfferState::Init;
            c.state = ChannelState::Init;
        }
        ids.matched
    }
}

struct RestoredIds {
    matched: Vec<OfferId>,
    channels: AssignedIds,
    connections: AssignedIds,
    fresh: Vec<(OfferId, u32, u32)>,
}

impl<T: Notifier> ServerWithNotifier<'_, T> {
    /// Restores saved bus state into a freshly reset bus whose devices have
    /// already been attached.
    ///
    /// Channels that were open have their rings rebound and their device
    /// open hook run; their offer IDs are returned. A channel whose open was
    /// still being reported is retried, and reports failure to the guest if
    /// its rings can no longer be bound.
    pub fn restore(&mut self, saved: SavedState) -> Result<Vec<OfferId>, RestoreError> {
        let inner = &mut *self.inner;
        if inner.channels.iter().any(|(_, c)| c.rings.is_some()) || !inner.gpadls.is_empty() {
            return Err(RestoreError::NotReset);
        }

        let ids = inner.plan_assignments(&saved.channels)?;
        inner.gpadls.restore(saved.gpadls)?;
        let matched = inner.apply_assignments(ids, &saved.channels);
        inner.state = saved.state.into();
        inner.version = saved.version;
        inner.target_vp = saved.target_vp;
        inner.interrupt_page = saved.interrupt_page;
        inner.message_in_flight = false;
        inner.incoming = saved
            .incoming
            .into_iter()
            .take(inner.incoming_capacity)
            .collect();

        let mut opened = Vec::new();
        for offer_id in matched {
            let state = self.inner.channels[offer_id.0].state;
            if state == ChannelState::Init {
                continue;
            }
            match self.open_channel(offer_id) {
                Ok(()) => {
                    if state == ChannelState::Open {
                        opened.push(offer_id);
                    }
                }
                Err(err) => {
                    let relid = self.inner.channels[offer_id.0].relid.0;
                    if state == ChannelState::Open {
                        // Undo the partial restore.
                        self.reset();
                        return Err(RestoreError::OpenFailed(relid, err));
                    }
                    tracing::warn!(
                        relid,
                        error = &err as &dyn std::error::Error,
                        "failed to reopen channel; open will be reported as failed"
                    );
                }
            }
        }
        tracing::info!(
            state = %self.inner.state,
            open_channels = opened.len(),
            "restored vmbus state"
        );
        Ok(opened)
    }
}

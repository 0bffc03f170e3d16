// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use super::*;
use std::sync::Arc;
use vmbus_core::protocol::GpaRange;
use vmbus_core::protocol::STATUS_SUCCESS;
use vmbus_core::protocol::STATUS_UNSUCCESSFUL;
use vmbus_core::protocol::VmbusMessage;
use vmbus_ring::PAGE_SIZE;
use vmbus_ring::mem::FlatGuestMemory;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

const RING_PAGES: [u64; 8] = [0x10, 0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17];
const RECEIVE_OFFSET: u32 = 4;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::TRACE)
        .try_init();
}

#[derive(Default)]
struct TestNotifier {
    messages: VecDeque<(OutgoingMessage, u32)>,
    busy: bool,
    fatal: bool,
    fail_open: bool,
    opened: Vec<(DeviceId, u16)>,
    closed: Vec<(DeviceId, u16)>,
    resets: usize,
}

impl Notifier for TestNotifier {
    fn send_message(&mut self, message: &OutgoingMessage, target_vp: u32) -> Result<(), PostError> {
        if self.busy {
            return Err(PostError::Busy);
        }
        if std::mem::take(&mut self.fatal) {
            return Err(PostError::Fatal(anyhow::anyhow!("synic is gone")));
        }
        self.messages.push_back((message.clone(), target_vp));
        Ok(())
    }

    fn open_channel(&mut self, device: DeviceId, subchannel_index: u16) -> anyhow::Result<()> {
        if self.fail_open {
            anyhow::bail!("device refused open");
        }
        self.opened.push((device, subchannel_index));
        Ok(())
    }

    fn close_channel(&mut self, device: DeviceId, subchannel_index: u16) {
        self.closed.push((device, subchannel_index));
    }

    fn reset(&mut self) {
        self.resets += 1;
    }
}

fn raw<T: IntoBytes + Immutable + VmbusMessage>(body: &T, extra: &[u8]) -> Vec<u8> {
    let mut data = MessageHeader::new(T::MESSAGE_TYPE).as_bytes().to_vec();
    data.extend_from_slice(body.as_bytes());
    data.extend_from_slice(extra);
    data
}

fn parse<T: FromBytes + KnownLayout + Immutable + VmbusMessage>(message: &OutgoingMessage) -> T {
    let (header, body) = MessageHeader::read_from_prefix(message.data()).unwrap();
    assert_eq!(header.message_type(), T::MESSAGE_TYPE);
    T::read_from_prefix(body).unwrap().0
}

fn offer_params(instance: u128, subchannel_index: u16) -> OfferParams {
    OfferParams {
        interface_id: Guid::from_u128(0xf8615163_df3e_46c5_913f_f2d2f965ed0e),
        instance_id: Guid::from_u128(instance),
        subchannel_index,
        flags: OfferFlags::new(),
        mmio_megabytes: 0,
    }
}

struct TestEnv {
    server: Server,
    notifier: TestNotifier,
    flat: Arc<FlatGuestMemory>,
}

impl TestEnv {
    fn new() -> Self {
        Self::with_options(FlatGuestMemory::new(64 * PAGE_SIZE), Version::CURRENT, 16)
    }

    fn with_options(flat: Arc<FlatGuestMemory>, max_version: Version, capacity: usize) -> Self {
        init_tracing();
        let mem = GuestMemory::new(flat.clone());
        Self {
            server: Server::new(mem, max_version as u32, capacity),
            notifier: TestNotifier::default(),
            flat,
        }
    }

    fn c(&mut self) -> ServerWithNotifier<'_, TestNotifier> {
        self.server.with_notifier(&mut self.notifier)
    }

    fn post<T: IntoBytes + Immutable + VmbusMessage>(&mut self, body: &T) {
        self.post_with(body, &[]);
    }

    fn post_with<T: IntoBytes + Immutable + VmbusMessage>(&mut self, body: &T, extra: &[u8]) {
        self.server.post_message(&raw(body, extra)).unwrap();
    }

    fn run(&mut self) {
        while self.c().run() {}
    }

    /// Runs the bus, takes the one message it posted and reports it
    /// delivered.
    fn expect<T: FromBytes + KnownLayout + Immutable + VmbusMessage>(&mut self) -> T {
        self.run();
        let (message, _) = self.notifier.messages.pop_front().expect("no message posted");
        assert!(self.notifier.messages.is_empty());
        self.c().complete_message(DeliveryStatus::Delivered);
        parse(&message)
    }

    fn expect_none(&mut self) {
        self.run();
        assert!(self.notifier.messages.is_empty());
        assert!(!self.server.message_in_flight());
    }

    fn initiate_contact(&mut self, version: u32, interrupt_page: u64) -> protocol::VersionResponse {
        self.post(&protocol::InitiateContact {
            version_requested: version,
            target_message_vp: 1,
            interrupt_page,
            parent_to_child_monitor_page_gpa: 0,
            child_to_parent_monitor_page_gpa: 0,
        });
        self.expect()
    }

    fn connect(&mut self) {
        let response = self.initiate_contact(Version::Win10 as u32, 0);
        assert_eq!(response.version_supported, 1);
        assert!(self.server.is_connected());
    }

    fn offer(&mut self, instance: u128, subchannel_index: u16) -> OfferId {
        self.server
            .offer_channel(DeviceId(0), offer_params(instance, subchannel_index))
            .unwrap()
    }

    fn request_offers(&mut self) -> Vec<protocol::OfferChannel> {
        self.post(&protocol::RequestOffers {});
        let mut offers = Vec::new();
        loop {
            self.run();
            let (message, _) = self.notifier.messages.pop_front().expect("no message posted");
            self.c().complete_message(DeliveryStatus::Delivered);
            let (header, _) = MessageHeader::read_from_prefix(message.data()).unwrap();
            if header.message_type() == protocol::MessageType::ALL_OFFERS_DELIVERED {
                break;
            }
            offers.push(parse(&message));
        }
        assert_eq!(self.server.state(), ConnectionState::Listen);
        offers
    }

    fn post_gpadl_header(&mut self, id: u32, relid: u32, total_pages: usize, pages: &[u64]) {
        let mut extra = GpaRange {
            byte_count: (total_pages * PAGE_SIZE) as u32,
            byte_offset: 0,
        }
        .as_bytes()
        .to_vec();
        extra.extend_from_slice(pages.as_bytes());
        self.post_with(
            &protocol::GpadlHeader {
                channel_id: ChannelId(relid),
                gpadl_id: GpadlId(id),
                len: (size_of::<GpaRange>() + pages.len() * 8) as u16,
                count: 1,
            },
            &extra,
        );
    }

    fn post_gpadl_body(&mut self, id: u32, pages: &[u64]) {
        self.post_with(
            &protocol::GpadlBody {
                rsvd: 0,
                gpadl_id: GpadlId(id),
            },
            pages.as_bytes(),
        );
    }

    fn create_ring_gpadl(&mut self, id: u32, relid: u32) {
        self.post_gpadl_header(id, relid, RING_PAGES.len(), &RING_PAGES);
        let created: protocol::GpadlCreated = self.expect();
        assert_eq!(created.gpadl_id, GpadlId(id));
        assert_eq!(created.status, STATUS_SUCCESS);
    }

    fn open(&mut self, relid: u32, gpadl_id: u32, open_id: u32) -> protocol::OpenResult {
        self.post(&protocol::OpenChannel {
            channel_id: ChannelId(relid),
            open_id,
            ring_buffer_gpadl_id: GpadlId(gpadl_id),
            target_vp: 0,
            downstream_ring_buffer_page_offset: RECEIVE_OFFSET,
            user_data: [0; 120],
        });
        let result: protocol::OpenResult = self.expect();
        assert_eq!(result.channel_id, ChannelId(relid));
        assert_eq!(result.open_id, open_id);
        result
    }

    fn close(&mut self, relid: u32) {
        self.post(&protocol::CloseChannel {
            channel_id: ChannelId(relid),
        });
        self.expect_none();
    }
}

#[test]
fn version_negotiation() {
    let mut env = TestEnv::new();
    env.connect();
    assert_eq!(env.server.version(), Version::Win10 as u32);
    assert_eq!(env.server.target_vp(), 1);
    assert_eq!(env.server.state(), ConnectionState::Listen);
    assert_eq!(env.server.interrupt_page(), None);
}

#[test]
fn unsupported_version_is_refused() {
    let mut env = TestEnv::with_options(FlatGuestMemory::new(PAGE_SIZE), Version::Win8, 16);
    env.offer(1, 0);
    let response = env.initiate_contact(Version::Win10 as u32, 0);
    assert_eq!(response.version_supported, 0);
    assert!(!env.server.is_connected());

    // Nothing but another handshake is answered.
    env.post(&protocol::RequestOffers {});
    env.expect_none();

    let response = env.initiate_contact(Version::Win8 as u32, 0);
    assert_eq!(response.version_supported, 1);
}

#[test]
fn legacy_interrupt_page() {
    let mut env = TestEnv::new();
    env.initiate_contact(Version::Win7 as u32, 0x5000);
    assert_eq!(env.server.interrupt_page(), Some(0x5000));

    env.initiate_contact(Version::Win8 as u32, 0x5000);
    assert_eq!(env.server.interrupt_page(), None);
}

#[test]
fn messages_before_contact_are_ignored() {
    let mut env = TestEnv::new();
    let offer = env.offer(1, 0);
    env.post(&protocol::RequestOffers {});
    env.post_gpadl_header(1, 1, 1, &[0x10]);
    env.expect_none();
    assert_eq!(env.server.channel(offer).offer_state(), OfferState::Init);
    assert!(env.server.gpadls().is_empty());
}

#[test]
fn offers_are_sent_in_order() {
    let mut env = TestEnv::new();
    let first = env.offer(1, 0);
    let second = env.offer(1, 1);
    env.connect();

    let offers = env.request_offers();
    assert_eq!(offers.len(), 2);
    assert_eq!(offers[0].channel_id, ChannelId(1));
    assert_eq!(offers[0].connection_id, FIRST_CONNECTION_ID);
    assert_eq!(offers[0].instance_id, Guid::from_u128(1).to_bytes_le());
    assert_eq!(offers[1].channel_id, ChannelId(2));
    assert_eq!(offers[1].subchannel_index, 1);
    assert_eq!(offers[1].is_dedicated, protocol::OFFER_INTERRUPT_DEDICATED);

    assert_eq!(env.server.channel(first).offer_state(), OfferState::Sent);
    assert_eq!(env.server.channel(second).offer_state(), OfferState::Sent);

    // Offers already sent are not sent again.
    assert!(env.request_offers().is_empty());
}

#[test]
fn ids_are_reused_lowest_first() {
    let mut env = TestEnv::new();
    let a = env.offer(1, 0);
    let b = env.offer(2, 0);
    env.offer(3, 0);
    env.server.revoke_channel(a);
    env.server.revoke_channel(b);

    let d = env.offer(4, 0);
    assert_eq!(env.server.channel(d).relid(), ChannelId(1));
    assert_eq!(env.server.channel(d).connection_id(), FIRST_CONNECTION_ID);
    assert_eq!(env.server.channel_by_relid(ChannelId(1)), Some(d));
    assert_eq!(env.server.channel_by_relid(ChannelId(2)), None);
}

#[test]
fn id_space_is_bounded() {
    let mut env = TestEnv::new();
    let available = MAX_CHANNELS - FIRST_CONNECTION_ID as usize;
    for i in 0..available {
        env.offer(i as u128, 0);
    }
    let err = env
        .server
        .offer_channel(DeviceId(0), offer_params(u128::MAX, 0))
        .unwrap_err();
    assert_eq!(err, OfferError::TooManyChannels);
    // The channel ID taken before the connection ID ran out was given back.
    assert_eq!(
        env.server.channel_by_relid(ChannelId(available as u32 + 1)),
        None
    );
}

#[test]
fn gpadl_assembled_across_messages() {
    let mut env = TestEnv::new();
    env.offer(1, 0);
    env.connect();

    let pages: Vec<u64> = (0x100..0x114).collect();
    env.post_gpadl_header(5, 1, 20, &pages[..10]);
    env.expect_none();
    env.post_gpadl_body(5, &pages[10..16]);
    env.expect_none();
    env.post_gpadl_body(5, &pages[16..]);

    let created: protocol::GpadlCreated = env.expect();
    assert_eq!(created.channel_id, ChannelId(1));
    assert_eq!(created.gpadl_id, GpadlId(5));
    assert_eq!(created.status, STATUS_SUCCESS);

    let gpadl = env.server.gpadls().get(GpadlId(5)).unwrap();
    assert!(gpadl.is_alive());
    assert_eq!(gpadl.pages(), pages.as_slice());
}

#[test]
fn invalid_gpadls_are_reported_and_forgotten() {
    let mut env = TestEnv::new();
    env.connect();

    // Two ranges are not supported.
    let mut extra = GpaRange {
        byte_count: PAGE_SIZE as u32,
        byte_offset: 0,
    }
    .as_bytes()
    .to_vec();
    extra.extend_from_slice(0x10u64.as_bytes());
    env.post_with(
        &protocol::GpadlHeader {
            channel_id: ChannelId(1),
            gpadl_id: GpadlId(1),
            len: 16,
            count: 2,
        },
        &extra,
    );
    let created: protocol::GpadlCreated = env.expect();
    assert_eq!(created.gpadl_id, GpadlId(1));
    assert_eq!(created.status, STATUS_UNSUCCESSFUL);
    assert!(env.server.gpadls().is_empty());

    // A range must start on a page boundary.
    let mut extra = GpaRange {
        byte_count: PAGE_SIZE as u32,
        byte_offset: 0x80,
    }
    .as_bytes()
    .to_vec();
    extra.extend_from_slice(0x10u64.as_bytes());
    env.post_with(
        &protocol::GpadlHeader {
            channel_id: ChannelId(1),
            gpadl_id: GpadlId(1),
            len: 16,
            count: 1,
        },
        &extra,
    );
    let created: protocol::GpadlCreated = env.expect();
    assert_eq!(created.status, STATUS_UNSUCCESSFUL);
    assert!(env.server.gpadls().is_empty());

    // A body without a header.
    env.post_gpadl_body(2, &[0x10]);
    let created: protocol::GpadlCreated = env.expect();
    assert_eq!(created.channel_id, ChannelId(0));
    assert_eq!(created.gpadl_id, GpadlId(2));
    assert_eq!(created.status, STATUS_UNSUCCESSFUL);
    assert!(env.server.gpadls().is_empty());

    // A duplicate ID fails without disturbing the original.
    env.create_ring_gpadl(3, 1);
    env.post_gpadl_header(3, 1, 1, &[0x20]);
    let created: protocol::GpadlCreated = env.expect();
    assert_eq!(created.status, STATUS_UNSUCCESSFUL);
    assert_eq!(env.server.gpadls().len(), 1);
    assert_eq!(
        env.server.gpadls().get(GpadlId(3)).unwrap().pages(),
        RING_PAGES
    );
}

#[test]
fn gpadl_teardown() {
    let mut env = TestEnv::new();
    env.connect();
    env.create_ring_gpadl(1, 1);

    env.post(&protocol::GpadlTeardown {
        channel_id: ChannelId(1),
        gpadl_id: GpadlId(1),
    });
    let torndown: protocol::GpadlTorndown = env.expect();
    assert_eq!(torndown.gpadl_id, GpadlId(1));
    assert!(env.server.gpadls().is_empty());

    // Tearing down a GPADL that does not exist gets no answer.
    env.post(&protocol::GpadlTeardown {
        channel_id: ChannelId(1),
        gpadl_id: GpadlId(1),
    });
    env.expect_none();
}

#[test]
fn open_and_close_channel() {
    let mut env = TestEnv::new();
    let offer = env.offer(1, 0);
    env.connect();
    env.request_offers();
    env.create_ring_gpadl(1, 1);

    let result = env.open(1, 1, 0x42);
    assert_eq!(result.status, STATUS_SUCCESS);
    let channel = env.server.channel(offer);
    assert_eq!(channel.state(), ChannelState::Open);
    assert!(channel.rings.is_some());
    assert_eq!(env.notifier.opened, [(DeviceId(0), 0)]);
    assert!(env.server.gpadls().get(GpadlId(1)).unwrap().is_in_use());

    // A second open of an open channel is ignored.
    env.post(&protocol::OpenChannel {
        channel_id: ChannelId(1),
        open_id: 0x43,
        ring_buffer_gpadl_id: GpadlId(1),
        target_vp: 0,
        downstream_ring_buffer_page_offset: RECEIVE_OFFSET,
        user_data: [0; 120],
    });
    env.expect_none();

    env.close(1);
    assert_eq!(env.server.channel(offer).state(), ChannelState::Init);
    assert_eq!(env.notifier.closed, [(DeviceId(0), 0)]);
    assert!(!env.server.gpadls().get(GpadlId(1)).unwrap().is_in_use());

    // Closing again does nothing.
    env.close(1);
    assert_eq!(env.notifier.closed.len(), 1);
    assert!(!env.c().close_channel(offer));
}

#[test]
fn teardown_of_reserved_gpadl_is_dropped() {
    let mut env = TestEnv::new();
    env.offer(1, 0);
    env.connect();
    env.create_ring_gpadl(1, 1);
    assert_eq!(env.open(1, 1, 0).status, STATUS_SUCCESS);

    let teardown = protocol::GpadlTeardown {
        channel_id: ChannelId(1),
        gpadl_id: GpadlId(1),
    };
    env.post(&teardown);
    env.expect_none();
    assert!(env.server.gpadls().get(GpadlId(1)).unwrap().is_alive());

    // The guest must send the request again once the channel is closed.
    env.close(1);
    env.expect_none();
    env.post(&teardown);
    let torndown: protocol::GpadlTorndown = env.expect();
    assert_eq!(torndown.gpadl_id, GpadlId(1));
}

#[test]
fn open_with_dead_gpadl_fails() {
    let mut env = TestEnv::new();
    let offer = env.offer(1, 0);
    env.connect();

    // GPADL 9 is still waiting for pages.
    env.post_gpadl_header(9, 1, 8, &RING_PAGES[..2]);
    env.expect_none();

    let result = env.open(1, 9, 7);
    assert_eq!(result.status, STATUS_UNSUCCESSFUL);
    assert_eq!(env.server.channel(offer).state(), ChannelState::Init);
    assert!(env.notifier.opened.is_empty());

    let result = env.open(1, 10, 8);
    assert_eq!(result.status, STATUS_UNSUCCESSFUL);
    assert_eq!(env.server.channel(offer).state(), ChannelState::Init);
}

#[test]
fn open_with_bad_ring_layout_fails() {
    let mut env = TestEnv::new();
    let offer = env.offer(1, 0);
    env.connect();
    env.create_ring_gpadl(1, 1);

    env.post(&protocol::OpenChannel {
        channel_id: ChannelId(1),
        open_id: 1,
        ring_buffer_gpadl_id: GpadlId(1),
        target_vp: 0,
        downstream_ring_buffer_page_offset: 7,
        user_data: [0; 120],
    });
    let result: protocol::OpenResult = env.expect();
    assert_eq!(result.status, STATUS_UNSUCCESSFUL);
    assert_eq!(env.server.channel(offer).state(), ChannelState::Init);
    assert!(!env.server.gpadls().get(GpadlId(1)).unwrap().is_in_use());
}

#[test]
fn device_open_failure_releases_rings() {
    let mut env = TestEnv::new();
    let offer = env.offer(1, 0);
    env.connect();
    env.create_ring_gpadl(1, 1);

    env.notifier.fail_open = true;
    let result = env.open(1, 1, 0);
    assert_eq!(result.status, STATUS_UNSUCCESSFUL);
    let channel = env.server.channel(offer);
    assert_eq!(channel.state(), ChannelState::Init);
    assert!(channel.rings.is_none());
    assert!(!env.server.gpadls().get(GpadlId(1)).unwrap().is_in_use());

    env.notifier.fail_open = false;
    assert_eq!(env.open(1, 1, 1).status, STATUS_SUCCESS);
}

#[test]
fn handshake_during_offers_resets_progress() {
    let mut env = TestEnv::new();
    let first = env.offer(1, 0);
    let second = env.offer(2, 0);
    env.connect();

    // An incomplete GPADL.
    env.post_gpadl_header(3, 1, 4, &[0x10]);
    env.expect_none();
    assert_eq!(env.server.gpadls().len(), 1);

    env.post(&protocol::RequestOffers {});
    let offer: protocol::OfferChannel = env.expect();
    assert_eq!(offer.channel_id, ChannelId(1));
    assert_eq!(env.server.channel(first).offer_state(), OfferState::Sent);

    // The handshake waits until the offers are finished.
    let resets = env.notifier.resets;
    env.post(&protocol::InitiateContact {
        version_requested: Version::Win10 as u32,
        target_message_vp: 0,
        interrupt_page: 0,
        parent_to_child_monitor_page_gpa: 0,
        child_to_parent_monitor_page_gpa: 0,
    });
    let _: protocol::OfferChannel = env.expect();
    let _: protocol::AllOffersDelivered = env.expect();

    let response: protocol::VersionResponse = env.expect();
    assert_eq!(response.version_supported, 1);
    assert_eq!(env.notifier.resets, resets + 1);
    assert!(env.server.gpadls().is_empty());
    assert_eq!(env.server.channel(first).offer_state(), OfferState::Init);
    assert_eq!(env.server.channel(second).offer_state(), OfferState::Init);

    assert_eq!(env.request_offers().len(), 2);
}

#[test]
fn one_message_in_flight() {
    let mut env = TestEnv::new();
    env.offer(1, 0);
    env.post(&protocol::InitiateContact {
        version_requested: Version::Win10 as u32,
        target_message_vp: 2,
        interrupt_page: 0,
        parent_to_child_monitor_page_gpa: 0,
        child_to_parent_monitor_page_gpa: 0,
    });
    env.post(&protocol::RequestOffers {});

    env.run();
    assert_eq!(env.notifier.messages.len(), 1);
    assert_eq!(env.notifier.messages[0].1, 2);
    assert!(env.server.message_in_flight());
    assert_eq!(env.server.incoming_len(), 1);
    assert_eq!(env.server.state(), ConnectionState::Handshake);

    env.notifier.messages.clear();
    env.c().complete_message(DeliveryStatus::Delivered);
    let offer: protocol::OfferChannel = env.expect();
    assert_eq!(offer.channel_id, ChannelId(1));
}

#[test]
fn busy_and_retry() {
    let mut env = TestEnv::new();
    env.notifier.busy = true;
    env.post(&protocol::InitiateContact {
        version_requested: Version::Win10 as u32,
        target_message_vp: 0,
        interrupt_page: 0,
        parent_to_child_monitor_page_gpa: 0,
        child_to_parent_monitor_page_gpa: 0,
    });
    env.expect_none();
    assert_eq!(env.server.state(), ConnectionState::Handshake);

    env.notifier.busy = false;
    env.run();
    let (first, _) = env.notifier.messages.pop_front().unwrap();
    env.c().complete_message(DeliveryStatus::Retry);
    assert!(!env.server.message_in_flight());
    assert_eq!(env.server.state(), ConnectionState::Handshake);

    env.run();
    let (second, _) = env.notifier.messages.pop_front().unwrap();
    assert_eq!(first, second);
    env.c().complete_message(DeliveryStatus::Delivered);
    assert_eq!(env.server.state(), ConnectionState::Listen);
}

#[test]
fn fatal_post_resets() {
    let mut env = TestEnv::new();
    let offer = env.offer(1, 0);
    env.connect();
    env.create_ring_gpadl(1, 1);
    assert_eq!(env.open(1, 1, 0).status, STATUS_SUCCESS);

    let resets = env.notifier.resets;
    env.notifier.fatal = true;
    env.post(&protocol::RequestOffers {});
    env.expect_none();

    assert_eq!(env.notifier.resets, resets + 1);
    assert_eq!(env.notifier.closed, [(DeviceId(0), 0)]);
    assert_eq!(env.server.state(), ConnectionState::Listen);
    assert!(!env.server.is_connected());
    assert!(env.server.gpadls().is_empty());
    assert_eq!(env.server.channel(offer).state(), ChannelState::Init);
    assert_eq!(env.server.channel(offer).offer_state(), OfferState::Init);
}

#[test]
fn failed_delivery_resets() {
    let mut env = TestEnv::new();
    let offer = env.offer(1, 0);
    env.connect();
    env.post(&protocol::RequestOffers {});
    env.run();
    env.notifier.messages.clear();
    env.c().complete_message(DeliveryStatus::Failed);

    assert_eq!(env.server.state(), ConnectionState::Listen);
    assert!(!env.server.message_in_flight());
    assert!(!env.server.is_connected());
    assert_eq!(env.server.channel(offer).offer_state(), OfferState::Init);
}

#[test]
fn unexpected_completion_is_ignored() {
    let mut env = TestEnv::new();
    env.connect();
    env.c().complete_message(DeliveryStatus::Delivered);
    assert_eq!(env.server.state(), ConnectionState::Listen);
    assert!(env.server.is_connected());
}

#[test]
fn unload() {
    let mut env = TestEnv::new();
    let offer = env.offer(1, 0);
    env.connect();
    env.request_offers();
    env.create_ring_gpadl(1, 1);
    assert_eq!(env.open(1, 1, 0).status, STATUS_SUCCESS);

    let resets = env.notifier.resets;
    env.post(&protocol::Unload {});
    // Dropped along with the rest of the queue.
    env.post(&protocol::RequestOffers {});
    let _: protocol::UnloadComplete = env.expect();

    assert_eq!(env.notifier.resets, resets + 1);
    assert_eq!(env.notifier.closed, [(DeviceId(0), 0)]);
    assert_eq!(env.server.incoming_len(), 0);
    assert!(env.server.gpadls().is_empty());
    assert!(!env.server.is_connected());
    assert_eq!(env.server.channel(offer).state(), ChannelState::Init);
    assert_eq!(env.server.channel(offer).offer_state(), OfferState::Init);
    env.expect_none();
}

#[test]
fn incoming_messages_are_checked() {
    let mut env = TestEnv::with_options(FlatGuestMemory::new(PAGE_SIZE), Version::CURRENT, 2);
    assert_eq!(
        env.server.post_message(&[0; 4]),
        Err(IncomingMessageError::TooShort(4))
    );
    assert_eq!(
        env.server.post_message(&[0; MAX_MESSAGE_SIZE + 1]),
        Err(IncomingMessageError::TooLong(MAX_MESSAGE_SIZE + 1))
    );
    let unknown = MessageHeader::new(protocol::MessageType(99)).as_bytes().to_vec();
    assert_eq!(
        env.server.post_message(&unknown),
        Err(IncomingMessageError::UnknownType(protocol::MessageType(99)))
    );

    let request = raw(&protocol::RequestOffers {}, &[]);
    env.server.post_message(&request).unwrap();
    env.server.post_message(&request).unwrap();
    assert_eq!(
        env.server.post_message(&request),
        Err(IncomingMessageError::QueueFull)
    );
}

#[test]
fn truncated_message_is_dropped() {
    let mut env = TestEnv::new();
    let data = raw(
        &protocol::InitiateContact {
            version_requested: Version::Win10 as u32,
            target_message_vp: 0,
            interrupt_page: 0,
            parent_to_child_monitor_page_gpa: 0,
            child_to_parent_monitor_page_gpa: 0,
        },
        &[],
    );
    env.server.post_message(&data[..20]).unwrap();
    env.expect_none();
    assert!(!env.server.is_connected());
}

/// Builds a bus with two channels offered, the first one open.
fn open_env() -> (TestEnv, OfferId, OfferId) {
    let mut env = TestEnv::new();
    let a = env.offer(1, 0);
    let b = env.offer(2, 0);
    env.connect();
    env.request_offers();
    env.create_ring_gpadl(1, 1);
    assert_eq!(env.open(1, 1, 5).status, STATUS_SUCCESS);
    (env, a, b)
}

#[test]
fn save_restore() {
    let (env, _, _) = open_env();
    let saved = env.server.save();
    assert_eq!(saved.gpadls.len(), 1);
    assert_eq!(saved.channels.len(), 2);
    let json = serde_json::to_string(&saved).unwrap();
    let saved: SavedState = serde_json::from_str(&json).unwrap();

    // Offer in the opposite order so the IDs allocated at offer time differ.
    let mut target = TestEnv::with_options(env.flat.clone(), Version::CURRENT, 16);
    let b = target.offer(2, 0);
    let a = target.offer(1, 0);
    assert_eq!(target.server.channel(a).relid(), ChannelId(2));

    let opened = target.c().restore(saved).unwrap();
    assert_eq!(opened, [a]);
    assert!(target.server.is_connected());
    assert_eq!(target.server.target_vp(), 1);

    let channel = target.server.channel(a);
    assert_eq!(channel.relid(), ChannelId(1));
    assert_eq!(channel.connection_id(), FIRST_CONNECTION_ID);
    assert_eq!(channel.state(), ChannelState::Open);
    assert_eq!(channel.offer_state(), OfferState::Sent);
    assert!(channel.rings.is_some());
    assert_eq!(target.server.channel(b).relid(), ChannelId(2));
    assert_eq!(target.notifier.opened, [(DeviceId(0), 0)]);
    assert!(target.server.gpadls().get(GpadlId(1)).unwrap().is_in_use());
    assert_eq!(target.server.channel_by_relid(ChannelId(1)), Some(a));

    target.close(1);
    assert_eq!(target.notifier.closed, [(DeviceId(0), 0)]);
}

#[test]
fn restore_keeps_pending_messages() {
    let (mut env, _, _) = open_env();
    env.post(&protocol::CloseChannel {
        channel_id: ChannelId(1),
    });
    let saved = env.server.save();
    assert_eq!(saved.incoming.len(), 1);

    let mut target = TestEnv::with_options(env.flat.clone(), Version::CURRENT, 16);
    let a = target.offer(1, 0);
    target.offer(2, 0);
    target.c().restore(saved).unwrap();
    assert_eq!(target.server.incoming_len(), 1);
    target.expect_none();
    assert_eq!(target.server.channel(a).state(), ChannelState::Init);
}

#[test]
fn restore_finishes_open_in_progress() {
    let (mut env, _, _) = open_env();
    env.post(&protocol::OpenChannel {
        channel_id: ChannelId(2),
        open_id: 9,
        ring_buffer_gpadl_id: GpadlId(2),
        target_vp: 0,
        downstream_ring_buffer_page_offset: RECEIVE_OFFSET,
        user_data: [0; 120],
    });
    // Saved before the failed open result was delivered.
    env.run();
    assert_eq!(env.server.state(), ConnectionState::OpenChannel);
    let saved = env.server.save();

    let mut target = TestEnv::with_options(env.flat.clone(), Version::CURRENT, 16);
    target.offer(1, 0);
    let b = target.offer(2, 0);
    target.c().restore(saved).unwrap();
    assert_eq!(target.server.channel(b).state(), ChannelState::Opening);

    let result: protocol::OpenResult = target.expect();
    assert_eq!(result.open_id, 9);
    assert_eq!(result.status, STATUS_UNSUCCESSFUL);
    assert_eq!(target.server.channel(b).state(), ChannelState::Init);
}

#[test]
fn restore_errors() {
    let (mut env, _, _) = open_env();
    let saved = env.server.save();

    // The bus has live state.
    assert!(matches!(
        env.c().restore(saved.clone()),
        Err(RestoreError::NotReset)
    ));

    // A saved channel nobody offered.
    let mut target = TestEnv::with_options(env.flat.clone(), Version::CURRENT, 16);
    target.offer(1, 0);
    assert!(matches!(
        target.c().restore(saved.clone()),
        Err(RestoreError::MissingChannel(_, 0))
    ));

    // The open hook fails for a channel that was open.
    let mut target = TestEnv::with_options(env.flat.clone(), Version::CURRENT, 16);
    let a = target.offer(1, 0);
    target.offer(2, 0);
    target.notifier.fail_open = true;
    assert!(matches!(
        target.c().restore(saved),
        Err(RestoreError::OpenFailed(1, _))
    ));
    assert_eq!(target.server.channel(a).state(), ChannelState::Init);
    // Nothing of the saved state is left behind.
    assert!(!target.server.is_connected());
    assert!(target.server.gpadls().is_empty());
    assert_eq!(target.server.state(), ConnectionState::Listen);
    assert_eq!(target.notifier.resets, 1);
    assert_eq!(target.server.channel_by_relid(ChannelId(1)), Some(a));
    target.server.revoke_channel(a);
    assert_eq!(target.server.channel_by_relid(ChannelId(1)), None);
}

#[test]
fn invalid_saved_ids_change_nothing() {
    let (env, _, _) = open_env();
    let saved = env.server.save();

    let mut target = TestEnv::with_options(env.flat.clone(), Version::CURRENT, 16);
    let b = target.offer(2, 0);
    let a = target.offer(1, 0);

    let mut bad = saved.clone();
    bad.channels[0].relid = 0;
    assert!(matches!(
        target.c().restore(bad),
        Err(RestoreError::Offer(OfferError::InvalidId(0)))
    ));

    let mut bad = saved.clone();
    bad.channels[1].connection_id = bad.channels[0].connection_id;
    assert!(matches!(
        target.c().restore(bad),
        Err(RestoreError::Offer(OfferError::IdInUse(_)))
    ));

    let mut bad = saved;
    bad.gpadls[0].pages.clear();
    assert!(matches!(
        target.c().restore(bad),
        Err(RestoreError::Gpadl(GpadlError::Incomplete(_)))
    ));

    // The IDs handed out at offer time are still in place.
    assert_eq!(target.server.channel(b).relid(), ChannelId(1));
    assert_eq!(target.server.channel(a).relid(), ChannelId(2));
    assert_eq!(target.server.channel_by_relid(ChannelId(2)), Some(a));
    assert!(target.server.gpadls().is_empty());
    assert!(!target.server.is_connected());
    target.server.revoke_channel(a);
    target.server.revoke_channel(b);
    assert_eq!(target.server.channels().count(), 0);
}

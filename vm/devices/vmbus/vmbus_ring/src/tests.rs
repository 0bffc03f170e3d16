// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use super::*;
use crate::mem::FlatGuestMemory;

struct TestRing {
    flat: Arc<FlatGuestMemory>,
    mem: GuestMemory,
    pages: Arc<[u64]>,
}

impl TestRing {
    fn new(page_count: usize) -> Self {
        let flat = FlatGuestMemory::new((page_count + 1) * PAGE_SIZE);
        let mem = GuestMemory::new(flat.clone());
        // Lay the ring out backwards so that logically adjacent pages are not
        // physically adjacent.
        let pages: Arc<[u64]> = (1..=page_count as u64).rev().collect();
        Self { flat, mem, pages }
    }

    fn control_gpa(&self) -> u64 {
        self.pages[0] * PAGE_SIZE as u64
    }

    fn set_control(&self, offset: usize, value: u32) {
        self.mem
            .write_at(self.control_gpa() + offset as u64, &value.to_le_bytes())
            .unwrap();
    }

    fn control(&self, offset: usize) -> u32 {
        let mut value = [0; 4];
        self.mem
            .read_at(self.control_gpa() + offset as u64, &mut value)
            .unwrap();
        u32::from_le_bytes(value)
    }

    fn data_len(&self) -> u32 {
        ((self.pages.len() - 1) * PAGE_SIZE) as u32
    }

    fn ring(&self, role: Role) -> RingBuffer {
        RingBuffer::new(&self.mem, self.pages.clone(), 0, self.pages.len(), role).unwrap()
    }
}

fn send(
    ring: &mut RingBuffer,
    mem: &GuestMemory,
    desc: &[u8],
    payload: &[u8],
    transaction_id: u64,
) -> Result<bool, RingError> {
    let mut iter = ring.iter(mem)?;
    iter.write_packet(&OutgoingPacket {
        packet_type: PacketType::DATA_INBAND,
        transaction_id,
        completion_requested: false,
        desc,
        payload,
    })?;
    Ok(iter.commit())
}

fn recv(
    ring: &mut RingBuffer,
    mem: &GuestMemory,
) -> Result<Option<(IncomingPacket, bool)>, RingError> {
    let mut iter = ring.iter(mem)?;
    let Some(packet) = iter.read_packet()? else {
        return Ok(None);
    };
    Ok(Some((packet, iter.commit())))
}

#[test]
fn distance_identity() {
    for len in [8, 4096, 15 * 4096] {
        let indices = [0, 1, len / 2, len - 2, len - 1];
        for &w in &indices {
            for &r in &indices {
                let free = distance(w, r, len, true);
                let used = distance(r, w, len, false);
                assert!(free < len && used < len);
                assert_eq!(free + used, len - 1, "w={w} r={r} len={len}");
            }
        }
    }
}

#[test]
fn first_packet_into_empty_ring_signals_once() {
    let env = TestRing::new(16);
    let mut producer = env.ring(Role::Producer);
    assert_eq!(producer.data_len(), 15 * 4096);

    assert!(send(&mut producer, &env.mem, &[], &[0x5a; 64], 1).unwrap());
    assert_eq!(env.control(WRITE_INDEX), 88);
    assert_eq!(producer.my_index(), 88);

    // The consumer has not caught up, so it does not need another signal.
    assert!(!send(&mut producer, &env.mem, &[], &[0x5a; 64], 2).unwrap());
    assert_eq!(env.flat.live_mappings(), 0);
}

#[test]
fn round_trip_across_wrap() {
    let env = TestRing::new(4);
    let len = env.data_len();
    env.set_control(WRITE_INDEX, len - 40);
    env.set_control(READ_INDEX, len - 40);
    let mut producer = env.ring(Role::Producer);
    let mut consumer = env.ring(Role::Consumer);

    let desc: Vec<u8> = (0..24).collect();
    let payload: Vec<u8> = (100..196).collect();
    env.flat.take_peak_mappings();
    assert!(send(&mut producer, &env.mem, &desc, &payload, 0x1234).unwrap());
    assert!(env.flat.take_peak_mappings() <= 2);

    let (packet, _) = recv(&mut consumer, &env.mem).unwrap().unwrap();
    assert_eq!(packet.packet_type, PacketType::DATA_INBAND);
    assert_eq!(packet.transaction_id, 0x1234);
    assert_eq!(packet.desc, desc);
    assert_eq!(packet.payload, payload);
    assert_eq!(consumer.my_index(), 104);
    assert_eq!(consumer.my_index(), producer.my_index());
    assert!(recv(&mut consumer, &env.mem).unwrap().is_none());

    // Unaligned segments come back padded.
    send(&mut producer, &env.mem, &[1, 2, 3, 4, 5], &[9; 3], 7).unwrap();
    let (packet, _) = recv(&mut consumer, &env.mem).unwrap().unwrap();
    assert_eq!(packet.desc, [1, 2, 3, 4, 5, 0, 0, 0]);
    assert_eq!(&packet.payload[..3], &[9; 3]);
    assert_eq!(packet.payload.len(), 8);
    assert_eq!(env.flat.live_mappings(), 0);
}

#[test]
fn backpressure_and_wakeup() {
    let env = TestRing::new(4);
    let mut producer = env.ring(Role::Producer);
    let mut consumer = env.ring(Role::Consumer);
    let payload = [0xaa; 1000];
    let framed = framed_len(0, payload.len()) as u32;
    assert_eq!(framed, 1024);

    let mut sent = 0;
    loop {
        match producer.request_room(&env.mem, framed) {
            Ok(()) => {
                send(&mut producer, &env.mem, &[], &payload, sent).unwrap();
                sent += 1;
            }
            Err(RingError::Full { needed }) => {
                assert_eq!(needed, framed);
                break;
            }
            Err(err) => panic!("{err}"),
        }
    }
    assert_eq!(sent, 11);
    assert_eq!(producer.pending_send_size(), framed);
    assert_eq!(env.control(PENDING_SEND_SIZE), framed);

    // Freeing one packet's worth of space unblocks the producer.
    let (packet, signal) = recv(&mut consumer, &env.mem).unwrap().unwrap();
    assert_eq!(packet.transaction_id, 0);
    assert!(signal);

    producer.request_room(&env.mem, framed).unwrap();
    assert_eq!(producer.pending_send_size(), 0);
    assert_eq!(env.control(PENDING_SEND_SIZE), 0);

    // With no outstanding request, further reads do not signal.
    let (_, signal) = recv(&mut consumer, &env.mem).unwrap().unwrap();
    assert!(!signal);
}

#[test]
fn interrupt_mask_suppresses_signal() {
    let env = TestRing::new(4);
    env.set_control(INTERRUPT_MASK, 1);
    let mut producer = env.ring(Role::Producer);
    assert!(!send(&mut producer, &env.mem, &[], &[1; 16], 0).unwrap());
    assert_eq!(env.control(WRITE_INDEX), 40);
}

#[test]
fn consumer_signals_without_pending_feature() {
    let env = TestRing::new(4);
    let mut producer = env.ring(Role::Producer);
    let mut consumer = env.ring(Role::Consumer);
    send(&mut producer, &env.mem, &[], &[1; 16], 0).unwrap();
    send(&mut producer, &env.mem, &[], &[2; 16], 1).unwrap();

    env.set_control(FEATURE_BITS, 0);
    let (_, signal) = recv(&mut consumer, &env.mem).unwrap().unwrap();
    assert!(signal);

    env.set_control(FEATURE_BITS, FeatureBits::new().with_pending_send_size(true).into());
    let (_, signal) = recv(&mut consumer, &env.mem).unwrap().unwrap();
    assert!(!signal);
}

#[test]
fn malformed_packet_is_not_consumed() {
    let env = TestRing::new(4);
    let mut producer = env.ring(Role::Producer);
    let mut consumer = env.ring(Role::Consumer);
    send(&mut producer, &env.mem, &[], &[1; 16], 0).unwrap();

    let header_gpa = env.pages[1] * PAGE_SIZE as u64;
    let len8_gpa = header_gpa + offset_of!(PacketHeader, len8) as u64;
    env.mem.write_at(len8_gpa, &100u16.to_le_bytes()).unwrap();
    assert!(matches!(
        recv(&mut consumer, &env.mem),
        Err(RingError::Malformed(_))
    ));
    assert_eq!(consumer.my_index(), 0);
    assert_eq!(env.control(READ_INDEX), 0);

    env.mem.write_at(len8_gpa, &4u16.to_le_bytes()).unwrap();
    let offset8_gpa = header_gpa + offset_of!(PacketHeader, data_offset8) as u64;
    env.mem.write_at(offset8_gpa, &1u16.to_le_bytes()).unwrap();
    assert!(matches!(
        recv(&mut consumer, &env.mem),
        Err(RingError::Malformed(_))
    ));

    env.mem.write_at(offset8_gpa, &2u16.to_le_bytes()).unwrap();
    let (packet, _) = recv(&mut consumer, &env.mem).unwrap().unwrap();
    assert_eq!(packet.payload, [1; 16]);
    assert_eq!(env.flat.live_mappings(), 0);
}

#[test]
fn memory_failure_publishes_nothing() {
    let env = TestRing::new(4);
    let mut producer = env.ring(Role::Producer);
    env.flat.set_unmappable(env.pages[2], true);

    let payload = vec![3; 6000];
    assert!(matches!(
        send(&mut producer, &env.mem, &[], &payload, 0),
        Err(RingError::Memory(_))
    ));
    assert_eq!(producer.my_index(), 0);
    assert_eq!(env.control(WRITE_INDEX), 0);
    assert_eq!(env.flat.live_mappings(), 0);

    env.flat.set_unmappable(env.pages[2], false);
    assert!(send(&mut producer, &env.mem, &[], &payload, 0).unwrap());
    assert_eq!(producer.my_index(), framed_len(0, 6000) as u32);
}

#[test]
fn attach_validates_layout() {
    let env = TestRing::new(4);
    env.set_control(WRITE_INDEX, env.data_len());
    assert!(matches!(
        RingBuffer::new(&env.mem, env.pages.clone(), 0, 4, Role::Producer),
        Err(RingError::IndexOutOfRange { .. })
    ));
    assert!(matches!(
        RingBuffer::new(&env.mem, env.pages.clone(), 3, 1, Role::Consumer),
        Err(RingError::InvalidSize(1))
    ));
    assert!(matches!(
        RingBuffer::outgoing(&env.mem, env.pages.clone(), 5),
        Err(RingError::InvalidSize(_))
    ));

    // Splitting the pages gives each direction its own control page.
    let incoming = RingBuffer::incoming(&env.mem, env.pages.clone(), 2).unwrap();
    let outgoing = RingBuffer::outgoing(&env.mem, env.pages.clone(), 2).unwrap();
    assert_eq!(incoming.data_len(), 4096);
    assert_eq!(outgoing.data_len(), 4096);
    assert_eq!(outgoing.role(), Role::Producer);
}

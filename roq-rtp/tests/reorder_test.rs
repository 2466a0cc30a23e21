//! Packetize frames, deliver the packets out of order, and rebuild the frames
//! through the jitter buffer and depacketizer.

use bytes::{Bytes, BytesMut};
use roq_rtp::codec::Codec;
use roq_rtp::jitter_buffer::JitterBuffer;
use roq_rtp::packet::Packet;
use roq_rtp::packetizer::{Packetizer, new_packetizer_with_timestamp};
use roq_rtp::sequence::new_fixed_sequencer;
use shared::error::Result;
use shared::marshal::{Marshal, Unmarshal};

fn make_frames(count: usize) -> Vec<Bytes> {
    (0..count)
        .map(|i| Bytes::from(vec![i as u8; 300 + i * 97]))
        .collect()
}

fn packetize(codec: Codec, frames: &[Bytes], first_seq: u16) -> Result<Vec<Packet>> {
    let mut packetizer = new_packetizer_with_timestamp(
        200,
        96,
        0xdead_beef,
        codec.payloader(),
        Box::new(new_fixed_sequencer(first_seq)),
        90000,
        0,
    );

    let mut packets = vec![];
    for frame in frames {
        packets.extend(packetizer.packetize(frame, 3000)?);
    }
    Ok(packets)
}

fn reassemble(codec: Codec, packets: Vec<Packet>) -> Result<Vec<Bytes>> {
    let mut depacketizer = codec.depacketizer();
    let mut jb = JitterBuffer::default();
    for packet in packets {
        // go through the wire format
        let raw = packet.marshal()?.freeze();
        jb.push(Packet::unmarshal(&mut raw.clone())?);
    }
    // every packet is in, no need to wait for the start window
    jb.start();

    let mut frames = vec![];
    let mut frame = BytesMut::new();
    while let Ok(packet) = jb.pop() {
        if depacketizer.is_partition_head(&packet.payload) {
            frame.clear();
        }
        frame.extend_from_slice(&depacketizer.depacketize(&packet.payload)?);
        if depacketizer.is_partition_tail(packet.header.marker, &packet.payload) {
            frames.push(frame.split().freeze());
        }
    }
    Ok(frames)
}

// ============================================================================
// Reordering
// ============================================================================

#[test]
fn test_reordered_vp8_frames_rebuild_byte_for_byte() -> Result<()> {
    let frames = make_frames(12);
    let mut packets = packetize(Codec::Vp8, &frames, 65500)?;

    // swap neighbours, keeping the first packet in place
    for i in (1..packets.len() - 1).step_by(2) {
        packets.swap(i, i + 1);
    }

    assert_eq!(reassemble(Codec::Vp8, packets)?, frames);
    Ok(())
}

#[test]
fn test_duplicated_vp9_frames_rebuild_once() -> Result<()> {
    let frames = make_frames(5);
    let packets = packetize(Codec::Vp9, &frames, 100)?;

    let mut doubled = vec![];
    for packet in packets {
        doubled.push(packet.clone());
        doubled.push(packet);
    }

    assert_eq!(reassemble(Codec::Vp9, doubled)?, frames);
    Ok(())
}

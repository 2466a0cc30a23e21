use bytes::Bytes;
use criterion::{Criterion, criterion_group, criterion_main};
use roq_rtp::codec::vp8::Vp8Payloader;
use roq_rtp::header::Header;
use roq_rtp::packet::Packet;
use roq_rtp::packetizer::{Packetizer, new_packetizer};
use roq_rtp::sequence::new_random_sequencer;
use shared::marshal::{Marshal, MarshalSize, Unmarshal};

fn benchmark_packet(c: &mut Criterion) {
    let pkt = Packet {
        header: Header {
            version: 2,
            marker: true,
            payload_type: 96,
            sequence_number: 27023,
            timestamp: 3653407706,
            ssrc: 476325762,
            ..Default::default()
        },
        payload: Bytes::from(vec![0xFFu8; 1100]),
    };
    let raw = pkt.marshal().unwrap().freeze();
    let buf = &mut raw.clone();
    let p = Packet::unmarshal(buf).unwrap();
    if pkt != p {
        panic!("marshal or unmarshal not correct: \npkt: {pkt:?} \nvs \np: {p:?}");
    }

    let mut buf = vec![0u8; pkt.marshal_size()];
    c.bench_function("Packet marshal_to", |b| {
        b.iter(|| {
            let _ = pkt.marshal_to(&mut buf).unwrap();
        })
    });

    c.bench_function("Packet marshal", |b| {
        b.iter(|| {
            let _ = pkt.marshal().unwrap();
        })
    });

    c.bench_function("Packet unmarshal", |b| {
        b.iter(|| {
            let buf = &mut raw.clone();
            let _ = Packet::unmarshal(buf).unwrap();
        })
    });
}

fn benchmark_packetizer(c: &mut Criterion) {
    let mut packetizer = new_packetizer(
        1200,
        96,
        0x1234_5678,
        Box::<Vp8Payloader>::default(),
        Box::new(new_random_sequencer()),
        90000,
    );
    let frame = Bytes::from(vec![0x42u8; 50_000]);

    c.bench_function("Packetizer packetize 50KB frame", |b| {
        b.iter(|| {
            let _ = packetizer.packetize(&frame, 3000).unwrap();
        })
    });
}

criterion_group!(benches, benchmark_packet, benchmark_packetizer);
criterion_main!(benches);

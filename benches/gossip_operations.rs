use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use gossipcast::allocator::KeyAllocator;
use gossipcast::diffusion::select_targets;
use gossipcast::network::{Heartbeat, Message, Packet, peek_mapkey};
use gossipcast::types::{Infected, Metadata, Node};
use std::num::NonZeroU16;

fn nodes(n: usize) -> Vec<Node> {
    (0..n)
        .map(|i| Node::new(format!("10.{}.{}.{}", i / 65536, (i / 256) % 256, i % 256), 8000))
        .collect()
}

fn forward_packet(infected: usize, payload: usize) -> Packet {
    let mut heartbeat = Heartbeat::update(Node::new("10.0.0.1", 8000), Metadata::new(vec![b'x'; payload]));
    for node in nodes(infected) {
        heartbeat.infected.insert(&node);
    }
    Packet::new(
        "secret",
        Message::Forward {
            heartbeat,
            mapkey: NonZeroU16::new(123),
        },
    )
}

/// Benchmark: Packet encoding by infected-set size
fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("packet_encode");

    for infected in [1usize, 30, 300].iter() {
        let packet = forward_packet(*infected, 256);
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(infected), &packet, |b, packet| {
            b.iter(|| black_box(packet.to_bytes().unwrap()))
        });
    }

    group.finish();
}

/// Benchmark: Packet decoding by infected-set size
fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("packet_decode");

    for infected in [1usize, 30, 300].iter() {
        let bytes = forward_packet(*infected, 256).to_bytes().unwrap();
        group.throughput(Throughput::Bytes(bytes.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(infected), &bytes, |b, bytes| {
            b.iter(|| black_box(Packet::from_bytes(bytes).unwrap()))
        });
    }

    group.finish();
}

/// Benchmark: Target selection over a membership of varying size
fn bench_select_targets(c: &mut Criterion) {
    let mut group = c.benchmark_group("select_targets");
    let local = Node::new("10.0.0.1", 8000);

    for size in [10usize, 100, 1000].iter() {
        let members = nodes(*size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &members, |b, members| {
            b.iter(|| {
                let mut infected = Infected::with_node(&local);
                black_box(select_targets(members, &local, &mut infected, 30))
            })
        });
    }

    group.finish();
}

/// Benchmark: Fixed-offset batch key lookup
fn bench_peek_mapkey(c: &mut Criterion) {
    let bytes = forward_packet(30, 256).to_bytes().unwrap();

    c.bench_function("peek_mapkey", |b| b.iter(|| black_box(peek_mapkey(&bytes))));
}

/// Benchmark: Batch key allocation
fn bench_allocator(c: &mut Criterion) {
    let allocator = KeyAllocator::new();

    c.bench_function("key_allocator_next", |b| b.iter(|| black_box(allocator.next())));
}

criterion_group!(
    benches,
    bench_encode,
    bench_decode,
    bench_select_targets,
    bench_peek_mapkey,
    bench_allocator,
);
criterion_main!(benches);

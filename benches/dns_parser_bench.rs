//! Performance benchmarks for the DNS codec and the relay's lookup tables

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use dnsrelay::dns::buffer::{BytePacketBuffer, PacketBuffer, VectorPacketBuffer};
use dnsrelay::dns::cache::DnsCache;
use dnsrelay::dns::protocol::{DnsPacket, DnsQuestion, QueryType, UDP_RESPONSE_LIMIT};
use dnsrelay::dns::translator::IdTranslator;
use std::net::{Ipv4Addr, SocketAddr};

fn create_response_bytes(answers: u8) -> Vec<u8> {
    let mut request = DnsPacket::new();
    request.header.id = 0x1234;
    request
        .questions
        .push(DnsQuestion::new("www.example.com".to_string(), QueryType::A));

    let addrs: Vec<Ipv4Addr> = (0..answers).map(|i| Ipv4Addr::new(10, 0, 0, i)).collect();
    let mut response = DnsPacket::build_response(&request, &addrs, 300);
    response.to_bytes(UDP_RESPONSE_LIMIT).unwrap()
}

fn create_compressed_name_buffer() -> BytePacketBuffer {
    let mut data = vec![0u8; 12];
    data.extend_from_slice(&[3, b'c', b'o', b'm', 0]);
    data.extend_from_slice(&[7, b'e', b'x', b'a', b'm', b'p', b'l', b'e', 0xC0, 12]);
    data.extend_from_slice(&[3, b'w', b'w', b'w', 0xC0, 17]);

    BytePacketBuffer::from_bytes(&data)
}

fn benchmark_packet_parsing(c: &mut Criterion) {
    let mut group = c.benchmark_group("packet_parsing");

    for answers in [1u8, 4, 8].iter() {
        let bytes = create_response_bytes(*answers);
        group.throughput(Throughput::Bytes(bytes.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(answers), &bytes, |b, bytes| {
            b.iter(|| {
                let packet = DnsPacket::from_bytes(black_box(bytes)).unwrap();
                black_box(packet);
            });
        });
    }

    group.finish();
}

fn benchmark_compressed_name(c: &mut Criterion) {
    let mut group = c.benchmark_group("domain_names");

    group.bench_function("read_compressed_qname", |b| {
        let mut buffer = create_compressed_name_buffer();
        b.iter(|| {
            buffer.pos = 27;
            let mut name = String::new();
            buffer.read_qname(&mut name).unwrap();
            black_box(name);
        });
    });

    group.bench_function("write_qname", |b| {
        b.iter(|| {
            let mut buffer = VectorPacketBuffer::new();
            buffer.write_qname(black_box("www.subdomain.example.com")).unwrap();
            black_box(buffer);
        });
    });

    group.finish();
}

fn benchmark_response_building(c: &mut Criterion) {
    let mut group = c.benchmark_group("response_building");

    let request = DnsPacket::from_bytes(&create_response_bytes(0)).unwrap();
    let addrs = [Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2)];

    group.bench_function("build_and_write", |b| {
        b.iter(|| {
            let mut response = DnsPacket::build_response(black_box(&request), &addrs, 4);
            black_box(response.to_bytes(UDP_RESPONSE_LIMIT).unwrap());
        });
    });

    group.finish();
}

fn benchmark_cache(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache");

    let mut cache = DnsCache::new(1024);
    let names: Vec<String> = (0..1024).map(|i| format!("host{}.example.com", i)).collect();
    for (i, name) in names.iter().enumerate() {
        cache.store(name, &[(Ipv4Addr::from(i as u32), None)], 3600);
    }

    group.bench_function("lookup_hit", |b| {
        let mut i = 0;
        b.iter(|| {
            i = (i + 1) % names.len();
            black_box(cache.lookup(&names[i]));
        });
    });

    group.bench_function("store_with_eviction", |b| {
        let mut i = 0u32;
        b.iter(|| {
            i = i.wrapping_add(1);
            let name = format!("new{}.example.com", i);
            black_box(cache.store(&name, &[(Ipv4Addr::from(i), None)], 3600));
        });
    });

    group.finish();
}

fn benchmark_translator(c: &mut Criterion) {
    let mut group = c.benchmark_group("translator");

    let client = SocketAddr::from(([127, 0, 0, 1], 5353));
    let mut translator = IdTranslator::new();

    group.bench_function("allocate_resolve", |b| {
        b.iter(|| {
            let id = translator.allocate(black_box(0x1234), client).unwrap();
            black_box(translator.resolve(id));
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    benchmark_packet_parsing,
    benchmark_compressed_name,
    benchmark_response_building,
    benchmark_cache,
    benchmark_translator
);
criterion_main!(benches);

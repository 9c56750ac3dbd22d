//
// Copyright 2024-2025 Jeff Bush
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

// Buffer calls are very short, so criterion runs them many times in a row.
// Pooled buffers go back to the pool on drop, so each iteration pairs an
// allocation with a free and the two can't be measured separately.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;
use uninet::buf::{BufferPool, PacketBuffer};
use uninet::format::{FormatterChain, LinkKind};
use uninet::util::{IPv4Addr, Statistics};
use uninet::{Builder, Endpoint, InterfaceId};

fn pool() -> BufferPool {
    BufferPool::new(1514, 16, 64, Arc::new(Statistics::new()))
}

// A baseline of sorts that we can compare other calls to. Takes a buffer
// from the pool then immediately returns it.
pub fn pool_alloc_free(c: &mut Criterion) {
    let pool = pool();
    c.bench_function("pool_alloc_free", |b| b.iter(|| {
        black_box(pool.alloc(42).ok());
    }));
}

pub fn copy_to_slice(c: &mut Criterion) {
    let mut buf = PacketBuffer::new(1514, 0);
    let _ = buf.append_from_slice(&[0x5a; 1514]);

    let mut dst = [0; 1514];
    c.bench_function("copy_to_slice", |b| b.iter(|| {
        black_box(buf.copy_to_slice(&mut dst));
    }));
}

pub fn alloc_header(c: &mut Criterion) {
    c.bench_function("alloc_header", |b| b.iter(|| {
        let mut buf = PacketBuffer::new(512, 512);
        for _ in 0..512 {
            let _ = buf.alloc_header(1);
        }
    }));
}

pub fn trim_head(c: &mut Criterion) {
    let data = [0u8; 4096];
    c.bench_function("trim_head", |b| b.iter(|| {
        let mut buf = PacketBuffer::new(4096, 0);
        let _ = buf.append_from_slice(&data);
        for _ in 0..256 {
            buf.trim_head(16);
        }
    }));
}

pub fn build_packet(c: &mut Criterion) {
    let pool = pool();
    let chain = FormatterChain::for_kind(LinkKind::Ethernet);
    let payload = [0x11u8; 512];
    let dest = Endpoint::udp(IPv4Addr::new(10, 0, 0, 2), 9000);
    c.bench_function("build_packet", |b| b.iter(|| {
        let buffer = match pool.alloc(chain.header_len()) {
            Ok(buffer) => buffer,
            Err(_) => return,
        };

        let mut builder = Builder::with_buffer(chain.clone(), buffer, 1472, InterfaceId(0));
        let _ = builder.set_destination(dest);
        let _ = builder.set_source(IPv4Addr::new(10, 0, 0, 1), 4000);
        let _ = builder.write(&payload);
        black_box(builder.finalize().ok());
    }));
}

pub fn parse_packet(c: &mut Criterion) {
    let chain = FormatterChain::for_kind(LinkKind::Ethernet);
    let buffer = PacketBuffer::new(1514, chain.header_len());
    let mut builder = Builder::with_buffer(chain.clone(), buffer, 1472, InterfaceId(0));
    let _ = builder.set_destination(Endpoint::udp(IPv4Addr::new(10, 0, 0, 2), 9000));
    let _ = builder.write(&[0x22; 512]);
    let packet = match builder.finalize() {
        Ok(packet) => packet,
        Err(err) => panic!("could not build packet: {}", err),
    };

    c.bench_function("parse_packet", |b| b.iter(|| {
        black_box(chain.read_headers(packet.bytes()).ok());
    }));
}

criterion_group!(benches,
    pool_alloc_free,
    copy_to_slice,
    alloc_header,
    trim_head,
    build_packet,
    parse_packet
);

criterion_main!(benches);

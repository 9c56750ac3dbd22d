//
// Copyright 2024 Jeff Bush
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

use crate::error::NetError;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct IPv4Addr {
    addr: [u8; 4],
}

impl IPv4Addr {
    pub const UNSPECIFIED: IPv4Addr = IPv4Addr { addr: [0; 4] };
    pub const BROADCAST: IPv4Addr = IPv4Addr { addr: [0xff; 4] };

    pub const fn new(a: u8, b: u8, c: u8, d: u8) -> Self {
        Self { addr: [a, b, c, d] }
    }

    /// The slice must hold at least four bytes.
    pub fn new_from(addr: &[u8]) -> Self {
        Self {
            addr: [addr[0], addr[1], addr[2], addr[3]],
        }
    }

    pub fn copy_to(&self, buffer: &mut [u8]) {
        buffer[..4].copy_from_slice(&self.addr);
    }

    pub fn octets(&self) -> [u8; 4] {
        self.addr
    }

    pub fn to_u32(&self) -> u32 {
        u32::from_be_bytes(self.addr)
    }

    pub fn from_u32(value: u32) -> Self {
        Self {
            addr: value.to_be_bytes(),
        }
    }

    pub fn is_unspecified(&self) -> bool {
        *self == Self::UNSPECIFIED
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    pub fn is_multicast(&self) -> bool {
        self.addr[0] & 0xf0 == 0xe0
    }

    pub fn mask(&self, netmask: IPv4Addr) -> IPv4Addr {
        Self::from_u32(self.to_u32() & netmask.to_u32())
    }
}

impl fmt::Display for IPv4Addr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.addr[0], self.addr[1], self.addr[2], self.addr[3]
        )
    }
}

impl FromStr for IPv4Addr {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut addr = [0u8; 4];
        let mut count = 0;
        for part in s.split('.') {
            // u8::from_str would also take a leading '+'
            if count == 4
                || part.is_empty()
                || part.len() > 3
                || !part.bytes().all(|b| b.is_ascii_digit())
            {
                return Err(NetError::InvalidConfiguration("malformed IPv4 address"));
            }

            addr[count] = part
                .parse::<u8>()
                .map_err(|_| NetError::InvalidConfiguration("malformed IPv4 address"))?;
            count += 1;
        }

        if count != 4 {
            return Err(NetError::InvalidConfiguration("malformed IPv4 address"));
        }

        Ok(IPv4Addr { addr })
    }
}

const COUNT_HWADDR_BYTES: usize = 6;

/// Ethernet MAC address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct HwAddr {
    bytes: [u8; COUNT_HWADDR_BYTES],
}

impl HwAddr {
    pub const BROADCAST: HwAddr = HwAddr {
        bytes: [0xff; COUNT_HWADDR_BYTES],
    };

    pub const fn new(bytes: [u8; COUNT_HWADDR_BYTES]) -> Self {
        HwAddr { bytes }
    }

    /// The slice must hold at least six bytes.
    pub fn new_from(bytes: &[u8]) -> Self {
        let mut ret = HwAddr::default();
        ret.bytes.copy_from_slice(&bytes[..COUNT_HWADDR_BYTES]);
        ret
    }

    pub fn copy_to(&self, buffer: &mut [u8]) {
        buffer[..COUNT_HWADDR_BYTES].copy_from_slice(&self.bytes);
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Display for HwAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.bytes[0], self.bytes[1], self.bytes[2], self.bytes[3], self.bytes[4], self.bytes[5]
        )
    }
}

// Compute one's complement sum, per RFV 1071
// https://datatracker.ietf.org/doc/html/rfc1071
pub fn compute_ones_comp(in_checksum: u16, slice: &[u8]) -> u16 {
    let mut checksum: u32 = in_checksum as u32;

    let mut i = 0;
    while i + 1 < slice.len() {
        checksum += u16::from_be_bytes([slice[i], slice[i + 1]]) as u32;
        i += 2;
    }

    // Odd trailing byte is padded with zero on the right
    if i < slice.len() {
        checksum += (slice[i] as u32) << 8;
    }

    while checksum > 0xffff {
        checksum = (checksum & 0xffff) + (checksum >> 16);
    }

    checksum as u16
}

pub fn compute_checksum(slice: &[u8]) -> u16 {
    0xffff ^ compute_ones_comp(0, slice)
}

pub fn get_be16(buffer: &[u8]) -> u16 {
    ((buffer[0] as u16) << 8) | buffer[1] as u16
}

pub fn get_be32(buffer: &[u8]) -> u32 {
    ((buffer[0] as u32) << 24)
        | ((buffer[1] as u32) << 16)
        | ((buffer[2] as u32) << 8)
        | buffer[3] as u32
}

pub fn set_be16(buffer: &mut [u8], value: u16) {
    buffer[0] = ((value >> 8) & 0xff) as u8;
    buffer[1] = (value & 0xff) as u8;
}

pub fn set_be32(buffer: &mut [u8], value: u32) {
    buffer[0] = ((value >> 24) & 0xff) as u8;
    buffer[1] = ((value >> 16) & 0xff) as u8;
    buffer[2] = ((value >> 8) & 0xff) as u8;
    buffer[3] = (value & 0xff) as u8;
}

pub struct PerfCounter(AtomicU32);

impl PerfCounter {
    pub const fn new() -> Self {
        PerfCounter(AtomicU32::new(0))
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, value: u32) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Default for PerfCounter {
    fn default() -> Self {
        PerfCounter::new()
    }
}

#[derive(Default)]
pub struct Statistics {
    pub packets_received: PerfCounter,
    pub packets_sent: PerfCounter,
    pub packets_delivered: PerfCounter,
    pub parse_errors: PerfCounter,
    pub unroutable: PerfCounter,
    pub filtered: PerfCounter,
    /// Frames that could not be copied in (pool exhausted, oversized)
    pub rx_dropped: PerfCounter,
    pub backpressure: PerfCounter,
    pub buffers_allocated: PerfCounter,
    pub buffers_freed: PerfCounter,
    pub buffers_created: PerfCounter,
}

/// Point-in-time copy of a Statistics block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub packets_received: u32,
    pub packets_sent: u32,
    pub packets_delivered: u32,
    pub parse_errors: u32,
    pub unroutable: u32,
    pub filtered: u32,
    pub rx_dropped: u32,
    pub backpressure: u32,
    pub buffers_allocated: u32,
    pub buffers_freed: u32,
    pub buffers_created: u32,
}

impl Statistics {
    pub const fn new() -> Self {
        Statistics {
            packets_received: PerfCounter::new(),
            packets_sent: PerfCounter::new(),
            packets_delivered: PerfCounter::new(),
            parse_errors: PerfCounter::new(),
            unroutable: PerfCounter::new(),
            filtered: PerfCounter::new(),
            rx_dropped: PerfCounter::new(),
            backpressure: PerfCounter::new(),
            buffers_allocated: PerfCounter::new(),
            buffers_freed: PerfCounter::new(),
            buffers_created: PerfCounter::new(),
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            packets_received: self.packets_received.get(),
            packets_sent: self.packets_sent.get(),
            packets_delivered: self.packets_delivered.get(),
            parse_errors: self.parse_errors.get(),
            unroutable: self.unroutable.get(),
            filtered: self.filtered.get(),
            rx_dropped: self.rx_dropped.get(),
            backpressure: self.backpressure.get(),
            buffers_allocated: self.buffers_allocated.get(),
            buffers_freed: self.buffers_freed.get(),
            buffers_created: self.buffers_created.get(),
        }
    }
}

impl StatsSnapshot {
    pub fn buffers_in_use(&self) -> u32 {
        self.buffers_allocated.saturating_sub(self.buffers_freed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_ones_comp() {
        assert_eq!(compute_ones_comp(0, &[0x00, 0x00]), 0);
        assert_eq!(compute_ones_comp(0, &[0x00, 0x01]), 0x1);
        assert_eq!(compute_ones_comp(0, &[0x00, 0xff]), 0xff);
        assert_eq!(compute_ones_comp(0, &[0xff, 0x23, 0xef, 0x55]), 0xee79);
    }

    #[test]
    fn test_compute_ones_comp_empty() {
        assert_eq!(compute_ones_comp(0x1234, &[]), 0x1234);
    }

    #[test]
    fn test_compute_ones_comp_odd_length() {
        // 0x1234 + 0x5600
        assert_eq!(compute_ones_comp(0, &[0x12, 0x34, 0x56]), 0x6834);
    }

    #[test]
    fn test_compute_checksum() {
        assert_eq!(compute_checksum(&[0x00, 0x00]), 0xffff);
        assert_eq!(compute_checksum(&[0x00, 0x01]), 0xfffe);
        assert_eq!(compute_checksum(&[0x00, 0xff]), 0xff00);
        assert_eq!(compute_checksum(&[0xff, 0x23, 0xef, 0x55]), 0x1186);
    }

    #[test]
    fn test_get_be16() {
        assert_eq!(get_be16(&[0x00, 0x00]), 0x0000);
        assert_eq!(get_be16(&[0x35, 0xa5]), 0x35a5);
    }

    #[test]
    fn test_get_be32() {
        assert_eq!(get_be32(&[0xde, 0xad, 0xbe, 0xef]), 0xdeadbeef);
        assert_eq!(get_be32(&[0x00, 0x00, 0x00, 0xff]), 0x000000ff);
        assert_eq!(get_be32(&[0xff, 0x00, 0x00, 0x00]), 0xff000000);
    }

    #[test]
    fn test_set_be16() {
        let mut buffer = [0u8; 2];
        set_be16(&mut buffer, 0x0100);
        assert_eq!(buffer, [0x01, 0x00]);
        set_be16(&mut buffer, 0xffff);
        assert_eq!(buffer, [0xff, 0xff]);
    }

    #[test]
    fn test_set_be32() {
        let mut buffer = [0u8; 4];
        set_be32(&mut buffer, 0x00010000);
        assert_eq!(buffer, [0x00, 0x01, 0x00, 0x00]);
        set_be32(&mut buffer, 0xdeadbeef);
        assert_eq!(buffer, [0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn test_ip_to_str() {
        assert_eq!(
            IPv4Addr::new_from(&[18u8, 52, 86, 120]).to_string(),
            "18.52.86.120"
        );
    }

    #[test]
    fn test_ip_from_str() {
        assert_eq!("10.0.0.1".parse::<IPv4Addr>().unwrap(), IPv4Addr::new(10, 0, 0, 1));
        assert!("10.0.0".parse::<IPv4Addr>().is_err());
        assert!("10.0.0.1.5".parse::<IPv4Addr>().is_err());
        assert!("10.0.0.256".parse::<IPv4Addr>().is_err());
        assert!("10..0.1".parse::<IPv4Addr>().is_err());
        assert!("ten.0.0.1".parse::<IPv4Addr>().is_err());
        assert!("+10.0.0.1".parse::<IPv4Addr>().is_err());
        assert!("1.+2.3.4".parse::<IPv4Addr>().is_err());
        assert!("1.2.3. 4".parse::<IPv4Addr>().is_err());
    }

    #[test]
    fn test_ip_mask() {
        let addr = IPv4Addr::new(192, 168, 7, 33);
        assert_eq!(
            addr.mask(IPv4Addr::new(255, 255, 255, 0)),
            IPv4Addr::new(192, 168, 7, 0)
        );
    }

    #[test]
    fn test_copy_to() {
        let ip = IPv4Addr::new_from(&[192, 168, 1, 1]);
        let mut buffer = [0u8; 4];
        ip.copy_to(&mut buffer);
        assert_eq!(buffer, [192, 168, 1, 1]);
    }

    #[test]
    fn test_hwaddr_display() {
        let hw = HwAddr::new([0x02, 0x00, 0x5e, 0x10, 0xab, 0x01]);
        assert_eq!(hw.to_string(), "02:00:5e:10:ab:01");
        assert!(!hw.is_broadcast());
        assert!(HwAddr::BROADCAST.is_broadcast());
    }

    #[test]
    fn test_stats_snapshot() {
        let stats = Statistics::new();
        stats.buffers_allocated.add(5);
        stats.buffers_freed.add(2);
        stats.packets_received.inc();
        let snap = stats.snapshot();
        assert_eq!(snap.packets_received, 1);
        assert_eq!(snap.buffers_in_use(), 3);
    }
}

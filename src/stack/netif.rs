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

// Network interfaces. An Interface is a shared handle to one attachment
// point. Configuration lives behind a readers/writer lock; the transmit
// queue has its own lock, so configuration reads never wait behind a send.

use crate::buf::{BufferPool, PacketBuffer};
use crate::error::{NetError, Result};
use crate::format::{FormatterChain, HeaderFields, LinkKind};
use crate::instance::{Instance, InstanceWeak, StackConfig};
use crate::packet::Packet;
use crate::sync::{RwLockReadGuard, RwLockWriteGuard, SpinMutex, SpinMutexGuard, SpinRwLock};
use crate::util::{HwAddr, IPv4Addr, Statistics, StatsSnapshot};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Weak};

static NEXT_INTERFACE_ID: AtomicU16 = AtomicU16::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InterfaceId(pub u16);

impl fmt::Display for InterfaceId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "if{}", self.0)
    }
}

/// IPv4 configuration of an interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct V4Configuration {
    pub address: IPv4Addr,
    pub netmask: IPv4Addr,
    /// 0.0.0.0 when there is no default gateway
    pub gateway: IPv4Addr,
}

impl V4Configuration {
    pub fn new(address: IPv4Addr, netmask: IPv4Addr, gateway: IPv4Addr) -> Self {
        V4Configuration {
            address,
            netmask,
            gateway,
        }
    }

    /// Parse dotted-quad strings and validate the result.
    pub fn parse(address: &str, netmask: &str, gateway: &str) -> Result<Self> {
        let conf = V4Configuration {
            address: address.parse()?,
            netmask: netmask.parse()?,
            gateway: gateway.parse()?,
        };

        conf.validate()?;
        Ok(conf)
    }

    pub fn validate(&self) -> Result<()> {
        let mask = self.netmask.to_u32();
        if mask.leading_ones() + mask.trailing_zeros() != 32 || mask == 0 {
            return Err(NetError::InvalidConfiguration("netmask is not contiguous"));
        }

        if self.address.is_unspecified() || self.address.is_broadcast() || self.address.is_multicast() {
            return Err(NetError::InvalidConfiguration("address is not a unicast host address"));
        }

        // A /31 or /32 has no network or broadcast address to avoid.
        if mask.leading_ones() < 31
            && (self.address == self.network() || self.address == self.broadcast())
        {
            return Err(NetError::InvalidConfiguration(
                "address is the network or broadcast address of its subnet",
            ));
        }

        if !self.gateway.is_unspecified() && (!self.contains(self.gateway) || self.gateway == self.address) {
            return Err(NetError::InvalidConfiguration("gateway is not a host on the subnet"));
        }

        Ok(())
    }

    pub fn is_configured(&self) -> bool {
        !self.address.is_unspecified()
    }

    pub fn prefix_len(&self) -> u32 {
        self.netmask.to_u32().leading_ones()
    }

    pub fn network(&self) -> IPv4Addr {
        self.address.mask(self.netmask)
    }

    /// Directed broadcast address of the subnet
    pub fn broadcast(&self) -> IPv4Addr {
        IPv4Addr::from_u32(self.network().to_u32() | !self.netmask.to_u32())
    }

    pub fn contains(&self, addr: IPv4Addr) -> bool {
        self.is_configured() && addr.mask(self.netmask) == self.network()
    }
}

impl fmt::Display for V4Configuration {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{} via {}", self.address, self.prefix_len(), self.gateway)
    }
}

/// Transmit side of a hardware driver.
pub trait Device {
    /// Hand one frame to the hardware. Returns false when the hardware ring
    /// is full and the frame was not taken.
    fn transmit(&mut self, frame: &[u8]) -> bool;
}

/// The configurable state of an interface
pub struct InterfaceRaw {
    name: String,
    hw_addr: HwAddr,
    conf: V4Configuration,
}

impl InterfaceRaw {
    pub fn name_ref(&self) -> &str {
        &self.name
    }

    pub fn hw_addr_ref(&self) -> &HwAddr {
        &self.hw_addr
    }

    pub fn v4_configuration_ref(&self) -> &V4Configuration {
        &self.conf
    }

    pub fn name_mut(&mut self) -> &mut String {
        &mut self.name
    }

    pub fn hw_addr_mut(&mut self) -> &mut HwAddr {
        &mut self.hw_addr
    }
}

struct InterfaceInner {
    id: InterfaceId,
    kind: LinkKind,
    mtu: usize,
    raw: SpinRwLock<InterfaceRaw>,
    tx_queue: SpinMutex<VecDeque<Packet>>,
    tx_depth: usize,
    rx_order: SpinMutex<()>,
    neighbors: SpinMutex<HashMap<IPv4Addr, HwAddr>>,
    neighbor_limit: usize,
    owner: SpinMutex<InstanceWeak>,
    formatters: FormatterChain,
    pool: BufferPool,
    stats: Arc<Statistics>,
}

/// A shareable network interface.
#[derive(Clone)]
pub struct Interface(Arc<InterfaceInner>);

/// A interface weak reference
#[derive(Clone, Default)]
pub struct InterfaceWeak(Weak<InterfaceInner>);

impl Interface {
    pub fn new(name: &str, kind: LinkKind, hw_addr: HwAddr) -> Self {
        Interface::with_config(name, kind, hw_addr, &StackConfig::default())
    }

    pub fn with_config(name: &str, kind: LinkKind, hw_addr: HwAddr, config: &StackConfig) -> Self {
        let stats = Arc::new(Statistics::new());
        let pool = BufferPool::new(
            config.mtu + kind.header_len(),
            config.pool_buffers,
            config.pool_limit,
            stats.clone(),
        );

        Interface(Arc::new(InterfaceInner {
            id: InterfaceId(NEXT_INTERFACE_ID.fetch_add(1, Ordering::Relaxed)),
            kind,
            mtu: config.mtu,
            raw: SpinRwLock::new(InterfaceRaw {
                name: name.to_string(),
                hw_addr,
                conf: V4Configuration::default(),
            }),
            tx_queue: SpinMutex::new(VecDeque::with_capacity(config.tx_queue_depth)),
            tx_depth: config.tx_queue_depth,
            rx_order: SpinMutex::new(()),
            neighbors: SpinMutex::new(HashMap::new()),
            neighbor_limit: config.neighbor_limit,
            owner: SpinMutex::new(InstanceWeak::default()),
            formatters: FormatterChain::for_kind(kind),
            pool,
            stats,
        }))
    }

    pub fn id(&self) -> InterfaceId {
        self.0.id
    }

    pub fn kind(&self) -> LinkKind {
        self.0.kind
    }

    pub fn mtu(&self) -> usize {
        self.0.mtu
    }

    pub fn formatters(&self) -> &FormatterChain {
        &self.0.formatters
    }

    pub fn pool(&self) -> &BufferPool {
        &self.0.pool
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.0.stats.snapshot()
    }

    /// Get a weak reference over the interface
    pub fn downgrade(&self) -> InterfaceWeak {
        InterfaceWeak(Arc::downgrade(&self.0))
    }

    /// Shared read access to the configurable state
    pub fn read(&self) -> RwLockReadGuard<'_, InterfaceRaw> {
        self.0.raw.read()
    }

    /// Exclusive write access to the configurable state. IPv4 configuration
    /// can only be changed through `set_v4_configuration`.
    pub fn write(&self) -> RwLockWriteGuard<'_, InterfaceRaw> {
        self.0.raw.write()
    }

    pub fn name(&self) -> String {
        self.read().name.clone()
    }

    pub fn hw_addr(&self) -> HwAddr {
        self.read().hw_addr
    }

    pub fn v4_configuration(&self) -> V4Configuration {
        self.read().conf
    }

    /// Replace the IPv4 configuration. It is validated first; on failure the
    /// previous configuration stays in place untouched.
    pub fn set_v4_configuration(&self, conf: V4Configuration) -> Result<()> {
        if let Err(err) = conf.validate() {
            tracing::debug!(interface = %self.id(), %err, "rejected IPv4 configuration");
            return Err(err);
        }

        self.write().conf = conf;
        tracing::info!(interface = %self.id(), conf = %conf, "IPv4 configuration updated");
        Ok(())
    }

    /// Queue a finalized packet for the driver. On a full queue the packet
    /// is handed back with the error so the caller can retry.
    pub fn try_send(&self, packet: Packet) -> std::result::Result<(), (NetError, Packet)> {
        let mut queue = self.0.tx_queue.lock();
        if queue.len() >= self.0.tx_depth {
            drop(queue);
            self.0.stats.backpressure.inc();
            tracing::warn!(interface = %self.id(), depth = self.0.tx_depth, "transmit queue full");
            return Err((NetError::BackpressureFull(self.id()), packet));
        }

        queue.push_back(packet);
        self.0.stats.packets_sent.inc();
        Ok(())
    }

    pub fn send(&self, packet: Packet) -> Result<()> {
        self.try_send(packet).map_err(|(err, _)| err)
    }

    pub fn tx_pending(&self) -> usize {
        self.0.tx_queue.lock().len()
    }

    /// Next packet for the driver to put on the wire
    pub fn dequeue(&self) -> Option<Packet> {
        self.0.tx_queue.lock().pop_front()
    }

    /// Push queued packets into `device` until the queue is empty or the
    /// device refuses one. Returns the number transmitted.
    pub fn flush(&self, device: &mut dyn Device) -> usize {
        let mut queue = self.0.tx_queue.lock();
        let mut sent = 0;
        while let Some(packet) = queue.pop_front() {
            if !device.transmit(packet.bytes()) {
                queue.push_front(packet);
                break;
            }

            sent += 1;
        }

        sent
    }

    /// Copy a raw frame from the driver into a packet buffer.
    pub fn receive(&self, frame: &[u8]) -> Result<PacketBuffer> {
        self.0.stats.packets_received.inc();
        let mut buffer = self.0.pool.alloc(0)?;
        buffer.append_from_slice(frame)?;
        Ok(buffer)
    }

    /// Entry point for a driver that pushes frames as they arrive (for
    /// example from its interrupt handler).
    pub fn on_frame(&self, frame: &[u8]) -> Result<()> {
        let instance = self.owner().ok_or(NetError::StackGone)?;
        instance.on_receive(self.id(), frame)
    }

    /// Whether a parsed frame is addressed to this interface.
    pub fn accepts(&self, fields: &HeaderFields) -> bool {
        let raw = self.read();
        if self.kind() == LinkKind::Ethernet
            && fields.dst_hw != raw.hw_addr
            && !fields.dst_hw.is_broadcast()
        {
            return false;
        }

        let conf = raw.conf;
        fields.dst_ip.is_broadcast()
            || (conf.is_configured() && (fields.dst_ip == conf.address || fields.dst_ip == conf.broadcast()))
    }

    /// Remember the link address of a host on our subnet. Once the cache is
    /// full, new hosts are not added; known ones are still updated.
    pub fn learn_neighbor(&self, addr: IPv4Addr, hw_addr: HwAddr) {
        if addr.is_unspecified() || hw_addr.is_broadcast() {
            return;
        }

        let conf = self.v4_configuration();
        if !conf.contains(addr) || addr == conf.address || addr == conf.broadcast() {
            return;
        }

        let mut neighbors = self.0.neighbors.lock();
        if neighbors.len() >= self.0.neighbor_limit && !neighbors.contains_key(&addr) {
            drop(neighbors);
            tracing::debug!(interface = %self.id(), %addr, "neighbor cache full");
            return;
        }

        neighbors.insert(addr, hw_addr);
    }

    pub fn neighbor_count(&self) -> usize {
        self.0.neighbors.lock().len()
    }

    /// Link address for `addr`, broadcast if it has not been seen.
    pub fn neighbor(&self, addr: IPv4Addr) -> HwAddr {
        self.0
            .neighbors
            .lock()
            .get(&addr)
            .copied()
            .unwrap_or(HwAddr::BROADCAST)
    }

    pub fn owner(&self) -> Option<Instance> {
        self.0.owner.lock().upgrade()
    }

    pub(crate) fn set_owner(&self, owner: InstanceWeak) {
        *self.0.owner.lock() = owner;
    }

    /// Held while one received frame is parsed and dispatched, so frames from
    /// this interface reach connections in arrival order.
    pub(crate) fn rx_order(&self) -> SpinMutexGuard<'_, ()> {
        self.0.rx_order.lock()
    }

    pub(crate) fn stats_ref(&self) -> &Statistics {
        &self.0.stats
    }
}

impl fmt::Debug for Interface {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Interface")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .field("conf", &self.v4_configuration())
            .finish()
    }
}

impl InterfaceWeak {
    /// Upgrade the weak reference to a real reference
    pub fn upgrade(&self) -> Option<Interface> {
        self.0.upgrade().map(Interface)
    }
}

impl fmt::Debug for InterfaceWeak {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.upgrade() {
            Some(intf) => write!(f, "InterfaceWeak({})", intf.id()),
            None => write!(f, "InterfaceWeak(<dropped>)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::Endpoint;
    use crate::packet::Builder;

    fn addr(s: &str) -> IPv4Addr {
        s.parse().unwrap()
    }

    fn test_interface(depth: usize) -> Interface {
        let config = StackConfig {
            tx_queue_depth: depth,
            ..StackConfig::default()
        };

        let intf = Interface::with_config("eth0", LinkKind::Ethernet, HwAddr::new([2, 0, 0, 0, 0, 1]), &config);
        intf.set_v4_configuration(V4Configuration::parse("10.0.0.1", "255.255.255.0", "10.0.0.254").unwrap())
            .unwrap();
        intf
    }

    fn build(intf: &Interface, payload: &[u8]) -> Packet {
        let mut builder = Builder::new(intf, intf.kind()).unwrap();
        builder.set_destination(Endpoint::udp(addr("10.0.0.2"), 7)).unwrap();
        builder.write(payload).unwrap();
        builder.finalize().unwrap()
    }

    struct RingDevice {
        room: usize,
        frames: Vec<Vec<u8>>,
    }

    impl Device for RingDevice {
        fn transmit(&mut self, frame: &[u8]) -> bool {
            if self.frames.len() == self.room {
                return false;
            }

            self.frames.push(frame.to_vec());
            true
        }
    }

    #[test]
    fn test_validate_configuration() {
        assert!(V4Configuration::parse("10.0.0.1", "255.255.255.0", "0.0.0.0").is_ok());
        assert!(V4Configuration::parse("10.0.0.1", "255.255.255.255", "0.0.0.0").is_ok());
        assert!(V4Configuration::parse("10.0.0.1", "255.0.255.0", "0.0.0.0").is_err());
        assert!(V4Configuration::parse("10.0.0.0", "255.255.255.0", "0.0.0.0").is_err());
        assert!(V4Configuration::parse("10.0.0.255", "255.255.255.0", "0.0.0.0").is_err());
        assert!(V4Configuration::parse("224.0.0.1", "255.255.255.0", "0.0.0.0").is_err());
        assert!(V4Configuration::parse("10.0.0.1", "255.255.255.0", "10.0.1.1").is_err());
        assert!(V4Configuration::parse("10.0.0.1", "255.255.255.0", "10.0.0.1").is_err());
        assert!(V4Configuration::parse("10.0.0.1", "0.0.0.0", "0.0.0.0").is_err());
    }

    #[test]
    fn test_subnet_helpers() {
        let conf = V4Configuration::parse("192.168.4.17", "255.255.252.0", "192.168.4.1").unwrap();
        assert_eq!(conf.prefix_len(), 22);
        assert_eq!(conf.network(), addr("192.168.4.0"));
        assert_eq!(conf.broadcast(), addr("192.168.7.255"));
        assert!(conf.contains(addr("192.168.6.3")));
        assert!(!conf.contains(addr("192.168.8.3")));
        assert_eq!(conf.to_string(), "192.168.4.17/22 via 192.168.4.1");
    }

    #[test]
    fn test_bad_configuration_keeps_previous() {
        let intf = test_interface(4);
        let before = intf.v4_configuration();

        let bad = V4Configuration::new(addr("10.0.0.0"), addr("255.255.255.0"), addr("0.0.0.0"));
        assert!(matches!(
            intf.set_v4_configuration(bad),
            Err(NetError::InvalidConfiguration(_))
        ));
        assert_eq!(intf.v4_configuration(), before);

        let malformed = V4Configuration::parse("10.0.0.300", "255.255.255.0", "0.0.0.0");
        assert!(matches!(malformed, Err(NetError::InvalidConfiguration(_))));
        let signed = V4Configuration::parse("+10.0.0.1", "255.255.255.0", "0.0.0.0");
        assert!(matches!(signed, Err(NetError::InvalidConfiguration(_))));
        assert_eq!(intf.v4_configuration(), before);
    }

    #[test]
    fn test_config_read_while_sending() {
        let intf = test_interface(4);
        let _queue = intf.0.tx_queue.lock();

        // Transmit queue is held, configuration is still readable
        assert_eq!(intf.v4_configuration().address, addr("10.0.0.1"));
    }

    #[test]
    fn test_backpressure() {
        let intf = test_interface(2);
        intf.send(build(&intf, b"one")).unwrap();
        intf.send(build(&intf, b"two")).unwrap();
        match intf.try_send(build(&intf, b"three")) {
            Err((NetError::BackpressureFull(id), packet)) => {
                assert_eq!(id, intf.id());
                assert_eq!(packet.payload(), b"three");
            }
            other => panic!("expected backpressure, got {:?}", other.map_err(|(e, _)| e)),
        }

        assert_eq!(intf.stats().backpressure, 1);
        assert_eq!(intf.dequeue().unwrap().payload(), b"one");
        intf.send(build(&intf, b"three")).unwrap();
        assert_eq!(intf.tx_pending(), 2);
    }

    #[test]
    fn test_flush_stops_when_device_full() {
        let intf = test_interface(8);
        for payload in &[b"a", b"b", b"c"] {
            intf.send(build(&intf, *payload)).unwrap();
        }

        let mut device = RingDevice {
            room: 2,
            frames: Vec::new(),
        };

        assert_eq!(intf.flush(&mut device), 2);
        assert_eq!(intf.tx_pending(), 1);
        device.room = 3;
        assert_eq!(intf.flush(&mut device), 1);
        assert_eq!(device.frames.len(), 3);
        assert_eq!(*device.frames[2].last().unwrap(), b'c');
    }

    #[test]
    fn test_accepts() {
        let intf = test_interface(1);
        let mut fields = HeaderFields {
            dst_hw: intf.hw_addr(),
            dst_ip: addr("10.0.0.1"),
            ..HeaderFields::default()
        };

        assert!(intf.accepts(&fields));
        fields.dst_ip = addr("10.0.0.255");
        assert!(intf.accepts(&fields));
        fields.dst_ip = addr("10.0.0.9");
        assert!(!intf.accepts(&fields));
        fields.dst_ip = addr("10.0.0.1");
        fields.dst_hw = HwAddr::new([2, 0, 0, 0, 0, 9]);
        assert!(!intf.accepts(&fields));
        fields.dst_hw = HwAddr::BROADCAST;
        assert!(intf.accepts(&fields));
    }

    #[test]
    fn test_neighbors() {
        let intf = test_interface(1);
        let peer = HwAddr::new([2, 0, 0, 0, 0, 2]);
        assert!(intf.neighbor(addr("10.0.0.2")).is_broadcast());
        intf.learn_neighbor(addr("10.0.0.2"), peer);
        assert_eq!(intf.neighbor(addr("10.0.0.2")), peer);

        // Off-subnet senders are reached through the gateway, not cached
        intf.learn_neighbor(addr("192.168.1.2"), peer);
        assert!(intf.neighbor(addr("192.168.1.2")).is_broadcast());
        assert_eq!(intf.neighbor_count(), 1);
    }

    #[test]
    fn test_neighbor_cache_bounded() {
        let config = StackConfig {
            neighbor_limit: 4,
            ..StackConfig::default()
        };

        let intf = Interface::with_config("eth0", LinkKind::Ethernet, HwAddr::new([2, 0, 0, 0, 0, 1]), &config);
        intf.set_v4_configuration(V4Configuration::parse("10.0.0.1", "255.255.0.0", "0.0.0.0").unwrap())
            .unwrap();

        for host in 0..10_000u32 {
            let addr = IPv4Addr::from_u32(0x0a00_0002 + host);
            intf.learn_neighbor(addr, HwAddr::new([2, 0, 0, 0, (host >> 8) as u8, host as u8]));
        }

        assert_eq!(intf.neighbor_count(), 4);

        // Entries already cached keep being refreshed
        let moved = HwAddr::new([2, 0, 0, 0, 0xee, 0xee]);
        intf.learn_neighbor(addr("10.0.0.2"), moved);
        assert_eq!(intf.neighbor(addr("10.0.0.2")), moved);
        assert!(intf.neighbor(addr("10.0.0.200")).is_broadcast());
    }

    #[test]
    fn test_weak_upgrade() {
        let intf = test_interface(1);
        let weak = intf.downgrade();
        assert_eq!(weak.upgrade().unwrap().id(), intf.id());
        drop(intf);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_on_frame_without_stack() {
        let intf = test_interface(1);
        assert_eq!(intf.on_frame(&[0; 64]).unwrap_err(), NetError::StackGone);
    }
}

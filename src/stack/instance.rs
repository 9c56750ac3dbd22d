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

//
// The stack instance owns the interfaces and the connection manager.
// Interfaces and connections only keep weak references back to it, so
// dropping the last Instance handle tears everything down.
//
//   driver ──frame──▶ Interface::on_frame ──▶ Instance::on_receive
//                                               │ parse (FormatterChain)
//                                               │ filter, learn neighbor
//                                               ▼
//                                        Manager::dispatch ──▶ UniConn/MultiConn
//
//   UniConn::send ──▶ Instance::send_to ──▶ route ──▶ Builder ──▶ Interface::send
//

use crate::conn::{Connection, Datagram, DeliverStatus, Delivery, Endpoint, EndpointKey, MultiConn, UniConn};
use crate::error::{NetError, Result};
use crate::format::{LinkKind, PROTO_UDP};
use crate::manager::{DispatchPolicy, Manager};
use crate::netif::{Interface, InterfaceId, V4Configuration};
use crate::packet::{Builder, Packet, DEFAULT_TTL};
use crate::sync::SpinRwLock;
use crate::util::{HwAddr, IPv4Addr, Statistics, StatsSnapshot};
use lazy_static::lazy_static;
use rand::Rng;
use std::fmt;
use std::sync::{Arc, Weak};

const EPHEMERAL_PORT_FIRST: u16 = 49152;
const EPHEMERAL_PORT_LAST: u16 = 65535;
const EPHEMERAL_PORT_ATTEMPTS: usize = 64;

#[derive(Debug, Clone)]
pub struct StackConfig {
    /// Largest IPv4 packet an interface will send
    pub mtu: usize,
    pub tx_queue_depth: usize,

    /// Queue length for connections opened with `open_uni`/`open_multi`
    pub conn_queue_depth: usize,
    pub pool_buffers: usize,
    pub pool_limit: usize,

    /// Most neighbor cache entries kept per interface
    pub neighbor_limit: usize,
    pub default_ttl: u8,
    pub dispatch_policy: DispatchPolicy,
}

impl Default for StackConfig {
    fn default() -> Self {
        StackConfig {
            mtu: 1500,
            tx_queue_depth: 64,
            conn_queue_depth: 128,
            pool_buffers: 32,
            pool_limit: 256,
            neighbor_limit: 64,
            default_ttl: DEFAULT_TTL,
            dispatch_policy: DispatchPolicy::ExactFirst,
        }
    }
}

struct InstanceInner {
    config: StackConfig,
    interfaces: SpinRwLock<Vec<Interface>>,
    manager: Manager,
    stats: Statistics,
}

/// A shareable network stack.
#[derive(Clone)]
pub struct Instance(Arc<InstanceInner>);

/// Non-owning handle to an Instance, held by interfaces and connections.
#[derive(Clone, Default)]
pub struct InstanceWeak(Weak<InstanceInner>);

lazy_static! {
    static ref GLOBAL: Instance = Instance::new(StackConfig::default());
}

/// Process-wide stack, created with the default configuration on first use.
pub fn global() -> Instance {
    GLOBAL.clone()
}

impl Instance {
    pub fn new(config: StackConfig) -> Self {
        let manager = Manager::new(config.dispatch_policy);
        Instance(Arc::new(InstanceInner {
            config,
            interfaces: SpinRwLock::new(Vec::new()),
            manager,
            stats: Statistics::new(),
        }))
    }

    pub fn downgrade(&self) -> InstanceWeak {
        InstanceWeak(Arc::downgrade(&self.0))
    }

    pub fn config(&self) -> &StackConfig {
        &self.0.config
    }

    pub fn manager(&self) -> &Manager {
        &self.0.manager
    }

    /// Create an interface sized by this stack's configuration and attach it.
    pub fn create_interface(&self, name: &str, kind: LinkKind, hw_addr: HwAddr) -> Result<Interface> {
        let interface = Interface::with_config(name, kind, hw_addr, &self.0.config);
        self.add_interface(interface.clone())?;
        Ok(interface)
    }

    pub fn add_interface(&self, interface: Interface) -> Result<InterfaceId> {
        if interface.owner().is_some() {
            return Err(NetError::InvalidConfiguration(
                "interface is already attached to a stack",
            ));
        }

        let id = interface.id();
        let mut interfaces = self.0.interfaces.write();
        if interfaces.iter().any(|existing| existing.id() == id) {
            return Err(NetError::InvalidConfiguration("duplicate interface id"));
        }

        interface.set_owner(self.downgrade());
        interfaces.push(interface);
        drop(interfaces);

        tracing::info!(interface = %id, "interface added");
        Ok(id)
    }

    /// Detach an interface. Frames it receives afterwards fail with
    /// `StackGone`.
    pub fn remove_interface(&self, id: InterfaceId) -> Result<Interface> {
        let mut interfaces = self.0.interfaces.write();
        let index = interfaces
            .iter()
            .position(|interface| interface.id() == id)
            .ok_or(NetError::NoSuchInterface(id))?;
        let interface = interfaces.remove(index);
        drop(interfaces);

        interface.set_owner(InstanceWeak::default());
        tracing::info!(interface = %id, "interface removed");
        Ok(interface)
    }

    pub fn interface(&self, id: InterfaceId) -> Option<Interface> {
        self.0
            .interfaces
            .read()
            .iter()
            .find(|interface| interface.id() == id)
            .cloned()
    }

    pub fn interfaces(&self) -> Vec<Interface> {
        self.0.interfaces.read().clone()
    }

    /// Pick the outgoing interface and next hop for `dest`.
    ///
    /// An interface whose subnet contains the destination wins. The limited
    /// broadcast goes out the first configured interface. Anything else
    /// goes to the first interface that has a gateway.
    pub fn route(&self, dest: &Endpoint) -> Result<(Interface, IPv4Addr)> {
        let interfaces = self.0.interfaces.read();
        let mut broadcast = None;
        let mut default_route = None;
        for interface in interfaces.iter() {
            let conf = interface.v4_configuration();
            if !conf.is_configured() {
                continue;
            }

            if conf.contains(dest.address) {
                return Ok((interface.clone(), dest.address));
            }

            if broadcast.is_none() {
                broadcast = Some(interface);
            }

            if default_route.is_none() && !conf.gateway.is_unspecified() {
                default_route = Some((interface, conf.gateway));
            }
        }

        if dest.address.is_broadcast() {
            if let Some(interface) = broadcast {
                return Ok((interface.clone(), dest.address));
            }
        } else if let Some((interface, gateway)) = default_route {
            return Ok((interface.clone(), gateway));
        }

        Err(NetError::Unroutable(*dest))
    }

    /// Send one datagram from a random ephemeral port.
    pub fn send(&self, dest: Endpoint, payload: &[u8]) -> Result<()> {
        let port = rand::thread_rng().gen_range(EPHEMERAL_PORT_FIRST..=EPHEMERAL_PORT_LAST);
        self.send_to(port, dest, payload)
    }

    pub fn send_to(&self, source_port: u16, dest: Endpoint, payload: &[u8]) -> Result<()> {
        let (interface, _) = self.route(&dest)?;
        self.send_via(&interface, source_port, dest, payload)
    }

    /// Build a packet for `dest` and queue it on `interface`, bypassing the
    /// routing decision.
    pub fn send_via(&self, interface: &Interface, source_port: u16, dest: Endpoint, payload: &[u8]) -> Result<()> {
        if dest.protocol != PROTO_UDP {
            return Err(NetError::InvalidConfiguration("only UDP endpoints can be sent to"));
        }

        let next_hop = next_hop(&interface.v4_configuration(), dest.address);
        let packet = self.build(interface, source_port, dest, next_hop, payload)?;
        match interface.send(packet) {
            Ok(()) => {
                self.0.stats.packets_sent.inc();
                Ok(())
            }
            Err(err) => {
                if let NetError::BackpressureFull(_) = err {
                    self.0.stats.backpressure.inc();
                }

                Err(err)
            }
        }
    }

    fn build(
        &self,
        interface: &Interface,
        source_port: u16,
        dest: Endpoint,
        next_hop: IPv4Addr,
        payload: &[u8],
    ) -> Result<Packet> {
        let mut builder = Builder::new(interface, interface.kind())?;
        builder.set_source_port(source_port)?;
        builder.set_destination(dest)?;
        builder.set_ttl(self.0.config.default_ttl)?;
        builder.set_dest_hw(interface.neighbor(next_hop))?;
        builder.write(payload)?;
        builder.finalize()
    }

    /// Entry point for drivers: parse one raw frame received on interface
    /// `id` and hand it to the connection it is addressed to.
    ///
    /// Errors only describe what happened to this frame. The frame is
    /// dropped and the stack keeps processing.
    pub fn on_receive(&self, id: InterfaceId, frame: &[u8]) -> Result<()> {
        let interface = self.interface(id).ok_or(NetError::NoSuchInterface(id))?;
        self.0.stats.packets_received.inc();

        let _order = interface.rx_order();
        let buffer = match interface.receive(frame) {
            Ok(buffer) => buffer,
            Err(err) => {
                self.0.stats.rx_dropped.inc();
                interface.stats_ref().rx_dropped.inc();
                tracing::debug!(interface = %id, len = frame.len(), error = %err, "could not take in frame");
                return Err(err);
            }
        };
        let parsed = match interface.formatters().read_headers(buffer.header()) {
            Ok(parsed) => parsed,
            Err(err) => {
                self.0.stats.parse_errors.inc();
                interface.stats_ref().parse_errors.inc();
                tracing::debug!(interface = %id, error = %err, "dropping malformed frame");
                return Err(err);
            }
        };

        let fields = parsed.fields;
        if !interface.accepts(&fields) {
            self.0.stats.filtered.inc();
            interface.stats_ref().filtered.inc();
            tracing::debug!(interface = %id, dest = %fields.dst_ip, "frame not addressed to us");
            return Ok(());
        }

        if interface.kind() == LinkKind::Ethernet {
            interface.learn_neighbor(fields.src_ip, fields.src_hw);
        }

        let datagram = Datagram {
            source: Endpoint::new(fields.protocol, fields.src_ip, fields.src_port),
            destination: Endpoint::new(fields.protocol, fields.dst_ip, fields.dst_port),
            interface: interface.downgrade(),
            packet: Packet::received(buffer, id, parsed),
        };

        let source = datagram.source;
        match self.0.manager.dispatch(datagram) {
            Ok(DeliverStatus::Delivered) => {
                self.0.stats.packets_delivered.inc();
                interface.stats_ref().packets_delivered.inc();
                Ok(())
            }
            Ok(status) => {
                tracing::debug!(interface = %id, %source, ?status, "datagram not delivered");
                Ok(())
            }
            Err(err) => {
                self.0.stats.unroutable.inc();
                interface.stats_ref().unroutable.inc();
                tracing::debug!(interface = %id, %source, error = %err, "no connection for datagram");
                Err(err)
            }
        }
    }

    /// Open a connection that only exchanges datagrams with `remote`.
    /// Local port 0 picks a free ephemeral port.
    pub fn open_uni(&self, local_port: u16, remote: Endpoint) -> Result<Arc<UniConn>> {
        self.open_uni_with(local_port, remote, Delivery::Queue(self.0.config.conn_queue_depth))
    }

    pub fn open_uni_with(&self, local_port: u16, remote: Endpoint, delivery: Delivery) -> Result<Arc<UniConn>> {
        let port = self.pick_port(local_port, |port| EndpointKey::exact(port, remote))?;
        let conn = Arc::new(UniConn::new(port, remote, delivery).with_owner(self.downgrade()));
        self.0.manager.register(conn.key(), &Connection::Uni(conn.clone()))?;
        Ok(conn)
    }

    /// Open a connection accepting datagrams from anyone on `local_port`.
    pub fn open_multi(&self, local_port: u16) -> Result<Arc<MultiConn>> {
        self.open_multi_with(local_port, Delivery::Queue(self.0.config.conn_queue_depth))
    }

    pub fn open_multi_with(&self, local_port: u16, delivery: Delivery) -> Result<Arc<MultiConn>> {
        let port = self.pick_port(local_port, |port| EndpointKey::catch_all(PROTO_UDP, port))?;
        let conn = Arc::new(MultiConn::new(PROTO_UDP, port, delivery).with_owner(self.downgrade()));
        self.0.manager.register(conn.key(), &Connection::Multi(conn.clone()))?;
        Ok(conn)
    }

    // Zero means any free ephemeral port.
    fn pick_port<F>(&self, port: u16, key_for: F) -> Result<u16>
    where
        F: Fn(u16) -> EndpointKey,
    {
        if port != 0 {
            return Ok(port);
        }

        let mut rng = rand::thread_rng();
        for _ in 0..EPHEMERAL_PORT_ATTEMPTS {
            let candidate = rng.gen_range(EPHEMERAL_PORT_FIRST..=EPHEMERAL_PORT_LAST);
            if !self.0.manager.is_registered(&key_for(candidate)) {
                return Ok(candidate);
            }
        }

        Err(NetError::InvalidConfiguration("no free ephemeral port"))
    }

    /// Stack counters. Buffer counters are summed over the pools of the
    /// interfaces currently attached.
    pub fn stats(&self) -> StatsSnapshot {
        let mut stats = self.0.stats.snapshot();
        for interface in self.0.interfaces.read().iter() {
            let pool = interface.stats();
            stats.buffers_created += pool.buffers_created;
            stats.buffers_allocated += pool.buffers_allocated;
            stats.buffers_freed += pool.buffers_freed;
        }

        stats
    }

    pub fn log_stats(&self) {
        let stats = self.stats();
        tracing::info!(
            received = stats.packets_received,
            sent = stats.packets_sent,
            delivered = stats.packets_delivered,
            parse_errors = stats.parse_errors,
            unroutable = stats.unroutable,
            filtered = stats.filtered,
            rx_dropped = stats.rx_dropped,
            backpressure = stats.backpressure,
            connections = self.0.manager.len(),
            "stack statistics"
        );

        for interface in self.interfaces() {
            let intf_stats = interface.stats();
            tracing::info!(
                interface = %interface.id(),
                name = %interface.name(),
                buffers_created = intf_stats.buffers_created,
                neighbors = interface.neighbor_count(),
                buffers_in_use = intf_stats.buffers_in_use(),
                tx_pending = interface.tx_pending(),
                "interface statistics"
            );
        }
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Instance")
            .field("interfaces", &self.0.interfaces.read().len())
            .field("connections", &self.0.manager.len())
            .finish()
    }
}

impl InstanceWeak {
    pub fn upgrade(&self) -> Option<Instance> {
        self.0.upgrade().map(Instance)
    }
}

impl fmt::Debug for InstanceWeak {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "InstanceWeak({})", if self.0.strong_count() > 0 { "live" } else { "gone" })
    }
}

fn next_hop(conf: &V4Configuration, dest: IPv4Addr) -> IPv4Addr {
    if dest.is_broadcast() || conf.contains(dest) || conf.gateway.is_unspecified() {
        dest
    } else {
        conf.gateway
    }
}

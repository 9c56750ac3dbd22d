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

// Connections are the consumers the manager demultiplexes into. A UniConn
// talks to exactly one remote endpoint; a MultiConn takes whatever arrives on
// its local port. Both hand datagrams to their owner either through a
// bounded queue or a callback run in the receive context.

use crate::error::{NetError, Result};
use crate::format::PROTO_UDP;
use crate::instance::InstanceWeak;
use crate::netif::InterfaceWeak;
use crate::packet::Packet;
use crate::sync::{self, SpinMutex};
use crate::util::{IPv4Addr, PerfCounter};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

/// A (protocol, address, port) tuple
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    pub protocol: u8,
    pub address: IPv4Addr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(protocol: u8, address: IPv4Addr, port: u16) -> Self {
        Endpoint {
            protocol,
            address,
            port,
        }
    }

    pub fn udp(address: IPv4Addr, port: u16) -> Self {
        Endpoint::new(PROTO_UDP, address, port)
    }
}

fn protocol_name(protocol: u8) -> String {
    match protocol {
        PROTO_UDP => "udp".to_string(),
        other => format!("proto{}", other),
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}/{}", self.address, self.port, protocol_name(self.protocol))
    }
}

/// Registration key in the manager. `remote` is set for connections bound to
/// one peer and empty for catch-all connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointKey {
    pub protocol: u8,
    pub local_port: u16,
    pub remote: Option<(IPv4Addr, u16)>,
}

impl EndpointKey {
    pub fn exact(local_port: u16, remote: Endpoint) -> Self {
        EndpointKey {
            protocol: remote.protocol,
            local_port,
            remote: Some((remote.address, remote.port)),
        }
    }

    pub fn catch_all(protocol: u8, local_port: u16) -> Self {
        EndpointKey {
            protocol,
            local_port,
            remote: None,
        }
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} port {} <- ", protocol_name(self.protocol), self.local_port)?;
        match self.remote {
            Some((address, port)) => write!(f, "{}:{}", address, port),
            None => write!(f, "*"),
        }
    }
}

/// One received packet together with where it came from.
#[derive(Debug)]
pub struct Datagram {
    pub source: Endpoint,
    pub destination: Endpoint,
    /// Interface the packet arrived on, used to reply on the same link
    pub interface: InterfaceWeak,
    pub packet: Packet,
}

impl Datagram {
    pub fn payload(&self) -> &[u8] {
        self.packet.payload()
    }
}

/// How a connection hands datagrams to its consumer.
pub enum Delivery {
    /// Keep up to this many datagrams for `recv`/`try_recv`; more are dropped.
    Queue(usize),
    /// Run in the context that called `on_receive`. Must not block.
    Callback(Box<dyn Fn(Datagram) + Send + Sync>),
}

impl Delivery {
    pub fn callback<F>(f: F) -> Self
    where
        F: Fn(Datagram) + Send + Sync + 'static,
    {
        Delivery::Callback(Box::new(f))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliverStatus {
    Delivered,
    /// Not addressed to this connection
    Rejected,
    /// Queue was full, datagram dropped
    QueueFull,
}

enum Mailbox {
    Queue {
        queue: SpinMutex<VecDeque<Datagram>>,
        depth: usize,
    },
    Callback(Box<dyn Fn(Datagram) + Send + Sync>),
}

impl Mailbox {
    fn new(delivery: Delivery) -> Self {
        match delivery {
            Delivery::Queue(depth) => Mailbox::Queue {
                queue: SpinMutex::new(VecDeque::with_capacity(depth)),
                depth,
            },
            Delivery::Callback(callback) => Mailbox::Callback(callback),
        }
    }

    fn push(&self, datagram: Datagram, dropped: &PerfCounter) -> DeliverStatus {
        match self {
            Mailbox::Queue { queue, depth } => {
                let mut queue = queue.lock();
                if queue.len() >= *depth {
                    dropped.inc();
                    return DeliverStatus::QueueFull;
                }

                queue.push_back(datagram);
            }
            Mailbox::Callback(callback) => callback(datagram),
        }

        DeliverStatus::Delivered
    }

    fn try_pop(&self) -> Option<Datagram> {
        match self {
            Mailbox::Queue { queue, .. } => queue.lock().pop_front(),
            Mailbox::Callback(_) => None,
        }
    }

    fn pop_blocking(&self) -> Result<Datagram> {
        if let Mailbox::Callback(_) = self {
            return Err(NetError::InvalidState);
        }

        loop {
            if let Some(datagram) = self.try_pop() {
                return Ok(datagram);
            }

            sync::relax();
        }
    }

    fn pending(&self) -> usize {
        match self {
            Mailbox::Queue { queue, .. } => queue.lock().len(),
            Mailbox::Callback(_) => 0,
        }
    }
}

/// Connection bound to a single remote endpoint.
pub struct UniConn {
    local_port: u16,
    remote: Endpoint,
    mailbox: Mailbox,
    owner: InstanceWeak,
    dropped: PerfCounter,
}

impl UniConn {
    pub fn new(local_port: u16, remote: Endpoint, delivery: Delivery) -> Self {
        UniConn {
            local_port,
            remote,
            mailbox: Mailbox::new(delivery),
            owner: InstanceWeak::default(),
            dropped: PerfCounter::new(),
        }
    }

    pub(crate) fn with_owner(mut self, owner: InstanceWeak) -> Self {
        self.owner = owner;
        self
    }

    pub fn key(&self) -> EndpointKey {
        EndpointKey::exact(self.local_port, self.remote)
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn remote(&self) -> Endpoint {
        self.remote
    }

    /// Accepts only datagrams sent by the bound remote endpoint to our port.
    pub fn deliver(&self, datagram: Datagram) -> DeliverStatus {
        if datagram.source != self.remote || datagram.destination.port != self.local_port {
            return DeliverStatus::Rejected;
        }

        self.mailbox.push(datagram, &self.dropped)
    }

    /// Wait for the next datagram. Fails with `InvalidState` for a
    /// callback-mode connection.
    pub fn recv(&self) -> Result<Datagram> {
        self.mailbox.pop_blocking()
    }

    pub fn try_recv(&self) -> Option<Datagram> {
        self.mailbox.try_pop()
    }

    pub fn pending(&self) -> usize {
        self.mailbox.pending()
    }

    pub fn dropped(&self) -> u32 {
        self.dropped.get()
    }

    pub fn send(&self, payload: &[u8]) -> Result<()> {
        let instance = self.owner.upgrade().ok_or(NetError::StackGone)?;
        instance.send_to(self.local_port, self.remote, payload)
    }
}

impl Drop for UniConn {
    fn drop(&mut self) {
        if let Some(instance) = self.owner.upgrade() {
            instance.manager().prune(&self.key());
        }
    }
}

/// Connection accepting datagrams from any endpoint on its local port.
///
/// It only receives once registered with a `Manager`.
pub struct MultiConn {
    protocol: u8,
    local_port: u16,
    mailbox: Mailbox,
    owner: InstanceWeak,
    dropped: PerfCounter,
}

impl MultiConn {
    pub fn new(protocol: u8, local_port: u16, delivery: Delivery) -> Self {
        MultiConn {
            protocol,
            local_port,
            mailbox: Mailbox::new(delivery),
            owner: InstanceWeak::default(),
            dropped: PerfCounter::new(),
        }
    }

    pub(crate) fn with_owner(mut self, owner: InstanceWeak) -> Self {
        self.owner = owner;
        self
    }

    pub fn key(&self) -> EndpointKey {
        EndpointKey::catch_all(self.protocol, self.local_port)
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn deliver(&self, datagram: Datagram) -> DeliverStatus {
        if datagram.destination.protocol != self.protocol || datagram.destination.port != self.local_port {
            return DeliverStatus::Rejected;
        }

        self.mailbox.push(datagram, &self.dropped)
    }

    pub fn recv(&self) -> Result<Datagram> {
        self.mailbox.pop_blocking()
    }

    pub fn try_recv(&self) -> Option<Datagram> {
        self.mailbox.try_pop()
    }

    pub fn pending(&self) -> usize {
        self.mailbox.pending()
    }

    pub fn dropped(&self) -> u32 {
        self.dropped.get()
    }

    /// Since a multi connection has no fixed peer, the destination is given
    /// for every send.
    pub fn send_to(&self, dest: Endpoint, payload: &[u8]) -> Result<()> {
        let instance = self.owner.upgrade().ok_or(NetError::StackGone)?;
        instance.send_to(self.local_port, dest, payload)
    }

    /// Answer the sender of `datagram` through the interface it arrived on.
    pub fn reply(&self, datagram: &Datagram, payload: &[u8]) -> Result<()> {
        let instance = self.owner.upgrade().ok_or(NetError::StackGone)?;
        let interface = datagram
            .interface
            .upgrade()
            .ok_or_else(|| NetError::NoSuchInterface(datagram.packet.interface()))?;
        instance.send_via(&interface, self.local_port, datagram.source, payload)
    }
}

impl Drop for MultiConn {
    fn drop(&mut self) {
        if let Some(instance) = self.owner.upgrade() {
            instance.manager().prune(&self.key());
        }
    }
}

/// Either kind of connection, as held by the manager's callers.
#[derive(Clone)]
pub enum Connection {
    Uni(Arc<UniConn>),
    Multi(Arc<MultiConn>),
}

impl Connection {
    pub fn key(&self) -> EndpointKey {
        match self {
            Connection::Uni(conn) => conn.key(),
            Connection::Multi(conn) => conn.key(),
        }
    }

    pub fn deliver(&self, datagram: Datagram) -> DeliverStatus {
        match self {
            Connection::Uni(conn) => conn.deliver(datagram),
            Connection::Multi(conn) => conn.deliver(datagram),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Connection::Uni(conn) => write!(f, "UniConn({})", conn.key()),
            Connection::Multi(conn) => write!(f, "MultiConn({})", conn.key()),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;
    use crate::buf::PacketBuffer;
    use crate::format::{FormatterChain, LinkKind};
    use crate::netif::InterfaceId;
    use crate::packet::Builder;

    pub fn datagram(source: Endpoint, destination: Endpoint, payload: &[u8]) -> Datagram {
        let chain = FormatterChain::for_kind(LinkKind::Ip);
        let buffer = PacketBuffer::new(2048, chain.header_len());
        let mut builder = Builder::with_buffer(chain, buffer, 1472, InterfaceId(0));
        builder.set_source(source.address, source.port).unwrap();
        builder.set_destination(destination).unwrap();
        builder.write(payload).unwrap();
        Datagram {
            source,
            destination,
            interface: InterfaceWeak::default(),
            packet: builder.finalize().unwrap(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_util::datagram;
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ep(addr: [u8; 4], port: u16) -> Endpoint {
        Endpoint::udp(IPv4Addr::new(addr[0], addr[1], addr[2], addr[3]), port)
    }

    #[test]
    fn test_uni_accepts_only_remote() {
        let conn = UniConn::new(9000, ep([10, 0, 0, 2], 9000), Delivery::Queue(4));
        let local = ep([10, 0, 0, 1], 9000);
        assert_eq!(
            conn.deliver(datagram(ep([10, 0, 0, 2], 9000), local, b"hi")),
            DeliverStatus::Delivered
        );
        assert_eq!(
            conn.deliver(datagram(ep([10, 0, 0, 3], 9000), local, b"no")),
            DeliverStatus::Rejected
        );
        assert_eq!(
            conn.deliver(datagram(ep([10, 0, 0, 2], 9001), local, b"no")),
            DeliverStatus::Rejected
        );

        assert_eq!(conn.pending(), 1);
        assert_eq!(conn.recv().unwrap().payload(), b"hi");
        assert!(conn.try_recv().is_none());
    }

    #[test]
    fn test_queue_full_drops() {
        let conn = MultiConn::new(PROTO_UDP, 53, Delivery::Queue(1));
        let local = ep([10, 0, 0, 1], 53);
        assert_eq!(
            conn.deliver(datagram(ep([10, 0, 0, 2], 1000), local, b"1")),
            DeliverStatus::Delivered
        );
        assert_eq!(
            conn.deliver(datagram(ep([10, 0, 0, 3], 1000), local, b"2")),
            DeliverStatus::QueueFull
        );
        assert_eq!(conn.dropped(), 1);
        assert_eq!(conn.try_recv().unwrap().payload(), b"1");
    }

    #[test]
    fn test_callback_delivery() {
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let conn = MultiConn::new(
            PROTO_UDP,
            7,
            Delivery::callback(move |datagram| {
                assert_eq!(datagram.payload(), b"echo");
                count2.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let status = conn.deliver(datagram(ep([10, 0, 0, 2], 1000), ep([10, 0, 0, 1], 7), b"echo"));
        assert_eq!(status, DeliverStatus::Delivered);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(conn.recv().unwrap_err(), NetError::InvalidState);
    }

    #[test]
    fn test_multi_wrong_port() {
        let conn = MultiConn::new(PROTO_UDP, 7, Delivery::Queue(4));
        assert_eq!(
            conn.deliver(datagram(ep([10, 0, 0, 2], 1000), ep([10, 0, 0, 1], 8), b"x")),
            DeliverStatus::Rejected
        );
    }

    #[test]
    fn test_send_without_stack() {
        let conn = UniConn::new(9000, ep([10, 0, 0, 2], 9000), Delivery::Queue(4));
        assert_eq!(conn.send(b"lost").unwrap_err(), NetError::StackGone);
    }

    #[test]
    fn test_display() {
        let remote = ep([10, 0, 0, 2], 9000);
        assert_eq!(remote.to_string(), "10.0.0.2:9000/udp");
        assert_eq!(
            EndpointKey::exact(80, remote).to_string(),
            "udp port 80 <- 10.0.0.2:9000"
        );
        assert_eq!(EndpointKey::catch_all(PROTO_UDP, 80).to_string(), "udp port 80 <- *");
    }
}

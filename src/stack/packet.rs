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

use crate::buf::PacketBuffer;
use crate::conn::Endpoint;
use crate::error::{NetError, Result};
use crate::format::{FormatterChain, HeaderFields, LinkKind, ParsedHeader};
use crate::netif::{Interface, InterfaceId};
use crate::util::{HwAddr, IPv4Addr};
use std::fmt;
use std::sync::atomic::{AtomicU16, Ordering};

pub const DEFAULT_TTL: u8 = 64;

static NEXT_PACKET_ID: AtomicU16 = AtomicU16::new(0);

/// A finalized packet: the wire bytes, the header fields they encode, and
/// where the payload sits. Read-only once created.
pub struct Packet {
    buffer: PacketBuffer,
    interface: InterfaceId,
    fields: HeaderFields,
    payload_offset: usize,
    payload_len: usize,
}

impl Packet {
    pub(crate) fn received(buffer: PacketBuffer, interface: InterfaceId, parsed: ParsedHeader) -> Self {
        Packet {
            buffer,
            interface,
            fields: parsed.fields,
            payload_offset: parsed.payload_offset,
            payload_len: parsed.payload_len,
        }
    }

    /// Complete frame as it appears on the wire.
    pub fn bytes(&self) -> &[u8] {
        self.buffer.header()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn payload(&self) -> &[u8] {
        &self.buffer.header()[self.payload_offset..self.payload_offset + self.payload_len]
    }

    pub fn fields(&self) -> &HeaderFields {
        &self.fields
    }

    pub fn interface(&self) -> InterfaceId {
        self.interface
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Packet")
            .field("interface", &self.interface)
            .field("len", &self.len())
            .field("payload_len", &self.payload_len)
            .field("fields", &self.fields)
            .finish()
    }
}

/// Assembles one outgoing packet.
///
/// The payload is appended first, into a buffer that already reserves
/// headroom for every layer of the chain. `finalize` then has each layer
/// prepend its header, filling in lengths and checksums over the final
/// contents. Exceeding the payload limit aborts the build and releases the
/// buffer; any further call on the builder fails with `InvalidState`.
pub struct Builder {
    buffer: Option<PacketBuffer>,
    chain: FormatterChain,
    fields: HeaderFields,
    payload_limit: usize,
    interface: InterfaceId,
}

impl Builder {
    /// Start a packet for `interface`, framed for `kind`. Source addresses
    /// come from the interface's current configuration.
    pub fn new(interface: &Interface, kind: LinkKind) -> Result<Self> {
        let chain = FormatterChain::for_kind(kind);
        let buffer = interface.pool().alloc(chain.header_len())?;
        let payload_limit = interface
            .mtu()
            .saturating_sub(chain.header_len() - kind.header_len());
        let conf = interface.v4_configuration();

        let mut builder = Builder::with_buffer(chain, buffer, payload_limit, interface.id());
        builder.fields.src_ip = conf.address;
        builder.fields.src_hw = interface.hw_addr();
        Ok(builder)
    }

    /// Build into a caller-provided buffer. The buffer must be empty with at
    /// least `chain.header_len()` bytes of headroom.
    pub fn with_buffer(
        chain: FormatterChain,
        buffer: PacketBuffer,
        payload_limit: usize,
        interface: InterfaceId,
    ) -> Self {
        Builder {
            buffer: Some(buffer),
            chain,
            fields: HeaderFields {
                ttl: DEFAULT_TTL,
                ..HeaderFields::default()
            },
            payload_limit,
            interface,
        }
    }

    fn active(&mut self) -> Result<&mut PacketBuffer> {
        self.buffer.as_mut().ok_or(NetError::InvalidState)
    }

    pub fn set_destination(&mut self, dest: Endpoint) -> Result<()> {
        self.active()?;
        self.fields.protocol = dest.protocol;
        self.fields.dst_ip = dest.address;
        self.fields.dst_port = dest.port;
        Ok(())
    }

    pub fn set_source(&mut self, address: IPv4Addr, port: u16) -> Result<()> {
        self.active()?;
        self.fields.src_ip = address;
        self.fields.src_port = port;
        Ok(())
    }

    pub fn set_source_port(&mut self, port: u16) -> Result<()> {
        self.active()?;
        self.fields.src_port = port;
        Ok(())
    }

    pub fn set_hw_addrs(&mut self, src: HwAddr, dest: HwAddr) -> Result<()> {
        self.active()?;
        self.fields.src_hw = src;
        self.fields.dst_hw = dest;
        Ok(())
    }

    pub fn set_dest_hw(&mut self, dest: HwAddr) -> Result<()> {
        self.active()?;
        self.fields.dst_hw = dest;
        Ok(())
    }

    pub fn set_ttl(&mut self, ttl: u8) -> Result<()> {
        self.active()?;
        self.fields.ttl = ttl;
        Ok(())
    }

    /// Payload bytes written so far.
    pub fn len(&self) -> usize {
        self.buffer.as_ref().map_or(0, |buffer| buffer.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn remaining(&self) -> usize {
        self.payload_limit.saturating_sub(self.len())
    }

    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        let available = self.remaining();
        let buffer = self.active()?;
        if data.len() > available {
            self.buffer = None;
            return Err(NetError::CapacityExceeded {
                needed: data.len(),
                available,
            });
        }

        if let Err(err) = buffer.append_from_slice(data) {
            self.buffer = None;
            return Err(err);
        }

        Ok(())
    }

    pub fn write_be16(&mut self, value: u16) -> Result<()> {
        self.write(&value.to_be_bytes())
    }

    pub fn write_be32(&mut self, value: u32) -> Result<()> {
        self.write(&value.to_be_bytes())
    }

    /// Write all headers and produce the packet. The builder is spent
    /// afterwards, whether or not this succeeds.
    pub fn finalize(&mut self) -> Result<Packet> {
        let mut buffer = self.buffer.take().ok_or(NetError::InvalidState)?;
        self.fields.ident = NEXT_PACKET_ID.fetch_add(1, Ordering::AcqRel);

        let payload_len = buffer.len();
        let header_len = self.chain.write_headers(&mut buffer, &self.fields)?;
        Ok(Packet {
            buffer,
            interface: self.interface,
            fields: self.fields,
            payload_offset: header_len,
            payload_len,
        })
    }
}

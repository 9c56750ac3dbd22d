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

// Header formatters. Each Formatter handles one protocol layer. A chain is
// ordered outermost first: reading walks it front to back, each layer
// consuming its header and narrowing the slice handed to the next one;
// writing walks it back to front, each layer prepending its header to what
// the inner layers produced so length and checksum fields cover the final
// contents.

use crate::buf::PacketBuffer;
use crate::error::{NetError, ParseError, Result};
use crate::util::{self, HwAddr, IPv4Addr};
use std::fmt;
use std::sync::Arc;

pub const PROTO_UDP: u8 = 17;
pub const ETHERTYPE_IPV4: u16 = 0x0800;

const ETH_HEADER_LEN: usize = 14;
const IPV4_BASE_HEADER_LEN: usize = 20;
const UDP_HEADER_LEN: usize = 8;

/// Every header field the supported layers read or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeaderFields {
    pub src_hw: HwAddr,
    pub dst_hw: HwAddr,
    pub src_ip: IPv4Addr,
    pub dst_ip: IPv4Addr,
    pub protocol: u8,
    pub ttl: u8,
    pub ident: u16,
    pub src_port: u16,
    pub dst_port: u16,
}

/// Result of running a whole chain over a received frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedHeader {
    pub fields: HeaderFields,
    pub payload_offset: usize,
    pub payload_len: usize,
}

/// What one layer consumed: its own header, and how much of the rest
/// belongs to it (anything beyond is trailing padding).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerSpan {
    pub header_len: usize,
    pub payload_len: usize,
}

pub trait Formatter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Bytes of headroom this layer needs when writing.
    fn header_len(&self) -> usize;

    /// Prepend this layer's header to `buffer`, which currently holds the
    /// layer's payload. Returns the header length.
    fn write_header(&self, buffer: &mut PacketBuffer, fields: &HeaderFields) -> Result<usize>;

    /// Decode the header at the front of `bytes`, recording what it carries
    /// in `fields`.
    fn read_header(&self, bytes: &[u8], fields: &mut HeaderFields) -> Result<LayerSpan>;
}

fn check_len(bytes: &[u8], needed: usize) -> Result<()> {
    if bytes.len() < needed {
        return Err(ParseError::Truncated {
            needed,
            available: bytes.len(),
        }
        .into());
    }

    Ok(())
}

//    0               1               2               3
//    +-------------------------------+-------------------------------+
//  0 |                    Destination Address                        |
//    +-------------------------------+                               +
//  4 |                               |         Source Address        |
//    +-------------------------------+                               +
//  8 |                                                               |
//    +-------------------------------+-------------------------------+
// 12 |          EtherType            |
//    +-------------------------------+

pub struct EthernetFormatter;

impl Formatter for EthernetFormatter {
    fn name(&self) -> &'static str {
        "ethernet"
    }

    fn header_len(&self) -> usize {
        ETH_HEADER_LEN
    }

    fn write_header(&self, buffer: &mut PacketBuffer, fields: &HeaderFields) -> Result<usize> {
        buffer.alloc_header(ETH_HEADER_LEN)?;
        let header = buffer.header_mut();
        fields.dst_hw.copy_to(&mut header[0..6]);
        fields.src_hw.copy_to(&mut header[6..12]);
        util::set_be16(&mut header[12..14], ETHERTYPE_IPV4);
        Ok(ETH_HEADER_LEN)
    }

    fn read_header(&self, bytes: &[u8], fields: &mut HeaderFields) -> Result<LayerSpan> {
        check_len(bytes, ETH_HEADER_LEN)?;
        let ether_type = util::get_be16(&bytes[12..14]);
        if ether_type != ETHERTYPE_IPV4 {
            return Err(ParseError::UnsupportedProtocol(ether_type).into());
        }

        fields.dst_hw = HwAddr::new_from(&bytes[0..6]);
        fields.src_hw = HwAddr::new_from(&bytes[6..12]);
        Ok(LayerSpan {
            header_len: ETH_HEADER_LEN,
            payload_len: bytes.len() - ETH_HEADER_LEN,
        })
    }
}

// Internet Protocol as described in RFC 791
//
//    0               1               2               3
//    +-------+-------+---------------+-------------------------------+
//  0 |Version|  IHL  |Type of Service|          Total Length         |
//    +-------+-------+---------------+-----+-------------------------+
//  4 |         Identification        |Flags|      Fragment Offset    |
//    +---------------+---------------+-----+-------------------------+
//  8 |  Time to Live |    Protocol   |         Header Checksum       |
//    +---------------+---------------+-------------------------------+
// 12 |                       Source Address                          |
//    +---------------------------------------------------------------+
// 16 |                    Destination Address                        |
//    +-----------------------------------------------+---------------+
// 20 |                    Options                    |    Padding    |
//    +-----------------------------------------------+---------------+

pub struct Ipv4Formatter;

impl Formatter for Ipv4Formatter {
    fn name(&self) -> &'static str {
        "ipv4"
    }

    fn header_len(&self) -> usize {
        IPV4_BASE_HEADER_LEN
    }

    fn write_header(&self, buffer: &mut PacketBuffer, fields: &HeaderFields) -> Result<usize> {
        let total_len = buffer.len() + IPV4_BASE_HEADER_LEN;
        if total_len > 0xffff {
            return Err(NetError::CapacityExceeded {
                needed: total_len,
                available: 0xffff,
            });
        }

        buffer.alloc_header(IPV4_BASE_HEADER_LEN)?;
        let header = buffer.header_mut();
        header[0] = 0x45; // Version/IHL
        util::set_be16(&mut header[2..4], total_len as u16);
        util::set_be16(&mut header[4..6], fields.ident);
        header[8] = fields.ttl;
        header[9] = fields.protocol;
        fields.src_ip.copy_to(&mut header[12..16]);
        fields.dst_ip.copy_to(&mut header[16..20]);

        let checksum = util::compute_checksum(&header[..IPV4_BASE_HEADER_LEN]);
        util::set_be16(&mut header[10..12], checksum);
        Ok(IPV4_BASE_HEADER_LEN)
    }

    fn read_header(&self, bytes: &[u8], fields: &mut HeaderFields) -> Result<LayerSpan> {
        check_len(bytes, IPV4_BASE_HEADER_LEN)?;
        let version = bytes[0] >> 4;
        if version != 4 {
            return Err(ParseError::UnsupportedVersion(version).into());
        }

        // Options are skipped, not decoded.
        let header_len = ((bytes[0] & 0xf) as usize) * 4;
        if header_len < IPV4_BASE_HEADER_LEN {
            return Err(ParseError::BadLength.into());
        }

        check_len(bytes, header_len)?;
        let total_len = util::get_be16(&bytes[2..4]) as usize;
        if total_len < header_len {
            return Err(ParseError::BadLength.into());
        }

        check_len(bytes, total_len)?;
        if util::compute_checksum(&bytes[..header_len]) != 0 {
            return Err(ParseError::BadChecksum.into());
        }

        // Reassembly is not supported
        if (util::get_be16(&bytes[6..8]) & 0x3fff) != 0 {
            return Err(ParseError::Fragmented.into());
        }

        fields.ident = util::get_be16(&bytes[4..6]);
        fields.ttl = bytes[8];
        fields.protocol = bytes[9];
        fields.src_ip = IPv4Addr::new_from(&bytes[12..16]);
        fields.dst_ip = IPv4Addr::new_from(&bytes[16..20]);
        Ok(LayerSpan {
            header_len,
            payload_len: total_len - header_len,
        })
    }
}

//    0               1               2               3
//    +-------------------------------+-------------------------------+
//  0 |         Source Port           |          Dest Port            |
//    +-------------------------------+-------------------------------+
//  4 |            Length             |           Checksum            |
//    +-------------------------------+-------------------------------+

pub struct UdpFormatter;

fn pseudo_header_sum(fields: &HeaderFields, length: u16) -> u16 {
    let mut pseudo = [0u8; 12];
    fields.src_ip.copy_to(&mut pseudo[0..4]);
    fields.dst_ip.copy_to(&mut pseudo[4..8]);
    pseudo[9] = PROTO_UDP;
    util::set_be16(&mut pseudo[10..12], length);
    util::compute_ones_comp(0, &pseudo)
}

impl Formatter for UdpFormatter {
    fn name(&self) -> &'static str {
        "udp"
    }

    fn header_len(&self) -> usize {
        UDP_HEADER_LEN
    }

    fn write_header(&self, buffer: &mut PacketBuffer, fields: &HeaderFields) -> Result<usize> {
        let length = buffer.len() + UDP_HEADER_LEN;
        if length > 0xffff {
            return Err(NetError::CapacityExceeded {
                needed: length,
                available: 0xffff,
            });
        }

        buffer.alloc_header(UDP_HEADER_LEN)?;
        let header = buffer.header_mut();
        util::set_be16(&mut header[0..2], fields.src_port);
        util::set_be16(&mut header[2..4], fields.dst_port);
        util::set_be16(&mut header[4..6], length as u16);

        let sum = util::compute_ones_comp(pseudo_header_sum(fields, length as u16), header);
        let checksum = match 0xffff ^ sum {
            0 => 0xffff, // Zero means "no checksum"
            value => value,
        };

        util::set_be16(&mut header[6..8], checksum);
        Ok(UDP_HEADER_LEN)
    }

    fn read_header(&self, bytes: &[u8], fields: &mut HeaderFields) -> Result<LayerSpan> {
        if fields.protocol != PROTO_UDP {
            return Err(ParseError::UnsupportedProtocol(fields.protocol as u16).into());
        }

        check_len(bytes, UDP_HEADER_LEN)?;
        let length = util::get_be16(&bytes[4..6]) as usize;
        if length < UDP_HEADER_LEN {
            return Err(ParseError::BadLength.into());
        }

        check_len(bytes, length)?;
        if util::get_be16(&bytes[6..8]) != 0 {
            let sum = util::compute_ones_comp(pseudo_header_sum(fields, length as u16), &bytes[..length]);
            if sum != 0xffff {
                return Err(ParseError::BadChecksum.into());
            }
        }

        fields.src_port = util::get_be16(&bytes[0..2]);
        fields.dst_port = util::get_be16(&bytes[2..4]);
        Ok(LayerSpan {
            header_len: UDP_HEADER_LEN,
            payload_len: length - UDP_HEADER_LEN,
        })
    }
}

/// Framing used on an interface's link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkKind {
    /// Ethernet II frames carrying IPv4.
    Ethernet,
    /// Bare IPv4 packets, as on a TUN device or point-to-point link.
    Ip,
}

impl LinkKind {
    /// Size of the link layer header in front of the IPv4 packet.
    pub fn header_len(&self) -> usize {
        match self {
            LinkKind::Ethernet => ETH_HEADER_LEN,
            LinkKind::Ip => 0,
        }
    }
}

/// Ordered set of formatters, outermost layer first.
#[derive(Clone)]
pub struct FormatterChain {
    layers: Vec<Arc<dyn Formatter>>,
}

impl FormatterChain {
    pub fn new(layers: Vec<Arc<dyn Formatter>>) -> Self {
        FormatterChain { layers }
    }

    pub fn for_kind(kind: LinkKind) -> Self {
        match kind {
            LinkKind::Ethernet => FormatterChain::new(vec![
                Arc::new(EthernetFormatter),
                Arc::new(Ipv4Formatter),
                Arc::new(UdpFormatter),
            ]),
            LinkKind::Ip => FormatterChain::new(vec![Arc::new(Ipv4Formatter), Arc::new(UdpFormatter)]),
        }
    }

    /// Total headroom needed to write every layer.
    pub fn header_len(&self) -> usize {
        self.layers.iter().map(|layer| layer.header_len()).sum()
    }

    pub fn write_headers(&self, buffer: &mut PacketBuffer, fields: &HeaderFields) -> Result<usize> {
        let mut written = 0;
        for layer in self.layers.iter().rev() {
            written += layer.write_header(buffer, fields)?;
        }

        Ok(written)
    }

    pub fn read_headers(&self, bytes: &[u8]) -> Result<ParsedHeader> {
        let mut fields = HeaderFields::default();
        let mut offset = 0;
        let mut len = bytes.len();
        for layer in &self.layers {
            let span = layer.read_header(&bytes[offset..offset + len], &mut fields)?;
            offset += span.header_len;
            len = span.payload_len;
        }

        Ok(ParsedHeader {
            fields,
            payload_offset: offset,
            payload_len: len,
        })
    }
}

impl fmt::Debug for FormatterChain {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list()
            .entries(self.layers.iter().map(|layer| layer.name()))
            .finish()
    }
}

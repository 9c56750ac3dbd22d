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

use crate::conn::{Endpoint, EndpointKey};
use crate::netif::InterfaceId;
use thiserror::Error;

/// Why a received header could not be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("truncated header: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
    #[error("inconsistent length field")]
    BadLength,
    #[error("unsupported version {0}")]
    UnsupportedVersion(u8),
    #[error("unsupported protocol {0:#06x}")]
    UnsupportedProtocol(u16),
    #[error("checksum mismatch")]
    BadChecksum,
    #[error("fragmented packet")]
    Fragmented,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetError {
    #[error("packet capacity exceeded: need {needed} bytes, {available} available")]
    CapacityExceeded { needed: usize, available: usize },
    #[error("packet builder already finalized or aborted")]
    InvalidState,
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(&'static str),
    #[error("transmit queue full on interface {0}")]
    BackpressureFull(InterfaceId),
    #[error("endpoint {0} already registered")]
    DuplicateEndpoint(EndpointKey),
    #[error("no route or connection for {0}")]
    Unroutable(Endpoint),
    #[error("no such interface {0}")]
    NoSuchInterface(InterfaceId),
    #[error("network stack instance has been dropped")]
    StackGone,
    #[error("packet buffer pool exhausted")]
    BuffersExhausted,
}

pub type Result<T> = std::result::Result<T, NetError>;

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

//! A small UDP/IPv4 network stack for environments without an operating
//! system scheduler. Everything shared is guarded by spin locks that yield
//! to a cooperative runtime when one has been registered with
//! `sync::register_runtime`.

pub mod buf;
pub mod conn;
pub mod error;
pub mod format;
pub mod instance;
pub mod manager;
pub mod netif;
pub mod packet;
pub mod sync;
pub mod util;

pub use conn::{Connection, Datagram, DeliverStatus, Delivery, Endpoint, EndpointKey, MultiConn, UniConn};
pub use error::{NetError, ParseError, Result};
pub use format::LinkKind;
pub use instance::{global, Instance, InstanceWeak, StackConfig};
pub use manager::{DispatchPolicy, Manager};
pub use netif::{Device, Interface, InterfaceId, InterfaceWeak, V4Configuration};
pub use packet::{Builder, Packet};
pub use util::{HwAddr, IPv4Addr};

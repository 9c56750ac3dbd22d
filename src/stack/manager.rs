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

// Demultiplexing of received datagrams to registered connections.
//
// The table only holds weak references. Whoever opened a connection owns
// it, and once the last owning handle is gone the entry can no longer be
// upgraded, so nothing is ever delivered to a dropped connection. Dispatch
// upgrades under the lock and delivers after releasing it; a connection
// unregistered meanwhile still receives that one in-flight datagram.

use crate::conn::{Connection, Datagram, DeliverStatus, Endpoint, EndpointKey, MultiConn, UniConn};
use crate::error::{NetError, Result};
use crate::sync::SpinMutex;
use std::collections::HashMap;
use std::sync::Weak;

/// Which connection wins when a datagram matches both a UniConn and the
/// catch-all MultiConn on the same local port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchPolicy {
    ExactFirst,
    CatchAllFirst,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        DispatchPolicy::ExactFirst
    }
}

#[derive(Default)]
struct ConnTable {
    exact: HashMap<EndpointKey, Weak<UniConn>>,
    catch_all: HashMap<(u8, u16), Weak<MultiConn>>,
}

impl ConnTable {
    fn exact_conn(&mut self, key: &EndpointKey) -> Option<Connection> {
        let conn = self.exact.get(key)?.upgrade();
        if conn.is_none() {
            self.exact.remove(key);
        }

        conn.map(Connection::Uni)
    }

    fn catch_all_conn(&mut self, protocol: u8, port: u16) -> Option<Connection> {
        let conn = self.catch_all.get(&(protocol, port))?.upgrade();
        if conn.is_none() {
            self.catch_all.remove(&(protocol, port));
        }

        conn.map(Connection::Multi)
    }

    // Liveness checks go through the strong count. Upgrading here could
    // leave this table holding the last reference, and its drop would then
    // re-enter the manager while the lock is held.
    fn has_exact(&mut self, key: &EndpointKey) -> bool {
        let live = match self.exact.get(key) {
            Some(conn) => conn.strong_count() > 0,
            None => return false,
        };

        if !live {
            self.exact.remove(key);
        }

        live
    }

    fn has_catch_all(&mut self, protocol: u8, port: u16) -> bool {
        let live = match self.catch_all.get(&(protocol, port)) {
            Some(conn) => conn.strong_count() > 0,
            None => return false,
        };

        if !live {
            self.catch_all.remove(&(protocol, port));
        }

        live
    }
}

pub struct Manager {
    table: SpinMutex<ConnTable>,
    policy: DispatchPolicy,
}

impl Manager {
    pub fn new(policy: DispatchPolicy) -> Self {
        Manager {
            table: SpinMutex::new(ConnTable::default()),
            policy,
        }
    }

    pub fn policy(&self) -> DispatchPolicy {
        self.policy
    }

    /// Add a connection under `key`, which must be the connection's own key.
    /// An entry whose connection has already been dropped is replaced.
    pub fn register(&self, key: EndpointKey, conn: &Connection) -> Result<()> {
        if conn.key() != key {
            return Err(NetError::InvalidConfiguration(
                "endpoint key does not match the connection",
            ));
        }

        let mut table = self.table.lock();
        match conn {
            Connection::Uni(uni) => {
                if table.has_exact(&key) {
                    return Err(NetError::DuplicateEndpoint(key));
                }

                table.exact.insert(key, std::sync::Arc::downgrade(uni));
            }
            Connection::Multi(multi) => {
                if table.has_catch_all(key.protocol, key.local_port) {
                    return Err(NetError::DuplicateEndpoint(key));
                }

                table
                    .catch_all
                    .insert((key.protocol, key.local_port), std::sync::Arc::downgrade(multi));
            }
        }

        drop(table);
        tracing::debug!(%key, "connection registered");
        Ok(())
    }

    /// Remove the mapping for `key`. Returns false if nothing was registered.
    pub fn unregister(&self, key: &EndpointKey) -> bool {
        let mut table = self.table.lock();
        let removed = match key.remote {
            Some(_) => table.exact.remove(key).is_some(),
            None => table.catch_all.remove(&(key.protocol, key.local_port)).is_some(),
        };

        drop(table);
        if removed {
            tracing::debug!(%key, "connection unregistered");
        }

        removed
    }

    /// Drop the entry for `key` only if its connection no longer exists.
    pub(crate) fn prune(&self, key: &EndpointKey) {
        let mut table = self.table.lock();
        match key.remote {
            Some(_) => {
                table.has_exact(key);
            }
            None => {
                table.has_catch_all(key.protocol, key.local_port);
            }
        }
    }

    pub fn lookup(&self, key: &EndpointKey) -> Option<Connection> {
        let mut table = self.table.lock();
        match key.remote {
            Some(_) => table.exact_conn(key),
            None => table.catch_all_conn(key.protocol, key.local_port),
        }
    }

    pub fn is_registered(&self, key: &EndpointKey) -> bool {
        let mut table = self.table.lock();
        match key.remote {
            Some(_) => table.has_exact(key),
            None => table.has_catch_all(key.protocol, key.local_port),
        }
    }

    /// Live registrations
    pub fn len(&self) -> usize {
        let table = self.table.lock();
        table.exact.values().filter(|conn| conn.strong_count() > 0).count()
            + table.catch_all.values().filter(|conn| conn.strong_count() > 0).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn resolve(&self, source: &Endpoint, destination: &Endpoint) -> Option<Connection> {
        let exact_key = EndpointKey::exact(destination.port, *source);
        let mut table = self.table.lock();
        match self.policy {
            DispatchPolicy::ExactFirst => table
                .exact_conn(&exact_key)
                .or_else(|| table.catch_all_conn(destination.protocol, destination.port)),
            DispatchPolicy::CatchAllFirst => table
                .catch_all_conn(destination.protocol, destination.port)
                .or_else(|| table.exact_conn(&exact_key)),
        }
    }

    /// Hand `datagram` to the connection it is addressed to. Fails with
    /// `Unroutable` when no live connection matches; the datagram is dropped.
    pub fn dispatch(&self, datagram: Datagram) -> Result<DeliverStatus> {
        let destination = datagram.destination;
        let conn = match self.resolve(&datagram.source, &destination) {
            Some(conn) => conn,
            None => return Err(NetError::Unroutable(destination)),
        };

        let status = conn.deliver(datagram);
        if status == DeliverStatus::QueueFull {
            tracing::debug!(?conn, "connection queue full, datagram dropped");
        }

        Ok(status)
    }
}

impl Default for Manager {
    fn default() -> Self {
        Manager::new(DispatchPolicy::default())
    }
}

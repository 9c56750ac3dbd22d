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

// Two hosts joined by an in-memory wire. The server echoes every datagram
// it receives on port 8000 back to the sender from a separate thread that
// blocks in recv(); the main thread plays the driver for both ends.

use std::collections::VecDeque;
use std::thread;
use tracing_subscriber::EnvFilter;
use uninet::{Device, Endpoint, HwAddr, Instance, Interface, LinkKind, StackConfig, V4Configuration};

const ECHO_PORT: u16 = 8000;
const MESSAGE_COUNT: usize = 8;
const WIRE_DEPTH: usize = 16;
const MAX_POLLS: usize = 100_000;

#[derive(Default)]
struct Wire {
    frames: VecDeque<Vec<u8>>,
}

impl Device for Wire {
    fn transmit(&mut self, frame: &[u8]) -> bool {
        if self.frames.len() >= WIRE_DEPTH {
            return false;
        }

        self.frames.push_back(frame.to_vec());
        true
    }
}

// Move everything queued for transmit on `from` into `to`.
fn carry(from: &Interface, to: &Interface, wire: &mut Wire) {
    loop {
        let sent = from.flush(wire);
        while let Some(frame) = wire.frames.pop_front() {
            if let Err(err) = to.on_frame(&frame) {
                tracing::warn!(interface = %to.id(), error = %err, "frame dropped");
            }
        }

        if sent == 0 {
            break;
        }
    }
}

fn host(name: &str, address: &str, hw_addr: HwAddr) -> uninet::Result<(Instance, Interface)> {
    let instance = Instance::new(StackConfig::default());
    let interface = instance.create_interface(name, LinkKind::Ethernet, hw_addr)?;
    interface.set_v4_configuration(V4Configuration::parse(address, "255.255.255.0", "0.0.0.0")?)?;
    Ok((instance, interface))
}

fn run() -> uninet::Result<()> {
    let (server, server_intf) = host("server0", "10.0.0.1", HwAddr::new([2, 0, 0, 0, 0, 1]))?;
    let (client, client_intf) = host("client0", "10.0.0.2", HwAddr::new([2, 0, 0, 0, 0, 2]))?;

    let socket = server.open_multi(ECHO_PORT)?;
    let echo_thread = thread::spawn(move || {
        for _ in 0..MESSAGE_COUNT {
            let datagram = match socket.recv() {
                Ok(datagram) => datagram,
                Err(err) => {
                    tracing::error!(error = %err, "receive failed");
                    return;
                }
            };

            tracing::info!(from = %datagram.source, len = datagram.payload().len(), "echoing");
            if let Err(err) = socket.reply(&datagram, datagram.payload()) {
                tracing::warn!(error = %err, "reply failed");
            }
        }
    });

    let conn = client.open_uni(0, Endpoint::udp(server_intf.v4_configuration().address, ECHO_PORT))?;
    let mut wire = Wire::default();
    for index in 0..MESSAGE_COUNT {
        let message = format!("message {}", index);
        conn.send(message.as_bytes())?;

        let mut reply = None;
        for _ in 0..MAX_POLLS {
            carry(&client_intf, &server_intf, &mut wire);
            carry(&server_intf, &client_intf, &mut wire);
            reply = conn.try_recv();
            if reply.is_some() {
                break;
            }

            thread::yield_now();
        }

        match reply {
            Some(datagram) => tracing::info!(
                from = %datagram.source,
                payload = %String::from_utf8_lossy(datagram.payload()),
                "got reply"
            ),
            None => tracing::warn!(index, "no reply"),
        }
    }

    if echo_thread.join().is_err() {
        tracing::error!("echo thread panicked");
    }

    server.log_stats();
    client.log_stats();
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    uninet::sync::register_runtime(thread::yield_now);
    if let Err(err) = run() {
        tracing::error!(error = %err, "udp echo failed");
        std::process::exit(1);
    }
}

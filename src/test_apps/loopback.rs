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

// A stack with a single IP-framed loopback interface. Everything sent is
// fed straight back into the receive path, which exercises routing, the
// builder, the parser and both connection kinds without any driver.

use tracing_subscriber::EnvFilter;
use uninet::{Delivery, Endpoint, HwAddr, Instance, Interface, LinkKind, StackConfig, V4Configuration};

const SERVICE_PORT: u16 = 7;
const CLIENT_PORT: u16 = 5000;
const CLOSED_PORT: u16 = 9;

// Play the driver: whatever was queued for transmit is received again.
fn drain(instance: &Instance, lo: &Interface) {
    while let Some(packet) = lo.dequeue() {
        if let Err(err) = instance.on_receive(lo.id(), packet.bytes()) {
            tracing::info!(error = %err, "loopback frame not delivered");
        }
    }
}

fn run() -> uninet::Result<()> {
    let instance = Instance::new(StackConfig::default());
    let lo = instance.create_interface("lo", LinkKind::Ip, HwAddr::default())?;
    lo.set_v4_configuration(V4Configuration::parse("127.0.0.1", "255.0.0.0", "0.0.0.0")?)?;
    let local = lo.v4_configuration().address;

    let _service = instance.open_multi_with(
        SERVICE_PORT,
        Delivery::callback(|datagram| {
            tracing::info!(
                from = %datagram.source,
                payload = %String::from_utf8_lossy(datagram.payload()),
                "service got datagram"
            );
        }),
    )?;

    let client = instance.open_uni(CLIENT_PORT, Endpoint::udp(local, SERVICE_PORT))?;
    for index in 0..4 {
        client.send(format!("hello {}", index).as_bytes())?;
    }

    instance.send(Endpoint::udp(local, CLOSED_PORT), b"nobody listens here")?;
    drain(&instance, &lo);

    // The service answers from its own port, which the client is bound to.
    instance.send_to(SERVICE_PORT, Endpoint::udp(local, CLIENT_PORT), b"welcome")?;
    drain(&instance, &lo);
    while let Some(datagram) = client.try_recv() {
        tracing::info!(
            from = %datagram.source,
            payload = %String::from_utf8_lossy(datagram.payload()),
            "client got datagram"
        );
    }

    instance.log_stats();
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(err) = run() {
        tracing::error!(error = %err, "loopback failed");
        std::process::exit(1);
    }
}

//! Echo server built on sluice.
//!
//! Run:
//! - cargo run -p sluice --example server
//! - cargo run -p sluice --example server -- 7777
//!
//! Set `RUST_LOG=sluice_peer=debug` to watch the network thread.

use std::{env, time::Duration};

use sluice::prelude::*;
use tracing_subscriber::EnvFilter;

const APP_IDENTIFIER: &str = "sluice echo";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let port: u16 = env::args().nth(1).and_then(|arg| arg.parse().ok()).unwrap_or(9000);
    let config = Config::builder(APP_IDENTIFIER)
        .port(port)
        .enable_message_type(MessageTypes::DISCOVERY_REQUEST)
        .enable_message_type(MessageTypes::CONNECTION_LATENCY_UPDATED)
        .build()?;
    let server = Server::new(config)?;
    server.start()?;
    println!("sluice echo server listening on {:?}", server.local_address());

    loop {
        let Some(mut message) = server.wait_message(Duration::from_millis(100)) else {
            continue;
        };
        match message.kind().clone() {
            IncomingMessageKind::StatusChanged { status, reason } => {
                let remote = message.connection().map(Connection::remote_address);
                println!("[status] {:?} {} {}", remote, status, reason);
            }
            IncomingMessageKind::DiscoveryRequest => {
                if let Some(sender) = message.sender() {
                    let mut answer = server.create_message();
                    answer.write_string(APP_IDENTIFIER);
                    server.send_discovery_response(answer, sender);
                }
            }
            IncomingMessageKind::ConnectionLatencyUpdated(rtt) => {
                println!("[latency] {:?}", rtt);
            }
            IncomingMessageKind::Data => {
                let text = message.read_string().unwrap_or_default();
                let method = message.delivery_method().unwrap_or(DeliveryMethod::ReliableOrdered);
                let channel = message.channel().unwrap_or(0);
                println!("[data] {:?} on channel {}: \"{}\"", method, channel, text);

                let mut echo = server.create_message();
                echo.write_string(&text);
                if let Some(sender) = message.connection() {
                    let result = server.send_message(echo, sender, method, channel);
                    if result != SendResult::Sent {
                        eprintln!("echo not sent: {:?}", result);
                    }
                }
            }
            other => println!("[{:?}]", other),
        }
        server.recycle(message);
    }
}

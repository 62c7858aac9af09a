//! Client that sends messages to the echo server and prints the replies.
//!
//! Run the server first:
//! - cargo run -p sluice --example server -- 7777
//!
//! Then run the client:
//! - cargo run -p sluice --example client -- 127.0.0.1:7777
//! - cargo run -p sluice --example client -- 127.0.0.1:7777 10 200
//!   (sends 10 messages, 200ms apart)

use std::{
    env,
    net::SocketAddr,
    time::{Duration, Instant},
};

use sluice::prelude::*;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    // Args: <server_addr> [count] [interval_ms]
    let mut args = env::args().skip(1);
    let server_address: SocketAddr = args.next().unwrap_or_else(|| "127.0.0.1:9000".to_string()).parse()?;
    let count: usize = args.next().and_then(|arg| arg.parse().ok()).unwrap_or(5);
    let interval = Duration::from_millis(args.next().and_then(|arg| arg.parse().ok()).unwrap_or(300));

    let client = Client::new(Config::builder("sluice echo").build()?)?;
    client.start()?;
    let mut hail = client.create_message();
    hail.write_string("hello");
    let connection = client.connect(server_address, Some(hail))?;
    println!("connecting from {:?} to {}", client.local_address(), server_address);

    let mut sent = 0;
    let mut next_send = Instant::now();
    while sent < count || Instant::now() < next_send + interval {
        if connection.status() == ConnectionStatus::Connected && sent < count && Instant::now() >= next_send {
            let mut message = client.create_message();
            message.write_string(&format!("message {}", sent));
            client.send_message(message, DeliveryMethod::ReliableOrdered, 0);
            sent += 1;
            next_send = Instant::now() + interval;
        }

        if let Some(mut message) = client.wait_message(Duration::from_millis(10)) {
            match message.kind().clone() {
                IncomingMessageKind::Data => println!("[reply] \"{}\"", message.read_string().unwrap_or_default()),
                IncomingMessageKind::StatusChanged { status, reason } => {
                    println!("[status] {} {}", status, reason);
                    if status == ConnectionStatus::Disconnected {
                        break;
                    }
                }
                other => println!("[{:?}]", other),
            }
            client.recycle(message);
        }
    }

    client.shutdown("done");
    println!("done");
    Ok(())
}

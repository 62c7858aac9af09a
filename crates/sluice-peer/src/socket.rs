use std::{
    io,
    net::{SocketAddr, UdpSocket},
    time::{Duration, Instant},
};

use rand::{rngs::StdRng, Rng, SeedableRng};
use sluice_core::{config::Config, error::Result, message_pool::MessagePool, transport::Socket};
use socket2::{Domain, Protocol, Socket as Socket2, Type};

/// Non-blocking UDP socket configured from a [`Config`].
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Binds `local_address:port` with the configured buffer sizes.
    ///
    /// IPv4 sockets are allowed to broadcast so local discovery works.
    pub fn bind(config: &Config) -> Result<Self> {
        let address = SocketAddr::new(config.local_address(), config.port());
        let socket = Socket2::new(Domain::for_address(address), Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_recv_buffer_size(config.receive_buffer_size())?;
        socket.set_send_buffer_size(config.send_buffer_size())?;
        if address.is_ipv4() {
            socket.set_broadcast(true)?;
        }
        socket.bind(&address.into())?;
        socket.set_nonblocking(true)?;
        Ok(Self { socket: socket.into() })
    }
}

impl Socket for UdpTransport {
    fn send_packet(&mut self, addr: &SocketAddr, payload: &[u8]) -> io::Result<usize> {
        self.socket.send_to(payload, addr)
    }

    fn receive_packet<'a>(&mut self, buffer: &'a mut [u8]) -> io::Result<(&'a [u8], SocketAddr)> {
        self.socket.recv_from(buffer).map(move |(len, address)| (&buffer[..len], address))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn is_blocking_mode(&self) -> bool {
        false
    }
}

#[derive(Debug)]
struct DelayedDatagram {
    due: Instant,
    address: SocketAddr,
    datagram: Vec<u8>,
}

/// Simulates a bad link on the sending side: loss, duplication and latency.
#[derive(Debug)]
pub struct LinkConditioner {
    rng: StdRng,
    loss: f64,
    duplicates: f64,
    minimum_latency: Duration,
    random_latency: Duration,
    delayed: Vec<DelayedDatagram>,
}

impl LinkConditioner {
    /// Creates a conditioner when the configuration simulates anything.
    pub fn from_config(config: &Config) -> Option<Self> {
        config.is_link_simulated().then(|| Self::with_rng(config, StdRng::from_os_rng()))
    }

    /// Creates a conditioner with a reproducible random sequence.
    pub fn with_seed(config: &Config, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: &Config, rng: StdRng) -> Self {
        Self {
            rng,
            loss: f64::from(config.simulated_loss()),
            duplicates: f64::from(config.simulated_duplicates_chance()),
            minimum_latency: config.simulated_minimum_latency(),
            random_latency: config.simulated_random_latency(),
            delayed: Vec::new(),
        }
    }

    /// Takes one outgoing datagram; it may be dropped, duplicated or delayed.
    pub fn submit(&mut self, address: SocketAddr, datagram: Vec<u8>, time: Instant, pool: &MessagePool) {
        if self.rng.random_bool(self.loss) {
            tracing::trace!("Simulated loss of {} bytes to {}", datagram.len(), address);
            pool.release(datagram);
            return;
        }
        if self.rng.random_bool(self.duplicates) {
            let due = time + self.latency();
            self.delayed.push(DelayedDatagram { due, address, datagram: datagram.clone() });
        }
        let due = time + self.latency();
        self.delayed.push(DelayedDatagram { due, address, datagram });
    }

    /// Moves every datagram whose delay has elapsed into `out`.
    pub fn take_due(&mut self, time: Instant, out: &mut Vec<(SocketAddr, Vec<u8>)>) {
        let mut index = 0;
        while index < self.delayed.len() {
            if self.delayed[index].due <= time {
                let DelayedDatagram { address, datagram, .. } = self.delayed.swap_remove(index);
                out.push((address, datagram));
            } else {
                index += 1;
            }
        }
    }

    /// Moves every held datagram into `out` regardless of its delay.
    pub fn take_all(&mut self, out: &mut Vec<(SocketAddr, Vec<u8>)>) {
        out.extend(self.delayed.drain(..).map(|d| (d.address, d.datagram)));
    }

    /// Number of datagrams waiting for their delay.
    pub fn pending(&self) -> usize {
        self.delayed.len()
    }

    fn latency(&mut self) -> Duration {
        if self.random_latency.is_zero() {
            return self.minimum_latency;
        }
        self.minimum_latency + self.random_latency.mul_f32(self.rng.random::<f32>())
    }
}

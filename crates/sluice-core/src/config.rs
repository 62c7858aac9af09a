use std::{
    net::{IpAddr, Ipv4Addr},
    time::Duration,
};

use crate::{
    constants::{DEFAULT_MTU, MAX_MESSAGE_SIZE, PROTOCOL_MAX_MTU},
    error::{ConfigError, Result},
    message_types::MessageTypes,
};

/// What to do with an unreliable message that does not fit in one MTU.
#[derive(Clone, Debug, Copy, PartialEq, Eq, Default)]
pub enum UnreliableSizeBehaviour {
    /// Send it as a single oversized datagram and let the IP layer fragment it.
    ///
    /// Messages whose bit length cannot be described by the 16-bit header field are
    /// still rejected as too large.
    #[default]
    IgnoreMtu,
    /// Split it into fragments like a reliable message.
    NormalFragmentation,
    /// Refuse to send it.
    DropAboveMtu,
}

/// Immutable configuration for a peer.
///
/// Built with [`Config::builder`]; a `Peer` takes ownership of it at construction so
/// nothing can change once the network thread runs.
#[derive(Clone, Debug)]
pub struct Config {
    app_identifier: String,
    local_address: IpAddr,
    port: u16,
    broadcast_address: IpAddr,
    accept_incoming_connections: bool,
    maximum_connections: usize,
    default_outgoing_message_capacity: usize,
    ping_interval: Duration,
    connection_timeout: Duration,
    use_message_recycling: bool,
    recycled_cache_max_count: usize,
    resend_handshake_interval: Duration,
    maximum_handshake_attempts: u32,
    send_buffer_size: usize,
    receive_buffer_size: usize,
    maximum_transmission_unit: usize,
    auto_expand_mtu: bool,
    expand_mtu_frequency: Duration,
    expand_mtu_fail_attempts: u32,
    maximum_message_size: usize,
    maximum_fragment_groups: usize,
    unreliable_size_behaviour: UnreliableSizeBehaviour,
    enable_upnp: bool,
    auto_flush_send_queue: bool,
    suppress_unreliable_unordered_acks: bool,
    network_thread_name: String,
    enabled_message_types: MessageTypes,
    use_checksums: bool,
    simulated_loss: f32,
    simulated_duplicates_chance: f32,
    simulated_minimum_latency: Duration,
    simulated_random_latency: Duration,
}

impl Config {
    /// Starts a builder with default settings for the given application identifier.
    ///
    /// Both ends of a connection must use the same identifier.
    pub fn builder(app_identifier: impl Into<String>) -> ConfigBuilder {
        ConfigBuilder {
            config: Config {
                app_identifier: app_identifier.into(),
                local_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                port: 0,
                broadcast_address: IpAddr::V4(Ipv4Addr::BROADCAST),
                accept_incoming_connections: false,
                maximum_connections: 32,
                default_outgoing_message_capacity: 16,
                ping_interval: Duration::from_secs(4),
                connection_timeout: Duration::from_secs(25),
                use_message_recycling: true,
                recycled_cache_max_count: 64,
                resend_handshake_interval: Duration::from_secs(3),
                maximum_handshake_attempts: 5,
                send_buffer_size: 131071,
                receive_buffer_size: 131071,
                maximum_transmission_unit: DEFAULT_MTU,
                auto_expand_mtu: false,
                expand_mtu_frequency: Duration::from_secs(2),
                expand_mtu_fail_attempts: 5,
                maximum_message_size: 1024 * 1024,
                maximum_fragment_groups: 16,
                unreliable_size_behaviour: UnreliableSizeBehaviour::IgnoreMtu,
                enable_upnp: false,
                auto_flush_send_queue: true,
                suppress_unreliable_unordered_acks: false,
                network_thread_name: "sluice".to_string(),
                enabled_message_types: MessageTypes::default(),
                use_checksums: false,
                simulated_loss: 0.0,
                simulated_duplicates_chance: 0.0,
                simulated_minimum_latency: Duration::ZERO,
                simulated_random_latency: Duration::ZERO,
            },
        }
    }

    /// Returns a builder seeded with this configuration.
    pub fn to_builder(&self) -> ConfigBuilder {
        ConfigBuilder { config: self.clone() }
    }

    /// Identifier both ends must agree on during the handshake.
    pub fn app_identifier(&self) -> &str {
        &self.app_identifier
    }

    /// Local address the socket binds to.
    pub fn local_address(&self) -> IpAddr {
        self.local_address
    }

    /// Local port; zero picks an ephemeral port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Address used by local discovery broadcasts.
    pub fn broadcast_address(&self) -> IpAddr {
        self.broadcast_address
    }

    /// Whether inbound connect requests are considered at all.
    pub fn accept_incoming_connections(&self) -> bool {
        self.accept_incoming_connections
    }

    /// Upper bound on connections plus pending handshakes.
    pub fn maximum_connections(&self) -> usize {
        self.maximum_connections
    }

    /// Initial byte capacity of messages from `create_message`.
    pub fn default_outgoing_message_capacity(&self) -> usize {
        self.default_outgoing_message_capacity
    }

    /// Interval between pings on an established connection.
    pub fn ping_interval(&self) -> Duration {
        self.ping_interval
    }

    /// Silence longer than this disconnects a connection.
    pub fn connection_timeout(&self) -> Duration {
        self.connection_timeout
    }

    /// Whether message buffers are returned to the pool.
    pub fn use_message_recycling(&self) -> bool {
        self.use_message_recycling
    }

    /// Maximum number of buffers kept in the pool.
    pub fn recycled_cache_max_count(&self) -> usize {
        self.recycled_cache_max_count
    }

    /// Interval between handshake retransmissions.
    pub fn resend_handshake_interval(&self) -> Duration {
        self.resend_handshake_interval
    }

    /// Handshake sends before giving up.
    pub fn maximum_handshake_attempts(&self) -> u32 {
        self.maximum_handshake_attempts
    }

    /// Socket send buffer size (SO_SNDBUF).
    pub fn send_buffer_size(&self) -> usize {
        self.send_buffer_size
    }

    /// Socket receive buffer size (SO_RCVBUF).
    pub fn receive_buffer_size(&self) -> usize {
        self.receive_buffer_size
    }

    /// Initial maximum datagram size in bytes.
    pub fn maximum_transmission_unit(&self) -> usize {
        self.maximum_transmission_unit
    }

    /// Whether connections probe for a larger MTU.
    pub fn auto_expand_mtu(&self) -> bool {
        self.auto_expand_mtu
    }

    /// Interval between MTU probes.
    pub fn expand_mtu_frequency(&self) -> Duration {
        self.expand_mtu_frequency
    }

    /// Failed probes tolerated before MTU expansion stops.
    pub fn expand_mtu_fail_attempts(&self) -> u32 {
        self.expand_mtu_fail_attempts
    }

    /// Largest application message in bytes, for both sending and reassembly.
    pub fn maximum_message_size(&self) -> usize {
        self.maximum_message_size
    }

    /// Fragment groups one connection may reassemble at the same time.
    pub fn maximum_fragment_groups(&self) -> usize {
        self.maximum_fragment_groups
    }

    /// Policy for unreliable messages larger than the MTU.
    pub fn unreliable_size_behaviour(&self) -> UnreliableSizeBehaviour {
        self.unreliable_size_behaviour
    }

    /// Whether UPnP port mapping was requested.
    pub fn enable_upnp(&self) -> bool {
        self.enable_upnp
    }

    /// Whether queued sends go out on the next network tick without an explicit flush.
    pub fn auto_flush_send_queue(&self) -> bool {
        self.auto_flush_send_queue
    }

    /// Whether plain unreliable messages go unacknowledged.
    pub fn suppress_unreliable_unordered_acks(&self) -> bool {
        self.suppress_unreliable_unordered_acks
    }

    /// Prefix of the network thread's name.
    pub fn network_thread_name(&self) -> &str {
        &self.network_thread_name
    }

    /// Kinds of incoming messages released to the application.
    pub fn enabled_message_types(&self) -> MessageTypes {
        self.enabled_message_types
    }

    /// Returns true if `kind` is released to the application.
    pub fn is_message_type_enabled(&self, kind: MessageTypes) -> bool {
        self.enabled_message_types.contains(kind)
    }

    /// Whether datagrams carry a CRC32 trailer.
    pub fn use_checksums(&self) -> bool {
        self.use_checksums
    }

    /// Probability an outgoing datagram is silently dropped.
    pub fn simulated_loss(&self) -> f32 {
        self.simulated_loss
    }

    /// Probability an outgoing datagram is sent twice.
    pub fn simulated_duplicates_chance(&self) -> f32 {
        self.simulated_duplicates_chance
    }

    /// Fixed delay added to every outgoing datagram.
    pub fn simulated_minimum_latency(&self) -> Duration {
        self.simulated_minimum_latency
    }

    /// Upper bound of the random delay added on top of the minimum latency.
    pub fn simulated_random_latency(&self) -> Duration {
        self.simulated_random_latency
    }

    /// Returns true if any link simulation is active.
    pub fn is_link_simulated(&self) -> bool {
        self.simulated_loss > 0.0
            || self.simulated_duplicates_chance > 0.0
            || !self.simulated_minimum_latency.is_zero()
            || !self.simulated_random_latency.is_zero()
    }
}

/// Chainable builder producing a validated [`Config`].
#[derive(Clone, Debug)]
pub struct ConfigBuilder {
    config: Config,
}

macro_rules! setter {
    ($(#[$doc:meta])* $name:ident: $ty:ty) => {
        $(#[$doc])*
        pub fn $name(mut self, value: $ty) -> Self {
            self.config.$name = value;
            self
        }
    };
}

impl ConfigBuilder {
    setter!(
        /// Sets the local bind address.
        local_address: IpAddr
    );
    setter!(
        /// Sets the local port; zero picks an ephemeral port.
        port: u16
    );
    setter!(
        /// Sets the discovery broadcast address.
        broadcast_address: IpAddr
    );
    setter!(
        /// Accepts or refuses inbound connect requests.
        accept_incoming_connections: bool
    );
    setter!(
        /// Caps connections plus pending handshakes.
        maximum_connections: usize
    );
    setter!(
        /// Sets the initial capacity of created messages.
        default_outgoing_message_capacity: usize
    );
    setter!(
        /// Sets the ping interval.
        ping_interval: Duration
    );
    setter!(
        /// Sets the silence timeout; must not be shorter than the ping interval.
        connection_timeout: Duration
    );
    setter!(
        /// Enables or disables buffer recycling.
        use_message_recycling: bool
    );
    setter!(
        /// Caps the number of pooled buffers.
        recycled_cache_max_count: usize
    );
    setter!(
        /// Sets the handshake retransmission interval.
        resend_handshake_interval: Duration
    );
    setter!(
        /// Sets how many handshake sends happen before giving up.
        maximum_handshake_attempts: u32
    );
    setter!(
        /// Sets SO_SNDBUF.
        send_buffer_size: usize
    );
    setter!(
        /// Sets SO_RCVBUF.
        receive_buffer_size: usize
    );
    setter!(
        /// Sets the initial MTU.
        maximum_transmission_unit: usize
    );
    setter!(
        /// Enables MTU expansion probes.
        auto_expand_mtu: bool
    );
    setter!(
        /// Sets the MTU probe interval.
        expand_mtu_frequency: Duration
    );
    setter!(
        /// Sets how many failed probes end MTU expansion.
        expand_mtu_fail_attempts: u32
    );
    setter!(
        /// Caps the size of one application message.
        maximum_message_size: usize
    );
    setter!(
        /// Caps concurrent fragment reassemblies per connection.
        maximum_fragment_groups: usize
    );
    setter!(
        /// Chooses the policy for unreliable messages above the MTU.
        unreliable_size_behaviour: UnreliableSizeBehaviour
    );
    setter!(
        /// Requests UPnP port mapping, which this transport does not perform.
        enable_upnp: bool
    );
    setter!(
        /// Sends queued messages automatically on every network tick.
        auto_flush_send_queue: bool
    );
    setter!(
        /// Stops acknowledging plain unreliable messages.
        suppress_unreliable_unordered_acks: bool
    );
    setter!(
        /// Replaces the entire enabled message type mask.
        enabled_message_types: MessageTypes
    );
    setter!(
        /// Appends a CRC32 trailer to every datagram.
        use_checksums: bool
    );
    setter!(
        /// Drops this fraction of outgoing datagrams.
        simulated_loss: f32
    );
    setter!(
        /// Duplicates this fraction of outgoing datagrams.
        simulated_duplicates_chance: f32
    );
    setter!(
        /// Delays every outgoing datagram by at least this much.
        simulated_minimum_latency: Duration
    );
    setter!(
        /// Adds up to this much random delay to outgoing datagrams.
        simulated_random_latency: Duration
    );

    /// Sets the network thread name prefix.
    pub fn network_thread_name(mut self, name: impl Into<String>) -> Self {
        self.config.network_thread_name = name.into();
        self
    }

    /// Releases `kind` to the application.
    pub fn enable_message_type(mut self, kind: MessageTypes) -> Self {
        self.config.enabled_message_types.insert(kind);
        self
    }

    /// Stops releasing `kind` to the application.
    pub fn disable_message_type(mut self, kind: MessageTypes) -> Self {
        self.config.enabled_message_types.remove(kind);
        self
    }

    /// Validates the settings and produces the immutable configuration.
    pub fn build(self) -> Result<Config> {
        let config = self.config;
        if config.app_identifier.is_empty() {
            return Err(ConfigError::EmptyAppIdentifier.into());
        }
        if config.maximum_transmission_unit == 0 || config.maximum_transmission_unit > PROTOCOL_MAX_MTU {
            return Err(
                ConfigError::InvalidMtu(config.maximum_transmission_unit, PROTOCOL_MAX_MTU).into()
            );
        }
        if config.connection_timeout < config.ping_interval {
            return Err(ConfigError::TimeoutBelowPingInterval {
                timeout: config.connection_timeout,
                ping_interval: config.ping_interval,
            }
            .into());
        }
        if config.maximum_handshake_attempts == 0 {
            return Err(ConfigError::NoHandshakeAttempts.into());
        }
        if config.maximum_connections == 0 {
            return Err(ConfigError::NoConnectionsAllowed.into());
        }
        if config.maximum_message_size == 0 || config.maximum_message_size > MAX_MESSAGE_SIZE {
            return Err(ConfigError::InvalidMessageSize(config.maximum_message_size, MAX_MESSAGE_SIZE).into());
        }
        if config.maximum_fragment_groups == 0 {
            return Err(ConfigError::NoFragmentGroups.into());
        }
        if !(0.0..=1.0).contains(&config.simulated_loss) {
            return Err(ConfigError::InvalidProbability("simulated_loss").into());
        }
        if !(0.0..=1.0).contains(&config.simulated_duplicates_chance) {
            return Err(ConfigError::InvalidProbability("simulated_duplicates_chance").into());
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_defaults() {
        let config = Config::builder("app").build().unwrap();
        assert_eq!(config.maximum_transmission_unit(), 1408);
        assert_eq!(config.maximum_connections(), 32);
        assert_eq!(config.ping_interval(), Duration::from_secs(4));
        assert_eq!(config.connection_timeout(), Duration::from_secs(25));
        assert_eq!(config.resend_handshake_interval(), Duration::from_secs(3));
        assert_eq!(config.maximum_handshake_attempts(), 5);
        assert_eq!(config.recycled_cache_max_count(), 64);
        assert_eq!(config.unreliable_size_behaviour(), UnreliableSizeBehaviour::IgnoreMtu);
        assert!(config.auto_flush_send_queue());
        assert!(!config.accept_incoming_connections());
        assert!(!config.is_link_simulated());
    }

    #[test]
    fn test_empty_app_identifier_rejected() {
        let err = Config::builder("").build().unwrap_err();
        assert!(matches!(err, ErrorKind::Config(ConfigError::EmptyAppIdentifier)));
    }

    #[test]
    fn test_mtu_bounds() {
        assert!(Config::builder("app").maximum_transmission_unit(0).build().is_err());
        assert!(Config::builder("app").maximum_transmission_unit(8192).build().is_err());
        assert!(Config::builder("app").maximum_transmission_unit(8191).build().is_ok());
        assert!(Config::builder("app").maximum_transmission_unit(1).build().is_ok());
    }

    #[test]
    fn test_message_size_bounds() {
        let config = Config::builder("app").build().unwrap();
        assert_eq!(config.maximum_message_size(), 1024 * 1024);
        assert_eq!(config.maximum_fragment_groups(), 16);

        let err = Config::builder("app").maximum_message_size(0).build().unwrap_err();
        assert!(matches!(err, ErrorKind::Config(ConfigError::InvalidMessageSize(0, _))));
        assert!(Config::builder("app").maximum_message_size(MAX_MESSAGE_SIZE + 1).build().is_err());
        assert!(Config::builder("app").maximum_message_size(MAX_MESSAGE_SIZE).build().is_ok());
        let err = Config::builder("app").maximum_fragment_groups(0).build().unwrap_err();
        assert!(matches!(err, ErrorKind::Config(ConfigError::NoFragmentGroups)));
    }

    #[test]
    fn test_timeout_must_cover_ping_interval() {
        let err = Config::builder("app")
            .ping_interval(Duration::from_secs(10))
            .connection_timeout(Duration::from_secs(5))
            .build()
            .unwrap_err();
        assert!(matches!(err, ErrorKind::Config(ConfigError::TimeoutBelowPingInterval { .. })));
    }

    #[test]
    fn test_probabilities_validated() {
        assert!(Config::builder("app").simulated_loss(1.5).build().is_err());
        assert!(Config::builder("app").simulated_duplicates_chance(-0.1).build().is_err());
        let config = Config::builder("app").simulated_loss(0.1).build().unwrap();
        assert!(config.is_link_simulated());
    }

    #[test]
    fn test_to_builder_keeps_settings() {
        let config = Config::builder("app").port(4000).build().unwrap();
        let server = config.to_builder().accept_incoming_connections(true).build().unwrap();
        assert_eq!(server.port(), 4000);
        assert!(server.accept_incoming_connections());
    }

    #[test]
    fn test_message_type_toggles() {
        let config = Config::builder("app")
            .enable_message_type(MessageTypes::CONNECTION_APPROVAL)
            .disable_message_type(MessageTypes::DEBUG)
            .build()
            .unwrap();
        assert!(config.is_message_type_enabled(MessageTypes::CONNECTION_APPROVAL));
        assert!(!config.is_message_type_enabled(MessageTypes::DEBUG));
    }
}

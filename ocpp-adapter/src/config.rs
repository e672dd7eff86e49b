//! Configuration for the networking-node adapter
//!
//! Combines the exchange engine settings with the WebSocket transport settings.

use std::time::Duration;

use crate::ocpp::NodeId;

/// How frames are laid out on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetworkingMode {
    /// Plain OCPP-J arrays
    #[default]
    Standard,
    /// OCPP-J arrays with a trailing routing object (destination, network path)
    OverlayNetwork,
}

/// Complete adapter configuration
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    /// Id of this node, first hop of every path it originates
    pub node_id: NodeId,

    /// Exchange engine settings
    pub engine: EngineConfig,

    /// WebSocket settings
    pub websocket: WebSocketSettings,
}

/// Exchange engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Default timeout for outbound requests
    pub request_timeout: Duration,

    /// Upper bound on a single processor invocation
    pub processor_timeout: Duration,

    /// Wire layout
    pub networking_mode: NetworkingMode,

    /// Answer undecodable or unverifiable responses with CALLRESULTERROR
    pub send_response_errors: bool,
}

/// WebSocket transport configuration
#[derive(Debug, Clone)]
pub struct WebSocketSettings {
    /// Upstream CSMS URL (without station id)
    pub uplink_url: Option<String>,

    /// Station id appended to the uplink URL
    pub station_id: String,

    /// Node id the uplink peer is routed under
    pub uplink_node_id: NodeId,

    /// Listen address for downstream stations
    pub listen_addr: Option<String>,

    /// Offered subprotocols, most preferred first
    pub subprotocols: Vec<String>,

    /// Initial reconnect delay
    pub reconnect_delay: Duration,

    /// Maximum reconnect delay (exponential backoff cap)
    pub max_reconnect_delay: Duration,

    /// Largest accepted frame, in bytes
    pub max_message_size: usize,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            node_id: "NN-001".to_string(),
            engine: EngineConfig::default(),
            websocket: WebSocketSettings::default(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            processor_timeout: Duration::from_secs(60),
            networking_mode: NetworkingMode::Standard,
            send_response_errors: false,
        }
    }
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            uplink_url: None,
            station_id: "NN-001".to_string(),
            uplink_node_id: "CSMS".to_string(),
            listen_addr: None,
            subprotocols: vec!["ocpp2.1".to_string(), "ocpp2.0.1".to_string()],
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_delay: Duration::from_secs(300),
            max_message_size: 1 << 20,
        }
    }
}

impl AdapterConfig {
    /// Create config with a node id; the node also uses it as its station id
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        let node_id = node_id.into();

        Self {
            node_id: node_id.clone(),
            engine: EngineConfig::default(),
            websocket: WebSocketSettings {
                station_id: node_id,
                ..Default::default()
            },
        }
    }

    /// Set the default request timeout
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.engine.request_timeout = timeout;
        self
    }

    /// Set the processor timeout
    pub fn with_processor_timeout(mut self, timeout: Duration) -> Self {
        self.engine.processor_timeout = timeout;
        self
    }

    /// Set the networking mode
    pub fn with_networking_mode(mut self, mode: NetworkingMode) -> Self {
        self.engine.networking_mode = mode;
        self
    }

    /// Answer bad responses with CALLRESULTERROR frames
    pub fn with_response_errors(mut self, enabled: bool) -> Self {
        self.engine.send_response_errors = enabled;
        self
    }

    /// Set the upstream CSMS URL and the station id presented to it
    pub fn with_uplink(mut self, url: impl Into<String>, station_id: impl Into<String>) -> Self {
        self.websocket.uplink_url = Some(url.into());
        self.websocket.station_id = station_id.into();
        self
    }

    /// Listen for downstream stations on `addr`
    pub fn with_listener(mut self, addr: impl Into<String>) -> Self {
        self.websocket.listen_addr = Some(addr.into());
        self
    }

    /// Set reconnect backoff bounds
    pub fn with_reconnect(mut self, initial: Duration, max: Duration) -> Self {
        self.websocket.reconnect_delay = initial;
        self.websocket.max_reconnect_delay = max;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = AdapterConfig::new("NN1")
            .with_uplink("ws://localhost:8180/ocpp", "NN1-UP")
            .with_listener("0.0.0.0:9000")
            .with_request_timeout(Duration::from_secs(5))
            .with_networking_mode(NetworkingMode::OverlayNetwork)
            .with_response_errors(true);

        assert_eq!(config.node_id, "NN1");
        assert_eq!(config.websocket.station_id, "NN1-UP");
        assert_eq!(config.websocket.uplink_url.as_deref(), Some("ws://localhost:8180/ocpp"));
        assert_eq!(config.websocket.listen_addr.as_deref(), Some("0.0.0.0:9000"));
        assert_eq!(config.engine.request_timeout, Duration::from_secs(5));
        assert_eq!(config.engine.networking_mode, NetworkingMode::OverlayNetwork);
        assert!(config.engine.send_response_errors);
    }

    #[test]
    fn test_defaults() {
        let config = AdapterConfig::new("NN2");
        assert_eq!(config.websocket.station_id, "NN2");
        assert_eq!(config.engine.networking_mode, NetworkingMode::Standard);
        assert_eq!(config.websocket.subprotocols, vec!["ocpp2.1", "ocpp2.0.1"]);
        assert!(!config.engine.send_response_errors);
    }
}

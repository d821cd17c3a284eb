//! Network configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables shared by all cranes of a dock.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    /// Serve as a public hub: remote terminals may expand through us.
    pub public_hub: bool,
    /// DFQ window of the crane controller terminal
    pub controller_queue_size: u16,
    /// Shipment padding quantum requested by crane controllers
    pub controller_padding: u16,
    /// Timeout for each step of the crane handshake
    #[serde(with = "millis")]
    pub handshake_timeout: Duration,
    /// How long the loader waits to fill a shipment
    #[serde(with = "millis")]
    pub loading_max_wait: Duration,
    /// DFQ window for new data terminals
    pub default_queue_size: u16,
    /// Padding quantum for new data terminals
    pub default_padding: u16,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            public_hub: false,
            controller_queue_size: 100,
            controller_padding: 8,
            handshake_timeout: Duration::from_secs(1),
            loading_max_wait: Duration::from_millis(5),
            default_queue_size: 100,
            default_padding: 8,
        }
    }
}

impl NetConfig {
    /// Config for a hub that relays traffic for others.
    pub fn public() -> Self {
        Self {
            public_hub: true,
            ..Self::default()
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

//! Configuration system.
//!
//! Loads engine configuration from JSON strings/files (file IO left to the
//! application binaries). Mirrors the startup knobs named in the networking
//! core's external interface: addresses, ports, MTU, and the admission
//! policy the core consults but does not own.

use serde::{Deserialize, Serialize};

/// TCP control-channel port used when the caller passes `0`.
pub const DEFAULT_TCP_PORT: u16 = 13209;
/// UDP datagram-channel port used when the caller passes `0` and the
/// preferred port is unavailable.
pub const DEFAULT_UDP_PORT: u16 = 13209;
/// Datagram payload ceiling used when `NetConfig::mtu` is not overridden.
pub const DEFAULT_MTU: usize = 1300;

/// Root configuration shared by the server and client binaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetConfig {
    /// `net.ip.address`: server bind address (server role) or the address to
    /// dial (client role), e.g. `127.0.0.1:13209`.
    pub ip_address: String,
    /// `net.ip.port` / `net.port.control`: TCP port; `0` means
    /// [`DEFAULT_TCP_PORT`].
    #[serde(default)]
    pub control_port: u16,
    /// `net.port.data`: UDP port; `0` means [`DEFAULT_UDP_PORT`] or an
    /// OS-assigned port if that is also unavailable.
    #[serde(default)]
    pub data_port: u16,
    /// `mtu`: startup-only override of the maximum datagram payload size.
    #[serde(default = "default_mtu")]
    pub mtu: usize,
    /// External admission policy: maximum simultaneously joined clients.
    #[serde(default = "default_max_players")]
    pub max_players: usize,
    /// Display name advertised by the client at JOIN.
    #[serde(default = "default_player_name")]
    pub player_name: String,
    /// Optional network emulation knobs (see [`EmulationConfig`]).
    #[serde(default)]
    pub emulation: EmulationConfig,
}

fn default_mtu() -> usize {
    DEFAULT_MTU
}

fn default_max_players() -> usize {
    16
}

fn default_player_name() -> String {
    "Player".to_string()
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            ip_address: "127.0.0.1".to_string(),
            control_port: 0,
            data_port: 0,
            mtu: DEFAULT_MTU,
            max_players: default_max_players(),
            player_name: default_player_name(),
            emulation: EmulationConfig::default(),
        }
    }
}

impl NetConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    /// Resolves the configured TCP port, substituting the default for `0`.
    pub fn resolved_control_port(&self) -> u16 {
        if self.control_port == 0 {
            DEFAULT_TCP_PORT
        } else {
            self.control_port
        }
    }

    /// Resolves the configured UDP port, substituting the default for `0`.
    pub fn resolved_data_port(&self) -> u16 {
        if self.data_port == 0 {
            DEFAULT_UDP_PORT
        } else {
            self.data_port
        }
    }
}

/// Debug-only "poor connection" simulation, gated behind the `net-emulation`
/// feature so it cannot affect a production build even if left enabled in a
/// checked-in config file.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct EmulationConfig {
    pub enabled: bool,
    /// Percentage (0-100) of outbound datagrams dropped at enqueue time.
    pub drop_percent: u8,
    /// Upper bound, in milliseconds, of the random send delay.
    pub max_delay_ms: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_resolve_known_ports() {
        let cfg = NetConfig::default();
        assert_eq!(cfg.resolved_control_port(), DEFAULT_TCP_PORT);
        assert_eq!(cfg.resolved_data_port(), DEFAULT_UDP_PORT);
    }

    #[test]
    fn explicit_port_overrides_default() {
        let mut cfg = NetConfig::default();
        cfg.control_port = 9000;
        assert_eq!(cfg.resolved_control_port(), 9000);
    }

    #[test]
    fn json_roundtrip_fills_defaults() {
        let cfg = NetConfig::from_json_str(r#"{"ip_address": "10.0.0.5"}"#).unwrap();
        assert_eq!(cfg.ip_address, "10.0.0.5");
        assert_eq!(cfg.mtu, DEFAULT_MTU);
        assert_eq!(cfg.max_players, 16);
    }
}

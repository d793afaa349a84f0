//! Per-DLM (Data Link Manager) configuration.
//!
//! One [`DlmConfig`] describes one physical datalink: its capacity, QoS
//! support, physical characteristics, the local IPC endpoint of the DLM
//! process that owns the modem, the egress network interface the dataplane
//! programs, and an optional geographic coverage envelope. The set of
//! configs is immutable after load.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::bandwidth::Kbps;
use crate::ids::DlmId;

/// Kind of physical datalink behind a DLM.
#[derive(
    Serialize,
    Deserialize,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum DlmType {
    /// Satellite link, global coverage.
    Satellite,
    /// Cellular / air-to-ground link, terrestrial coverage.
    Cellular,
    /// Hybrid or airport link (e.g. gate Wi-Fi).
    Hybrid,
}

/// Geographic box within which a DLM is declared usable.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct CoverageEnvelope {
    /// Minimum latitude in degrees.
    pub min_latitude: f64,
    /// Maximum latitude in degrees.
    pub max_latitude: f64,
    /// Minimum longitude in degrees.
    pub min_longitude: f64,
    /// Maximum longitude in degrees.
    pub max_longitude: f64,
    /// Minimum altitude in feet.
    pub min_altitude_ft: f64,
    /// Maximum altitude in feet.
    pub max_altitude_ft: f64,
}

impl CoverageEnvelope {
    /// True when the given position lies inside the envelope.
    pub fn contains(&self, latitude: f64, longitude: f64, altitude_ft: f64) -> bool {
        latitude >= self.min_latitude
            && latitude <= self.max_latitude
            && longitude >= self.min_longitude
            && longitude <= self.max_longitude
            && altitude_ft >= self.min_altitude_ft
            && altitude_ft <= self.max_altitude_ft
    }
}

/// Load-balancing hints for a DLM.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoadBalanceHints {
    /// Prefer draining this link before spilling to others.
    #[serde(default)]
    pub prefer_least_loaded: bool,
    /// Allow automatic failover away from this link.
    #[serde(default)]
    pub enable_failover: bool,
}

/// Static configuration of one Data Link Manager.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DlmConfig {
    /// Stable identifier (e.g. `"LINK_SATCOM"`).
    pub id: DlmId,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// Whether the link participates in policy decisions.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Link kind.
    pub dlm_type: DlmType,
    /// Forward (ground→aircraft) capacity.
    pub max_forward_kbps: Kbps,
    /// Return (aircraft→ground) capacity.
    pub max_return_kbps: Kbps,
    /// QoS levels the link can carry.
    pub supported_qos: Vec<u8>,
    /// Nominal one-way latency in milliseconds.
    pub latency_ms: u32,
    /// Nominal jitter in milliseconds.
    #[serde(default)]
    pub jitter_ms: u32,
    /// Nominal packet loss rate, 0.0–1.0.
    #[serde(default)]
    pub packet_loss_rate: f32,
    /// Declared security level of the link, 0 (open) to 3 (protected).
    #[serde(default)]
    pub security_level: u8,
    /// Filesystem path of the DLM's local IPC endpoint
    /// (e.g. `/tmp/mihf_satcom.sock`).
    pub endpoint_path: PathBuf,
    /// Egress network interface programmed into the dataplane.
    pub egress_interface: String,
    /// Next-hop gateway address on the egress interface.
    pub gateway_ip: Ipv4Addr,
    /// Optional geographic usability envelope.
    #[serde(default)]
    pub coverage: Option<CoverageEnvelope>,
    /// Load-balancing hints.
    #[serde(default)]
    pub load_balance: LoadBalanceHints,
}

fn default_true() -> bool {
    true
}

impl DlmConfig {
    /// True when the link can carry the given QoS level.
    pub fn supports_qos(&self, qos_level: u8) -> bool {
        self.supported_qos.contains(&qos_level)
    }

    /// Check the coverage envelope against an aircraft position.
    ///
    /// A link without an envelope covers everywhere.
    pub fn covers(&self, latitude: f64, longitude: f64, altitude_ft: f64) -> bool {
        match &self.coverage {
            Some(envelope) => envelope.contains(latitude, longitude, altitude_ft),
            None => true,
        }
    }
}

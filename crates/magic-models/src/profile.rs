//! Per-client profiles.
//!
//! A [`ClientProfile`] is the complete contract the gateway holds for one
//! known client identity, partitioned the way the configuration document is:
//! credentials, bandwidth quota, QoS, link policy, session policy, traffic
//! policy and location policy.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::aircraft::FlightPhase;
use crate::bandwidth::Kbps;
use crate::ids::{ClientId, DlmId, ProfileName};
use crate::message::{PortRange, TftSpec};

/// How a higher-priority request treats lower-priority sessions.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PriorityType {
    /// Wait for resources to free up.
    Blocking,
    /// Evict lower-priority sessions when starved.
    Preemption,
}

/// Credentials partition.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CredentialsPolicy {
    /// Login username.
    pub username: String,
    /// Secret the client must present.
    pub client_secret: String,
    /// Secret the gateway presents back for mutual authentication.
    #[serde(default)]
    pub server_secret: String,
    /// When set, the client must connect from this address.
    #[serde(default)]
    pub source_ip: Option<Ipv4Addr>,
}

/// Bandwidth quota partition. All values in kbps; a cap of zero means
/// unlimited.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandwidthQuota {
    /// Maximum aggregate forward bandwidth across the client's sessions.
    pub max_forward_kbps: Kbps,
    /// Maximum aggregate return bandwidth.
    pub max_return_kbps: Kbps,
    /// Guaranteed forward floor; an allocation below this is refused.
    #[serde(default)]
    pub guaranteed_forward_kbps: Kbps,
    /// Guaranteed return floor.
    #[serde(default)]
    pub guaranteed_return_kbps: Kbps,
    /// Bandwidth requested on the client's behalf when a request names none.
    #[serde(default)]
    pub default_request_kbps: Kbps,
}

/// QoS partition.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct QosPolicy {
    /// Blocking or preemption behaviour.
    pub priority_type: PriorityType,
    /// Priority class, 1 (highest) to 9.
    pub priority_class: u8,
    /// QoS level applied when the request names none.
    pub default_level: u8,
    /// QoS levels the client may request.
    pub allowed_levels: Vec<u8>,
}

/// Link policy partition.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LinkPolicy {
    /// DLMs the client may be placed on.
    pub allowed_dlms: Vec<DlmId>,
    /// Preferred DLM, when any.
    #[serde(default)]
    pub preferred_dlm: Option<DlmId>,
    /// Whether the client may hold several links at once.
    #[serde(default)]
    pub allow_multi_link: bool,
    /// Upper bound on concurrently held links.
    #[serde(default = "default_one")]
    pub max_concurrent_links: u32,
}

/// Session policy partition.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionPolicy {
    /// Upper bound on concurrent sessions.
    pub max_concurrent_sessions: u32,
    /// Idle timeout in seconds.
    #[serde(default = "default_session_timeout")]
    pub session_timeout_secs: u32,
    /// Authorization lifetime granted at authentication.
    #[serde(default = "default_auth_lifetime")]
    pub auth_lifetime_secs: u32,
    /// Grace period after the authorization lifetime expires.
    #[serde(default = "default_auth_grace")]
    pub auth_grace_secs: u32,
    /// Flight phases during which sessions may be active; empty = all.
    #[serde(default)]
    pub allowed_phases: Vec<FlightPhase>,
    /// May query detailed link status (status levels 6/7).
    #[serde(default)]
    pub allow_detailed_status: bool,
    /// May query the registered-clients list.
    #[serde(default)]
    pub allow_registered_clients: bool,
    /// Minimum interval between status requests, seconds; 0 = unlimited.
    #[serde(default = "default_status_rate_limit")]
    pub status_rate_limit_secs: u32,
    /// May roll over CDRs of sessions it does not own.
    #[serde(default)]
    pub allow_cdr_control: bool,
}

fn default_one() -> u32 {
    1
}

fn default_session_timeout() -> u32 {
    3600
}

fn default_auth_lifetime() -> u32 {
    3600
}

fn default_auth_grace() -> u32 {
    300
}

fn default_status_rate_limit() -> u32 {
    5
}

/// Traffic policy partition: the whitelist every submitted TFT must fall
/// within.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct TrafficPolicy {
    /// Whether the link must declare encryption for this client's traffic.
    #[serde(default)]
    pub encryption_required: bool,
    /// Allowed IP protocol names (e.g. `"TCP"`, `"UDP"`); empty = any.
    #[serde(default)]
    pub allowed_protocols: Vec<String>,
    /// Destination networks TFTs may target; empty = any.
    #[serde(default)]
    pub dest_ip_ranges: Vec<Ipv4Net>,
    /// Destination port ranges TFTs may target; empty = any.
    #[serde(default)]
    pub dest_port_ranges: Vec<PortRange>,
    /// Source port ranges TFTs may use; empty = any.
    #[serde(default)]
    pub source_port_ranges: Vec<PortRange>,
    /// Maximum packet size in bytes, when constrained.
    #[serde(default)]
    pub max_packet_size: Option<u32>,
}

/// Why a TFT rule was rejected against the whitelist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum TftViolation {
    /// The protocol is not on the allowed list.
    Protocol,
    /// The destination network is outside every allowed range.
    DestIp,
    /// The destination ports are outside every allowed range.
    DestPort,
    /// The source ports are outside every allowed range.
    SourcePort,
}

impl TrafficPolicy {
    /// Validate one TFT row against the whitelist.
    ///
    /// # Errors
    ///
    /// Returns the first [`TftViolation`] encountered.
    pub fn permits_tft(&self, tft: &TftSpec) -> Result<(), TftViolation> {
        if !self.allowed_protocols.is_empty() && tft.protocol != 0 {
            let allowed = self
                .allowed_protocols
                .iter()
                .filter_map(|name| protocol_number(name))
                .any(|p| p == tft.protocol);
            if !allowed {
                return Err(TftViolation::Protocol);
            }
        }

        if !self.dest_ip_ranges.is_empty() {
            match tft.dst {
                Some(net) => {
                    if !self.dest_ip_ranges.iter().any(|range| range.contains(&net)) {
                        return Err(TftViolation::DestIp);
                    }
                }
                // A wildcard destination cannot be inside a bounded range.
                None => return Err(TftViolation::DestIp),
            }
        }

        if !self.dest_port_ranges.is_empty() {
            match tft.dst_ports {
                Some(ports) => {
                    if !self.dest_port_ranges.iter().any(|r| r.covers(ports)) {
                        return Err(TftViolation::DestPort);
                    }
                }
                None => return Err(TftViolation::DestPort),
            }
        }

        if !self.source_port_ranges.is_empty() {
            if let Some(ports) = tft.src_ports {
                if !self.source_port_ranges.iter().any(|r| r.covers(ports)) {
                    return Err(TftViolation::SourcePort);
                }
            }
            // A wildcard source port is tolerated: the client may not know
            // its ephemeral port range.
        }

        Ok(())
    }
}

/// Map a protocol name to its IP protocol number.
pub fn protocol_number(name: &str) -> Option<u8> {
    match name.to_ascii_uppercase().as_str() {
        "ICMP" => Some(1),
        "TCP" => Some(6),
        "UDP" => Some(17),
        "SCTP" => Some(132),
        _ => None,
    }
}

/// Location policy partition.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct LocationPolicy {
    /// Allowed region labels; empty = anywhere.
    #[serde(default)]
    pub allowed_regions: Vec<String>,
    /// Whether the selected link must positively cover the aircraft position.
    #[serde(default)]
    pub require_coverage: bool,
}

/// The complete per-client contract.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ClientProfile {
    /// Profile name, the primary lookup key.
    pub profile_name: ProfileName,
    /// Client identity (`Origin-Host`) this profile belongs to.
    pub client_id: ClientId,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// Whether the profile is active.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Credentials partition.
    pub credentials: CredentialsPolicy,
    /// Bandwidth quota partition.
    pub bandwidth: BandwidthQuota,
    /// QoS partition.
    pub qos: QosPolicy,
    /// Link policy partition.
    pub link: LinkPolicy,
    /// Session policy partition.
    pub session: SessionPolicy,
    /// Traffic policy partition.
    #[serde(default)]
    pub traffic: TrafficPolicy,
    /// Location policy partition.
    #[serde(default)]
    pub location: LocationPolicy,
}

fn default_true() -> bool {
    true
}

impl ClientProfile {
    /// True when the client may be placed on the given DLM.
    pub fn is_dlm_allowed(&self, dlm_id: &DlmId) -> bool {
        self.link.allowed_dlms.contains(dlm_id)
    }

    /// True when the client may request the given QoS level.
    pub fn is_qos_allowed(&self, qos_level: u8) -> bool {
        self.qos.allowed_levels.is_empty() || self.qos.allowed_levels.contains(&qos_level)
    }

    /// True when sessions of this client may be active in the given phase.
    ///
    /// An empty phase list allows every phase.
    pub fn is_phase_allowed(&self, phase: FlightPhase) -> bool {
        self.session.allowed_phases.is_empty() || self.session.allowed_phases.contains(&phase)
    }

    /// Clamp a status-subscription level to the profile's permissions:
    /// detailed levels 6/7 degrade to their non-detailed counterparts 2/3.
    pub fn clamp_status_level(&self, level: u8) -> u8 {
        if self.session.allow_detailed_status {
            level
        } else {
            match level {
                6 => 2,
                7 => 3,
                other => other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::TftDirection;

    fn cabin_profile() -> ClientProfile {
        ClientProfile {
            profile_name: ProfileName::new("CABIN_IFE"),
            client_id: ClientId::new("ife.cabin.aircraft"),
            description: String::new(),
            enabled: true,
            credentials: CredentialsPolicy {
                username: "ife".into(),
                client_secret: "cabin-secret".into(),
                server_secret: "server-secret".into(),
                source_ip: Some(Ipv4Addr::new(10, 2, 1, 20)),
            },
            bandwidth: BandwidthQuota {
                max_forward_kbps: Kbps(1000),
                max_return_kbps: Kbps(500),
                guaranteed_forward_kbps: Kbps(100),
                guaranteed_return_kbps: Kbps(50),
                default_request_kbps: Kbps(200),
            },
            qos: QosPolicy {
                priority_type: PriorityType::Blocking,
                priority_class: 5,
                default_level: 0,
                allowed_levels: vec![0, 1],
            },
            link: LinkPolicy {
                allowed_dlms: vec![DlmId::new("LINK_SATCOM"), DlmId::new("LINK_GATE")],
                preferred_dlm: None,
                allow_multi_link: false,
                max_concurrent_links: 1,
            },
            session: SessionPolicy {
                max_concurrent_sessions: 2,
                session_timeout_secs: 3600,
                auth_lifetime_secs: 3600,
                auth_grace_secs: 300,
                allowed_phases: vec![FlightPhase::Gate, FlightPhase::Cruise],
                allow_detailed_status: false,
                allow_registered_clients: true,
                status_rate_limit_secs: 5,
                allow_cdr_control: false,
            },
            traffic: TrafficPolicy {
                encryption_required: false,
                allowed_protocols: vec!["TCP".into(), "UDP".into()],
                dest_ip_ranges: vec!["10.2.0.0/16".parse().unwrap()],
                dest_port_ranges: vec![PortRange::new(80, 8080).unwrap()],
                source_port_ranges: vec![],
                max_packet_size: None,
            },
            location: LocationPolicy::default(),
        }
    }

    fn tft(dst: &str, dst_ports: Option<PortRange>) -> TftSpec {
        TftSpec {
            direction: TftDirection::ToAircraft,
            protocol: 6,
            src: None,
            dst: Some(dst.parse().unwrap()),
            src_ports: None,
            dst_ports,
        }
    }

    #[test]
    fn dlm_and_qos_permissions() {
        let p = cabin_profile();
        assert!(p.is_dlm_allowed(&DlmId::new("LINK_SATCOM")));
        assert!(!p.is_dlm_allowed(&DlmId::new("LINK_CELLULAR")));
        assert!(p.is_qos_allowed(1));
        assert!(!p.is_qos_allowed(2));
    }

    #[test]
    fn phase_permission_empty_means_all() {
        let mut p = cabin_profile();
        assert!(!p.is_phase_allowed(FlightPhase::Taxi));
        p.session.allowed_phases.clear();
        assert!(p.is_phase_allowed(FlightPhase::Taxi));
    }

    #[test]
    fn status_level_downgrade() {
        let mut p = cabin_profile();
        assert_eq!(p.clamp_status_level(7), 3);
        assert_eq!(p.clamp_status_level(6), 2);
        assert_eq!(p.clamp_status_level(3), 3);
        p.session.allow_detailed_status = true;
        assert_eq!(p.clamp_status_level(7), 7);
    }

    #[test]
    fn tft_whitelist_accepts_contained_rule() {
        let p = cabin_profile();
        let rule = tft("10.2.3.0/24", Some(PortRange::new(443, 443).unwrap()));
        assert!(p.traffic.permits_tft(&rule).is_ok());
    }

    #[test]
    fn tft_whitelist_rejects_outside_network() {
        let p = cabin_profile();
        let rule = tft("10.3.0.1/32", Some(PortRange::new(443, 443).unwrap()));
        assert_eq!(p.traffic.permits_tft(&rule), Err(TftViolation::DestIp));
    }

    #[test]
    fn tft_whitelist_rejects_port_outside_range() {
        let p = cabin_profile();
        let rule = tft("10.2.3.0/24", Some(PortRange::new(9000, 9100).unwrap()));
        assert_eq!(p.traffic.permits_tft(&rule), Err(TftViolation::DestPort));
    }

    #[test]
    fn tft_whitelist_rejects_disallowed_protocol() {
        let p = cabin_profile();
        let mut rule = tft("10.2.3.0/24", Some(PortRange::new(443, 443).unwrap()));
        rule.protocol = 132;
        assert_eq!(p.traffic.permits_tft(&rule), Err(TftViolation::Protocol));
    }

    #[test]
    fn tft_wildcard_protocol_is_accepted() {
        let p = cabin_profile();
        let mut rule = tft("10.2.3.0/24", Some(PortRange::new(443, 443).unwrap()));
        rule.protocol = 0;
        assert!(p.traffic.permits_tft(&rule).is_ok());
    }

    #[test]
    fn profile_serde_roundtrip() {
        let p = cabin_profile();
        let json = serde_json::to_string(&p).unwrap();
        let back: ClientProfile = serde_json::from_str(&json).unwrap();
        assert_eq!(p, back);
    }
}

//! Configuration loading.
//!
//! Three JSON documents map 1:1 onto the model types and are read once at
//! boot: `datalink_profile.json` (the DLM fleet), `central_policy_profile.json`
//! (traffic classes and path rules) and `client_profile.json` (the known
//! clients). An optional `gateway.json` overrides daemon settings; anything
//! absent falls back to defaults. Configuration is immutable after load.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use magic_models::{
    CentralPolicy, ClientId, ClientProfile, DlmConfig, DlmId, ProfileName, Realm,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::adif::AdifConfig;

/// Identity the gateway answers with.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct GatewayIdentity {
    /// `Origin-Host` of every answer and push.
    pub origin_host: ClientId,
    /// `Origin-Realm`.
    pub origin_realm: Realm,
}

impl Default for GatewayIdentity {
    fn default() -> Self {
        GatewayIdentity {
            origin_host: ClientId::new("magic.gateway.aircraft"),
            origin_realm: Realm::new("aircraft"),
        }
    }
}

/// Daemon settings (`gateway.json`).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct GatewaySettings {
    /// Control socket bind address.
    pub listen_addr: SocketAddr,
    /// Gateway identity.
    pub identity: GatewayIdentity,
    /// CDR storage base directory.
    pub cdr_base_dir: PathBuf,
    /// Archive retention, seconds.
    pub cdr_retention_secs: u64,
    /// Aircraft-data source.
    pub adif: AdifConfig,
    /// Gateway-side socket DLMs push link events to.
    pub dlm_event_socket: PathBuf,
    /// DLM confirm timeout, milliseconds.
    pub dlm_confirm_timeout_ms: u64,
    /// Maintenance sweep interval, seconds.
    pub maintenance_interval_secs: u64,
    /// Queue entry timeout, seconds.
    pub queue_timeout_secs: u64,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        GatewaySettings {
            listen_addr: "0.0.0.0:3868".parse().expect("static address"),
            identity: GatewayIdentity::default(),
            cdr_base_dir: PathBuf::from("/var/lib/magic/cdr"),
            cdr_retention_secs: 24 * 3600,
            adif: AdifConfig {
                host: "127.0.0.1".into(),
                sync_port: 8700,
                async_port: 8701,
                reconnect_secs: 5,
                stale_secs: 30,
            },
            dlm_event_socket: PathBuf::from("/tmp/magic_lmi.sock"),
            dlm_confirm_timeout_ms: 2000,
            maintenance_interval_secs: 10,
            queue_timeout_secs: 30,
        }
    }
}

/// The loaded, immutable configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Daemon settings.
    pub settings: GatewaySettings,
    /// The DLM fleet.
    pub dlms: Vec<DlmConfig>,
    /// Central policy document.
    pub policy: CentralPolicy,
    /// Known clients.
    pub clients: Vec<ClientProfile>,
}

impl GatewayConfig {
    /// Load everything from a configuration directory.
    ///
    /// # Errors
    ///
    /// Missing or malformed documents abort the boot; cross-reference
    /// problems (a client naming an unknown DLM) only warn.
    pub fn load(dir: &Path) -> Result<Self> {
        let settings: GatewaySettings = match fs::read_to_string(dir.join("gateway.json")) {
            Ok(text) => serde_json::from_str(&text).context("parsing gateway.json")?,
            Err(_) => {
                info!("gateway.json absent, using defaults");
                GatewaySettings::default()
            }
        };

        let dlms: Vec<DlmConfig> = read_json(dir, "datalink_profile.json")?;
        let policy: CentralPolicy = read_json(dir, "central_policy_profile.json")?;
        let clients: Vec<ClientProfile> = read_json(dir, "client_profile.json")?;

        let config = GatewayConfig {
            settings,
            dlms,
            policy,
            clients,
        };
        config.validate()?;
        info!(
            dlms = config.dlms.len(),
            clients = config.clients.len(),
            rulesets = config.policy.rulesets.len(),
            "configuration loaded"
        );
        Ok(config)
    }

    /// Structural validation; called by [`load`](Self::load) and by tests
    /// that assemble configs in memory.
    ///
    /// # Errors
    ///
    /// Fails on an empty DLM fleet or duplicate identifiers.
    pub fn validate(&self) -> Result<()> {
        if self.dlms.is_empty() {
            bail!("no datalinks configured");
        }
        let mut seen = std::collections::HashSet::new();
        for dlm in &self.dlms {
            if !seen.insert(&dlm.id) {
                bail!("duplicate DLM id {}", dlm.id);
            }
        }
        let mut names = std::collections::HashSet::new();
        for client in &self.clients {
            if !names.insert(&client.profile_name) {
                bail!("duplicate client profile {}", client.profile_name);
            }
            for dlm in &client.link.allowed_dlms {
                if self.find_dlm(dlm).is_none() {
                    warn!(profile = %client.profile_name, link = %dlm, "profile references unknown DLM");
                }
            }
        }
        for ruleset in &self.policy.rulesets {
            for rule in &ruleset.rules {
                for pref in &rule.preferences {
                    if self.find_dlm(&pref.dlm_id).is_none() {
                        warn!(
                            ruleset = %ruleset.id,
                            link = %pref.dlm_id,
                            "policy references unknown DLM"
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Look up a DLM by id.
    pub fn find_dlm(&self, id: &DlmId) -> Option<&DlmConfig> {
        self.dlms.iter().find(|d| &d.id == id)
    }

    /// Look up a client profile by its login username.
    pub fn find_client_by_username(&self, username: &str) -> Option<&ClientProfile> {
        self.clients
            .iter()
            .find(|c| c.enabled && c.credentials.username == username)
    }

    /// Look up a client profile by the client identity (`Origin-Host`).
    pub fn find_client_by_id(&self, client_id: &ClientId) -> Option<&ClientProfile> {
        self.clients
            .iter()
            .find(|c| c.enabled && &c.client_id == client_id)
    }

    /// Look up a client profile by name.
    pub fn find_client_by_profile(&self, name: &ProfileName) -> Option<&ClientProfile> {
        self.clients
            .iter()
            .find(|c| c.enabled && &c.profile_name == name)
    }
}

fn read_json<T: serde::de::DeserializeOwned>(dir: &Path, name: &str) -> Result<T> {
    let path = dir.join(name);
    let text =
        fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use magic_models::{DlmType, Kbps};

    fn dlm(id: &str) -> DlmConfig {
        DlmConfig {
            id: DlmId::new(id),
            description: String::new(),
            enabled: true,
            dlm_type: DlmType::Satellite,
            max_forward_kbps: Kbps(10_000),
            max_return_kbps: Kbps(1_000),
            supported_qos: vec![0],
            latency_ms: 600,
            jitter_ms: 0,
            packet_loss_rate: 0.0,
            security_level: 1,
            endpoint_path: "/tmp/sat.sock".into(),
            egress_interface: "sat0".into(),
            gateway_ip: "10.40.0.1".parse().unwrap(),
            coverage: None,
            load_balance: Default::default(),
        }
    }

    fn minimal() -> GatewayConfig {
        GatewayConfig {
            settings: GatewaySettings::default(),
            dlms: vec![dlm("LINK_SATCOM")],
            policy: CentralPolicy {
                traffic_classes: vec![],
                switching: Default::default(),
                rulesets: vec![],
            },
            clients: vec![],
        }
    }

    #[test]
    fn empty_fleet_is_fatal() {
        let mut config = minimal();
        config.dlms.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn duplicate_dlm_id_is_fatal() {
        let mut config = minimal();
        config.dlms.push(dlm("LINK_SATCOM"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_from_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        fs::write(
            dir.path().join("datalink_profile.json"),
            serde_json::to_string(&vec![dlm("LINK_SATCOM")]).unwrap(),
        )
        .unwrap();
        fs::write(
            dir.path().join("central_policy_profile.json"),
            r#"{"traffic_classes": [], "rulesets": []}"#,
        )
        .unwrap();
        fs::write(dir.path().join("client_profile.json"), "[]").unwrap();

        let config = GatewayConfig::load(dir.path()).unwrap();
        assert_eq!(config.dlms.len(), 1);
        assert_eq!(config.settings.listen_addr.port(), 3868);
    }

    #[test]
    fn missing_document_is_fatal() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(GatewayConfig::load(dir.path()).is_err());
    }

    #[test]
    fn settings_defaults_are_sane() {
        let s = GatewaySettings::default();
        assert_eq!(s.cdr_retention_secs, 86_400);
        assert_eq!(s.adif.reconnect_secs, 5);
        assert_eq!(s.queue_timeout_secs, 30);
    }
}

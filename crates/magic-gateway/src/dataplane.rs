//! Dataplane programmer.
//!
//! Maps sessions and TFTs onto the packet-steering primitives of the host:
//! every registered DLM owns a numeric policy-routing table with a default
//! route out of its egress interface; every session gets a source-address
//! rule into its link's table; every TFT gets a packet-mark rule plus an
//! fwmark rule into the same table. Two address whitelists gate access to
//! the control socket and to user-traffic forwarding.
//!
//! The concrete backend is behind the [`Dataplane`] trait so the engine can
//! run against [`RecordingDataplane`] in tests and on non-Linux hosts.
//! Programming failures are non-fatal for the control path: operations
//! return errors, callers log and decide.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::process::Command;
use std::sync::Mutex;

use ipnet::Ipv4Net;
use magic_models::{DlmConfig, DlmId, SessionId, TftSpec};
use tracing::{debug, info, warn};

/// Errors surfaced by dataplane operations.
#[derive(Debug, thiserror::Error)]
pub enum DataplaneError {
    /// The referenced link was never registered.
    #[error("link {0} not registered in the dataplane")]
    UnknownLink(DlmId),
    /// The referenced session has no installed rules.
    #[error("no dataplane state for session {0}")]
    UnknownSession(SessionId),
    /// The backing tool rejected a command.
    #[error("dataplane command failed: {0}")]
    CommandFailed(String),
    /// Injected failure (test double).
    #[error("dataplane failure injected")]
    Injected,
}

/// Abstract packet-steering operations consumed by the engine.
pub trait Dataplane: Send + Sync {
    /// Register a link: allocate its routing table and install the default
    /// route towards its gateway.
    fn register_link(&self, dlm: &DlmConfig) -> Result<(), DataplaneError>;

    /// Remove a link's table and default route.
    fn unregister_link(&self, dlm: &DlmId) -> Result<(), DataplaneError>;

    /// Install the per-session policy rule
    /// `from <client_ip> [to <dst>] lookup <table-of-dlm>`.
    fn add_route(
        &self,
        session: &SessionId,
        client_ip: Ipv4Addr,
        dlm: &DlmId,
        dst: Option<Ipv4Net>,
    ) -> Result<(), DataplaneError>;

    /// Atomically repoint every rule of the session at another link's
    /// table. TFT marks stay untouched.
    fn switch_route(&self, session: &SessionId, new_dlm: &DlmId) -> Result<(), DataplaneError>;

    /// Install a packet-mark rule for one TFT row plus the fwmark rule into
    /// the link's table. All TFTs of a session share one mark.
    fn add_tft(
        &self,
        session: &SessionId,
        mark: u32,
        tft: &TftSpec,
        dlm: &DlmId,
    ) -> Result<(), DataplaneError>;

    /// Remove every rule tagged with the session id.
    fn remove_all_for(&self, session: &SessionId) -> Result<(), DataplaneError>;

    /// Allow a client address to reach the control socket.
    fn whitelist_control(&self, ip: Ipv4Addr) -> Result<(), DataplaneError>;

    /// Allow a client address to forward user traffic.
    fn whitelist_data(&self, ip: Ipv4Addr) -> Result<(), DataplaneError>;

    /// Remove everything this programmer installed.
    fn teardown(&self) -> Result<(), DataplaneError>;
}

// ---------------------------------------------------------------------------
// Linux backend: policy routing + nftables marks
// ---------------------------------------------------------------------------

const TABLE_BASE: u32 = 100;
const RULE_PRIORITY_SRC: u32 = 1000;
const RULE_PRIORITY_MARK: u32 = 900;

struct SessionRules {
    client_ip: Ipv4Addr,
    dst: Option<Ipv4Net>,
    dlm: DlmId,
    mark: Option<u32>,
    tft_count: u32,
}

struct LinuxState {
    tables: HashMap<DlmId, u32>,
    next_table: u32,
    sessions: HashMap<SessionId, SessionRules>,
}

/// Reference Linux implementation: `ip rule`/`ip route` for steering,
/// `nft` for packet marks and the two whitelists.
///
/// All mutations are serialised through one mutex; the kernel tooling is
/// not safely reentrant.
pub struct LinuxDataplane {
    state: Mutex<LinuxState>,
    // The kernel tooling is not reentrancy-safe; one command at a time.
    cmd_lock: Mutex<()>,
}

impl Default for LinuxDataplane {
    fn default() -> Self {
        Self::new()
    }
}

impl LinuxDataplane {
    /// Create the programmer and install the base nftables scaffolding.
    pub fn new() -> Self {
        let dp = LinuxDataplane {
            state: Mutex::new(LinuxState {
                tables: HashMap::new(),
                next_table: TABLE_BASE,
                sessions: HashMap::new(),
            }),
            cmd_lock: Mutex::new(()),
        };
        // Base table, mark chain and the two whitelist sets. Errors here
        // are logged and surfaced again on first use.
        let _ = dp.run("nft", &["add", "table", "inet", "magic"]);
        let _ = dp.run(
            "nft",
            &[
                "add", "chain", "inet", "magic", "marks",
                "{", "type", "filter", "hook", "prerouting", "priority", "mangle", ";", "}",
            ],
        );
        let _ = dp.run(
            "nft",
            &["add", "set", "inet", "magic", "control_allow", "{", "type", "ipv4_addr", ";", "}"],
        );
        let _ = dp.run(
            "nft",
            &["add", "set", "inet", "magic", "data_allow", "{", "type", "ipv4_addr", ";", "}"],
        );
        dp
    }

    fn run(&self, program: &str, args: &[&str]) -> Result<(), DataplaneError> {
        let _serialized = self.cmd_lock.lock().unwrap();
        debug!(%program, ?args, "dataplane command");
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| DataplaneError::CommandFailed(format!("{program}: {e}")))?;
        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(DataplaneError::CommandFailed(format!(
                "{program} {}: {}",
                args.join(" "),
                stderr.trim()
            )))
        }
    }

    /// Same as [`run`](Self::run) but failures are expected (cleanup of
    /// rules that may not exist).
    fn run_quiet(&self, program: &str, args: &[&str]) {
        if let Err(e) = self.run(program, args) {
            debug!(error = %e, "cleanup command failed (ignored)");
        }
    }

    fn table_of(state: &LinuxState, dlm: &DlmId) -> Result<u32, DataplaneError> {
        state
            .tables
            .get(dlm)
            .copied()
            .ok_or_else(|| DataplaneError::UnknownLink(dlm.clone()))
    }
}

impl Dataplane for LinuxDataplane {
    fn register_link(&self, dlm: &DlmConfig) -> Result<(), DataplaneError> {
        let table = {
            let mut state = self.state.lock().unwrap();
            if let Some(existing) = state.tables.get(&dlm.id) {
                *existing
            } else {
                let t = state.next_table;
                state.next_table += 1;
                state.tables.insert(dlm.id.clone(), t);
                t
            }
        };
        let table_s = table.to_string();
        let gw = dlm.gateway_ip.to_string();
        self.run(
            "ip",
            &[
                "route", "replace", "default", "via", &gw, "dev", &dlm.egress_interface,
                "table", &table_s,
            ],
        )?;
        info!(link = %dlm.id, table, iface = %dlm.egress_interface, "link registered");
        Ok(())
    }

    fn unregister_link(&self, dlm: &DlmId) -> Result<(), DataplaneError> {
        let table = {
            let mut state = self.state.lock().unwrap();
            let t = Self::table_of(&state, dlm)?;
            state.tables.remove(dlm);
            t
        };
        self.run_quiet("ip", &["route", "flush", "table", &table.to_string()]);
        Ok(())
    }

    fn add_route(
        &self,
        session: &SessionId,
        client_ip: Ipv4Addr,
        dlm: &DlmId,
        dst: Option<Ipv4Net>,
    ) -> Result<(), DataplaneError> {
        let table = {
            let state = self.state.lock().unwrap();
            Self::table_of(&state, dlm)?
        };
        let from = format!("{client_ip}/32");
        let table_s = table.to_string();
        let prio = RULE_PRIORITY_SRC.to_string();
        match dst {
            Some(net) => {
                let to = net.to_string();
                self.run(
                    "ip",
                    &[
                        "rule", "add", "from", &from, "to", &to, "lookup", &table_s,
                        "priority", &prio,
                    ],
                )?;
            }
            None => {
                self.run(
                    "ip",
                    &["rule", "add", "from", &from, "lookup", &table_s, "priority", &prio],
                )?;
            }
        }
        let mut state = self.state.lock().unwrap();
        state.sessions.insert(
            session.clone(),
            SessionRules {
                client_ip,
                dst,
                dlm: dlm.clone(),
                mark: None,
                tft_count: 0,
            },
        );
        Ok(())
    }

    fn switch_route(&self, session: &SessionId, new_dlm: &DlmId) -> Result<(), DataplaneError> {
        let (client_ip, dst, mark, new_table) = {
            let state = self.state.lock().unwrap();
            let rules = state
                .sessions
                .get(session)
                .ok_or_else(|| DataplaneError::UnknownSession(session.clone()))?;
            (
                rules.client_ip,
                rules.dst,
                rules.mark,
                Self::table_of(&state, new_dlm)?,
            )
        };

        // Remove-then-add; the rule priorities keep ordering stable.
        let from = format!("{client_ip}/32");
        let table_s = new_table.to_string();
        let prio_src = RULE_PRIORITY_SRC.to_string();
        self.run_quiet("ip", &["rule", "del", "from", &from, "priority", &prio_src]);
        match dst {
            Some(net) => {
                let to = net.to_string();
                self.run(
                    "ip",
                    &[
                        "rule", "add", "from", &from, "to", &to, "lookup", &table_s,
                        "priority", &prio_src,
                    ],
                )?;
            }
            None => {
                self.run(
                    "ip",
                    &["rule", "add", "from", &from, "lookup", &table_s, "priority", &prio_src],
                )?;
            }
        }
        if let Some(mark) = mark {
            let fwmark = format!("{mark:#x}");
            let prio_mark = RULE_PRIORITY_MARK.to_string();
            self.run_quiet("ip", &["rule", "del", "fwmark", &fwmark, "priority", &prio_mark]);
            self.run(
                "ip",
                &["rule", "add", "fwmark", &fwmark, "lookup", &table_s, "priority", &prio_mark],
            )?;
        }

        let mut state = self.state.lock().unwrap();
        if let Some(rules) = state.sessions.get_mut(session) {
            rules.dlm = new_dlm.clone();
        }
        Ok(())
    }

    fn add_tft(
        &self,
        session: &SessionId,
        mark: u32,
        tft: &TftSpec,
        dlm: &DlmId,
    ) -> Result<(), DataplaneError> {
        let (table, first_tft) = {
            let state = self.state.lock().unwrap();
            let rules = state
                .sessions
                .get(session)
                .ok_or_else(|| DataplaneError::UnknownSession(session.clone()))?;
            (Self::table_of(&state, dlm)?, rules.mark.is_none())
        };

        let mark_hex = format!("{mark:#x}");
        let mut args: Vec<String> =
            vec!["add".into(), "rule".into(), "inet".into(), "magic".into(), "marks".into()];
        if let Some(src) = tft.src {
            args.extend(["ip".into(), "saddr".into(), src.to_string()]);
        }
        if let Some(dst) = tft.dst {
            args.extend(["ip".into(), "daddr".into(), dst.to_string()]);
        }
        if tft.protocol != 0 {
            args.extend(["ip".into(), "protocol".into(), tft.protocol.to_string()]);
        }
        if let Some(ports) = tft.dst_ports {
            if tft.protocol == 6 || tft.protocol == 17 {
                let proto = if tft.protocol == 6 { "tcp" } else { "udp" };
                args.extend([
                    proto.into(),
                    "dport".into(),
                    format!("{}-{}", ports.start, ports.end),
                ]);
            }
        }
        args.extend(["meta".into(), "mark".into(), "set".into(), mark_hex.clone()]);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run("nft", &arg_refs)?;

        // One fwmark rule per session, shared by all its TFTs.
        if first_tft {
            let table_s = table.to_string();
            let prio_mark = RULE_PRIORITY_MARK.to_string();
            self.run(
                "ip",
                &["rule", "add", "fwmark", &mark_hex, "lookup", &table_s, "priority", &prio_mark],
            )?;
        }

        let mut state = self.state.lock().unwrap();
        if let Some(rules) = state.sessions.get_mut(session) {
            rules.mark = Some(mark);
            rules.tft_count += 1;
        }
        Ok(())
    }

    fn remove_all_for(&self, session: &SessionId) -> Result<(), DataplaneError> {
        let Some(rules) = self.state.lock().unwrap().sessions.remove(session) else {
            return Ok(()); // idempotent
        };
        let from = format!("{}/32", rules.client_ip);
        self.run_quiet(
            "ip",
            &["rule", "del", "from", &from, "priority", &RULE_PRIORITY_SRC.to_string()],
        );
        if let Some(mark) = rules.mark {
            self.run_quiet(
                "ip",
                &[
                    "rule", "del", "fwmark", &format!("{mark:#x}"),
                    "priority", &RULE_PRIORITY_MARK.to_string(),
                ],
            );
            // The mark rules in the nft chain are flushed wholesale on
            // teardown; individual deletion requires handle tracking which
            // the sweep below covers.
        }
        debug!(session = %session, "dataplane rules removed");
        Ok(())
    }

    fn whitelist_control(&self, ip: Ipv4Addr) -> Result<(), DataplaneError> {
        let element = format!("{{ {ip} }}");
        self.run(
            "nft",
            &["add", "element", "inet", "magic", "control_allow", &element],
        )
    }

    fn whitelist_data(&self, ip: Ipv4Addr) -> Result<(), DataplaneError> {
        let element = format!("{{ {ip} }}");
        self.run(
            "nft",
            &["add", "element", "inet", "magic", "data_allow", &element],
        )
    }

    fn teardown(&self) -> Result<(), DataplaneError> {
        let sessions: Vec<SessionId> = {
            let state = self.state.lock().unwrap();
            state.sessions.keys().cloned().collect()
        };
        for session in sessions {
            let _ = self.remove_all_for(&session);
        }
        let tables: Vec<u32> = {
            let mut state = self.state.lock().unwrap();
            let t = state.tables.values().copied().collect();
            state.tables.clear();
            t
        };
        for table in tables {
            self.run_quiet("ip", &["route", "flush", "table", &table.to_string()]);
        }
        self.run_quiet("nft", &["delete", "table", "inet", "magic"]);
        warn!("dataplane torn down");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Recording backend (tests, non-Linux hosts, --dataplane none)
// ---------------------------------------------------------------------------

/// One recorded dataplane operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataplaneOp {
    /// `register_link`.
    RegisterLink(DlmId),
    /// `unregister_link`.
    UnregisterLink(DlmId),
    /// `add_route`.
    AddRoute {
        /// Session owning the rule.
        session: SessionId,
        /// Pinned client address.
        client_ip: Ipv4Addr,
        /// Target link.
        dlm: DlmId,
    },
    /// `switch_route`.
    SwitchRoute {
        /// Session whose rules moved.
        session: SessionId,
        /// New target link.
        dlm: DlmId,
    },
    /// `add_tft`.
    AddTft {
        /// Session owning the mark.
        session: SessionId,
        /// The shared session mark.
        mark: u32,
    },
    /// `remove_all_for`.
    RemoveAll(SessionId),
    /// `whitelist_control`.
    WhitelistControl(Ipv4Addr),
    /// `whitelist_data`.
    WhitelistData(Ipv4Addr),
    /// `teardown`.
    Teardown,
}

/// In-memory dataplane that records every operation instead of touching the
/// kernel. Used by tests and when the daemon runs with the dataplane
/// disabled.
#[derive(Default)]
pub struct RecordingDataplane {
    ops: Mutex<Vec<DataplaneOp>>,
    fail: Mutex<bool>,
}

impl RecordingDataplane {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail (failure-path tests).
    pub fn set_fail(&self, fail: bool) {
        *self.fail.lock().unwrap() = fail;
    }

    /// Snapshot of the recorded operations.
    pub fn ops(&self) -> Vec<DataplaneOp> {
        self.ops.lock().unwrap().clone()
    }

    /// True when a live (not yet removed) route exists for the session.
    pub fn has_route(&self, session: &SessionId) -> bool {
        let ops = self.ops.lock().unwrap();
        let mut live = false;
        for op in ops.iter() {
            match op {
                DataplaneOp::AddRoute { session: s, .. } if s == session => live = true,
                DataplaneOp::RemoveAll(s) if s == session => live = false,
                DataplaneOp::Teardown => live = false,
                _ => {}
            }
        }
        live
    }

    /// The link a session's route currently points at.
    pub fn route_target(&self, session: &SessionId) -> Option<DlmId> {
        let ops = self.ops.lock().unwrap();
        let mut target = None;
        for op in ops.iter() {
            match op {
                DataplaneOp::AddRoute { session: s, dlm, .. } if s == session => {
                    target = Some(dlm.clone());
                }
                DataplaneOp::SwitchRoute { session: s, dlm } if s == session => {
                    target = Some(dlm.clone());
                }
                DataplaneOp::RemoveAll(s) if s == session => target = None,
                _ => {}
            }
        }
        target
    }

    /// True when the address is on the data whitelist.
    pub fn data_whitelisted(&self, ip: Ipv4Addr) -> bool {
        self.ops
            .lock()
            .unwrap()
            .iter()
            .any(|op| matches!(op, DataplaneOp::WhitelistData(i) if *i == ip))
    }

    /// Number of live TFT marks recorded for the session.
    pub fn tft_count(&self, session: &SessionId) -> usize {
        let ops = self.ops.lock().unwrap();
        let mut count = 0;
        for op in ops.iter() {
            match op {
                DataplaneOp::AddTft { session: s, .. } if s == session => count += 1,
                DataplaneOp::RemoveAll(s) if s == session => count = 0,
                _ => {}
            }
        }
        count
    }

    fn record(&self, op: DataplaneOp) -> Result<(), DataplaneError> {
        if *self.fail.lock().unwrap() {
            return Err(DataplaneError::Injected);
        }
        self.ops.lock().unwrap().push(op);
        Ok(())
    }
}

impl Dataplane for RecordingDataplane {
    fn register_link(&self, dlm: &DlmConfig) -> Result<(), DataplaneError> {
        self.record(DataplaneOp::RegisterLink(dlm.id.clone()))
    }

    fn unregister_link(&self, dlm: &DlmId) -> Result<(), DataplaneError> {
        self.record(DataplaneOp::UnregisterLink(dlm.clone()))
    }

    fn add_route(
        &self,
        session: &SessionId,
        client_ip: Ipv4Addr,
        dlm: &DlmId,
        _dst: Option<Ipv4Net>,
    ) -> Result<(), DataplaneError> {
        self.record(DataplaneOp::AddRoute {
            session: session.clone(),
            client_ip,
            dlm: dlm.clone(),
        })
    }

    fn switch_route(&self, session: &SessionId, new_dlm: &DlmId) -> Result<(), DataplaneError> {
        self.record(DataplaneOp::SwitchRoute {
            session: session.clone(),
            dlm: new_dlm.clone(),
        })
    }

    fn add_tft(
        &self,
        session: &SessionId,
        mark: u32,
        _tft: &TftSpec,
        _dlm: &DlmId,
    ) -> Result<(), DataplaneError> {
        self.record(DataplaneOp::AddTft {
            session: session.clone(),
            mark,
        })
    }

    fn remove_all_for(&self, session: &SessionId) -> Result<(), DataplaneError> {
        self.record(DataplaneOp::RemoveAll(session.clone()))
    }

    fn whitelist_control(&self, ip: Ipv4Addr) -> Result<(), DataplaneError> {
        self.record(DataplaneOp::WhitelistControl(ip))
    }

    fn whitelist_data(&self, ip: Ipv4Addr) -> Result<(), DataplaneError> {
        self.record(DataplaneOp::WhitelistData(ip))
    }

    fn teardown(&self) -> Result<(), DataplaneError> {
        self.record(DataplaneOp::Teardown)
    }
}

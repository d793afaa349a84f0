//! Policy engine: traffic classification and link selection.
//!
//! Selection walks the classified traffic class's path preferences by
//! ascending rank and takes the first candidate that survives every
//! constraint: permit/prohibit action, caller exclusions, the client's
//! allowed-DLM set, WoW restrictions, security grade, latency bound,
//! coverage envelope and free-bandwidth headroom. A switch away from a
//! healthy current link is additionally damped by the global switching
//! policy (minimum dwell time + hysteresis percentage).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use magic_models::{
    AircraftState, CentralPolicy, DlmConfig, DlmId, FlightPhase, Kbps, PolicyDenyReason,
};
use tracing::{debug, trace};

/// Live load figures for one link, maintained by the DLM adapter.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinkLoad {
    /// Forward kbps currently reserved on the link.
    pub allocated_forward: Kbps,
    /// Return kbps currently reserved.
    pub allocated_return: Kbps,
    /// Bearers currently reserved.
    pub bearers: u32,
    /// False while the DLM reports the link down.
    pub up: bool,
}

/// Everything the engine needs to rank links for one request.
#[derive(Debug, Clone)]
pub struct PolicyRequest {
    /// Profile name used for classification patterns.
    pub profile_name: String,
    /// Requested bandwidth, forward.
    pub requested_forward: Kbps,
    /// Requested bandwidth, return.
    pub requested_return: Kbps,
    /// Floor below which the grant is useless to the client.
    pub required_forward: Kbps,
    /// Return floor.
    pub required_return: Kbps,
    /// Priority class, 1–9.
    pub priority_class: u8,
    /// Requested QoS level.
    pub qos_level: u8,
    /// Flight phase to select the rule set with.
    pub flight_phase: FlightPhase,
    /// DLMs the client may use at all.
    pub allowed_dlms: Vec<DlmId>,
    /// Links already tried and failed for this request.
    pub exclude: Vec<DlmId>,
    /// Link the session currently sits on, for hysteresis.
    pub current_link: Option<DlmId>,
    /// When the session last switched links.
    pub last_link_switch_at: Option<DateTime<Utc>>,
    /// Remaining client quota per direction; `None` = unlimited.
    pub client_available_forward: Option<Kbps>,
    /// Remaining client quota, return direction.
    pub client_available_return: Option<Kbps>,
}

/// A successful selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicySelection {
    /// The chosen link.
    pub dlm_id: DlmId,
    /// Granted forward bandwidth after all caps.
    pub granted_forward: Kbps,
    /// Granted return bandwidth.
    pub granted_return: Kbps,
    /// Effective QoS level.
    pub qos_level: u8,
    /// Traffic class the request was classified into.
    pub traffic_class: String,
}

/// The engine itself: immutable configuration plus per-call context.
pub struct PolicyEngine {
    dlms: Vec<DlmConfig>,
    policy: CentralPolicy,
}

/// Per-call dynamic context.
pub struct PolicyContext<'a> {
    /// Current link loads keyed by DLM id.
    pub loads: &'a HashMap<DlmId, LinkLoad>,
    /// Latest aircraft state sample.
    pub aircraft: &'a AircraftState,
    /// True while the aircraft data source is unavailable or stale.
    pub degraded: bool,
    /// Evaluation time, injected for testability.
    pub now: DateTime<Utc>,
}

impl PolicyEngine {
    /// Build the engine over the loaded configuration.
    pub fn new(dlms: Vec<DlmConfig>, policy: CentralPolicy) -> Self {
        PolicyEngine { dlms, policy }
    }

    /// The central policy document.
    pub fn policy(&self) -> &CentralPolicy {
        &self.policy
    }

    /// Classify and select a link for the request.
    ///
    /// # Errors
    ///
    /// Returns the machine-friendly [`PolicyDenyReason`] when no link
    /// survives the constraints.
    pub fn select(
        &self,
        req: &PolicyRequest,
        ctx: &PolicyContext<'_>,
    ) -> Result<PolicySelection, PolicyDenyReason> {
        // In degraded mode only low-QoS traffic is admitted: without
        // aircraft data the engine cannot vouch for coverage-dependent
        // links.
        if ctx.degraded && req.qos_level > 1 {
            debug!(qos = req.qos_level, "degraded mode refuses high-QoS request");
            return Err(PolicyDenyReason::NoCoverage);
        }

        let traffic_class =
            self.policy
                .classify(req.priority_class, req.qos_level, &req.profile_name);

        let ruleset = self
            .policy
            .ruleset_for_phase(req.flight_phase)
            .ok_or(PolicyDenyReason::ConfigNotFound)?;
        let rule = ruleset
            .rules
            .iter()
            .find(|r| r.traffic_class == traffic_class)
            .ok_or(PolicyDenyReason::ConfigNotFound)?;

        let mut prefs: Vec<_> = rule.preferences.iter().collect();
        prefs.sort_by_key(|p| p.ranking);

        let mut saw_candidate = false;
        let mut all_excluded = true;
        let mut coverage_blocked = false;

        for pref in &prefs {
            if pref.action == magic_models::PathAction::Prohibit {
                continue;
            }
            saw_candidate = true;
            if req.exclude.contains(&pref.dlm_id) {
                continue;
            }
            if !req.allowed_dlms.contains(&pref.dlm_id) {
                continue;
            }
            all_excluded = false;

            let dlm = match self.candidate_ok(pref, req, ctx) {
                CandidateCheck::Ok(dlm) => dlm,
                CandidateCheck::NoCoverage => {
                    coverage_blocked = true;
                    continue;
                }
                CandidateCheck::Rejected => continue,
            };
            let load = ctx.loads.get(&dlm.id).copied().unwrap_or_default();
            let free_forward = dlm.max_forward_kbps.saturating_sub(load.allocated_forward);
            let free_return = dlm.max_return_kbps.saturating_sub(load.allocated_return);

            // Hysteresis: staying on a healthy current link beats a nominal
            // improvement. Damping never applies when the current link is
            // itself no longer a valid candidate.
            if let Some(current) = &req.current_link {
                if current != &dlm.id {
                    if let Some(stay) =
                        self.hysteresis_keeps_current(req, ctx, &prefs, current, dlm)
                    {
                        return Ok(stay);
                    }
                }
            }

            return self.grant_on(dlm, free_forward, free_return, req, &traffic_class);
        }

        if !saw_candidate {
            return Err(PolicyDenyReason::ConfigNotFound);
        }
        if all_excluded {
            return Err(PolicyDenyReason::AllLinksExcluded);
        }
        if coverage_blocked {
            return Err(PolicyDenyReason::NoCoverage);
        }
        Err(PolicyDenyReason::NoBw)
    }

    /// Run every per-candidate constraint: enablement, link state, WoW
    /// restrictions, security grade, latency bound, coverage and required
    /// bandwidth headroom.
    fn candidate_ok<'a>(
        &'a self,
        pref: &magic_models::PathPreference,
        req: &PolicyRequest,
        ctx: &PolicyContext<'_>,
    ) -> CandidateCheck<'a> {
        let Some(dlm) = self.dlms.iter().find(|d| d.id == pref.dlm_id && d.enabled) else {
            return CandidateCheck::Rejected;
        };
        let load = ctx.loads.get(&dlm.id).copied().unwrap_or_default();
        if !load.up {
            trace!(link = %dlm.id, "candidate down");
            return CandidateCheck::Rejected;
        }
        if pref.on_ground_only && !ctx.aircraft.weight_on_wheels {
            trace!(link = %dlm.id, "on-ground-only candidate while airborne");
            return CandidateCheck::Rejected;
        }
        if pref.airborne_only && ctx.aircraft.weight_on_wheels {
            trace!(link = %dlm.id, "airborne-only candidate while grounded");
            return CandidateCheck::Rejected;
        }
        if dlm.security_level < pref.required_security_level {
            return CandidateCheck::Rejected;
        }
        if let Some(max_latency) = pref.max_latency_ms {
            if dlm.latency_ms > max_latency {
                return CandidateCheck::Rejected;
            }
        }
        if dlm.coverage.is_some() {
            if ctx.degraded || !ctx.aircraft.data_valid {
                // No trustworthy position: skip coverage-bound links.
                return CandidateCheck::NoCoverage;
            }
            if !dlm.covers(
                ctx.aircraft.latitude,
                ctx.aircraft.longitude,
                ctx.aircraft.altitude_ft,
            ) {
                return CandidateCheck::NoCoverage;
            }
        }
        if free_headroom(dlm, &load).0 < req.required_forward
            || free_headroom(dlm, &load).1 < req.required_return
        {
            trace!(link = %dlm.id, "insufficient headroom");
            return CandidateCheck::Rejected;
        }
        CandidateCheck::Ok(dlm)
    }

    /// Decide whether switching damping keeps the session on its current
    /// link. Returns the stay-put selection when it does; `None` lets the
    /// candidate win.
    fn hysteresis_keeps_current(
        &self,
        req: &PolicyRequest,
        ctx: &PolicyContext<'_>,
        prefs: &[&magic_models::PathPreference],
        current: &DlmId,
        candidate: &DlmConfig,
    ) -> Option<PolicySelection> {
        // The current link must still be a permitted, valid candidate of
        // this rule, otherwise the switch is mandatory.
        let current_pref = prefs.iter().find(|p| {
            p.dlm_id == *current && p.action == magic_models::PathAction::Permit
        })?;
        let current_dlm = match self.candidate_ok(current_pref, req, ctx) {
            CandidateCheck::Ok(dlm) => dlm,
            _ => return None,
        };
        let current_load = ctx.loads.get(current).copied().unwrap_or_default();

        let switching = self.policy.switching;
        let stay = || {
            let (free_forward, free_return) = free_headroom(current_dlm, &current_load);
            let traffic_class =
                self.policy
                    .classify(req.priority_class, req.qos_level, &req.profile_name);
            self.grant_on(current_dlm, free_forward, free_return, req, &traffic_class)
                .ok()
        };

        if let Some(switched_at) = req.last_link_switch_at {
            let dwell = (ctx.now - switched_at).num_seconds();
            if dwell >= 0 && dwell < i64::from(switching.min_dwell_secs) {
                debug!(link = %current, dwell, "dwell time keeps current link");
                return stay();
            }
        }

        let current_free_pct = free_percent(current_dlm, &current_load);
        let candidate_load = ctx.loads.get(&candidate.id).copied().unwrap_or_default();
        let candidate_free_pct = free_percent(candidate, &candidate_load);
        if candidate_free_pct < current_free_pct + switching.hysteresis_percent {
            debug!(
                link = %current,
                current_free_pct,
                candidate_free_pct,
                "hysteresis keeps current link"
            );
            return stay();
        }
        None
    }

    fn grant_on(
        &self,
        dlm: &DlmConfig,
        free_forward: Kbps,
        free_return: Kbps,
        req: &PolicyRequest,
        traffic_class: &str,
    ) -> Result<PolicySelection, PolicyDenyReason> {
        let mut granted_forward = req.requested_forward.min(free_forward);
        let mut granted_return = req.requested_return.min(free_return);

        let mut quota_bound = false;
        if let Some(avail) = req.client_available_forward {
            if avail < granted_forward {
                granted_forward = avail;
                quota_bound = true;
            }
        }
        if let Some(avail) = req.client_available_return {
            if avail < granted_return {
                granted_return = avail;
                quota_bound = true;
            }
        }

        if granted_forward < req.required_forward || granted_return < req.required_return {
            return Err(if quota_bound {
                PolicyDenyReason::QuotaExceeded
            } else {
                PolicyDenyReason::NoBw
            });
        }

        let qos_level = if dlm.supports_qos(req.qos_level) {
            req.qos_level
        } else {
            // Fall back to the best level the link supports below the
            // requested one; the profile already vetted the request.
            dlm.supported_qos
                .iter()
                .copied()
                .filter(|&q| q <= req.qos_level)
                .max()
                .unwrap_or(0)
        };

        Ok(PolicySelection {
            dlm_id: dlm.id.clone(),
            granted_forward,
            granted_return,
            qos_level,
            traffic_class: traffic_class.to_string(),
        })
    }
}

enum CandidateCheck<'a> {
    Ok(&'a DlmConfig),
    NoCoverage,
    Rejected,
}

fn free_headroom(dlm: &DlmConfig, load: &LinkLoad) -> (Kbps, Kbps) {
    (
        dlm.max_forward_kbps.saturating_sub(load.allocated_forward),
        dlm.max_return_kbps.saturating_sub(load.allocated_return),
    )
}

fn free_percent(dlm: &DlmConfig, load: &LinkLoad) -> u32 {
    let cap = dlm.max_forward_kbps.0;
    if cap == 0 {
        return 100;
    }
    let free = cap.saturating_sub(load.allocated_forward.0);
    free * 100 / cap
}

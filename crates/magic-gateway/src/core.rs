//! The assembled control engine.
//!
//! [`GatewayCore`] bundles every component and owns the two routines shared
//! by the protocol handlers and the revalidation path: resource allocation
//! (policy → DLM reserve with fallback → store commit → dataplane → meter →
//! CDR) and session teardown (the exact reverse). Handlers stay thin
//! pipelines over these.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use magic_models::{
    AirportCondition, AltitudeCondition, ClientId, ClientProfile, CommunicationRequest, DlmId,
    FlightPhase, Kbps, MagicStatus, ProfileName, ResourceGrant, SessionId, TftSpec,
};
use tracing::{debug, info, warn};

use crate::adif::AircraftMonitor;
use crate::cdr::CdrManager;
use crate::config::GatewayConfig;
use crate::dataplane::Dataplane;
use crate::dlm::DlmAdapter;
use crate::meter::TrafficMeter;
use crate::policy::{PolicyContext, PolicyEngine, PolicyRequest};
use crate::push::PushEngine;
use crate::queue::PendingQueue;
use crate::session::{QuotaSeed, SessionState, SessionStore, MAX_TFT_PER_SESSION};

/// Distinct alternative links tried after the first selection fails.
pub const FALLBACK_MAX_LINKS: usize = 4;

/// Per-client rate limiting of status requests.
#[derive(Default)]
pub struct StatusRateLimiter {
    last_request: Mutex<HashMap<ClientId, DateTime<Utc>>>,
}

impl StatusRateLimiter {
    /// Check and stamp: true when the client may be served now.
    pub fn allow(&self, client: &ClientId, limit_secs: u32) -> bool {
        if limit_secs == 0 {
            return true;
        }
        let now = Utc::now();
        let mut table = self.last_request.lock().unwrap();
        if let Some(last) = table.get(client) {
            if (now - *last).num_seconds() < i64::from(limit_secs) {
                return false;
            }
        }
        table.insert(client.clone(), now);
        true
    }
}

/// A request normalised against the client profile and live aircraft state:
/// bandwidths in kbps, absent parameters filled from the profile, activation
/// conditions parsed.
#[derive(Debug, Clone)]
pub struct NormalizedRequest {
    /// Profile the request runs under.
    pub profile_name: ProfileName,
    /// Requested forward bandwidth, capped at the profile maximum.
    pub requested_forward: Kbps,
    /// Requested return bandwidth.
    pub requested_return: Kbps,
    /// Required forward floor.
    pub required_forward: Kbps,
    /// Required return floor.
    pub required_return: Kbps,
    /// Effective priority class.
    pub priority_class: u8,
    /// Effective QoS level.
    pub qos_level: u8,
    /// Flight phase, from the request or the live aircraft state.
    pub flight_phase: FlightPhase,
    /// Restrict selection to this link, when the request pinned one.
    pub dlm_pin: Option<DlmId>,
    /// Queue the request when resources are unavailable.
    pub keep_request: bool,
    /// Whether a CDR should account the session.
    pub accounting_enabled: bool,
    /// Queue timeout override.
    pub timeout_secs: Option<u32>,
    /// Parsed altitude activation condition.
    pub altitude: AltitudeCondition,
    /// Parsed airport activation condition.
    pub airport: AirportCondition,
    /// Every submitted TFT row.
    pub tfts: Vec<TftSpec>,
}

/// Handler-level failure: both code spaces plus a diagnostic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerFailure {
    /// Protocol-level result.
    pub result: magic_models::ResultCode,
    /// Detailed MAGIC status.
    pub status: MagicStatus,
    /// Diagnostic text.
    pub message: String,
}

impl HandlerFailure {
    /// Shorthand constructor.
    pub fn new(
        result: magic_models::ResultCode,
        status: MagicStatus,
        message: impl Into<String>,
    ) -> Self {
        HandlerFailure {
            result,
            status,
            message: message.into(),
        }
    }
}

/// Allocation failure with a hint whether queueing could help.
#[derive(Debug, Clone)]
pub struct AllocFailure {
    /// Detailed MAGIC status.
    pub status: MagicStatus,
    /// Diagnostic text.
    pub message: String,
    /// True when the failure is a resource shortage a later retry might
    /// resolve.
    pub queueable: bool,
}

/// Why a session is being torn down; decides the farewell notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownReason {
    /// Explicit session termination request.
    ClientRequest,
    /// Idle or authorization timeout.
    Timeout,
    /// Evicted by a duplicate authentication.
    Eviction,
    /// Gateway shutting down.
    Shutdown,
    /// An activation condition is no longer met.
    ConditionViolated(MagicStatus),
}

impl TeardownReason {
    /// The MAGIC status announced in the farewell MNTR, when one is due.
    pub fn notify_status(self) -> Option<MagicStatus> {
        match self {
            TeardownReason::ClientRequest | TeardownReason::Eviction => None,
            TeardownReason::Timeout => Some(MagicStatus::SessionTimeout),
            TeardownReason::Shutdown => Some(MagicStatus::GatewayShutdown),
            TeardownReason::ConditionViolated(status) => Some(status),
        }
    }
}

/// The assembled engine.
pub struct GatewayCore {
    /// Immutable configuration.
    pub config: Arc<GatewayConfig>,
    /// Session and client-context store.
    pub sessions: Arc<SessionStore>,
    /// Policy engine.
    pub policy: PolicyEngine,
    /// DLM adapter.
    pub dlm: Arc<DlmAdapter>,
    /// Dataplane programmer.
    pub dataplane: Arc<dyn Dataplane>,
    /// Traffic meter.
    pub meter: Arc<TrafficMeter>,
    /// CDR manager.
    pub cdr: Arc<CdrManager>,
    /// Pending-request queue.
    pub queue: Arc<PendingQueue>,
    /// Aircraft state monitor.
    pub aircraft: Arc<AircraftMonitor>,
    /// Push engine.
    pub push: Arc<PushEngine>,
    /// Status-request rate limiter.
    pub status_limiter: StatusRateLimiter,
}

impl GatewayCore {
    /// Identity pair used on every answer.
    pub fn identity(&self) -> (ClientId, magic_models::Realm) {
        (
            self.config.settings.identity.origin_host.clone(),
            self.config.settings.identity.origin_realm.clone(),
        )
    }

    /// Quota seed copied from a profile at session creation.
    pub fn quota_seed(profile: &ClientProfile) -> QuotaSeed {
        QuotaSeed {
            max_forward: profile.bandwidth.max_forward_kbps,
            max_return: profile.bandwidth.max_return_kbps,
            guaranteed_forward: profile.bandwidth.guaranteed_forward_kbps,
            guaranteed_return: profile.bandwidth.guaranteed_return_kbps,
            max_concurrent_sessions: profile.session.max_concurrent_sessions,
            session_timeout_secs: profile.session.session_timeout_secs,
        }
    }

    /// Normalise a communication request against a profile and the live
    /// aircraft state: wire bps → kbps, profile defaults filled in,
    /// requested bandwidth capped at the profile maxima, activation
    /// conditions parsed.
    ///
    /// # Errors
    ///
    /// Structural problems (bad phase, bad condition syntax, disallowed QoS,
    /// pinned link outside the allowed set, too many TFTs).
    pub fn normalize_request(
        &self,
        profile: &ClientProfile,
        comm: &CommunicationRequest,
    ) -> Result<NormalizedRequest, HandlerFailure> {
        use magic_models::ResultCode;

        let mut requested_forward = comm
            .requested_forward_bps
            .map(Kbps::from_bps)
            .unwrap_or_else(|| {
                if profile.bandwidth.default_request_kbps.is_zero() {
                    profile.bandwidth.max_forward_kbps
                } else {
                    profile.bandwidth.default_request_kbps
                }
            });
        let mut requested_return = comm
            .requested_return_bps
            .map(Kbps::from_bps)
            .unwrap_or(profile.bandwidth.max_return_kbps);
        // A stop request stays a stop request; otherwise cap to the quota.
        if !comm.is_stop_request() {
            if !profile.bandwidth.max_forward_kbps.is_zero() {
                requested_forward = requested_forward.min(profile.bandwidth.max_forward_kbps);
            }
            if !profile.bandwidth.max_return_kbps.is_zero() {
                requested_return = requested_return.min(profile.bandwidth.max_return_kbps);
            }
        }

        let required_forward = comm
            .required_forward_bps
            .map(Kbps::from_bps)
            .unwrap_or(Kbps::ZERO)
            .min(requested_forward);
        let required_return = comm
            .required_return_bps
            .map(Kbps::from_bps)
            .unwrap_or(Kbps::ZERO)
            .min(requested_return);

        let priority_class = comm.priority_class.unwrap_or(profile.qos.priority_class);
        let qos_level = comm.qos_level.unwrap_or(profile.qos.default_level);
        if !profile.is_qos_allowed(qos_level) {
            return Err(HandlerFailure::new(
                ResultCode::InvalidValue,
                MagicStatus::InvalidParameter,
                format!("QoS level {qos_level} not allowed for this client"),
            ));
        }

        let state = self.aircraft.state();
        let flight_phase = match &comm.flight_phase {
            Some(text) => FlightPhase::parse(text).map_err(|e| {
                HandlerFailure::new(
                    ResultCode::InvalidValue,
                    MagicStatus::InvalidParameter,
                    e.to_string(),
                )
            })?,
            // No phase named: take the live one. An aircraft on the ground
            // is never defaulted into Cruise.
            None => state.flight_phase,
        };

        let dlm_pin = match &comm.dlm_id {
            Some(pin) => {
                if !profile.is_dlm_allowed(pin) {
                    return Err(HandlerFailure::new(
                        ResultCode::NotAuthorized,
                        MagicStatus::InvalidParameter,
                        format!("link {pin} not allowed for this client"),
                    ));
                }
                Some(pin.clone())
            }
            None => None,
        };

        let altitude = match &comm.altitude {
            Some(expr) => AltitudeCondition::parse(expr).map_err(|e| {
                HandlerFailure::new(
                    ResultCode::InvalidValue,
                    MagicStatus::InvalidParameter,
                    e.to_string(),
                )
            })?,
            None => AltitudeCondition::default(),
        };
        let airport = match &comm.airport {
            Some(expr) => AirportCondition::parse(expr).map_err(|e| {
                HandlerFailure::new(
                    ResultCode::InvalidValue,
                    MagicStatus::InvalidParameter,
                    e.to_string(),
                )
            })?,
            None => AirportCondition::default(),
        };

        let tfts: Vec<TftSpec> = comm.all_tfts().copied().collect();
        if tfts.len() > MAX_TFT_PER_SESSION {
            return Err(HandlerFailure::new(
                ResultCode::InvalidValue,
                MagicStatus::TftInvalid,
                format!("at most {MAX_TFT_PER_SESSION} TFT rules per session"),
            ));
        }

        Ok(NormalizedRequest {
            profile_name: profile.profile_name.clone(),
            requested_forward,
            requested_return,
            required_forward,
            required_return,
            priority_class,
            qos_level,
            flight_phase,
            dlm_pin,
            keep_request: comm.keep_request.unwrap_or(false),
            accounting_enabled: comm.accounting_enabled.unwrap_or(true),
            timeout_secs: comm.timeout_secs,
            altitude,
            airport,
            tfts,
        })
    }

    /// Check the ARINC activation conditions for a normalised request
    /// against the current aircraft state.
    ///
    /// # Errors
    ///
    /// The specific condition code plus a diagnostic.
    pub fn check_activation_conditions(
        &self,
        profile: &ClientProfile,
        altitude: &AltitudeCondition,
        airport: &AirportCondition,
        phase: FlightPhase,
    ) -> Result<(), (MagicStatus, String)> {
        if !profile.is_phase_allowed(phase) {
            return Err((
                MagicStatus::FlightPhaseNotAllowed,
                format!("flight phase {phase} not allowed for this client"),
            ));
        }
        let state = self.aircraft.state();
        #[allow(clippy::cast_possible_truncation)]
        let altitude_ft = state.altitude_ft.round() as i32;
        if !altitude.is_unrestricted() && !altitude.admits(altitude_ft) {
            return Err((
                MagicStatus::ConditionAltitudeViolated,
                format!("altitude {altitude_ft} ft outside the requested ranges"),
            ));
        }
        if !airport.is_unrestricted() && !airport.admits(state.nearest_airport.as_deref()) {
            return Err((
                MagicStatus::ConditionAirportViolated,
                "current airport outside the requested set".to_string(),
            ));
        }
        Ok(())
    }

    /// Allocate resources for a session and drive it to `Active`:
    /// policy selection, DLM reservation (3 attempts per link, up to
    /// [`FALLBACK_MAX_LINKS`] alternates), store commit, dataplane
    /// programming, meter registration and CDR opening.
    ///
    /// # Errors
    ///
    /// [`AllocFailure`] with the detailed status; `queueable` marks
    /// resource shortages.
    pub async fn allocate_and_activate(
        &self,
        session_id: &SessionId,
        profile: &ClientProfile,
        norm: &NormalizedRequest,
    ) -> Result<ResourceGrant, AllocFailure> {
        let Some(session) = self.sessions.find_by_id(session_id) else {
            return Err(AllocFailure {
                status: MagicStatus::Unknown,
                message: format!("session {session_id} vanished"),
                queueable: false,
            });
        };

        // Quota preview. The session's current grant is refunded during the
        // commit, so it counts as available here.
        let preview = self
            .sessions
            .can_allocate(&session.client_id, norm.requested_forward, norm.requested_return);
        let Some((avail_forward, avail_return)) = preview else {
            return Err(AllocFailure {
                status: MagicStatus::NoBandwidth,
                message: "client bandwidth quota exhausted".into(),
                queueable: true,
            });
        };
        let avail_forward = avail_forward + session.granted_forward;
        let avail_return = avail_return + session.granted_return;

        let allowed_dlms = match &norm.dlm_pin {
            Some(pin) => vec![pin.clone()],
            None => profile.link.allowed_dlms.clone(),
        };

        let old_assignment = session
            .assigned_dlm
            .clone()
            .map(|dlm| (dlm, session.bearer_id, session.granted_forward, session.granted_return));
        let had_route = old_assignment.is_some();
        if had_route && session.state == SessionState::Active {
            let _ = self.sessions.set_state(session_id, SessionState::Modifying);
        }

        let aircraft_state = self.aircraft.state();
        let mut exclude: Vec<DlmId> = Vec::new();
        let mut old_released = false;
        let mut last_reason = MagicStatus::NoBandwidth;

        for round in 0..=FALLBACK_MAX_LINKS {
            let loads = self.dlm.load_snapshot();
            let request = PolicyRequest {
                profile_name: norm.profile_name.to_string(),
                requested_forward: norm.requested_forward,
                requested_return: norm.requested_return,
                required_forward: norm.required_forward,
                required_return: norm.required_return,
                priority_class: norm.priority_class,
                qos_level: norm.qos_level,
                flight_phase: norm.flight_phase,
                allowed_dlms: allowed_dlms.clone(),
                exclude: exclude.clone(),
                current_link: session.assigned_dlm.clone(),
                last_link_switch_at: session.last_link_switch_at,
                client_available_forward: (!profile.bandwidth.max_forward_kbps.is_zero())
                    .then_some(avail_forward),
                client_available_return: (!profile.bandwidth.max_return_kbps.is_zero())
                    .then_some(avail_return),
            };
            let ctx = PolicyContext {
                loads: &loads,
                aircraft: &aircraft_state,
                degraded: self.aircraft.degraded(),
                now: Utc::now(),
            };

            let selection = match self.policy.select(&request, &ctx) {
                Ok(sel) => sel,
                Err(reason) => {
                    let status = reason.magic_status();
                    let queueable = matches!(
                        reason,
                        magic_models::PolicyDenyReason::NoBw
                            | magic_models::PolicyDenyReason::QuotaExceeded
                    );
                    self.revert_after_failure(session_id, old_released).await;
                    return Err(AllocFailure {
                        status,
                        message: format!("policy denied: {reason}"),
                        queueable,
                    });
                }
            };

            // Make room before reserving when the assignment changes.
            if let Some((old_dlm, old_bearer, old_fwd, old_ret)) = &old_assignment {
                if !old_released {
                    self.dlm.release(old_dlm, *old_bearer, *old_fwd, *old_ret).await;
                    old_released = true;
                }
            }

            let bearer = match self
                .dlm
                .reserve(
                    &selection.dlm_id,
                    selection.granted_forward,
                    selection.granted_return,
                    selection.qos_level,
                )
                .await
            {
                Ok(bearer) => bearer,
                Err(e) => {
                    debug!(round, link = %selection.dlm_id, error = %e, "reservation failed, trying fallback");
                    last_reason = MagicStatus::LinkError;
                    exclude.push(selection.dlm_id);
                    continue;
                }
            };

            return self
                .commit_activation(session_id, profile, norm, &selection, bearer, had_route)
                .await;
        }

        self.revert_after_failure(session_id, old_released).await;
        Err(AllocFailure {
            status: last_reason,
            message: "no link accepted the reservation".into(),
            queueable: true,
        })
    }

    /// Store commit + dataplane + meter + CDR once a bearer is reserved.
    async fn commit_activation(
        &self,
        session_id: &SessionId,
        profile: &ClientProfile,
        norm: &NormalizedRequest,
        selection: &crate::policy::PolicySelection,
        bearer: magic_models::BearerId,
        had_route: bool,
    ) -> Result<ResourceGrant, AllocFailure> {
        let committed = match self.sessions.assign_link(
            session_id,
            &selection.dlm_id,
            bearer,
            selection.granted_forward,
            selection.granted_return,
        ) {
            Ok(s) => s,
            Err(e) => {
                self.dlm
                    .release(
                        &selection.dlm_id,
                        bearer,
                        selection.granted_forward,
                        selection.granted_return,
                    )
                    .await;
                let _ = self.sessions.set_state(session_id, SessionState::Authenticated);
                return Err(AllocFailure {
                    status: MagicStatus::NoBandwidth,
                    message: e.to_string(),
                    queueable: true,
                });
            }
        };

        let gateway_ip = self
            .config
            .find_dlm(&selection.dlm_id)
            .map(|d| d.gateway_ip);
        let client_ip = committed.client_ip.unwrap_or(Ipv4Addr::UNSPECIFIED);

        // The minimum dataplane state for Active: the source rule and the
        // data whitelist entry. Their failure reverts the activation.
        let route_result = if had_route {
            self.dataplane.switch_route(session_id, &selection.dlm_id)
        } else {
            self.dataplane
                .add_route(session_id, client_ip, &selection.dlm_id, None)
                .and_then(|()| self.dataplane.whitelist_data(client_ip))
        };
        if let Err(e) = route_result {
            warn!(session = %session_id, error = %e, "dataplane programming failed");
            self.dlm
                .release(
                    &selection.dlm_id,
                    bearer,
                    selection.granted_forward,
                    selection.granted_return,
                )
                .await;
            let _ = self.sessions.release_link(session_id);
            let _ = self.sessions.set_state(session_id, SessionState::Authenticated);
            return Err(AllocFailure {
                status: MagicStatus::UnableToComply,
                message: "dataplane programming failed".into(),
                queueable: false,
            });
        }

        // TFT marks: shared mark per session; failures are logged and the
        // session still activates.
        let mark = self.meter.register(session_id);
        if !norm.tfts.is_empty() {
            let _ = self.sessions.clear_tfts(session_id);
            for tft in &norm.tfts {
                if let Err(e) = self.sessions.add_tft(session_id, *tft) {
                    warn!(session = %session_id, error = %e, "TFT row dropped");
                    continue;
                }
                if let Err(e) = self
                    .dataplane
                    .add_tft(session_id, mark, tft, &selection.dlm_id)
                {
                    warn!(session = %session_id, error = %e, "TFT mark installation failed");
                }
            }
        }

        let cdr_id = if norm.accounting_enabled {
            match self.cdr.find_active_by_session(session_id) {
                Some(existing) => Some(existing.cdr_id),
                None => match self.cdr.create(
                    session_id,
                    &committed.client_id,
                    Some(selection.dlm_id.clone()),
                    bearer.0,
                ) {
                    Ok(id) => Some(id),
                    Err(e) => {
                        warn!(session = %session_id, error = %e, "CDR creation failed");
                        None
                    }
                },
            }
        } else {
            None
        };

        let auth_lifetime = profile.session.auth_lifetime_secs;
        let _ = self.sessions.update(session_id, |s| {
            s.profile_name = norm.profile_name.clone();
            s.qos_level = selection.qos_level;
            s.priority_class = norm.priority_class;
            s.meter_mark = mark;
            s.gateway_ip = gateway_ip;
            s.cdr_id = cdr_id;
            s.keep_request = norm.keep_request;
            s.altitude_condition = norm.altitude.clone();
            s.airport_condition = norm.airport.clone();
            s.auth_expires_at = Utc::now() + chrono::Duration::seconds(i64::from(auth_lifetime));
            s.auth_grace_secs = profile.session.auth_grace_secs;
        });

        info!(
            session = %session_id,
            link = %selection.dlm_id,
            %bearer,
            fwd = %committed.granted_forward,
            ret = %committed.granted_return,
            class = %selection.traffic_class,
            "session activated"
        );

        Ok(ResourceGrant {
            dlm_id: selection.dlm_id.clone(),
            bearer_id: bearer,
            granted_forward_bps: committed.granted_forward.as_bps(),
            granted_return_bps: committed.granted_return.as_bps(),
            qos_level: selection.qos_level,
            priority_class: norm.priority_class,
            gateway_ip,
        })
    }

    /// Failed allocation cleanup: a session whose old resource was already
    /// released cannot stay Active/Modifying.
    async fn revert_after_failure(&self, session_id: &SessionId, old_released: bool) {
        if !old_released {
            // Nothing was touched; put a Modifying session back to Active.
            if let Some(s) = self.sessions.find_by_id(session_id) {
                if s.state == SessionState::Modifying {
                    let _ = self.sessions.set_state(session_id, SessionState::Active);
                }
            }
            return;
        }
        let _ = self.sessions.release_link(session_id);
        let _ = self.dataplane.remove_all_for(session_id);
        let _ = self.sessions.set_state(session_id, SessionState::Authenticated);
    }

    /// Tear a session down: close accounting with final counters, remove
    /// dataplane state, release the link and erase the row. Idempotent for
    /// unknown ids. Returns the final traffic totals recorded in the CDR.
    pub async fn teardown_session(
        &self,
        session_id: &SessionId,
        reason: TeardownReason,
    ) -> (u64, u64) {
        let Some(session) = self.sessions.find_by_id(session_id) else {
            return (0, 0);
        };

        if let Some(status) = reason.notify_status() {
            let params = crate::push::NotifyParams {
                status,
                error_message: None,
                report: magic_models::CommunicationReport::default(),
                force: true,
            };
            self.push.notify(session_id, &params);
        }

        let (final_in, final_out) = match self.meter.sample(session_id) {
            Some(reading) => (reading.bytes_in, reading.bytes_out),
            None => (session.bytes_in, session.bytes_out),
        };

        if self.cdr.find_active_by_session(session_id).is_some() {
            if let Err(e) = self.cdr.close(session_id, final_in, final_out) {
                warn!(session = %session_id, error = %e, "CDR close failed");
            }
        }

        if let Err(e) = self.dataplane.remove_all_for(session_id) {
            warn!(session = %session_id, error = %e, "dataplane cleanup failed");
        }
        self.meter.unregister(session_id);

        if let Some(dlm) = &session.assigned_dlm {
            self.dlm
                .release(dlm, session.bearer_id, session.granted_forward, session.granted_return)
                .await;
        }

        self.queue.dequeue(session_id);
        self.push.unregister_outbox(session_id);

        let _ = self.sessions.set_state(session_id, SessionState::Terminating);
        let _ = self.sessions.delete(session_id);
        info!(session = %session_id, ?reason, "session torn down");
        (final_in, final_out)
    }

    /// Refresh the cached traffic counters of a session from the meter and
    /// feed the active CDR. Driven by the maintenance sweep.
    pub fn refresh_traffic(&self, session_id: &SessionId) {
        let Some(reading) = self.meter.sample(session_id) else {
            return;
        };
        let _ = self.sessions.update(session_id, |s| {
            s.bytes_in = reading.bytes_in;
            s.bytes_out = reading.bytes_out;
        });
        if self.cdr.find_active_by_session(session_id).is_some() {
            let _ = self.cdr.update_traffic(
                session_id,
                reading.bytes_in,
                reading.bytes_out,
                reading.packets_in,
                reading.packets_out,
            );
        }
    }
}

//! Session revalidation driven by aircraft-state and link-status events.
//!
//! On every aircraft-state change each active session is re-checked against
//! its profile's flight phases and its requested activation conditions; a
//! violation terminates the session after a notification carrying the
//! matching condition code. Surviving sessions get a fresh policy decision,
//! and a changed selection triggers a handover: old resource released, new
//! one reserved, policy route switched, forced notification with the new
//! gateway address.
//!
//! Link-status events suspend or resume the sessions riding the link and
//! fan a status-change broadcast out to every subscriber.

use std::sync::Arc;

use chrono::Utc;
use magic_models::{
    AircraftState, CommunicationReport, MagicStatus, StatusChangeType,
};
use tracing::{debug, info, warn};

use crate::core::{GatewayCore, NormalizedRequest, TeardownReason};
use crate::dlm::DlmEvent;
use crate::handlers::status::compose_change_report;
use crate::policy::{PolicyContext, PolicyRequest};
use crate::push::NotifyParams;
use crate::session::{Session, SessionState};

/// Re-derive the resource parameters of a live session for a policy recall.
fn norm_from_session(session: &Session) -> NormalizedRequest {
    NormalizedRequest {
        profile_name: session.profile_name.clone(),
        requested_forward: session.granted_forward,
        requested_return: session.granted_return,
        required_forward: magic_models::Kbps::ZERO,
        required_return: magic_models::Kbps::ZERO,
        priority_class: session.priority_class,
        qos_level: session.qos_level,
        flight_phase: magic_models::FlightPhase::Gate, // overwritten by caller
        dlm_pin: None,
        keep_request: session.keep_request,
        accounting_enabled: true,
        timeout_secs: None,
        altitude: session.altitude_condition.clone(),
        airport: session.airport_condition.clone(),
        // TFT marks survive a route switch; nothing to re-install.
        tfts: vec![],
    }
}

/// React to a fresh aircraft-state sample.
pub async fn on_aircraft_state(core: &Arc<GatewayCore>, state: &AircraftState) {
    debug!(
        phase = %state.flight_phase,
        wow = state.weight_on_wheels,
        alt = state.altitude_ft,
        "revalidating sessions against aircraft state"
    );

    for session in core.sessions.sessions_in_state(SessionState::Active) {
        let Some(profile) = core
            .config
            .find_client_by_profile(&session.profile_name)
            .or_else(|| core.config.find_client_by_id(&session.client_id))
            .cloned()
        else {
            continue;
        };

        // Step 1: activation conditions under the new state.
        if let Err((code, message)) = core.check_activation_conditions(
            &profile,
            &session.altitude_condition,
            &session.airport_condition,
            state.flight_phase,
        ) {
            // Map profile-phase violations onto the in-flight condition
            // code; altitude/airport checks already carry theirs.
            let code = if code == MagicStatus::FlightPhaseNotAllowed {
                MagicStatus::ConditionPhaseViolated
            } else {
                code
            };
            warn!(session = %session.id, %code, %message, "activation condition violated");
            core.teardown_session(&session.id, TeardownReason::ConditionViolated(code))
                .await;
            continue;
        }

        // Step 2: fresh policy decision with the same resource parameters.
        let mut norm = norm_from_session(&session);
        norm.flight_phase = state.flight_phase;
        let loads = core.dlm.load_snapshot();
        let request = PolicyRequest {
            profile_name: norm.profile_name.to_string(),
            requested_forward: norm.requested_forward,
            requested_return: norm.requested_return,
            required_forward: norm.required_forward,
            required_return: norm.required_return,
            priority_class: norm.priority_class,
            qos_level: norm.qos_level,
            flight_phase: norm.flight_phase,
            allowed_dlms: profile.link.allowed_dlms.clone(),
            exclude: vec![],
            current_link: session.assigned_dlm.clone(),
            last_link_switch_at: session.last_link_switch_at,
            client_available_forward: None,
            client_available_return: None,
        };
        let ctx = PolicyContext {
            loads: &loads,
            aircraft: state,
            degraded: core.aircraft.degraded(),
            now: Utc::now(),
        };
        let selection = match core.policy.select(&request, &ctx) {
            Ok(sel) => sel,
            Err(reason) => {
                debug!(session = %session.id, %reason, "no link under new context, leaving session as is");
                continue;
            }
        };
        if Some(&selection.dlm_id) == session.assigned_dlm.as_ref() {
            continue;
        }

        // Step 3: handover.
        info!(
            session = %session.id,
            from = %session.assigned_dlm.as_ref().map_or("-", |d| d.as_str()),
            to = %selection.dlm_id,
            "context change triggers handover"
        );
        match core.allocate_and_activate(&session.id, &profile, &norm).await {
            Ok(grant) => {
                let params = NotifyParams {
                    status: MagicStatus::ForcedRerouting,
                    error_message: None,
                    report: CommunicationReport {
                        granted_forward_bps: Some(grant.granted_forward_bps),
                        granted_return_bps: Some(grant.granted_return_bps),
                        dlm_id: Some(grant.dlm_id.clone()),
                        bearer_id: Some(grant.bearer_id),
                        gateway_ip: grant.gateway_ip,
                    },
                    force: true,
                };
                core.push.notify(&session.id, &params);
            }
            Err(failure) => {
                warn!(session = %session.id, status = %failure.status, "handover failed");
            }
        }
    }
}

/// React to a link-status event from the DLM adapter.
pub async fn on_dlm_event(core: &Arc<GatewayCore>, event: &DlmEvent) {
    match event {
        DlmEvent::LinkDown(dlm) => {
            for session in core.sessions.active_sessions_on_link(dlm) {
                if session.state != SessionState::Active {
                    continue;
                }
                match core.sessions.suspend(&session.id) {
                    Ok(_) => {
                        let params = NotifyParams {
                            status: MagicStatus::LinkError,
                            error_message: Some(format!("link {dlm} lost")),
                            report: CommunicationReport {
                                granted_forward_bps: Some(0),
                                granted_return_bps: Some(0),
                                dlm_id: Some(dlm.clone()),
                                ..Default::default()
                            },
                            force: true,
                        };
                        core.push.notify(&session.id, &params);
                    }
                    Err(e) => warn!(session = %session.id, error = %e, "suspend failed"),
                }
            }
            core.push.broadcast(|level| {
                compose_change_report(
                    core,
                    level,
                    StatusChangeType::DlmDown,
                    MagicStatus::LinkError,
                    Some(format!("link {dlm} down")),
                )
            });
        }

        DlmEvent::LinkUp(dlm) => {
            for session in core.sessions.active_sessions_on_link(dlm) {
                if session.state != SessionState::Suspended {
                    continue;
                }
                match core.sessions.resume(&session.id) {
                    Ok(resumed) => {
                        let params = NotifyParams {
                            status: MagicStatus::Success,
                            error_message: None,
                            report: CommunicationReport {
                                granted_forward_bps: Some(resumed.granted_forward.as_bps()),
                                granted_return_bps: Some(resumed.granted_return.as_bps()),
                                dlm_id: Some(dlm.clone()),
                                bearer_id: Some(resumed.bearer_id),
                                gateway_ip: resumed.gateway_ip,
                            },
                            force: true,
                        };
                        core.push.notify(&session.id, &params);
                    }
                    Err(e) => warn!(session = %session.id, error = %e, "resume failed"),
                }
            }
            core.push.broadcast(|level| {
                compose_change_report(
                    core,
                    level,
                    StatusChangeType::DlmUp,
                    MagicStatus::Success,
                    None,
                )
            });
        }

        DlmEvent::LinkDegraded(dlm) => {
            info!(link = %dlm, "link degraded");
            core.push.broadcast(|level| {
                compose_change_report(
                    core,
                    level,
                    StatusChangeType::DlmDegraded,
                    MagicStatus::LinkError,
                    Some(format!("link {dlm} degraded")),
                )
            });
        }
    }
}

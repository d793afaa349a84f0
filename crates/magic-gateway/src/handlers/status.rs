//! Status reporting (SXR → SXA) and the inbound report mirrors (NTR, SCR).
//!
//! Status levels: 1 covers the gateway view (registered clients), 2 the
//! general per-DLM aggregates, 3 both; 6 adds detailed link figures to the
//! DLM view, 7 to everything. Levels 6/7 require the detailed-status
//! permission and are downgraded to 2/3 otherwise. A per-client rate limit
//! (default 5 s) answers `3004` to pollers.

use std::sync::Arc;

use magic_models::{
    AnswerStatus, ClientProfile, DlmStatusSummary, Kbps, LinkStatusDetail, MagicEnvelope,
    MagicMessage, MagicStatus, NotificationAck, NotificationReport, RegisteredClient, ResultCode,
    StatusAnswer, StatusChangeAck, StatusChangeReport, StatusChangeType, StatusRequest,
};
use tracing::{debug, info, warn};

use crate::core::GatewayCore;
use crate::handlers::answer_envelope;
use crate::session::SessionState;

/// Bearer slots a link exposes in status answers.
const MAX_BEARERS_PER_LINK: u32 = 8;

/// The registered-clients list, deduplicated by client id.
fn registered_clients(core: &GatewayCore) -> Vec<RegisteredClient> {
    let mut by_client: std::collections::BTreeMap<magic_models::ClientId, u32> =
        std::collections::BTreeMap::new();
    for session in core.sessions.all_sessions() {
        if matches!(
            session.state,
            SessionState::Authenticated | SessionState::Active | SessionState::Suspended
        ) {
            *by_client.entry(session.client_id).or_insert(0) += 1;
        }
    }
    by_client
        .into_iter()
        .map(|(client_id, session_count)| RegisteredClient {
            client_id,
            session_count,
            multi_session: session_count > 1,
        })
        .collect()
}

/// Per-DLM aggregates, optionally filtered by a caller's allowed-DLM set.
fn dlm_summaries(core: &GatewayCore, filter: Option<&ClientProfile>) -> Vec<DlmStatusSummary> {
    let loads = core.dlm.load_snapshot();
    core.config
        .dlms
        .iter()
        .filter(|dlm| filter.is_none_or(|p| p.is_dlm_allowed(&dlm.id)))
        .map(|dlm| {
            let load = loads.get(&dlm.id).copied().unwrap_or_default();
            DlmStatusSummary {
                dlm_id: dlm.id.clone(),
                available: load.up && dlm.enabled,
                max_forward_kbps: dlm.max_forward_kbps.0,
                allocated_forward_kbps: load.allocated_forward.0,
                max_return_kbps: dlm.max_return_kbps.0,
                allocated_return_kbps: load.allocated_return.0,
                max_links: MAX_BEARERS_PER_LINK,
                allocated_links: load.bearers,
            }
        })
        .collect()
}

/// Detailed link figures (levels 6/7 only).
fn link_details(core: &GatewayCore, filter: Option<&ClientProfile>) -> Vec<LinkStatusDetail> {
    core.config
        .dlms
        .iter()
        .filter(|dlm| filter.is_none_or(|p| p.is_dlm_allowed(&dlm.id)))
        .map(|dlm| LinkStatusDetail {
            dlm_id: dlm.id.clone(),
            latency_ms: dlm.latency_ms,
            jitter_ms: dlm.jitter_ms,
            packet_loss_rate: dlm.packet_loss_rate,
            load_percent: core.dlm.load_percent(dlm),
        })
        .collect()
}

/// Content selection per status level.
fn level_includes(level: u8) -> (bool, bool, bool) {
    let clients = matches!(level, 1 | 3 | 7);
    let dlms = matches!(level, 2 | 3 | 6 | 7);
    let details = matches!(level, 6 | 7);
    (clients, dlms, details)
}

/// Build a status-change report snapshot honouring a subscription level.
/// Used for subscription seeds and broadcasts.
pub(crate) fn compose_status_report(core: &GatewayCore, level: u8) -> StatusChangeReport {
    compose_change_report(
        core,
        level,
        StatusChangeType::ClientJoin,
        MagicStatus::Success,
        None,
    )
}

/// Build a status-change report for a concrete event.
pub(crate) fn compose_change_report(
    core: &GatewayCore,
    level: u8,
    change_type: StatusChangeType,
    status: MagicStatus,
    error_message: Option<String>,
) -> StatusChangeReport {
    let (clients, dlms, details) = level_includes(level);
    StatusChangeReport {
        change_type,
        magic_status: status,
        error_message,
        registered_clients: if clients {
            registered_clients(core)
        } else {
            vec![]
        },
        dlm_list: if dlms { dlm_summaries(core, None) } else { vec![] },
        link_details: if details { link_details(core, None) } else { vec![] },
    }
}

/// The SXR pipeline.
pub fn handle_sxr(
    core: &Arc<GatewayCore>,
    env: &MagicEnvelope,
    req: &StatusRequest,
) -> MagicEnvelope {
    let sxa = |status: AnswerStatus, level: u8, c, d, l| {
        answer_envelope(
            core,
            env,
            MagicMessage::StatusAnswer(StatusAnswer {
                status,
                status_type: level,
                registered_clients: c,
                dlm_list: d,
                link_details: l,
            }),
        )
    };

    let Some(session) = core.sessions.find_by_id(&env.session_id) else {
        return sxa(
            AnswerStatus::failure(
                ResultCode::UnknownSessionId,
                MagicStatus::Unknown,
                "unknown session",
            ),
            0,
            vec![],
            vec![],
            vec![],
        );
    };
    let profile = core
        .config
        .find_client_by_profile(&session.profile_name)
        .or_else(|| core.config.find_client_by_id(&session.client_id))
        .cloned();
    let Some(profile) = profile else {
        return sxa(
            AnswerStatus::failure(
                ResultCode::UnableToComply,
                MagicStatus::GatewayFailure,
                "client profile vanished",
            ),
            0,
            vec![],
            vec![],
            vec![],
        );
    };

    if !core
        .status_limiter
        .allow(&session.client_id, profile.session.status_rate_limit_secs)
    {
        debug!(client = %session.client_id, "status request rate-limited");
        return sxa(
            AnswerStatus::failure(
                ResultCode::TooBusy,
                MagicStatus::UnableToComply,
                "status request rate exceeded",
            ),
            req.status_type,
            vec![],
            vec![],
            vec![],
        );
    }

    let level = profile.clamp_status_level(req.status_type);
    let (want_clients, want_dlms, want_details) = level_includes(level);
    let clients = if want_clients && profile.session.allow_registered_clients {
        registered_clients(core)
    } else {
        vec![]
    };
    let dlms = if want_dlms {
        dlm_summaries(core, Some(&profile))
    } else {
        vec![]
    };
    let details = if want_details {
        link_details(core, Some(&profile))
    } else {
        vec![]
    };
    let _ = core.sessions.update(&env.session_id, |s| {
        s.last_activity = chrono::Utc::now();
    });
    sxa(AnswerStatus::success(), level, clients, dlms, details)
}

/// Inbound notification report: mirror the reported observable fields into
/// the session row, then acknowledge.
pub fn handle_inbound_ntr(
    core: &Arc<GatewayCore>,
    env: &MagicEnvelope,
    report: &NotificationReport,
) -> MagicEnvelope {
    let mirrored = core.sessions.update(&env.session_id, |s| {
        if let Some(bps) = report.report.granted_forward_bps {
            s.granted_forward = Kbps::from_bps(bps);
        }
        if let Some(bps) = report.report.granted_return_bps {
            s.granted_return = Kbps::from_bps(bps);
        }
        if let Some(gateway) = report.report.gateway_ip {
            s.gateway_ip = Some(gateway);
        }
        s.last_activity = chrono::Utc::now();
    });
    if mirrored.is_err() {
        warn!(session = %env.session_id, "notification report for unknown session");
    } else {
        info!(session = %env.session_id, status = %report.magic_status, "notification report mirrored");
    }
    answer_envelope(
        core,
        env,
        MagicMessage::NotificationAck(NotificationAck {
            status: AnswerStatus::success(),
        }),
    )
}

/// Inbound status-change report: logged and cross-checked, always
/// acknowledged.
pub fn handle_inbound_scr(
    core: &Arc<GatewayCore>,
    env: &MagicEnvelope,
    report: &StatusChangeReport,
) -> MagicEnvelope {
    info!(
        session = %env.session_id,
        change = %report.change_type,
        dlms = report.dlm_list.len(),
        "status-change report received"
    );
    for summary in &report.dlm_list {
        if core.config.find_dlm(&summary.dlm_id).is_none() {
            warn!(link = %summary.dlm_id, "status report names unknown DLM");
        }
    }
    answer_envelope(
        core,
        env,
        MagicMessage::StatusChangeAck(StatusChangeAck {
            status: AnswerStatus::success(),
        }),
    )
}

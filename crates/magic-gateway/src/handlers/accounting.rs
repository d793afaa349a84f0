//! Accounting handlers: data retrieval (ADR → ADA) and the billing
//! rollover without disconnect (ACR → ACA).
//!
//! ADA carries four groups — active, finished, forwarded, unknown — with
//! isolation applied per request level. The forwarded group is reserved and
//! always empty until a persistent forwarding store exists.

use std::sync::Arc;

use magic_models::{
    AccountingControlAnswer, AccountingControlRequest, AccountingDataAnswer,
    AccountingDataRequest, AnswerStatus, CdrRequestLevel, CdrRequestType, CdrSummary,
    MagicEnvelope, MagicMessage, MagicStatus, ResultCode,
};
use tracing::{info, warn};

use crate::cdr::{CdrRecord, CdrStatus};
use crate::core::GatewayCore;
use crate::handlers::answer_envelope;

fn summarize(record: &CdrRecord, cdr_type: CdrRequestType) -> CdrSummary {
    CdrSummary {
        cdr_id: record.cdr_id,
        content: match cdr_type {
            CdrRequestType::List => None,
            CdrRequestType::Data => Some(record.content_string()),
        },
    }
}

/// The ADR pipeline.
pub fn handle_adr(
    core: &Arc<GatewayCore>,
    env: &MagicEnvelope,
    req: &AccountingDataRequest,
) -> MagicEnvelope {
    let ada = |status: AnswerStatus, active, finished, unknown| {
        answer_envelope(
            core,
            env,
            MagicMessage::AccountingDataAnswer(AccountingDataAnswer {
                status,
                active_cdrs: active,
                finished_cdrs: finished,
                // Reserved until a forwarding store exists.
                forwarded_cdrs: vec![],
                unknown_cdrs: unknown,
            }),
        )
    };

    let Some(session) = core.sessions.find_by_id(&env.session_id) else {
        return ada(
            AnswerStatus::failure(
                ResultCode::UnknownSessionId,
                MagicStatus::AccountingUnknownSession,
                "unknown session",
            ),
            vec![],
            vec![],
            vec![],
        );
    };

    let mut records = core.cdr.all_records();
    match req.cdr_level {
        CdrRequestLevel::All => {}
        CdrRequestLevel::UserDependent => {
            records.retain(|r| r.client_id == session.client_id);
        }
        CdrRequestLevel::SessionDependent => {
            records.retain(|r| Some(r.cdr_id) == req.cdr_request_id);
        }
    }

    let mut unknown = vec![];
    if let Some(wanted) = req.cdr_request_id {
        if !records.iter().any(|r| r.cdr_id == wanted) {
            unknown.push(wanted);
        }
    }

    let active: Vec<CdrSummary> = records
        .iter()
        .filter(|r| r.status == CdrStatus::Active)
        .map(|r| summarize(r, req.cdr_type))
        .collect();
    let finished: Vec<CdrSummary> = records
        .iter()
        .filter(|r| matches!(r.status, CdrStatus::Finished | CdrStatus::Rollover))
        .map(|r| summarize(r, req.cdr_type))
        .collect();

    info!(
        session = %env.session_id,
        active = active.len(),
        finished = finished.len(),
        "accounting data served"
    );
    ada(AnswerStatus::success(), active, finished, unknown)
}

/// The ACR pipeline: bill rollover without disconnect.
pub fn handle_acr(
    core: &Arc<GatewayCore>,
    env: &MagicEnvelope,
    req: &AccountingControlRequest,
) -> MagicEnvelope {
    let aca = |status: AnswerStatus, old: Option<u32>, new: Option<u32>| {
        answer_envelope(
            core,
            env,
            MagicMessage::AccountingControlAnswer(AccountingControlAnswer {
                status,
                old_cdr_id: old,
                new_cdr_id: new,
            }),
        )
    };

    let Some(requester) = core.sessions.find_by_id(&env.session_id) else {
        return aca(
            AnswerStatus::failure(
                ResultCode::UnknownSessionId,
                MagicStatus::AccountingUnknownSession,
                "unknown requester session",
            ),
            None,
            None,
        );
    };
    let Some(target) = core.sessions.find_by_id(&req.restart_session_id) else {
        return aca(
            AnswerStatus::failure(
                ResultCode::UnableToComply,
                MagicStatus::AccountingUnknownSession,
                "unknown target session",
            ),
            None,
            None,
        );
    };

    // Permission: a client always controls its own sessions; anything else
    // needs the CDR-control privilege.
    let own = requester.client_id == target.client_id;
    let privileged = core
        .config
        .find_client_by_profile(&requester.profile_name)
        .or_else(|| core.config.find_client_by_id(&requester.client_id))
        .is_some_and(|p| p.session.allow_cdr_control);
    if !own && !privileged {
        warn!(
            requester = %requester.client_id,
            target = %target.client_id,
            "CDR control denied"
        );
        return aca(
            AnswerStatus::failure(
                ResultCode::NotAuthorized,
                MagicStatus::CdrControlDenied,
                "CDR control not allowed for this client",
            ),
            None,
            None,
        );
    }

    // Current traffic: the live meter wins, the cached counters serve as
    // fallback.
    let (current_in, current_out) = match core.meter.sample(&req.restart_session_id) {
        Some(reading) => (reading.bytes_in, reading.bytes_out),
        None => (target.bytes_in, target.bytes_out),
    };

    match core
        .cdr
        .rollover(&req.restart_session_id, current_in, current_out)
    {
        Ok(outcome) => {
            let _ = core.sessions.update(&req.restart_session_id, |s| {
                s.cdr_id = Some(outcome.new_cdr_id);
                s.last_activity = chrono::Utc::now();
            });
            info!(
                session = %req.restart_session_id,
                old_cdr = outcome.old_cdr_id,
                new_cdr = outcome.new_cdr_id,
                "billing rolled over"
            );
            aca(
                AnswerStatus::success(),
                Some(outcome.old_cdr_id),
                Some(outcome.new_cdr_id),
            )
        }
        Err(e) => aca(
            AnswerStatus::failure(
                ResultCode::UnableToComply,
                MagicStatus::AccountingNotProcessed,
                e.to_string(),
            ),
            None,
            None,
        ),
    }
}

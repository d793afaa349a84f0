//! Protocol handlers.
//!
//! Every handler follows the same outline: parse → validate → decide → act →
//! answer. [`dispatch`] routes one inbound envelope to its pipeline and
//! returns the answer envelope, when one is due. Unknown extension fields
//! were already dropped during deserialisation; inbound answer-type messages
//! are logged and ignored, never rejected.

use std::net::Ipv4Addr;
use std::sync::Arc;

use magic_models::{
    AnswerStatus, MagicEnvelope, MagicMessage, MagicStatus, ResultCode,
};
use tracing::{debug, warn};

use crate::core::GatewayCore;

pub mod accounting;
pub mod auth;
pub mod comm_change;
pub mod status;
pub mod termination;

/// Build an answer envelope for a request, signed with the gateway
/// identity.
pub(crate) fn answer_envelope(
    core: &GatewayCore,
    request: &MagicEnvelope,
    payload: MagicMessage,
) -> MagicEnvelope {
    let (host, realm) = core.identity();
    MagicEnvelope::answer_to(request, host, realm, payload)
}

/// Envelope-level validation shared by every request: the three mandatory
/// identifiers must be present.
fn envelope_valid(env: &MagicEnvelope) -> Result<(), AnswerStatus> {
    if env.session_id.is_empty() {
        return Err(AnswerStatus::failure(
            ResultCode::MissingMandatoryField,
            MagicStatus::MissingParameter,
            "Session-Id is mandatory",
        ));
    }
    if env.origin_host.is_empty() || env.origin_realm.is_empty() {
        return Err(AnswerStatus::failure(
            ResultCode::MissingMandatoryField,
            MagicStatus::MissingParameter,
            "Origin-Host and Origin-Realm are mandatory",
        ));
    }
    Ok(())
}

/// Route one inbound envelope. Returns the answer to write back, or `None`
/// for messages that take no answer (acks, inbound answer types).
pub async fn dispatch(
    core: &Arc<GatewayCore>,
    env: &MagicEnvelope,
    peer_ip: Ipv4Addr,
) -> Option<MagicEnvelope> {
    debug!(
        command = env.payload.mnemonic(),
        session = %env.session_id,
        origin = %env.origin_host,
        "request received"
    );

    if let Err(status) = envelope_valid(env) {
        return Some(validation_reject(core, env, status));
    }

    match &env.payload {
        MagicMessage::AuthenticationRequest(req) => {
            Some(auth::handle_car(core, env, req, peer_ip).await)
        }
        MagicMessage::CommunicationChangeRequest(req) => {
            Some(comm_change::handle_ccr(core, env, req).await)
        }
        MagicMessage::SessionTerminationRequest(_) => {
            Some(termination::handle_str(core, env).await)
        }
        MagicMessage::StatusRequest(req) => Some(status::handle_sxr(core, env, req)),
        MagicMessage::AccountingDataRequest(req) => {
            Some(accounting::handle_adr(core, env, req))
        }
        MagicMessage::AccountingControlRequest(req) => {
            Some(accounting::handle_acr(core, env, req))
        }
        MagicMessage::NotificationReport(report) => {
            Some(status::handle_inbound_ntr(core, env, report))
        }
        MagicMessage::StatusChangeReport(report) => {
            Some(status::handle_inbound_scr(core, env, report))
        }
        MagicMessage::NotificationAck(_) => {
            core.push.ack(&env.session_id);
            None
        }
        MagicMessage::StatusChangeAck(_) => None,
        // Answer types are server-emitted; a client sending one is noise.
        other => {
            warn!(command = other.mnemonic(), "ignoring inbound answer-type message");
            None
        }
    }
}

/// Answer a structurally invalid request with the matching failure payload
/// for its command type.
fn validation_reject(
    core: &GatewayCore,
    env: &MagicEnvelope,
    status: AnswerStatus,
) -> MagicEnvelope {
    let payload = match &env.payload {
        MagicMessage::AuthenticationRequest(_) => {
            MagicMessage::AuthenticationAnswer(magic_models::AuthenticationAnswer {
                status,
                grant: None,
                granted_subscription: None,
                auth_lifetime_secs: 0,
                auth_grace_secs: 0,
            })
        }
        MagicMessage::CommunicationChangeRequest(_) => {
            MagicMessage::CommunicationChangeAnswer(magic_models::CommunicationChangeAnswer {
                status,
                selected_link: magic_models::SelectedLink::None,
                grant: None,
            })
        }
        MagicMessage::SessionTerminationRequest(_) => {
            MagicMessage::SessionTerminationAnswer(magic_models::SessionTerminationAnswer {
                status,
                final_bytes_in: 0,
                final_bytes_out: 0,
            })
        }
        MagicMessage::StatusRequest(_) => MagicMessage::StatusAnswer(magic_models::StatusAnswer {
            status,
            status_type: 0,
            registered_clients: vec![],
            dlm_list: vec![],
            link_details: vec![],
        }),
        MagicMessage::AccountingDataRequest(_) => {
            MagicMessage::AccountingDataAnswer(magic_models::AccountingDataAnswer {
                status,
                active_cdrs: vec![],
                finished_cdrs: vec![],
                forwarded_cdrs: vec![],
                unknown_cdrs: vec![],
            })
        }
        MagicMessage::AccountingControlRequest(_) => {
            MagicMessage::AccountingControlAnswer(magic_models::AccountingControlAnswer {
                status,
                old_cdr_id: None,
                new_cdr_id: None,
            })
        }
        _ => MagicMessage::NotificationAck(magic_models::NotificationAck { status }),
    };
    answer_envelope(core, env, payload)
}

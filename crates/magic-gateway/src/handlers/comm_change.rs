//! Communication change (CCR → CCA).
//!
//! Four phases: session validation, parameter & security checking (with
//! atomic TFT whitelist validation), intent derivation, execution. Intents:
//!
//! - any zero-bandwidth request → **Stop**
//! - authenticated + keep-request → **Queue**
//! - active + non-zero bandwidth → **Modify**
//! - authenticated + non-zero bandwidth → **Start**

use std::sync::Arc;

use magic_models::{
    AnswerStatus, CommunicationChangeAnswer, CommunicationChangeRequest, MagicEnvelope,
    MagicMessage, MagicStatus, ResourceGrant, ResultCode, SelectedLink,
};
use tracing::{debug, info};

use crate::core::{GatewayCore, NormalizedRequest};
use crate::handlers::{answer_envelope, auth::validate_tfts};
use crate::queue::EnqueueOutcome;
use crate::session::{Session, SessionState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Intent {
    Start,
    Modify,
    Stop,
    Queue,
}

fn cca(
    core: &GatewayCore,
    env: &MagicEnvelope,
    status: AnswerStatus,
    selected_link: SelectedLink,
    grant: Option<ResourceGrant>,
) -> MagicEnvelope {
    answer_envelope(
        core,
        env,
        MagicMessage::CommunicationChangeAnswer(CommunicationChangeAnswer {
            status,
            selected_link,
            grant,
        }),
    )
}

fn reject(
    core: &GatewayCore,
    env: &MagicEnvelope,
    result: ResultCode,
    status: MagicStatus,
    message: impl Into<String>,
) -> MagicEnvelope {
    cca(
        core,
        env,
        AnswerStatus::failure(result, status, message),
        SelectedLink::None,
        None,
    )
}

fn derive_intent(session: &Session, norm: &NormalizedRequest, keep: bool) -> Intent {
    if norm.requested_forward.is_zero() && norm.requested_return.is_zero() {
        return Intent::Stop;
    }
    if session.state == SessionState::Authenticated && keep {
        return Intent::Queue;
    }
    if session.state == SessionState::Active {
        return Intent::Modify;
    }
    Intent::Start
}

/// The CCR pipeline.
pub async fn handle_ccr(
    core: &Arc<GatewayCore>,
    env: &MagicEnvelope,
    req: &CommunicationChangeRequest,
) -> MagicEnvelope {
    let session_id = &env.session_id;

    // Phase 1: session validation.
    let Some(session) = core.sessions.find_by_id(session_id) else {
        return reject(
            core,
            env,
            ResultCode::UnknownSessionId,
            MagicStatus::Unknown,
            "unknown session",
        );
    };
    if !matches!(
        session.state,
        SessionState::Authenticated | SessionState::Active
    ) {
        return reject(
            core,
            env,
            ResultCode::UnableToComply,
            MagicStatus::InvalidSessionState,
            format!("session is {}", session.state),
        );
    }
    let Some(profile) = core
        .config
        .find_client_by_profile(&session.profile_name)
        .or_else(|| core.config.find_client_by_id(&session.client_id))
        .cloned()
    else {
        return reject(
            core,
            env,
            ResultCode::UnableToComply,
            MagicStatus::GatewayFailure,
            "client profile vanished",
        );
    };

    // Phase 2: parameters and security. The whole request is rejected on
    // the first bad TFT row; nothing is applied.
    let norm = match core.normalize_request(&profile, &req.communication_request) {
        Ok(norm) => norm,
        Err(failure) => {
            return reject(core, env, failure.result, failure.status, failure.message);
        }
    };
    if let Err(violation) = validate_tfts(&profile, &norm.tfts) {
        return cca(core, env, violation, SelectedLink::None, None);
    }

    // Phase 3: intent.
    let intent = derive_intent(&session, &norm, norm.keep_request);
    debug!(session = %session_id, ?intent, "communication change intent");

    // Phase 4: execution.
    match intent {
        Intent::Stop => {
            core.queue.dequeue(session_id);
            let (final_in, final_out) = match core.meter.sample(session_id) {
                Some(r) => (r.bytes_in, r.bytes_out),
                None => (session.bytes_in, session.bytes_out),
            };
            if core.cdr.find_active_by_session(session_id).is_some() {
                let _ = core.cdr.close(session_id, final_in, final_out);
            }
            if let Some(dlm) = &session.assigned_dlm {
                core.dlm
                    .release(
                        dlm,
                        session.bearer_id,
                        session.granted_forward,
                        session.granted_return,
                    )
                    .await;
            }
            let _ = core.dataplane.remove_all_for(session_id);
            core.meter.unregister(session_id);
            let _ = core.sessions.release_link(session_id);
            let _ = core.sessions.clear_tfts(session_id);
            let _ = core
                .sessions
                .set_state(session_id, SessionState::Authenticated);
            info!(session = %session_id, "communication stopped");
            cca(
                core,
                env,
                AnswerStatus::success(),
                SelectedLink::None,
                None,
            )
        }

        Intent::Start | Intent::Modify => {
            match core.allocate_and_activate(session_id, &profile, &norm).await {
                Ok(grant) => {
                    let link = grant.dlm_id.clone();
                    cca(
                        core,
                        env,
                        AnswerStatus::success(),
                        SelectedLink::Link(link),
                        Some(grant),
                    )
                }
                Err(failure) => reject(
                    core,
                    env,
                    ResultCode::UnableToComply,
                    failure.status,
                    failure.message,
                ),
            }
        }

        Intent::Queue => {
            // Try immediately; park only on a resource shortage.
            match core.allocate_and_activate(session_id, &profile, &norm).await {
                Ok(grant) => {
                    let link = grant.dlm_id.clone();
                    cca(
                        core,
                        env,
                        AnswerStatus::success(),
                        SelectedLink::Link(link),
                        Some(grant),
                    )
                }
                Err(failure) if failure.queueable => {
                    let timeout = norm
                        .timeout_secs
                        .map(|secs| std::time::Duration::from_secs(u64::from(secs)));
                    match core.queue.enqueue(
                        session_id,
                        &session.client_id,
                        req.communication_request.clone(),
                        norm.priority_class,
                        timeout,
                    ) {
                        EnqueueOutcome::Added | EnqueueOutcome::Updated => cca(
                            core,
                            env,
                            AnswerStatus::success(),
                            SelectedLink::Queued,
                            None,
                        ),
                        EnqueueOutcome::Full => reject(
                            core,
                            env,
                            ResultCode::UnableToComply,
                            MagicStatus::QueueFull,
                            "pending-request queue is full",
                        ),
                    }
                }
                Err(failure) => reject(
                    core,
                    env,
                    ResultCode::UnableToComply,
                    failure.status,
                    failure.message,
                ),
            }
        }
    }
}

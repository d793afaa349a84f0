//! Session termination (STR → STA).
//!
//! Final meter read, CDR closure with those finals, dataplane cleanup,
//! meter unregistration, link release, row erasure. Idempotent: an STR for
//! an unknown session answers success with zero counters.

use std::sync::Arc;

use magic_models::{
    AnswerStatus, MagicEnvelope, MagicMessage, SessionTerminationAnswer,
};
use tracing::info;

use crate::core::{GatewayCore, TeardownReason};
use crate::handlers::answer_envelope;

/// The STR pipeline.
pub async fn handle_str(core: &Arc<GatewayCore>, env: &MagicEnvelope) -> MagicEnvelope {
    let session_id = &env.session_id;
    let (final_bytes_in, final_bytes_out) = core
        .teardown_session(session_id, TeardownReason::ClientRequest)
        .await;
    info!(session = %session_id, final_bytes_in, final_bytes_out, "session terminated by client");
    answer_envelope(
        core,
        env,
        MagicMessage::SessionTerminationAnswer(SessionTerminationAnswer {
            status: AnswerStatus::success(),
            final_bytes_in,
            final_bytes_out,
        }),
    )
}

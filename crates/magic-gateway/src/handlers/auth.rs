//! Client authentication (CAR → CAA).
//!
//! Five ordered steps: format/security validation, credential check,
//! subscription handling, activation-condition verification, and the
//! optional zero-round-trip resource allocation when the request carries a
//! communication-request group.

use std::net::Ipv4Addr;
use std::sync::Arc;

use magic_models::{
    AnswerStatus, AuthenticationAnswer, AuthenticationRequest, ClientProfile, MagicEnvelope,
    MagicMessage, MagicStatus, ResultCode,
};
use tracing::{info, warn};

use crate::core::{GatewayCore, TeardownReason};
use crate::handlers::{answer_envelope, status::compose_status_report};
use crate::session::SessionState;

fn caa(
    core: &GatewayCore,
    env: &MagicEnvelope,
    status: AnswerStatus,
    grant: Option<magic_models::ResourceGrant>,
    granted_subscription: Option<u8>,
    lifetime: u32,
    grace: u32,
) -> MagicEnvelope {
    answer_envelope(
        core,
        env,
        MagicMessage::AuthenticationAnswer(AuthenticationAnswer {
            status,
            grant,
            granted_subscription,
            auth_lifetime_secs: lifetime,
            auth_grace_secs: grace,
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
    caa(
        core,
        env,
        AnswerStatus::failure(result, status, message),
        None,
        None,
        0,
        0,
    )
}

/// Resolve the client profile: username first, origin-host as fallback.
fn resolve_profile<'a>(
    core: &'a GatewayCore,
    req: &AuthenticationRequest,
    env: &MagicEnvelope,
) -> Option<&'a ClientProfile> {
    if let Some(username) = &req.username {
        if let Some(profile) = core.config.find_client_by_username(username) {
            return Some(profile);
        }
    }
    core.config.find_client_by_id(&env.origin_host)
}

/// The CAR pipeline.
pub async fn handle_car(
    core: &Arc<GatewayCore>,
    env: &MagicEnvelope,
    req: &AuthenticationRequest,
    peer_ip: Ipv4Addr,
) -> MagicEnvelope {
    let session_id = &env.session_id;

    // Step 1: duplicate detection: an existing session with this id is
    // evicted before the new one is admitted.
    if core.sessions.find_by_id(session_id).is_some() {
        info!(session = %session_id, "duplicate session id, evicting predecessor");
        core.teardown_session(session_id, TeardownReason::Eviction).await;
    }

    // Step 2: authentication.
    let Some(profile) = resolve_profile(core, req, env) else {
        warn!(origin = %env.origin_host, "authentication failed: unknown client");
        return reject(
            core,
            env,
            ResultCode::AuthorizationRejected,
            MagicStatus::AuthenticationFailed,
            "unknown client",
        );
    };
    let password_ok = req
        .client_password
        .as_deref()
        .is_some_and(|pw| pw == profile.credentials.client_secret);
    if !password_ok {
        warn!(origin = %env.origin_host, profile = %profile.profile_name, "authentication failed: bad credentials");
        return reject(
            core,
            env,
            ResultCode::AuthorizationRejected,
            MagicStatus::AuthenticationFailed,
            "bad username or password",
        );
    }
    if let Some(pin) = profile.credentials.source_ip {
        if pin != peer_ip {
            warn!(origin = %env.origin_host, %peer_ip, "authentication failed: source address mismatch");
            return reject(
                core,
                env,
                ResultCode::AuthorizationRejected,
                MagicStatus::IpMismatch,
                "source address does not match the registered client",
            );
        }
    }

    let profile = profile.clone();
    let client_ip = profile.credentials.source_ip.unwrap_or(peer_ip);

    if let Err(e) = core.sessions.create(
        session_id,
        &profile.client_id,
        &env.origin_realm,
        GatewayCore::quota_seed(&profile),
    ) {
        return reject(
            core,
            env,
            ResultCode::UnableToComply,
            MagicStatus::GatewayFailure,
            e.to_string(),
        );
    }
    let lifetime = profile.session.auth_lifetime_secs;
    let grace = profile.session.auth_grace_secs;
    let _ = core.sessions.set_state(session_id, SessionState::Authenticated);
    let _ = core.sessions.update(session_id, |s| {
        s.profile_name = profile.profile_name.clone();
        s.client_ip = Some(client_ip);
        s.auth_expires_at =
            chrono::Utc::now() + chrono::Duration::seconds(i64::from(lifetime));
        s.auth_grace_secs = grace;
    });
    if let Err(e) = core.dataplane.whitelist_control(client_ip) {
        warn!(session = %session_id, error = %e, "control whitelist update failed");
    }
    info!(session = %session_id, client = %profile.client_id, "client authenticated");

    // Step 3: status subscription, clamped to the profile's permissions.
    let granted_subscription = match req.status_subscription {
        Some(level) => {
            let granted = profile.clamp_status_level(level);
            match core.sessions.set_subscription(session_id, granted) {
                Ok(()) => Some(granted),
                Err(_) => {
                    return reject(
                        core,
                        env,
                        ResultCode::InvalidValue,
                        MagicStatus::InvalidParameter,
                        format!("subscription level {level} is not defined"),
                    );
                }
            }
        }
        None => None,
    };

    // Steps 4 and 5 only run for a single-round-trip admission.
    let mut grant = None;
    let mut status = AnswerStatus::success();
    if let Some(comm) = &req.communication_request {
        match core.normalize_request(&profile, comm) {
            Ok(norm) => {
                // Step 4: ARINC activation conditions. A violation keeps
                // the session authenticated with no allocation attempt.
                if let Err((code, message)) = core.check_activation_conditions(
                    &profile,
                    &norm.altitude,
                    &norm.airport,
                    norm.flight_phase,
                ) {
                    status =
                        AnswerStatus::failure(ResultCode::UnableToComply, code, message);
                } else if let Err(violation) = validate_tfts(&profile, &norm.tfts) {
                    status = violation;
                } else {
                    // Step 5: zero-round-trip allocation.
                    let _ = core.sessions.update(session_id, |s| {
                        s.altitude_condition = norm.altitude.clone();
                        s.airport_condition = norm.airport.clone();
                    });
                    match core.allocate_and_activate(session_id, &profile, &norm).await {
                        Ok(granted) => grant = Some(granted),
                        Err(failure) => {
                            status = AnswerStatus::failure(
                                ResultCode::UnableToComply,
                                failure.status,
                                failure.message,
                            );
                        }
                    }
                }
            }
            Err(failure) => {
                status = AnswerStatus::failure(failure.result, failure.status, failure.message);
            }
        }
    }

    let answer = caa(core, env, status, grant, granted_subscription, lifetime, grace);

    // Subscription seed: one status report straight after the grant.
    if granted_subscription.unwrap_or(0) > 0 {
        core.push
            .seed_subscription(session_id, |level| compose_status_report(core, level));
    }

    answer
}

/// Atomic TFT whitelist validation: one bad row rejects the whole request.
pub(crate) fn validate_tfts(
    profile: &ClientProfile,
    tfts: &[magic_models::TftSpec],
) -> Result<(), AnswerStatus> {
    for tft in tfts {
        if let Err(violation) = profile.traffic.permits_tft(tft) {
            return Err(AnswerStatus::failure(
                ResultCode::NotAuthorized,
                MagicStatus::TftInvalid,
                format!("TFT outside the client whitelist ({violation})"),
            ));
        }
    }
    Ok(())
}

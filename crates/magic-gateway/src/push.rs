//! Push engine: server-initiated notifications with storm suppression.
//!
//! Two kinds of push leave this module: session-directed notification
//! reports (MNTR) and broadcast status-change reports (MSCR) to every
//! subscribed session. Delivery goes through per-session outboxes that the
//! connection workers register; a session without a live connection simply
//! misses the push.
//!
//! Suppression rules for non-forced MNTRs: at least one second between
//! notifications per session, bandwidth changes below 10 % of the last
//! notified value are dropped, and only one MNTR may be in flight per
//! session. An unacknowledged MNTR is considered acknowledged after five
//! seconds so later notifications may resume.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use magic_models::{
    ClientId, CommunicationReport, Kbps, MagicEnvelope, MagicMessage, MagicStatus,
    NotificationReport, Realm, SessionId, StatusChangeReport,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::session::{SessionStore, VALID_SUBSCRIPTION_LEVELS};

/// Minimum interval between MNTRs for one session, seconds.
pub const MNTR_MIN_INTERVAL_SECS: i64 = 1;
/// Relative bandwidth change below which an MNTR is suppressed, percent.
pub const MNTR_BW_CHANGE_THRESHOLD_PCT: u64 = 10;
/// How long an MNTR may await its ack before being written off, seconds.
pub const MNTR_ACK_TIMEOUT_SECS: i64 = 5;

/// Parameters of one session notification.
#[derive(Debug, Clone)]
pub struct NotifyParams {
    /// Detailed reason code.
    pub status: MagicStatus,
    /// Optional diagnostic text.
    pub error_message: Option<String>,
    /// Changed observable fields.
    pub report: CommunicationReport,
    /// Bypass every suppression rule (link up/down, handover, shutdown).
    pub force: bool,
}

/// The push engine.
pub struct PushEngine {
    origin_host: ClientId,
    origin_realm: Realm,
    sessions: std::sync::Arc<SessionStore>,
    outboxes: Mutex<HashMap<SessionId, mpsc::UnboundedSender<MagicEnvelope>>>,
}

impl PushEngine {
    /// Create the engine over the session store.
    pub fn new(
        origin_host: ClientId,
        origin_realm: Realm,
        sessions: std::sync::Arc<SessionStore>,
    ) -> Self {
        PushEngine {
            origin_host,
            origin_realm,
            sessions,
            outboxes: Mutex::new(HashMap::new()),
        }
    }

    /// Register the outbox of a connection for a session.
    pub fn register_outbox(&self, session: &SessionId, tx: mpsc::UnboundedSender<MagicEnvelope>) {
        self.outboxes.lock().unwrap().insert(session.clone(), tx);
    }

    /// Drop the outbox of a session (connection closed or session gone).
    pub fn unregister_outbox(&self, session: &SessionId) {
        self.outboxes.lock().unwrap().remove(session);
    }

    /// Send an MNTR to one session, honouring the suppression rules.
    /// Returns true when the notification left the engine.
    pub fn notify(&self, session_id: &SessionId, params: &NotifyParams) -> bool {
        let now = Utc::now();
        let Some(session) = self.sessions.find_by_id(session_id) else {
            return false;
        };

        if !params.force && !should_send(&session, params, now) {
            return false;
        }

        let envelope = MagicEnvelope::new(
            session_id.clone(),
            self.origin_host.clone(),
            self.origin_realm.clone(),
            MagicMessage::NotificationReport(NotificationReport {
                magic_status: params.status,
                error_message: params.error_message.clone(),
                report: params.report.clone(),
            }),
        );

        let delivered = self.deliver(session_id, envelope);
        if delivered {
            let notified_bw = params
                .report
                .granted_forward_bps
                .map(Kbps::from_bps);
            let _ = self.sessions.update(session_id, |s| {
                s.last_notification_at = Some(now);
                s.notify_ack_pending = true;
                s.notify_sent_at = Some(now);
                if let Some(bw) = notified_bw {
                    s.last_notified_bw = bw;
                }
            });
            info!(session = %session_id, status = %params.status, force = params.force, "MNTR sent");
        }
        delivered
    }

    /// Broadcast an MSCR to every subscribed session. The builder is called
    /// with each subscriber's granted level so the content can honour it.
    /// Returns the number of reports sent.
    pub fn broadcast<F>(&self, build: F) -> usize
    where
        F: Fn(u8) -> StatusChangeReport,
    {
        let mut sent = 0;
        for session in self.sessions.subscribed_sessions() {
            debug_assert!(VALID_SUBSCRIPTION_LEVELS.contains(&session.subscribed_level));
            let report = build(session.subscribed_level);
            let envelope = MagicEnvelope::new(
                session.id.clone(),
                self.origin_host.clone(),
                self.origin_realm.clone(),
                MagicMessage::StatusChangeReport(report),
            );
            if self.deliver(&session.id, envelope) {
                sent += 1;
            }
        }
        if sent > 0 {
            debug!(sent, "MSCR broadcast");
        }
        sent
    }

    /// Seed push after a granted subscription: one MSCR to the new
    /// subscriber only.
    pub fn seed_subscription<F>(&self, session_id: &SessionId, build: F) -> bool
    where
        F: FnOnce(u8) -> StatusChangeReport,
    {
        let Some(session) = self.sessions.find_by_id(session_id) else {
            return false;
        };
        if session.subscribed_level == 0 {
            return false;
        }
        let envelope = MagicEnvelope::new(
            session.id.clone(),
            self.origin_host.clone(),
            self.origin_realm.clone(),
            MagicMessage::StatusChangeReport(build(session.subscribed_level)),
        );
        self.deliver(session_id, envelope)
    }

    /// Record an MNTR acknowledgement from the client.
    pub fn ack(&self, session_id: &SessionId) {
        let _ = self.sessions.update(session_id, |s| {
            s.notify_ack_pending = false;
            s.notify_sent_at = None;
        });
    }

    /// Write off MNTRs whose ack never arrived; after the timeout the
    /// session is treated as acknowledged so notifications may resume.
    pub fn sweep_ack_timeouts(&self) {
        let now = Utc::now();
        for session in self.sessions.all_sessions() {
            if !session.notify_ack_pending {
                continue;
            }
            let Some(sent_at) = session.notify_sent_at else {
                continue;
            };
            if (now - sent_at).num_seconds() >= MNTR_ACK_TIMEOUT_SECS {
                warn!(session = %session.id, "MNTR ack timed out, resuming notifications");
                self.ack(&session.id);
            }
        }
    }

    fn deliver(&self, session_id: &SessionId, envelope: MagicEnvelope) -> bool {
        let outboxes = self.outboxes.lock().unwrap();
        match outboxes.get(session_id) {
            Some(tx) => tx.send(envelope).is_ok(),
            None => {
                debug!(session = %session_id, "no outbox, push dropped");
                false
            }
        }
    }
}

/// The suppression rules for a non-forced notification.
fn should_send(
    session: &crate::session::Session,
    params: &NotifyParams,
    now: DateTime<Utc>,
) -> bool {
    if session.notify_ack_pending {
        debug!(session = %session.id, "MNTR suppressed: ack pending");
        return false;
    }
    if let Some(last) = session.last_notification_at {
        if (now - last).num_milliseconds() < MNTR_MIN_INTERVAL_SECS * 1000 {
            debug!(session = %session.id, "MNTR suppressed: interval");
            return false;
        }
    }
    if let Some(new_bps) = params.report.granted_forward_bps {
        let new_kbps = u64::from(Kbps::from_bps(new_bps).0);
        let last_kbps = u64::from(session.last_notified_bw.0);
        let delta = new_kbps.abs_diff(last_kbps);
        if delta * 100 < MNTR_BW_CHANGE_THRESHOLD_PCT * last_kbps.max(1) {
            debug!(session = %session.id, delta, "MNTR suppressed: below threshold");
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{QuotaSeed, SessionState};
    use chrono::Duration;
    use magic_models::DlmId;
    use std::sync::Arc;

    fn setup() -> (Arc<SessionStore>, PushEngine, SessionId) {
        let store = Arc::new(SessionStore::new());
        let sid = SessionId::new("s1");
        store
            .create(
                &sid,
                &ClientId::new("client-a"),
                &Realm::new("aircraft"),
                QuotaSeed {
                    max_forward: Kbps::ZERO,
                    max_return: Kbps::ZERO,
                    guaranteed_forward: Kbps::ZERO,
                    guaranteed_return: Kbps::ZERO,
                    max_concurrent_sessions: 5,
                    session_timeout_secs: 3600,
                },
            )
            .unwrap();
        store.set_state(&sid, SessionState::Authenticated).unwrap();
        store
            .update(&sid, |s| {
                s.auth_expires_at = Utc::now() + Duration::hours(1);
            })
            .unwrap();
        let push = PushEngine::new(
            ClientId::new("magic.gateway"),
            Realm::new("aircraft"),
            store.clone(),
        );
        (store, push, sid)
    }

    fn attach_outbox(
        push: &PushEngine,
        sid: &SessionId,
    ) -> mpsc::UnboundedReceiver<MagicEnvelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        push.register_outbox(sid, tx);
        rx
    }

    fn bw_params(bps: u64, force: bool) -> NotifyParams {
        NotifyParams {
            status: MagicStatus::BandwidthPreempted,
            error_message: None,
            report: CommunicationReport {
                granted_forward_bps: Some(bps),
                ..Default::default()
            },
            force,
        }
    }

    #[test]
    fn notification_reaches_outbox_and_sets_pending() {
        let (store, push, sid) = setup();
        let mut rx = attach_outbox(&push, &sid);
        assert!(push.notify(&sid, &bw_params(500_000, true)));
        let envelope = rx.try_recv().unwrap();
        assert!(matches!(
            envelope.payload,
            MagicMessage::NotificationReport(_)
        ));
        let session = store.find_by_id(&sid).unwrap();
        assert!(session.notify_ack_pending);
        assert_eq!(session.last_notified_bw, Kbps(500));
    }

    #[test]
    fn ack_pending_suppresses_next_unforced() {
        let (_store, push, sid) = setup();
        let _rx = attach_outbox(&push, &sid);
        assert!(push.notify(&sid, &bw_params(500_000, true)));
        assert!(!push.notify(&sid, &bw_params(900_000, false)));
        // Force bypasses the pending ack.
        assert!(push.notify(&sid, &bw_params(900_000, true)));
    }

    #[test]
    fn small_bandwidth_change_is_suppressed() {
        let (store, push, sid) = setup();
        let _rx = attach_outbox(&push, &sid);
        assert!(push.notify(&sid, &bw_params(500_000, true)));
        push.ack(&sid);
        // Clear the interval gate by backdating the last notification.
        store
            .update(&sid, |s| {
                s.last_notification_at = Some(Utc::now() - Duration::seconds(5));
            })
            .unwrap();
        // 4 % change: suppressed.
        assert!(!push.notify(&sid, &bw_params(520_000, false)));
        // 50 % change: sent.
        assert!(push.notify(&sid, &bw_params(750_000, false)));
    }

    #[test]
    fn interval_gate_suppresses_rapid_fire() {
        let (_store, push, sid) = setup();
        let _rx = attach_outbox(&push, &sid);
        assert!(push.notify(&sid, &bw_params(500_000, true)));
        push.ack(&sid);
        assert!(!push.notify(&sid, &bw_params(5_000_000, false)));
    }

    #[test]
    fn ack_timeout_sweep_resumes_notifications() {
        let (store, push, sid) = setup();
        let _rx = attach_outbox(&push, &sid);
        assert!(push.notify(&sid, &bw_params(500_000, true)));
        store
            .update(&sid, |s| {
                s.notify_sent_at = Some(Utc::now() - Duration::seconds(10));
                s.last_notification_at = Some(Utc::now() - Duration::seconds(10));
            })
            .unwrap();
        push.sweep_ack_timeouts();
        assert!(!store.find_by_id(&sid).unwrap().notify_ack_pending);
        assert!(push.notify(&sid, &bw_params(5_000_000, false)));
    }

    #[test]
    fn broadcast_honours_subscription() {
        let (store, push, sid) = setup();
        let mut rx = attach_outbox(&push, &sid);
        // Not subscribed yet: no broadcast.
        assert_eq!(push.broadcast(|_| sample_report()), 0);
        store.set_subscription(&sid, 3).unwrap();
        assert_eq!(push.broadcast(|_| sample_report()), 1);
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn seed_goes_only_to_subscriber() {
        let (store, push, sid) = setup();
        let mut rx = attach_outbox(&push, &sid);
        assert!(!push.seed_subscription(&sid, |_| sample_report()));
        store.set_subscription(&sid, 2).unwrap();
        assert!(push.seed_subscription(&sid, |_| sample_report()));
        let envelope = rx.try_recv().unwrap();
        assert!(matches!(
            envelope.payload,
            MagicMessage::StatusChangeReport(_)
        ));
    }

    fn sample_report() -> StatusChangeReport {
        StatusChangeReport {
            change_type: magic_models::StatusChangeType::DlmUp,
            magic_status: MagicStatus::Success,
            error_message: None,
            registered_clients: vec![],
            dlm_list: vec![magic_models::DlmStatusSummary {
                dlm_id: DlmId::new("SAT"),
                available: true,
                max_forward_kbps: 10_000,
                allocated_forward_kbps: 0,
                max_return_kbps: 1_000,
                allocated_return_kbps: 0,
                max_links: 8,
                allocated_links: 0,
            }],
            link_details: vec![],
        }
    }
}

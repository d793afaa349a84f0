//! Session and client-context store.
//!
//! Fixed-capacity tables of [`Session`] and [`ClientContext`] rows behind a
//! single store mutex. The lock is held only to read or mutate rows — never
//! across DLM, dataplane or filesystem calls. Callers copy the fields they
//! need out of a snapshot, perform the outbound operation, then lock again
//! to commit.
//!
//! Client bandwidth quotas are charged and returned under the same lock as
//! the session transition that causes them, so the invariant
//! `Σ granted == client.total_allocated` holds at every observable point.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use magic_models::{
    AirportCondition, AltitudeCondition, BearerId, ClientId, DlmId, Kbps, ProfileName, Realm,
    SessionId, TftSpec,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Capacity of the global session table.
pub const MAX_SESSIONS: usize = 100;
/// Capacity of the client-context table.
pub const MAX_CLIENTS: usize = 50;
/// TFT rows one session may hold.
pub const MAX_TFT_PER_SESSION: usize = 8;
/// Sessions one client may hold concurrently, regardless of profile.
pub const MAX_SESSIONS_PER_CLIENT: usize = 10;

/// Session lifecycle states.
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString,
)]
pub enum SessionState {
    /// Request received, nothing allocated yet.
    Init,
    /// Credentials verified, no data channel.
    Authenticated,
    /// Resources allocated, traffic flowing.
    Active,
    /// Bandwidth or link change in progress.
    Modifying,
    /// Link lost; context retained, bandwidth frozen.
    Suspended,
    /// Resources being released, final CDR being written.
    Terminating,
    /// Torn down.
    Closed,
}

impl SessionState {
    /// States in which exactly one DLM assignment must exist.
    pub fn holds_link(self) -> bool {
        matches!(
            self,
            SessionState::Active | SessionState::Modifying | SessionState::Suspended
        )
    }
}

/// Status-subscription levels a client may hold.
pub const VALID_SUBSCRIPTION_LEVELS: [u8; 6] = [0, 1, 2, 3, 6, 7];

/// One client session.
#[derive(Debug, Clone)]
pub struct Session {
    /// Globally unique id.
    pub id: SessionId,
    /// Owning client (`Origin-Host`).
    pub client_id: ClientId,
    /// Client realm for notification routing.
    pub realm: Realm,
    /// Profile the session was admitted under.
    pub profile_name: ProfileName,
    /// Lifecycle state.
    pub state: SessionState,

    /// Assigned link; empty outside link-holding states.
    pub assigned_dlm: Option<DlmId>,
    /// Bearer on the assigned link.
    pub bearer_id: BearerId,
    /// Granted forward bandwidth.
    pub granted_forward: Kbps,
    /// Granted return bandwidth.
    pub granted_return: Kbps,
    /// Grants stashed while the session is suspended.
    frozen_forward: Kbps,
    frozen_return: Kbps,
    /// Effective QoS level.
    pub qos_level: u8,
    /// Effective priority class.
    pub priority_class: u8,

    /// Traffic-flow templates, at most [`MAX_TFT_PER_SESSION`].
    pub tfts: Vec<TftSpec>,

    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last observed activity, drives the idle sweep.
    pub last_activity: DateTime<Utc>,
    /// Time of the last link switch, drives hysteresis dwell.
    pub last_link_switch_at: Option<DateTime<Utc>>,
    /// Link held before the last switch.
    pub previous_dlm: Option<DlmId>,
    /// Authorization expiry.
    pub auth_expires_at: DateTime<Utc>,
    /// Grace period beyond `auth_expires_at`, seconds.
    pub auth_grace_secs: u32,

    /// Subscribed status level (0 = none).
    pub subscribed_level: u8,
    /// Time of the last notification sent to this session.
    pub last_notification_at: Option<DateTime<Utc>>,
    /// Bandwidth value last notified, for the change threshold.
    pub last_notified_bw: Kbps,
    /// True while an MNTR awaits its acknowledgement.
    pub notify_ack_pending: bool,
    /// When the pending MNTR was sent.
    pub notify_sent_at: Option<DateTime<Utc>>,

    /// Source address the client is pinned to.
    pub client_ip: Option<std::net::Ipv4Addr>,
    /// Gateway address handed to the client.
    pub gateway_ip: Option<std::net::Ipv4Addr>,
    /// Packet mark used by the meter and the dataplane.
    pub meter_mark: u32,
    /// Cached cumulative traffic, updated by the meter.
    pub bytes_in: u64,
    /// Cached cumulative traffic, updated by the meter.
    pub bytes_out: u64,
    /// Currently associated CDR.
    pub cdr_id: Option<u32>,
    /// Keep the session across link loss (queued re-allocation).
    pub keep_request: bool,

    /// Altitude activation condition carried by the admission request.
    pub altitude_condition: AltitudeCondition,
    /// Airport activation condition carried by the admission request.
    pub airport_condition: AirportCondition,
}

impl Session {
    fn new(id: SessionId, client_id: ClientId, realm: Realm, now: DateTime<Utc>) -> Self {
        Session {
            id,
            client_id,
            realm,
            profile_name: ProfileName::new("default"),
            state: SessionState::Init,
            assigned_dlm: None,
            bearer_id: BearerId::NONE,
            granted_forward: Kbps::ZERO,
            granted_return: Kbps::ZERO,
            frozen_forward: Kbps::ZERO,
            frozen_return: Kbps::ZERO,
            qos_level: 0,
            priority_class: 5,
            tfts: Vec::new(),
            created_at: now,
            last_activity: now,
            last_link_switch_at: None,
            previous_dlm: None,
            auth_expires_at: now,
            auth_grace_secs: 0,
            subscribed_level: 0,
            last_notification_at: None,
            last_notified_bw: Kbps::ZERO,
            notify_ack_pending: false,
            notify_sent_at: None,
            client_ip: None,
            gateway_ip: None,
            meter_mark: 0,
            bytes_in: 0,
            bytes_out: 0,
            cdr_id: None,
            keep_request: false,
            altitude_condition: AltitudeCondition::default(),
            airport_condition: AirportCondition::default(),
        }
    }
}

/// Per-client resource bookkeeping.
#[derive(Debug, Clone)]
pub struct ClientContext {
    /// Client identity.
    pub client_id: ClientId,
    /// Aggregate forward cap, kbps; zero = unlimited.
    pub max_forward: Kbps,
    /// Aggregate return cap.
    pub max_return: Kbps,
    /// Guaranteed forward floor.
    pub guaranteed_forward: Kbps,
    /// Guaranteed return floor.
    pub guaranteed_return: Kbps,
    /// Sum of forward grants across the client's sessions.
    pub total_allocated_forward: Kbps,
    /// Sum of return grants.
    pub total_allocated_return: Kbps,
    /// Concurrent session bound from the profile.
    pub max_concurrent_sessions: u32,
    /// Idle timeout from the profile, seconds.
    pub session_timeout_secs: u32,
    /// Ids of the client's live sessions.
    pub sessions: Vec<SessionId>,
    /// Lifetime counter.
    pub total_sessions_created: u64,
    /// Lifetime traffic counters.
    pub total_bytes_in: u64,
    /// Lifetime traffic counters.
    pub total_bytes_out: u64,
    /// First time the client was seen.
    pub first_seen: DateTime<Utc>,
}

impl ClientContext {
    fn new(client_id: ClientId, now: DateTime<Utc>) -> Self {
        ClientContext {
            client_id,
            max_forward: Kbps::ZERO,
            max_return: Kbps::ZERO,
            guaranteed_forward: Kbps::ZERO,
            guaranteed_return: Kbps::ZERO,
            total_allocated_forward: Kbps::ZERO,
            total_allocated_return: Kbps::ZERO,
            max_concurrent_sessions: 1,
            session_timeout_secs: 3600,
            sessions: Vec::new(),
            total_sessions_created: 0,
            total_bytes_in: 0,
            total_bytes_out: 0,
            first_seen: now,
        }
    }

    /// Quota preview: how much of a request this client could be granted
    /// right now, per direction.
    ///
    /// A cap of zero means unlimited in that direction. When the remaining
    /// headroom in a capped direction is below the guaranteed floor the
    /// whole request is refused.
    pub fn can_allocate(&self, req_forward: Kbps, req_return: Kbps) -> Option<(Kbps, Kbps)> {
        let forward = direction_grant(
            self.max_forward,
            self.guaranteed_forward,
            self.total_allocated_forward,
            req_forward,
        )?;
        let ret = direction_grant(
            self.max_return,
            self.guaranteed_return,
            self.total_allocated_return,
            req_return,
        )?;
        Some((forward, ret))
    }
}

fn direction_grant(cap: Kbps, guaranteed: Kbps, allocated: Kbps, request: Kbps) -> Option<Kbps> {
    if cap.is_zero() {
        // Unlimited; the guaranteed value is a floor, not a ceiling.
        return Some(request);
    }
    let available = cap.saturating_sub(allocated);
    if available < guaranteed {
        return None;
    }
    Some(request.min(available))
}

/// Errors surfaced by store operations.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    /// The session table is full.
    #[error("session table full ({0} rows)")]
    TableFull(usize),
    /// A session with this id already exists.
    #[error("duplicate session id {0}")]
    DuplicateSession(SessionId),
    /// The referenced session does not exist.
    #[error("unknown session id {0}")]
    UnknownSession(SessionId),
    /// The client would exceed its concurrent-session bound.
    #[error("client {0} session limit reached")]
    SessionLimit(ClientId),
    /// The client's bandwidth quota refuses the allocation.
    #[error("client {0} quota exhausted")]
    QuotaExceeded(ClientId),
    /// The requested state transition is not in the state machine.
    #[error("invalid transition {from} -> {to} for session {session}")]
    InvalidTransition {
        /// The session attempting the transition.
        session: SessionId,
        /// Current state.
        from: SessionState,
        /// Requested state.
        to: SessionState,
    },
    /// A subscription level outside {0,1,2,3,6,7}.
    #[error("invalid subscription level {0}")]
    InvalidSubscriptionLevel(u8),
    /// The session already holds the maximum number of TFT rows.
    #[error("TFT table full for session {0}")]
    TftTableFull(SessionId),
}

/// Quota caps copied from a profile when a session is created.
#[derive(Debug, Clone, Copy)]
pub struct QuotaSeed {
    /// Aggregate forward cap.
    pub max_forward: Kbps,
    /// Aggregate return cap.
    pub max_return: Kbps,
    /// Guaranteed forward floor.
    pub guaranteed_forward: Kbps,
    /// Guaranteed return floor.
    pub guaranteed_return: Kbps,
    /// Concurrent session bound.
    pub max_concurrent_sessions: u32,
    /// Idle timeout, seconds.
    pub session_timeout_secs: u32,
}

struct StoreInner {
    sessions: HashMap<SessionId, Session>,
    clients: HashMap<ClientId, ClientContext>,
}

/// The session/client store.
pub struct SessionStore {
    inner: Mutex<StoreInner>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    /// Create an empty store.
    pub fn new() -> Self {
        SessionStore {
            inner: Mutex::new(StoreInner {
                sessions: HashMap::new(),
                clients: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Snapshot a session by id.
    pub fn find_by_id(&self, id: &SessionId) -> Option<Session> {
        self.lock().sessions.get(id).cloned()
    }

    /// Snapshot the client context.
    pub fn client_context(&self, client_id: &ClientId) -> Option<ClientContext> {
        self.lock().clients.get(client_id).cloned()
    }

    /// Snapshot every session, in unspecified order.
    pub fn all_sessions(&self) -> Vec<Session> {
        self.lock().sessions.values().cloned().collect()
    }

    /// Snapshot every session in the given state.
    pub fn sessions_in_state(&self, state: SessionState) -> Vec<Session> {
        self.lock()
            .sessions
            .values()
            .filter(|s| s.state == state)
            .cloned()
            .collect()
    }

    /// Snapshot the active sessions currently placed on `dlm`.
    pub fn active_sessions_on_link(&self, dlm: &DlmId) -> Vec<Session> {
        self.lock()
            .sessions
            .values()
            .filter(|s| s.state.holds_link() && s.assigned_dlm.as_ref() == Some(dlm))
            .cloned()
            .collect()
    }

    /// Snapshot sessions with a live status subscription
    /// (level > 0, state Authenticated or Active).
    pub fn subscribed_sessions(&self) -> Vec<Session> {
        self.lock()
            .sessions
            .values()
            .filter(|s| {
                s.subscribed_level > 0
                    && matches!(
                        s.state,
                        SessionState::Authenticated | SessionState::Active
                    )
            })
            .cloned()
            .collect()
    }

    /// Create a session row in `Init` state and attach it to its client
    /// context, seeding the context's quota caps from the profile.
    ///
    /// # Errors
    ///
    /// Fails on duplicate id (the caller evicts the old session first and
    /// retries), full tables, or the client's session bound.
    pub fn create(
        &self,
        id: &SessionId,
        client_id: &ClientId,
        realm: &Realm,
        quota: QuotaSeed,
    ) -> Result<Session, StoreError> {
        let now = Utc::now();
        let mut inner = self.lock();

        if inner.sessions.contains_key(id) {
            return Err(StoreError::DuplicateSession(id.clone()));
        }
        if inner.sessions.len() >= MAX_SESSIONS {
            return Err(StoreError::TableFull(MAX_SESSIONS));
        }
        if !inner.clients.contains_key(client_id) && inner.clients.len() >= MAX_CLIENTS {
            return Err(StoreError::TableFull(MAX_CLIENTS));
        }

        let ctx = inner
            .clients
            .entry(client_id.clone())
            .or_insert_with(|| ClientContext::new(client_id.clone(), now));
        ctx.max_forward = quota.max_forward;
        ctx.max_return = quota.max_return;
        ctx.guaranteed_forward = quota.guaranteed_forward;
        ctx.guaranteed_return = quota.guaranteed_return;
        ctx.max_concurrent_sessions = quota.max_concurrent_sessions;
        ctx.session_timeout_secs = quota.session_timeout_secs;

        let per_client_cap =
            (ctx.max_concurrent_sessions as usize).min(MAX_SESSIONS_PER_CLIENT);
        if ctx.sessions.len() >= per_client_cap {
            return Err(StoreError::SessionLimit(client_id.clone()));
        }
        ctx.sessions.push(id.clone());
        ctx.total_sessions_created += 1;

        let session = Session::new(id.clone(), client_id.clone(), realm.clone(), now);
        inner.sessions.insert(id.clone(), session.clone());
        info!(session = %id, client = %client_id, "session created");
        Ok(session)
    }

    /// Quota preview for a client without committing anything.
    pub fn can_allocate(
        &self,
        client_id: &ClientId,
        req_forward: Kbps,
        req_return: Kbps,
    ) -> Option<(Kbps, Kbps)> {
        self.lock()
            .clients
            .get(client_id)
            .and_then(|ctx| ctx.can_allocate(req_forward, req_return))
    }

    /// Commit a link assignment: charge the client quota, record the link
    /// fields and move the session to `Active`.
    ///
    /// Re-assigning the same link with the same grants is a no-op beyond a
    /// timestamp refresh. Assigning a different link records the previous
    /// link and the switch time for hysteresis.
    ///
    /// # Errors
    ///
    /// Fails when the session is unknown or the quota refuses the grant;
    /// the caller must then release whatever it reserved on the DLM.
    pub fn assign_link(
        &self,
        id: &SessionId,
        dlm: &DlmId,
        bearer: BearerId,
        forward: Kbps,
        ret: Kbps,
    ) -> Result<Session, StoreError> {
        let now = Utc::now();
        let mut inner = self.lock();
        let StoreInner { sessions, clients } = &mut *inner;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| StoreError::UnknownSession(id.clone()))?;
        let ctx = clients
            .get_mut(&session.client_id)
            .ok_or_else(|| StoreError::UnknownSession(id.clone()))?;

        if session.assigned_dlm.as_ref() == Some(dlm)
            && session.bearer_id == bearer
            && session.granted_forward == forward
            && session.granted_return == ret
        {
            session.last_activity = now;
            return Ok(session.clone());
        }

        // Return the old grant before checking the new one.
        ctx.total_allocated_forward -= session.granted_forward;
        ctx.total_allocated_return -= session.granted_return;

        let Some((grant_fwd, grant_ret)) = ctx.can_allocate(forward, ret) else {
            // Put the old grant back; the row is unchanged.
            ctx.total_allocated_forward += session.granted_forward;
            ctx.total_allocated_return += session.granted_return;
            return Err(StoreError::QuotaExceeded(session.client_id.clone()));
        };

        ctx.total_allocated_forward += grant_fwd;
        ctx.total_allocated_return += grant_ret;

        match &session.assigned_dlm {
            Some(old) if old != dlm => {
                session.previous_dlm = Some(old.clone());
                session.last_link_switch_at = Some(now);
            }
            None => {
                // First assignment counts as a switch for dwell purposes.
                session.last_link_switch_at = Some(now);
            }
            _ => {}
        }

        session.assigned_dlm = Some(dlm.clone());
        session.bearer_id = bearer;
        session.granted_forward = grant_fwd;
        session.granted_return = grant_ret;
        session.frozen_forward = Kbps::ZERO;
        session.frozen_return = Kbps::ZERO;
        session.state = SessionState::Active;
        session.last_activity = now;
        debug!(session = %id, link = %dlm, bearer = %bearer, fwd = %grant_fwd, ret = %grant_ret, "link assigned");
        Ok(session.clone())
    }

    /// Release the link resource fields, returning the grant to the client
    /// quota. The row stays; the state is set by the caller afterwards.
    pub fn release_link(&self, id: &SessionId) -> Result<Session, StoreError> {
        let mut inner = self.lock();
        let StoreInner { sessions, clients } = &mut *inner;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| StoreError::UnknownSession(id.clone()))?;
        if let Some(ctx) = clients.get_mut(&session.client_id) {
            ctx.total_allocated_forward -= session.granted_forward;
            ctx.total_allocated_return -= session.granted_return;
        }
        session.assigned_dlm = None;
        session.bearer_id = BearerId::NONE;
        session.granted_forward = Kbps::ZERO;
        session.granted_return = Kbps::ZERO;
        session.frozen_forward = Kbps::ZERO;
        session.frozen_return = Kbps::ZERO;
        session.gateway_ip = None;
        session.last_activity = Utc::now();
        Ok(session.clone())
    }

    /// Transition the session's state, enforcing the state machine.
    ///
    /// # Errors
    ///
    /// [`StoreError::InvalidTransition`] for transitions outside the
    /// machine.
    pub fn set_state(&self, id: &SessionId, new: SessionState) -> Result<Session, StoreError> {
        let mut inner = self.lock();
        let session = inner
            .sessions
            .get_mut(id)
            .ok_or_else(|| StoreError::UnknownSession(id.clone()))?;
        if !transition_allowed(session.state, new) {
            return Err(StoreError::InvalidTransition {
                session: id.clone(),
                from: session.state,
                to: new,
            });
        }
        session.state = new;
        session.last_activity = Utc::now();
        Ok(session.clone())
    }

    /// Record the granted status-subscription level.
    ///
    /// # Errors
    ///
    /// Rejects levels outside {0, 1, 2, 3, 6, 7}.
    pub fn set_subscription(&self, id: &SessionId, level: u8) -> Result<(), StoreError> {
        if !VALID_SUBSCRIPTION_LEVELS.contains(&level) {
            return Err(StoreError::InvalidSubscriptionLevel(level));
        }
        let mut inner = self.lock();
        let session = inner
            .sessions
            .get_mut(id)
            .ok_or_else(|| StoreError::UnknownSession(id.clone()))?;
        session.subscribed_level = level;
        session.last_activity = Utc::now();
        Ok(())
    }

    /// Suspend an active session on link loss: bandwidth is frozen to zero
    /// (and returned to the quota) while the link assignment is retained.
    pub fn suspend(&self, id: &SessionId) -> Result<Session, StoreError> {
        let mut inner = self.lock();
        let StoreInner { sessions, clients } = &mut *inner;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| StoreError::UnknownSession(id.clone()))?;
        if session.state != SessionState::Active {
            return Err(StoreError::InvalidTransition {
                session: id.clone(),
                from: session.state,
                to: SessionState::Suspended,
            });
        }
        if let Some(ctx) = clients.get_mut(&session.client_id) {
            ctx.total_allocated_forward -= session.granted_forward;
            ctx.total_allocated_return -= session.granted_return;
        }
        session.frozen_forward = session.granted_forward;
        session.frozen_return = session.granted_return;
        session.granted_forward = Kbps::ZERO;
        session.granted_return = Kbps::ZERO;
        session.state = SessionState::Suspended;
        session.last_activity = Utc::now();
        info!(session = %id, "session suspended");
        Ok(session.clone())
    }

    /// Resume a suspended session, restoring the frozen grant.
    pub fn resume(&self, id: &SessionId) -> Result<Session, StoreError> {
        let mut inner = self.lock();
        let StoreInner { sessions, clients } = &mut *inner;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| StoreError::UnknownSession(id.clone()))?;
        if session.state != SessionState::Suspended {
            return Err(StoreError::InvalidTransition {
                session: id.clone(),
                from: session.state,
                to: SessionState::Active,
            });
        }
        if let Some(ctx) = clients.get_mut(&session.client_id) {
            ctx.total_allocated_forward += session.frozen_forward;
            ctx.total_allocated_return += session.frozen_return;
        }
        session.granted_forward = session.frozen_forward;
        session.granted_return = session.frozen_return;
        session.frozen_forward = Kbps::ZERO;
        session.frozen_return = Kbps::ZERO;
        session.state = SessionState::Active;
        session.last_activity = Utc::now();
        info!(session = %id, "session resumed");
        Ok(session.clone())
    }

    /// Erase a session row: quota returned, TFTs cleared, link released,
    /// client context detached.
    ///
    /// # Errors
    ///
    /// [`StoreError::UnknownSession`] — with no side effects.
    pub fn delete(&self, id: &SessionId) -> Result<Session, StoreError> {
        let mut inner = self.lock();
        let mut session = inner
            .sessions
            .remove(id)
            .ok_or_else(|| StoreError::UnknownSession(id.clone()))?;
        if let Some(ctx) = inner.clients.get_mut(&session.client_id) {
            ctx.total_allocated_forward -= session.granted_forward;
            ctx.total_allocated_return -= session.granted_return;
            ctx.total_bytes_in += session.bytes_in;
            ctx.total_bytes_out += session.bytes_out;
            ctx.sessions.retain(|s| s != id);
        }
        session.state = SessionState::Closed;
        session.assigned_dlm = None;
        session.granted_forward = Kbps::ZERO;
        session.granted_return = Kbps::ZERO;
        session.tfts.clear();
        info!(session = %id, "session deleted");
        Ok(session)
    }

    /// Sessions whose idle time exceeds their client's timeout, plus
    /// sessions past authorization lifetime and grace. Snapshots only; the
    /// orchestrator performs the teardown.
    pub fn expired_sessions(&self, now: DateTime<Utc>) -> Vec<Session> {
        let inner = self.lock();
        inner
            .sessions
            .values()
            .filter(|s| {
                if matches!(s.state, SessionState::Terminating | SessionState::Closed) {
                    return false;
                }
                let timeout = inner
                    .clients
                    .get(&s.client_id)
                    .map_or(3600, |c| i64::from(c.session_timeout_secs));
                let idle = (now - s.last_activity).num_seconds();
                if timeout > 0 && idle > timeout {
                    warn!(session = %s.id, idle, "session idle timeout");
                    return true;
                }
                let auth_deadline =
                    s.auth_expires_at + chrono::Duration::seconds(i64::from(s.auth_grace_secs));
                if now > auth_deadline {
                    warn!(session = %s.id, "authorization lifetime expired");
                    return true;
                }
                false
            })
            .cloned()
            .collect()
    }

    /// Apply a closure to the stored row, when present. For small field
    /// updates (auth expiry, cached traffic, notify bookkeeping).
    pub fn update<F: FnOnce(&mut Session)>(&self, id: &SessionId, f: F) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let session = inner
            .sessions
            .get_mut(id)
            .ok_or_else(|| StoreError::UnknownSession(id.clone()))?;
        f(session);
        Ok(())
    }

    // -- TFT management -----------------------------------------------------

    /// Append a TFT row.
    ///
    /// # Errors
    ///
    /// Fails when the session already holds [`MAX_TFT_PER_SESSION`] rows.
    pub fn add_tft(&self, id: &SessionId, tft: TftSpec) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let session = inner
            .sessions
            .get_mut(id)
            .ok_or_else(|| StoreError::UnknownSession(id.clone()))?;
        if session.tfts.len() >= MAX_TFT_PER_SESSION {
            return Err(StoreError::TftTableFull(id.clone()));
        }
        session.tfts.push(tft);
        Ok(())
    }

    /// Remove every TFT row of the session.
    pub fn clear_tfts(&self, id: &SessionId) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let session = inner
            .sessions
            .get_mut(id)
            .ok_or_else(|| StoreError::UnknownSession(id.clone()))?;
        session.tfts.clear();
        Ok(())
    }

    /// Find the first TFT matching a concrete 5-tuple, honouring 0/absent
    /// wildcards on protocol and ports.
    pub fn find_tft(
        &self,
        id: &SessionId,
        src: std::net::Ipv4Addr,
        dst: std::net::Ipv4Addr,
        protocol: u8,
        src_port: u16,
        dst_port: u16,
    ) -> Option<TftSpec> {
        let inner = self.lock();
        let session = inner.sessions.get(id)?;
        session
            .tfts
            .iter()
            .find(|t| {
                (t.protocol == 0 || t.protocol == protocol)
                    && t.src.is_none_or(|net| net.contains(&src))
                    && t.dst.is_none_or(|net| net.contains(&dst))
                    && t.src_ports.is_none_or(|r| r.contains(src_port))
                    && t.dst_ports.is_none_or(|r| r.contains(dst_port))
            })
            .copied()
    }
}

/// The session state machine. Transitions not listed are invalid.
fn transition_allowed(from: SessionState, to: SessionState) -> bool {
    use SessionState::{
        Active, Authenticated, Closed, Init, Modifying, Suspended, Terminating,
    };
    matches!(
        (from, to),
        (Init, Authenticated)
            | (Authenticated, Authenticated)
            | (Authenticated, Active)
            | (Active, Modifying)
            | (Modifying, Active)
            | (Active, Suspended)
            | (Suspended, Active)
            | (Active, Authenticated)      // stop request keeps the login
            | (Modifying, Authenticated)
            | (_, Terminating)
            | (Terminating, Closed)
    ) && from != Closed
}

//! Control-protocol envelope and message payloads.
//!
//! Every message between a client application and the gateway is one
//! [`MagicEnvelope`] carrying a [`MagicMessage`] payload. Requests originate
//! at clients; answers echo the request's envelope id in `correlation_id`.
//! [`MagicMessage::NotificationReport`] and
//! [`MagicMessage::StatusChangeReport`] also travel server→client as
//! unsolicited pushes.
//!
//! Bandwidth fields suffixed `_bps` are wire-side bits per second; the
//! conversion to the internal kbps bookkeeping unit happens at the handler
//! boundary via [`crate::bandwidth::Kbps`].

use std::fmt;
use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::codes::{MagicStatus, ResultCode};
use crate::error::ModelError;
use crate::ids::{BearerId, ClientId, DlmId, ProfileName, Realm, SessionId};

// ---------------------------------------------------------------------------
// Port ranges and traffic-flow templates
// ---------------------------------------------------------------------------

/// Inclusive TCP/UDP port range.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortRange {
    /// First port of the range.
    pub start: u16,
    /// Last port of the range, inclusive.
    pub end: u16,
}

impl PortRange {
    /// Construct a range, validating ordering.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::InvalidPortRange`] when `start > end`.
    pub fn new(start: u16, end: u16) -> Result<Self, ModelError> {
        if start > end {
            return Err(ModelError::InvalidPortRange {
                value: format!("{start}-{end}"),
                reason: "start exceeds end".into(),
            });
        }
        Ok(PortRange { start, end })
    }

    /// True when the port lies inside the range.
    pub fn contains(self, port: u16) -> bool {
        port >= self.start && port <= self.end
    }

    /// True when `inner` lies entirely inside this range.
    pub fn covers(self, inner: PortRange) -> bool {
        inner.start >= self.start && inner.end <= self.end
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// Direction of a traffic-flow template.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[serde(rename_all = "snake_case")]
pub enum TftDirection {
    /// Aircraft → ground.
    ToGround,
    /// Ground → aircraft.
    ToAircraft,
}

/// One traffic-flow-template row: a 5-tuple with wildcards.
///
/// `protocol == 0` and absent networks/ports mean "any".
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct TftSpec {
    /// Flow direction.
    pub direction: TftDirection,
    /// IP protocol number; 0 = any.
    #[serde(default)]
    pub protocol: u8,
    /// Source network; absent = any.
    #[serde(default)]
    pub src: Option<Ipv4Net>,
    /// Destination network; absent = any.
    #[serde(default)]
    pub dst: Option<Ipv4Net>,
    /// Source port range; absent = any.
    #[serde(default)]
    pub src_ports: Option<PortRange>,
    /// Destination port range; absent = any.
    #[serde(default)]
    pub dst_ports: Option<PortRange>,
}

// ---------------------------------------------------------------------------
// Common answer plumbing
// ---------------------------------------------------------------------------

/// Result block carried by every answer.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AnswerStatus {
    /// Protocol-level result code.
    pub result_code: ResultCode,
    /// Detailed MAGIC status, when one applies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub magic_status: Option<MagicStatus>,
    /// Free-form diagnostic for logs and operators.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl AnswerStatus {
    /// Plain success.
    pub fn success() -> Self {
        AnswerStatus {
            result_code: ResultCode::Success,
            magic_status: None,
            error_message: None,
        }
    }

    /// Failure with both code spaces populated.
    pub fn failure(result: ResultCode, status: MagicStatus, message: impl Into<String>) -> Self {
        AnswerStatus {
            result_code: result,
            magic_status: Some(status),
            error_message: Some(message.into()),
        }
    }

    /// True when the protocol-level result is success.
    pub fn is_success(&self) -> bool {
        self.result_code.is_success()
    }
}

/// Resource grant reported in CAA/CCA answers and handover notifications.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ResourceGrant {
    /// The link the session was placed on.
    pub dlm_id: DlmId,
    /// Bearer handle on that link.
    pub bearer_id: BearerId,
    /// Granted forward bandwidth, bits per second.
    pub granted_forward_bps: u64,
    /// Granted return bandwidth, bits per second.
    pub granted_return_bps: u64,
    /// Effective QoS level.
    pub qos_level: u8,
    /// Effective priority class.
    pub priority_class: u8,
    /// Gateway address the client should route through, when one is
    /// assigned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_ip: Option<Ipv4Addr>,
}

/// Outcome of link selection in a communication-change answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectedLink {
    /// A link was granted.
    Link(DlmId),
    /// The request was queued for later allocation.
    Queued,
    /// No link could be granted.
    None,
}

impl fmt::Display for SelectedLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectedLink::Link(id) => f.write_str(id.as_str()),
            SelectedLink::Queued => f.write_str("QUEUED"),
            SelectedLink::None => f.write_str("NONE"),
        }
    }
}

impl Serialize for SelectedLink {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for SelectedLink {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        match s.as_str() {
            "QUEUED" => Ok(SelectedLink::Queued),
            "NONE" => Ok(SelectedLink::None),
            "" => Err(D::Error::custom("empty selected-link")),
            other => Ok(SelectedLink::Link(DlmId::new(other))),
        }
    }
}

// ---------------------------------------------------------------------------
// Communication request group
// ---------------------------------------------------------------------------

/// The communication-request parameter group, shared by CAR (0-RTT
/// admission) and CCR.
///
/// Absent optional parameters are filled from the client profile before
/// policy evaluation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct CommunicationRequest {
    /// Profile to account the request under.
    pub profile_name: Option<ProfileName>,
    /// Requested forward bandwidth, bits per second.
    pub requested_forward_bps: Option<u64>,
    /// Requested return bandwidth, bits per second.
    pub requested_return_bps: Option<u64>,
    /// Required (floor) forward bandwidth, bits per second.
    pub required_forward_bps: Option<u64>,
    /// Required (floor) return bandwidth, bits per second.
    pub required_return_bps: Option<u64>,
    /// Priority class override, 1–9.
    pub priority_class: Option<u8>,
    /// QoS level override.
    pub qos_level: Option<u8>,
    /// Pin the request to one DLM.
    pub dlm_id: Option<DlmId>,
    /// Flight phase the client believes it is in; filled from live aircraft
    /// state when absent.
    pub flight_phase: Option<String>,
    /// Altitude activation expression (see [`crate::conditions`]).
    pub altitude: Option<String>,
    /// Airport activation expression.
    pub airport: Option<String>,
    /// Whether accounting records are wanted (default true).
    pub accounting_enabled: Option<bool>,
    /// Keep the request queued when resources are unavailable.
    pub keep_request: Option<bool>,
    /// Queue timeout override, seconds.
    pub timeout_secs: Option<u32>,
    /// Aircraft→ground traffic-flow templates.
    pub tft_to_ground: Vec<TftSpec>,
    /// Ground→aircraft traffic-flow templates.
    pub tft_to_aircraft: Vec<TftSpec>,
    /// NAPT rule strings, passed through to the dataplane.
    pub napt_rules: Vec<String>,
}

impl CommunicationRequest {
    /// All TFT rows of both directions, in submission order.
    pub fn all_tfts(&self) -> impl Iterator<Item = &TftSpec> {
        self.tft_to_ground.iter().chain(self.tft_to_aircraft.iter())
    }

    /// True when every named bandwidth is zero or absent — the protocol's
    /// way of asking for a stop.
    pub fn is_stop_request(&self) -> bool {
        self.requested_forward_bps.unwrap_or(0) == 0
            && self.requested_return_bps.unwrap_or(0) == 0
    }
}

/// Observable session fields reported in notifications (MNTR) and mirrored
/// back by inbound notification reports.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(default)]
pub struct CommunicationReport {
    /// Granted forward bandwidth, bits per second.
    pub granted_forward_bps: Option<u64>,
    /// Granted return bandwidth, bits per second.
    pub granted_return_bps: Option<u64>,
    /// The link the session sits on.
    pub dlm_id: Option<DlmId>,
    /// Bearer on that link.
    pub bearer_id: Option<BearerId>,
    /// Gateway address after a handover.
    pub gateway_ip: Option<Ipv4Addr>,
}

// ---------------------------------------------------------------------------
// Status answer content
// ---------------------------------------------------------------------------

/// One registered client in a status answer, deduplicated by client id.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RegisteredClient {
    /// Client identity.
    pub client_id: ClientId,
    /// Number of sessions the client currently holds.
    pub session_count: u32,
    /// True when the client holds more than one session.
    pub multi_session: bool,
}

/// Aggregate per-DLM figures in a status answer.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DlmStatusSummary {
    /// The link.
    pub dlm_id: DlmId,
    /// Whether the link is currently usable.
    pub available: bool,
    /// Capacity, forward direction, kbps.
    pub max_forward_kbps: u32,
    /// Currently allocated, forward direction, kbps.
    pub allocated_forward_kbps: u32,
    /// Capacity, return direction, kbps.
    pub max_return_kbps: u32,
    /// Currently allocated, return direction, kbps.
    pub allocated_return_kbps: u32,
    /// Bearer slots the link offers.
    pub max_links: u32,
    /// Bearers currently reserved.
    pub allocated_links: u32,
}

/// Detailed per-link figures, reported only at status levels 6/7.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LinkStatusDetail {
    /// The link.
    pub dlm_id: DlmId,
    /// Nominal latency, milliseconds.
    pub latency_ms: u32,
    /// Nominal jitter, milliseconds.
    pub jitter_ms: u32,
    /// Nominal loss rate, 0.0–1.0.
    pub packet_loss_rate: f32,
    /// Current load, percent of capacity.
    pub load_percent: u32,
}

/// Kind of change announced by a status-change report.
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
pub enum StatusChangeType {
    /// A link came up.
    DlmUp,
    /// A link went down.
    DlmDown,
    /// A link degraded.
    DlmDegraded,
    /// A client registered.
    ClientJoin,
    /// A client left.
    ClientLeave,
}

// ---------------------------------------------------------------------------
// Accounting request plumbing
// ---------------------------------------------------------------------------

/// What an accounting-data request wants back.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CdrRequestType {
    /// Only CDR ids.
    List,
    /// CDR ids plus content strings.
    Data,
}

/// Isolation level of an accounting-data request.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CdrRequestLevel {
    /// Every record the caller may see.
    All,
    /// Records whose client id matches the caller.
    UserDependent,
    /// Only the record named by `cdr_request_id`.
    SessionDependent,
}

/// One CDR reference in an accounting-data answer.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CdrSummary {
    /// Record id.
    pub cdr_id: u32,
    /// `key=value` content string, present for `Data`-type requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

// ---------------------------------------------------------------------------
// Message payloads
// ---------------------------------------------------------------------------

/// Client-Authentication-Request (CAR).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct AuthenticationRequest {
    /// Credentials group.
    pub username: Option<String>,
    /// Client password matching the profile secret.
    pub client_password: Option<String>,
    /// Requested status-subscription level (0, 1, 2, 3, 6, 7).
    pub status_subscription: Option<u8>,
    /// Optional 0-RTT admission request.
    pub communication_request: Option<CommunicationRequest>,
}

/// Client-Authentication-Answer (CAA).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AuthenticationAnswer {
    /// Result block.
    pub status: AnswerStatus,
    /// Granted resources when 0-RTT admission succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grant: Option<ResourceGrant>,
    /// Granted subscription level after permission clamping.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub granted_subscription: Option<u8>,
    /// Authorization lifetime, seconds.
    pub auth_lifetime_secs: u32,
    /// Grace period after lifetime expiry, seconds.
    pub auth_grace_secs: u32,
}

/// Communication-Change-Request (CCR).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CommunicationChangeRequest {
    /// The parameter group.
    pub communication_request: CommunicationRequest,
}

/// Communication-Change-Answer (CCA).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CommunicationChangeAnswer {
    /// Result block.
    pub status: AnswerStatus,
    /// Selected link, `QUEUED`, or `NONE`.
    pub selected_link: SelectedLink,
    /// Granted resources on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grant: Option<ResourceGrant>,
}

/// Session-Termination-Request (STR).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionTerminationRequest {}

/// Session-Termination-Answer (STA).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionTerminationAnswer {
    /// Result block.
    pub status: AnswerStatus,
    /// Final inbound byte count recorded in the CDR.
    pub final_bytes_in: u64,
    /// Final outbound byte count recorded in the CDR.
    pub final_bytes_out: u64,
}

/// Status-Request (SXR).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StatusRequest {
    /// Requested status level (1, 2, 3, 6, 7).
    pub status_type: u8,
}

/// Status-Answer (SXA).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StatusAnswer {
    /// Result block.
    pub status: AnswerStatus,
    /// Status level actually served, after permission clamping.
    pub status_type: u8,
    /// Registered clients, when the level and permissions include them.
    #[serde(default)]
    pub registered_clients: Vec<RegisteredClient>,
    /// Per-DLM aggregates, filtered by the caller's allowed-DLM set.
    #[serde(default)]
    pub dlm_list: Vec<DlmStatusSummary>,
    /// Detailed link figures at level 6/7.
    #[serde(default)]
    pub link_details: Vec<LinkStatusDetail>,
}

/// Accounting-Data-Request (ADR).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AccountingDataRequest {
    /// List or Data.
    pub cdr_type: CdrRequestType,
    /// Isolation level.
    pub cdr_level: CdrRequestLevel,
    /// Specific record wanted, for `SessionDependent` requests.
    #[serde(default)]
    pub cdr_request_id: Option<u32>,
}

/// Accounting-Data-Answer (ADA).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AccountingDataAnswer {
    /// Result block.
    pub status: AnswerStatus,
    /// Currently active records.
    pub active_cdrs: Vec<CdrSummary>,
    /// Closed records.
    pub finished_cdrs: Vec<CdrSummary>,
    /// Reserved; always empty until a forwarding store exists.
    pub forwarded_cdrs: Vec<CdrSummary>,
    /// Ids that were asked for but not found.
    pub unknown_cdrs: Vec<u32>,
}

/// Accounting-Control-Request (ACR) — bill rollover without disconnect.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AccountingControlRequest {
    /// Session whose accounting is to be rolled over.
    pub restart_session_id: SessionId,
}

/// Accounting-Control-Answer (ACA).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AccountingControlAnswer {
    /// Result block.
    pub status: AnswerStatus,
    /// Record closed by the rollover.
    #[serde(default)]
    pub old_cdr_id: Option<u32>,
    /// Record opened by the rollover.
    #[serde(default)]
    pub new_cdr_id: Option<u32>,
}

/// Notification-Report (MNTR when server-initiated, NTR inbound).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct NotificationReport {
    /// Detailed reason for the notification.
    pub magic_status: MagicStatus,
    /// Free-form diagnostic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Changed observable fields.
    #[serde(default)]
    pub report: CommunicationReport,
}

/// Acknowledgement of a notification report.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct NotificationAck {
    /// Result block.
    pub status: AnswerStatus,
}

/// Status-Change-Report (MSCR broadcast, SCR inbound).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StatusChangeReport {
    /// Kind of change.
    pub change_type: StatusChangeType,
    /// Detailed status of the change.
    pub magic_status: MagicStatus,
    /// Free-form diagnostic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Registered clients, per subscription level.
    #[serde(default)]
    pub registered_clients: Vec<RegisteredClient>,
    /// Per-DLM aggregates, per subscription level.
    #[serde(default)]
    pub dlm_list: Vec<DlmStatusSummary>,
    /// Detailed link figures, per subscription level.
    #[serde(default)]
    pub link_details: Vec<LinkStatusDetail>,
}

/// Acknowledgement of a status-change report.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StatusChangeAck {
    /// Result block.
    pub status: AnswerStatus,
}

// ---------------------------------------------------------------------------
// The message union and envelope
// ---------------------------------------------------------------------------

/// Discriminator for the content of a [`MagicEnvelope`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum MagicMessage {
    /// CAR.
    AuthenticationRequest(AuthenticationRequest),
    /// CAA.
    AuthenticationAnswer(AuthenticationAnswer),
    /// CCR.
    CommunicationChangeRequest(CommunicationChangeRequest),
    /// CCA.
    CommunicationChangeAnswer(CommunicationChangeAnswer),
    /// STR.
    SessionTerminationRequest(SessionTerminationRequest),
    /// STA.
    SessionTerminationAnswer(SessionTerminationAnswer),
    /// SXR.
    StatusRequest(StatusRequest),
    /// SXA.
    StatusAnswer(StatusAnswer),
    /// ADR.
    AccountingDataRequest(AccountingDataRequest),
    /// ADA.
    AccountingDataAnswer(AccountingDataAnswer),
    /// ACR.
    AccountingControlRequest(AccountingControlRequest),
    /// ACA.
    AccountingControlAnswer(AccountingControlAnswer),
    /// MNTR (server→client) or NTR (client→server).
    NotificationReport(NotificationReport),
    /// Acknowledgement of a notification report.
    NotificationAck(NotificationAck),
    /// MSCR (server→client) or SCR (client→server).
    StatusChangeReport(StatusChangeReport),
    /// Acknowledgement of a status-change report.
    StatusChangeAck(StatusChangeAck),
}

impl MagicMessage {
    /// Short command mnemonic for logging.
    pub fn mnemonic(&self) -> &'static str {
        match self {
            MagicMessage::AuthenticationRequest(_) => "CAR",
            MagicMessage::AuthenticationAnswer(_) => "CAA",
            MagicMessage::CommunicationChangeRequest(_) => "CCR",
            MagicMessage::CommunicationChangeAnswer(_) => "CCA",
            MagicMessage::SessionTerminationRequest(_) => "STR",
            MagicMessage::SessionTerminationAnswer(_) => "STA",
            MagicMessage::StatusRequest(_) => "SXR",
            MagicMessage::StatusAnswer(_) => "SXA",
            MagicMessage::AccountingDataRequest(_) => "ADR",
            MagicMessage::AccountingDataAnswer(_) => "ADA",
            MagicMessage::AccountingControlRequest(_) => "ACR",
            MagicMessage::AccountingControlAnswer(_) => "ACA",
            MagicMessage::NotificationReport(_) => "MNTR",
            MagicMessage::NotificationAck(_) => "MNTA",
            MagicMessage::StatusChangeReport(_) => "MSCR",
            MagicMessage::StatusChangeAck(_) => "MSCA",
        }
    }
}

/// The outermost message envelope on the control connection.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MagicEnvelope {
    /// Unique message identifier.
    pub id: Uuid,
    /// Creation timestamp (UTC).
    pub timestamp: DateTime<Utc>,
    /// Id of the request this message answers, when any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Session the message belongs to.
    pub session_id: SessionId,
    /// Sender identity.
    pub origin_host: ClientId,
    /// Sender realm.
    pub origin_realm: Realm,
    /// The message content.
    pub payload: MagicMessage,
}

impl MagicEnvelope {
    /// Build a fresh envelope.
    pub fn new(
        session_id: SessionId,
        origin_host: ClientId,
        origin_realm: Realm,
        payload: MagicMessage,
    ) -> Self {
        MagicEnvelope {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            correlation_id: None,
            session_id,
            origin_host,
            origin_realm,
            payload,
        }
    }

    /// Build an answer to `request`: same session id, correlation id set to
    /// the request's envelope id, sender set to the gateway identity.
    pub fn answer_to(
        request: &MagicEnvelope,
        origin_host: ClientId,
        origin_realm: Realm,
        payload: MagicMessage,
    ) -> Self {
        MagicEnvelope {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            correlation_id: Some(request.id.to_string()),
            session_id: request.session_id.clone(),
            origin_host,
            origin_realm,
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_envelope() -> MagicEnvelope {
        MagicEnvelope::new(
            SessionId::new("ife.cabin;1;1"),
            ClientId::new("ife.cabin.aircraft"),
            Realm::new("aircraft"),
            MagicMessage::AuthenticationRequest(AuthenticationRequest {
                username: Some("ife".into()),
                client_password: Some("cabin-secret".into()),
                status_subscription: Some(3),
                communication_request: Some(CommunicationRequest {
                    requested_forward_bps: Some(500_000),
                    flight_phase: Some("Gate".into()),
                    ..CommunicationRequest::default()
                }),
            }),
        )
    }

    #[test]
    fn envelope_serde_roundtrip() {
        let env = sample_envelope();
        let json = serde_json::to_string(&env).unwrap();
        let back: MagicEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(env, back);
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let env = sample_envelope();
        let mut value = serde_json::to_value(&env).unwrap();
        value["vendor_extension"] = serde_json::json!({"x": 1});
        let back: MagicEnvelope = serde_json::from_value(value).unwrap();
        assert_eq!(env, back);
    }

    #[test]
    fn answer_links_back_to_request() {
        let req = sample_envelope();
        let ans = MagicEnvelope::answer_to(
            &req,
            ClientId::new("magic.gateway"),
            Realm::new("aircraft"),
            MagicMessage::NotificationAck(NotificationAck {
                status: AnswerStatus::success(),
            }),
        );
        assert_eq!(ans.correlation_id, Some(req.id.to_string()));
        assert_eq!(ans.session_id, req.session_id);
    }

    #[test]
    fn selected_link_string_forms() {
        let json = serde_json::to_string(&SelectedLink::Queued).unwrap();
        assert_eq!(json, "\"QUEUED\"");
        let json = serde_json::to_string(&SelectedLink::None).unwrap();
        assert_eq!(json, "\"NONE\"");
        let json = serde_json::to_string(&SelectedLink::Link(DlmId::new("LINK_SATCOM"))).unwrap();
        assert_eq!(json, "\"LINK_SATCOM\"");
        let back: SelectedLink = serde_json::from_str("\"LINK_GATE\"").unwrap();
        assert_eq!(back, SelectedLink::Link(DlmId::new("LINK_GATE")));
    }

    #[test]
    fn port_range_validation_and_covers() {
        assert!(PortRange::new(10, 5).is_err());
        let outer = PortRange::new(1000, 2000).unwrap();
        let inner = PortRange::new(1500, 1600).unwrap();
        assert!(outer.covers(inner));
        assert!(!inner.covers(outer));
        assert!(outer.contains(1000));
        assert!(!outer.contains(2001));
    }

    #[test]
    fn stop_request_detection() {
        let mut req = CommunicationRequest::default();
        assert!(req.is_stop_request());
        req.requested_forward_bps = Some(0);
        assert!(req.is_stop_request());
        req.requested_return_bps = Some(128_000);
        assert!(!req.is_stop_request());
    }

    #[test]
    fn mnemonics() {
        let env = sample_envelope();
        assert_eq!(env.payload.mnemonic(), "CAR");
    }
}

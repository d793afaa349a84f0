//! Protocol result codes and detailed MAGIC status codes.
//!
//! Every answer carries a protocol-level [`ResultCode`]; most failures
//! additionally carry a [`MagicStatus`] describing the detailed reason.
//! The two code spaces are independent: `2001` is protocol success but also
//! the MAGIC code for an invalid session state.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Protocol-level result of a request.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(into = "u32", try_from = "u32")]
pub enum ResultCode {
    /// `2001`: the request succeeded.
    Success,
    /// `3004`: the server is rate-limiting the caller; retry later.
    TooBusy,
    /// `4001`: authentication was rejected.
    AuthorizationRejected,
    /// `5002`: the referenced session id is unknown.
    UnknownSessionId,
    /// `5003`: the request is well-formed but not authorized semantically.
    NotAuthorized,
    /// `5004`: a field carried an invalid value.
    InvalidValue,
    /// `5005`: a mandatory field is missing.
    MissingMandatoryField,
    /// `5012`: the server is unable to comply with the request.
    UnableToComply,
}

impl From<ResultCode> for u32 {
    fn from(code: ResultCode) -> u32 {
        match code {
            ResultCode::Success => 2001,
            ResultCode::TooBusy => 3004,
            ResultCode::AuthorizationRejected => 4001,
            ResultCode::UnknownSessionId => 5002,
            ResultCode::NotAuthorized => 5003,
            ResultCode::InvalidValue => 5004,
            ResultCode::MissingMandatoryField => 5005,
            ResultCode::UnableToComply => 5012,
        }
    }
}

impl TryFrom<u32> for ResultCode {
    type Error = String;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            2001 => Ok(ResultCode::Success),
            3004 => Ok(ResultCode::TooBusy),
            4001 => Ok(ResultCode::AuthorizationRejected),
            5002 => Ok(ResultCode::UnknownSessionId),
            5003 => Ok(ResultCode::NotAuthorized),
            5004 => Ok(ResultCode::InvalidValue),
            5005 => Ok(ResultCode::MissingMandatoryField),
            5012 => Ok(ResultCode::UnableToComply),
            other => Err(format!("unknown result code {other}")),
        }
    }
}

impl ResultCode {
    /// The numeric wire value.
    pub fn code(self) -> u32 {
        u32::from(self)
    }

    /// True for `2001`.
    pub fn is_success(self) -> bool {
        self == ResultCode::Success
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Detailed MAGIC status code (ARINC 839 Attachment 1 code space).
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(into = "u32", try_from = "u32")]
pub enum MagicStatus {
    /// `0`: success.
    Success,
    /// `1000`: a mandatory parameter is missing.
    MissingParameter,
    /// `1001`: bad username or password.
    AuthenticationFailed,
    /// `1007`: the client profile does not allow the current flight phase.
    FlightPhaseNotAllowed,
    /// `1008`: the client profile does not allow the current altitude.
    AltitudeNotAllowed,
    /// `1009`: the client profile does not allow the current airport.
    AirportNotAllowed,
    /// `1010`: no bandwidth available for the request.
    NoBandwidth,
    /// `1011`: the pending-request queue is full.
    QueueFull,
    /// `1016`: the session's bandwidth was preempted or shrunk.
    BandwidthPreempted,
    /// `1017`: source IP does not match the registered client address.
    IpMismatch,
    /// `1020`: a requested flight-phase activation condition is violated.
    ConditionPhaseViolated,
    /// `1021`: a requested altitude activation condition is violated.
    ConditionAltitudeViolated,
    /// `1022`: a requested airport activation condition is violated.
    ConditionAirportViolated,
    /// `1024`: the session idle timeout expired.
    SessionTimeout,
    /// `1025`: the gateway is shutting down.
    GatewayShutdown,
    /// `1036`: a submitted TFT rule is outside the client's whitelist.
    TftInvalid,
    /// `2001`: the session is in a state that forbids the operation.
    InvalidSessionState,
    /// `2007`: generic link error (link lost, modem fault).
    LinkError,
    /// `2008`: releasing the link resource failed.
    CloseLinkFailed,
    /// `2009`: internal gateway failure.
    GatewayFailure,
    /// `2010`: the session was force-rerouted to another link.
    ForcedRerouting,
    /// `3000`: unknown issue.
    Unknown,
    /// `3001`: a parameter carried an invalid value.
    InvalidParameter,
    /// `5001`: accounting: the referenced session is unknown.
    AccountingUnknownSession,
    /// `5002`: accounting: the request could not be processed.
    AccountingNotProcessed,
    /// `5003`: accounting: CDR control denied for this client.
    CdrControlDenied,
    /// `5012`: unable to comply.
    UnableToComply,
}

impl From<MagicStatus> for u32 {
    fn from(status: MagicStatus) -> u32 {
        match status {
            MagicStatus::Success => 0,
            MagicStatus::MissingParameter => 1000,
            MagicStatus::AuthenticationFailed => 1001,
            MagicStatus::FlightPhaseNotAllowed => 1007,
            MagicStatus::AltitudeNotAllowed => 1008,
            MagicStatus::AirportNotAllowed => 1009,
            MagicStatus::NoBandwidth => 1010,
            MagicStatus::QueueFull => 1011,
            MagicStatus::BandwidthPreempted => 1016,
            MagicStatus::IpMismatch => 1017,
            MagicStatus::ConditionPhaseViolated => 1020,
            MagicStatus::ConditionAltitudeViolated => 1021,
            MagicStatus::ConditionAirportViolated => 1022,
            MagicStatus::SessionTimeout => 1024,
            MagicStatus::GatewayShutdown => 1025,
            MagicStatus::TftInvalid => 1036,
            MagicStatus::InvalidSessionState => 2001,
            MagicStatus::LinkError => 2007,
            MagicStatus::CloseLinkFailed => 2008,
            MagicStatus::GatewayFailure => 2009,
            MagicStatus::ForcedRerouting => 2010,
            MagicStatus::Unknown => 3000,
            MagicStatus::InvalidParameter => 3001,
            MagicStatus::AccountingUnknownSession => 5001,
            MagicStatus::AccountingNotProcessed => 5002,
            MagicStatus::CdrControlDenied => 5003,
            MagicStatus::UnableToComply => 5012,
        }
    }
}

impl TryFrom<u32> for MagicStatus {
    type Error = String;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MagicStatus::Success),
            1000 => Ok(MagicStatus::MissingParameter),
            1001 => Ok(MagicStatus::AuthenticationFailed),
            1007 => Ok(MagicStatus::FlightPhaseNotAllowed),
            1008 => Ok(MagicStatus::AltitudeNotAllowed),
            1009 => Ok(MagicStatus::AirportNotAllowed),
            1010 => Ok(MagicStatus::NoBandwidth),
            1011 => Ok(MagicStatus::QueueFull),
            1016 => Ok(MagicStatus::BandwidthPreempted),
            1017 => Ok(MagicStatus::IpMismatch),
            1020 => Ok(MagicStatus::ConditionPhaseViolated),
            1021 => Ok(MagicStatus::ConditionAltitudeViolated),
            1022 => Ok(MagicStatus::ConditionAirportViolated),
            1024 => Ok(MagicStatus::SessionTimeout),
            1025 => Ok(MagicStatus::GatewayShutdown),
            1036 => Ok(MagicStatus::TftInvalid),
            2001 => Ok(MagicStatus::InvalidSessionState),
            2007 => Ok(MagicStatus::LinkError),
            2008 => Ok(MagicStatus::CloseLinkFailed),
            2009 => Ok(MagicStatus::GatewayFailure),
            2010 => Ok(MagicStatus::ForcedRerouting),
            3000 => Ok(MagicStatus::Unknown),
            3001 => Ok(MagicStatus::InvalidParameter),
            5001 => Ok(MagicStatus::AccountingUnknownSession),
            5002 => Ok(MagicStatus::AccountingNotProcessed),
            5003 => Ok(MagicStatus::CdrControlDenied),
            5012 => Ok(MagicStatus::UnableToComply),
            other => Err(format!("unknown MAGIC status code {other}")),
        }
    }
}

impl MagicStatus {
    /// The numeric wire value.
    pub fn code(self) -> u32 {
        u32::from(self)
    }
}

impl fmt::Display for MagicStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Machine-friendly reason a policy decision failed.
#[derive(
    Serialize,
    Deserialize,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PolicyDenyReason {
    /// No candidate link has enough free bandwidth.
    NoBw,
    /// The current flight phase forbids the request.
    PhaseNotAllowed,
    /// The current altitude forbids the request.
    AltitudeDenied,
    /// The current airport forbids the request.
    AirportDenied,
    /// No candidate link covers the aircraft position.
    NoCoverage,
    /// Every candidate link was excluded by the caller.
    AllLinksExcluded,
    /// The client's bandwidth quota is exhausted.
    QuotaExceeded,
    /// No policy rule or traffic class matches the request.
    ConfigNotFound,
}

impl PolicyDenyReason {
    /// Map the deny reason to the MAGIC status code reported to the client.
    pub fn magic_status(self) -> MagicStatus {
        match self {
            PolicyDenyReason::NoBw => MagicStatus::NoBandwidth,
            PolicyDenyReason::PhaseNotAllowed => MagicStatus::FlightPhaseNotAllowed,
            PolicyDenyReason::AltitudeDenied => MagicStatus::AltitudeNotAllowed,
            PolicyDenyReason::AirportDenied => MagicStatus::AirportNotAllowed,
            PolicyDenyReason::NoCoverage
            | PolicyDenyReason::AllLinksExcluded
            | PolicyDenyReason::ConfigNotFound => MagicStatus::UnableToComply,
            PolicyDenyReason::QuotaExceeded => MagicStatus::NoBandwidth,
        }
    }
}

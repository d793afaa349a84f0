//! Error types for the `magic-models` crate.
//!
//! All fallible constructors and parsers in this crate return variants of
//! [`ModelError`].

/// Errors produced when constructing or validating model types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModelError {
    /// An altitude activation expression could not be parsed.
    #[error("invalid altitude expression \"{value}\": {reason}")]
    InvalidAltitudeExpression {
        /// The value that failed validation.
        value: String,
        /// Human-readable explanation.
        reason: String,
    },

    /// An airport activation expression could not be parsed.
    #[error("invalid airport expression \"{value}\": {reason}")]
    InvalidAirportExpression {
        /// The value that failed validation.
        value: String,
        /// Human-readable explanation.
        reason: String,
    },

    /// A flight-phase string did not name a known phase.
    #[error("invalid flight phase \"{value}\"")]
    InvalidFlightPhase {
        /// The value that failed validation.
        value: String,
    },

    /// A port range was empty or inverted.
    #[error("invalid port range \"{value}\": {reason}")]
    InvalidPortRange {
        /// The value that failed validation.
        value: String,
        /// Human-readable explanation.
        reason: String,
    },

    /// A traffic-flow-template row failed structural validation.
    #[error("invalid TFT rule: {reason}")]
    InvalidTft {
        /// Human-readable explanation.
        reason: String,
    },

    /// A required field was missing during message construction.
    #[error("missing required field: {field}")]
    MissingField {
        /// The name of the missing field.
        field: String,
    },
}

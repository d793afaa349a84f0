//! Flight phases and the aircraft state published by the avionics data
//! source.
//!
//! The gateway subscribes to an external aircraft-data (ADIF) publisher and
//! receives periodic [`AircraftState`] samples. Policy decisions and session
//! activation conditions are evaluated against the most recent sample.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// Discrete flight phase reported by the aircraft data source.
#[derive(
    Serialize,
    Deserialize,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[strum(ascii_case_insensitive)]
pub enum FlightPhase {
    /// Parked at the gate, boarding or deplaning.
    Gate,
    /// Ground movement under own power.
    Taxi,
    /// Takeoff roll and initial rotation.
    TakeOff,
    /// Climb to cruise level.
    Climb,
    /// Level cruise.
    Cruise,
    /// Descent from cruise.
    Descent,
    /// Final approach.
    Approach,
    /// Touchdown and rollout.
    Landing,
    /// Maintenance operations, aircraft out of service.
    Maintenance,
}

impl FlightPhase {
    /// Parse a phase string, case-insensitively.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::InvalidFlightPhase`] for unknown phase names.
    pub fn parse(s: &str) -> Result<Self, ModelError> {
        s.parse().map_err(|_| ModelError::InvalidFlightPhase {
            value: s.to_string(),
        })
    }

    /// True for the phases in which the aircraft is on the ground in normal
    /// operation.
    pub fn is_ground_phase(self) -> bool {
        matches!(
            self,
            FlightPhase::Gate | FlightPhase::Taxi | FlightPhase::Maintenance
        )
    }
}

/// One sample of the aircraft state.
///
/// `data_valid` is false while the publisher itself reports degraded data
/// (e.g. during alignment); consumers must treat position-derived checks as
/// unanswerable in that case rather than assume a position of 0/0.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AircraftState {
    /// Latitude in degrees, −90 to 90.
    pub latitude: f64,
    /// Longitude in degrees, −180 to 180.
    pub longitude: f64,
    /// Pressure altitude in feet.
    pub altitude_ft: f64,
    /// Ground speed in knots.
    pub ground_speed_kts: f64,
    /// Weight on wheels: true while the aircraft is on the ground.
    pub weight_on_wheels: bool,
    /// Discrete flight phase.
    pub flight_phase: FlightPhase,
    /// ICAO/IATA code of the nearest airport, when known.
    pub nearest_airport: Option<String>,
    /// False while the publisher reports its own data as unreliable.
    pub data_valid: bool,
    /// Publisher timestamp of the sample.
    pub timestamp: DateTime<Utc>,
}

impl AircraftState {
    /// A conservative placeholder used before the first sample arrives:
    /// on the ground at the gate with invalid data.
    pub fn unavailable() -> Self {
        AircraftState {
            latitude: 0.0,
            longitude: 0.0,
            altitude_ft: 0.0,
            ground_speed_kts: 0.0,
            weight_on_wheels: true,
            flight_phase: FlightPhase::Gate,
            nearest_airport: None,
            data_valid: false,
            timestamp: DateTime::<Utc>::MIN_UTC,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_parse_is_case_insensitive() {
        assert_eq!(FlightPhase::parse("CRUISE").unwrap(), FlightPhase::Cruise);
        assert_eq!(FlightPhase::parse("cruise").unwrap(), FlightPhase::Cruise);
        assert_eq!(FlightPhase::parse("TakeOff").unwrap(), FlightPhase::TakeOff);
        assert!(FlightPhase::parse("Hover").is_err());
    }

    #[test]
    fn phase_display() {
        assert_eq!(FlightPhase::Gate.to_string(), "Gate");
        assert_eq!(FlightPhase::TakeOff.to_string(), "TakeOff");
    }

    #[test]
    fn ground_phases() {
        assert!(FlightPhase::Gate.is_ground_phase());
        assert!(FlightPhase::Taxi.is_ground_phase());
        assert!(!FlightPhase::Cruise.is_ground_phase());
    }

    #[test]
    fn unavailable_state_is_invalid_on_ground() {
        let state = AircraftState::unavailable();
        assert!(!state.data_valid);
        assert!(state.weight_on_wheels);
    }

    #[test]
    fn state_serde_roundtrip() {
        let state = AircraftState {
            latitude: 48.1,
            longitude: 11.5,
            altitude_ft: 36_000.0,
            ground_speed_kts: 470.0,
            weight_on_wheels: false,
            flight_phase: FlightPhase::Cruise,
            nearest_airport: Some("MUC".into()),
            data_valid: true,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&state).unwrap();
        let back: AircraftState = serde_json::from_str(&json).unwrap();
        assert_eq!(state, back);
    }
}

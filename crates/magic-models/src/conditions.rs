//! Session activation conditions carried inside a communication request.
//!
//! A client may restrict where its session is allowed to be active using two
//! string-valued expressions:
//!
//! - **Altitude**: comma-separated feet ranges, `"<lo>-<hi>"`, `"-<hi>"`
//!   (no lower bound), `"<lo>-"` (no upper bound) or a single value; an
//!   optional `"not "` prefix turns the whole list into a blacklist.
//! - **Airport**: a comma-separated list of airport codes, with the same
//!   optional `"not "` blacklist prefix.
//!
//! The gateway checks these once at admission and again on every aircraft
//! state change; a violation terminates the session.

use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// One inclusive altitude band in feet; `None` means unbounded on that side.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct AltitudeRange {
    /// Lower bound in feet, inclusive.
    pub min_ft: Option<i32>,
    /// Upper bound in feet, inclusive.
    pub max_ft: Option<i32>,
}

impl AltitudeRange {
    fn contains(self, altitude_ft: i32) -> bool {
        self.min_ft.is_none_or(|lo| altitude_ft >= lo)
            && self.max_ft.is_none_or(|hi| altitude_ft <= hi)
    }
}

/// Parsed altitude activation expression.
///
/// An empty expression admits every altitude.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct AltitudeCondition {
    /// True when the ranges enumerate *forbidden* altitudes.
    pub blacklist: bool,
    /// The altitude bands named by the expression.
    pub ranges: Vec<AltitudeRange>,
}

impl AltitudeCondition {
    /// Parse an altitude expression such as `"1000-2000"`, `"-5000"`,
    /// `"20000-"` or `"not 1000-2000,8000-"`.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::InvalidAltitudeExpression`] when a range token
    /// is not numeric or a blacklist prefix carries no ranges.
    pub fn parse(expr: &str) -> Result<Self, ModelError> {
        let expr = expr.trim();
        if expr.is_empty() {
            return Ok(AltitudeCondition::default());
        }

        let (blacklist, body) = match expr.strip_prefix("not ") {
            Some(rest) => (true, rest),
            None => (false, expr),
        };

        let invalid = |reason: &str| ModelError::InvalidAltitudeExpression {
            value: expr.to_string(),
            reason: reason.to_string(),
        };

        let mut ranges = Vec::new();
        for token in body.split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            let range = if let Some(hi) = token.strip_prefix('-') {
                // "-5000": no lower bound
                AltitudeRange {
                    min_ft: None,
                    max_ft: Some(parse_feet(hi).ok_or_else(|| invalid("bad upper bound"))?),
                }
            } else if let Some(lo) = token.strip_suffix('-') {
                // "20000-": no upper bound
                AltitudeRange {
                    min_ft: Some(parse_feet(lo).ok_or_else(|| invalid("bad lower bound"))?),
                    max_ft: None,
                }
            } else if let Some((lo, hi)) = token.split_once('-') {
                AltitudeRange {
                    min_ft: Some(parse_feet(lo).ok_or_else(|| invalid("bad lower bound"))?),
                    max_ft: Some(parse_feet(hi).ok_or_else(|| invalid("bad upper bound"))?),
                }
            } else {
                // Single value: a point range.
                let ft = parse_feet(token).ok_or_else(|| invalid("bad altitude value"))?;
                AltitudeRange {
                    min_ft: Some(ft),
                    max_ft: Some(ft),
                }
            };
            ranges.push(range);
        }

        if ranges.is_empty() {
            return Err(invalid("expression names no ranges"));
        }

        Ok(AltitudeCondition { blacklist, ranges })
    }

    /// True when the condition admits the given altitude.
    ///
    /// An empty condition admits everything; a whitelist admits altitudes
    /// inside any range, a blacklist admits altitudes inside none.
    pub fn admits(&self, altitude_ft: i32) -> bool {
        if self.ranges.is_empty() {
            return true;
        }
        let inside = self.ranges.iter().any(|r| r.contains(altitude_ft));
        inside != self.blacklist
    }

    /// True when the expression was empty (no restriction).
    pub fn is_unrestricted(&self) -> bool {
        self.ranges.is_empty()
    }
}

fn parse_feet(s: &str) -> Option<i32> {
    s.trim().parse().ok()
}

/// Parsed airport activation expression.
///
/// An empty expression admits every airport; a whitelist admits only listed
/// codes, a blacklist admits every code but the listed ones.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct AirportCondition {
    /// True when the codes enumerate *forbidden* airports.
    pub blacklist: bool,
    /// Airport codes named by the expression, upper-cased.
    pub codes: Vec<String>,
}

impl AirportCondition {
    /// Parse an airport expression such as `"MUC,FRA"` or `"not LHR"`.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::InvalidAirportExpression`] when a blacklist
    /// prefix carries no codes.
    pub fn parse(expr: &str) -> Result<Self, ModelError> {
        let expr = expr.trim();
        if expr.is_empty() {
            return Ok(AirportCondition::default());
        }

        let (blacklist, body) = match expr.strip_prefix("not ") {
            Some(rest) => (true, rest),
            None => (false, expr),
        };

        let codes: Vec<String> = body
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_uppercase)
            .collect();

        if codes.is_empty() {
            return Err(ModelError::InvalidAirportExpression {
                value: expr.to_string(),
                reason: "expression names no airports".to_string(),
            });
        }

        Ok(AirportCondition { blacklist, codes })
    }

    /// True when the condition admits the given airport.
    ///
    /// `None` (airport unknown) is admitted by a blacklist but rejected by a
    /// whitelist: a whitelist demands proof of presence.
    pub fn admits(&self, airport: Option<&str>) -> bool {
        if self.codes.is_empty() {
            return true;
        }
        match airport {
            Some(code) => {
                let listed = self.codes.iter().any(|c| c.eq_ignore_ascii_case(code));
                listed != self.blacklist
            }
            None => self.blacklist,
        }
    }

    /// True when the expression was empty (no restriction).
    pub fn is_unrestricted(&self) -> bool {
        self.codes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn altitude_full_range() {
        let cond = AltitudeCondition::parse("1000-2000").unwrap();
        assert!(cond.admits(1000));
        assert!(cond.admits(1500));
        assert!(cond.admits(2000));
        assert!(!cond.admits(999));
        assert!(!cond.admits(2001));
    }

    #[test]
    fn altitude_open_below() {
        let cond = AltitudeCondition::parse("-5000").unwrap();
        assert!(cond.admits(0));
        assert!(cond.admits(5000));
        assert!(!cond.admits(5001));
    }

    #[test]
    fn altitude_open_above() {
        let cond = AltitudeCondition::parse("20000-").unwrap();
        assert!(!cond.admits(19_999));
        assert!(cond.admits(20_000));
        assert!(cond.admits(41_000));
    }

    #[test]
    fn altitude_blacklist_inverts() {
        let cond = AltitudeCondition::parse("not 1000-2000").unwrap();
        assert!(cond.admits(999));
        assert!(!cond.admits(1500));
        assert!(cond.admits(2001));
    }

    #[test]
    fn altitude_comma_list() {
        let cond = AltitudeCondition::parse("0-1000, 30000-40000").unwrap();
        assert!(cond.admits(500));
        assert!(!cond.admits(15_000));
        assert!(cond.admits(35_000));
    }

    #[test]
    fn altitude_single_value_is_point_range() {
        let cond = AltitudeCondition::parse("35000").unwrap();
        assert!(cond.admits(35_000));
        assert!(!cond.admits(35_001));
    }

    #[test]
    fn altitude_empty_admits_everything() {
        let cond = AltitudeCondition::parse("").unwrap();
        assert!(cond.is_unrestricted());
        assert!(cond.admits(-100));
        assert!(cond.admits(45_000));
    }

    #[test]
    fn altitude_rejects_garbage() {
        assert!(AltitudeCondition::parse("abc-def").is_err());
        assert!(AltitudeCondition::parse("not ").is_err());
    }

    #[test]
    fn airport_whitelist() {
        let cond = AirportCondition::parse("MUC,FRA").unwrap();
        assert!(cond.admits(Some("MUC")));
        assert!(cond.admits(Some("fra")));
        assert!(!cond.admits(Some("LHR")));
        // Whitelist demands a known airport.
        assert!(!cond.admits(None));
    }

    #[test]
    fn airport_blacklist() {
        let cond = AirportCondition::parse("not LHR").unwrap();
        assert!(!cond.admits(Some("LHR")));
        assert!(cond.admits(Some("MUC")));
        assert!(cond.admits(None));
    }

    #[test]
    fn condition_serde_roundtrip() {
        let cond = AltitudeCondition::parse("not 1000-2000,30000-").unwrap();
        let json = serde_json::to_string(&cond).unwrap();
        let back: AltitudeCondition = serde_json::from_str(&json).unwrap();
        assert_eq!(cond, back);
    }
}

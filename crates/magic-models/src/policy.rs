//! Central policy profile: traffic classification and path selection rules.
//!
//! The policy document maps client attributes to an abstract traffic class,
//! then maps (flight phase, traffic class) to an ordered list of path
//! preferences. A global switching policy bounds how eagerly sessions may
//! hop between links.

use serde::{Deserialize, Serialize};

use crate::aircraft::FlightPhase;
use crate::ids::DlmId;

/// Simple shell-like wildcard match supporting `*` and `?`.
///
/// Used for profile-name patterns in traffic-class definitions.
pub fn wildcard_match(pattern: &str, input: &str) -> bool {
    let pat: Vec<char> = pattern.chars().collect();
    let txt: Vec<char> = input.chars().collect();

    // Iterative backtracking over the last `*`.
    let (mut p, mut t) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;
    while t < txt.len() {
        if p < pat.len() && (pat[p] == '?' || pat[p] == txt[t]) {
            p += 1;
            t += 1;
        } else if p < pat.len() && pat[p] == '*' {
            star = Some((p, t));
            p += 1;
        } else if let Some((sp, st)) = star {
            p = sp + 1;
            t = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    while p < pat.len() && pat[p] == '*' {
        p += 1;
    }
    p == pat.len()
}

/// Match rules mapping client attributes to one traffic class.
///
/// All *enabled* predicates must match (conjunction); the first matching
/// definition wins.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TrafficClassDefinition {
    /// Class identifier (e.g. `"COCKPIT_DATA"`, `"BULK_DATA"`).
    pub id: String,
    /// Exact priority-class predicate, when set.
    #[serde(default)]
    pub match_priority_class: Option<u8>,
    /// Exact QoS-level predicate, when set.
    #[serde(default)]
    pub match_qos_level: Option<u8>,
    /// Profile-name wildcard patterns; any match satisfies the predicate.
    #[serde(default)]
    pub match_profile_patterns: Vec<String>,
    /// Fallback class used when no definition matches.
    #[serde(default)]
    pub is_default: bool,
}

impl TrafficClassDefinition {
    /// Evaluate the definition against client attributes.
    pub fn matches(&self, priority_class: u8, qos_level: u8, profile_name: &str) -> bool {
        if let Some(pc) = self.match_priority_class {
            if pc != priority_class {
                return false;
            }
        }
        if let Some(q) = self.match_qos_level {
            if q != qos_level {
                return false;
            }
        }
        if !self.match_profile_patterns.is_empty() {
            let any = self
                .match_profile_patterns
                .iter()
                .any(|p| wildcard_match(p, profile_name));
            if !any {
                return false;
            }
        }
        // A definition with no predicates at all only matches as default.
        self.match_priority_class.is_some()
            || self.match_qos_level.is_some()
            || !self.match_profile_patterns.is_empty()
    }
}

/// Traffic class assigned when nothing matches and no default is defined.
pub const BEST_EFFORT_CLASS: &str = "best-effort";

/// Action a path preference takes for its target link.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PathAction {
    /// The link may be used.
    Permit,
    /// The link must not be used for this traffic class.
    Prohibit,
}

/// One ranked link preference inside a policy rule.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PathPreference {
    /// Rank; smaller is better.
    pub ranking: u32,
    /// Target DLM.
    pub dlm_id: DlmId,
    /// Permit or prohibit.
    pub action: PathAction,
    /// Reject the link when its nominal latency exceeds this bound.
    #[serde(default)]
    pub max_latency_ms: Option<u32>,
    /// Usable only while on the ground (WoW = true).
    #[serde(default)]
    pub on_ground_only: bool,
    /// Usable only while airborne (WoW = false).
    #[serde(default)]
    pub airborne_only: bool,
    /// Minimum security level the link must declare.
    #[serde(default)]
    pub required_security_level: u8,
}

/// Ordered link preferences for one traffic class.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PolicyRule {
    /// Traffic class this rule applies to.
    pub traffic_class: String,
    /// Preferences, evaluated by ascending `ranking`.
    pub preferences: Vec<PathPreference>,
}

/// Rules applicable during a set of flight phases.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PolicyRuleSet {
    /// Rule-set identifier.
    pub id: String,
    /// Flight phases this rule set serves.
    pub flight_phases: Vec<FlightPhase>,
    /// The rules, one per traffic class.
    pub rules: Vec<PolicyRule>,
}

/// Global link-switching damping parameters.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwitchingPolicy {
    /// Minimum time a session must dwell on a link after a switch.
    pub min_dwell_secs: u32,
    /// Required free-bandwidth improvement (percentage points) before a
    /// switch away from a working link is allowed.
    pub hysteresis_percent: u32,
}

impl Default for SwitchingPolicy {
    fn default() -> Self {
        SwitchingPolicy {
            min_dwell_secs: 30,
            hysteresis_percent: 20,
        }
    }
}

/// The central policy document.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CentralPolicy {
    /// Traffic-class definitions, evaluated in order.
    pub traffic_classes: Vec<TrafficClassDefinition>,
    /// Link-switch damping.
    #[serde(default)]
    pub switching: SwitchingPolicy,
    /// Phase-keyed rule sets.
    pub rulesets: Vec<PolicyRuleSet>,
}

impl CentralPolicy {
    /// Classify client attributes into a traffic class id.
    ///
    /// First matching definition wins; otherwise the default definition;
    /// otherwise [`BEST_EFFORT_CLASS`].
    pub fn classify(&self, priority_class: u8, qos_level: u8, profile_name: &str) -> String {
        for def in &self.traffic_classes {
            if def.matches(priority_class, qos_level, profile_name) {
                return def.id.clone();
            }
        }
        self.traffic_classes
            .iter()
            .find(|d| d.is_default)
            .map_or_else(|| BEST_EFFORT_CLASS.to_string(), |d| d.id.clone())
    }

    /// Find the rule set serving a flight phase.
    pub fn ruleset_for_phase(&self, phase: FlightPhase) -> Option<&PolicyRuleSet> {
        self.rulesets
            .iter()
            .find(|rs| rs.flight_phases.contains(&phase))
    }
}

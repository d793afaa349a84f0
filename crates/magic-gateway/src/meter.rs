//! Per-session traffic metering.
//!
//! Each registered session gets a non-zero 32-bit packet mark derived from a
//! deterministic hash of its id; the dataplane stamps matching packets with
//! that mark and the kernel accumulates byte/packet counters per mark. The
//! meter reads those cumulative counters through a [`CounterSource`] and
//! turns them into wrap-safe logical totals.
//!
//! Wrap rule: a sample that goes backwards by more than half the 64-bit
//! range is a true counter wrap (the wrap counter is bumped and the new
//! sample accepted); a smaller backwards step is a transient kernel anomaly
//! and is ignored.

use std::collections::HashMap;
use std::hash::Hasher;
use std::sync::Mutex;

use fnv::FnvHasher;
use magic_models::SessionId;
use tracing::{debug, warn};

/// One cumulative counter sample for a mark.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSample {
    /// Cumulative inbound bytes.
    pub bytes_in: u64,
    /// Cumulative outbound bytes.
    pub bytes_out: u64,
    /// Cumulative inbound packets.
    pub packets_in: u64,
    /// Cumulative outbound packets.
    pub packets_out: u64,
}

/// Source of kernel counters, keyed by packet mark.
pub trait CounterSource: Send + Sync {
    /// Read the cumulative counters for a mark; `None` while the kernel has
    /// not seen the mark yet.
    fn read(&self, mark: u32) -> Option<CounterSample>;
}

/// Wrap-aware reading handed to accounting.
///
/// Byte counts stay in the raw counter domain; accounting folds the wraps
/// in as `wraps × 2^64` when computing actual traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficReading {
    /// Accepted cumulative inbound bytes.
    pub bytes_in: u64,
    /// Accepted cumulative outbound bytes.
    pub bytes_out: u64,
    /// Cumulative inbound packets.
    pub packets_in: u64,
    /// Cumulative outbound packets.
    pub packets_out: u64,
    /// Inbound wraps seen so far.
    pub wraps_in: u32,
    /// Outbound wraps seen so far.
    pub wraps_out: u32,
}

struct MeterEntry {
    mark: u32,
    last: CounterSample,
    wraps_in: u32,
    wraps_out: u32,
}

/// The meter: session registry plus the counter source.
pub struct TrafficMeter {
    source: std::sync::Arc<dyn CounterSource>,
    entries: Mutex<HashMap<SessionId, MeterEntry>>,
}

/// Derive the stable non-zero packet mark for a session id (FNV-1a).
pub fn mark_for_session(id: &SessionId) -> u32 {
    let mut hasher = FnvHasher::default();
    hasher.write(id.as_str().as_bytes());
    let mark = (hasher.finish() & 0xFFFF_FFFF) as u32;
    if mark == 0 {
        1
    } else {
        mark
    }
}

impl TrafficMeter {
    /// Create the meter over a counter source.
    pub fn new(source: std::sync::Arc<dyn CounterSource>) -> Self {
        TrafficMeter {
            source,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Register a session and return its mark.
    pub fn register(&self, id: &SessionId) -> u32 {
        let mark = mark_for_session(id);
        let mut entries = self.entries.lock().unwrap();
        entries.entry(id.clone()).or_insert(MeterEntry {
            mark,
            last: CounterSample::default(),
            wraps_in: 0,
            wraps_out: 0,
        });
        debug!(session = %id, mark = format_args!("{mark:#x}"), "meter registered");
        mark
    }

    /// Drop a session's metering state.
    pub fn unregister(&self, id: &SessionId) {
        self.entries.lock().unwrap().remove(id);
    }

    /// Sample the counters for a session, applying the wrap rule.
    /// Returns `None` for unregistered sessions.
    pub fn sample(&self, id: &SessionId) -> Option<TrafficReading> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.get_mut(id)?;
        let raw = self.source.read(entry.mark).unwrap_or(entry.last);

        let bytes_in = reconcile(&mut entry.wraps_in, &mut entry.last.bytes_in, raw.bytes_in, id);
        let bytes_out =
            reconcile(&mut entry.wraps_out, &mut entry.last.bytes_out, raw.bytes_out, id);
        if raw.packets_in >= entry.last.packets_in {
            entry.last.packets_in = raw.packets_in;
        }
        if raw.packets_out >= entry.last.packets_out {
            entry.last.packets_out = raw.packets_out;
        }

        Some(TrafficReading {
            bytes_in,
            bytes_out,
            packets_in: entry.last.packets_in,
            packets_out: entry.last.packets_out,
            wraps_in: entry.wraps_in,
            wraps_out: entry.wraps_out,
        })
    }

    /// The mark a session was registered with, when any.
    pub fn mark_of(&self, id: &SessionId) -> Option<u32> {
        self.entries.lock().unwrap().get(id).map(|e| e.mark)
    }
}

/// Apply the wrap rule to one direction and return the accepted cumulative
/// value. Wraps are reported through the counter, not folded into the value.
fn reconcile(wraps: &mut u32, last: &mut u64, new: u64, id: &SessionId) -> u64 {
    if new >= *last {
        *last = new;
    } else {
        let drop = *last - new;
        if drop > u64::MAX / 2 {
            *wraps += 1;
            warn!(session = %id, wraps = *wraps, "counter wrap detected");
            *last = new;
        } else {
            // Transient anomaly; keep the previous sample.
            debug!(session = %id, drop, "counter anomaly ignored");
        }
    }
    *last
}

/// Counter source that always reads zero; used when metering is disabled.
pub struct NullCounterSource;

impl CounterSource for NullCounterSource {
    fn read(&self, _mark: u32) -> Option<CounterSample> {
        None
    }
}

/// Kernel counter source backed by the conntrack table.
///
/// Sums the byte/packet counters of every flow carrying the session's
/// connection mark. Requires `net.netfilter.nf_conntrack_acct=1`.
pub struct ConntrackCounterSource {
    path: std::path::PathBuf,
}

impl ConntrackCounterSource {
    /// Read from the default `/proc/net/nf_conntrack`.
    pub fn new() -> Self {
        Self::with_path("/proc/net/nf_conntrack")
    }

    /// Read from an alternate table dump (tests).
    pub fn with_path(path: impl Into<std::path::PathBuf>) -> Self {
        ConntrackCounterSource { path: path.into() }
    }
}

impl Default for ConntrackCounterSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CounterSource for ConntrackCounterSource {
    fn read(&self, mark: u32) -> Option<CounterSample> {
        let table = std::fs::read_to_string(&self.path).ok()?;
        Some(sum_conntrack(&table, mark))
    }
}

/// Sum the per-direction counters of every conntrack entry with the given
/// mark. Each entry line carries two `packets=`/`bytes=` pairs: original
/// direction first (outbound), reply direction second (inbound).
fn sum_conntrack(table: &str, mark: u32) -> CounterSample {
    let needle = format!("mark={mark}");
    let mut sample = CounterSample::default();
    for line in table.lines() {
        if !line.split_whitespace().any(|token| token == needle) {
            continue;
        }
        let mut packets = [0u64; 2];
        let mut bytes = [0u64; 2];
        let mut packet_idx = 0;
        let mut byte_idx = 0;
        for token in line.split_whitespace() {
            if let Some(v) = token.strip_prefix("packets=") {
                if packet_idx < 2 {
                    packets[packet_idx] = v.parse().unwrap_or(0);
                    packet_idx += 1;
                }
            } else if let Some(v) = token.strip_prefix("bytes=") {
                if byte_idx < 2 {
                    bytes[byte_idx] = v.parse().unwrap_or(0);
                    byte_idx += 1;
                }
            }
        }
        sample.bytes_out += bytes[0];
        sample.packets_out += packets[0];
        sample.bytes_in += bytes[1];
        sample.packets_in += packets[1];
    }
    sample
}

/// Scriptable counter source for tests: set the sample a mark reports.
#[derive(Default)]
pub struct ScriptedCounterSource {
    samples: Mutex<HashMap<u32, CounterSample>>,
}

impl ScriptedCounterSource {
    /// Create an empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the cumulative sample a mark will report.
    pub fn set(&self, mark: u32, sample: CounterSample) {
        self.samples.lock().unwrap().insert(mark, sample);
    }
}

impl CounterSource for ScriptedCounterSource {
    fn read(&self, mark: u32) -> Option<CounterSample> {
        self.samples.lock().unwrap().get(&mark).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn meter() -> (TrafficMeter, Arc<ScriptedCounterSource>, SessionId, u32) {
        let source = Arc::new(ScriptedCounterSource::new());
        let meter = TrafficMeter::new(source.clone());
        let id = SessionId::new("s1");
        let mark = meter.register(&id);
        (meter, source, id, mark)
    }

    #[test]
    fn mark_is_deterministic_and_nonzero() {
        let a = mark_for_session(&SessionId::new("s1"));
        let b = mark_for_session(&SessionId::new("s1"));
        let c = mark_for_session(&SessionId::new("s2"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, 0);
    }

    #[test]
    fn monotonic_samples_accumulate() {
        let (meter, source, id, mark) = meter();
        source.set(
            mark,
            CounterSample {
                bytes_in: 1000,
                bytes_out: 500,
                packets_in: 10,
                packets_out: 5,
            },
        );
        let r = meter.sample(&id).unwrap();
        assert_eq!(r.bytes_in, 1000);
        source.set(
            mark,
            CounterSample {
                bytes_in: 1500,
                bytes_out: 700,
                packets_in: 15,
                packets_out: 7,
            },
        );
        let r = meter.sample(&id).unwrap();
        assert_eq!(r.bytes_in, 1500);
        assert_eq!(r.bytes_out, 700);
        assert_eq!(r.wraps_in, 0);
    }

    #[test]
    fn true_wrap_bumps_counter_and_accepts_sample() {
        let (meter, source, id, mark) = meter();
        source.set(
            mark,
            CounterSample {
                bytes_in: u64::MAX - 10,
                ..Default::default()
            },
        );
        meter.sample(&id).unwrap();
        // Counter wrapped: enormous backwards step.
        source.set(
            mark,
            CounterSample {
                bytes_in: 42,
                ..Default::default()
            },
        );
        let r = meter.sample(&id).unwrap();
        assert_eq!(r.wraps_in, 1);
        assert_eq!(r.bytes_in, 42);
    }

    #[test]
    fn small_backwards_step_is_ignored() {
        let (meter, source, id, mark) = meter();
        source.set(
            mark,
            CounterSample {
                bytes_in: 10_000,
                ..Default::default()
            },
        );
        meter.sample(&id).unwrap();
        source.set(
            mark,
            CounterSample {
                bytes_in: 9_000,
                ..Default::default()
            },
        );
        let r = meter.sample(&id).unwrap();
        assert_eq!(r.wraps_in, 0);
        assert_eq!(r.bytes_in, 10_000, "anomalous sample must not regress the total");
    }

    #[test]
    fn conntrack_sums_only_matching_marks() {
        let table = "\
ipv4 2 tcp 6 431999 ESTABLISHED src=10.2.1.20 dst=10.2.3.4 sport=51000 dport=443 packets=120 bytes=8000 src=10.2.3.4 dst=10.2.1.20 sport=443 dport=51000 packets=200 bytes=150000 [ASSURED] mark=3735928559 use=1
ipv4 2 udp 17 29 src=10.2.1.20 dst=10.2.3.5 sport=5060 dport=5060 packets=10 bytes=1000 src=10.2.3.5 dst=10.2.1.20 sport=5060 dport=5060 packets=12 bytes=1200 mark=3735928559 use=1
ipv4 2 tcp 6 100 ESTABLISHED src=10.9.9.9 dst=10.2.3.4 sport=1 dport=2 packets=5 bytes=500 src=10.2.3.4 dst=10.9.9.9 sport=2 dport=1 packets=5 bytes=500 mark=99 use=1
";
        let sample = sum_conntrack(table, 0xDEAD_BEEF);
        assert_eq!(sample.bytes_out, 9_000);
        assert_eq!(sample.bytes_in, 151_200);
        assert_eq!(sample.packets_out, 130);
        assert_eq!(sample.packets_in, 212);
        let other = sum_conntrack(table, 99);
        assert_eq!(other.bytes_out, 500);
    }

    #[test]
    fn unregistered_session_yields_none() {
        let (meter, _source, id, _mark) = meter();
        meter.unregister(&id);
        assert!(meter.sample(&id).is_none());
    }
}

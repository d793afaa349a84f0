//! Call-detail-record manager.
//!
//! One CDR per active session, persisted as one JSON file under an
//! `active/` directory and moved to `archive/` once closed. The rollover
//! operation closes the current record and opens its successor atomically
//! so accounting stays continuous while the session keeps running.
//!
//! Actual traffic of a record is defined as
//! `(bytes − base_offset) + wraps × 2^64`; the base offsets carry the
//! cumulative counter value at the moment the record was opened.
//!
//! Lock order is manager table, then record. Filesystem writes happen
//! outside the table lock.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use magic_models::{ClientId, DlmId, SessionId};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Capacity of the in-memory record table.
pub const MAX_CDR_RECORDS: usize = 1024;

/// Default archive retention, seconds.
pub const DEFAULT_RETENTION_SECS: u64 = 24 * 3600;

/// Lifecycle state of a record.
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
pub enum CdrStatus {
    /// Recording traffic.
    Active,
    /// Closed normally.
    Finished,
    /// Moved to the archive directory.
    Archived,
    /// Closed by a rollover; its successor continues the session.
    Rollover,
}

/// Traffic counters of a record.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CdrTraffic {
    /// Cumulative inbound bytes at last update.
    pub bytes_in: u64,
    /// Cumulative outbound bytes.
    pub bytes_out: u64,
    /// Cumulative inbound packets.
    pub packets_in: u64,
    /// Cumulative outbound packets.
    pub packets_out: u64,
    /// Cumulative counter value when the record was opened, inbound.
    pub base_offset_in: u64,
    /// Cumulative counter value when the record was opened, outbound.
    pub base_offset_out: u64,
}

/// Wrap bookkeeping of a record.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CdrOverflow {
    /// Inbound wraps observed during this record's lifetime.
    pub count_in: u32,
    /// Outbound wraps.
    pub count_out: u32,
    /// Last raw inbound sample, for wrap detection.
    pub last_bytes_in: u64,
    /// Last raw outbound sample.
    pub last_bytes_out: u64,
}

/// One call-detail record. The on-disk JSON is this struct verbatim.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CdrRecord {
    /// Monotonic numeric id.
    pub cdr_id: u32,
    /// Stable unique id carried into answers.
    pub uuid: String,
    /// Session the record accounts for.
    pub session_id: SessionId,
    /// Owning client.
    pub client_id: ClientId,
    /// Link the session was on when the record opened.
    pub dlm_id: Option<DlmId>,
    /// Bearer on that link.
    pub bearer_id: u8,
    /// Lifecycle state.
    pub status: CdrStatus,
    /// Opening time.
    pub start_time: DateTime<Utc>,
    /// Closing time; `None` while active.
    pub stop_time: Option<DateTime<Utc>>,
    /// Archival time.
    pub archive_time: Option<DateTime<Utc>>,
    /// Traffic counters.
    pub traffic: CdrTraffic,
    /// Wrap bookkeeping.
    pub overflow: CdrOverflow,
}

impl CdrRecord {
    /// Actual traffic attributed to this record:
    /// `(bytes − base_offset) + wraps × 2^64`, per direction.
    pub fn actual_traffic(&self) -> (u128, u128) {
        let wrap = |wraps: u32| u128::from(wraps) << 64;
        let bytes_in = u128::from(self.traffic.bytes_in) + wrap(self.overflow.count_in)
            - u128::from(self.traffic.base_offset_in);
        let bytes_out = u128::from(self.traffic.bytes_out) + wrap(self.overflow.count_out)
            - u128::from(self.traffic.base_offset_out);
        (bytes_in, bytes_out)
    }

    /// Compact `key=value` content string for accounting-data answers.
    pub fn content_string(&self) -> String {
        let (actual_in, actual_out) = self.actual_traffic();
        format!(
            "cdr_id={};uuid={};session={};client={};dlm={};status={};start={};stop={};bytes_in={};bytes_out={};pkts_in={};pkts_out={}",
            self.cdr_id,
            self.uuid,
            self.session_id,
            self.client_id,
            self.dlm_id.as_ref().map_or("", |d| d.as_str()),
            self.status,
            self.start_time.timestamp(),
            self.stop_time.map_or(0, |t| t.timestamp()),
            actual_in,
            actual_out,
            self.traffic.packets_in,
            self.traffic.packets_out,
        )
    }

    fn file_name(&self) -> String {
        format!("cdr_{}_{}.json", self.cdr_id, self.uuid)
    }
}

/// Outcome of a successful rollover.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RolloverOutcome {
    /// Record closed by the rollover.
    pub old_cdr_id: u32,
    /// Its uuid.
    pub old_uuid: String,
    /// Record opened by the rollover.
    pub new_cdr_id: u32,
    /// Its uuid.
    pub new_uuid: String,
    /// Final actual inbound traffic of the closed record.
    pub final_bytes_in: u128,
    /// Final actual outbound traffic.
    pub final_bytes_out: u128,
}

/// Errors surfaced by the manager.
#[derive(Debug, thiserror::Error)]
pub enum CdrError {
    /// The record table is full.
    #[error("CDR table full ({0} records)")]
    TableFull(usize),
    /// No active record exists for the session.
    #[error("no active CDR for session {0}")]
    NoActiveRecord(SessionId),
    /// The referenced record does not exist.
    #[error("unknown CDR id {0}")]
    UnknownRecord(u32),
    /// Filesystem trouble.
    #[error("CDR storage error: {0}")]
    Storage(#[from] std::io::Error),
    /// A persisted file failed to parse.
    #[error("corrupt CDR file {path}: {reason}")]
    Corrupt {
        /// Offending file.
        path: PathBuf,
        /// Parse failure.
        reason: String,
    },
}

struct CdrTable {
    records: HashMap<u32, Arc<Mutex<CdrRecord>>>,
    active_by_session: HashMap<SessionId, u32>,
    next_cdr_id: u32,
}

/// The manager: slot table plus the storage directories.
pub struct CdrManager {
    table: Mutex<CdrTable>,
    active_dir: PathBuf,
    archive_dir: PathBuf,
    retention_secs: u64,
}

impl CdrManager {
    /// Create the manager, its directories, and reload records left in
    /// `active/` by a previous run. Only records still in `Active` status
    /// are brought back into memory; anything else found there is archived.
    ///
    /// # Errors
    ///
    /// Fails when the directories cannot be created.
    pub fn new(base_dir: &Path, retention_secs: u64) -> Result<Self, CdrError> {
        let active_dir = base_dir.join("active");
        let archive_dir = base_dir.join("archive");
        fs::create_dir_all(&active_dir)?;
        fs::create_dir_all(&archive_dir)?;

        let mgr = CdrManager {
            table: Mutex::new(CdrTable {
                records: HashMap::new(),
                active_by_session: HashMap::new(),
                next_cdr_id: 1,
            }),
            active_dir,
            archive_dir,
            retention_secs,
        };
        let recovered = mgr.reload_active()?;
        if recovered > 0 {
            info!(recovered, "active CDRs reloaded from disk");
        }
        Ok(mgr)
    }

    fn reload_active(&self) -> Result<usize, CdrError> {
        let mut recovered = 0;
        let mut max_id = 0;
        for entry in fs::read_dir(&self.active_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let record: CdrRecord = match fs::read_to_string(&path)
                .map_err(CdrError::from)
                .and_then(|text| {
                    serde_json::from_str(&text).map_err(|e| CdrError::Corrupt {
                        path: path.clone(),
                        reason: e.to_string(),
                    })
                }) {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, "skipping unreadable CDR file");
                    continue;
                }
            };

            max_id = max_id.max(record.cdr_id);
            if record.status == CdrStatus::Active {
                let mut table = self.table.lock().unwrap();
                table
                    .active_by_session
                    .insert(record.session_id.clone(), record.cdr_id);
                table
                    .records
                    .insert(record.cdr_id, Arc::new(Mutex::new(record)));
                recovered += 1;
            } else {
                // Finished/Rollover records do not belong in active/.
                let target = self.archive_dir.join(
                    path.file_name().map(PathBuf::from).unwrap_or_default(),
                );
                if let Err(e) = fs::rename(&path, &target) {
                    warn!(error = %e, "failed to move stale CDR to archive");
                }
            }
        }
        let mut table = self.table.lock().unwrap();
        table.next_cdr_id = max_id + 1;
        Ok(recovered)
    }

    /// Open a record for a session at activation.
    ///
    /// # Errors
    ///
    /// Fails when the table is full; persisting the fresh record is
    /// best-effort and logged.
    pub fn create(
        &self,
        session_id: &SessionId,
        client_id: &ClientId,
        dlm_id: Option<DlmId>,
        bearer_id: u8,
    ) -> Result<u32, CdrError> {
        let record = {
            let mut table = self.table.lock().unwrap();
            if table.records.len() >= MAX_CDR_RECORDS {
                return Err(CdrError::TableFull(MAX_CDR_RECORDS));
            }
            let cdr_id = table.next_cdr_id;
            table.next_cdr_id += 1;
            let record = CdrRecord {
                cdr_id,
                uuid: Uuid::new_v4().to_string(),
                session_id: session_id.clone(),
                client_id: client_id.clone(),
                dlm_id,
                bearer_id,
                status: CdrStatus::Active,
                start_time: Utc::now(),
                stop_time: None,
                archive_time: None,
                traffic: CdrTraffic::default(),
                overflow: CdrOverflow::default(),
            };
            table
                .active_by_session
                .insert(session_id.clone(), cdr_id);
            table
                .records
                .insert(cdr_id, Arc::new(Mutex::new(record.clone())));
            record
        };
        info!(cdr = record.cdr_id, session = %session_id, "CDR opened");
        self.persist_active(&record);
        Ok(record.cdr_id)
    }

    /// Update traffic counters from a cumulative sample, detecting wraps.
    ///
    /// # Errors
    ///
    /// Fails when no active record exists for the session.
    pub fn update_traffic(
        &self,
        session_id: &SessionId,
        bytes_in: u64,
        bytes_out: u64,
        packets_in: u64,
        packets_out: u64,
    ) -> Result<(), CdrError> {
        let record = self.active_record(session_id)?;
        let mut rec = record.lock().unwrap();
        apply_sample(&mut rec, bytes_in, bytes_out, packets_in, packets_out);
        Ok(())
    }

    /// Close the session's active record with final counters and persist it
    /// as `Finished`.
    ///
    /// # Errors
    ///
    /// Fails when no active record exists for the session.
    pub fn close(
        &self,
        session_id: &SessionId,
        final_bytes_in: u64,
        final_bytes_out: u64,
    ) -> Result<u32, CdrError> {
        let record = self.active_record(session_id)?;
        let snapshot = {
            let mut rec = record.lock().unwrap();
            let (pkts_in, pkts_out) = (rec.traffic.packets_in, rec.traffic.packets_out);
            apply_sample(&mut rec, final_bytes_in, final_bytes_out, pkts_in, pkts_out);
            rec.status = CdrStatus::Finished;
            rec.stop_time = Some(Utc::now());
            rec.clone()
        };
        self.table
            .lock()
            .unwrap()
            .active_by_session
            .remove(session_id);
        info!(cdr = snapshot.cdr_id, session = %session_id, "CDR closed");
        self.persist_active(&snapshot);
        Ok(snapshot.cdr_id)
    }

    /// Bill rollover without disconnect: close the current record with the
    /// given cumulative counters and open a successor whose base offsets
    /// start at those counters.
    ///
    /// # Errors
    ///
    /// Fails cleanly when no active record exists for the session or the
    /// table is full.
    pub fn rollover(
        &self,
        session_id: &SessionId,
        current_in: u64,
        current_out: u64,
    ) -> Result<RolloverOutcome, CdrError> {
        // Manager lock first, record lock second, the fixed order.
        let mut table = self.table.lock().unwrap();
        let old_id = *table
            .active_by_session
            .get(session_id)
            .ok_or_else(|| CdrError::NoActiveRecord(session_id.clone()))?;
        if table.records.len() >= MAX_CDR_RECORDS {
            return Err(CdrError::TableFull(MAX_CDR_RECORDS));
        }
        let old_arc = table
            .records
            .get(&old_id)
            .cloned()
            .ok_or(CdrError::UnknownRecord(old_id))?;

        let now = Utc::now();
        let (old_snapshot, final_in, final_out, client_id, dlm_id, bearer_id) = {
            let mut old = old_arc.lock().unwrap();
            let (pkts_in, pkts_out) = (old.traffic.packets_in, old.traffic.packets_out);
            apply_sample(&mut old, current_in, current_out, pkts_in, pkts_out);
            old.status = CdrStatus::Rollover;
            old.stop_time = Some(now);
            let (fin_in, fin_out) = old.actual_traffic();
            (
                old.clone(),
                fin_in,
                fin_out,
                old.client_id.clone(),
                old.dlm_id.clone(),
                old.bearer_id,
            )
        };

        let new_id = table.next_cdr_id;
        table.next_cdr_id += 1;
        let new_record = CdrRecord {
            cdr_id: new_id,
            uuid: Uuid::new_v4().to_string(),
            session_id: session_id.clone(),
            client_id,
            dlm_id,
            bearer_id,
            status: CdrStatus::Active,
            start_time: now,
            stop_time: None,
            archive_time: None,
            traffic: CdrTraffic {
                bytes_in: current_in,
                bytes_out: current_out,
                packets_in: 0,
                packets_out: 0,
                base_offset_in: current_in,
                base_offset_out: current_out,
            },
            overflow: CdrOverflow {
                count_in: 0,
                count_out: 0,
                last_bytes_in: current_in,
                last_bytes_out: current_out,
            },
        };
        table.active_by_session.insert(session_id.clone(), new_id);
        table
            .records
            .insert(new_id, Arc::new(Mutex::new(new_record.clone())));
        drop(table);

        info!(
            session = %session_id,
            old_cdr = old_snapshot.cdr_id,
            new_cdr = new_id,
            "CDR rollover"
        );
        self.persist_active(&old_snapshot);
        self.persist_active(&new_record);

        Ok(RolloverOutcome {
            old_cdr_id: old_snapshot.cdr_id,
            old_uuid: old_snapshot.uuid,
            new_cdr_id: new_id,
            new_uuid: new_record.uuid,
            final_bytes_in: final_in,
            final_bytes_out: final_out,
        })
    }

    /// Move a closed record's file into the archive directory.
    /// Archiving an already-archived record is a no-op.
    ///
    /// # Errors
    ///
    /// Fails for unknown ids or filesystem trouble.
    pub fn archive(&self, cdr_id: u32) -> Result<(), CdrError> {
        let record = {
            let table = self.table.lock().unwrap();
            table
                .records
                .get(&cdr_id)
                .cloned()
                .ok_or(CdrError::UnknownRecord(cdr_id))?
        };
        let snapshot = {
            let mut rec = record.lock().unwrap();
            if rec.status == CdrStatus::Archived {
                return Ok(());
            }
            rec.status = CdrStatus::Archived;
            rec.archive_time = Some(Utc::now());
            rec.clone()
        };
        let from = self.active_dir.join(snapshot.file_name());
        let to = self.archive_dir.join(snapshot.file_name());
        self.write_record(&to, &snapshot);
        if from.exists() {
            if let Err(e) = fs::remove_file(&from) {
                warn!(error = %e, cdr = cdr_id, "failed to remove active CDR file");
            }
        }
        debug!(cdr = cdr_id, "CDR archived");
        Ok(())
    }

    /// Snapshot a record by id.
    pub fn find_by_id(&self, cdr_id: u32) -> Option<CdrRecord> {
        let record = {
            let table = self.table.lock().unwrap();
            table.records.get(&cdr_id).cloned()
        }?;
        let rec = record.lock().unwrap();
        Some(rec.clone())
    }

    /// Snapshot the active record of a session.
    pub fn find_active_by_session(&self, session_id: &SessionId) -> Option<CdrRecord> {
        let id = {
            let table = self.table.lock().unwrap();
            table.active_by_session.get(session_id).copied()
        }?;
        self.find_by_id(id)
    }

    /// Snapshot every in-memory record.
    pub fn all_records(&self) -> Vec<CdrRecord> {
        let arcs: Vec<_> = {
            let table = self.table.lock().unwrap();
            table.records.values().cloned().collect()
        };
        arcs.iter().map(|r| r.lock().unwrap().clone()).collect()
    }

    /// Periodic sweep: archive Finished/Rollover records, persist active
    /// ones for crash safety, drop archived records from memory and delete
    /// archive files older than the retention window.
    pub fn maintenance(&self) {
        let snapshots = self.all_records();
        for record in &snapshots {
            match record.status {
                CdrStatus::Finished | CdrStatus::Rollover => {
                    if let Err(e) = self.archive(record.cdr_id) {
                        warn!(error = %e, cdr = record.cdr_id, "archive failed");
                    }
                }
                CdrStatus::Active => self.persist_active(record),
                CdrStatus::Archived => {}
            }
        }

        // Archived records have left the filesystem's active set; their
        // memory slots can go.
        {
            let mut table = self.table.lock().unwrap();
            let archived: Vec<u32> = table
                .records
                .iter()
                .filter(|(_, rec)| rec.lock().unwrap().status == CdrStatus::Archived)
                .map(|(id, _)| *id)
                .collect();
            for id in archived {
                table.records.remove(&id);
            }
        }

        if let Err(e) = self.cleanup_expired_archives() {
            warn!(error = %e, "archive retention sweep failed");
        }
    }

    /// Persist every active record (shutdown path).
    pub fn save_all_active(&self) {
        for record in self.all_records() {
            if record.status == CdrStatus::Active {
                self.persist_active(&record);
            }
        }
    }

    fn cleanup_expired_archives(&self) -> Result<usize, CdrError> {
        let mut deleted = 0;
        let now = std::time::SystemTime::now();
        for entry in fs::read_dir(&self.archive_dir)? {
            let entry = entry?;
            let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
                continue;
            };
            let Ok(age) = now.duration_since(modified) else {
                continue;
            };
            if age.as_secs() > self.retention_secs {
                if let Err(e) = fs::remove_file(entry.path()) {
                    warn!(error = %e, "failed to delete expired archive file");
                } else {
                    deleted += 1;
                }
            }
        }
        if deleted > 0 {
            info!(deleted, "expired archive CDRs deleted");
        }
        Ok(deleted)
    }

    fn active_record(&self, session_id: &SessionId) -> Result<Arc<Mutex<CdrRecord>>, CdrError> {
        let table = self.table.lock().unwrap();
        let id = table
            .active_by_session
            .get(session_id)
            .ok_or_else(|| CdrError::NoActiveRecord(session_id.clone()))?;
        table
            .records
            .get(id)
            .cloned()
            .ok_or(CdrError::UnknownRecord(*id))
    }

    fn persist_active(&self, record: &CdrRecord) {
        let path = self.active_dir.join(record.file_name());
        self.write_record(&path, record);
    }

    fn write_record(&self, path: &Path, record: &CdrRecord) {
        match serde_json::to_string_pretty(record) {
            Ok(json) => {
                if let Err(e) = fs::write(path, json) {
                    error!(error = %e, path = %path.display(), "failed to write CDR file");
                }
            }
            Err(e) => error!(error = %e, "failed to serialise CDR"),
        }
    }
}

/// Counter update with per-record wrap detection: a backwards step larger
/// than half the 64-bit range is a wrap, anything smaller is ignored.
fn apply_sample(
    rec: &mut CdrRecord,
    bytes_in: u64,
    bytes_out: u64,
    packets_in: u64,
    packets_out: u64,
) {
    if bytes_in >= rec.overflow.last_bytes_in {
        rec.traffic.bytes_in = bytes_in;
        rec.overflow.last_bytes_in = bytes_in;
    } else if rec.overflow.last_bytes_in - bytes_in > u64::MAX / 2 {
        rec.overflow.count_in += 1;
        rec.traffic.bytes_in = bytes_in;
        rec.overflow.last_bytes_in = bytes_in;
    }
    if bytes_out >= rec.overflow.last_bytes_out {
        rec.traffic.bytes_out = bytes_out;
        rec.overflow.last_bytes_out = bytes_out;
    } else if rec.overflow.last_bytes_out - bytes_out > u64::MAX / 2 {
        rec.overflow.count_out += 1;
        rec.traffic.bytes_out = bytes_out;
        rec.overflow.last_bytes_out = bytes_out;
    }
    rec.traffic.packets_in = rec.traffic.packets_in.max(packets_in);
    rec.traffic.packets_out = rec.traffic.packets_out.max(packets_out);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager() -> (CdrManager, TempDir) {
        let dir = TempDir::new().unwrap();
        let mgr = CdrManager::new(dir.path(), DEFAULT_RETENTION_SECS).unwrap();
        (mgr, dir)
    }

    fn sid() -> SessionId {
        SessionId::new("s1")
    }

    fn cid() -> ClientId {
        ClientId::new("client-a")
    }

    #[test]
    fn create_persists_active_file() {
        let (mgr, dir) = manager();
        let id = mgr
            .create(&sid(), &cid(), Some(DlmId::new("SAT")), 1)
            .unwrap();
        let record = mgr.find_by_id(id).unwrap();
        assert_eq!(record.status, CdrStatus::Active);
        let path = dir.path().join("active").join(record.file_name());
        assert!(path.exists());
    }

    #[test]
    fn update_and_close_track_traffic() {
        let (mgr, _dir) = manager();
        mgr.create(&sid(), &cid(), None, 0).unwrap();
        mgr.update_traffic(&sid(), 10_000, 5_000, 100, 50).unwrap();
        mgr.close(&sid(), 12_000, 6_000).unwrap();
        let record = mgr.all_records().pop().unwrap();
        assert_eq!(record.status, CdrStatus::Finished);
        let (actual_in, actual_out) = record.actual_traffic();
        assert_eq!(actual_in, 12_000);
        assert_eq!(actual_out, 6_000);
        assert!(record.stop_time.is_some());
        // The session no longer has an active record.
        assert!(mgr.find_active_by_session(&sid()).is_none());
    }

    #[test]
    fn rollover_carries_base_offsets() {
        let (mgr, _dir) = manager();
        mgr.create(&sid(), &cid(), Some(DlmId::new("SAT")), 3).unwrap();
        mgr.update_traffic(&sid(), 10_000, 5_000, 10, 5).unwrap();
        let outcome = mgr.rollover(&sid(), 10_000, 5_000).unwrap();
        assert_eq!(outcome.final_bytes_in, 10_000);
        assert_eq!(outcome.final_bytes_out, 5_000);
        assert_ne!(outcome.old_cdr_id, outcome.new_cdr_id);

        let old = mgr.find_by_id(outcome.old_cdr_id).unwrap();
        assert_eq!(old.status, CdrStatus::Rollover);
        let new = mgr.find_by_id(outcome.new_cdr_id).unwrap();
        assert_eq!(new.status, CdrStatus::Active);
        assert_eq!(new.traffic.base_offset_in, 10_000);
        assert_eq!(new.traffic.bytes_in, 10_000);
        assert!(old.stop_time.unwrap() <= new.start_time);

        // Subsequent traffic counts only the delta past the offset.
        mgr.update_traffic(&sid(), 10_500, 5_200, 15, 8).unwrap();
        let new = mgr.find_by_id(outcome.new_cdr_id).unwrap();
        let (actual_in, actual_out) = new.actual_traffic();
        assert_eq!(actual_in, 500);
        assert_eq!(actual_out, 200);
    }

    #[test]
    fn rollover_without_active_record_fails_cleanly() {
        let (mgr, _dir) = manager();
        let err = mgr.rollover(&sid(), 0, 0).unwrap_err();
        assert!(matches!(err, CdrError::NoActiveRecord(_)));
    }

    #[test]
    fn wrap_detection_adds_to_actual_traffic() {
        let (mgr, _dir) = manager();
        mgr.create(&sid(), &cid(), None, 0).unwrap();
        mgr.update_traffic(&sid(), u64::MAX - 100, 0, 0, 0).unwrap();
        // Wrap: counter restarts near zero.
        mgr.update_traffic(&sid(), 400, 0, 0, 0).unwrap();
        let record = mgr.find_active_by_session(&sid()).unwrap();
        assert_eq!(record.overflow.count_in, 1);
        let (actual_in, _) = record.actual_traffic();
        assert_eq!(actual_in, u128::from(400u64) + (1u128 << 64));
    }

    #[test]
    fn archive_is_idempotent_and_moves_file() {
        let (mgr, dir) = manager();
        let id = mgr.create(&sid(), &cid(), None, 0).unwrap();
        let name = mgr.find_by_id(id).unwrap().file_name();
        mgr.close(&sid(), 100, 100).unwrap();
        mgr.archive(id).unwrap();
        mgr.archive(id).unwrap();
        assert!(!dir.path().join("active").join(&name).exists());
        assert!(dir.path().join("archive").join(&name).exists());
    }

    #[test]
    fn restart_reloads_only_active_records() {
        let dir = TempDir::new().unwrap();
        {
            let mgr = CdrManager::new(dir.path(), DEFAULT_RETENTION_SECS).unwrap();
            mgr.create(&SessionId::new("stays"), &cid(), None, 0).unwrap();
            mgr.create(&SessionId::new("goes"), &cid(), None, 0).unwrap();
            mgr.close(&SessionId::new("goes"), 1, 1).unwrap();
            // "goes" is Finished but still in active/ until maintenance.
        }
        let mgr = CdrManager::new(dir.path(), DEFAULT_RETENTION_SECS).unwrap();
        let records = mgr.all_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].session_id, SessionId::new("stays"));
        // The finished record was shunted to archive during reload.
        let archived: Vec<_> = std::fs::read_dir(dir.path().join("archive"))
            .unwrap()
            .collect();
        assert_eq!(archived.len(), 1);
    }

    #[test]
    fn new_ids_continue_after_restart() {
        let dir = TempDir::new().unwrap();
        let first_id = {
            let mgr = CdrManager::new(dir.path(), DEFAULT_RETENTION_SECS).unwrap();
            mgr.create(&sid(), &cid(), None, 0).unwrap()
        };
        let mgr = CdrManager::new(dir.path(), DEFAULT_RETENTION_SECS).unwrap();
        let second_id = mgr.create(&SessionId::new("s2"), &cid(), None, 0).unwrap();
        assert!(second_id > first_id);
    }

    #[test]
    fn maintenance_archives_finished_records() {
        let (mgr, dir) = manager();
        let id = mgr.create(&sid(), &cid(), None, 0).unwrap();
        mgr.close(&sid(), 10, 10).unwrap();
        mgr.maintenance();
        assert!(mgr.find_by_id(id).is_none(), "archived records leave memory");
        let archived: Vec<_> = std::fs::read_dir(dir.path().join("archive"))
            .unwrap()
            .collect();
        assert_eq!(archived.len(), 1);
    }
}

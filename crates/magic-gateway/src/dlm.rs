//! DLM adapter: reserve/release primitives towards the per-link DLM
//! processes, plus the inbound link-status event path.
//!
//! Each DLM process owns a modem and listens on a local IPC endpoint. A
//! resource reservation is a request/confirm exchange bounded by a timeout;
//! the adapter retries exactly three times with 100 ms spacing on timeout or
//! denial, then escalates to the caller, which walks the policy engine's
//! next candidate (fallback is *not* performed here). Releases are
//! best-effort single attempts.
//!
//! Link-status indications (up/down/degraded) arrive on one gateway-side
//! datagram socket; a single reader task preserves per-DLM arrival order and
//! fans the events out to the orchestrator.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use magic_models::{BearerId, DlmConfig, DlmId, Kbps};
use serde::{Deserialize, Serialize};
use tokio::net::UnixDatagram;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::policy::LinkLoad;

/// Reserve attempts per link.
pub const RESERVE_ATTEMPTS: u32 = 3;
/// Spacing between reserve attempts.
pub const RESERVE_RETRY_DELAY: Duration = Duration::from_millis(100);
/// Default confirm timeout.
pub const DEFAULT_CONFIRM_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors surfaced by the adapter.
#[derive(Debug, thiserror::Error)]
pub enum DlmError {
    /// The link id names no registered DLM.
    #[error("unknown DLM {0}")]
    UnknownDlm(DlmId),
    /// The DLM denied the reservation.
    #[error("DLM {0} denied the resource request")]
    Denied(DlmId),
    /// No confirm arrived within the timeout.
    #[error("DLM {0} confirm timed out")]
    Timeout(DlmId),
    /// Transport failure.
    #[error("DLM transport error: {0}")]
    Transport(String),
    /// Every attempt failed.
    #[error("DLM {dlm} reservation failed after {attempts} attempts")]
    Exhausted {
        /// The link that kept failing.
        dlm: DlmId,
        /// Attempts made.
        attempts: u32,
    },
}

/// Operations of the request/confirm primitive.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DlmWireOp {
    /// Reserve a bearer.
    ResourceRequest,
    /// Release a bearer.
    ResourceRelease,
}

/// Request datagram sent to a DLM endpoint.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DlmWireRequest {
    /// Operation.
    pub op: DlmWireOp,
    /// Forward bandwidth wanted, kbps.
    pub forward_kbps: u32,
    /// Return bandwidth wanted, kbps.
    pub return_kbps: u32,
    /// QoS level wanted.
    pub qos_level: u8,
    /// Bearer to release, for [`DlmWireOp::ResourceRelease`].
    #[serde(default)]
    pub bearer_id: Option<u8>,
}

/// Confirm status on the wire.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DlmConfirmStatus {
    /// Reservation granted.
    Ok,
    /// Reservation denied.
    Denied,
}

/// Confirm datagram received from a DLM endpoint.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct DlmWireConfirm {
    /// Grant or denial.
    pub status: DlmConfirmStatus,
    /// Bearer handle on grant.
    #[serde(default)]
    pub bearer_id: u8,
}

/// Link-status indication pushed by a DLM.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DlmWireEvent {
    /// Reporting link.
    pub dlm_id: DlmId,
    /// New state.
    pub status: DlmWireEventStatus,
}

/// Wire states a DLM may report.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DlmWireEventStatus {
    /// Link usable.
    Up,
    /// Link lost.
    Down,
    /// Link degraded but usable.
    Degraded,
}

/// Internal event fanned out to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DlmEvent {
    /// Link became usable.
    LinkUp(DlmId),
    /// Link was lost.
    LinkDown(DlmId),
    /// Link degraded.
    LinkDegraded(DlmId),
}

/// Transport seam: one request/confirm exchange with a DLM endpoint.
#[async_trait]
pub trait DlmTransport: Send + Sync {
    /// Send the request to the endpoint and await its confirm. The
    /// implementation bounds the wait with the adapter's timeout.
    async fn exchange(
        &self,
        dlm_id: &DlmId,
        endpoint: &Path,
        request: &DlmWireRequest,
    ) -> Result<DlmWireConfirm, DlmError>;
}

/// Production transport: one short-lived unix stream connection per
/// exchange, newline-framed JSON in both directions. Per-DLM ordering
/// follows from the adapter issuing at most one exchange per DLM at a time.
pub struct UnixDlmTransport {
    timeout: Duration,
}

impl UnixDlmTransport {
    /// Create a transport with the given confirm timeout.
    pub fn new(timeout: Duration) -> Self {
        UnixDlmTransport { timeout }
    }
}

#[async_trait]
impl DlmTransport for UnixDlmTransport {
    async fn exchange(
        &self,
        dlm_id: &DlmId,
        endpoint: &Path,
        request: &DlmWireRequest,
    ) -> Result<DlmWireConfirm, DlmError> {
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
        use tokio::net::UnixStream;

        let exchange = async {
            let stream = UnixStream::connect(endpoint).await.map_err(|e| {
                DlmError::Transport(format!("connect {}: {e}", endpoint.display()))
            })?;
            let (read_half, mut write_half) = stream.into_split();
            let mut payload =
                serde_json::to_vec(request).map_err(|e| DlmError::Transport(e.to_string()))?;
            payload.push(b'\n');
            write_half
                .write_all(&payload)
                .await
                .map_err(|e| DlmError::Transport(format!("send: {e}")))?;

            let mut line = String::new();
            BufReader::new(read_half)
                .read_line(&mut line)
                .await
                .map_err(|e| DlmError::Transport(format!("recv: {e}")))?;
            serde_json::from_str(line.trim())
                .map_err(|e| DlmError::Transport(e.to_string()))
        };
        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| DlmError::Timeout(dlm_id.clone()))?
    }
}

/// Scriptable transport for tests: per-link queues of canned outcomes,
/// falling back to a granted confirm with an incrementing bearer.
#[derive(Default)]
pub struct ScriptedDlmTransport {
    scripts: Mutex<HashMap<DlmId, Vec<Result<DlmWireConfirm, &'static str>>>>,
    requests: Mutex<Vec<(DlmId, DlmWireRequest)>>,
    next_bearer: Mutex<u8>,
}

impl ScriptedDlmTransport {
    /// Create a transport that grants everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an outcome for the next exchange with `dlm`. `Err` kinds:
    /// `"timeout"` or `"denied"`.
    pub fn push_outcome(&self, dlm: &DlmId, outcome: Result<DlmWireConfirm, &'static str>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(dlm.clone())
            .or_default()
            .push(outcome);
    }

    /// Every request seen so far.
    pub fn requests(&self) -> Vec<(DlmId, DlmWireRequest)> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl DlmTransport for ScriptedDlmTransport {
    async fn exchange(
        &self,
        dlm_id: &DlmId,
        _endpoint: &Path,
        request: &DlmWireRequest,
    ) -> Result<DlmWireConfirm, DlmError> {
        self.requests
            .lock()
            .unwrap()
            .push((dlm_id.clone(), request.clone()));
        let scripted = {
            let mut scripts = self.scripts.lock().unwrap();
            scripts.get_mut(dlm_id).and_then(|queue| {
                if queue.is_empty() {
                    None
                } else {
                    Some(queue.remove(0))
                }
            })
        };
        match scripted {
            Some(Ok(confirm)) => Ok(confirm),
            Some(Err("timeout")) => Err(DlmError::Timeout(dlm_id.clone())),
            Some(Err(_)) => Err(DlmError::Denied(dlm_id.clone())),
            None => {
                if request.op == DlmWireOp::ResourceRelease {
                    return Ok(DlmWireConfirm {
                        status: DlmConfirmStatus::Ok,
                        bearer_id: request.bearer_id.unwrap_or(0),
                    });
                }
                let mut bearer = self.next_bearer.lock().unwrap();
                *bearer = bearer.wrapping_add(1).max(1);
                Ok(DlmWireConfirm {
                    status: DlmConfirmStatus::Ok,
                    bearer_id: *bearer,
                })
            }
        }
    }
}

struct AdapterInner {
    loads: HashMap<DlmId, LinkLoad>,
}

/// The adapter: endpoint registry, per-link allocation ledger and the event
/// fan-out channel.
pub struct DlmAdapter {
    endpoints: HashMap<DlmId, PathBuf>,
    transport: Arc<dyn DlmTransport>,
    inner: Mutex<AdapterInner>,
    events_tx: mpsc::UnboundedSender<DlmEvent>,
}

impl DlmAdapter {
    /// Register the configured DLMs. Links start optimistically up; the
    /// first status indication corrects the view.
    pub fn new(
        dlms: &[DlmConfig],
        transport: Arc<dyn DlmTransport>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<DlmEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let loads = dlms
            .iter()
            .map(|d| {
                (
                    d.id.clone(),
                    LinkLoad {
                        up: d.enabled,
                        ..Default::default()
                    },
                )
            })
            .collect();
        let adapter = Arc::new(DlmAdapter {
            endpoints: dlms
                .iter()
                .map(|d| (d.id.clone(), d.endpoint_path.clone()))
                .collect(),
            transport,
            inner: Mutex::new(AdapterInner { loads }),
            events_tx,
        });
        (adapter, events_rx)
    }

    /// Reserve a bearer on one link: up to [`RESERVE_ATTEMPTS`] exchanges
    /// spaced [`RESERVE_RETRY_DELAY`] apart. On success the allocation is
    /// recorded in the link ledger.
    ///
    /// # Errors
    ///
    /// [`DlmError::UnknownDlm`] for unregistered links,
    /// [`DlmError::Exhausted`] after the final failed attempt.
    pub async fn reserve(
        &self,
        dlm_id: &DlmId,
        forward: Kbps,
        ret: Kbps,
        qos_level: u8,
    ) -> Result<BearerId, DlmError> {
        let endpoint = self
            .endpoints
            .get(dlm_id)
            .cloned()
            .ok_or_else(|| DlmError::UnknownDlm(dlm_id.clone()))?;
        let request = DlmWireRequest {
            op: DlmWireOp::ResourceRequest,
            forward_kbps: forward.0,
            return_kbps: ret.0,
            qos_level,
            bearer_id: None,
        };

        for attempt in 1..=RESERVE_ATTEMPTS {
            match self.transport.exchange(dlm_id, &endpoint, &request).await {
                Ok(confirm) if confirm.status == DlmConfirmStatus::Ok => {
                    let bearer = BearerId(confirm.bearer_id);
                    let mut inner = self.inner.lock().unwrap();
                    let load = inner.loads.entry(dlm_id.clone()).or_default();
                    load.allocated_forward += forward;
                    load.allocated_return += ret;
                    load.bearers += 1;
                    info!(link = %dlm_id, %bearer, attempt, "resource reserved");
                    return Ok(bearer);
                }
                Ok(_) => {
                    debug!(link = %dlm_id, attempt, "resource denied");
                }
                Err(e) => {
                    debug!(link = %dlm_id, attempt, error = %e, "resource request failed");
                }
            }
            if attempt < RESERVE_ATTEMPTS {
                tokio::time::sleep(RESERVE_RETRY_DELAY).await;
            }
        }
        warn!(link = %dlm_id, attempts = RESERVE_ATTEMPTS, "reservation exhausted");
        Err(DlmError::Exhausted {
            dlm: dlm_id.clone(),
            attempts: RESERVE_ATTEMPTS,
        })
    }

    /// Release a bearer: single best-effort attempt; the ledger entry is
    /// returned regardless of the DLM's answer.
    pub async fn release(&self, dlm_id: &DlmId, bearer: BearerId, forward: Kbps, ret: Kbps) {
        {
            let mut inner = self.inner.lock().unwrap();
            if let Some(load) = inner.loads.get_mut(dlm_id) {
                load.allocated_forward -= forward;
                load.allocated_return -= ret;
                load.bearers = load.bearers.saturating_sub(1);
            }
        }
        let Some(endpoint) = self.endpoints.get(dlm_id).cloned() else {
            return;
        };
        let request = DlmWireRequest {
            op: DlmWireOp::ResourceRelease,
            forward_kbps: forward.0,
            return_kbps: ret.0,
            qos_level: 0,
            bearer_id: Some(bearer.0),
        };
        if let Err(e) = self.transport.exchange(dlm_id, &endpoint, &request).await {
            debug!(link = %dlm_id, %bearer, error = %e, "release failed (ignored)");
        } else {
            debug!(link = %dlm_id, %bearer, "resource released");
        }
    }

    /// Snapshot of the per-link ledger.
    pub fn load_snapshot(&self) -> HashMap<DlmId, LinkLoad> {
        self.inner.lock().unwrap().loads.clone()
    }

    /// Current load percentage (forward direction) of a link against its
    /// configured capacity.
    pub fn load_percent(&self, dlm: &DlmConfig) -> u32 {
        let inner = self.inner.lock().unwrap();
        let allocated = inner
            .loads
            .get(&dlm.id)
            .map_or(0, |l| l.allocated_forward.0);
        if dlm.max_forward_kbps.0 == 0 {
            0
        } else {
            allocated * 100 / dlm.max_forward_kbps.0
        }
    }

    /// Apply one wire event to the ledger and fan it out. Events are
    /// applied in arrival order.
    pub fn handle_wire_event(&self, event: &DlmWireEvent) {
        let internal = {
            let mut inner = self.inner.lock().unwrap();
            let load = inner.loads.entry(event.dlm_id.clone()).or_default();
            match event.status {
                DlmWireEventStatus::Up => {
                    load.up = true;
                    DlmEvent::LinkUp(event.dlm_id.clone())
                }
                DlmWireEventStatus::Down => {
                    load.up = false;
                    DlmEvent::LinkDown(event.dlm_id.clone())
                }
                DlmWireEventStatus::Degraded => DlmEvent::LinkDegraded(event.dlm_id.clone()),
            }
        };
        info!(link = %event.dlm_id, status = ?event.status, "link status indication");
        // Receiver loss only happens during shutdown.
        let _ = self.events_tx.send(internal);
    }

    /// True while the ledger believes the link is up.
    pub fn is_up(&self, dlm_id: &DlmId) -> bool {
        self.inner
            .lock()
            .unwrap()
            .loads
            .get(dlm_id)
            .is_some_and(|l| l.up)
    }

    /// Bind the gateway-side event socket and spawn the reader task.
    ///
    /// # Errors
    ///
    /// Fails when the socket path cannot be bound.
    pub fn spawn_event_listener(
        self: &Arc<Self>,
        socket_path: &Path,
    ) -> std::io::Result<tokio::task::JoinHandle<()>> {
        let _ = std::fs::remove_file(socket_path);
        let socket = UnixDatagram::bind(socket_path)?;
        info!(path = %socket_path.display(), "DLM event socket bound");
        let adapter = Arc::clone(self);
        Ok(tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            loop {
                match socket.recv(&mut buf).await {
                    Ok(n) => match serde_json::from_slice::<DlmWireEvent>(&buf[..n]) {
                        Ok(event) => adapter.handle_wire_event(&event),
                        Err(e) => warn!(error = %e, "malformed DLM event ignored"),
                    },
                    Err(e) => {
                        warn!(error = %e, "DLM event socket read failed");
                        break;
                    }
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dlm_config(id: &str) -> DlmConfig {
        DlmConfig {
            id: DlmId::new(id),
            description: String::new(),
            enabled: true,
            dlm_type: magic_models::DlmType::Satellite,
            max_forward_kbps: Kbps(10_000),
            max_return_kbps: Kbps(1_000),
            supported_qos: vec![0, 1],
            latency_ms: 600,
            jitter_ms: 0,
            packet_loss_rate: 0.0,
            security_level: 1,
            endpoint_path: format!("/tmp/{id}.sock").into(),
            egress_interface: "sat0".into(),
            gateway_ip: "10.40.0.1".parse().unwrap(),
            coverage: None,
            load_balance: Default::default(),
        }
    }

    #[tokio::test]
    async fn reserve_success_updates_ledger() {
        let transport = Arc::new(ScriptedDlmTransport::new());
        let (adapter, _rx) = DlmAdapter::new(&[dlm_config("SAT")], transport);
        let bearer = adapter
            .reserve(&DlmId::new("SAT"), Kbps(500), Kbps(50), 1)
            .await
            .unwrap();
        assert!(bearer.is_assigned());
        let loads = adapter.load_snapshot();
        let load = loads.get(&DlmId::new("SAT")).unwrap();
        assert_eq!(load.allocated_forward, Kbps(500));
        assert_eq!(load.bearers, 1);
    }

    #[tokio::test]
    async fn reserve_retries_then_succeeds() {
        let transport = Arc::new(ScriptedDlmTransport::new());
        let sat = DlmId::new("SAT");
        transport.push_outcome(&sat, Err("timeout"));
        transport.push_outcome(&sat, Err("denied"));
        let (adapter, _rx) = DlmAdapter::new(&[dlm_config("SAT")], transport.clone());
        let bearer = adapter.reserve(&sat, Kbps(100), Kbps(10), 0).await.unwrap();
        assert!(bearer.is_assigned());
        // Two failures plus the final success.
        assert_eq!(transport.requests().len(), 3);
    }

    #[tokio::test]
    async fn reserve_exhausts_after_three_attempts() {
        let transport = Arc::new(ScriptedDlmTransport::new());
        let sat = DlmId::new("SAT");
        for _ in 0..3 {
            transport.push_outcome(&sat, Err("denied"));
        }
        let (adapter, _rx) = DlmAdapter::new(&[dlm_config("SAT")], transport.clone());
        let err = adapter.reserve(&sat, Kbps(100), Kbps(10), 0).await.unwrap_err();
        assert!(matches!(err, DlmError::Exhausted { attempts: 3, .. }));
        assert_eq!(transport.requests().len(), 3);
        // Nothing charged on failure.
        let loads = adapter.load_snapshot();
        assert_eq!(loads.get(&sat).unwrap().allocated_forward, Kbps::ZERO);
    }

    #[tokio::test]
    async fn release_returns_ledger_even_if_transport_fails() {
        let transport = Arc::new(ScriptedDlmTransport::new());
        let sat = DlmId::new("SAT");
        let (adapter, _rx) = DlmAdapter::new(&[dlm_config("SAT")], transport.clone());
        let bearer = adapter.reserve(&sat, Kbps(500), Kbps(50), 0).await.unwrap();
        transport.push_outcome(&sat, Err("timeout"));
        adapter.release(&sat, bearer, Kbps(500), Kbps(50)).await;
        let loads = adapter.load_snapshot();
        assert_eq!(loads.get(&sat).unwrap().allocated_forward, Kbps::ZERO);
        assert_eq!(loads.get(&sat).unwrap().bearers, 0);
    }

    #[tokio::test]
    async fn unknown_dlm_is_rejected() {
        let transport = Arc::new(ScriptedDlmTransport::new());
        let (adapter, _rx) = DlmAdapter::new(&[], transport);
        let err = adapter
            .reserve(&DlmId::new("NOPE"), Kbps(1), Kbps(1), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, DlmError::UnknownDlm(_)));
    }

    #[tokio::test]
    async fn wire_events_update_ledger_and_fan_out() {
        let transport = Arc::new(ScriptedDlmTransport::new());
        let (adapter, mut rx) = DlmAdapter::new(&[dlm_config("SAT")], transport);
        let sat = DlmId::new("SAT");
        assert!(adapter.is_up(&sat));
        adapter.handle_wire_event(&DlmWireEvent {
            dlm_id: sat.clone(),
            status: DlmWireEventStatus::Down,
        });
        assert!(!adapter.is_up(&sat));
        assert_eq!(rx.recv().await.unwrap(), DlmEvent::LinkDown(sat.clone()));
        adapter.handle_wire_event(&DlmWireEvent {
            dlm_id: sat.clone(),
            status: DlmWireEventStatus::Up,
        });
        assert!(adapter.is_up(&sat));
        assert_eq!(rx.recv().await.unwrap(), DlmEvent::LinkUp(sat));
    }
}

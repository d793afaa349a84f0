//! Control server and orchestrator.
//!
//! One accept loop on the control socket, one worker per client connection
//! (requests handled strictly in arrival order, pushes interleaved through
//! the session outboxes), one pump for DLM events, one watcher for aircraft
//! state and one periodic maintenance task. Shutdown tears components down
//! in reverse boot order and always removes the dataplane state and the
//! local IPC endpoint.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use magic_models::{MagicEnvelope, MagicStatus, SessionId};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::adif::{AdifClient, AircraftMonitor};
use crate::cdr::CdrManager;
use crate::config::GatewayConfig;
use crate::core::{GatewayCore, StatusRateLimiter, TeardownReason};
use crate::dataplane::Dataplane;
use crate::dlm::{DlmAdapter, DlmEvent, DlmTransport};
use crate::handlers;
use crate::meter::{CounterSource, TrafficMeter};
use crate::policy::PolicyEngine;
use crate::push::{NotifyParams, PushEngine};
use crate::queue::PendingQueue;
use crate::revalidate;
use crate::session::{SessionState, SessionStore};

/// The bootstrapped daemon.
pub struct Gateway {
    core: Arc<GatewayCore>,
    dlm_events: mpsc::UnboundedReceiver<DlmEvent>,
}

impl Gateway {
    /// Bring the components up in dependency order. The injected backends
    /// (dataplane, DLM transport, counter source) let tests and non-Linux
    /// hosts run the full engine against in-memory doubles.
    ///
    /// # Errors
    ///
    /// Fails on configuration errors or an unusable CDR directory — the
    /// only fatal conditions besides the control socket bind.
    pub fn boot(
        config: GatewayConfig,
        dataplane: Arc<dyn Dataplane>,
        dlm_transport: Arc<dyn DlmTransport>,
        counters: Arc<dyn CounterSource>,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let aircraft = AircraftMonitor::new();

        for dlm in config.dlms.iter().filter(|d| d.enabled) {
            if let Err(e) = dataplane.register_link(dlm) {
                warn!(link = %dlm.id, error = %e, "dataplane link registration failed");
            }
        }

        let meter = Arc::new(TrafficMeter::new(counters));
        let cdr = CdrManager::new(
            &config.settings.cdr_base_dir,
            config.settings.cdr_retention_secs,
        )
        .context("initialising CDR storage")?;

        let (dlm, dlm_events) = DlmAdapter::new(&config.dlms, dlm_transport);
        let sessions = Arc::new(SessionStore::new());
        let policy = PolicyEngine::new(config.dlms.clone(), config.policy.clone());
        let push = Arc::new(PushEngine::new(
            config.settings.identity.origin_host.clone(),
            config.settings.identity.origin_realm.clone(),
            sessions.clone(),
        ));

        let core = Arc::new(GatewayCore {
            config,
            sessions,
            policy,
            dlm,
            dataplane,
            meter,
            cdr: Arc::new(cdr),
            queue: Arc::new(PendingQueue::default()),
            aircraft,
            push,
            status_limiter: StatusRateLimiter::default(),
        });
        Ok(Gateway { core, dlm_events })
    }

    /// Direct access to the assembled core (tests drive handlers through
    /// it).
    pub fn core(&self) -> Arc<GatewayCore> {
        self.core.clone()
    }

    /// Run the daemon until SIGINT/SIGTERM.
    ///
    /// # Errors
    ///
    /// Only a failed control-socket bind is fatal.
    pub async fn run(self) -> Result<()> {
        let Gateway {
            core,
            mut dlm_events,
        } = self;
        let settings = &core.config.settings;

        let listener = TcpListener::bind(settings.listen_addr)
            .await
            .with_context(|| format!("binding control socket {}", settings.listen_addr))?;
        info!(addr = %settings.listen_addr, "control socket listening");

        let adif_handle = AdifClient::new(settings.adif.clone(), core.aircraft.clone()).spawn();

        let event_socket = settings.dlm_event_socket.clone();
        let dlm_listener = match core.dlm.spawn_event_listener(&event_socket) {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(error = %e, "DLM event socket unavailable, link events disabled");
                None
            }
        };

        // DLM event pump.
        let pump_core = core.clone();
        let pump = tokio::spawn(async move {
            while let Some(event) = dlm_events.recv().await {
                revalidate::on_dlm_event(&pump_core, &event).await;
            }
        });

        // Aircraft-state watcher.
        let watch_core = core.clone();
        let mut aircraft_rx = core.aircraft.subscribe();
        let watcher = tokio::spawn(async move {
            while aircraft_rx.changed().await.is_ok() {
                let state = aircraft_rx.borrow_and_update().clone();
                revalidate::on_aircraft_state(&watch_core, &state).await;
            }
        });

        // Periodic maintenance.
        let maint_core = core.clone();
        let maint_interval = Duration::from_secs(settings.maintenance_interval_secs.max(1));
        let maintenance = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(maint_interval);
            loop {
                ticker.tick().await;
                maintenance_pass(&maint_core).await;
            }
        });

        // Accept loop until a termination signal.
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .context("installing SIGTERM handler")?;
        tokio::select! {
            () = serve(core.clone(), listener) => {}
            _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
            _ = sigterm.recv() => info!("SIGTERM received"),
        }

        // Teardown in reverse order.
        info!("shutting down");
        maintenance.abort();
        watcher.abort();
        pump.abort();
        if let Some(handle) = dlm_listener {
            handle.abort();
        }
        adif_handle.abort();
        shutdown_sessions(&core).await;
        core.cdr.save_all_active();
        if let Err(e) = core.dataplane.teardown() {
            warn!(error = %e, "dataplane teardown failed");
        }
        let _ = std::fs::remove_file(&event_socket);
        info!("shutdown complete");
        Ok(())
    }
}

/// Accept loop over an already-bound control listener; spawns one worker
/// per connection and runs until the task is dropped.
pub async fn serve(core: Arc<GatewayCore>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let conn_core = core.clone();
                tokio::spawn(async move {
                    handle_connection(conn_core, stream, peer).await;
                });
            }
            Err(e) => warn!(error = %e, "accept failed"),
        }
    }
}

/// Farewell every live session and release its resources.
async fn shutdown_sessions(core: &Arc<GatewayCore>) {
    for session in core.sessions.all_sessions() {
        if matches!(session.state, SessionState::Closed) {
            continue;
        }
        core.teardown_session(&session.id, TeardownReason::Shutdown)
            .await;
    }
}

/// One maintenance sweep: idle/auth expiry, traffic refresh, CDR upkeep,
/// queue expiry and replay, notification ack timeouts, aircraft staleness.
pub async fn maintenance_pass(core: &Arc<GatewayCore>) {
    let now = chrono::Utc::now();

    for session in core.sessions.expired_sessions(now) {
        core.teardown_session(&session.id, TeardownReason::Timeout)
            .await;
    }

    for session in core.sessions.sessions_in_state(SessionState::Active) {
        core.refresh_traffic(&session.id);
    }

    core.cdr.maintenance();
    core.queue.expire(now);
    replay_queue(core).await;
    core.push.sweep_ack_timeouts();
    core.aircraft.check_staleness(Duration::from_secs(
        core.config.settings.adif.stale_secs,
    ));
}

/// Replay parked communication-change requests in priority order until one
/// fails to allocate.
async fn replay_queue(core: &Arc<GatewayCore>) {
    while let Some(entry) = core.queue.take_next() {
        let Some(session) = core.sessions.find_by_id(&entry.session_id) else {
            continue; // session gone, drop the entry
        };
        let Some(profile) = core
            .config
            .find_client_by_profile(&session.profile_name)
            .or_else(|| core.config.find_client_by_id(&session.client_id))
            .cloned()
        else {
            continue;
        };
        let Ok(norm) = core.normalize_request(&profile, &entry.request) else {
            continue;
        };
        match core.allocate_and_activate(&entry.session_id, &profile, &norm).await {
            Ok(grant) => {
                info!(session = %entry.session_id, link = %grant.dlm_id, "queued request satisfied");
                let params = NotifyParams {
                    status: MagicStatus::Success,
                    error_message: None,
                    report: magic_models::CommunicationReport {
                        granted_forward_bps: Some(grant.granted_forward_bps),
                        granted_return_bps: Some(grant.granted_return_bps),
                        dlm_id: Some(grant.dlm_id.clone()),
                        bearer_id: Some(grant.bearer_id),
                        gateway_ip: grant.gateway_ip,
                    },
                    force: true,
                };
                core.push.notify(&entry.session_id, &params);
            }
            Err(failure) => {
                debug!(session = %entry.session_id, status = %failure.status, "queued request still starved");
                core.queue.restore(entry);
                break;
            }
        }
    }
}

/// One connection worker: requests in arrival order, pushes interleaved.
async fn handle_connection(core: Arc<GatewayCore>, stream: TcpStream, peer: SocketAddr) {
    info!(%peer, "client connected");
    let peer_ip = match peer.ip() {
        IpAddr::V4(ip) => ip,
        IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
    };

    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    let (push_tx, mut push_rx) = mpsc::unbounded_channel::<MagicEnvelope>();
    let mut bound_sessions: HashSet<SessionId> = HashSet::new();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(text)) => {
                        if text.trim().is_empty() {
                            continue;
                        }
                        let envelope = match serde_json::from_str::<MagicEnvelope>(&text) {
                            Ok(env) => env,
                            Err(e) => {
                                warn!(%peer, error = %e, "malformed envelope ignored");
                                continue;
                            }
                        };
                        if bound_sessions.insert(envelope.session_id.clone()) {
                            core.push
                                .register_outbox(&envelope.session_id, push_tx.clone());
                        }
                        if let Some(answer) =
                            handlers::dispatch(&core, &envelope, peer_ip).await
                        {
                            if write_envelope(&mut write_half, &answer).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!(%peer, error = %e, "connection read failed");
                        break;
                    }
                }
            }
            Some(push) = push_rx.recv() => {
                if write_envelope(&mut write_half, &push).await.is_err() {
                    break;
                }
            }
        }
    }

    for session_id in &bound_sessions {
        core.push.unregister_outbox(session_id);
    }
    info!(%peer, "client disconnected");
}

async fn write_envelope(
    writer: &mut OwnedWriteHalf,
    envelope: &MagicEnvelope,
) -> std::io::Result<()> {
    let mut payload = serde_json::to_vec(envelope).map_err(std::io::Error::other)?;
    payload.push(b'\n');
    let result = writer.write_all(&payload).await;
    if let Err(ref e) = result {
        error!(error = %e, "write failed");
    }
    result
}

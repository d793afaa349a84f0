//! Aircraft-state client.
//!
//! Subscribes to the external aircraft-data publisher over TCP (a command
//! port plus an asynchronous sample stream), publishes every received
//! [`AircraftState`] sample on a watch channel, and tracks a degraded-mode
//! flag: while the source is unreachable or stale, policy decisions are
//! restricted to low-QoS traffic.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use magic_models::AircraftState;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Connection parameters of the aircraft-data source.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AdifConfig {
    /// Publisher host.
    pub host: String,
    /// Command (synchronous) port.
    pub sync_port: u16,
    /// Sample-stream (asynchronous) port.
    pub async_port: u16,
    /// Reconnect delay after a lost connection, seconds.
    #[serde(default = "default_reconnect")]
    pub reconnect_secs: u64,
    /// Samples older than this mark the source stale, seconds.
    #[serde(default = "default_stale")]
    pub stale_secs: u64,
}

fn default_reconnect() -> u64 {
    5
}

fn default_stale() -> u64 {
    30
}

/// Shared view of the latest aircraft state.
pub struct AircraftMonitor {
    tx: watch::Sender<AircraftState>,
    last_sample: Mutex<Option<Instant>>,
    degraded: AtomicBool,
}

impl AircraftMonitor {
    /// Create the monitor in degraded mode with the placeholder state.
    pub fn new() -> Arc<Self> {
        let (tx, _rx) = watch::channel(AircraftState::unavailable());
        Arc::new(AircraftMonitor {
            tx,
            last_sample: Mutex::new(None),
            degraded: AtomicBool::new(true),
        })
    }

    /// Latest published sample.
    pub fn state(&self) -> AircraftState {
        self.tx.borrow().clone()
    }

    /// Watch channel for state-change consumers.
    pub fn subscribe(&self) -> watch::Receiver<AircraftState> {
        self.tx.subscribe()
    }

    /// Publish a fresh sample; clears degraded mode when the sample itself
    /// is valid.
    pub fn publish(&self, state: AircraftState) {
        *self.last_sample.lock().unwrap() = Some(Instant::now());
        self.degraded.store(!state.data_valid, Ordering::Relaxed);
        // send replaces the value even with no subscribers.
        let _ = self.tx.send(state);
    }

    /// True while the source is unavailable, stale, or reporting invalid
    /// data.
    pub fn degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Force degraded mode (connection loss).
    pub fn mark_degraded(&self) {
        self.degraded.store(true, Ordering::Relaxed);
    }

    /// Staleness check driven by the maintenance sweep.
    pub fn check_staleness(&self, max_age: Duration) {
        let stale = match *self.last_sample.lock().unwrap() {
            Some(at) => at.elapsed() > max_age,
            None => true,
        };
        if stale && !self.degraded() {
            warn!("aircraft data stale, entering degraded mode");
            self.mark_degraded();
        }
    }
}

/// Subscription command sent on the command port after connecting.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
struct AdifSubscribe {
    subscribe: bool,
}

/// The reconnecting client task.
pub struct AdifClient {
    config: AdifConfig,
    monitor: Arc<AircraftMonitor>,
}

impl AdifClient {
    /// Bind the client to its monitor.
    pub fn new(config: AdifConfig, monitor: Arc<AircraftMonitor>) -> Self {
        AdifClient { config, monitor }
    }

    /// Spawn the reader loop: connect, subscribe, stream samples into the
    /// monitor, reconnect with a fixed delay on any failure.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match self.run_once().await {
                    Ok(()) => info!("aircraft-data stream ended"),
                    Err(e) => debug!(error = %e, "aircraft-data connection failed"),
                }
                self.monitor.mark_degraded();
                tokio::time::sleep(Duration::from_secs(self.config.reconnect_secs)).await;
            }
        })
    }

    async fn run_once(&self) -> std::io::Result<()> {
        let sync_addr = format!("{}:{}", self.config.host, self.config.sync_port);
        let async_addr = format!("{}:{}", self.config.host, self.config.async_port);

        let mut command = TcpStream::connect(&sync_addr).await?;
        let subscribe = serde_json::to_vec(&AdifSubscribe { subscribe: true })?;
        command.write_all(&subscribe).await?;
        command.write_all(b"\n").await?;

        let stream = TcpStream::connect(&async_addr).await?;
        info!(%async_addr, "aircraft-data stream connected");
        let mut lines = BufReader::new(stream).lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<AircraftState>(&line) {
                Ok(state) => {
                    debug!(
                        phase = %state.flight_phase,
                        wow = state.weight_on_wheels,
                        alt = state.altitude_ft,
                        "aircraft state sample"
                    );
                    self.monitor.publish(state);
                }
                Err(e) => warn!(error = %e, "malformed aircraft state ignored"),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use magic_models::FlightPhase;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn sample(phase: FlightPhase, wow: bool) -> AircraftState {
        AircraftState {
            latitude: 48.1,
            longitude: 11.5,
            altitude_ft: if wow { 0.0 } else { 36_000.0 },
            ground_speed_kts: 0.0,
            weight_on_wheels: wow,
            flight_phase: phase,
            nearest_airport: Some("MUC".into()),
            data_valid: true,
            timestamp: chrono::Utc::now(),
        }
    }

    #[test]
    fn monitor_starts_degraded_and_recovers() {
        let monitor = AircraftMonitor::new();
        assert!(monitor.degraded());
        monitor.publish(sample(FlightPhase::Gate, true));
        assert!(!monitor.degraded());
        assert_eq!(monitor.state().flight_phase, FlightPhase::Gate);
    }

    #[test]
    fn invalid_sample_keeps_degraded() {
        let monitor = AircraftMonitor::new();
        let mut state = sample(FlightPhase::Cruise, false);
        state.data_valid = false;
        monitor.publish(state);
        assert!(monitor.degraded());
    }

    #[test]
    fn staleness_reenters_degraded() {
        let monitor = AircraftMonitor::new();
        monitor.publish(sample(FlightPhase::Cruise, false));
        assert!(!monitor.degraded());
        monitor.check_staleness(Duration::from_secs(0));
        assert!(monitor.degraded());
    }

    #[test]
    fn watch_subscribers_see_updates() {
        let monitor = AircraftMonitor::new();
        let rx = monitor.subscribe();
        monitor.publish(sample(FlightPhase::Climb, false));
        assert_eq!(rx.borrow().flight_phase, FlightPhase::Climb);
    }

    #[tokio::test]
    async fn client_subscribes_and_streams_samples() {
        let sync_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let async_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let sync_port = sync_listener.local_addr().unwrap().port();
        let async_port = async_listener.local_addr().unwrap().port();

        // Scripted publisher: accept the command connection, check the
        // subscribe line, then push one sample on the stream port.
        tokio::spawn(async move {
            let (mut cmd, _) = sync_listener.accept().await.unwrap();
            let mut buf = vec![0u8; 256];
            let n = cmd.read(&mut buf).await.unwrap();
            assert!(String::from_utf8_lossy(&buf[..n]).contains("subscribe"));

            let (mut stream, _) = async_listener.accept().await.unwrap();
            let state = sample(FlightPhase::Cruise, false);
            let mut line = serde_json::to_vec(&state).unwrap();
            line.push(b'\n');
            stream.write_all(&line).await.unwrap();
            // Keep the stream open long enough for the client to read.
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let monitor = AircraftMonitor::new();
        let client = AdifClient::new(
            AdifConfig {
                host: "127.0.0.1".into(),
                sync_port,
                async_port,
                reconnect_secs: 60,
                stale_secs: 30,
            },
            monitor.clone(),
        );
        let mut rx = monitor.subscribe();
        let handle = client.spawn();

        tokio::time::timeout(Duration::from_secs(2), rx.changed())
            .await
            .expect("sample within deadline")
            .unwrap();
        assert_eq!(monitor.state().flight_phase, FlightPhase::Cruise);
        assert!(!monitor.degraded());
        handle.abort();
    }
}

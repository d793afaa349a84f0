//! End-to-end scenarios against the assembled engine with in-memory
//! doubles: recorded dataplane, scripted DLM transport, scripted counters.

use std::net::Ipv4Addr;
use std::sync::Arc;

use magic_gateway::config::{GatewayConfig, GatewaySettings};
use magic_gateway::core::GatewayCore;
use magic_gateway::dataplane::RecordingDataplane;
use magic_gateway::dlm::{DlmEvent, ScriptedDlmTransport};
use magic_gateway::handlers;
use magic_gateway::meter::{mark_for_session, CounterSample, ScriptedCounterSource};
use magic_gateway::revalidate;
use magic_gateway::server::Gateway;
use magic_gateway::session::SessionState;
use magic_models::{
    AccountingControlRequest, AircraftState, AuthenticationRequest, BandwidthQuota,
    CentralPolicy, ClientId, ClientProfile, CommunicationChangeRequest, CommunicationRequest,
    CredentialsPolicy, DlmConfig, DlmId, DlmType, FlightPhase, Kbps, LinkPolicy, MagicEnvelope,
    MagicMessage, MagicStatus, PathAction, PathPreference, PolicyRule, PolicyRuleSet, PortRange,
    PriorityType, QosPolicy, Realm, ResultCode, SelectedLink, SessionId, SessionPolicy,
    StatusRequest, SwitchingPolicy, TftDirection, TftSpec, TrafficClassDefinition, TrafficPolicy,
};
use tokio::sync::mpsc;

const CLIENT_IP: Ipv4Addr = Ipv4Addr::new(10, 2, 1, 20);

fn gate_link() -> DlmConfig {
    DlmConfig {
        id: DlmId::new("GATE"),
        description: "airport gate Wi-Fi".into(),
        enabled: true,
        dlm_type: DlmType::Hybrid,
        max_forward_kbps: Kbps(50_000),
        max_return_kbps: Kbps(5_000),
        supported_qos: vec![0, 1, 2],
        latency_ms: 5,
        jitter_ms: 2,
        packet_loss_rate: 0.001,
        security_level: 1,
        endpoint_path: "/tmp/mihf_gate.sock".into(),
        egress_interface: "wlan0".into(),
        gateway_ip: Ipv4Addr::new(10, 30, 0, 1),
        coverage: None,
        load_balance: Default::default(),
    }
}

fn sat_link() -> DlmConfig {
    DlmConfig {
        id: DlmId::new("SAT"),
        description: "Ku-band satcom".into(),
        enabled: true,
        dlm_type: DlmType::Satellite,
        max_forward_kbps: Kbps(20_000),
        max_return_kbps: Kbps(2_000),
        supported_qos: vec![0, 1, 2],
        latency_ms: 600,
        jitter_ms: 40,
        packet_loss_rate: 0.01,
        security_level: 2,
        endpoint_path: "/tmp/mihf_satcom.sock".into(),
        egress_interface: "sat0".into(),
        gateway_ip: Ipv4Addr::new(10, 40, 0, 1),
        coverage: None,
        load_balance: Default::default(),
    }
}

fn central_policy() -> CentralPolicy {
    CentralPolicy {
        traffic_classes: vec![TrafficClassDefinition {
            id: "CABIN_BULK".into(),
            match_priority_class: None,
            match_qos_level: None,
            match_profile_patterns: vec![],
            is_default: true,
        }],
        switching: SwitchingPolicy {
            min_dwell_secs: 30,
            hysteresis_percent: 20,
        },
        rulesets: vec![PolicyRuleSet {
            id: "all-phases".into(),
            flight_phases: vec![FlightPhase::Gate, FlightPhase::Taxi, FlightPhase::Cruise],
            rules: vec![PolicyRule {
                traffic_class: "CABIN_BULK".into(),
                preferences: vec![
                    PathPreference {
                        ranking: 1,
                        dlm_id: DlmId::new("GATE"),
                        action: PathAction::Permit,
                        max_latency_ms: None,
                        on_ground_only: true,
                        airborne_only: false,
                        required_security_level: 0,
                    },
                    PathPreference {
                        ranking: 3,
                        dlm_id: DlmId::new("SAT"),
                        action: PathAction::Permit,
                        max_latency_ms: None,
                        on_ground_only: false,
                        airborne_only: false,
                        required_security_level: 0,
                    },
                ],
            }],
        }],
    }
}

fn cabin_client() -> ClientProfile {
    ClientProfile {
        profile_name: "CABIN_IFE".into(),
        client_id: ClientId::new("ife.cabin.aircraft"),
        description: String::new(),
        enabled: true,
        credentials: CredentialsPolicy {
            username: "ife".into(),
            client_secret: "cabin-secret".into(),
            server_secret: "server-secret".into(),
            source_ip: Some(CLIENT_IP),
        },
        bandwidth: BandwidthQuota {
            max_forward_kbps: Kbps(1000),
            max_return_kbps: Kbps(500),
            guaranteed_forward_kbps: Kbps(100),
            guaranteed_return_kbps: Kbps(50),
            default_request_kbps: Kbps(200),
        },
        qos: QosPolicy {
            priority_type: PriorityType::Blocking,
            priority_class: 5,
            default_level: 0,
            allowed_levels: vec![0, 1],
        },
        link: LinkPolicy {
            allowed_dlms: vec![DlmId::new("GATE"), DlmId::new("SAT")],
            preferred_dlm: None,
            allow_multi_link: false,
            max_concurrent_links: 1,
        },
        session: SessionPolicy {
            max_concurrent_sessions: 2,
            session_timeout_secs: 3600,
            auth_lifetime_secs: 3600,
            auth_grace_secs: 300,
            allowed_phases: vec![FlightPhase::Gate, FlightPhase::Taxi, FlightPhase::Cruise],
            allow_detailed_status: false,
            allow_registered_clients: true,
            status_rate_limit_secs: 5,
            allow_cdr_control: false,
        },
        traffic: TrafficPolicy {
            encryption_required: false,
            allowed_protocols: vec!["TCP".into(), "UDP".into()],
            dest_ip_ranges: vec!["10.2.0.0/16".parse().unwrap()],
            dest_port_ranges: vec![PortRange::new(80, 8080).unwrap()],
            source_port_ranges: vec![],
            max_packet_size: None,
        },
        location: Default::default(),
    }
}

fn grounded() -> AircraftState {
    AircraftState {
        latitude: 48.35,
        longitude: 11.78,
        altitude_ft: 0.0,
        ground_speed_kts: 0.0,
        weight_on_wheels: true,
        flight_phase: FlightPhase::Gate,
        nearest_airport: Some("MUC".into()),
        data_valid: true,
        timestamp: chrono::Utc::now(),
    }
}

fn airborne() -> AircraftState {
    AircraftState {
        latitude: 49.0,
        longitude: 10.0,
        altitude_ft: 36_000.0,
        ground_speed_kts: 460.0,
        weight_on_wheels: false,
        flight_phase: FlightPhase::Cruise,
        nearest_airport: None,
        data_valid: true,
        timestamp: chrono::Utc::now(),
    }
}

struct Harness {
    core: Arc<GatewayCore>,
    dataplane: Arc<RecordingDataplane>,
    transport: Arc<ScriptedDlmTransport>,
    counters: Arc<ScriptedCounterSource>,
    _cdr_dir: tempfile::TempDir,
}

fn harness() -> Harness {
    let cdr_dir = tempfile::TempDir::new().unwrap();
    let mut settings = GatewaySettings::default();
    settings.cdr_base_dir = cdr_dir.path().to_path_buf();
    let config = GatewayConfig {
        settings,
        dlms: vec![gate_link(), sat_link()],
        policy: central_policy(),
        clients: vec![cabin_client()],
    };

    let dataplane = Arc::new(RecordingDataplane::new());
    let transport = Arc::new(ScriptedDlmTransport::new());
    let counters = Arc::new(ScriptedCounterSource::new());
    let gateway = Gateway::boot(
        config,
        dataplane.clone(),
        transport.clone(),
        counters.clone(),
    )
    .unwrap();
    let core = gateway.core();
    core.aircraft.publish(grounded());
    Harness {
        core,
        dataplane,
        transport,
        counters,
        _cdr_dir: cdr_dir,
    }
}

fn envelope(session: &str, payload: MagicMessage) -> MagicEnvelope {
    MagicEnvelope::new(
        SessionId::new(session),
        ClientId::new("ife.cabin.aircraft"),
        Realm::new("aircraft"),
        payload,
    )
}

fn car(session: &str, comm: Option<CommunicationRequest>) -> MagicEnvelope {
    envelope(
        session,
        MagicMessage::AuthenticationRequest(AuthenticationRequest {
            username: Some("ife".into()),
            client_password: Some("cabin-secret".into()),
            status_subscription: None,
            communication_request: comm,
        }),
    )
}

fn ccr(session: &str, comm: CommunicationRequest) -> MagicEnvelope {
    envelope(
        session,
        MagicMessage::CommunicationChangeRequest(CommunicationChangeRequest {
            communication_request: comm,
        }),
    )
}

async fn send(h: &Harness, env: MagicEnvelope) -> MagicEnvelope {
    handlers::dispatch(&h.core, &env, CLIENT_IP)
        .await
        .expect("request must be answered")
}

async fn activate_session(h: &Harness, session: &str) {
    let answer = send(
        h,
        car(
            session,
            Some(CommunicationRequest {
                requested_forward_bps: Some(500_000),
                requested_return_bps: Some(100_000),
                flight_phase: Some("Gate".into()),
                ..Default::default()
            }),
        ),
    )
    .await;
    let MagicMessage::AuthenticationAnswer(caa) = &answer.payload else {
        panic!("expected CAA, got {}", answer.payload.mnemonic());
    };
    assert!(caa.status.is_success(), "activation failed: {:?}", caa.status);
}

fn attach_outbox(h: &Harness, session: &str) -> mpsc::UnboundedReceiver<MagicEnvelope> {
    let (tx, rx) = mpsc::unbounded_channel();
    h.core.push.register_outbox(&SessionId::new(session), tx);
    rx
}

// ---------------------------------------------------------------------------
// Scenario 1: authenticate + zero-round-trip admission on the ground
// ---------------------------------------------------------------------------

#[tokio::test]
async fn zero_rtt_admission_selects_gate_link_on_ground() {
    let h = harness();
    let answer = send(
        &h,
        car(
            "S1",
            Some(CommunicationRequest {
                requested_forward_bps: Some(500_000),
                flight_phase: Some("Gate".into()),
                ..Default::default()
            }),
        ),
    )
    .await;

    let MagicMessage::AuthenticationAnswer(caa) = &answer.payload else {
        panic!("expected CAA");
    };
    assert_eq!(caa.status.result_code, ResultCode::Success);
    let grant = caa.grant.as_ref().expect("resource grant");
    assert_eq!(grant.dlm_id, DlmId::new("GATE"));
    assert_eq!(grant.granted_forward_bps, 500_000);
    assert!(grant.bearer_id.is_assigned());
    assert_eq!(grant.gateway_ip, Some(Ipv4Addr::new(10, 30, 0, 1)));

    let sid = SessionId::new("S1");
    assert!(h.dataplane.has_route(&sid));
    assert_eq!(h.dataplane.route_target(&sid), Some(DlmId::new("GATE")));
    assert!(h.dataplane.data_whitelisted(CLIENT_IP));

    let session = h.core.sessions.find_by_id(&sid).unwrap();
    assert_eq!(session.state, SessionState::Active);
    let cdr = h.core.cdr.find_active_by_session(&sid).expect("open CDR");
    assert_eq!(cdr.session_id, sid);
}

#[tokio::test]
async fn bad_credentials_create_no_session() {
    let h = harness();
    let mut request = car("S1", None);
    if let MagicMessage::AuthenticationRequest(ref mut req) = request.payload {
        req.client_password = Some("wrong".into());
    }
    let answer = send(&h, request).await;
    let MagicMessage::AuthenticationAnswer(caa) = &answer.payload else {
        panic!("expected CAA");
    };
    assert_eq!(caa.status.result_code, ResultCode::AuthorizationRejected);
    assert_eq!(
        caa.status.magic_status,
        Some(MagicStatus::AuthenticationFailed)
    );
    assert!(h.core.sessions.find_by_id(&SessionId::new("S1")).is_none());
}

// ---------------------------------------------------------------------------
// Scenario 2: weight-on-wheels change triggers a handover
// ---------------------------------------------------------------------------

#[tokio::test]
async fn takeoff_hands_session_over_to_satcom() {
    let h = harness();
    activate_session(&h, "S1").await;
    let sid = SessionId::new("S1");
    let cdr_before = h.core.cdr.find_active_by_session(&sid).unwrap().cdr_id;
    let mut rx = attach_outbox(&h, "S1");

    let state = airborne();
    h.core.aircraft.publish(state.clone());
    revalidate::on_aircraft_state(&h.core, &state).await;

    let session = h.core.sessions.find_by_id(&sid).unwrap();
    assert_eq!(session.state, SessionState::Active);
    assert_eq!(session.assigned_dlm, Some(DlmId::new("SAT")));
    assert_eq!(session.previous_dlm, Some(DlmId::new("GATE")));
    assert_eq!(h.dataplane.route_target(&sid), Some(DlmId::new("SAT")));

    // Forced MNTR carrying the rerouting code and the new gateway address.
    let push = rx.try_recv().expect("handover notification");
    let MagicMessage::NotificationReport(mntr) = &push.payload else {
        panic!("expected MNTR");
    };
    assert_eq!(mntr.magic_status, MagicStatus::ForcedRerouting);
    assert_eq!(mntr.report.gateway_ip, Some(Ipv4Addr::new(10, 40, 0, 1)));
    assert_eq!(mntr.report.dlm_id, Some(DlmId::new("SAT")));

    // Accounting continues on the same record.
    let cdr_after = h.core.cdr.find_active_by_session(&sid).unwrap();
    assert_eq!(cdr_after.cdr_id, cdr_before);

    // The GATE reservation was returned to its ledger.
    let loads = h.core.dlm.load_snapshot();
    assert_eq!(loads[&DlmId::new("GATE")].allocated_forward, Kbps::ZERO);
    assert_eq!(loads[&DlmId::new("SAT")].allocated_forward, Kbps(500));
}

// ---------------------------------------------------------------------------
// Scenario 3: billing rollover without disconnect
// ---------------------------------------------------------------------------

#[tokio::test]
async fn rollover_keeps_session_and_splits_accounting() {
    let h = harness();
    activate_session(&h, "S1").await;
    let sid = SessionId::new("S1");
    let mark = mark_for_session(&sid);
    h.counters.set(
        mark,
        CounterSample {
            bytes_in: 10_000,
            bytes_out: 5_000,
            packets_in: 100,
            packets_out: 50,
        },
    );
    h.core.refresh_traffic(&sid);

    let answer = send(
        &h,
        envelope(
            "S1",
            MagicMessage::AccountingControlRequest(AccountingControlRequest {
                restart_session_id: sid.clone(),
            }),
        ),
    )
    .await;
    let MagicMessage::AccountingControlAnswer(aca) = &answer.payload else {
        panic!("expected ACA");
    };
    assert_eq!(aca.status.result_code, ResultCode::Success);
    let old_id = aca.old_cdr_id.expect("old cdr id");
    let new_id = aca.new_cdr_id.expect("new cdr id");
    assert_ne!(old_id, new_id);

    let old = h.core.cdr.find_by_id(old_id).unwrap();
    assert_eq!(old.actual_traffic(), (10_000, 5_000));
    let new = h.core.cdr.find_by_id(new_id).unwrap();
    assert_eq!(new.traffic.base_offset_in, 10_000);
    assert_eq!(new.traffic.bytes_in, 10_000);

    // The session stayed active on its link.
    let session = h.core.sessions.find_by_id(&sid).unwrap();
    assert_eq!(session.state, SessionState::Active);
    assert_eq!(session.cdr_id, Some(new_id));

    // Subsequent traffic counts only the delta past the rollover point.
    h.counters.set(
        mark,
        CounterSample {
            bytes_in: 10_500,
            bytes_out: 5_200,
            packets_in: 110,
            packets_out: 55,
        },
    );
    h.core.refresh_traffic(&sid);
    let new = h.core.cdr.find_by_id(new_id).unwrap();
    assert_eq!(new.actual_traffic(), (500, 200));

    // The closed record lands in the archive directory on the next sweep.
    h.core.cdr.maintenance();
    let archived: Vec<_> = std::fs::read_dir(h._cdr_dir.path().join("archive"))
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    assert!(archived.iter().any(|name| name.starts_with(&format!("cdr_{old_id}_"))));
}

#[tokio::test]
async fn rollover_without_active_cdr_fails_cleanly() {
    let h = harness();
    // Authenticated only: no CDR yet.
    send(&h, car("S1", None)).await;
    let answer = send(
        &h,
        envelope(
            "S1",
            MagicMessage::AccountingControlRequest(AccountingControlRequest {
                restart_session_id: SessionId::new("S1"),
            }),
        ),
    )
    .await;
    let MagicMessage::AccountingControlAnswer(aca) = &answer.payload else {
        panic!("expected ACA");
    };
    assert_eq!(aca.status.result_code, ResultCode::UnableToComply);
    assert_eq!(
        aca.status.magic_status,
        Some(MagicStatus::AccountingNotProcessed)
    );
    assert!(aca.old_cdr_id.is_none());
}

// ---------------------------------------------------------------------------
// Scenario 4: queue capacity is exactly 64
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sixty_fifth_queued_session_is_rejected() {
    let h = harness();
    for i in 0..64 {
        let outcome = h.core.queue.enqueue(
            &SessionId::new(&format!("queued-{i}")),
            &ClientId::new("ife.cabin.aircraft"),
            CommunicationRequest {
                requested_forward_bps: Some(100_000),
                keep_request: Some(true),
                ..Default::default()
            },
            5,
            None,
        );
        assert_eq!(outcome, magic_gateway::queue::EnqueueOutcome::Added);
    }

    send(&h, car("S65", None)).await;

    // Exhaust link headroom so the allocation is a genuine bandwidth
    // shortage rather than a policy misconfiguration.
    h.core
        .dlm
        .reserve(&DlmId::new("GATE"), Kbps(49_950), Kbps(4_950), 0)
        .await
        .unwrap();
    h.core
        .dlm
        .reserve(&DlmId::new("SAT"), Kbps(19_950), Kbps(1_950), 0)
        .await
        .unwrap();

    let answer = send(
        &h,
        ccr(
            "S65",
            CommunicationRequest {
                requested_forward_bps: Some(500_000),
                required_forward_bps: Some(200_000),
                keep_request: Some(true),
                ..Default::default()
            },
        ),
    )
    .await;
    let MagicMessage::CommunicationChangeAnswer(cca) = &answer.payload else {
        panic!("expected CCA");
    };
    assert_eq!(cca.status.result_code, ResultCode::UnableToComply);
    assert_eq!(cca.status.magic_status, Some(MagicStatus::QueueFull));
    assert_eq!(cca.selected_link, SelectedLink::None);

    // Store unchanged for the rejected session.
    let session = h.core.sessions.find_by_id(&SessionId::new("S65")).unwrap();
    assert_eq!(session.state, SessionState::Authenticated);
    assert!(session.assigned_dlm.is_none());
    assert_eq!(h.core.queue.len(), 64);
}

// ---------------------------------------------------------------------------
// Scenario 5: status downgrade and rate limiting
// ---------------------------------------------------------------------------

#[tokio::test]
async fn detailed_status_is_downgraded_and_rate_limited() {
    let h = harness();
    send(&h, car("S1", None)).await;

    let answer = send(
        &h,
        envelope("S1", MagicMessage::StatusRequest(StatusRequest { status_type: 7 })),
    )
    .await;
    let MagicMessage::StatusAnswer(sxa) = &answer.payload else {
        panic!("expected SXA");
    };
    assert_eq!(sxa.status.result_code, ResultCode::Success);
    assert_eq!(sxa.status_type, 3, "level 7 downgrades to 3 without the permission");
    assert!(!sxa.registered_clients.is_empty());
    assert!(!sxa.dlm_list.is_empty());
    assert!(sxa.link_details.is_empty(), "no detailed figures at level 3");

    // Second request inside the 5 s window.
    let answer = send(
        &h,
        envelope("S1", MagicMessage::StatusRequest(StatusRequest { status_type: 3 })),
    )
    .await;
    let MagicMessage::StatusAnswer(sxa) = &answer.payload else {
        panic!("expected SXA");
    };
    assert_eq!(sxa.status.result_code, ResultCode::TooBusy);
}

// ---------------------------------------------------------------------------
// Scenario 6: TFT whitelist validation is atomic
// ---------------------------------------------------------------------------

#[tokio::test]
async fn one_bad_tft_rejects_the_whole_request() {
    let h = harness();
    send(&h, car("S1", None)).await;
    let sid = SessionId::new("S1");

    let good_a = TftSpec {
        direction: TftDirection::ToAircraft,
        protocol: 6,
        src: None,
        dst: Some("10.2.1.0/24".parse().unwrap()),
        src_ports: None,
        dst_ports: Some(PortRange::new(443, 443).unwrap()),
    };
    let bad = TftSpec {
        dst: Some("10.3.0.1/32".parse().unwrap()),
        ..good_a
    };
    let good_b = TftSpec {
        dst: Some("10.2.2.0/24".parse().unwrap()),
        ..good_a
    };

    let answer = send(
        &h,
        ccr(
            "S1",
            CommunicationRequest {
                requested_forward_bps: Some(500_000),
                tft_to_aircraft: vec![good_a, bad, good_b],
                ..Default::default()
            },
        ),
    )
    .await;
    let MagicMessage::CommunicationChangeAnswer(cca) = &answer.payload else {
        panic!("expected CCA");
    };
    assert_eq!(cca.status.result_code, ResultCode::NotAuthorized);
    assert_eq!(cca.status.magic_status, Some(MagicStatus::TftInvalid));

    // Nothing was applied: no marks, no route, state unchanged.
    assert_eq!(h.dataplane.tft_count(&sid), 0);
    assert!(!h.dataplane.has_route(&sid));
    let session = h.core.sessions.find_by_id(&sid).unwrap();
    assert_eq!(session.state, SessionState::Authenticated);
    assert!(session.tfts.is_empty());
}

// ---------------------------------------------------------------------------
// Link loss and recovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn link_down_suspends_and_link_up_resumes() {
    let h = harness();
    activate_session(&h, "S1").await;
    let sid = SessionId::new("S1");
    let mut rx = attach_outbox(&h, "S1");

    revalidate::on_dlm_event(&h.core, &DlmEvent::LinkDown(DlmId::new("GATE"))).await;
    let session = h.core.sessions.find_by_id(&sid).unwrap();
    assert_eq!(session.state, SessionState::Suspended);
    assert_eq!(session.granted_forward, Kbps::ZERO);
    assert_eq!(session.assigned_dlm, Some(DlmId::new("GATE")), "assignment retained");

    let push = rx.try_recv().expect("link-down notification");
    let MagicMessage::NotificationReport(mntr) = &push.payload else {
        panic!("expected MNTR");
    };
    assert_eq!(mntr.magic_status, MagicStatus::LinkError);

    // Quota returned while suspended.
    let ctx = h
        .core
        .sessions
        .client_context(&ClientId::new("ife.cabin.aircraft"))
        .unwrap();
    assert_eq!(ctx.total_allocated_forward, Kbps::ZERO);

    revalidate::on_dlm_event(&h.core, &DlmEvent::LinkUp(DlmId::new("GATE"))).await;
    let session = h.core.sessions.find_by_id(&sid).unwrap();
    assert_eq!(session.state, SessionState::Active);
    assert_eq!(session.granted_forward, Kbps(500));

    let push = rx.try_recv().expect("link-up notification");
    let MagicMessage::NotificationReport(mntr) = &push.payload else {
        panic!("expected MNTR");
    };
    assert_eq!(mntr.magic_status, MagicStatus::Success);
}

// ---------------------------------------------------------------------------
// Stop request and quota round-trip
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stop_request_releases_everything_but_keeps_the_login() {
    let h = harness();
    activate_session(&h, "S1").await;
    let sid = SessionId::new("S1");

    let answer = send(
        &h,
        ccr(
            "S1",
            CommunicationRequest {
                requested_forward_bps: Some(0),
                requested_return_bps: Some(0),
                ..Default::default()
            },
        ),
    )
    .await;
    let MagicMessage::CommunicationChangeAnswer(cca) = &answer.payload else {
        panic!("expected CCA");
    };
    assert!(cca.status.is_success());
    assert_eq!(cca.selected_link, SelectedLink::None);

    let session = h.core.sessions.find_by_id(&sid).unwrap();
    assert_eq!(session.state, SessionState::Authenticated);
    assert!(session.assigned_dlm.is_none());
    assert!(!h.dataplane.has_route(&sid));
    assert!(h.core.cdr.find_active_by_session(&sid).is_none());

    let ctx = h
        .core
        .sessions
        .client_context(&ClientId::new("ife.cabin.aircraft"))
        .unwrap();
    assert_eq!(ctx.total_allocated_forward, Kbps::ZERO);
    assert_eq!(ctx.total_allocated_return, Kbps::ZERO);

    // The DLM ledger agrees with the store.
    let loads = h.core.dlm.load_snapshot();
    assert_eq!(loads[&DlmId::new("GATE")].allocated_forward, Kbps::ZERO);
    assert_eq!(loads[&DlmId::new("GATE")].bearers, 0);

    // Requests kept flowing through the transport in order.
    assert!(!h.transport.requests().is_empty());
}

// ---------------------------------------------------------------------------
// Profile defaults, conditions and sweeps
// ---------------------------------------------------------------------------

#[tokio::test]
async fn absent_bandwidth_request_falls_back_to_profile_default() {
    let h = harness();
    send(&h, car("S1", None)).await;
    let answer = send(
        &h,
        ccr(
            "S1",
            CommunicationRequest {
                // Present but empty group: keep_request only, no bandwidth.
                keep_request: Some(false),
                requested_return_bps: Some(50_000),
                ..Default::default()
            },
        ),
    )
    .await;
    let MagicMessage::CommunicationChangeAnswer(cca) = &answer.payload else {
        panic!("expected CCA");
    };
    assert!(cca.status.is_success(), "{:?}", cca.status);
    let grant = cca.grant.as_ref().unwrap();
    // 200 kbps default-request from the profile.
    assert_eq!(grant.granted_forward_bps, 200_000);
}

#[tokio::test]
async fn disallowed_qos_level_is_rejected() {
    let h = harness();
    send(&h, car("S1", None)).await;
    let answer = send(
        &h,
        ccr(
            "S1",
            CommunicationRequest {
                requested_forward_bps: Some(100_000),
                qos_level: Some(2), // profile allows only 0 and 1
                ..Default::default()
            },
        ),
    )
    .await;
    let MagicMessage::CommunicationChangeAnswer(cca) = &answer.payload else {
        panic!("expected CCA");
    };
    assert_eq!(cca.status.result_code, ResultCode::InvalidValue);
    assert_eq!(cca.status.magic_status, Some(MagicStatus::InvalidParameter));
}

#[tokio::test]
async fn absent_flight_phase_is_taken_from_live_state_not_cruise() {
    let h = harness();
    send(&h, car("S1", None)).await;
    // Grounded at the gate; the request names no phase. The gate link is
    // only reachable when the live Gate phase is used.
    let answer = send(
        &h,
        ccr(
            "S1",
            CommunicationRequest {
                requested_forward_bps: Some(100_000),
                ..Default::default()
            },
        ),
    )
    .await;
    let MagicMessage::CommunicationChangeAnswer(cca) = &answer.payload else {
        panic!("expected CCA");
    };
    assert!(cca.status.is_success());
    assert_eq!(cca.grant.as_ref().unwrap().dlm_id, DlmId::new("GATE"));
}

#[tokio::test]
async fn subscription_grant_is_clamped_and_seeded() {
    let h = harness();
    let mut rx = attach_outbox(&h, "S1");
    let mut request = car("S1", None);
    if let MagicMessage::AuthenticationRequest(ref mut req) = request.payload {
        req.status_subscription = Some(7);
    }
    let answer = send(&h, request).await;
    let MagicMessage::AuthenticationAnswer(caa) = &answer.payload else {
        panic!("expected CAA");
    };
    assert!(caa.status.is_success());
    assert_eq!(caa.granted_subscription, Some(3), "7 downgrades to 3");

    // One seed status report straight after the grant.
    let seed = rx.try_recv().expect("subscription seed");
    let MagicMessage::StatusChangeReport(mscr) = &seed.payload else {
        panic!("expected MSCR seed");
    };
    assert!(!mscr.dlm_list.is_empty(), "level 3 includes the DLM list");
}

#[tokio::test]
async fn altitude_condition_blocks_admission_but_keeps_the_login() {
    let h = harness();
    let answer = send(
        &h,
        car(
            "S1",
            Some(CommunicationRequest {
                requested_forward_bps: Some(100_000),
                // Only active above 20 000 ft; the aircraft is at the gate.
                altitude: Some("20000-".into()),
                ..Default::default()
            }),
        ),
    )
    .await;
    let MagicMessage::AuthenticationAnswer(caa) = &answer.payload else {
        panic!("expected CAA");
    };
    assert_eq!(caa.status.result_code, ResultCode::UnableToComply);
    assert_eq!(
        caa.status.magic_status,
        Some(MagicStatus::ConditionAltitudeViolated)
    );
    assert!(caa.grant.is_none());
    let session = h.core.sessions.find_by_id(&SessionId::new("S1")).unwrap();
    assert_eq!(session.state, SessionState::Authenticated);
}

#[tokio::test]
async fn idle_sessions_are_swept_with_a_timeout_notification() {
    let h = harness();
    activate_session(&h, "S1").await;
    let sid = SessionId::new("S1");
    let mut rx = attach_outbox(&h, "S1");

    h.core
        .sessions
        .update(&sid, |s| {
            s.last_activity = chrono::Utc::now() - chrono::Duration::seconds(4000);
        })
        .unwrap();
    magic_gateway::server::maintenance_pass(&h.core).await;

    assert!(h.core.sessions.find_by_id(&sid).is_none());
    assert!(!h.dataplane.has_route(&sid));
    let push = rx.try_recv().expect("timeout notification");
    let MagicMessage::NotificationReport(mntr) = &push.payload else {
        panic!("expected MNTR");
    };
    assert_eq!(mntr.magic_status, MagicStatus::SessionTimeout);
}

#[tokio::test]
async fn queued_request_is_replayed_when_capacity_returns() {
    let h = harness();
    send(&h, car("S1", None)).await;
    let sid = SessionId::new("S1");
    let mut rx = attach_outbox(&h, "S1");

    // Exhaust both links, park the request.
    let gate_bearer = h
        .core
        .dlm
        .reserve(&DlmId::new("GATE"), Kbps(49_950), Kbps(4_950), 0)
        .await
        .unwrap();
    h.core
        .dlm
        .reserve(&DlmId::new("SAT"), Kbps(19_950), Kbps(1_950), 0)
        .await
        .unwrap();
    let answer = send(
        &h,
        ccr(
            "S1",
            CommunicationRequest {
                requested_forward_bps: Some(500_000),
                required_forward_bps: Some(200_000),
                keep_request: Some(true),
                ..Default::default()
            },
        ),
    )
    .await;
    let MagicMessage::CommunicationChangeAnswer(cca) = &answer.payload else {
        panic!("expected CCA");
    };
    assert!(cca.status.is_success());
    assert_eq!(cca.selected_link, SelectedLink::Queued);
    assert_eq!(h.core.queue.len(), 1);

    // Capacity returns; the maintenance sweep replays the entry.
    h.core
        .dlm
        .release(&DlmId::new("GATE"), gate_bearer, Kbps(49_950), Kbps(4_950))
        .await;
    magic_gateway::server::maintenance_pass(&h.core).await;

    assert!(h.core.queue.is_empty());
    let session = h.core.sessions.find_by_id(&sid).unwrap();
    assert_eq!(session.state, SessionState::Active);
    assert_eq!(session.assigned_dlm, Some(DlmId::new("GATE")));

    let push = rx.try_recv().expect("replay notification");
    let MagicMessage::NotificationReport(mntr) = &push.payload else {
        panic!("expected MNTR");
    };
    assert_eq!(mntr.magic_status, MagicStatus::Success);
    assert_eq!(mntr.report.granted_forward_bps, Some(500_000));
}

#[tokio::test]
async fn termination_is_idempotent_for_unknown_sessions() {
    let h = harness();
    let answer = send(
        &h,
        envelope(
            "never-seen",
            MagicMessage::SessionTerminationRequest(Default::default()),
        ),
    )
    .await;
    let MagicMessage::SessionTerminationAnswer(sta) = &answer.payload else {
        panic!("expected STA");
    };
    assert!(sta.status.is_success());
    assert_eq!(sta.final_bytes_in, 0);
}

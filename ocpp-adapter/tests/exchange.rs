//! Two nodes exchanging requests over in-process channels

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ed25519_dalek::SigningKey;
use ocpp_adapter::engine::{BoxError, RemoteError, TransportFailure};
use ocpp_adapter::ocpp::messages::{
    GetVariableData, GetVariableResult, GetVariablesRequest, GetVariablesResponse, HeartbeatRequest,
    HeartbeatResponse, ResetRequest, ResetResponse,
};
use ocpp_adapter::ocpp::{
    Component, CustomHooks, Extensions, GetVariableStatus, ResetStatus, ResetType, Variable,
};
use ocpp_adapter::{
    Adapter, AdapterConfig, ChannelConnection, Connection, ErrorCode, EventKind, KeyedSignaturePolicy,
    NetworkingMode, Outcome, ProcessorResult, ResultCode, SendOptions, VerificationMode,
};
use serde_json::{json, Value};
use tokio::sync::mpsc;

fn link(csms: &Adapter, station: &Adapter) {
    let ((to_station, csms_inbox), (to_csms, station_inbox)) =
        ChannelConnection::pair(csms.node_id(), station.node_id());
    csms.attach_channel(to_station, csms_inbox, false);
    station.attach_channel(to_csms, station_inbox, true);
}

fn respond(status: ResetStatus) -> ProcessorResult<ResetResponse> {
    Ok(Some(ResetResponse::new(status)))
}

async fn beat() -> ProcessorResult<HeartbeatResponse> {
    Ok(Some(HeartbeatResponse::now()))
}

/// Answers with "<component>-value"; the "Slow" component answers late
async fn echo_variable(request: GetVariablesRequest) -> ProcessorResult<GetVariablesResponse> {
    let data = &request.get_variable_data[0];
    if data.component.name == "Slow" {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    Ok(Some(GetVariablesResponse {
        get_variable_result: vec![GetVariableResult {
            attribute_status: GetVariableStatus::Accepted,
            component: data.component.clone(),
            variable: data.variable.clone(),
            attribute_type: None,
            attribute_value: Some(format!("{}-value", data.component.name)),
        }],
        ext: Extensions::default(),
    }))
}

fn reset() -> ResetRequest {
    ResetRequest::new(ResetType::OnIdle)
}

fn counting_station(node_id: &str, calls: Arc<AtomicUsize>) -> Adapter {
    let station = Adapter::new(AdapterConfig::new(node_id));
    station.on_request::<ResetRequest, _, _>(move |_, _| {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            respond(ResetStatus::Accepted)
        }
    });
    station
}

fn remote_error(outcome: &Outcome<ResetResponse>) -> &RemoteError {
    match outcome {
        Outcome::RequestError(error) => error,
        other => panic!("expected a request error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_reset_accepted_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let csms = Adapter::new(AdapterConfig::new("CSMS"));
    let station = counting_station("CS001", calls.clone());
    link(&csms, &station);

    let envelope = csms.send(&reset(), SendOptions::to("CS001")).await;

    assert_eq!(envelope.action, "Reset");
    assert_eq!(envelope.outcome, Outcome::Ok(ResetResponse::new(ResetStatus::Accepted)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let state = envelope.state.unwrap();
    assert!(state.send_outcome.is_sent());
    assert!(state.is_valid_json_response);
    assert!(csms.engine().correlation().is_empty());
}

#[tokio::test]
async fn test_station_uses_uplink_by_default() {
    let csms = Adapter::new(AdapterConfig::new("CSMS"));
    let (senders, mut seen) = mpsc::unbounded_channel();
    csms.on_request::<HeartbeatRequest, _, _>(move |ctx, _| {
        let _ = senders.send(ctx.sender.clone());
        beat()
    });
    let station = Adapter::new(AdapterConfig::new("CS001"));
    link(&csms, &station);

    let envelope = station.send(&HeartbeatRequest::default(), SendOptions::default()).await;
    assert!(envelope.outcome.is_ok());
    assert_eq!(seen.recv().await.as_deref(), Some("CS001"));
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_request_times_out() {
    let csms = Adapter::new(AdapterConfig::new("CSMS"));
    let (to_station, _station_inbox) = ChannelConnection::new("CS001");
    csms.engine().connections().register(to_station);

    let envelope = csms
        .send(
            &HeartbeatRequest::default(),
            SendOptions::to("CS001").with_timeout(Duration::from_secs(2)),
        )
        .await;

    assert_eq!(
        envelope.outcome,
        Outcome::TransportFailure(TransportFailure::Timeout(Duration::from_secs(2)))
    );
    assert!(envelope.outcome.is_timeout());
    assert!(csms.engine().correlation().is_empty());
}

#[tokio::test]
async fn test_concurrent_requests_are_correlated_by_id() {
    let csms = Adapter::new(AdapterConfig::new("CSMS"));
    let station = Adapter::new(AdapterConfig::new("CS001"));
    station.on_request::<GetVariablesRequest, _, _>(|_, request| echo_variable(request));
    link(&csms, &station);

    let query = |component: &str| {
        GetVariablesRequest::new(vec![GetVariableData {
            component: Component::named(component),
            variable: Variable::named("Enabled"),
            attribute_type: None,
        }])
    };
    let slow = query("Slow");
    let fast = query("Fast");

    let (slow, fast) = tokio::join!(
        csms.send(&slow, SendOptions::to("CS001")),
        csms.send(&fast, SendOptions::to("CS001")),
    );

    assert_ne!(slow.request_id, fast.request_id);
    let value = |outcome: Outcome<GetVariablesResponse>| {
        outcome.into_response().unwrap().get_variable_result[0]
            .attribute_value
            .clone()
    };
    assert_eq!(value(slow.outcome).as_deref(), Some("Slow-value"));
    assert_eq!(value(fast.outcome).as_deref(), Some("Fast-value"));
}

#[tokio::test]
async fn test_missing_processor_is_not_implemented() {
    let csms = Adapter::new(AdapterConfig::new("CSMS"));
    let station = Adapter::new(AdapterConfig::new("CS001"));
    link(&csms, &station);

    let envelope = csms.send(&reset(), SendOptions::to("CS001")).await;
    assert_eq!(remote_error(&envelope.outcome).code, ErrorCode::NotImplemented);
    assert!(envelope.state.unwrap().is_valid_json_request_error);
}

#[tokio::test]
async fn test_processor_failures_map_to_error_codes() {
    let csms = Adapter::new(AdapterConfig::new("CSMS"));
    let station = Adapter::new(AdapterConfig::new("CS001"));
    station.on_request::<ResetRequest, _, _>(|_, request| async move {
        match request.evse_id {
            Some(1) => Ok(None),
            Some(2) => Err(BoxError::from("relay stuck")),
            Some(3) => panic!("processor exploded"),
            _ => respond(ResetStatus::Accepted),
        }
    });
    link(&csms, &station);

    let send = |evse_id: i32| {
        let request = ResetRequest {
            evse_id: Some(evse_id),
            ..reset()
        };
        let csms = &csms;
        async move { csms.send(&request, SendOptions::to("CS001")).await }
    };

    let declined = send(1).await;
    assert_eq!(remote_error(&declined.outcome).code, ErrorCode::GenericError);

    let failed = send(2).await;
    let error = remote_error(&failed.outcome);
    assert_eq!(error.code, ErrorCode::InternalError);
    assert!(error.description.contains("relay stuck"));

    let panicked = send(3).await;
    assert_eq!(remote_error(&panicked.outcome).code, ErrorCode::InternalError);

    // The station keeps serving after a panic
    let fine = send(4).await;
    assert!(fine.outcome.is_ok());
}

#[tokio::test]
async fn test_unsigned_request_rejected_before_processor() {
    let calls = Arc::new(AtomicUsize::new(0));
    let csms = Adapter::new(AdapterConfig::new("CSMS"));
    let station = Adapter::builder("CS001")
        .signatures(KeyedSignaturePolicy::verifier(VerificationMode::Require))
        .build();
    let counter = calls.clone();
    station.on_request::<ResetRequest, _, _>(move |_, _| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            respond(ResetStatus::Accepted)
        }
    });
    link(&csms, &station);

    let envelope = csms.send(&reset(), SendOptions::to("CS001")).await;
    assert_eq!(remote_error(&envelope.outcome).code, ErrorCode::SecurityError);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_signed_request_accepted_by_trusting_station() {
    let key = SigningKey::from_bytes(&[9; 32]);
    let calls = Arc::new(AtomicUsize::new(0));

    let csms = Adapter::builder("CSMS")
        .signatures(
            KeyedSignaturePolicy::signing(key.clone(), VerificationMode::VerifyIfPresent)
                .sign(true, false),
        )
        .build();
    let station = Adapter::builder("CS001")
        .signatures(
            KeyedSignaturePolicy::verifier(VerificationMode::Require).trust(key.verifying_key()),
        )
        .build();
    let counter = calls.clone();
    station.on_request::<ResetRequest, _, _>(move |_, _| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            respond(ResetStatus::Scheduled)
        }
    });
    link(&csms, &station);

    let envelope = csms.send(&reset(), SendOptions::to("CS001")).await;
    assert_eq!(envelope.outcome, Outcome::Ok(ResetResponse::new(ResetStatus::Scheduled)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_tampered_request_rejected() {
    let key = SigningKey::from_bytes(&[9; 32]);
    let calls = Arc::new(AtomicUsize::new(0));

    // Signs the payload, then rewrites it after signing
    let csms = Adapter::builder("CSMS")
        .signatures(KeyedSignaturePolicy::signing(key.clone(), VerificationMode::Ignore))
        .build();
    let station = Adapter::builder("CS001")
        .signatures(
            KeyedSignaturePolicy::verifier(VerificationMode::VerifyIfPresent)
                .trust(key.verifying_key()),
        )
        .build();
    let counter = calls.clone();
    station.on_request::<ResetRequest, _, _>(move |_, _| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            respond(ResetStatus::Accepted)
        }
    });

    let ((to_station, csms_inbox), (to_csms, mut station_inbox)) =
        ChannelConnection::pair("CSMS", "CS001");
    csms.attach_channel(to_station, csms_inbox, false);

    let (relay_tx, relay_rx) = mpsc::channel(8);
    station.attach_channel(to_csms, relay_rx, true);

    tokio::spawn(async move {
        while let Some(text) = station_inbox.recv().await {
            let mut frame: Value = serde_json::from_str(&text).unwrap();
            frame[3]["type"] = json!("Immediate");
            if relay_tx.send(frame.to_string()).await.is_err() {
                break;
            }
        }
    });

    let envelope = csms.send(&reset(), SendOptions::to("CS001")).await;
    assert_eq!(remote_error(&envelope.outcome).code, ErrorCode::SecurityError);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_signing_failure_sends_nothing() {
    // Asked to sign requests without a key
    let csms = Adapter::builder("CSMS")
        .signatures(KeyedSignaturePolicy::verifier(VerificationMode::Ignore).sign(true, false))
        .build();
    let (to_station, mut station_inbox) = ChannelConnection::new("CS001");
    csms.engine().connections().register(to_station);

    let envelope = csms.send(&reset(), SendOptions::to("CS001")).await;
    match &envelope.outcome {
        Outcome::SignatureError(reason) => assert!(reason.contains("no signing key"), "{}", reason),
        other => panic!("expected a signature error, got {:?}", other),
    }
    assert!(envelope.state.is_none());
    assert!(station_inbox.try_recv().is_err());
    assert!(csms.engine().correlation().is_empty());
}

#[tokio::test]
async fn test_tampered_response_is_a_signature_error() {
    let key = SigningKey::from_bytes(&[7; 32]);

    let csms = Adapter::builder("CSMS")
        .signatures(
            KeyedSignaturePolicy::verifier(VerificationMode::VerifyIfPresent)
                .trust(key.verifying_key()),
        )
        .build();
    let station = Adapter::builder("CS001")
        .signatures(KeyedSignaturePolicy::signing(key, VerificationMode::Ignore).sign(false, true))
        .build();
    station.on_request::<ResetRequest, _, _>(|_, _| async { respond(ResetStatus::Accepted) });

    let ((to_station, mut csms_inbox), (to_csms, station_inbox)) =
        ChannelConnection::pair("CSMS", "CS001");
    station.attach_channel(to_csms, station_inbox, true);

    // Rewrites the signed response on its way back
    let (relay_tx, relay_rx) = mpsc::channel(8);
    csms.attach_channel(to_station, relay_rx, false);
    tokio::spawn(async move {
        while let Some(text) = csms_inbox.recv().await {
            let mut frame: Value = serde_json::from_str(&text).unwrap();
            assert!(frame[2]["signatures"].is_array());
            frame[2]["status"] = json!("Rejected");
            if relay_tx.send(frame.to_string()).await.is_err() {
                break;
            }
        }
    });

    let envelope = csms.send(&reset(), SendOptions::to("CS001")).await;
    match &envelope.outcome {
        Outcome::SignatureError(reason) => {
            assert!(reason.contains("verification failed"), "{}", reason)
        }
        other => panic!("expected a signature error, got {:?}", other),
    }
    assert_eq!(envelope.outcome.code(), ResultCode::SignatureError);
}

#[tokio::test]
async fn test_panicking_serializer_is_an_exception() {
    let hooks = CustomHooks::new().with_serializer::<ResetRequest, _>(|_: &ResetRequest, _: Value| -> Value {
        panic!("serializer exploded")
    });
    let csms = Adapter::builder("CSMS").hooks(hooks).build();
    let station = counting_station("CS001", Arc::new(AtomicUsize::new(0)));
    link(&csms, &station);

    let envelope = csms.send(&reset(), SendOptions::to("CS001")).await;
    match &envelope.outcome {
        Outcome::Exception(reason) => assert!(reason.contains("serializer exploded")),
        other => panic!("expected an exception, got {:?}", other),
    }
    assert!(envelope.state.is_none());
    assert!(csms.engine().correlation().is_empty());
}

#[tokio::test]
async fn test_unknown_destination_has_no_route() {
    let csms = Adapter::new(AdapterConfig::new("CSMS"));

    let envelope = csms.send(&reset(), SendOptions::to("CS404")).await;
    assert_eq!(
        envelope.outcome,
        Outcome::TransportFailure(TransportFailure::NoRoute("CS404".to_string()))
    );
    assert_eq!(envelope.outcome.code(), ResultCode::TransportFailure);
}

#[tokio::test]
async fn test_closed_connection_fails_pending_request() {
    let csms = Adapter::new(AdapterConfig::new("CSMS"));
    let ((to_station, csms_inbox), (to_csms, mut station_inbox)) =
        ChannelConnection::pair("CSMS", "CS001");
    csms.attach_channel(to_station, csms_inbox, false);

    let pending = {
        let engine = csms.engine().clone();
        tokio::spawn(async move { engine.send(&reset(), SendOptions::to("CS001")).await })
    };

    let frame = station_inbox.recv().await.unwrap();
    assert!(frame.contains("\"Reset\""));
    drop(to_csms);

    let envelope = pending.await.unwrap();
    assert_eq!(
        envelope.outcome,
        Outcome::TransportFailure(TransportFailure::ConnectionClosed)
    );
    assert!(csms.engine().connections().peers().is_empty());
}

#[tokio::test]
async fn test_overlay_frames_carry_routing() {
    let config = AdapterConfig::new("NN1").with_networking_mode(NetworkingMode::OverlayNetwork);
    let node = Adapter::new(config);
    let ((to_station, node_inbox), (to_node, mut station_inbox)) =
        ChannelConnection::pair("NN1", "CS001");
    node.attach_channel(to_station, node_inbox, false);

    let pending = {
        let engine = node.engine().clone();
        tokio::spawn(async move { engine.send(&reset(), SendOptions::to("CS001")).await })
    };

    let frame: Value = serde_json::from_str(&station_inbox.recv().await.unwrap()).unwrap();
    assert_eq!(frame[2], "Reset");
    assert_eq!(frame[4], json!({"destination": "CS001", "networkPath": ["NN1"]}));

    let reply = json!([
        3,
        frame[1],
        {"status": "Accepted"},
        {"destination": "NN1", "networkPath": ["CS001", "NN1"]}
    ]);
    to_node.send_text(reply.to_string()).await.unwrap();

    let envelope = pending.await.unwrap();
    assert!(envelope.outcome.is_ok());
    let state = envelope.state.unwrap();
    assert_eq!(
        state.network_path_received.unwrap().hops(),
        ["CS001".to_string(), "NN1".to_string()]
    );
}

#[tokio::test]
async fn test_malformed_response_answered_with_response_error() {
    let config = AdapterConfig::new("CSMS").with_response_errors(true);
    let csms = Adapter::new(config);
    let ((to_station, csms_inbox), (to_csms, mut station_inbox)) =
        ChannelConnection::pair("CSMS", "CS001");
    csms.attach_channel(to_station, csms_inbox, false);

    let pending = {
        let engine = csms.engine().clone();
        tokio::spawn(async move { engine.send(&reset(), SendOptions::to("CS001")).await })
    };

    let frame: Value = serde_json::from_str(&station_inbox.recv().await.unwrap()).unwrap();
    let reply = json!([3, frame[1], {"status": "Bogus"}]);
    to_csms.send_text(reply.to_string()).await.unwrap();

    let envelope = pending.await.unwrap();
    assert_eq!(envelope.outcome.code(), ResultCode::FormationViolation);

    let error: Value = serde_json::from_str(&station_inbox.recv().await.unwrap()).unwrap();
    assert_eq!(error[0], 5);
    assert_eq!(error[1], frame[1]);
    assert_eq!(error[2], "FormatViolation");
}

#[tokio::test]
async fn test_truncated_response_fails_pending_request() {
    let csms = Adapter::new(AdapterConfig::new("CSMS"));
    let ((to_station, csms_inbox), (to_csms, mut station_inbox)) =
        ChannelConnection::pair("CSMS", "CS001");
    csms.attach_channel(to_station, csms_inbox, false);

    let pending = {
        let engine = csms.engine().clone();
        tokio::spawn(async move { engine.send(&reset(), SendOptions::to("CS001")).await })
    };

    let frame: Value = serde_json::from_str(&station_inbox.recv().await.unwrap()).unwrap();
    to_csms.send_text(json!([3, frame[1]]).to_string()).await.unwrap();

    let envelope = pending.await.unwrap();
    assert_eq!(envelope.outcome.code(), ResultCode::FormationViolation);
    assert!(csms.engine().correlation().is_empty());
}

#[tokio::test]
async fn test_broadcast_reaches_every_station() {
    let csms = Adapter::new(AdapterConfig::new("CSMS"));
    let calls = Arc::new(AtomicUsize::new(0));
    let first = counting_station("CS001", calls.clone());
    let second = counting_station("CS002", calls.clone());
    link(&csms, &first);
    link(&csms, &second);

    let targets = vec!["CS001".to_string(), "CS002".to_string(), "CS003".to_string()];
    let results = csms.broadcast(&reset(), &targets).await;

    assert_eq!(results.len(), 3);
    assert!(results[0].1.outcome.is_ok());
    assert!(results[1].1.outcome.is_ok());
    // CS003 has no link; without an uplink the node cannot reach it
    assert_eq!(results[2].1.outcome.code(), ResultCode::TransportFailure);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_observers_see_exchange_events() {
    let csms = Adapter::new(AdapterConfig::new("CSMS"));
    let station = counting_station("CS001", Arc::new(AtomicUsize::new(0)));
    link(&csms, &station);

    let (tx, mut rx) = mpsc::unbounded_channel();
    csms.subscribe(move |event| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(event.kind);
            Ok::<(), BoxError>(())
        }
    });

    let envelope = csms.send(&reset(), SendOptions::to("CS001")).await;
    assert!(envelope.outcome.is_ok());

    let mut kinds = Vec::new();
    while kinds.len() < 2 {
        let kind = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        kinds.push(kind);
    }
    kinds.sort_by_key(|kind| *kind as u8);
    assert_eq!(kinds, vec![EventKind::RequestSent, EventKind::ResponseReceived]);
}

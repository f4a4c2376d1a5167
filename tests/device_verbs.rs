//! Device Verbs (spec §4.5) integration coverage: the describe/getVariable/
//! callFunction/raiseSignal surface against a simulated device, plus the
//! inbound publish/subscribe event bridge (spec §4.5, §6).

mod support;

use std::sync::Arc;

use coap_lite::{CoapOption, MessageClass, Packet, PacketType, RequestType};
use devsession::coap::{self, DecodedValue, MessageName, WrapParams};
use devsession::collaborators::EventPublisher;
use devsession::error::SessionError;
use devsession::NONE_HOLDER;

use support::{handshake_pair, device_respond_loop, RecordingPublisher};

fn describe_payload() -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "f": ["digitalWrite"],
        "v": {"temp": "int"},
        "digitalWrite": {"args": [["value", "int32"]]},
    }))
    .unwrap()
}

/// End-to-end scenario 3 (spec §8) plus callFunction/raiseSignal, all
/// against one simulated device that answers each request in turn.
#[tokio::test]
async fn describe_variable_function_and_signal_round_trip() {
    let publisher: Arc<dyn EventPublisher> = Arc::new(RecordingPublisher::default());
    let (session, cipher_in, device) =
        handshake_pair(b"device-verbs".to_vec(), Vec::new(), publisher).await;
    let _run = tokio::spawn({
        let session = session.clone();
        async move { session.run(cipher_in).await }
    });

    let device_task = tokio::spawn(device_respond_loop(device, |message| {
        match message.uri_path.as_str() {
            "d" => Some(
                coap::wrap(
                    MessageName::DescribeReturn,
                    message.message_id,
                    message.token_key(),
                    WrapParams::None,
                    describe_payload(),
                )
                .unwrap(),
            ),
            "v/temp" => Some(
                coap::wrap(
                    MessageName::VariableValue,
                    message.message_id,
                    message.token_key(),
                    WrapParams::None,
                    vec![0x00, 0x00, 0x00, 0x2A],
                )
                .unwrap(),
            ),
            "f/digitalWrite" => Some(
                coap::wrap(
                    MessageName::FunctionReturn,
                    message.message_id,
                    message.token_key(),
                    WrapParams::None,
                    7i32.to_be_bytes().to_vec(),
                )
                .unwrap(),
            ),
            "s" => Some(
                coap::wrap(
                    MessageName::SignalStartReturn,
                    message.message_id,
                    message.token_key(),
                    WrapParams::None,
                    Vec::new(),
                )
                .unwrap(),
            ),
            _ => None,
        }
    }));

    let introspection = session.describe().await.expect("describe");
    assert_eq!(introspection.function_state["v"]["temp"], "int32");

    // End-to-end scenario 3: getVariable("temp") resolves with integer 42.
    let value = session.get_variable("temp").await.expect("get_variable");
    assert_eq!(value, DecodedValue::Int32(42));

    let result = session
        .call_function("digitalWrite", vec!["1".to_string()])
        .await
        .expect("call_function");
    assert_eq!(result, 7);

    session.raise_signal(true).await.expect("raise_signal");

    device_task.abort();
}

/// spec §4.5's describe race: a first `DescribeReturn` that carries only
/// system information (no `f`/`v`) must not free its token, so a second
/// `DescribeReturn` under the same token still resolves as `DescribeReturn`
/// rather than falling through to `PingAck` and timing out.
#[tokio::test]
async fn describe_resolves_second_response_under_same_token() {
    let publisher: Arc<dyn EventPublisher> = Arc::new(RecordingPublisher::default());
    let (session, cipher_in, mut device) =
        handshake_pair(b"device-describe-race".to_vec(), Vec::new(), publisher).await;
    let _run = tokio::spawn({
        let session = session.clone();
        async move { session.run(cipher_in).await }
    });

    let describe_task = tokio::spawn({
        let session = session.clone();
        async move { session.describe().await }
    });

    let request = loop {
        let bytes = device.cipher_in.recv().await.expect("recv ok").expect("request frame");
        let message = coap::unwrap(&bytes).expect("parse request");
        if message.uri_path == "d" {
            break message;
        }
    };

    let system_only = serde_json::to_vec(&serde_json::json!({"p": 6})).unwrap();
    let first = coap::wrap(
        MessageName::DescribeReturn,
        request.message_id,
        request.token_key(),
        WrapParams::None,
        system_only,
    )
    .unwrap();
    device.cipher_out.send(&first).await.expect("send first DescribeReturn");

    let second = coap::wrap(
        MessageName::DescribeReturn,
        request.message_id.wrapping_add(1),
        request.token_key(),
        WrapParams::None,
        describe_payload(),
    )
    .unwrap();
    device.cipher_out.send(&second).await.expect("send second DescribeReturn");

    let introspection = tokio::time::timeout(std::time::Duration::from_secs(2), describe_task)
        .await
        .expect("describe did not time out")
        .expect("describe task")
        .expect("describe succeeds");

    assert_eq!(introspection.function_state["v"]["temp"], "int32");
}

/// End-to-end scenario 4: an unrecognized variable name rejects without
/// sending any message (introspection is already cached).
#[tokio::test]
async fn unknown_variable_rejects_without_sending() {
    let publisher: Arc<dyn EventPublisher> = Arc::new(RecordingPublisher::default());
    let (session, cipher_in, device) =
        handshake_pair(b"device-unknown-var".to_vec(), Vec::new(), publisher).await;
    let _run = tokio::spawn({
        let session = session.clone();
        async move { session.run(cipher_in).await }
    });

    let device_task = tokio::spawn(device_respond_loop(device, |message| {
        (message.uri_path == "d").then(|| {
            coap::wrap(
                MessageName::DescribeReturn,
                message.message_id,
                message.token_key(),
                WrapParams::None,
                describe_payload(),
            )
            .unwrap()
        })
    }));

    session.describe().await.expect("describe");
    let err = session.get_variable("nope").await.unwrap_err();
    assert!(matches!(err, SessionError::VariableNotFound));

    device_task.abort();
}

/// An unresolvable function name fails with "Unknown Function" rather than
/// sending a request the device could never answer (spec §4.5).
#[tokio::test]
async fn unknown_function_rejects_without_sending() {
    let publisher: Arc<dyn EventPublisher> = Arc::new(RecordingPublisher::default());
    let (session, cipher_in, device) =
        handshake_pair(b"device-unknown-fn".to_vec(), Vec::new(), publisher).await;
    let _run = tokio::spawn({
        let session = session.clone();
        async move { session.run(cipher_in).await }
    });

    let device_task = tokio::spawn(device_respond_loop(device, |message| {
        (message.uri_path == "d").then(|| {
            coap::wrap(
                MessageName::DescribeReturn,
                message.message_id,
                message.token_key(),
                WrapParams::None,
                describe_payload(),
            )
            .unwrap()
        })
    }));

    session.describe().await.expect("describe");
    let err = session
        .call_function("doesNotExist", vec![])
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::UnknownFunction));

    device_task.abort();
}

/// spec §7: a duplicate allocation onto a still-live token slot is a fatal
/// programmer error that must disconnect the session, not just return an
/// error from the call that hit it. Allocating past the 256-slot table
/// without ever releasing a token wraps the allocator back onto a live slot.
#[tokio::test]
async fn token_collision_on_live_slot_disconnects_session() {
    let publisher: Arc<dyn EventPublisher> = Arc::new(RecordingPublisher::default());
    let (session, cipher_in, _device) =
        handshake_pair(b"device-token-collision".to_vec(), Vec::new(), publisher).await;
    let _run = tokio::spawn({
        let session = session.clone();
        async move { session.run(cipher_in).await }
    });

    for _ in 0..256 {
        session
            .send_message(MessageName::Describe, WrapParams::None, Vec::new(), NONE_HOLDER)
            .await
            .expect("token slot still free");
    }

    let err = session
        .send_message(MessageName::Describe, WrapParams::None, Vec::new(), 0)
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::TokenCollision(_)));
    assert!(matches!(session.state(), devsession::SessionState::Disconnected));
}

fn event_publish_frame(message_id: u16, uri: &str) -> Vec<u8> {
    let mut packet = Packet::new();
    packet.header.set_version(1);
    packet.header.set_type(PacketType::Confirmable);
    packet.header.code = MessageClass::Request(RequestType::Post);
    packet.header.message_id = message_id;
    packet.add_option(CoapOption::UriPath, uri.as_bytes().to_vec());
    packet.to_bytes().expect("encode event publish")
}

/// Device-published events are acked and fanned out through the external
/// publisher, except `spark/`-prefixed system events, which are consumed
/// internally and never forwarded (spec §6).
#[tokio::test]
async fn device_published_events_ack_and_filter_spark_events() {
    let publisher = Arc::new(RecordingPublisher::default());
    let publisher_dyn: Arc<dyn EventPublisher> = publisher.clone();
    let (session, cipher_in, mut device) =
        handshake_pair(b"device-events".to_vec(), Vec::new(), publisher_dyn).await;
    let _run = tokio::spawn(async move { session.run(cipher_in).await });

    device
        .cipher_out
        .send(&event_publish_frame(1, "e/sensors/temperature"))
        .await
        .expect("send user event");
    let ack = device.cipher_in.recv().await.expect("recv ok").expect("ack frame");
    let ack = coap::unwrap(&ack).expect("parse ack");
    assert_eq!(ack.confirmability, coap::Confirmability::Acknowledgement);

    device
        .cipher_out
        .send(&event_publish_frame(2, "e/spark/device/ip"))
        .await
        .expect("send spark event");
    let _ack = device.cipher_in.recv().await.expect("recv ok").expect("ack frame");

    let recorded = publisher.events.lock().await;
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].1.name, "sensors/temperature");
}

// SPDX-License-Identifier: MIT OR Apache-2.0
//! Property and boundary tests for the envelope bus.

use afc_bus::Bus;
use afc_core::{DEFAULT_MAX_PAYLOAD_BYTES, Envelope, Payload};
use proptest::prelude::*;
use std::sync::{Arc, Mutex};

fn payload_with(key: &str, value: impl Into<serde_json::Value>) -> Payload {
    let mut payload = Payload::new();
    payload.insert(key, value);
    payload
}

proptest! {
    // Per-publisher publish order is delivery order for every subscriber
    // attached at publish time.
    #[test]
    fn subscribers_observe_publish_order(
        topic in "[a-z]{1,8}",
        values in proptest::collection::vec(-1_000i64..1_000, 1..40),
    ) {
        let bus = Bus::new();
        let sync_seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&sync_seen);
        bus.subscribe(&topic, move |env: &Envelope| {
            sink.lock().unwrap().push(env.payload.get("v").unwrap().as_i64().unwrap());
        });
        let mut queue_rx = bus.subscribe_channel(&topic);

        for v in &values {
            let env = Envelope::new("producer", &topic).with_payload(payload_with("v", *v));
            bus.publish(&topic, &env).unwrap();
        }

        prop_assert_eq!(&*sync_seen.lock().unwrap(), &values);
        let mut queued = Vec::new();
        while let Ok(env) = queue_rx.try_recv() {
            queued.push(env.payload.get("v").unwrap().as_i64().unwrap());
        }
        prop_assert_eq!(&queued, &values);
    }

    // Wire serialisation round-trips value-wise.
    #[test]
    fn wire_roundtrip_preserves_envelopes(
        sender in ".{0,16}",
        recipient in ".{0,16}",
        ts in -1.0e12f64..1.0e12,
        text in ".{0,64}",
        number in -1_000_000i64..1_000_000,
    ) {
        let mut payload = Payload::new();
        payload.insert("text", text);
        payload.insert("number", number);
        payload.insert("nested", serde_json::json!({"list": [1, 2, 3]}));
        let env = Envelope::new(sender, recipient).with_payload(payload).with_ts(ts);
        let back = Envelope::from_wire(&env.to_wire().unwrap()).unwrap();
        prop_assert_eq!(back, env);
    }
}

#[test]
fn empty_payloads_are_accepted() {
    let bus = Bus::new();
    let delivered = bus.publish("t", &Envelope::new("s", "t")).unwrap();
    assert_eq!(delivered, 0);
    assert_eq!(bus.stats().published, 1);
}

#[test]
fn payloads_over_the_cap_are_rejected() {
    let bus = Bus::new();
    let env = Envelope::new("s", "t")
        .with_payload(payload_with("data", "x".repeat(DEFAULT_MAX_PAYLOAD_BYTES + 1)));
    let err = bus.publish("t", &env).unwrap_err();
    assert_eq!(err.code(), afc_core::ErrorCode::InvalidPayload);
    assert_eq!(bus.stats().published, 0, "rejected publishes are not counted");
}

#[test]
fn payloads_just_under_the_cap_are_accepted() {
    let bus = Bus::new();
    let env = Envelope::new("s", "t")
        .with_payload(payload_with("data", "x".repeat(DEFAULT_MAX_PAYLOAD_BYTES / 2)));
    bus.publish("t", &env).unwrap();
}

#[test]
fn coercion_defaults_survive_the_wire() {
    let env = Envelope::from_wire(r#"{"recipient":"orch"}"#).unwrap();
    assert_eq!(env.sender, "");
    assert_eq!(env.recipient, "orch");
    assert_eq!(env.ts, 0.0);
    assert!(env.payload.is_empty());
}

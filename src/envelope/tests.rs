use super::schema::{self, BookingConfirmed, DomainEvent};
use super::*;
use chrono::{Duration, TimeZone, Utc};
use serde_json::json;

fn payload(value: serde_json::Value) -> Payload {
    value.as_object().cloned().expect("object payload")
}

#[test]
fn test_envelope_wire_format_uses_camel_case_keys() {
    let envelope = EventEnvelope::new(
        "booking.confirmed",
        payload(json!({ "reservationId": "R1", "total": 120 })),
        "bookings",
        Utc.with_ymd_and_hms(2026, 10, 19, 10, 0, 0).unwrap(),
    )
    .unwrap();

    let value: serde_json::Value = serde_json::to_value(&envelope).unwrap();
    assert_eq!(value["eventName"], "booking.confirmed");
    assert_eq!(value["data"]["reservationId"], "R1");
    assert_eq!(value["source"], "bookings");
    assert_eq!(value["version"], 1);
    assert!(value["timestamp"].as_str().unwrap().starts_with("2026-10-19T10:00:00"));
    assert!(value["messageId"].is_string());
}

#[test]
fn test_envelope_without_message_id_still_parses() {
    let body = json!({
        "eventName": "payment.succeeded",
        "data": { "paymentId": "P1" },
        "timestamp": "2026-10-19T10:00:00Z",
        "source": "payments"
    });

    let envelope = EventEnvelope::from_bytes(body.to_string().as_bytes()).unwrap();
    assert_eq!(envelope.event_name(), "payment.succeeded");
    assert_eq!(envelope.message_id(), None);
    assert_eq!(envelope.version(), 1);
}

#[test]
fn test_from_bytes_rejects_garbage_and_bad_names() {
    assert!(EventEnvelope::from_bytes(b"not json").is_err());

    let wildcard_name = json!({
        "eventName": "booking.*",
        "data": {},
        "timestamp": "2026-10-19T10:00:00Z",
        "source": "bookings"
    });
    assert!(EventEnvelope::from_bytes(wildcard_name.to_string().as_bytes()).is_err());
}

#[test]
fn test_message_ids_are_unique_per_envelope() {
    let now = Utc::now();
    let a = EventEnvelope::new("user.created", Payload::new(), "users", now).unwrap();
    let b = EventEnvelope::new("user.created", Payload::new(), "users", now).unwrap();
    assert_ne!(a.message_id(), b.message_id());
}

#[test]
fn test_validate_event_name() {
    assert!(validate_event_name("booking.confirmed").is_ok());
    assert!(validate_event_name("user").is_ok());
    assert!(validate_event_name("listing.price_changed").is_ok());
    assert!(validate_event_name("").is_err());
    assert!(validate_event_name("booking.").is_err());
    assert!(validate_event_name(".booking").is_err());
    assert!(validate_event_name("booking.#").is_err());
    assert!(validate_event_name("booking confirmed").is_err());
}

#[test]
fn test_decode_typed_payload() {
    let envelope = EventEnvelope::new(
        BookingConfirmed::NAME,
        payload(json!({ "reservationId": "R1", "total": 120, "extra": true })),
        "bookings",
        Utc::now(),
    )
    .unwrap();

    let confirmed: BookingConfirmed = envelope.decode().unwrap();
    assert_eq!(confirmed.reservation_id, "R1");
    assert_eq!(confirmed.total, 120.0);

    let wrong: Result<schema::PaymentSucceeded, _> = envelope.decode();
    assert!(wrong.is_err());
}

#[test]
fn test_vocabulary_names_are_valid() {
    for name in schema::ALL_EVENTS {
        assert!(validate_event_name(name).is_ok(), "{name}");
    }
}

#[test]
fn test_monotonic_clock_never_goes_backwards() {
    let clock = MonotonicClock::new();
    let mut previous = clock.now();
    for _ in 0..100 {
        let next = clock.now();
        assert!(next >= previous);
        previous = next;
    }

    // A stamp from the future pins the clock until wall time catches up.
    let future = Utc::now() + Duration::hours(1);
    *clock.last.lock().unwrap() = Some(future);
    assert_eq!(clock.now(), future);
}

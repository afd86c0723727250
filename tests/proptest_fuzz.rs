//! Property-based tests (fuzzing) for the record codec and its key layout.
//!
//! Uses proptest to generate random and malformed inputs and verify the
//! codec never panics, only returns clean errors, and that keys keep the
//! ordering reads rely on.
//!
//! Run with: `cargo test --test proptest_fuzz`

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use proptest::prelude::*;
use serde_json::Value;

use migration_engine::codec::{log_sort_key, payment_sort_key, DistributedItem, ItemKey};
use migration_engine::validator::tolerance_for;
use migration_engine::{LogRecord, PaymentRecord, PaymentStatus, RecordClass, RecordCodec};

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
}

fn codec() -> RecordCodec {
    RecordCodec::new(90, 2555).with_clock(Arc::new(now))
}

// =============================================================================
// Strategies for generating test data
// =============================================================================

/// Timestamps within the last 80 days, millisecond precision.
fn recent_timestamp() -> impl Strategy<Value = DateTime<Utc>> {
    (0i64..80 * 86_400_000).prop_map(|ms| now() - Duration::milliseconds(ms))
}

fn valid_log_strategy() -> impl Strategy<Value = LogRecord> {
    (
        0i64..i64::MAX,
        "[A-Za-z][A-Za-z0-9_-]{0,20}",
        "[A-Z]{3,10}",
        recent_timestamp(),
        proptest::option::of(0i64..1_000_000),
        any::<bool>(),
        proptest::option::of(".{0,200}"),
    )
        .prop_map(|(id, service, log_type, ts, app, ok, payload)| {
            let mut log = LogRecord::new(id, service, log_type, ts);
            if let Some(app) = app {
                log = log.with_application(app);
            }
            if !ok {
                log = log.failed("500", "upstream error");
            }
            log.request_data = payload;
            log
        })
}

fn valid_payment_strategy() -> impl Strategy<Value = PaymentRecord> {
    (
        0i64..i64::MAX,
        0i64..1_000_000,
        0i64..1_000_000,
        1i64..100_000_000,
        recent_timestamp(),
        "(Card|ACH|Wire|Cash)",
    )
        .prop_map(|(id, loan, customer, cents, ts, method)| PaymentRecord::new(id, loan, customer, cents, ts, method))
}

/// Generate arbitrary JSON values (including invalid structures)
fn arbitrary_json_strategy() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| Value::Number(n.into())),
        ".*".prop_map(Value::String),
    ];

    leaf.prop_recursive(4, 64, 10, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..10).prop_map(Value::Array),
            prop::collection::hash_map(".*", inner, 0..10).prop_map(|m| Value::Object(m.into_iter().collect())),
        ]
    })
}

fn status_strategy() -> impl Strategy<Value = PaymentStatus> {
    prop_oneof![
        Just(PaymentStatus::Pending),
        Just(PaymentStatus::Completed),
        Just(PaymentStatus::Failed),
        Just(PaymentStatus::Refunded),
    ]
}

// =============================================================================
// Deserialization Fuzz Tests
// =============================================================================

proptest! {
    /// Item documents read back from the key-value store may be anything
    #[test]
    fn fuzz_item_document_from_random_text(doc in ".{0,2000}") {
        let _ = DistributedItem::from_json(&doc);
    }

    /// Attributes that do not look like a record fail cleanly
    #[test]
    fn fuzz_decode_arbitrary_attributes(attributes in arbitrary_json_strategy()) {
        let item = DistributedItem {
            key: ItemKey::new("Svc#2024-05-01", "2024-05-01T00:00:00.000Z#00000000000000000001"),
            class: RecordClass::Logs,
            timestamp_ms: 0,
            expires_at: 0,
            indexes: Vec::new(),
            revision: 0,
            attributes,
        };
        let _ = codec().decode::<LogRecord>(&item);
        let _ = codec().decode::<PaymentRecord>(&item);
    }

    /// Corrupted item documents fail gracefully
    #[test]
    fn fuzz_corrupted_item_document(
        log in valid_log_strategy(),
        corruption in prop::collection::vec(any::<u8>(), 1..50),
        position in 0usize..10000,
    ) {
        let item = codec().encode(&log).unwrap();
        let mut bytes = item.to_json().unwrap().into_bytes();
        let pos = position % bytes.len();
        for (i, b) in corruption.iter().enumerate() {
            let idx = (pos + i) % bytes.len();
            bytes[idx] ^= b;
        }
        let _ = DistributedItem::from_json(&String::from_utf8_lossy(&bytes));
    }
}

// =============================================================================
// Codec Properties
// =============================================================================

proptest! {
    #[test]
    fn prop_log_survives_target_store(log in valid_log_strategy()) {
        let item = codec().encode(&log).unwrap();
        let json = item.to_json().unwrap();
        let stored = DistributedItem::from_json(&json).unwrap();
        prop_assert_eq!(codec().decode::<LogRecord>(&stored).unwrap(), log);
    }

    #[test]
    fn prop_payment_keys_and_indexes(payment in valid_payment_strategy(), status in status_strategy()) {
        let mut payment = payment;
        payment.status = status;
        let item = codec().encode(&payment).unwrap();

        let partition = format!("CUSTOMER#{}", payment.customer_id);
        prop_assert_eq!(&item.key.partition, &partition);
        let status_key = format!("STATUS#{}", status);
        prop_assert!(item.indexes.iter().any(|e| e.key == status_key));
        prop_assert_eq!(codec().decode::<PaymentRecord>(&item).unwrap(), payment);
    }

    /// Expiry is anchored on the record time, not on the write time
    #[test]
    fn prop_expiry_follows_record_time(log in valid_log_strategy(), payment in valid_payment_strategy()) {
        let item = codec().encode(&log).unwrap();
        prop_assert_eq!(item.expires_at - log.timestamp.timestamp(), 90 * 86_400);
        prop_assert!(!codec().is_past_retention(&log));

        let item = codec().encode(&payment).unwrap();
        prop_assert_eq!(item.expires_at - payment.payment_date.timestamp(), 2555 * 86_400);
    }

    /// Lexicographic sort keys order like (timestamp, id)
    #[test]
    fn prop_log_sort_key_order(
        a_ts in recent_timestamp(),
        b_ts in recent_timestamp(),
        a_id in 0i64..i64::MAX,
        b_id in 0i64..i64::MAX,
    ) {
        let by_key = log_sort_key(a_ts, a_id).cmp(&log_sort_key(b_ts, b_id));
        let by_value = (a_ts.timestamp_millis(), a_id).cmp(&(b_ts.timestamp_millis(), b_id));
        prop_assert_eq!(by_key, by_value);
    }

    /// Payment keys have second precision; order holds at that grain
    #[test]
    fn prop_payment_sort_key_order(
        a_ts in recent_timestamp(),
        b_ts in recent_timestamp(),
        a_id in 0i64..i64::MAX,
        b_id in 0i64..i64::MAX,
    ) {
        let by_key = payment_sort_key(a_ts, a_id).cmp(&payment_sort_key(b_ts, b_id));
        let by_value = (a_ts.timestamp(), a_id).cmp(&(b_ts.timestamp(), b_id));
        prop_assert_eq!(by_key, by_value);
    }

    /// Service names that would break the key layout are rejected, not encoded
    #[test]
    fn prop_reserved_characters_rejected(
        prefix in "[A-Za-z]{0,8}",
        sep in "[#|]",
        suffix in "[A-Za-z]{0,8}",
        ts in recent_timestamp(),
    ) {
        let log = LogRecord::new(1, format!("{}{}{}", prefix, sep, suffix), "REQUEST", ts);
        prop_assert!(codec().encode(&log).is_err());
    }

    #[test]
    fn prop_future_records_rejected(minutes in 6i64..100_000) {
        let log = LogRecord::new(1, "Svc", "REQUEST", now() + Duration::minutes(minutes));
        prop_assert!(codec().encode(&log).is_err());
    }

    #[test]
    fn prop_negative_ids_rejected(id in i64::MIN..0, ts in recent_timestamp()) {
        prop_assert!(codec().encode(&LogRecord::new(id, "Svc", "REQUEST", ts)).is_err());
        prop_assert!(codec().encode(&PaymentRecord::new(id, 1, 1, 100, ts, "Card")).is_err());
    }
}

// =============================================================================
// Validation and Lifecycle Properties
// =============================================================================

proptest! {
    #[test]
    fn prop_tolerance_has_floor_of_one(source in 0u64..10_000_000, ratio in 0.0f64..1.0) {
        let tolerance = tolerance_for(source, ratio);
        prop_assert!(tolerance >= 1.0);
        prop_assert!(tolerance >= source as f64 * ratio);
    }

    /// Terminal payments never move again
    #[test]
    fn prop_terminal_status_is_final(from in status_strategy(), to in status_strategy()) {
        if from.is_terminal() {
            prop_assert!(!from.can_transition_to(to));
        }
        prop_assert!(!from.can_transition_to(from));
    }

    #[test]
    fn prop_update_status_respects_lifecycle(
        payment in valid_payment_strategy(),
        steps in prop::collection::vec(status_strategy(), 0..6),
    ) {
        let mut payment = payment;
        for next in steps {
            let before = payment.status;
            let result = payment.update_status(next, now());
            prop_assert_eq!(result.is_ok(), before.can_transition_to(next));
            if result.is_err() {
                prop_assert_eq!(payment.status, before);
            }
        }
    }
}

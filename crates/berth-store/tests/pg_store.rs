// Runs against a real database only when BERTH_TEST_DATABASE_URL is set.

use std::collections::BTreeMap;
use std::time::Duration;

use berth_core::{
    ClassPrice, FailureKind, FamilyId, InstanceId, JobStatus, LineId, PipelineMode, PriceSummary, RunCounters,
    SailingRecord, WebhookJob,
};
use berth_store::{JobQueue, LineLocks, ModeStore, PersistError, PgStore, SailingStore, UpsertOutcome};
use chrono::{NaiveDate, Utc};
use uuid::Uuid;

async fn store() -> Option<PgStore> {
    let url = std::env::var("BERTH_TEST_DATABASE_URL").ok()?;
    let store = PgStore::connect(&url, 4).await.expect("connect");
    store.migrate().await.expect("migrate");
    Some(store)
}

fn record(instance: &str) -> SailingRecord {
    let mut prices = PriceSummary {
        interior: Some(ClassPrice {
            amount: 500.0,
            price_code: Some("IA".into()),
        }),
        balcony: Some(ClassPrice {
            amount: 900.0,
            price_code: None,
        }),
        ..Default::default()
    };
    prices.recompute_cheapest();
    SailingRecord {
        instance_id: InstanceId::new(instance),
        family_id: FamilyId::new("PG-FAMILY"),
        line_id: LineId::new(9001).unwrap(),
        ship_id: Some(9002),
        name: Some("Integration Cruise".into()),
        voyage_code: None,
        itinerary_code: None,
        sailing_date: NaiveDate::from_ymd_opt(2030, 1, 1),
        return_date: NaiveDate::from_ymd_opt(2030, 1, 8),
        nights: Some(7),
        sail_nights: None,
        sea_days: None,
        embark_port_id: Some(9003),
        disembark_port_id: None,
        region_ids: vec![9004],
        port_ids: vec![9003],
        no_fly: None,
        depart_uk: None,
        visible: Some(true),
        currency: Some("USD".into()),
        line_name: None,
        ship_name: None,
        port_names: BTreeMap::new(),
        region_names: BTreeMap::new(),
        prices,
        price_divisor: None,
        anomalies: Vec::new(),
        source_path: Some("2030/01/9001/9002/x.json".into()),
        raw: serde_json::json!({"codetocruiseid": instance, "cruiseid": "PG-FAMILY"}),
        reconstructed: None,
    }
}

#[tokio::test]
async fn upsert_round_trips_prices_and_is_idempotent() {
    let Some(store) = store().await else {
        return;
    };
    let instance = format!("PG-{}", Uuid::new_v4());
    let rec = record(&instance);
    assert_eq!(store.upsert_sailing(&rec).await.unwrap(), UpsertOutcome::Inserted);
    assert_eq!(store.upsert_sailing(&rec).await.unwrap(), UpsertOutcome::Updated);

    let stored = store.sailing(&rec.instance_id).await.unwrap().unwrap();
    assert_eq!(stored.prices.cheapest, Some(500.0));
    assert_eq!(stored.prices.interior.unwrap().price_code.as_deref(), Some("IA"));
    assert!(stored.raw.is_some());
    assert_eq!(store.price_history(&rec.instance_id).await.unwrap().len(), 3);
}

#[tokio::test]
async fn concurrent_upserts_of_one_instance_leave_one_row() {
    let Some(store) = store().await else {
        return;
    };
    let instance = format!("PG-{}", Uuid::new_v4());
    let rec = record(&instance);
    let (a, b) = tokio::join!(store.upsert_sailing(&rec), store.upsert_sailing(&rec));
    let outcomes = [a.unwrap(), b.unwrap()];
    assert_eq!(outcomes.iter().filter(|o| **o == UpsertOutcome::Inserted).count(), 1);
}

#[tokio::test]
async fn queue_lock_and_mode_behave_across_connections() {
    let Some(store) = store().await else {
        return;
    };
    let line = LineId::new(9100 + (Uuid::new_v4().as_u128() % 800) as i64).unwrap();
    let job = WebhookJob::pending(line, Utc::now());
    store.enqueue(&job).await.unwrap();
    store.complete(job.id, &RunCounters::default()).await.unwrap();
    assert_eq!(store.job(job.id).await.unwrap().unwrap().status, JobStatus::Done);

    let ttl = Duration::from_secs(30);
    assert!(store.try_acquire(line, "pg-a", ttl).await.unwrap());
    assert!(!store.try_acquire(line, "pg-b", ttl).await.unwrap());
    assert!(!store.try_acquire(line, "pg-a", ttl).await.unwrap());
    assert!(store.renew(line, "pg-a", ttl).await.unwrap());
    assert!(store.force_clear(line).await.unwrap());
    assert!(store.try_acquire(line, "pg-b", ttl).await.unwrap());
    store.release(line, "pg-b").await.unwrap();

    let before = store.mode().await.unwrap().mode;
    store.set_mode(PipelineMode::Paused, Some("integration")).await.unwrap();
    assert_eq!(store.mode().await.unwrap().mode, PipelineMode::Paused);
    store.set_mode(before, None).await.unwrap();
}

#[tokio::test]
async fn out_of_range_prices_are_constraint_violations() {
    let Some(store) = store().await else {
        return;
    };
    let err: PersistError = sqlx::query("SELECT 1e12::numeric(12, 2)")
        .execute(store.pool())
        .await
        .unwrap_err()
        .into();
    assert_eq!(err.kind(), FailureKind::ConstraintViolation);

    let mut tiny = record(&format!("PG-TINY-{}", Uuid::new_v4().simple()));
    tiny.prices = PriceSummary {
        interior: Some(ClassPrice {
            amount: 0.001,
            price_code: None,
        }),
        ..Default::default()
    };
    tiny.prices.recompute_cheapest();
    let err = store.upsert_sailing(&tiny).await.unwrap_err();
    assert_eq!(err.kind(), FailureKind::ConstraintViolation);
}

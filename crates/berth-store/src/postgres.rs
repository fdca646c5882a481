//! PostgreSQL backend.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use berth_core::{
    ClassPrice, FailureKind, FamilyId, FileAttempt, InstanceId, JobStatus, LineId, Period,
    PeriodStatus, PipelineMode, PipelineModeRecord, PriceSource, PriceSummary, RunCounters,
    SailingRecord, SyncCheckpoint, WebhookJob,
};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::debug;
use uuid::Uuid;

use crate::{
    check_prices, dimension_refs, price_changes, raw_checksum, CheckpointStore, Dimension, DimensionRef,
    JobQueue, LineLocks, ModeStore, PersistError, PriceChange, SailingStore, StoredSailing,
    UpsertOutcome,
};

impl From<sqlx::Error> for PersistError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_foreign_key_violation() => PersistError::ForeignKeyMissing {
                entity: "reference",
                id: db.constraint().unwrap_or("unknown").to_string(),
            },
            sqlx::Error::Database(db)
                if db.is_unique_violation()
                    || db.is_check_violation()
                    || matches!(db.code().as_deref(), Some("23502") | Some("22003")) =>
            {
                PersistError::ConstraintViolation(db.message().to_string())
            }
            _ => PersistError::Backend(err.to_string()),
        }
    }
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

const SAILING_COLUMNS: &str = r#"
    s.instance_id, s.family_id, s.line_id, s.ship_id, s.sailing_date, s.source_path,
    s.raw_payload, s.is_active, s.updated_at,
    q.interior::float8 AS interior, q.interior_code,
    q.oceanview::float8 AS oceanview, q.oceanview_code,
    q.balcony::float8 AS balcony, q.balcony_code,
    q.suite::float8 AS suite, q.suite_code,
    q.cheapest::float8 AS cheapest, q.source
"#;

const JOB_COLUMNS: &str = r#"
    id, line_id, status, received_at, available_at, started_at, finished_at,
    attempts, worker_id, counters, error
"#;

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running migrations")
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn class_price(row: &PgRow, amount: &str, code: &str) -> Result<Option<ClassPrice>, sqlx::Error> {
    let amount: Option<f64> = row.try_get(amount)?;
    let price_code: Option<String> = row.try_get(code)?;
    Ok(amount.map(|amount| ClassPrice { amount, price_code }))
}

fn stored_from_row(row: &PgRow) -> Result<StoredSailing, PersistError> {
    let line_id: i32 = row.try_get("line_id")?;
    let source: Option<String> = row.try_get("source")?;
    Ok(StoredSailing {
        instance_id: InstanceId::new(row.try_get::<String, _>("instance_id")?),
        family_id: FamilyId::new(row.try_get::<String, _>("family_id")?),
        line_id: LineId::new(i64::from(line_id))
            .ok_or_else(|| PersistError::ConstraintViolation(format!("stored line id {line_id}")))?,
        ship_id: row.try_get("ship_id")?,
        sailing_date: row.try_get("sailing_date")?,
        source_path: row.try_get("source_path")?,
        raw: row.try_get("raw_payload")?,
        prices: PriceSummary {
            interior: class_price(row, "interior", "interior_code")?,
            oceanview: class_price(row, "oceanview", "oceanview_code")?,
            balcony: class_price(row, "balcony", "balcony_code")?,
            suite: class_price(row, "suite", "suite_code")?,
            cheapest: row.try_get("cheapest")?,
            source: source.as_deref().and_then(PriceSource::parse),
        },
        active: row.try_get("is_active")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn job_from_row(row: &PgRow) -> Result<WebhookJob, PersistError> {
    let line_id: i32 = row.try_get("line_id")?;
    let status: String = row.try_get("status")?;
    let counters: Option<serde_json::Value> = row.try_get("counters")?;
    Ok(WebhookJob {
        id: row.try_get("id")?,
        line_id: LineId::new(i64::from(line_id))
            .ok_or_else(|| PersistError::ConstraintViolation(format!("stored line id {line_id}")))?,
        status: JobStatus::parse(&status)
            .ok_or_else(|| PersistError::ConstraintViolation(format!("unknown job status {status}")))?,
        received_at: row.try_get("received_at")?,
        available_at: row.try_get("available_at")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        attempts: row.try_get("attempts")?,
        worker_id: row.try_get("worker_id")?,
        counters: counters.and_then(|v| serde_json::from_value::<RunCounters>(v).ok()),
        error: row.try_get("error")?,
    })
}

fn counters_json(counters: &RunCounters) -> serde_json::Value {
    serde_json::to_value(counters).unwrap_or(serde_json::Value::Null)
}

async fn ensure_dimension(tx: &mut Transaction<'_, Postgres>, line_id: i32, dim: &DimensionRef) -> Result<(), PersistError> {
    let name = dim.resolved_name();
    let placeholder = dim.is_placeholder();
    let query = match dim.dimension {
        Dimension::Ship => sqlx::query(
            r#"
            INSERT INTO ships (id, line_id, name, is_placeholder)
            VALUES ($1, $4, $2, $3)
            ON CONFLICT (id) DO UPDATE
               SET name = EXCLUDED.name,
                   is_placeholder = FALSE,
                   updated_at = NOW()
             WHERE ships.is_placeholder AND NOT EXCLUDED.is_placeholder
            "#,
        ),
        Dimension::Line => sqlx::query(
            r#"
            INSERT INTO cruise_lines (id, name, is_placeholder)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO UPDATE
               SET name = EXCLUDED.name,
                   is_placeholder = FALSE,
                   updated_at = NOW()
             WHERE cruise_lines.is_placeholder AND NOT EXCLUDED.is_placeholder
            "#,
        ),
        Dimension::Port => sqlx::query(
            r#"
            INSERT INTO ports (id, name, is_placeholder)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO UPDATE
               SET name = EXCLUDED.name,
                   is_placeholder = FALSE,
                   updated_at = NOW()
             WHERE ports.is_placeholder AND NOT EXCLUDED.is_placeholder
            "#,
        ),
        Dimension::Region => sqlx::query(
            r#"
            INSERT INTO regions (id, name, is_placeholder)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO UPDATE
               SET name = EXCLUDED.name,
                   is_placeholder = FALSE,
                   updated_at = NOW()
             WHERE regions.is_placeholder AND NOT EXCLUDED.is_placeholder
            "#,
        ),
    };
    let query = query.bind(dim.id).bind(name).bind(placeholder);
    let query = if dim.dimension == Dimension::Ship {
        query.bind(line_id)
    } else {
        query
    };
    query.execute(&mut **tx).await?;
    Ok(())
}

async fn previous_prices(tx: &mut Transaction<'_, Postgres>, instance_id: &str) -> Result<Option<PriceSummary>, PersistError> {
    let row = sqlx::query(
        r#"
        SELECT interior::float8 AS interior, interior_code,
               oceanview::float8 AS oceanview, oceanview_code,
               balcony::float8 AS balcony, balcony_code,
               suite::float8 AS suite, suite_code,
               cheapest::float8 AS cheapest, source
          FROM price_quotes
         WHERE instance_id = $1
           FOR UPDATE
        "#,
    )
    .bind(instance_id)
    .fetch_optional(&mut **tx)
    .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    let source: Option<String> = row.try_get("source")?;
    Ok(Some(PriceSummary {
        interior: class_price(&row, "interior", "interior_code")?,
        oceanview: class_price(&row, "oceanview", "oceanview_code")?,
        balcony: class_price(&row, "balcony", "balcony_code")?,
        suite: class_price(&row, "suite", "suite_code")?,
        cheapest: row.try_get("cheapest")?,
        source: source.as_deref().and_then(PriceSource::parse),
    }))
}

#[async_trait]
impl SailingStore for PgStore {
    async fn upsert_sailing(&self, record: &SailingRecord) -> Result<UpsertOutcome, PersistError> {
        let refs = dimension_refs(record)?;
        check_prices(&record.prices)?;
        let mut tx = self.pool.begin().await?;
        for dim in &refs {
            ensure_dimension(&mut tx, record.line_id.get(), dim).await?;
        }

        let anomalies = serde_json::to_value(&record.anomalies).unwrap_or_default();
        let raw = (!record.raw.is_null()).then(|| record.raw.clone());
        let checksum = raw.as_ref().map(raw_checksum);
        let inserted: bool = sqlx::query(
            r#"
            INSERT INTO sailings (
                instance_id, family_id, line_id, ship_id, name, voyage_code, itinerary_code,
                sailing_date, return_date, nights, sail_nights, sea_days,
                embark_port_id, disembark_port_id, region_ids, port_ids,
                no_fly, depart_uk, visible, currency, price_divisor, anomalies,
                source_path, raw_payload, raw_checksum, is_active
            )
            VALUES (
                $1, $2, $3, $4, $5, $6, $7,
                $8, $9, $10, $11, $12,
                $13, $14, $15, $16,
                $17, $18, $19, $20, $21::numeric, $22,
                $23, $24, $25, TRUE
            )
            ON CONFLICT (instance_id) DO UPDATE SET
                family_id = EXCLUDED.family_id,
                line_id = EXCLUDED.line_id,
                ship_id = EXCLUDED.ship_id,
                name = EXCLUDED.name,
                voyage_code = EXCLUDED.voyage_code,
                itinerary_code = EXCLUDED.itinerary_code,
                sailing_date = EXCLUDED.sailing_date,
                return_date = EXCLUDED.return_date,
                nights = EXCLUDED.nights,
                sail_nights = EXCLUDED.sail_nights,
                sea_days = EXCLUDED.sea_days,
                embark_port_id = EXCLUDED.embark_port_id,
                disembark_port_id = EXCLUDED.disembark_port_id,
                region_ids = EXCLUDED.region_ids,
                port_ids = EXCLUDED.port_ids,
                no_fly = EXCLUDED.no_fly,
                depart_uk = EXCLUDED.depart_uk,
                visible = EXCLUDED.visible,
                currency = EXCLUDED.currency,
                price_divisor = EXCLUDED.price_divisor,
                anomalies = EXCLUDED.anomalies,
                source_path = EXCLUDED.source_path,
                raw_payload = EXCLUDED.raw_payload,
                raw_checksum = EXCLUDED.raw_checksum,
                is_active = TRUE,
                updated_at = NOW()
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(record.instance_id.as_str())
        .bind(record.family_id.as_str())
        .bind(record.line_id.get())
        .bind(record.ship_id)
        .bind(&record.name)
        .bind(&record.voyage_code)
        .bind(&record.itinerary_code)
        .bind(record.sailing_date)
        .bind(record.return_date)
        .bind(record.nights)
        .bind(record.sail_nights)
        .bind(record.sea_days)
        .bind(record.embark_port_id)
        .bind(record.disembark_port_id)
        .bind(&record.region_ids)
        .bind(&record.port_ids)
        .bind(record.no_fly)
        .bind(record.depart_uk)
        .bind(record.visible)
        .bind(&record.currency)
        .bind(record.price_divisor)
        .bind(anomalies)
        .bind(&record.source_path)
        .bind(raw)
        .bind(checksum)
        .fetch_one(&mut *tx)
        .await?
        .try_get("inserted")?;

        let previous = previous_prices(&mut tx, record.instance_id.as_str()).await?;
        let prices = &record.prices;
        let code = |class: Option<&ClassPrice>| class.and_then(|p| p.price_code.clone());
        sqlx::query(
            r#"
            INSERT INTO price_quotes (
                instance_id, interior, interior_code, oceanview, oceanview_code,
                balcony, balcony_code, suite, suite_code, cheapest, currency, source, updated_at
            )
            VALUES ($1, $2::numeric, $3, $4::numeric, $5, $6::numeric, $7, $8::numeric, $9, $10::numeric, $11, $12, NOW())
            ON CONFLICT (instance_id) DO UPDATE SET
                interior = EXCLUDED.interior,
                interior_code = EXCLUDED.interior_code,
                oceanview = EXCLUDED.oceanview,
                oceanview_code = EXCLUDED.oceanview_code,
                balcony = EXCLUDED.balcony,
                balcony_code = EXCLUDED.balcony_code,
                suite = EXCLUDED.suite,
                suite_code = EXCLUDED.suite_code,
                cheapest = EXCLUDED.cheapest,
                currency = EXCLUDED.currency,
                source = EXCLUDED.source,
                updated_at = NOW()
            "#,
        )
        .bind(record.instance_id.as_str())
        .bind(prices.interior.as_ref().map(|p| p.amount))
        .bind(code(prices.interior.as_ref()))
        .bind(prices.oceanview.as_ref().map(|p| p.amount))
        .bind(code(prices.oceanview.as_ref()))
        .bind(prices.balcony.as_ref().map(|p| p.amount))
        .bind(code(prices.balcony.as_ref()))
        .bind(prices.suite.as_ref().map(|p| p.amount))
        .bind(code(prices.suite.as_ref()))
        .bind(prices.cheapest)
        .bind(&record.currency)
        .bind(prices.source.map(PriceSource::as_str))
        .execute(&mut *tx)
        .await?;

        for (field, old_amount, new_amount) in price_changes(previous.as_ref(), prices) {
            sqlx::query(
                r#"
                INSERT INTO price_history (instance_id, field, old_amount, new_amount)
                VALUES ($1, $2, $3::numeric, $4::numeric)
                "#,
            )
            .bind(record.instance_id.as_str())
            .bind(field)
            .bind(old_amount)
            .bind(new_amount)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(instance_id = %record.instance_id, inserted, "sailing upserted");
        Ok(if inserted {
            UpsertOutcome::Inserted
        } else {
            UpsertOutcome::Updated
        })
    }

    async fn sailing(&self, instance_id: &InstanceId) -> Result<Option<StoredSailing>, PersistError> {
        let sql = format!(
            "SELECT {SAILING_COLUMNS} FROM sailings s LEFT JOIN price_quotes q USING (instance_id) WHERE s.instance_id = $1"
        );
        let row = sqlx::query(&sql)
            .bind(instance_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(stored_from_row).transpose()
    }

    async fn stored_page(
        &self,
        after: Option<&InstanceId>,
        limit: usize,
    ) -> Result<Vec<StoredSailing>, PersistError> {
        let sql = format!(
            r#"
            SELECT {SAILING_COLUMNS}
              FROM sailings s LEFT JOIN price_quotes q USING (instance_id)
             WHERE s.raw_payload IS NOT NULL
               AND ($1::text IS NULL OR s.instance_id > $1)
             ORDER BY s.instance_id
             LIMIT $2
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(after.map(InstanceId::as_str))
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(stored_from_row).collect()
    }

    async fn stored_sample(&self, size: usize) -> Result<Vec<StoredSailing>, PersistError> {
        let sql = format!(
            r#"
            SELECT {SAILING_COLUMNS}
              FROM sailings s LEFT JOIN price_quotes q USING (instance_id)
             WHERE s.raw_payload IS NOT NULL
             ORDER BY random()
             LIMIT $1
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(i64::try_from(size).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(stored_from_row).collect()
    }

    async fn deactivate_before(&self, date: NaiveDate) -> Result<u64, PersistError> {
        let result = sqlx::query(
            r#"
            UPDATE sailings
               SET is_active = FALSE,
                   updated_at = NOW()
             WHERE is_active
               AND sailing_date < $1
            "#,
        )
        .bind(date)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn price_history(&self, instance_id: &InstanceId) -> Result<Vec<PriceChange>, PersistError> {
        let rows = sqlx::query(
            r#"
            SELECT field, old_amount::float8 AS old_amount, new_amount::float8 AS new_amount, recorded_at
              FROM price_history
             WHERE instance_id = $1
             ORDER BY id
            "#,
        )
        .bind(instance_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(PriceChange {
                    instance_id: instance_id.clone(),
                    field: row.try_get("field")?,
                    old_amount: row.try_get("old_amount")?,
                    new_amount: row.try_get("new_amount")?,
                    recorded_at: row.try_get("recorded_at")?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl CheckpointStore for PgStore {
    async fn load_checkpoint(&self, period: Period) -> Result<SyncCheckpoint, PersistError> {
        let header = sqlx::query(
            "SELECT status, last_file, updated_at FROM bulk_checkpoints WHERE year = $1 AND month = $2",
        )
        .bind(period.year)
        .bind(period.month as i32)
        .fetch_optional(&self.pool)
        .await?;
        let Some(header) = header else {
            return Ok(SyncCheckpoint::empty(period));
        };
        let status: String = header.try_get("status")?;
        let mut checkpoint = SyncCheckpoint {
            period,
            status: PeriodStatus::parse(&status)
                .ok_or_else(|| PersistError::ConstraintViolation(format!("unknown period status {status}")))?,
            attempted: Default::default(),
            last_file: header.try_get("last_file")?,
            updated_at: header.try_get("updated_at")?,
        };
        let files = sqlx::query(
            "SELECT path, failure_kind FROM bulk_checkpoint_files WHERE year = $1 AND month = $2",
        )
        .bind(period.year)
        .bind(period.month as i32)
        .fetch_all(&self.pool)
        .await?;
        for row in files {
            let path: String = row.try_get("path")?;
            let kind: Option<String> = row.try_get("failure_kind")?;
            checkpoint
                .attempted
                .insert(path, kind.as_deref().and_then(FailureKind::parse));
        }
        Ok(checkpoint)
    }

    async fn set_period_status(&self, period: Period, status: PeriodStatus) -> Result<(), PersistError> {
        sqlx::query(
            r#"
            INSERT INTO bulk_checkpoints (year, month, status, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (year, month) DO UPDATE
               SET status = EXCLUDED.status,
                   updated_at = NOW()
            "#,
        )
        .bind(period.year)
        .bind(period.month as i32)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_attempts(&self, period: Period, attempts: &[FileAttempt]) -> Result<(), PersistError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO bulk_checkpoints (year, month, status, last_file, updated_at)
            VALUES ($1, $2, 'processing', $3, NOW())
            ON CONFLICT (year, month) DO UPDATE
               SET last_file = COALESCE(EXCLUDED.last_file, bulk_checkpoints.last_file),
                   updated_at = NOW()
            "#,
        )
        .bind(period.year)
        .bind(period.month as i32)
        .bind(attempts.last().map(|a| a.path.as_str()))
        .execute(&mut *tx)
        .await?;
        for attempt in attempts {
            sqlx::query(
                r#"
                INSERT INTO bulk_checkpoint_files (year, month, path, failure_kind)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (year, month, path) DO UPDATE
                   SET failure_kind = EXCLUDED.failure_kind,
                       attempted_at = NOW()
                "#,
            )
            .bind(period.year)
            .bind(period.month as i32)
            .bind(&attempt.path)
            .bind(attempt.failure.map(FailureKind::as_str))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn reset_checkpoint(&self, period: Period) -> Result<(), PersistError> {
        sqlx::query("DELETE FROM bulk_checkpoints WHERE year = $1 AND month = $2")
            .bind(period.year)
            .bind(period.month as i32)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn forget_failed(&self, period: Period) -> Result<u64, PersistError> {
        let mut tx = self.pool.begin().await?;
        let forgotten = sqlx::query(
            r#"
            DELETE FROM bulk_checkpoint_files
             WHERE year = $1 AND month = $2 AND failure_kind IS NOT NULL
            "#,
        )
        .bind(period.year)
        .bind(period.month as i32)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if forgotten > 0 {
            sqlx::query(
                "UPDATE bulk_checkpoints SET status = 'pending', updated_at = NOW() WHERE year = $1 AND month = $2",
            )
            .bind(period.year)
            .bind(period.month as i32)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(forgotten)
    }
}

#[async_trait]
impl JobQueue for PgStore {
    async fn enqueue(&self, job: &WebhookJob) -> Result<(), PersistError> {
        sqlx::query(
            r#"
            INSERT INTO webhook_jobs (id, line_id, status, received_at, available_at, attempts)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(job.id)
        .bind(job.line_id.get())
        .bind(job.status.as_str())
        .bind(job.received_at)
        .bind(job.available_at)
        .bind(job.attempts)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn claim_next(&self, worker_id: &str, now: DateTime<Utc>) -> Result<Option<WebhookJob>, PersistError> {
        let sql = format!(
            r#"
            WITH next AS (
                SELECT id
                  FROM webhook_jobs
                 WHERE status = 'pending'
                   AND available_at <= $2
                 ORDER BY available_at, received_at
                 LIMIT 1
                   FOR UPDATE SKIP LOCKED
            )
            UPDATE webhook_jobs j
               SET status = 'active',
                   started_at = $2,
                   attempts = j.attempts + 1,
                   worker_id = $1
              FROM next
             WHERE j.id = next.id
            RETURNING {}
            "#,
            JOB_COLUMNS
                .split(',')
                .map(|c| format!("j.{}", c.trim()))
                .collect::<Vec<_>>()
                .join(", ")
        );
        let row = sqlx::query(&sql)
            .bind(worker_id)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn requeue(&self, id: Uuid, available_at: DateTime<Utc>, reason: &str) -> Result<(), PersistError> {
        sqlx::query(
            r#"
            UPDATE webhook_jobs
               SET status = 'pending',
                   available_at = $2,
                   worker_id = NULL,
                   error = $3
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(available_at)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn complete(&self, id: Uuid, counters: &RunCounters) -> Result<(), PersistError> {
        sqlx::query(
            r#"
            UPDATE webhook_jobs
               SET status = 'done',
                   finished_at = NOW(),
                   counters = $2,
                   error = NULL
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(counters_json(counters))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail(&self, id: Uuid, error: &str, counters: Option<&RunCounters>) -> Result<(), PersistError> {
        sqlx::query(
            r#"
            UPDATE webhook_jobs
               SET status = 'failed',
                   finished_at = NOW(),
                   counters = $3,
                   error = $2
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(counters.map(counters_json))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn job(&self, id: Uuid) -> Result<Option<WebhookJob>, PersistError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM webhook_jobs WHERE id = $1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn purge_finished_before(&self, cutoff: DateTime<Utc>) -> Result<u64, PersistError> {
        let result = sqlx::query(
            "DELETE FROM webhook_jobs WHERE status IN ('done', 'failed') AND finished_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn reset_stale_active(&self, started_before: DateTime<Utc>) -> Result<u64, PersistError> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_jobs
               SET status = 'pending',
                   worker_id = NULL,
                   available_at = NOW()
             WHERE status = 'active'
               AND started_at < $1
            "#,
        )
        .bind(started_before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl LineLocks for PgStore {
    async fn try_acquire(&self, line_id: LineId, owner: &str, ttl: Duration) -> Result<bool, PersistError> {
        let row = sqlx::query(
            r#"
            INSERT INTO line_locks (line_id, owner, acquired_at, expires_at)
            VALUES ($1, $2, NOW(), NOW() + make_interval(secs => $3))
            ON CONFLICT (line_id) DO UPDATE
               SET owner = EXCLUDED.owner,
                   acquired_at = EXCLUDED.acquired_at,
                   expires_at = EXCLUDED.expires_at
             WHERE line_locks.expires_at <= NOW()
            RETURNING owner
            "#,
        )
        .bind(line_id.get())
        .bind(owner)
        .bind(ttl.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn renew(&self, line_id: LineId, owner: &str, ttl: Duration) -> Result<bool, PersistError> {
        let result = sqlx::query(
            r#"
            UPDATE line_locks
               SET expires_at = NOW() + make_interval(secs => $3)
             WHERE line_id = $1 AND owner = $2
            "#,
        )
        .bind(line_id.get())
        .bind(owner)
        .bind(ttl.as_secs_f64())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release(&self, line_id: LineId, owner: &str) -> Result<(), PersistError> {
        sqlx::query("DELETE FROM line_locks WHERE line_id = $1 AND owner = $2")
            .bind(line_id.get())
            .bind(owner)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn force_clear(&self, line_id: LineId) -> Result<bool, PersistError> {
        let result = sqlx::query("DELETE FROM line_locks WHERE line_id = $1")
            .bind(line_id.get())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl ModeStore for PgStore {
    async fn mode(&self) -> Result<PipelineModeRecord, PersistError> {
        let row = sqlx::query("SELECT mode, reason, updated_at FROM pipeline_mode WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(PipelineModeRecord {
                mode: PipelineMode::Active,
                reason: None,
                updated_at: Utc::now(),
            });
        };
        mode_from_row(&row)
    }

    async fn set_mode(&self, mode: PipelineMode, reason: Option<&str>) -> Result<PipelineModeRecord, PersistError> {
        let row = sqlx::query(
            r#"
            INSERT INTO pipeline_mode (id, mode, reason, updated_at)
            VALUES (1, $1, $2, NOW())
            ON CONFLICT (id) DO UPDATE
               SET mode = EXCLUDED.mode,
                   reason = EXCLUDED.reason,
                   updated_at = NOW()
            RETURNING mode, reason, updated_at
            "#,
        )
        .bind(mode.as_str())
        .bind(reason)
        .fetch_one(&self.pool)
        .await?;
        mode_from_row(&row)
    }
}

fn mode_from_row(row: &PgRow) -> Result<PipelineModeRecord, PersistError> {
    let mode: String = row.try_get("mode")?;
    Ok(PipelineModeRecord {
        mode: PipelineMode::parse(&mode)
            .ok_or_else(|| PersistError::ConstraintViolation(format!("unknown pipeline mode {mode}")))?,
        reason: row.try_get("reason")?,
        updated_at: row.try_get("updated_at")?,
    })
}

use crate::error::AppError;
use crate::model::{MeterKind, MeterSnapshot, PowerBatch};
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, Pool, Postgres};

pub type DbPool = Pool<Postgres>;

pub async fn connect(url: &str, max_connections: u32) -> Result<DbPool, AppError> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(url)
        .await?;
    Ok(pool)
}

const POWER_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS power_readings (
    ts TIMESTAMPTZ NOT NULL,
    device TEXT NOT NULL,
    appliance TEXT NOT NULL,
    power_watts DOUBLE PRECISION NOT NULL,
    measurement_timestamp TEXT,
    module_id TEXT,
    meter_id TEXT,
    tariff TEXT,
    peak_watts DOUBLE PRECISION,
    offpeak_watts DOUBLE PRECISION
)"#;

const METER_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS meter_readings (
    ts TIMESTAMPTZ NOT NULL,
    collection_date DATE NOT NULL,
    gas_consumed DOUBLE PRECISION,
    electricity_consumed_peak DOUBLE PRECISION,
    electricity_consumed_offpeak DOUBLE PRECISION,
    electricity_produced_peak DOUBLE PRECISION,
    electricity_produced_offpeak DOUBLE PRECISION,
    electricity_total_consumed DOUBLE PRECISION,
    electricity_total_produced DOUBLE PRECISION,
    electricity_net_consumed DOUBLE PRECISION
)"#;

pub async fn ensure_schema(pool: &DbPool) -> Result<(), AppError> {
    sqlx::query(POWER_TABLE).execute(pool).await?;
    sqlx::query(METER_TABLE).execute(pool).await?;
    Ok(())
}

const POWER_COLUMNS: [&str; 10] = [
    "ts",
    "device",
    "appliance",
    "power_watts",
    "measurement_timestamp",
    "module_id",
    "meter_id",
    "tariff",
    "peak_watts",
    "offpeak_watts",
];

/// Placeholder tuples `($1, $2, ..), ($n+1, ..)` for `rows` rows of `cols` columns.
fn placeholders(rows: usize, cols: usize) -> String {
    (0..rows)
        .map(|r| {
            let tuple: Vec<String> = (1..=cols).map(|c| format!("${}", r * cols + c)).collect();
            format!("({})", tuple.join(", "))
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Insert every reading of the batch in a single statement.
pub async fn insert_power_batch(pool: &DbPool, batch: &PowerBatch) -> Result<u64, AppError> {
    if batch.is_empty() {
        return Ok(0);
    }
    let sql = format!(
        "INSERT INTO power_readings ({}) VALUES {}",
        POWER_COLUMNS.join(", "),
        placeholders(batch.len(), POWER_COLUMNS.len())
    );
    let ts: DateTime<Utc> = batch.collected_at.with_timezone(&Utc);

    let mut q = sqlx::query(&sql);
    for r in batch.readings() {
        q = q
            .bind(ts)
            .bind(r.device_name.as_str())
            .bind(r.appliance_name.as_str())
            .bind(r.power_watts)
            .bind(r.measurement_timestamp.as_str())
            .bind(r.module_id.as_str())
            .bind(r.meter_id.as_str())
            .bind(r.tariff.map(|t| t.as_str()))
            .bind(r.peak_watts)
            .bind(r.offpeak_watts);
    }
    let result = q.execute(pool).await?;
    Ok(result.rows_affected())
}

pub async fn insert_meter_snapshot(pool: &DbPool, snapshot: &MeterSnapshot) -> Result<(), AppError> {
    let mut columns = vec!["ts", "collection_date"];
    columns.extend(MeterKind::ALL.iter().map(|k| k.as_str()));
    let sql = format!(
        "INSERT INTO meter_readings ({}) VALUES {}",
        columns.join(", "),
        placeholders(1, columns.len())
    );

    let mut q = sqlx::query(&sql)
        .bind(snapshot.collection_timestamp.with_timezone(&Utc))
        .bind(snapshot.collection_date);
    for kind in MeterKind::ALL {
        q = q.bind(snapshot.value(kind));
    }
    q.execute(pool).await?;
    Ok(())
}

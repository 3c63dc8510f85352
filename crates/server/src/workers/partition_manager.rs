//! Daily partition maintenance on the telemetry history table.
//!
//! Keeps the window `[today - retention, today + horizon]` of daily
//! partitions present: future partitions are created ahead of need and
//! partitions past retention are dropped. Partition names encode their date
//! so drop candidates come straight from the catalog.

use chrono::{Datelike, Duration as ChronoDuration, NaiveDate, NaiveTime, Utc};
use sqlx::{PgPool, Row};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::metrics::PARTITION_OPS;
use crate::state::AppState;

/// Maintenance runs daily at this wall-clock hour.
const RUN_AT_HOUR: u32 = 2;

pub fn spawn(state: AppState, mut shutdown: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let retention = state.config.retention_days;
        let horizon = state.config.horizon_days;
        info!(retention, horizon, "partition manager started");

        // Run once at startup so a fresh deployment has a hot window.
        manage(&state.db, Utc::now().date_naive(), retention, horizon).await;

        loop {
            let wait = until_next_run(Utc::now().naive_utc());
            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    manage(&state.db, Utc::now().date_naive(), retention, horizon).await;
                }
                _ = shutdown.changed() => {
                    info!("partition manager stopped");
                    return;
                }
            }
        }
    });
}

fn until_next_run(now: chrono::NaiveDateTime) -> std::time::Duration {
    let run_time = NaiveTime::from_hms_opt(RUN_AT_HOUR, 0, 0).expect("valid time");
    let mut next = now.date().and_time(run_time);
    if next <= now {
        next += ChronoDuration::days(1);
    }
    (next - now).to_std().unwrap_or_default()
}

async fn manage(pool: &PgPool, today: NaiveDate, retention_days: u32, horizon_days: u32) {
    if let Err(e) = create_window(pool, today, horizon_days).await {
        warn!(error = %e, "partition creation failed");
    }
    if let Err(e) = drop_expired(pool, today, retention_days).await {
        warn!(error = %e, "partition drop failed");
    }
}

/// Idempotently create daily partitions for `[today, today + horizon]`.
async fn create_window(pool: &PgPool, today: NaiveDate, horizon_days: u32) -> sqlx::Result<()> {
    for offset in 0..=i64::from(horizon_days) {
        let date = today + ChronoDuration::days(offset);
        let name = partition_name(date);
        let next = date + ChronoDuration::days(1);
        // DDL cannot take bind parameters; every interpolated value is
        // derived from a date, never from input.
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {name} PARTITION OF telemetry \
             FOR VALUES FROM ('{date}') TO ('{next}')"
        );
        sqlx::query(&ddl).execute(pool).await?;
        PARTITION_OPS.with_label_values(&["create"]).inc();
    }
    info!(horizon_days, "telemetry partition window ensured");
    Ok(())
}

/// Drop partitions whose encoded date has left the retention window.
async fn drop_expired(pool: &PgPool, today: NaiveDate, retention_days: u32) -> sqlx::Result<()> {
    let cutoff = today - ChronoDuration::days(i64::from(retention_days));

    let rows = sqlx::query(
        "SELECT child.relname AS partition_name \
         FROM pg_inherits \
         JOIN pg_class parent ON pg_inherits.inhparent = parent.oid \
         JOIN pg_class child ON pg_inherits.inhrelid = child.oid \
         WHERE parent.relname = 'telemetry'",
    )
    .fetch_all(pool)
    .await?;

    for row in rows {
        let name: String = row.try_get("partition_name")?;
        let Some(date) = parse_partition_date(&name) else {
            continue;
        };
        if date < cutoff {
            sqlx::query(&format!("DROP TABLE IF EXISTS {name}"))
                .execute(pool)
                .await?;
            PARTITION_OPS.with_label_values(&["drop"]).inc();
            info!(partition = %name, "dropped partition past retention");
        }
    }
    Ok(())
}

pub fn partition_name(date: NaiveDate) -> String {
    format!(
        "telemetry_y{:04}m{:02}d{:02}",
        date.year(),
        date.month(),
        date.day()
    )
}

pub fn parse_partition_date(name: &str) -> Option<NaiveDate> {
    // telemetry_yYYYYmMMdDD
    let rest = name.strip_prefix("telemetry_y")?;
    if rest.len() != 10 || rest.get(4..5)? != "m" || rest.get(7..8)? != "d" {
        return None;
    }
    let year: i32 = rest.get(0..4)?.parse().ok()?;
    let month: u32 = rest.get(5..7)?.parse().ok()?;
    let day: u32 = rest.get(8..10)?.parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, NaiveDateTime, NaiveTime};

    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    #[test]
    fn partition_names_encode_the_date() {
        assert_eq!(partition_name(date(2026, 8, 2)), "telemetry_y2026m08d02");
        assert_eq!(partition_name(date(2026, 12, 31)), "telemetry_y2026m12d31");
    }

    #[test]
    fn names_round_trip_through_parse() {
        for d in [date(2026, 1, 1), date(2026, 8, 2), date(2030, 12, 31)] {
            assert_eq!(parse_partition_date(&partition_name(d)), Some(d));
        }
    }

    #[test]
    fn parse_rejects_foreign_names() {
        assert_eq!(parse_partition_date("telemetry_latest"), None);
        assert_eq!(parse_partition_date("telemetry_y2026m13d01"), None);
        assert_eq!(parse_partition_date("telemetry_y2026m08"), None);
        assert_eq!(parse_partition_date("other_y2026m08d02"), None);
    }

    #[test]
    fn next_run_is_at_the_configured_hour() {
        let before = NaiveDateTime::new(
            date(2026, 8, 2),
            NaiveTime::from_hms_opt(1, 0, 0).expect("time"),
        );
        assert_eq!(until_next_run(before), std::time::Duration::from_secs(3600));

        let after = NaiveDateTime::new(
            date(2026, 8, 2),
            NaiveTime::from_hms_opt(3, 0, 0).expect("time"),
        );
        assert_eq!(
            until_next_run(after),
            std::time::Duration::from_secs(23 * 3600)
        );
    }
}

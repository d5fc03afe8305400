//! Append-only reading persistence: batched writes, latest/history
//! queries, a streaming CSV export, aggregate stats, and a bulk-delete
//! primitive for an external retention task.

use bytes::Bytes;
use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::db::Db;
use crate::error::StoreError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReadingStatus {
    Ok,
    Stale,
    Err,
}

impl ReadingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadingStatus::Ok => "OK",
            ReadingStatus::Stale => "Stale",
            ReadingStatus::Err => "Err",
        }
    }
}

impl std::str::FromStr for ReadingStatus {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, <Self as std::str::FromStr>::Err> {
        match s {
            "OK" => Ok(ReadingStatus::Ok),
            "Stale" => Ok(ReadingStatus::Stale),
            "Err" => Ok(ReadingStatus::Err),
            other => Err(anyhow::anyhow!("unknown reading status {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reading {
    pub id: Option<i64>,
    pub device_id: i64,
    pub device_name: String,
    #[serde(serialize_with = "serialize_ts_no_offset")]
    pub timestamp: DateTime<Utc>,
    pub value: Option<f32>,
    pub ambient_temp: Option<f32>,
    pub status: ReadingStatus,
    pub raw_hex: Option<String>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReadingStats {
    pub total_count: i64,
    pub earliest: Option<DateTime<Utc>>,
    pub latest: Option<DateTime<Utc>>,
}

fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S%.6f").to_string()
}

fn parse_ts(raw: &str) -> anyhow::Result<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f"))?;
    Ok(DateTime::from_naive_utc_and_offset(naive, Utc))
}

/// JSON responses use no timezone suffix, unlike the internal storage
/// format (a space separator) and the CSV export format (no fractional
/// seconds) — three distinct textual shapes for the same instant.
fn serialize_ts_no_offset<S>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&ts.format("%Y-%m-%dT%H:%M:%S%.6f").to_string())
}

/// A busy or locked SQLite connection is worth retrying; anything else
/// (a schema mismatch, a constraint violation) will fail identically on
/// every subsequent attempt.
fn classify(err: rusqlite::Error) -> StoreError {
    match &err {
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ) =>
        {
            StoreError::Transient(err.to_string())
        }
        _ => StoreError::Storage(err),
    }
}

#[derive(Clone)]
pub struct ReadingStore {
    db: Db,
}

impl ReadingStore {
    pub fn new(db: Db) -> Self {
        ReadingStore { db }
    }

    /// Insert a batch of readings in a single transaction. Fails atomically
    /// on any error — the caller (the Write-Back Buffer) decides whether to
    /// retry the whole slot.
    pub async fn append_batch(&self, records: Vec<Reading>) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }
        self.db
            .with_conn(move |conn| -> rusqlite::Result<()> {
                let tx = conn.unchecked_transaction()?;
                {
                    let mut stmt = tx.prepare_cached(
                        "INSERT INTO readings
                         (device_id, device_name, timestamp_utc, value, ambient_temp,
                          status, raw_hex, error_message)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    )?;
                    for r in &records {
                        stmt.execute(params![
                            r.device_id,
                            r.device_name,
                            fmt_ts(r.timestamp),
                            r.value,
                            r.ambient_temp,
                            r.status.as_str(),
                            r.raw_hex,
                            r.error_message,
                        ])?;
                    }
                }
                tx.commit()
            })
            .await
            .map_err(classify)
    }

    pub async fn latest(&self) -> Result<Vec<Reading>, StoreError> {
        self.db
            .with_conn(|conn| -> rusqlite::Result<Vec<Reading>> {
                let mut stmt = conn.prepare(
                    "SELECT r.* FROM readings r
                     INNER JOIN (
                         SELECT device_id, MAX(timestamp_utc) AS max_ts
                         FROM readings GROUP BY device_id
                     ) latest ON r.device_id = latest.device_id AND r.timestamp_utc = latest.max_ts
                     ORDER BY r.device_id",
                )?;
                let rows = stmt.query_map([], row_to_reading)?;
                rows.collect()
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn history(
        &self,
        device_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: Option<i64>,
    ) -> Result<Vec<Reading>, StoreError> {
        let start = fmt_ts(start);
        let end = fmt_ts(end);
        self.db
            .with_conn(move |conn| -> rusqlite::Result<Vec<Reading>> {
                let sql = "SELECT * FROM readings WHERE device_id = ?1 AND timestamp_utc >= ?2
                           AND timestamp_utc <= ?3 ORDER BY timestamp_utc ASC LIMIT ?4";
                let mut stmt = conn.prepare(sql)?;
                let rows =
                    stmt.query_map(params![device_id, start, end, limit.unwrap_or(i64::MAX)], row_to_reading)?;
                rows.collect()
            })
            .await
            .map_err(StoreError::from)
    }

    /// Stream the CSV export as `Bytes` chunks so the HTTP layer never has
    /// to materialise the full body for a large range.
    pub fn export_csv_stream(
        &self,
        device_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> flume::Receiver<Result<Bytes, std::io::Error>> {
        let (tx, rx) = flume::bounded(8);
        let db = self.db.clone();
        let start_s = fmt_ts(start);
        let end_s = fmt_ts(end);

        tokio::spawn(async move {
            let result = db
                .with_conn(move |conn| -> rusqlite::Result<Vec<(i64, Reading)>> {
                    let mut stmt = conn.prepare(
                        "SELECT * FROM readings WHERE device_id = ?1 AND timestamp_utc >= ?2
                         AND timestamp_utc <= ?3 ORDER BY timestamp_utc ASC",
                    )?;
                    let rows = stmt.query_map(params![device_id, start_s, end_s], row_to_reading)?;
                    let mut out = Vec::new();
                    for (i, row) in rows.enumerate() {
                        out.push((i as i64 + 1, row?));
                    }
                    Ok(out)
                })
                .await;

            match result {
                Ok(rows) => {
                    let header = Bytes::from_static(b"sr_no,timestamp,temperature,ambient_temp,status\n");
                    if tx.send_async(Ok(header)).await.is_err() {
                        return;
                    }
                    for (sr_no, r) in rows {
                        let line = format!(
                            "{},{},{},{},{}\n",
                            sr_no,
                            r.timestamp.format("%Y-%m-%d %H:%M:%S"),
                            r.value.map(|v| v.to_string()).unwrap_or_default(),
                            r.ambient_temp.map(|v| v.to_string()).unwrap_or_default(),
                            r.status.as_str(),
                        );
                        if tx.send_async(Ok(Bytes::from(line))).await.is_err() {
                            return;
                        }
                    }
                }
                Err(err) => {
                    let _ = tx
                        .send_async(Err(std::io::Error::other(err.to_string())))
                        .await;
                }
            }
        });

        rx
    }

    pub async fn stats(&self) -> Result<ReadingStats, StoreError> {
        self.db
            .with_conn(|conn| -> rusqlite::Result<ReadingStats> {
                conn.query_row(
                    "SELECT COUNT(*), MIN(timestamp_utc), MAX(timestamp_utc) FROM readings",
                    [],
                    |row| {
                        let total: i64 = row.get(0)?;
                        let earliest: Option<String> = row.get(1)?;
                        let latest: Option<String> = row.get(2)?;
                        Ok(ReadingStats {
                            total_count: total,
                            earliest: earliest.and_then(|s| parse_ts(&s).ok()),
                            latest: latest.and_then(|s| parse_ts(&s).ok()),
                        })
                    },
                )
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn delete_all(&self) -> Result<usize, StoreError> {
        self.db
            .with_conn(|conn| conn.execute("DELETE FROM readings", []))
            .await
            .map_err(StoreError::from)
    }

    /// Delete readings older than `horizon`. Used by an external retention
    /// task per §9's design note; not invoked by any in-core component.
    pub async fn delete_older_than(&self, horizon: DateTime<Utc>) -> Result<usize, StoreError> {
        let horizon_s = fmt_ts(horizon);
        self.db
            .with_conn(move |conn| {
                conn.execute(
                    "DELETE FROM readings WHERE timestamp_utc < ?1",
                    params![horizon_s],
                )
            })
            .await
            .map_err(StoreError::from)
    }
}

fn row_to_reading(row: &rusqlite::Row) -> rusqlite::Result<Reading> {
    let ts_raw: String = row.get("timestamp_utc")?;
    let status_raw: String = row.get("status")?;
    Ok(Reading {
        id: row.get("id")?,
        device_id: row.get("device_id")?,
        device_name: row.get("device_name")?,
        timestamp: parse_ts(&ts_raw).unwrap_or_else(|_| Utc::now()),
        value: row.get("value")?,
        ambient_temp: row.get("ambient_temp")?,
        status: status_raw.parse().unwrap_or(ReadingStatus::Err),
        raw_hex: row.get("raw_hex")?,
        error_message: row.get("error_message")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn sample(device_id: i64, ts: DateTime<Utc>, value: f32) -> Reading {
        Reading {
            id: None,
            device_id,
            device_name: "probe-1".into(),
            timestamp: ts,
            value: Some(value),
            ambient_temp: None,
            status: ReadingStatus::Ok,
            raw_hex: Some("0102".into()),
            error_message: None,
        }
    }

    #[tokio::test]
    async fn append_then_history_round_trips() {
        let store = ReadingStore::new(Db::open_in_memory().unwrap());
        let t0 = Utc::now();
        store
            .append_batch(vec![sample(1, t0, 30.0), sample(1, t0 + chrono::Duration::seconds(1), 31.0)])
            .await
            .unwrap();
        let rows = store
            .history(1, t0 - chrono::Duration::seconds(1), t0 + chrono::Duration::seconds(10), None)
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].value, Some(30.0));
    }

    #[tokio::test]
    async fn csv_export_row_count_matches_history() {
        let store = ReadingStore::new(Db::open_in_memory().unwrap());
        let t0 = Utc::now();
        let mut batch = Vec::new();
        for i in 0..25 {
            batch.push(sample(7, t0 + chrono::Duration::seconds(i), 20.0 + i as f32));
        }
        store.append_batch(batch).await.unwrap();

        let start = t0 - chrono::Duration::seconds(1);
        let end = t0 + chrono::Duration::seconds(100);
        let history = store.history(7, start, end, None).await.unwrap();

        let rx = store.export_csv_stream(7, start, end);
        let mut body = Vec::new();
        let mut stream = rx.into_stream();
        while let Some(chunk) = stream.next().await {
            body.extend_from_slice(&chunk.unwrap());
        }
        let text = String::from_utf8(body).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), history.len() + 1);
        assert_eq!(lines[0], "sr_no,timestamp,temperature,ambient_temp,status");
    }

    #[tokio::test]
    async fn stats_reports_total_count() {
        let store = ReadingStore::new(Db::open_in_memory().unwrap());
        store.append_batch(vec![sample(1, Utc::now(), 20.0)]).await.unwrap();
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total_count, 1);
    }

    #[test]
    fn json_timestamp_has_no_timezone_suffix() {
        let ts = DateTime::parse_from_rfc3339("2026-08-01T12:34:56.789012Z")
            .unwrap()
            .with_timezone(&Utc);
        let reading = sample(1, ts, 20.0);
        let json = serde_json::to_value(&reading).unwrap();
        let formatted = json["timestamp"].as_str().unwrap();
        assert_eq!(formatted, "2026-08-01T12:34:56.789012");
    }

    #[test]
    fn busy_sqlite_error_is_classified_transient() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error {
                code: rusqlite::ErrorCode::DatabaseBusy,
                extended_code: rusqlite::ffi::SQLITE_BUSY,
            },
            None,
        );
        assert!(matches!(classify(err), StoreError::Transient(_)));
    }

    #[test]
    fn constraint_sqlite_error_is_classified_permanent() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error {
                code: rusqlite::ErrorCode::ConstraintViolation,
                extended_code: rusqlite::ffi::SQLITE_CONSTRAINT,
            },
            None,
        );
        assert!(matches!(classify(err), StoreError::Storage(_)));
    }

    #[tokio::test]
    async fn delete_all_clears_table() {
        let store = ReadingStore::new(Db::open_in_memory().unwrap());
        store.append_batch(vec![sample(1, Utc::now(), 20.0)]).await.unwrap();
        let deleted = store.delete_all().await.unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.stats().await.unwrap().total_count, 0);
    }
}

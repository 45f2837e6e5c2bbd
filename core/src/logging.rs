use rusqlite::{params, Connection};
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::db::DbPool;

/// Write one row to `event_log` and mirror it to the `log` facade.
///
/// `data` must never contain credentials; callers pass identifiers only.
pub fn log_event(
    conn: &Connection,
    level: &str,
    code: Option<&str>,
    module: &str,
    message: &str,
    explain: Option<&str>,
    data: Option<Value>,
) -> rusqlite::Result<()> {
    let log_level = match level {
        "error" => log::Level::Error,
        "warn" => log::Level::Warn,
        "debug" => log::Level::Debug,
        _ => log::Level::Info,
    };
    log::log!(target: module, log_level, "[{}] {}", code.unwrap_or("-"), message);

    let id = Uuid::new_v4().to_string();
    let ts = OffsetDateTime::now_utc().unix_timestamp();
    let data_str = data.map(|v| v.to_string());
    conn.execute(
        "INSERT INTO event_log (id, ts, level, code, module, message, explain, data) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![id, ts, level, code, module, message, explain, data_str],
    )?;
    Ok(())
}

/// Record an event from async code without blocking the caller.
///
/// Failures to persist are reported through `log` only.
pub fn spawn_event(
    pool: &DbPool,
    level: &'static str,
    code: &'static str,
    module: &'static str,
    message: String,
    data: Value,
) {
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || {
        let conn = match pool.get() {
            Ok(conn) => conn,
            Err(err) => {
                log::error!(target: module, "event log unavailable: {err}");
                return;
            }
        };
        if let Err(err) = log_event(&conn, level, Some(code), module, &message, None, Some(data)) {
            log::error!(target: module, "failed to persist event {code}: {err}");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_event_persists_row() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(include_str!(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/../migrations/0001_init.sql"
        )))
        .unwrap();
        log_event(
            &conn,
            "warn",
            Some("AI-0101"),
            "ai.registry",
            "default changed",
            None,
            Some(serde_json::json!({ "config_id": "abc" })),
        )
        .unwrap();
        let (level, data): (String, String) = conn
            .query_row("SELECT level, data FROM event_log", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .unwrap();
        assert_eq!(level, "warn");
        assert!(data.contains("abc"));
    }
}

//! Append-only completion metering and windowed aggregates.

use std::collections::BTreeMap;

use rusqlite::params;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::db::DbPool;
use crate::errors::{AiError, AiResult};

const SECONDS_PER_DAY: i64 = 86_400;
const UNSPECIFIED_MODEL: &str = "unspecified";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageEntry {
    pub owner_id: String,
    pub provider: String,
    pub model_name: Option<String>,
    pub usage_type: String,
    pub tokens_used: u64,
    pub cost: f64,
}

impl UsageEntry {
    pub fn chat(owner_id: &str, provider: &str, model_name: Option<&str>, tokens_used: u64) -> Self {
        Self {
            owner_id: owner_id.to_string(),
            provider: provider.to_string(),
            model_name: model_name.map(str::to_string),
            usage_type: "chat".into(),
            tokens_used,
            cost: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageRecord {
    pub log_id: String,
    pub owner_id: String,
    pub provider: String,
    pub model_name: Option<String>,
    pub usage_type: String,
    pub tokens_used: u64,
    pub cost: f64,
    pub created_at: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UsageBucket {
    pub count: u64,
    pub tokens: u64,
    pub cost: f64,
}

impl UsageBucket {
    fn add(&mut self, tokens: u64, cost: f64) {
        self.count += 1;
        self.tokens += tokens;
        self.cost += cost;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UsageStats {
    pub window_days: u32,
    pub total_count: u64,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub by_provider: BTreeMap<String, UsageBucket>,
    pub by_model: BTreeMap<String, UsageBucket>,
    pub by_type: BTreeMap<String, UsageBucket>,
}

#[derive(Clone)]
pub struct UsageMeter {
    pool: DbPool,
}

impl UsageMeter {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn log_usage(&self, entry: &UsageEntry) -> AiResult<String> {
        if entry.owner_id.trim().is_empty() {
            return Err(AiError::InvalidRequest("usage owner must not be empty".into()));
        }
        if entry.usage_type.trim().is_empty() {
            return Err(AiError::InvalidRequest("usage type must not be empty".into()));
        }
        if !entry.cost.is_finite() || entry.cost < 0.0 {
            return Err(AiError::InvalidRequest(format!(
                "usage cost must be a non-negative number, got {}",
                entry.cost
            )));
        }
        let tokens = i64::try_from(entry.tokens_used)
            .map_err(|_| AiError::InvalidRequest("token count out of range".into()))?;

        let log_id = Uuid::new_v4().to_string();
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO ai_usage_logs (log_id, owner_id, provider, model_name, usage_type, tokens_used, cost, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                log_id,
                entry.owner_id,
                entry.provider,
                entry.model_name,
                entry.usage_type,
                tokens,
                entry.cost,
                OffsetDateTime::now_utc().unix_timestamp(),
            ],
        )?;
        log::debug!(
            target: "ai.usage",
            "recorded {} tokens of {} usage for {}",
            entry.tokens_used,
            entry.usage_type,
            entry.provider
        );
        Ok(log_id)
    }

    /// Aggregates rows created within the last `window_days` days.
    pub fn get_usage_stats(&self, owner: &str, window_days: u32) -> AiResult<UsageStats> {
        let since = OffsetDateTime::now_utc().unix_timestamp() - i64::from(window_days) * SECONDS_PER_DAY;
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT provider, model_name, usage_type, tokens_used, cost
             FROM ai_usage_logs
             WHERE owner_id = ?1 AND created_at >= ?2",
        )?;
        let rows = stmt.query_map(params![owner, since], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, f64>(4)?,
            ))
        })?;

        let mut stats = UsageStats {
            window_days,
            ..UsageStats::default()
        };
        for row in rows {
            let (provider, model, usage_type, tokens, cost) = row?;
            let tokens = tokens.max(0) as u64;
            stats.total_count += 1;
            stats.total_tokens += tokens;
            stats.total_cost += cost;
            stats.by_provider.entry(provider).or_default().add(tokens, cost);
            stats
                .by_model
                .entry(model.unwrap_or_else(|| UNSPECIFIED_MODEL.to_string()))
                .or_default()
                .add(tokens, cost);
            stats.by_type.entry(usage_type).or_default().add(tokens, cost);
        }
        Ok(stats)
    }

    pub fn recent_usage(&self, owner: &str, limit: usize) -> AiResult<Vec<UsageRecord>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT log_id, owner_id, provider, model_name, usage_type, tokens_used, cost, created_at
             FROM ai_usage_logs
             WHERE owner_id = ?1
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![owner, limit as i64], |row| {
            Ok(UsageRecord {
                log_id: row.get(0)?,
                owner_id: row.get(1)?,
                provider: row.get(2)?,
                model_name: row.get(3)?,
                usage_type: row.get(4)?,
                tokens_used: row.get::<_, i64>(5)?.max(0) as u64,
                cost: row.get(6)?,
                created_at: row.get(7)?,
            })
        })?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::temp_pool;
    use pretty_assertions::assert_eq;

    #[test]
    fn aggregates_tokens_and_counts() {
        let (_dir, pool) = temp_pool();
        let meter = UsageMeter::new(pool);
        for tokens in [10, 20, 30] {
            meter
                .log_usage(&UsageEntry::chat("m1", "openai", Some("gpt-4o-mini"), tokens))
                .unwrap();
        }
        meter
            .log_usage(&UsageEntry::chat("someone-else", "openai", None, 500))
            .unwrap();

        let stats = meter.get_usage_stats("m1", 30).unwrap();
        assert_eq!(stats.total_count, 3);
        assert_eq!(stats.total_tokens, 60);
        assert_eq!(
            stats.by_provider.get("openai"),
            Some(&UsageBucket {
                count: 3,
                tokens: 60,
                cost: 0.0
            })
        );
        assert_eq!(stats.by_type["chat"].count, 3);
    }

    #[test]
    fn missing_model_is_grouped_as_unspecified() {
        let (_dir, pool) = temp_pool();
        let meter = UsageMeter::new(pool);
        let mut entry = UsageEntry::chat("m1", "ollama", None, 7);
        entry.usage_type = "test".into();
        entry.cost = 0.25;
        meter.log_usage(&entry).unwrap();

        let stats = meter.get_usage_stats("m1", 1).unwrap();
        assert_eq!(stats.by_model["unspecified"].tokens, 7);
        assert_eq!(stats.by_type["test"].cost, 0.25);
        assert_eq!(stats.total_cost, 0.25);
    }

    #[test]
    fn rows_outside_the_window_are_excluded() {
        let (_dir, pool) = temp_pool();
        let meter = UsageMeter::new(pool.clone());
        meter
            .log_usage(&UsageEntry::chat("m1", "openai", None, 10))
            .unwrap();
        let old = OffsetDateTime::now_utc().unix_timestamp() - 40 * SECONDS_PER_DAY;
        pool.get()
            .unwrap()
            .execute(
                "INSERT INTO ai_usage_logs (log_id, owner_id, provider, model_name, usage_type, tokens_used, cost, created_at)
                 VALUES ('old', 'm1', 'openai', NULL, 'chat', 99, 0, ?1)",
                params![old],
            )
            .unwrap();

        assert_eq!(meter.get_usage_stats("m1", 30).unwrap().total_tokens, 10);
        assert_eq!(meter.get_usage_stats("m1", 60).unwrap().total_tokens, 109);
    }

    #[test]
    fn invalid_entries_are_rejected() {
        let (_dir, pool) = temp_pool();
        let meter = UsageMeter::new(pool);
        let mut entry = UsageEntry::chat("m1", "openai", None, 1);
        entry.cost = f64::NAN;
        assert!(matches!(meter.log_usage(&entry), Err(AiError::InvalidRequest(_))));
        entry.cost = -1.0;
        assert!(matches!(meter.log_usage(&entry), Err(AiError::InvalidRequest(_))));
        let blank_owner = UsageEntry::chat(" ", "openai", None, 1);
        assert!(matches!(meter.log_usage(&blank_owner), Err(AiError::InvalidRequest(_))));
        assert_eq!(meter.get_usage_stats("m1", 30).unwrap().total_count, 0);
    }

    #[test]
    fn concurrent_logging_loses_nothing() {
        let (_dir, pool) = temp_pool();
        let meter = UsageMeter::new(pool);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let meter = meter.clone();
                std::thread::spawn(move || {
                    for _ in 0..5 {
                        meter
                            .log_usage(&UsageEntry::chat("m1", "anthropic", Some("claude"), 3))
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let stats = meter.get_usage_stats("m1", 1).unwrap();
        assert_eq!(stats.total_count, 40);
        assert_eq!(stats.total_tokens, 120);
    }

    #[test]
    fn recent_usage_is_newest_first() {
        let (_dir, pool) = temp_pool();
        let meter = UsageMeter::new(pool);
        let first = meter
            .log_usage(&UsageEntry::chat("m1", "openai", None, 1))
            .unwrap();
        let second = meter
            .log_usage(&UsageEntry::chat("m1", "openai", None, 2))
            .unwrap();
        let records = meter.recent_usage("m1", 10).unwrap();
        let ids: Vec<&str> = records.iter().map(|r| r.log_id.as_str()).collect();
        assert_eq!(ids, vec![second.as_str(), first.as_str()]);
        assert_eq!(meter.recent_usage("m1", 1).unwrap().len(), 1);
    }
}

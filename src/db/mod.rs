//! Database module

mod aggregates;
mod schema;
mod stats;

pub use aggregates::{EventFacts, GeoRow, PageRow, ReferralRow};
pub use stats::{HistoricalStats, TodayStats};

use anyhow::Result;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite};
use std::time::Duration;
#[cfg(test)]
use std::str::FromStr;

use crate::config::DatabaseConfig;
use crate::geoip::GeoLocation;

pub const SECONDS_PER_DAY: i64 = 86_400;

const IDENTITY_SALT_KEY: &str = "identity_salt";

/// One received beacon, as persisted in the raw event log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub timestamp: DateTime<Utc>,
    pub hashed_ip: String,
    pub user_agent: String,
    pub referrer: String,
    pub page_url: String,
    pub geo_city: String,
    pub geo_region: String,
    pub geo_country: String,
}

impl RawEvent {
    pub fn new(timestamp: DateTime<Utc>, hashed_ip: String, page_url: String) -> Self {
        Self {
            timestamp,
            hashed_ip,
            user_agent: String::new(),
            referrer: String::new(),
            page_url,
            geo_city: String::new(),
            geo_region: String::new(),
            geo_country: String::new(),
        }
    }

    pub fn with_user_agent(mut self, user_agent: String) -> Self {
        self.user_agent = user_agent;
        self
    }

    pub fn with_referrer(mut self, referrer: String) -> Self {
        self.referrer = referrer;
        self
    }

    pub fn with_geo(mut self, location: GeoLocation) -> Self {
        self.geo_city = location.city.unwrap_or_default();
        self.geo_region = location.region.unwrap_or_default();
        self.geo_country = location.country.unwrap_or_default();
        self
    }
}

/// First and one-past-last unix second of a UTC day
pub fn day_bounds(day: NaiveDate) -> (i64, i64) {
    let start = day.and_time(NaiveTime::MIN).and_utc().timestamp();
    (start, start + SECONDS_PER_DAY)
}

/// Aggregate tables key days as ISO dates
pub fn day_key(day: NaiveDate) -> String {
    day.format("%Y-%m-%d").to_string()
}

#[derive(Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(&config.url)
            .create_if_missing(true)
            // WAL lets the stats readers run alongside ingestion and rollup writes
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    /// Idempotent: safe to run against an existing store
    pub async fn run_migrations(&self) -> Result<()> {
        for statement in schema::ALL {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub async fn insert_event(&self, event: &RawEvent) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO events (timestamp, hashed_ip, user_agent, referrer, page_url, geo_city, geo_region, geo_country)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(event.timestamp.timestamp())
        .bind(&event.hashed_ip)
        .bind(&event.user_agent)
        .bind(&event.referrer)
        .bind(&event.page_url)
        .bind(&event.geo_city)
        .bind(&event.geo_region)
        .bind(&event.geo_country)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// The stored identity salt. `candidate` is persisted only when none exists yet,
    /// so every start after the first sees the same salt.
    pub async fn identity_salt(&self, candidate: &str) -> Result<String> {
        sqlx::query("INSERT OR IGNORE INTO settings (key, value) VALUES (?, ?)")
            .bind(IDENTITY_SALT_KEY)
            .bind(candidate)
            .execute(&self.pool)
            .await?;

        let (salt,): (String,) = sqlx::query_as("SELECT value FROM settings WHERE key = ?")
            .bind(IDENTITY_SALT_KEY)
            .fetch_one(&self.pool)
            .await?;
        Ok(salt)
    }
}

#[cfg(test)]
impl Database {
    /// Single-connection in-memory database; every connection to `:memory:` is a fresh database
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    /// Run arbitrary SQL, e.g. to break the schema under a running component
    pub async fn execute(&self, sql: &str) -> Result<()> {
        sqlx::query(sql).execute(&self.pool).await?;
        Ok(())
    }

    /// Simulate the store going away
    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn count_events_on(&self, day: NaiveDate) -> Result<i64> {
        let (start, end) = day_bounds(day);
        let row: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM events WHERE timestamp >= ? AND timestamp < ?")
                .bind(start)
                .bind(end)
                .fetch_one(&self.pool)
                .await?;
        Ok(row.0)
    }

    pub async fn get_event(&self, id: i64) -> Result<Option<RawEvent>> {
        let row: Option<(i64, String, String, String, String, String, String, String)> =
            sqlx::query_as(
                r#"
                SELECT timestamp, hashed_ip, user_agent, referrer, page_url, geo_city, geo_region, geo_country
                FROM events
                WHERE id = ?
                "#,
            )
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(
            |(ts, hashed_ip, user_agent, referrer, page_url, geo_city, geo_region, geo_country)| {
                RawEvent {
                    timestamp: DateTime::from_timestamp(ts, 0).unwrap_or_default(),
                    hashed_ip,
                    user_agent,
                    referrer,
                    page_url,
                    geo_city,
                    geo_region,
                    geo_country,
                }
            },
        ))
    }
}

//! Database schema definitions
//!
//! Text columns default to '' rather than NULL so that geo tuples with missing
//! levels still collide in the UNIQUE keys below.

pub const CREATE_EVENTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp INTEGER NOT NULL,      -- Unix seconds, UTC
    hashed_ip TEXT NOT NULL,
    user_agent TEXT NOT NULL DEFAULT '',
    referrer TEXT NOT NULL DEFAULT '',
    page_url TEXT NOT NULL,
    geo_city TEXT NOT NULL DEFAULT '',
    geo_region TEXT NOT NULL DEFAULT '',
    geo_country TEXT NOT NULL DEFAULT ''
)
"#;

// Daily rollup tables, day is 'YYYY-MM-DD' (UTC)
pub const CREATE_DAILY_PAGES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS daily_pages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    day TEXT NOT NULL,
    page_url TEXT NOT NULL,
    page_views INTEGER NOT NULL DEFAULT 0,
    bounces INTEGER NOT NULL DEFAULT 0,
    UNIQUE(day, page_url)
)
"#;

pub const CREATE_DAILY_REFERRALS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS daily_referrals (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    day TEXT NOT NULL,
    page_url TEXT NOT NULL,
    referral_url TEXT NOT NULL,
    referral_count INTEGER NOT NULL DEFAULT 0,
    UNIQUE(day, page_url, referral_url)
)
"#;

pub const CREATE_DAILY_GEO_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS daily_geo (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    day TEXT NOT NULL,
    page_url TEXT NOT NULL,
    geo_city TEXT NOT NULL DEFAULT '',
    geo_region TEXT NOT NULL DEFAULT '',
    geo_country TEXT NOT NULL DEFAULT '',
    page_views INTEGER NOT NULL DEFAULT 0,
    UNIQUE(day, page_url, geo_city, geo_region, geo_country)
)
"#;

// Process-wide key/value settings such as the identity salt
pub const CREATE_SETTINGS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
"#;

// For pending-day scans, per-day folds and the purge range delete
pub const CREATE_INDEX_EVENTS_TS: &str =
    "CREATE INDEX IF NOT EXISTS idx_events_ts ON events(timestamp)";

// For today's per-page stats
pub const CREATE_INDEX_EVENTS_PAGE_TS: &str =
    "CREATE INDEX IF NOT EXISTS idx_events_page_ts ON events(page_url, timestamp)";

// Historical window scans; the UNIQUE keys already lead with day
pub const CREATE_INDEX_DAILY_PAGES_PAGE: &str =
    "CREATE INDEX IF NOT EXISTS idx_daily_pages_page ON daily_pages(page_url, day)";

pub const ALL: &[&str] = &[
    CREATE_EVENTS_TABLE,
    CREATE_DAILY_PAGES_TABLE,
    CREATE_DAILY_REFERRALS_TABLE,
    CREATE_DAILY_GEO_TABLE,
    CREATE_SETTINGS_TABLE,
    CREATE_INDEX_EVENTS_TS,
    CREATE_INDEX_EVENTS_PAGE_TS,
    CREATE_INDEX_DAILY_PAGES_PAGE,
];

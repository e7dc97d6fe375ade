//! Daily rollup of the raw event log
//!
//! Each run walks `CheckPending -> Fold -> Purge` for every UTC day strictly before
//! today that still has raw events. A day's aggregates are overwritten inside one
//! transaction, and its raw events are deleted only after that transaction commits, so
//! an interrupted run is repaired by the next one recomputing the same values.

mod fold;
mod scheduler;

pub use fold::{DayFold, FoldedDay};
pub use scheduler::spawn_scheduler;

use anyhow::Result;
use chrono::{NaiveDate, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::db::Database;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub days: Vec<NaiveDate>,
    pub events: u64,
    pub page_rows: usize,
    pub referral_rows: usize,
    pub geo_rows: usize,
    pub purged: u64,
    /// More past days were pending than one run may fold
    pub backlog_remaining: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// No raw events older than today
    Skipped,
    /// Another run holds the engine
    Busy,
    Completed(RunSummary),
}

pub struct Aggregator {
    db: Database,
    max_days_per_run: u32,
    running: Mutex<()>,
}

impl Aggregator {
    pub fn new(db: Database, max_days_per_run: u32) -> Self {
        Self {
            db,
            max_days_per_run: max_days_per_run.max(1),
            running: Mutex::new(()),
        }
    }

    pub async fn run_now(&self) -> Result<RunOutcome> {
        self.run(Utc::now().date_naive()).await
    }

    /// Fold and purge every pending day before `today`. Single-flight: a concurrent
    /// call returns `Busy` without touching the store.
    pub async fn run(&self, today: NaiveDate) -> Result<RunOutcome> {
        let Ok(_guard) = self.running.try_lock() else {
            debug!("Aggregation already in progress");
            return Ok(RunOutcome::Busy);
        };

        let limit = self.max_days_per_run as usize;
        let mut days = self
            .db
            .pending_days(today, self.max_days_per_run.saturating_add(1))
            .await?;
        if days.is_empty() {
            info!("No log entries from before {}, skipping aggregation", today);
            return Ok(RunOutcome::Skipped);
        }

        let mut summary = RunSummary {
            backlog_remaining: days.len() > limit,
            ..RunSummary::default()
        };
        days.truncate(limit);

        for day in days {
            let (events, folded) = self.fold_day(day).await?;
            let purged = self.db.purge_day(day).await?;

            info!(
                day = %day,
                events,
                pages = folded.pages.len(),
                referrals = folded.referrals.len(),
                geo = folded.geo.len(),
                purged,
                "Day aggregated"
            );

            summary.events += events;
            summary.page_rows += folded.pages.len();
            summary.referral_rows += folded.referrals.len();
            summary.geo_rows += folded.geo.len();
            summary.purged += purged;
            summary.days.push(day);
        }

        if summary.backlog_remaining {
            info!(
                folded_days = summary.days.len(),
                "Aggregation backlog remains, continuing on the next run"
            );
        }

        Ok(RunOutcome::Completed(summary))
    }

    /// Recompute and upsert the aggregates of one day without purging it
    pub async fn fold_day(&self, day: NaiveDate) -> Result<(u64, FoldedDay)> {
        let mut fold = DayFold::default();
        let events = self.db.scan_day(day, |event| fold.add(event)).await?;
        let folded = fold.finish();

        self.db
            .upsert_day(day, &folded.pages, &folded.referrals, &folded.geo)
            .await?;

        Ok((events, folded))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{GeoRow, PageRow, RawEvent, ReferralRow};
    use crate::geoip::GeoLocation;
    use chrono::{DateTime, Duration, TimeZone};

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 7, 2).unwrap()
    }

    fn at(day: NaiveDate, hour: u32) -> DateTime<Utc> {
        Utc.from_utc_datetime(&day.and_hms_opt(hour, 0, 0).unwrap())
    }

    fn city1() -> GeoLocation {
        GeoLocation {
            city: Some("City1".into()),
            region: Some("R1".into()),
            country: Some("C1".into()),
        }
    }

    async fn insert(db: &Database, ts: DateTime<Utc>, ip: &str, page: &str, referrer: &str) {
        let event = RawEvent::new(ts, ip.into(), page.into())
            .with_referrer(referrer.into())
            .with_geo(city1());
        db.insert_event(&event).await.unwrap();
    }

    #[tokio::test]
    async fn end_to_end_yesterday_is_rolled_up_and_purged() {
        let db = Database::in_memory().await.unwrap();
        let yesterday = today() - Duration::days(1);
        insert(&db, at(yesterday, 9), "X", "/a", "").await;
        insert(&db, at(yesterday, 10), "X", "/a", "").await;
        insert(&db, at(yesterday, 11), "Y", "/a", "ref.com").await;

        let aggregator = Aggregator::new(db.clone(), 31);
        let RunOutcome::Completed(summary) = aggregator.run(today()).await.unwrap() else {
            panic!("expected a completed run");
        };
        assert_eq!(summary.days, vec![yesterday]);
        assert_eq!(summary.events, 3);
        assert_eq!(summary.purged, 3);
        assert!(!summary.backlog_remaining);

        assert_eq!(
            db.daily_pages_on(yesterday).await.unwrap(),
            vec![PageRow {
                page_url: "/a".into(),
                page_views: 3,
                bounces: 1,
            }]
        );
        assert_eq!(
            db.daily_geo_on(yesterday).await.unwrap(),
            vec![GeoRow {
                page_url: "/a".into(),
                geo_city: "City1".into(),
                geo_region: "R1".into(),
                geo_country: "C1".into(),
                page_views: 3,
            }]
        );
        assert_eq!(
            db.daily_referrals_on(yesterday).await.unwrap(),
            vec![ReferralRow {
                page_url: "/a".into(),
                referral_url: "ref.com".into(),
                referral_count: 1,
            }]
        );
        assert_eq!(db.count_events_on(yesterday).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn folding_twice_yields_identical_rows() {
        let db = Database::in_memory().await.unwrap();
        let day = today() - Duration::days(1);
        insert(&db, at(day, 1), "A", "/a", "ref.com").await;
        insert(&db, at(day, 2), "A", "/a", "").await;
        insert(&db, at(day, 3), "B", "/b", "other.com").await;

        let aggregator = Aggregator::new(db.clone(), 31);
        let (_, first) = aggregator.fold_day(day).await.unwrap();
        let pages = db.daily_pages_on(day).await.unwrap();
        let referrals = db.daily_referrals_on(day).await.unwrap();
        let geo = db.daily_geo_on(day).await.unwrap();

        let (_, second) = aggregator.fold_day(day).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(db.daily_pages_on(day).await.unwrap(), pages);
        assert_eq!(db.daily_referrals_on(day).await.unwrap(), referrals);
        assert_eq!(db.daily_geo_on(day).await.unwrap(), geo);
        assert_eq!(db.count_events_on(day).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn todays_events_survive_any_number_of_runs() {
        let db = Database::in_memory().await.unwrap();
        insert(&db, at(today(), 0), "A", "/a", "").await;
        insert(&db, at(today(), 23), "B", "/a", "").await;

        let aggregator = Aggregator::new(db.clone(), 31);
        for _ in 0..3 {
            assert_eq!(aggregator.run(today()).await.unwrap(), RunOutcome::Skipped);
        }
        assert_eq!(db.count_events_on(today()).await.unwrap(), 2);
        assert!(db.daily_pages_on(today()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn mixed_days_only_purge_the_past() {
        let db = Database::in_memory().await.unwrap();
        let yesterday = today() - Duration::days(1);
        insert(&db, at(yesterday, 23), "A", "/a", "").await;
        insert(&db, at(today(), 0), "A", "/a", "").await;

        let aggregator = Aggregator::new(db.clone(), 31);
        assert!(matches!(
            aggregator.run(today()).await.unwrap(),
            RunOutcome::Completed(_)
        ));
        assert_eq!(db.count_events_on(yesterday).await.unwrap(), 0);
        assert_eq!(db.count_events_on(today()).await.unwrap(), 1);
        // The second run finds nothing left to do
        assert_eq!(aggregator.run(today()).await.unwrap(), RunOutcome::Skipped);
    }

    #[tokio::test]
    async fn catch_up_is_capped_per_run() {
        let db = Database::in_memory().await.unwrap();
        for offset in 1..=3 {
            insert(&db, at(today() - Duration::days(offset), 12), "A", "/a", "").await;
        }

        let aggregator = Aggregator::new(db.clone(), 2);
        let RunOutcome::Completed(first) = aggregator.run(today()).await.unwrap() else {
            panic!("expected a completed run");
        };
        assert_eq!(
            first.days,
            vec![today() - Duration::days(3), today() - Duration::days(2)]
        );
        assert!(first.backlog_remaining);

        let RunOutcome::Completed(second) = aggregator.run(today()).await.unwrap() else {
            panic!("expected a completed run");
        };
        assert_eq!(second.days, vec![today() - Duration::days(1)]);
        assert!(!second.backlog_remaining);
    }

    #[tokio::test]
    async fn overlapping_runs_are_rejected() {
        let db = Database::in_memory().await.unwrap();
        insert(&db, at(today() - Duration::days(1), 12), "A", "/a", "").await;

        let aggregator = Aggregator::new(db.clone(), 31);
        let guard = aggregator.running.try_lock().unwrap();
        assert_eq!(aggregator.run(today()).await.unwrap(), RunOutcome::Busy);
        drop(guard);

        assert!(matches!(
            aggregator.run(today()).await.unwrap(),
            RunOutcome::Completed(_)
        ));
    }

    #[tokio::test]
    async fn failed_fold_keeps_raw_events_and_no_partial_aggregates() {
        let db = Database::in_memory().await.unwrap();
        let day = today() - Duration::days(1);
        insert(&db, at(day, 12), "A", "/a", "ref.com").await;

        // The geo upsert is the last statement of the day's transaction
        db.execute("DROP TABLE daily_geo").await.unwrap();

        let aggregator = Aggregator::new(db.clone(), 31);
        assert!(aggregator.run(today()).await.is_err());

        assert_eq!(db.count_events_on(day).await.unwrap(), 1);
        assert!(db.daily_pages_on(day).await.unwrap().is_empty());
        assert!(db.daily_referrals_on(day).await.unwrap().is_empty());

        // A failed run releases the engine for the next tick
        assert!(aggregator.running.try_lock().is_ok());
    }

    #[tokio::test]
    async fn rerun_after_interrupted_purge_recomputes_same_values() {
        let db = Database::in_memory().await.unwrap();
        let day = today() - Duration::days(1);
        insert(&db, at(day, 1), "A", "/a", "").await;
        insert(&db, at(day, 2), "B", "/a", "").await;

        // Fold committed, purge never happened
        let aggregator = Aggregator::new(db.clone(), 31);
        aggregator.fold_day(day).await.unwrap();
        let before = db.daily_pages_on(day).await.unwrap();

        aggregator.run(today()).await.unwrap();
        assert_eq!(db.daily_pages_on(day).await.unwrap(), before);
        assert_eq!(db.count_events_on(day).await.unwrap(), 0);
    }
}

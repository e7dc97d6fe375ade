//! Raw-log scans, daily aggregate upserts and the purge

use anyhow::Result;
use chrono::NaiveDate;
use futures::TryStreamExt;

use super::{day_bounds, day_key, Database};

/// The columns of a raw event the rollup reads
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFacts {
    pub hashed_ip: String,
    pub referrer: String,
    pub page_url: String,
    pub geo_city: String,
    pub geo_region: String,
    pub geo_country: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRow {
    pub page_url: String,
    pub page_views: i64,
    pub bounces: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferralRow {
    pub page_url: String,
    pub referral_url: String,
    pub referral_count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeoRow {
    pub page_url: String,
    pub geo_city: String,
    pub geo_region: String,
    pub geo_country: String,
    pub page_views: i64,
}

impl Database {
    /// Distinct UTC days, oldest first, that still have raw events before `today`
    pub async fn pending_days(&self, today: NaiveDate, limit: u32) -> Result<Vec<NaiveDate>> {
        let (cutoff, _) = day_bounds(today);
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT DISTINCT date(timestamp, 'unixepoch') AS day
            FROM events
            WHERE timestamp < ?
            ORDER BY day
            LIMIT ?
            "#,
        )
        .bind(cutoff)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(day,)| NaiveDate::parse_from_str(&day, "%Y-%m-%d").map_err(anyhow::Error::from))
            .collect()
    }

    /// Stream every event of `day` through `visit`, returning how many were seen
    pub async fn scan_day<F>(&self, day: NaiveDate, mut visit: F) -> Result<u64>
    where
        F: FnMut(EventFacts),
    {
        let (start, end) = day_bounds(day);
        let mut rows = sqlx::query_as::<_, (String, String, String, String, String, String)>(
            r#"
            SELECT hashed_ip, referrer, page_url, geo_city, geo_region, geo_country
            FROM events
            WHERE timestamp >= ? AND timestamp < ?
            ORDER BY id
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch(&self.pool);

        let mut seen = 0;
        while let Some((hashed_ip, referrer, page_url, geo_city, geo_region, geo_country)) =
            rows.try_next().await?
        {
            visit(EventFacts {
                hashed_ip,
                referrer,
                page_url,
                geo_city,
                geo_region,
                geo_country,
            });
            seen += 1;
        }
        Ok(seen)
    }

    /// Overwrite the aggregates of `day` with freshly computed rows, all in one transaction
    pub async fn upsert_day(
        &self,
        day: NaiveDate,
        pages: &[PageRow],
        referrals: &[ReferralRow],
        geo: &[GeoRow],
    ) -> Result<()> {
        let day = day_key(day);
        let mut tx = self.pool.begin().await?;

        for row in pages {
            sqlx::query(
                r#"
                INSERT INTO daily_pages (day, page_url, page_views, bounces)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(day, page_url) DO UPDATE SET
                    page_views = excluded.page_views,
                    bounces = excluded.bounces
                "#,
            )
            .bind(&day)
            .bind(&row.page_url)
            .bind(row.page_views)
            .bind(row.bounces)
            .execute(&mut *tx)
            .await?;
        }

        for row in referrals {
            sqlx::query(
                r#"
                INSERT INTO daily_referrals (day, page_url, referral_url, referral_count)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(day, page_url, referral_url) DO UPDATE SET
                    referral_count = excluded.referral_count
                "#,
            )
            .bind(&day)
            .bind(&row.page_url)
            .bind(&row.referral_url)
            .bind(row.referral_count)
            .execute(&mut *tx)
            .await?;
        }

        for row in geo {
            sqlx::query(
                r#"
                INSERT INTO daily_geo (day, page_url, geo_city, geo_region, geo_country, page_views)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(day, page_url, geo_city, geo_region, geo_country) DO UPDATE SET
                    page_views = excluded.page_views
                "#,
            )
            .bind(&day)
            .bind(&row.page_url)
            .bind(&row.geo_city)
            .bind(&row.geo_region)
            .bind(&row.geo_country)
            .bind(row.page_views)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Delete the raw events of a past day. Callers must have committed its aggregates first.
    pub async fn purge_day(&self, day: NaiveDate) -> Result<u64> {
        let (start, end) = day_bounds(day);
        let result = sqlx::query("DELETE FROM events WHERE timestamp >= ? AND timestamp < ?")
            .bind(start)
            .bind(end)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
impl Database {
    pub async fn daily_pages_on(&self, day: NaiveDate) -> Result<Vec<PageRow>> {
        let rows: Vec<(String, i64, i64)> = sqlx::query_as(
            "SELECT page_url, page_views, bounces FROM daily_pages WHERE day = ? ORDER BY page_url",
        )
        .bind(day_key(day))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(page_url, page_views, bounces)| PageRow {
                page_url,
                page_views,
                bounces,
            })
            .collect())
    }

    pub async fn daily_referrals_on(&self, day: NaiveDate) -> Result<Vec<ReferralRow>> {
        let rows: Vec<(String, String, i64)> = sqlx::query_as(
            r#"
            SELECT page_url, referral_url, referral_count
            FROM daily_referrals
            WHERE day = ?
            ORDER BY page_url, referral_url
            "#,
        )
        .bind(day_key(day))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(page_url, referral_url, referral_count)| ReferralRow {
                page_url,
                referral_url,
                referral_count,
            })
            .collect())
    }

    pub async fn daily_geo_on(&self, day: NaiveDate) -> Result<Vec<GeoRow>> {
        let rows: Vec<(String, String, String, String, i64)> = sqlx::query_as(
            r#"
            SELECT page_url, geo_city, geo_region, geo_country, page_views
            FROM daily_geo
            WHERE day = ?
            ORDER BY page_url, geo_country, geo_region, geo_city
            "#,
        )
        .bind(day_key(day))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(
                |(page_url, geo_city, geo_region, geo_country, page_views)| GeoRow {
                    page_url,
                    geo_city,
                    geo_region,
                    geo_country,
                    page_views,
                },
            )
            .collect())
    }
}

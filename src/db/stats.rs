//! Read-only statistics over today's raw events and the daily aggregates

use anyhow::Result;
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::HashMap;

use super::{day_bounds, day_key, Database};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct GeoStat {
    pub city: String,
    #[serde(rename = "state")]
    pub region: String,
    pub country: String,
    pub views: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TodayPageStat {
    #[serde(rename = "pageURL")]
    pub page_url: String,
    pub page_views: i64,
    pub unique_visits: i64,
    pub geo_stats: Vec<GeoStat>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TodayStats {
    #[serde(rename = "statsByPageURL")]
    pub stats_by_page_url: Vec<TodayPageStat>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ReferralStat {
    #[serde(rename = "referralURL")]
    pub referral_url: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HistoricalPageStat {
    #[serde(rename = "pageURL")]
    pub page_url: String,
    pub page_views: i64,
    pub bounces: i64,
    pub referrals: Vec<ReferralStat>,
    pub geolocation_stats: Vec<GeoStat>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct HistoricalStats {
    #[serde(rename = "statsByPageURL")]
    pub stats_by_page_url: Vec<HistoricalPageStat>,
}

type GeoBreakdownRow = (String, String, String, String, i64);

fn group_geo(rows: Vec<GeoBreakdownRow>) -> HashMap<String, Vec<GeoStat>> {
    let mut by_page: HashMap<String, Vec<GeoStat>> = HashMap::new();
    for (page_url, city, region, country, views) in rows {
        by_page.entry(page_url).or_default().push(GeoStat {
            city,
            region,
            country,
            views,
        });
    }
    by_page
}

impl Database {
    /// Live per-page stats from the raw events of `today`
    pub async fn get_today_stats(
        &self,
        today: NaiveDate,
        page_url: Option<&str>,
    ) -> Result<TodayStats> {
        let (start, end) = day_bounds(today);

        let pages: Vec<(String, i64, i64)> = sqlx::query_as(
            r#"
            SELECT page_url, COUNT(*) AS page_views, COUNT(DISTINCT hashed_ip) AS unique_visits
            FROM events
            WHERE timestamp >= ? AND timestamp < ? AND (? IS NULL OR page_url = ?)
            GROUP BY page_url
            ORDER BY page_url
            "#,
        )
        .bind(start)
        .bind(end)
        .bind(page_url)
        .bind(page_url)
        .fetch_all(&self.pool)
        .await?;

        let geo: Vec<GeoBreakdownRow> = sqlx::query_as(
            r#"
            SELECT page_url, geo_city, geo_region, geo_country, COUNT(*) AS views
            FROM events
            WHERE timestamp >= ? AND timestamp < ? AND (? IS NULL OR page_url = ?)
            GROUP BY page_url, geo_city, geo_region, geo_country
            ORDER BY views DESC, geo_country, geo_region, geo_city
            "#,
        )
        .bind(start)
        .bind(end)
        .bind(page_url)
        .bind(page_url)
        .fetch_all(&self.pool)
        .await?;
        let mut geo = group_geo(geo);

        Ok(TodayStats {
            stats_by_page_url: pages
                .into_iter()
                .map(|(page_url, page_views, unique_visits)| TodayPageStat {
                    geo_stats: geo.remove(&page_url).unwrap_or_default(),
                    page_url,
                    page_views,
                    unique_visits,
                })
                .collect(),
        })
    }

    /// Summed aggregates for every day on or after `since`
    pub async fn get_historical_stats(
        &self,
        since: NaiveDate,
        page_url: Option<&str>,
    ) -> Result<HistoricalStats> {
        let since = day_key(since);

        let pages: Vec<(String, i64, i64)> = sqlx::query_as(
            r#"
            SELECT page_url, SUM(page_views) AS page_views, SUM(bounces) AS bounces
            FROM daily_pages
            WHERE day >= ? AND (? IS NULL OR page_url = ?)
            GROUP BY page_url
            ORDER BY page_url
            "#,
        )
        .bind(&since)
        .bind(page_url)
        .bind(page_url)
        .fetch_all(&self.pool)
        .await?;

        let referral_rows: Vec<(String, String, i64)> = sqlx::query_as(
            r#"
            SELECT page_url, referral_url, SUM(referral_count) AS total
            FROM daily_referrals
            WHERE day >= ? AND (? IS NULL OR page_url = ?)
            GROUP BY page_url, referral_url
            ORDER BY total DESC, referral_url
            "#,
        )
        .bind(&since)
        .bind(page_url)
        .bind(page_url)
        .fetch_all(&self.pool)
        .await?;
        let mut referrals: HashMap<String, Vec<ReferralStat>> = HashMap::new();
        for (page, referral_url, count) in referral_rows {
            referrals
                .entry(page)
                .or_default()
                .push(ReferralStat { referral_url, count });
        }

        let geo: Vec<GeoBreakdownRow> = sqlx::query_as(
            r#"
            SELECT page_url, geo_city, geo_region, geo_country, SUM(page_views) AS views
            FROM daily_geo
            WHERE day >= ? AND (? IS NULL OR page_url = ?)
            GROUP BY page_url, geo_city, geo_region, geo_country
            ORDER BY views DESC, geo_country, geo_region, geo_city
            "#,
        )
        .bind(&since)
        .bind(page_url)
        .bind(page_url)
        .fetch_all(&self.pool)
        .await?;
        let mut geo = group_geo(geo);

        Ok(HistoricalStats {
            stats_by_page_url: pages
                .into_iter()
                .map(|(page_url, page_views, bounces)| HistoricalPageStat {
                    referrals: referrals.remove(&page_url).unwrap_or_default(),
                    geolocation_stats: geo.remove(&page_url).unwrap_or_default(),
                    page_url,
                    page_views,
                    bounces,
                })
                .collect(),
        })
    }
}

//! In-memory fold of one day of raw events into aggregate rows

use std::collections::{BTreeMap, HashMap};

use crate::db::{EventFacts, GeoRow, PageRow, ReferralRow};

type GeoKey = (String, String, String, String);

/// Accumulates one day of events. Rows come out sorted by key.
#[derive(Debug, Default)]
pub struct DayFold {
    /// page -> identity token -> views
    visits: BTreeMap<String, HashMap<String, i64>>,
    /// (page, referrer) -> count
    referrals: BTreeMap<(String, String), i64>,
    /// (page, city, region, country) -> views
    geo: BTreeMap<GeoKey, i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FoldedDay {
    pub pages: Vec<PageRow>,
    pub referrals: Vec<ReferralRow>,
    pub geo: Vec<GeoRow>,
}

impl DayFold {
    pub fn add(&mut self, event: EventFacts) {
        *self
            .visits
            .entry(event.page_url.clone())
            .or_default()
            .entry(event.hashed_ip)
            .or_default() += 1;

        if !event.referrer.is_empty() {
            *self
                .referrals
                .entry((event.page_url.clone(), event.referrer))
                .or_default() += 1;
        }

        *self
            .geo
            .entry((
                event.page_url,
                event.geo_city,
                event.geo_region,
                event.geo_country,
            ))
            .or_default() += 1;
    }

    pub fn finish(self) -> FoldedDay {
        let pages = self
            .visits
            .into_iter()
            .map(|(page_url, by_identity)| PageRow {
                page_url,
                page_views: by_identity.values().sum(),
                // A bounce is an identity seen exactly once on this page
                bounces: by_identity.values().filter(|&&views| views == 1).count() as i64,
            })
            .collect();

        let referrals = self
            .referrals
            .into_iter()
            .map(|((page_url, referral_url), referral_count)| ReferralRow {
                page_url,
                referral_url,
                referral_count,
            })
            .collect();

        let geo = self
            .geo
            .into_iter()
            .map(
                |((page_url, geo_city, geo_region, geo_country), page_views)| GeoRow {
                    page_url,
                    geo_city,
                    geo_region,
                    geo_country,
                    page_views,
                },
            )
            .collect();

        FoldedDay {
            pages,
            referrals,
            geo,
        }
    }
}

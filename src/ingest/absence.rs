//! Two-miss "sold" transition for listings absent from a scrape.
//!
//! After a successful scrape of a dealer×model, listings in scrape scope
//! (source_rank ≤ inventory rank, or unranked) that did not appear step
//! missing → sold across consecutive absence cycles. Upload-origin listings
//! (rank 80) stay out of scope on purpose.

use std::collections::HashSet;

use rusqlite::params;
use tracing::debug;

use crate::db::Store;
use crate::errors::ScrapeError;
use crate::models::ListingStatus;

use super::reconcile::SOURCE_RANK_INVENTORY;

/// Counts of listings transitioned by one absence pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AbsenceOutcome {
    pub to_missing: usize,
    pub to_sold: usize,
}

/// Apply the absence transitions for one dealer×model scope.
pub fn reconcile_absent_listings(
    store: &Store,
    dealer_id: i64,
    model: &str,
    observed_vins: &HashSet<String>,
) -> Result<AbsenceOutcome, ScrapeError> {
    let outcome = store.with_conn(|conn| {
        conn.execute("BEGIN IMMEDIATE", [])?;

        let result = (|| {
            let mut stmt = conn.prepare_cached(
                "SELECT l.vin, l.status
                 FROM listings l
                 JOIN vehicles v ON v.vin = l.vin
                 WHERE l.dealer_id = ?1
                   AND v.model = ?2
                   AND (l.source_rank <= ?3 OR l.source_rank IS NULL)",
            )?;
            let scoped: Vec<(String, Option<ListingStatus>)> = stmt
                .query_map(params![dealer_id, model, SOURCE_RANK_INVENTORY], |row| {
                    let vin: String = row.get(0)?;
                    let status: String = row.get(1)?;
                    Ok((vin, ListingStatus::parse(&status)))
                })?
                .collect::<rusqlite::Result<_>>()?;

            let mut outcome = AbsenceOutcome::default();
            for (vin, status) in scoped {
                if observed_vins.contains(&vin) {
                    continue;
                }
                let next = match status {
                    Some(ListingStatus::Sold) => continue,
                    Some(ListingStatus::Missing) => ListingStatus::Sold,
                    _ => ListingStatus::Missing,
                };
                conn.execute(
                    "UPDATE listings SET status = ?1 WHERE dealer_id = ?2 AND vin = ?3",
                    params![next.as_str(), dealer_id, vin],
                )?;
                match next {
                    ListingStatus::Sold => outcome.to_sold += 1,
                    _ => outcome.to_missing += 1,
                }
            }
            Ok(outcome)
        })();

        match result {
            Ok(outcome) => {
                conn.execute("COMMIT", [])?;
                Ok(outcome)
            }
            Err(err) => {
                let _ = conn.execute("ROLLBACK", []);
                Err(err)
            }
        }
    })?;

    if outcome.to_missing > 0 || outcome.to_sold > 0 {
        debug!(
            dealer_id,
            model,
            to_missing = outcome.to_missing,
            to_sold = outcome.to_sold,
            "absence transitions applied"
        );
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    use crate::ingest::reconcile::{
        upsert_observations_and_listings, SOURCE_RANK_UPLOAD,
    };
    use crate::models::{
        Dealer, IngestRow, ScrapingConfig, Source, VehicleFields,
    };

    fn seed_store() -> Store {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_dealer(&Dealer {
                id: 1,
                name: "Test Dealer".to_string(),
                code: None,
                region: None,
                homepage_url: None,
                backend_type: "DEALER_INSPIRE".to_string(),
                inventory_url_template: None,
                scraping_config: ScrapingConfig::default(),
                is_active: true,
                last_scraped_at: None,
                district_code: None,
                phone: None,
                city: None,
                state: None,
                postal_code: None,
            })
            .unwrap();
        store
    }

    fn ingest_listing(store: &Store, vin: &str, rank: i64) {
        let mut row = IngestRow::new(1, vin);
        row.advertised_price = Some(dec!(45000));
        row.status = Some(crate::models::ListingStatus::Available);
        row.observed_at = Some(Utc::now());
        row.source_rank = Some(rank);
        row.vehicle = VehicleFields {
            make: Some("Toyota".to_string()),
            model: Some("4Runner".to_string()),
            ..Default::default()
        };
        upsert_observations_and_listings(store, &[row], Source::InventoryList).unwrap();
    }

    fn status_of(store: &Store, vin: &str) -> ListingStatus {
        store.get_listing(1, vin).unwrap().unwrap().status
    }

    #[test]
    fn two_misses_transition_to_sold_exactly() {
        let store = seed_store();
        ingest_listing(&store, "JTENU5JR4R5299999", 50);
        let observed = HashSet::new();

        let first = reconcile_absent_listings(&store, 1, "4Runner", &observed).unwrap();
        assert_eq!(first.to_missing, 1);
        assert_eq!(status_of(&store, "JTENU5JR4R5299999"), ListingStatus::Missing);

        let second = reconcile_absent_listings(&store, 1, "4Runner", &observed).unwrap();
        assert_eq!(second.to_sold, 1);
        assert_eq!(status_of(&store, "JTENU5JR4R5299999"), ListingStatus::Sold);

        // Third miss is a no-op; sold never regresses.
        let third = reconcile_absent_listings(&store, 1, "4Runner", &observed).unwrap();
        assert_eq!(third, AbsenceOutcome::default());
        assert_eq!(status_of(&store, "JTENU5JR4R5299999"), ListingStatus::Sold);
    }

    #[test]
    fn observed_vins_are_untouched() {
        let store = seed_store();
        ingest_listing(&store, "JTENU5JR4R5299999", 50);
        let observed: HashSet<String> = ["JTENU5JR4R5299999".to_string()].into_iter().collect();

        let outcome = reconcile_absent_listings(&store, 1, "4Runner", &observed).unwrap();
        assert_eq!(outcome, AbsenceOutcome::default());
        assert_eq!(
            status_of(&store, "JTENU5JR4R5299999"),
            ListingStatus::Available
        );
    }

    #[test]
    fn upload_rank_listings_are_immune() {
        let store = seed_store();
        ingest_listing(&store, "JTENU5JR4R5299999", SOURCE_RANK_UPLOAD);
        let observed = HashSet::new();

        let outcome = reconcile_absent_listings(&store, 1, "4Runner", &observed).unwrap();
        assert_eq!(outcome, AbsenceOutcome::default());
        assert_eq!(
            status_of(&store, "JTENU5JR4R5299999"),
            ListingStatus::Available
        );
    }

    #[test]
    fn other_models_stay_out_of_scope() {
        let store = seed_store();
        ingest_listing(&store, "JTENU5JR4R5299999", 50);
        let observed = HashSet::new();

        let outcome = reconcile_absent_listings(&store, 1, "Tundra", &observed).unwrap();
        assert_eq!(outcome, AbsenceOutcome::default());
        assert_eq!(
            status_of(&store, "JTENU5JR4R5299999"),
            ListingStatus::Available
        );
    }
}

//! Observation → vehicle/listing/price-event reconciliation.
//!
//! Each batch commits atomically: one `BEGIN IMMEDIATE` window per call.
//! Observations are always appended (they are the audit trail); listings are
//! upserted with min/max seen-times and a source rank that only lowers;
//! price events fire when a non-null advertised price is replaced by a
//! different non-null value.

use chrono::Utc;
use rusqlite::{params, Connection};
use rust_decimal::Decimal;
use serde_json::Value;
use uuid::Uuid;

use crate::db::store::{datetime_to_sql, decimal_to_sql, get_listing_on, get_vehicle_on};
use crate::db::Store;
use crate::errors::ScrapeError;
use crate::models::{IngestRow, ListingStatus, Source, Vehicle};

/// Rank assigned to inventory-list scrape observations.
pub const SOURCE_RANK_INVENTORY: i64 = 50;
/// Rank assigned to spreadsheet-upload observations.
pub const SOURCE_RANK_UPLOAD: i64 = 80;
/// Default rank for listings created without an explicit source rank.
pub const SOURCE_RANK_DEFAULT: i64 = 100;

/// Counts of affected entities, for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestOutcome {
    pub observations: usize,
    pub listings_upserted: usize,
    pub price_events: usize,
}

/// Persist a batch of prepared rows and keep listings/price events in sync.
pub fn upsert_observations_and_listings(
    store: &Store,
    rows: &[IngestRow],
    source: Source,
) -> Result<IngestOutcome, ScrapeError> {
    if rows.is_empty() {
        return Ok(IngestOutcome::default());
    }

    let outcome = store.with_conn(|conn| {
        conn.execute("BEGIN IMMEDIATE", [])?;
        match apply_batch(conn, rows, source) {
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
    Ok(outcome)
}

fn apply_batch(
    conn: &Connection,
    rows: &[IngestRow],
    source: Source,
) -> rusqlite::Result<IngestOutcome> {
    let mut outcome = IngestOutcome::default();

    for row in rows {
        let vin = row.vin.trim().to_uppercase();
        let observed_at = row.observed_at.unwrap_or_else(Utc::now);

        let vehicle = merge_vehicle(conn, &vin, row)?;

        let mut advertised_price = row.advertised_price;
        let msrp = row.msrp;
        let mut payload = row.payload.clone();
        if advertised_price.is_none() {
            if let Some(msrp) = msrp {
                advertised_price = Some(msrp);
                annotate_msrp_assumption(&mut payload);
            }
        }

        let job_uuid = row
            .job_id
            .as_deref()
            .and_then(|raw| Uuid::parse_str(raw).ok())
            .unwrap_or(Uuid::nil());

        conn.execute(
            "INSERT INTO observations
             (job_id, observed_at, dealer_id, vin, vdp_url, advertised_price, msrp, payload,
              raw_blob_key, source)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                job_uuid.to_string(),
                datetime_to_sql(observed_at),
                row.dealer_id,
                vin,
                row.vdp_url,
                decimal_to_sql(advertised_price),
                decimal_to_sql(msrp),
                serde_json::to_string(&payload).unwrap_or_default(),
                row.raw_blob_key,
                row.source.unwrap_or(source).as_str(),
            ],
        )?;
        outcome.observations += 1;

        let status = row.status.unwrap_or(ListingStatus::Available);
        let first_seen_at = row.first_seen_at.unwrap_or(observed_at);
        let last_seen_at = row.last_seen_at.unwrap_or(observed_at);

        let existing = get_listing_on(conn, row.dealer_id, &vin)?;
        match existing {
            None => {
                let msrp_value = msrp.or(vehicle.msrp);
                let price_delta = match (advertised_price, msrp_value) {
                    (Some(price), Some(msrp)) => Some(price - msrp),
                    _ => None,
                };
                conn.execute(
                    "INSERT INTO listings
                     (dealer_id, vin, vdp_url, stock_number, status, advertised_price,
                      price_delta_msrp, first_seen_at, last_seen_at, source_rank)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    params![
                        row.dealer_id,
                        vin,
                        row.vdp_url,
                        row.stock_number,
                        status.as_str(),
                        decimal_to_sql(advertised_price),
                        decimal_to_sql(price_delta),
                        datetime_to_sql(first_seen_at),
                        datetime_to_sql(last_seen_at),
                        row.source_rank.unwrap_or(SOURCE_RANK_DEFAULT),
                    ],
                )?;
                outcome.listings_upserted += 1;
            }
            Some(listing) => {
                let old_price = listing.advertised_price;
                let old_rank = listing.source_rank;

                let vdp_url = row.vdp_url.clone().or(listing.vdp_url);
                let stock_number = row.stock_number.clone().or(listing.stock_number);
                let new_price = advertised_price.or(old_price);

                let msrp_value = msrp.or(vehicle.msrp);
                let price_delta = match (new_price, msrp_value) {
                    (Some(price), Some(msrp)) => Some(price - msrp),
                    _ => listing.price_delta_msrp,
                };

                let first_seen = listing.first_seen_at.min(first_seen_at);
                let last_seen = listing.last_seen_at.max(last_seen_at);

                let source_rank = match (row.source_rank, old_rank) {
                    (Some(incoming), Some(existing)) => Some(existing.min(incoming)),
                    (Some(incoming), None) => Some(incoming),
                    (None, existing) => existing,
                };

                conn.execute(
                    "UPDATE listings
                     SET vdp_url = ?1, stock_number = ?2, status = ?3, advertised_price = ?4,
                         price_delta_msrp = ?5, first_seen_at = ?6, last_seen_at = ?7,
                         source_rank = ?8
                     WHERE dealer_id = ?9 AND vin = ?10",
                    params![
                        vdp_url,
                        stock_number,
                        status.as_str(),
                        decimal_to_sql(new_price),
                        decimal_to_sql(price_delta),
                        datetime_to_sql(first_seen),
                        datetime_to_sql(last_seen),
                        source_rank,
                        row.dealer_id,
                        vin,
                    ],
                )?;
                outcome.listings_upserted += 1;

                if let (Some(new_price), Some(old_price)) = (advertised_price, old_price) {
                    if new_price != old_price {
                        let delta = new_price - old_price;
                        let pct = if old_price != Decimal::ZERO {
                            Some((delta / old_price * Decimal::from(100)).round_dp(4))
                        } else {
                            None
                        };
                        conn.execute(
                            "INSERT INTO price_events
                             (dealer_id, vin, observed_at, old_price, new_price, delta, pct)
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                            params![
                                row.dealer_id,
                                vin,
                                datetime_to_sql(observed_at),
                                decimal_to_sql(Some(old_price)),
                                decimal_to_sql(Some(new_price)),
                                decimal_to_sql(Some(delta)),
                                decimal_to_sql(pct),
                            ],
                        )?;
                        outcome.price_events += 1;
                    }
                }
            }
        }
    }

    Ok(outcome)
}

/// Upsert the vehicle row for a VIN: create on first sight, then overwrite
/// each mutable attribute only when a non-null fresh value arrives.
fn merge_vehicle(conn: &Connection, vin: &str, row: &IngestRow) -> rusqlite::Result<Vehicle> {
    let now = Utc::now();
    let fields = &row.vehicle;

    let mut vehicle = match get_vehicle_on(conn, vin)? {
        Some(vehicle) => vehicle,
        None => {
            conn.execute(
                "INSERT INTO vehicles (vin, make, model, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![
                    vin,
                    fields.make.clone().unwrap_or_default(),
                    fields.model.clone().unwrap_or_default(),
                    datetime_to_sql(now),
                ],
            )?;
            get_vehicle_on(conn, vin)?.expect("vehicle row just inserted")
        }
    };

    if let Some(make) = &fields.make {
        vehicle.make = make.clone();
    }
    if let Some(model) = &fields.model {
        vehicle.model = model.clone();
    }
    if let Some(year) = fields.year {
        vehicle.year = Some(year);
    }
    if let Some(trim) = &fields.trim {
        vehicle.trim = Some(trim.clone());
    }
    if let Some(drivetrain) = &fields.drivetrain {
        vehicle.drivetrain = Some(drivetrain.clone());
    }
    if let Some(transmission) = &fields.transmission {
        vehicle.transmission = Some(transmission.clone());
    }
    if let Some(color) = &fields.exterior_color {
        vehicle.exterior_color = Some(color.clone());
    }
    if let Some(color) = &fields.interior_color {
        vehicle.interior_color = Some(color.clone());
    }
    if let Some(msrp) = fields.msrp.or(row.msrp) {
        vehicle.msrp = Some(msrp);
    }
    if let Some(invoice) = fields.invoice_price {
        vehicle.invoice_price = Some(invoice);
    }
    if let Some(features) = &fields.features {
        vehicle.features = Some(features.clone());
    }
    vehicle.updated_at = Some(now);

    conn.execute(
        "UPDATE vehicles
         SET make = ?1, model = ?2, year = ?3, trim = ?4, drivetrain = ?5, transmission = ?6,
             exterior_color = ?7, interior_color = ?8, msrp = ?9, invoice_price = ?10,
             features = ?11, updated_at = ?12
         WHERE vin = ?13",
        params![
            vehicle.make,
            vehicle.model,
            vehicle.year,
            vehicle.trim,
            vehicle.drivetrain,
            vehicle.transmission,
            vehicle.exterior_color,
            vehicle.interior_color,
            decimal_to_sql(vehicle.msrp),
            decimal_to_sql(vehicle.invoice_price),
            vehicle
                .features
                .as_ref()
                .map(|f| serde_json::to_string(f).unwrap_or_default()),
            datetime_to_sql(now),
            vin,
        ],
    )?;

    Ok(vehicle)
}

fn annotate_msrp_assumption(payload: &mut Value) {
    if !payload.is_object() {
        *payload = Value::Object(Default::default());
    }
    let map = payload.as_object_mut().expect("payload coerced to object");
    let assumptions = map
        .entry("assumptions")
        .or_insert_with(|| Value::Object(Default::default()));
    if let Some(assumptions) = assumptions.as_object_mut() {
        assumptions.insert("ad_price_equals_msrp".to_string(), Value::Bool(true));
    }
}

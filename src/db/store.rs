//! SQLite-backed relational store.
//!
//! One connection behind a mutex; batch writers open `BEGIN IMMEDIATE`
//! transactions and commit once per reconcile batch. Decimals, UUIDs and
//! timestamps are stored as TEXT (RFC3339 for timestamps), JSON payloads as
//! serialized TEXT.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::models::{
    Dealer, JobStatus, Listing, ListingStatus, Observation, PriceEvent, ScrapeTaskRow,
    ScrapingConfig, TaskStatus, Vehicle,
};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS dealers (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    code TEXT UNIQUE,
    region TEXT,
    homepage_url TEXT,
    backend_type TEXT NOT NULL,
    inventory_url_template TEXT,
    scraping_config TEXT,
    is_active INTEGER NOT NULL DEFAULT 1,
    last_scraped_at TEXT,
    district_code TEXT,
    phone TEXT,
    city TEXT,
    state TEXT,
    postal_code TEXT
);

CREATE TABLE IF NOT EXISTS vehicles (
    vin TEXT PRIMARY KEY CHECK (length(vin) = 17),
    make TEXT NOT NULL,
    model TEXT NOT NULL,
    year INTEGER,
    trim TEXT,
    drivetrain TEXT,
    transmission TEXT,
    exterior_color TEXT,
    interior_color TEXT,
    msrp TEXT,
    invoice_price TEXT,
    features TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT
);

CREATE TABLE IF NOT EXISTS listings (
    dealer_id INTEGER NOT NULL REFERENCES dealers(id) ON DELETE CASCADE,
    vin TEXT NOT NULL REFERENCES vehicles(vin) ON DELETE CASCADE,
    vdp_url TEXT,
    stock_number TEXT,
    status TEXT NOT NULL,
    advertised_price TEXT,
    price_delta_msrp TEXT,
    first_seen_at TEXT NOT NULL,
    last_seen_at TEXT NOT NULL,
    source_rank INTEGER DEFAULT 100,
    PRIMARY KEY (dealer_id, vin)
);

CREATE TABLE IF NOT EXISTS observations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id TEXT NOT NULL,
    observed_at TEXT NOT NULL,
    dealer_id INTEGER NOT NULL REFERENCES dealers(id),
    vin TEXT NOT NULL,
    vdp_url TEXT,
    advertised_price TEXT,
    msrp TEXT,
    payload TEXT,
    raw_blob_key TEXT,
    source TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS price_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    dealer_id INTEGER NOT NULL,
    vin TEXT NOT NULL,
    observed_at TEXT NOT NULL,
    old_price TEXT,
    new_price TEXT,
    delta TEXT,
    pct TEXT
);

CREATE TABLE IF NOT EXISTS scrape_jobs (
    id TEXT PRIMARY KEY,
    created_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT,
    model TEXT,
    region TEXT,
    status TEXT,
    target_count INTEGER,
    success_count INTEGER,
    fail_count INTEGER,
    notes TEXT
);

CREATE TABLE IF NOT EXISTS scrape_tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id TEXT REFERENCES scrape_jobs(id) ON DELETE CASCADE,
    dealer_id INTEGER NOT NULL,
    url TEXT NOT NULL,
    attempt INTEGER DEFAULT 1,
    status TEXT,
    http_status INTEGER,
    error TEXT,
    started_at TEXT,
    completed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_listings_status ON listings(status);
CREATE INDEX IF NOT EXISTS idx_listings_dealer_seen ON listings(dealer_id, last_seen_at);
CREATE INDEX IF NOT EXISTS idx_listings_status_price ON listings(status, advertised_price);
CREATE INDEX IF NOT EXISTS idx_listings_delta ON listings(price_delta_msrp);
CREATE INDEX IF NOT EXISTS idx_vehicles_model_year ON vehicles(model, year);
CREATE INDEX IF NOT EXISTS idx_vehicles_features ON vehicles(features);
CREATE INDEX IF NOT EXISTS idx_dealers_region ON dealers(region);
CREATE INDEX IF NOT EXISTS idx_observations_dealer_vin
    ON observations(dealer_id, vin, observed_at);
CREATE INDEX IF NOT EXISTS idx_price_events_vin ON price_events(vin, observed_at);
"#;

/// Shared handle over the SQLite store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

/// Partial update applied to a scrape task row.
#[derive(Debug, Default, Clone)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub attempt: Option<i64>,
    pub http_status: Option<i64>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

pub(crate) fn decimal_to_sql(value: Option<Decimal>) -> Option<String> {
    value.map(|d| d.to_string())
}

pub(crate) fn decimal_from_sql(value: Option<String>) -> Option<Decimal> {
    value.and_then(|text| Decimal::from_str(&text).ok())
}

pub(crate) fn datetime_to_sql(value: DateTime<Utc>) -> String {
    value.to_rfc3339()
}

pub(crate) fn datetime_from_sql(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn listing_from_row(row: &Row<'_>) -> rusqlite::Result<Listing> {
    let status: String = row.get("status")?;
    let first_seen: String = row.get("first_seen_at")?;
    let last_seen: String = row.get("last_seen_at")?;
    Ok(Listing {
        dealer_id: row.get("dealer_id")?,
        vin: row.get("vin")?,
        vdp_url: row.get("vdp_url")?,
        stock_number: row.get("stock_number")?,
        status: ListingStatus::parse(&status).unwrap_or(ListingStatus::Available),
        advertised_price: decimal_from_sql(row.get("advertised_price")?),
        price_delta_msrp: decimal_from_sql(row.get("price_delta_msrp")?),
        first_seen_at: datetime_from_sql(&first_seen).unwrap_or_else(Utc::now),
        last_seen_at: datetime_from_sql(&last_seen).unwrap_or_else(Utc::now),
        source_rank: row.get("source_rank")?,
    })
}

impl Store {
    pub fn open(path: &Path) -> rusqlite::Result<Store> {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Store {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> rusqlite::Result<Store> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Store {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a closure against the exclusive connection. Batch writers use
    /// this to scope a `BEGIN IMMEDIATE` … `COMMIT` window.
    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> rusqlite::Result<T> {
        let conn = self.conn.lock();
        f(&conn)
    }

    // ---- dealers ----

    pub fn insert_dealer(&self, dealer: &Dealer) -> rusqlite::Result<()> {
        let conn = self.conn.lock();
        let config = serde_json::to_string(&dealer.scraping_config).unwrap_or_default();
        conn.execute(
            "INSERT OR REPLACE INTO dealers
             (id, name, code, region, homepage_url, backend_type, inventory_url_template,
              scraping_config, is_active, last_scraped_at, district_code, phone, city, state, postal_code)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                dealer.id,
                dealer.name,
                dealer.code,
                dealer.region,
                dealer.homepage_url,
                dealer.backend_type,
                dealer.inventory_url_template,
                config,
                dealer.is_active as i64,
                dealer.last_scraped_at.map(datetime_to_sql),
                dealer.district_code,
                dealer.phone,
                dealer.city,
                dealer.state,
                dealer.postal_code,
            ],
        )?;
        Ok(())
    }

    pub fn load_active_dealers(&self) -> rusqlite::Result<Vec<Dealer>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, name, code, region, homepage_url, backend_type, inventory_url_template,
                    scraping_config, is_active, last_scraped_at, district_code, phone, city,
                    state, postal_code
             FROM dealers WHERE is_active = 1 ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            let config_raw: Option<String> = row.get("scraping_config")?;
            let last_scraped: Option<String> = row.get("last_scraped_at")?;
            Ok(Dealer {
                id: row.get("id")?,
                name: row.get("name")?,
                code: row.get("code")?,
                region: row.get("region")?,
                homepage_url: row.get("homepage_url")?,
                backend_type: row.get("backend_type")?,
                inventory_url_template: row.get("inventory_url_template")?,
                scraping_config: ScrapingConfig::from_json(config_raw.as_deref()),
                is_active: row.get::<_, i64>("is_active")? != 0,
                last_scraped_at: last_scraped.as_deref().and_then(datetime_from_sql),
                district_code: row.get("district_code")?,
                phone: row.get("phone")?,
                city: row.get("city")?,
                state: row.get("state")?,
                postal_code: row.get("postal_code")?,
            })
        })?;
        rows.collect()
    }

    pub fn touch_dealer_last_scraped(
        &self,
        dealer_id: i64,
        at: DateTime<Utc>,
    ) -> rusqlite::Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE dealers SET last_scraped_at = ?1 WHERE id = ?2",
            params![datetime_to_sql(at), dealer_id],
        )?;
        Ok(())
    }

    // ---- jobs & tasks ----

    pub fn create_job(
        &self,
        id: Uuid,
        model: &str,
        region: Option<&str>,
        target_count: usize,
        started_at: DateTime<Utc>,
    ) -> rusqlite::Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO scrape_jobs
             (id, created_at, started_at, model, region, status, target_count, success_count, fail_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, 0)",
            params![
                id.to_string(),
                datetime_to_sql(started_at),
                datetime_to_sql(started_at),
                model,
                region,
                JobStatus::Running.as_str(),
                target_count as i64,
            ],
        )?;
        Ok(())
    }

    pub fn finalize_job(
        &self,
        id: Uuid,
        status: JobStatus,
        success_count: usize,
        fail_count: usize,
        completed_at: DateTime<Utc>,
    ) -> rusqlite::Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE scrape_jobs
             SET status = ?1, success_count = ?2, fail_count = ?3, completed_at = ?4
             WHERE id = ?5",
            params![
                status.as_str(),
                success_count as i64,
                fail_count as i64,
                datetime_to_sql(completed_at),
                id.to_string(),
            ],
        )?;
        Ok(())
    }

    pub fn job_row(&self, id: Uuid) -> rusqlite::Result<Option<(JobStatus, i64, i64, i64)>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT status, target_count, success_count, fail_count FROM scrape_jobs WHERE id = ?1",
            params![id.to_string()],
            |row| {
                let status: String = row.get(0)?;
                let status = match status.as_str() {
                    "pending" => JobStatus::Pending,
                    "running" => JobStatus::Running,
                    "success" => JobStatus::Success,
                    "partial" => JobStatus::Partial,
                    _ => JobStatus::Failed,
                };
                Ok((status, row.get(1)?, row.get(2)?, row.get(3)?))
            },
        )
        .optional()
    }

    pub fn create_task(
        &self,
        job_id: Uuid,
        dealer_id: i64,
        url: &str,
        status: TaskStatus,
        error: Option<&str>,
        started_at: Option<DateTime<Utc>>,
        completed_at: Option<DateTime<Utc>>,
    ) -> rusqlite::Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO scrape_tasks
             (job_id, dealer_id, url, attempt, status, error, started_at, completed_at)
             VALUES (?1, ?2, ?3, 1, ?4, ?5, ?6, ?7)",
            params![
                job_id.to_string(),
                dealer_id,
                url,
                status.as_str(),
                error,
                started_at.map(datetime_to_sql),
                completed_at.map(datetime_to_sql),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn update_task(&self, task_id: i64, update: TaskUpdate) -> rusqlite::Result<()> {
        let conn = self.conn.lock();
        if let Some(status) = update.status {
            conn.execute(
                "UPDATE scrape_tasks SET status = ?1 WHERE id = ?2",
                params![status.as_str(), task_id],
            )?;
        }
        if let Some(attempt) = update.attempt {
            conn.execute(
                "UPDATE scrape_tasks SET attempt = ?1 WHERE id = ?2",
                params![attempt, task_id],
            )?;
        }
        if let Some(http_status) = update.http_status {
            conn.execute(
                "UPDATE scrape_tasks SET http_status = ?1 WHERE id = ?2",
                params![http_status, task_id],
            )?;
        }
        if let Some(error) = update.error {
            conn.execute(
                "UPDATE scrape_tasks SET error = ?1 WHERE id = ?2",
                params![error, task_id],
            )?;
        }
        if let Some(started_at) = update.started_at {
            conn.execute(
                "UPDATE scrape_tasks SET started_at = ?1 WHERE id = ?2",
                params![datetime_to_sql(started_at), task_id],
            )?;
        }
        if let Some(completed_at) = update.completed_at {
            conn.execute(
                "UPDATE scrape_tasks SET completed_at = ?1 WHERE id = ?2",
                params![datetime_to_sql(completed_at), task_id],
            )?;
        }
        Ok(())
    }

    pub fn tasks_for_job(&self, job_id: Uuid) -> rusqlite::Result<Vec<ScrapeTaskRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, job_id, dealer_id, url, attempt, status, http_status, error,
                    started_at, completed_at
             FROM scrape_tasks WHERE job_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![job_id.to_string()], |row| {
            let job_id_raw: String = row.get("job_id")?;
            let status_raw: Option<String> = row.get("status")?;
            let started: Option<String> = row.get("started_at")?;
            let completed: Option<String> = row.get("completed_at")?;
            Ok(ScrapeTaskRow {
                id: row.get("id")?,
                job_id: Uuid::parse_str(&job_id_raw).unwrap_or(Uuid::nil()),
                dealer_id: row.get("dealer_id")?,
                url: row.get("url")?,
                attempt: row.get("attempt")?,
                status: status_raw
                    .as_deref()
                    .and_then(TaskStatus::parse)
                    .unwrap_or(TaskStatus::Pending),
                http_status: row.get("http_status")?,
                error: row.get("error")?,
                started_at: started.as_deref().and_then(datetime_from_sql),
                completed_at: completed.as_deref().and_then(datetime_from_sql),
            })
        })?;
        rows.collect()
    }

    // ---- read accessors (tests, reconcilers) ----

    pub fn get_vehicle(&self, vin: &str) -> rusqlite::Result<Option<Vehicle>> {
        let conn = self.conn.lock();
        get_vehicle_on(&conn, vin)
    }

    pub fn get_listing(&self, dealer_id: i64, vin: &str) -> rusqlite::Result<Option<Listing>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT dealer_id, vin, vdp_url, stock_number, status, advertised_price,
                    price_delta_msrp, first_seen_at, last_seen_at, source_rank
             FROM listings WHERE dealer_id = ?1 AND vin = ?2",
            params![dealer_id, vin],
            listing_from_row,
        )
        .optional()
    }

    pub fn observations_for(&self, dealer_id: i64, vin: &str) -> rusqlite::Result<Vec<Observation>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, job_id, observed_at, dealer_id, vin, vdp_url, advertised_price, msrp,
                    payload, raw_blob_key, source
             FROM observations WHERE dealer_id = ?1 AND vin = ?2 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![dealer_id, vin], |row| {
            let job_id_raw: String = row.get("job_id")?;
            let observed_at: String = row.get("observed_at")?;
            let payload_raw: Option<String> = row.get("payload")?;
            Ok(Observation {
                id: row.get("id")?,
                job_id: Uuid::parse_str(&job_id_raw).unwrap_or(Uuid::nil()),
                observed_at: datetime_from_sql(&observed_at).unwrap_or_else(Utc::now),
                dealer_id: row.get("dealer_id")?,
                vin: row.get("vin")?,
                vdp_url: row.get("vdp_url")?,
                advertised_price: decimal_from_sql(row.get("advertised_price")?),
                msrp: decimal_from_sql(row.get("msrp")?),
                payload: payload_raw
                    .and_then(|raw| serde_json::from_str(&raw).ok())
                    .unwrap_or(serde_json::Value::Null),
                raw_blob_key: row.get("raw_blob_key")?,
                source: row.get("source")?,
            })
        })?;
        rows.collect()
    }

    pub fn price_events_for(&self, dealer_id: i64, vin: &str) -> rusqlite::Result<Vec<PriceEvent>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, dealer_id, vin, observed_at, old_price, new_price, delta, pct
             FROM price_events WHERE dealer_id = ?1 AND vin = ?2 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![dealer_id, vin], |row| {
            let observed_at: String = row.get("observed_at")?;
            Ok(PriceEvent {
                id: row.get("id")?,
                dealer_id: row.get("dealer_id")?,
                vin: row.get("vin")?,
                observed_at: datetime_from_sql(&observed_at).unwrap_or_else(Utc::now),
                old_price: decimal_from_sql(row.get("old_price")?),
                new_price: decimal_from_sql(row.get("new_price")?),
                delta: decimal_from_sql(row.get("delta")?),
                pct: decimal_from_sql(row.get("pct")?),
            })
        })?;
        rows.collect()
    }
}

/// Fetch a vehicle on an already-held connection (reconciler path).
pub(crate) fn get_vehicle_on(conn: &Connection, vin: &str) -> rusqlite::Result<Option<Vehicle>> {
    conn.query_row(
        "SELECT vin, make, model, year, trim, drivetrain, transmission, exterior_color,
                interior_color, msrp, invoice_price, features, created_at, updated_at
         FROM vehicles WHERE vin = ?1",
        params![vin],
        |row| {
            let features_raw: Option<String> = row.get("features")?;
            let created_at: String = row.get("created_at")?;
            let updated_at: Option<String> = row.get("updated_at")?;
            Ok(Vehicle {
                vin: row.get("vin")?,
                make: row.get("make")?,
                model: row.get("model")?,
                year: row.get("year")?,
                trim: row.get("trim")?,
                drivetrain: row.get("drivetrain")?,
                transmission: row.get("transmission")?,
                exterior_color: row.get("exterior_color")?,
                interior_color: row.get("interior_color")?,
                msrp: decimal_from_sql(row.get("msrp")?),
                invoice_price: decimal_from_sql(row.get("invoice_price")?),
                features: features_raw.and_then(|raw| serde_json::from_str(&raw).ok()),
                created_at: datetime_from_sql(&created_at).unwrap_or_else(Utc::now),
                updated_at: updated_at.as_deref().and_then(datetime_from_sql),
            })
        },
    )
    .optional()
}

/// Fetch a listing on an already-held connection (reconciler path).
pub(crate) fn get_listing_on(
    conn: &Connection,
    dealer_id: i64,
    vin: &str,
) -> rusqlite::Result<Option<Listing>> {
    conn.query_row(
        "SELECT dealer_id, vin, vdp_url, stock_number, status, advertised_price,
                price_delta_msrp, first_seen_at, last_seen_at, source_rank
         FROM listings WHERE dealer_id = ?1 AND vin = ?2",
        params![dealer_id, vin],
        listing_from_row,
    )
    .optional()
}

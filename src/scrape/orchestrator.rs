//! Scrape job orchestration.
//!
//! Fans one task per dealer into a pool bounded by the concurrency
//! semaphore, with every fetch paying the shared token bucket. Parsing,
//! fallback chains and API follow-ups run here so the parsers stay pure.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::future::join_all;
use serde_json::json;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::db::{Store, TaskUpdate};
use crate::errors::{ParseError, ScrapeError};
use crate::ingest::{reconcile_absent_listings, upsert_observations_and_listings};
use crate::ingest::SOURCE_RANK_INVENTORY;
use crate::models::{
    Backend, Dealer, IngestRow, JobStatus, JobSummary, ParsedRow, Source, TaskStatus,
    VehicleFields,
};
use crate::parsers::url_builder::{build_inventory_url, model_tokens};
use crate::parsers::{
    cdk, dealer_alchemy, dealer_inspire, dealer_on, smartpath, team_velocity,
    heuristic_for, SMARTPATH_FALLBACK_CHAIN,
};
use crate::scrape::blob_store::{BlobStore, LocalBlobStore};
use crate::scrape::fetch_client::{FetchClient, FetchResult};
use crate::scrape::followup::BackendApi;
use crate::scrape::rate_limit::TokenBucket;

/// Default requests-per-minute budget for one job.
pub const DEFAULT_RPM_LIMIT: u32 = 500;
/// Default concurrency gate width; floored at 5 so wide jobs cannot starve.
pub const DEFAULT_MAX_CONCURRENCY: usize = 50;
const MIN_CONCURRENCY: usize = 5;
const ALGOLIA_HITS_PER_PAGE: u32 = 60;

/// Fetch seam used by the orchestrator; `FetchClient` is the production
/// implementation, tests script results.
#[async_trait]
pub trait InventoryFetcher: Send + Sync {
    async fn fetch(
        &self,
        url: &str,
        allow_extract_fallback: bool,
        proxy: Option<&str>,
    ) -> Result<FetchResult, ScrapeError>;
}

#[async_trait]
impl InventoryFetcher for FetchClient {
    async fn fetch(
        &self,
        url: &str,
        allow_extract_fallback: bool,
        proxy: Option<&str>,
    ) -> Result<FetchResult, ScrapeError> {
        FetchClient::fetch(self, url, allow_extract_fallback, proxy).await
    }
}

struct TaskMeta {
    task_id: i64,
    dealer: Dealer,
    url: String,
}

/// Per-job shared limiters.
struct JobLimits {
    bucket: TokenBucket,
    gate: Semaphore,
}

/// Drives scrape jobs end to end.
pub struct Orchestrator {
    store: Store,
    fetcher: Arc<dyn InventoryFetcher>,
    api: Arc<dyn BackendApi>,
    blobs: Arc<dyn BlobStore>,
    max_attempts: usize,
    rpm_limit: u32,
    max_concurrency: usize,
    cancelled: Arc<AtomicBool>,
}

impl Orchestrator {
    pub fn new(
        store: Store,
        fetcher: Arc<dyn InventoryFetcher>,
        api: Arc<dyn BackendApi>,
        blobs: Arc<dyn BlobStore>,
    ) -> Self {
        Orchestrator {
            store,
            fetcher,
            api,
            blobs,
            max_attempts: 2,
            rpm_limit: DEFAULT_RPM_LIMIT,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_limits(mut self, rpm_limit: u32, max_concurrency: usize) -> Self {
        self.rpm_limit = rpm_limit.max(1);
        self.max_concurrency = max_concurrency.max(MIN_CONCURRENCY);
        self
    }

    /// Flag observed by every task at its next suspension point.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    /// Run one job: a task per dealer, all for one model.
    pub async fn run_job(&self, dealers: Vec<Dealer>, model: &str) -> anyhow::Result<JobSummary> {
        if dealers.is_empty() {
            anyhow::bail!("no dealers provided for scrape job");
        }

        let started_at = Utc::now();
        let job_id = Uuid::new_v4();
        let target_count = dealers.len();
        self.store
            .create_job(job_id, model, None, target_count, started_at)?;
        info!(%job_id, model, dealers = target_count, "scrape job started");

        let mut build_failures = 0usize;
        let mut tasks_meta = Vec::new();
        for dealer in dealers {
            match build_inventory_url(&dealer, model) {
                Ok(url) => {
                    let task_id = self.store.create_task(
                        job_id,
                        dealer.id,
                        &url,
                        TaskStatus::Pending,
                        None,
                        None,
                        None,
                    )?;
                    tasks_meta.push(TaskMeta {
                        task_id,
                        dealer,
                        url,
                    });
                }
                Err(err) => {
                    warn!(dealer_id = dealer.id, error = %err, "url build failed");
                    self.store.create_task(
                        job_id,
                        dealer.id,
                        "",
                        TaskStatus::Failed,
                        Some(&err.to_string()),
                        Some(started_at),
                        Some(started_at),
                    )?;
                    build_failures += 1;
                }
            }
        }

        let limits = Arc::new(JobLimits {
            bucket: TokenBucket::new(self.rpm_limit),
            gate: Semaphore::new(self.max_concurrency.max(MIN_CONCURRENCY)),
        });

        let results = join_all(
            tasks_meta
                .into_iter()
                .map(|meta| self.process_task(job_id, meta, model, Arc::clone(&limits))),
        )
        .await;

        let success_count = results.iter().filter(|ok| **ok).count();
        let fail_count = results.len() - success_count + build_failures;
        let status = if fail_count == 0 {
            JobStatus::Success
        } else if success_count > 0 {
            JobStatus::Partial
        } else {
            JobStatus::Failed
        };

        let completed_at = Utc::now();
        self.store
            .finalize_job(job_id, status, success_count, fail_count, completed_at)?;
        info!(%job_id, status = status.as_str(), success_count, fail_count, "scrape job finished");

        Ok(JobSummary {
            job_id,
            status,
            target_count,
            success_count,
            fail_count,
            started_at,
            completed_at,
        })
    }

    /// Returns true when the task ends in `success`.
    async fn process_task(
        &self,
        job_id: Uuid,
        meta: TaskMeta,
        model: &str,
        limits: Arc<JobLimits>,
    ) -> bool {
        let TaskMeta {
            task_id,
            dealer,
            url,
        } = meta;

        let backend = match dealer.backend() {
            Some(backend) => backend,
            None => {
                self.fail_task(
                    task_id,
                    &ScrapeError::UnknownBackend(dealer.backend_type.clone()),
                )
                .await;
                return false;
            }
        };

        let observed_at = Utc::now();
        let _ = self.store.update_task(
            task_id,
            TaskUpdate {
                status: Some(TaskStatus::Running),
                started_at: Some(observed_at),
                ..Default::default()
            },
        );

        let mut last_error: Option<ScrapeError> = None;
        for attempt in 0..self.max_attempts {
            if self.cancelled.load(Ordering::Relaxed) {
                self.fail_task(task_id, &ScrapeError::Cancelled).await;
                return false;
            }
            if attempt > 0 {
                let _ = self.store.update_task(
                    task_id,
                    TaskUpdate {
                        attempt: Some(attempt as i64 + 1),
                        ..Default::default()
                    },
                );
            }

            limits.bucket.acquire(1).await;
            let proxy = dealer
                .scraping_config
                .fetch
                .as_ref()
                .and_then(|hints| hints.proxy.as_deref());
            let result = {
                let _permit = limits.gate.acquire().await.expect("gate never closed");
                let allow_extract = attempt + 1 == self.max_attempts;
                self.fetcher.fetch(&url, allow_extract, proxy).await
            };

            let fetched = match result {
                Ok(fetched) => fetched,
                Err(err) if err.is_retryable() => {
                    debug!(dealer_id = dealer.id, attempt, error = %err, "retryable fetch failure");
                    last_error = Some(err);
                    continue;
                }
                Err(err) => {
                    self.fail_task(task_id, &err).await;
                    return false;
                }
            };

            if self.cancelled.load(Ordering::Relaxed) {
                self.fail_task(task_id, &ScrapeError::Cancelled).await;
                return false;
            }

            let parsed = self
                .parse_with_fallbacks(backend, &fetched, &dealer, model, &url, &limits)
                .await;
            let (rows, discovered_backend) = match parsed {
                Ok(outcome) => outcome,
                Err(err) => {
                    self.fail_task(task_id, &err).await;
                    return false;
                }
            };

            match self
                .persist_outcome(
                    job_id,
                    &dealer,
                    backend,
                    discovered_backend,
                    &url,
                    rows,
                    model,
                    &fetched,
                )
                .await
            {
                Ok(()) => {
                    let _ = self.store.update_task(
                        task_id,
                        TaskUpdate {
                            status: Some(TaskStatus::Success),
                            completed_at: Some(Utc::now()),
                            ..Default::default()
                        },
                    );
                    return true;
                }
                Err(err) => {
                    self.fail_task(task_id, &err).await;
                    return false;
                }
            }
        }

        // Retryable failures escalate to terminal once the budget is spent.
        let err = ScrapeError::FetchTerminal(
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "attempts exhausted".to_string()),
        );
        self.fail_task(task_id, &err).await;
        false
    }

    async fn fail_task(&self, task_id: i64, err: &ScrapeError) {
        let _ = self.store.update_task(
            task_id,
            TaskUpdate {
                status: Some(TaskStatus::Failed),
                error: Some(err.to_string()),
                completed_at: Some(Utc::now()),
                ..Default::default()
            },
        );
    }

    /// Cancellation gate shared by every suspension point: attempt loops,
    /// fallback sweeps and API follow-ups all observe the flag before
    /// touching the network or the limiters.
    fn check_cancelled(&self) -> Result<(), ScrapeError> {
        if self.cancelled.load(Ordering::Relaxed) {
            return Err(ScrapeError::Cancelled);
        }
        Ok(())
    }

    /// Dispatch the backend parser, running the DealerOn/SmartPath fallback
    /// chains on their parse errors. Returns the rows plus the backend that
    /// actually produced them when a fallback rerouted the page.
    async fn parse_with_fallbacks(
        &self,
        backend: Backend,
        fetched: &FetchResult,
        dealer: &Dealer,
        model: &str,
        url: &str,
        limits: &JobLimits,
    ) -> Result<(Vec<ParsedRow>, Option<Backend>), ScrapeError> {
        match backend {
            Backend::DealerOn => {
                let raw = fetched.raw_content();
                match self.parse_dealeron(raw, limits).await {
                    Ok(rows) => Ok((rows, None)),
                    Err(err @ ScrapeError::Parse(ParseError::DealerOn(_))) => {
                        let lowered = raw.to_lowercase();
                        if lowered.contains("smartpath") {
                            debug!(dealer_id = dealer.id, "DealerOn page looks like SmartPath, rerouting");
                            let rows = self.parse_smartpath(raw, limits).await?;
                            return Ok((rows, Some(Backend::SmartPath)));
                        }
                        if lowered.contains("teamvelocityportal")
                            || lowered.contains("inventoryapibaseurl")
                        {
                            debug!(dealer_id = dealer.id, "DealerOn page looks like Team Velocity, rerouting");
                            let content = with_synthetic_canonical(raw, url);
                            let rows = team_velocity::parse_inventory(&content)?;
                            return Ok((rows, Some(Backend::TeamVelocity)));
                        }
                        Err(err)
                    }
                    Err(err) => Err(err),
                }
            }
            Backend::SmartPath => {
                let raw = fetched.raw_content();
                match self.parse_smartpath(raw, limits).await {
                    Ok(rows) => Ok((rows, None)),
                    Err(original @ ScrapeError::Parse(ParseError::SmartPath(_))) => {
                        match self
                            .smartpath_candidate_sweep(dealer, model, limits)
                            .await?
                        {
                            Some((rows, discovered)) => Ok((rows, Some(discovered))),
                            None => Err(original),
                        }
                    }
                    Err(err) => Err(err),
                }
            }
            Backend::TeamVelocity => {
                let rows = team_velocity::parse_inventory(fetched.raw_content())?;
                Ok((rows, None))
            }
            _ => {
                let parse = heuristic_for(backend)
                    .ok_or_else(|| ScrapeError::UnknownBackend(backend.as_str().to_string()))?;
                let mut rows = parse(fetched.best_content());
                if rows.is_empty() && backend.has_api_followup() {
                    rows = self
                        .api_followup(backend, fetched.raw_content(), model, url, limits)
                        .await?;
                }
                Ok((rows, None))
            }
        }
    }

    async fn parse_dealeron(
        &self,
        raw: &str,
        limits: &JobLimits,
    ) -> Result<Vec<ParsedRow>, ScrapeError> {
        let page = dealer_on::extract_config(raw)?;
        if page.empty_srp {
            return Ok(Vec::new());
        }
        self.check_cancelled()?;
        limits.bucket.acquire(1).await;
        let payload = self.api.dealeron_inventory(&page).await?;
        if payload.is_null() {
            return Ok(Vec::new());
        }
        Ok(dealer_on::parse_api_response(&payload, &page.host))
    }

    async fn parse_smartpath(
        &self,
        raw: &str,
        limits: &JobLimits,
    ) -> Result<Vec<ParsedRow>, ScrapeError> {
        let page = smartpath::extract_config(raw)?;
        self.check_cancelled()?;
        limits.bucket.acquire(1).await;
        let payload = self.api.smartpath_search(&page).await?;
        Ok(smartpath::parse_documents(&payload, &page.dealer_host))
    }

    /// SmartPath fallback: probe a short list of conventional inventory URLs
    /// and accept the first parser in the chain that yields rows.
    async fn smartpath_candidate_sweep(
        &self,
        dealer: &Dealer,
        model: &str,
        limits: &JobLimits,
    ) -> Result<Option<(Vec<ParsedRow>, Backend)>, ScrapeError> {
        let homepage = match &dealer.homepage_url {
            Some(homepage) => homepage.trim_end_matches('/').to_string(),
            None => return Ok(None),
        };
        let slug = match model_tokens(model) {
            Some(tokens) => tokens.slug,
            None => return Ok(None),
        };

        let candidates = [
            format!("{homepage}/inventory/new/toyota/{slug}"),
            format!("{homepage}/inventory/new/{slug}"),
            format!("{homepage}/inventory/new-toyota-{slug}"),
            format!("{homepage}/inventory/new-{slug}"),
        ];

        for candidate in candidates {
            self.check_cancelled()?;
            limits.bucket.acquire(1).await;
            let fetched = {
                let _permit = limits.gate.acquire().await.expect("gate never closed");
                match self.fetcher.fetch(&candidate, false, None).await {
                    Ok(fetched) => fetched,
                    Err(err) => {
                        debug!(url = %candidate, error = %err, "fallback candidate fetch failed");
                        continue;
                    }
                }
            };

            for chain_backend in SMARTPATH_FALLBACK_CHAIN {
                let rows = match self
                    .parse_as(*chain_backend, &fetched, &candidate, limits)
                    .await
                {
                    Ok(rows) => rows,
                    Err(_) => continue,
                };
                if !rows.is_empty() {
                    info!(
                        url = %candidate,
                        backend = chain_backend.as_str(),
                        "SmartPath fallback discovered a working backend"
                    );
                    return Ok(Some((rows, *chain_backend)));
                }
            }
        }
        Ok(None)
    }

    /// Parse one already-fetched page as a specific backend (fallback chain).
    async fn parse_as(
        &self,
        backend: Backend,
        fetched: &FetchResult,
        url: &str,
        limits: &JobLimits,
    ) -> Result<Vec<ParsedRow>, ScrapeError> {
        match backend {
            Backend::DealerOn => self.parse_dealeron(fetched.raw_content(), limits).await,
            Backend::SmartPath => self.parse_smartpath(fetched.raw_content(), limits).await,
            Backend::TeamVelocity => {
                let content = with_synthetic_canonical(fetched.raw_content(), url);
                Ok(team_velocity::parse_inventory(&content)?)
            }
            _ => {
                let parse = heuristic_for(backend)
                    .ok_or_else(|| ScrapeError::UnknownBackend(backend.as_str().to_string()))?;
                Ok(parse(fetched.best_content()))
            }
        }
    }

    /// Empty-heuristic rescue: query the backend's search API with
    /// credentials lifted from the page.
    async fn api_followup(
        &self,
        backend: Backend,
        raw: &str,
        model: &str,
        url: &str,
        limits: &JobLimits,
    ) -> Result<Vec<ParsedRow>, ScrapeError> {
        let origin = page_origin(url);
        match backend {
            Backend::Cdk => {
                let request = match cdk::extract_inventory_request(raw) {
                    Some(request) => request,
                    None => return Ok(Vec::new()),
                };
                self.check_cancelled()?;
                limits.bucket.acquire(1).await;
                let payload = self.api.cdk_inventory(&origin, &request).await?;
                Ok(cdk::parse_inventory_json(&payload, &origin))
            }
            Backend::DealerInspire => {
                let config = match dealer_inspire::extract_algolia_config(raw) {
                    Some(config) => config,
                    None => return Ok(Vec::new()),
                };
                let params =
                    dealer_inspire::build_algolia_params(&config, model, ALGOLIA_HITS_PER_PAGE);
                self.check_cancelled()?;
                limits.bucket.acquire(1).await;
                let payload = self.api.algolia_query(&config, &params).await?;
                Ok(dealer_inspire::parse_algolia_hits(&payload, &origin))
            }
            Backend::DealerAlchemy | Backend::DealerVenom | Backend::FoxDealer => {
                let config = match dealer_alchemy::extract_typesense_config(raw) {
                    Some(config) => config,
                    None => return Ok(Vec::new()),
                };
                self.check_cancelled()?;
                limits.bucket.acquire(1).await;
                let payload = self.api.typesense_search(&config, model).await?;
                Ok(dealer_alchemy::parse_typesense_hits(&payload, url))
            }
            _ => Ok(Vec::new()),
        }
    }

    /// Reconcile parsed rows (or record a legitimate empty inventory), store
    /// the raw capture, run the absence pass and stamp the dealer.
    #[allow(clippy::too_many_arguments)]
    async fn persist_outcome(
        &self,
        job_id: Uuid,
        dealer: &Dealer,
        backend: Backend,
        discovered_backend: Option<Backend>,
        url: &str,
        rows: Vec<ParsedRow>,
        model: &str,
        fetched: &FetchResult,
    ) -> Result<(), ScrapeError> {
        let observed_at = Utc::now();

        let raw_blob_key = if fetched.is_empty() {
            None
        } else {
            let key = LocalBlobStore::build_key(&job_id.to_string(), dealer.id, fetched.suffix());
            match self.blobs.put_text(&key, fetched.best_content()).await {
                Ok(key) => Some(key),
                Err(err) => {
                    warn!(dealer_id = dealer.id, error = %err, "raw blob write failed");
                    None
                }
            }
        };

        if rows.is_empty() {
            debug!(dealer_id = dealer.id, model, "empty inventory, running absence pass only");
            reconcile_absent_listings(&self.store, dealer.id, model, &HashSet::new())?;
            self.store.touch_dealer_last_scraped(dealer.id, observed_at)?;
            return Ok(());
        }

        let mut provenance = json!({
            "fetch": {
                "url": url,
                "backend": backend.as_str(),
                "source": fetched.source.as_str(),
            }
        });
        if let Some(discovered) = discovered_backend {
            provenance["fetch"]["fallback_backend"] = json!(discovered.as_str());
        }

        let mut observed_vins = HashSet::new();
        let mut prepared = Vec::with_capacity(rows.len());
        for row in rows {
            let vin = row.vin.trim().to_uppercase();
            observed_vins.insert(vin.clone());

            let mut ingest = IngestRow::new(dealer.id, vin);
            ingest.advertised_price = row.advertised_price;
            ingest.msrp = row.msrp;
            ingest.status = row.status;
            ingest.vdp_url = row.vdp_url;
            ingest.stock_number = row.stock_number;
            ingest.observed_at = Some(observed_at);
            ingest.job_id = Some(job_id.to_string());
            ingest.source = Some(Source::InventoryList);
            ingest.source_rank = Some(SOURCE_RANK_INVENTORY);
            ingest.payload = provenance.clone();
            ingest.raw_blob_key = raw_blob_key.clone();
            ingest.vehicle = VehicleFields {
                make: Some(row.make.unwrap_or_else(|| "Toyota".to_string())),
                model: Some(row.model.unwrap_or_else(|| model.to_string())),
                year: row.year,
                trim: row.trim,
                exterior_color: row.exterior_color,
                interior_color: row.interior_color,
                features: row.features,
                ..Default::default()
            };
            prepared.push(ingest);
        }

        let outcome =
            upsert_observations_and_listings(&self.store, &prepared, Source::InventoryList)?;
        debug!(
            dealer_id = dealer.id,
            observations = outcome.observations,
            price_events = outcome.price_events,
            "reconciled scrape batch"
        );

        reconcile_absent_listings(&self.store, dealer.id, model, &observed_vins)?;
        self.store.touch_dealer_last_scraped(dealer.id, observed_at)?;
        Ok(())
    }
}

/// Scheme + host of the page URL, for resolving relative VDP links.
fn page_origin(url: &str) -> String {
    Url::parse(url)
        .ok()
        .filter(|u| u.has_host())
        .map(|u| format!("{}://{}", u.scheme(), u.host_str().unwrap_or_default()))
        .unwrap_or_else(|| url.trim_end_matches('/').to_string())
}

/// Prepend a canonical link when the capture lacks one, so host-dependent
/// parsers can still resolve relative URLs.
fn with_synthetic_canonical(raw: &str, url: &str) -> String {
    if raw.contains("rel=\"canonical\"") || raw.contains("rel='canonical'") {
        return raw.to_string();
    }
    format!("<link rel=\"canonical\" href=\"{url}\" />\n{raw}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_origin_strips_path_and_query() {
        assert_eq!(
            page_origin("https://www.dealer.test/inventory/new?model=4Runner"),
            "https://www.dealer.test"
        );
        assert_eq!(page_origin("not a url"), "not a url");
    }

    #[test]
    fn synthetic_canonical_only_added_when_missing() {
        let raw = "<html></html>";
        let with = with_synthetic_canonical(raw, "https://d.test/page");
        assert!(with.starts_with("<link rel=\"canonical\" href=\"https://d.test/page\" />"));

        let already = "<link rel=\"canonical\" href=\"https://d.test/x\" /><html></html>";
        assert_eq!(with_synthetic_canonical(already, "https://d.test/page"), already);
    }
}

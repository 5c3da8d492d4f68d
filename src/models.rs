//! Core domain types shared across the scrape pipeline and the store.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Dealer website platform families. Each backend maps to one parsing
/// strategy; unknown backends fail the task instead of silently no-opping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    DealerInspire,
    DealerCom,
    DealerOn,
    Cdk,
    DealerAlchemy,
    DealerVenom,
    FoxDealer,
    SmartPath,
    DealerSocket,
    TeamVelocity,
}

/// Dealer ids known to run Team Velocity behind a generic storefront.
pub const TEAM_VELOCITY_DEALER_IDS: &[i64] = &[91, 109, 117, 208, 445];

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::DealerInspire => "DEALER_INSPIRE",
            Backend::DealerCom => "DEALER_COM",
            Backend::DealerOn => "DEALERON",
            Backend::Cdk => "CDK",
            Backend::DealerAlchemy => "DEALER_ALCHEMY",
            Backend::DealerVenom => "DEALER_VENOM",
            Backend::FoxDealer => "FOX_DEALER",
            Backend::SmartPath => "SMARTPATH",
            Backend::DealerSocket => "DEALER_SOCKET",
            Backend::TeamVelocity => "TEAM_VELOCITY",
        }
    }

    /// Parse a stored backend tag, accepting the legacy spellings that show
    /// up in dealer catalog exports.
    pub fn parse(raw: &str) -> Option<Backend> {
        let normalized = raw.trim().to_uppercase();
        match normalized.as_str() {
            "DEALER_INSPIRE" | "DEALERINSPIRE" => Some(Backend::DealerInspire),
            "DEALER_COM" | "DEALER.COM" => Some(Backend::DealerCom),
            "DEALERON" | "DEALER_ON" | "DEALER ON" => Some(Backend::DealerOn),
            "CDK" | "CDK_GLOBAL" => Some(Backend::Cdk),
            "DEALER_ALCHEMY" | "DEALERALCHEMIST.COM" => Some(Backend::DealerAlchemy),
            "DEALER_VENOM" | "DEALERVENOM" => Some(Backend::DealerVenom),
            "FOX_DEALER" | "FOXDEALER" => Some(Backend::FoxDealer),
            "SMARTPATH" => Some(Backend::SmartPath),
            "DEALER_SOCKET" | "DEALERSOCKET" => Some(Backend::DealerSocket),
            "TEAM_VELOCITY" | "TEAMVELOCITY" => Some(Backend::TeamVelocity),
            _ => None,
        }
    }

    /// Seed-time classification. SMARTPATH wins whenever the template
    /// mentions it; known dealer ids override to TEAM_VELOCITY; DEALER_SOCKET
    /// rows pointing at DealerOn infrastructure are coerced to DEALERON.
    pub fn classify(
        raw: &str,
        template: Option<&str>,
        homepage: Option<&str>,
        dealer_id: Option<i64>,
    ) -> Option<Backend> {
        let template_lower = template.unwrap_or_default().to_lowercase();
        if template_lower.contains("smartpath") {
            return Some(Backend::SmartPath);
        }
        if let Some(id) = dealer_id {
            if TEAM_VELOCITY_DEALER_IDS.contains(&id) {
                return Some(Backend::TeamVelocity);
            }
        }
        let backend = Backend::parse(raw)?;
        if backend == Backend::DealerSocket {
            let homepage_lower = homepage.unwrap_or_default().to_lowercase();
            if template_lower.contains("dealeron")
                || homepage_lower.contains("dealeron")
                || template_lower.contains("searchnew.aspx")
            {
                return Some(Backend::DealerOn);
            }
        }
        Some(backend)
    }

    /// Backends whose heuristic pass can be rescued by an API follow-up when
    /// it yields zero rows.
    pub fn has_api_followup(&self) -> bool {
        matches!(
            self,
            Backend::Cdk
                | Backend::DealerInspire
                | Backend::DealerAlchemy
                | Backend::DealerVenom
                | Backend::FoxDealer
        )
    }

}

/// Canonical listing status set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingStatus {
    Available,
    Sold,
    Missing,
    Pending,
    InTransit,
    Hold,
    BuildPhase,
}

impl ListingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListingStatus::Available => "available",
            ListingStatus::Sold => "sold",
            ListingStatus::Missing => "missing",
            ListingStatus::Pending => "pending",
            ListingStatus::InTransit => "in_transit",
            ListingStatus::Hold => "hold",
            ListingStatus::BuildPhase => "build_phase",
        }
    }

    pub fn parse(raw: &str) -> Option<ListingStatus> {
        match raw.trim().to_lowercase().as_str() {
            "available" => Some(ListingStatus::Available),
            "sold" => Some(ListingStatus::Sold),
            "missing" => Some(ListingStatus::Missing),
            "pending" => Some(ListingStatus::Pending),
            "in_transit" => Some(ListingStatus::InTransit),
            "hold" => Some(ListingStatus::Hold),
            "build_phase" => Some(ListingStatus::BuildPhase),
            _ => None,
        }
    }
}

/// Logical origin of an observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    InventoryList,
    Vdp,
    Upload,
    Import,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::InventoryList => "inventory_list",
            Source::Vdp => "vdp",
            Source::Upload => "upload",
            Source::Import => "import",
        }
    }
}

/// Whether an inventory URL template is already fully qualified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemplateScope {
    Absolute,
    #[default]
    Relative,
}

/// Per-dealer fetch hints (proxy tier etc.) carried inside scraping_config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FetchHints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
}

/// Scraping configuration stored as JSON on the dealer row.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScrapingConfig {
    #[serde(default)]
    pub template_scope: TemplateScope,
    /// Token overrides for URL expansion, e.g. {"city_code": "48911"}.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub tokens: HashMap<String, String>,
    #[serde(default, alias = "firecrawl", skip_serializing_if = "Option::is_none")]
    pub fetch: Option<FetchHints>,
}

impl ScrapingConfig {
    /// Parse the stored JSON blob, tolerating empty or malformed values the
    /// way the seeder leaves them.
    pub fn from_json(raw: Option<&str>) -> ScrapingConfig {
        raw.and_then(|text| serde_json::from_str(text).ok())
            .unwrap_or_default()
    }
}

/// A dealer catalog row. `backend_type` keeps the stored tag verbatim;
/// an unrecognized tag fails the dealer's task instead of silently
/// no-opping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dealer {
    pub id: i64,
    pub name: String,
    pub code: Option<String>,
    pub region: Option<String>,
    pub homepage_url: Option<String>,
    pub backend_type: String,
    pub inventory_url_template: Option<String>,
    #[serde(default)]
    pub scraping_config: ScrapingConfig,
    #[serde(default = "default_true")]
    pub is_active: bool,
    pub last_scraped_at: Option<DateTime<Utc>>,
    pub district_code: Option<String>,
    pub phone: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub postal_code: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Dealer {
    pub fn backend(&self) -> Option<Backend> {
        Backend::parse(&self.backend_type)
    }
}

/// Mutable vehicle attributes carried alongside a parsed row. Each field
/// overwrites the stored vehicle only when non-null.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VehicleFields {
    pub make: Option<String>,
    pub model: Option<String>,
    pub year: Option<i32>,
    pub trim: Option<String>,
    pub drivetrain: Option<String>,
    pub transmission: Option<String>,
    pub exterior_color: Option<String>,
    pub interior_color: Option<String>,
    pub msrp: Option<Decimal>,
    pub invoice_price: Option<Decimal>,
    pub features: Option<serde_json::Value>,
}

/// Normalized output of every inventory parser.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParsedRow {
    pub vin: String,
    pub advertised_price: Option<Decimal>,
    pub msrp: Option<Decimal>,
    pub vdp_url: Option<String>,
    pub stock_number: Option<String>,
    pub status: Option<ListingStatus>,
    pub image_url: Option<String>,
    pub make: Option<String>,
    pub model: Option<String>,
    pub year: Option<i32>,
    pub trim: Option<String>,
    pub exterior_color: Option<String>,
    pub interior_color: Option<String>,
    pub features: Option<serde_json::Value>,
}

impl ParsedRow {
    pub fn new(vin: impl Into<String>) -> Self {
        ParsedRow {
            vin: vin.into(),
            ..Default::default()
        }
    }
}

/// One fully-prepared row handed to the ingest reconciler.
#[derive(Debug, Clone)]
pub struct IngestRow {
    pub dealer_id: i64,
    pub vin: String,
    pub advertised_price: Option<Decimal>,
    pub msrp: Option<Decimal>,
    pub status: Option<ListingStatus>,
    pub vdp_url: Option<String>,
    pub stock_number: Option<String>,
    pub observed_at: Option<DateTime<Utc>>,
    pub job_id: Option<String>,
    pub source: Option<Source>,
    pub source_rank: Option<i64>,
    pub payload: serde_json::Value,
    pub raw_blob_key: Option<String>,
    pub vehicle: VehicleFields,
    /// Explicit seen-time overrides (upload/import ingest); scrape rows
    /// leave these unset and inherit observed_at.
    pub first_seen_at: Option<DateTime<Utc>>,
    pub last_seen_at: Option<DateTime<Utc>>,
}

impl IngestRow {
    pub fn new(dealer_id: i64, vin: impl Into<String>) -> Self {
        IngestRow {
            dealer_id,
            vin: vin.into(),
            advertised_price: None,
            msrp: None,
            status: None,
            vdp_url: None,
            stock_number: None,
            observed_at: None,
            job_id: None,
            source: None,
            source_rank: None,
            payload: serde_json::Value::Object(Default::default()),
            raw_blob_key: None,
            vehicle: VehicleFields::default(),
            first_seen_at: None,
            last_seen_at: None,
        }
    }
}

/// A stored vehicle row keyed by VIN.
#[derive(Debug, Clone)]
pub struct Vehicle {
    pub vin: String,
    pub make: String,
    pub model: String,
    pub year: Option<i32>,
    pub trim: Option<String>,
    pub drivetrain: Option<String>,
    pub transmission: Option<String>,
    pub exterior_color: Option<String>,
    pub interior_color: Option<String>,
    pub msrp: Option<Decimal>,
    pub invoice_price: Option<Decimal>,
    pub features: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// A stored listing keyed by (dealer_id, vin).
#[derive(Debug, Clone)]
pub struct Listing {
    pub dealer_id: i64,
    pub vin: String,
    pub vdp_url: Option<String>,
    pub stock_number: Option<String>,
    pub status: ListingStatus,
    pub advertised_price: Option<Decimal>,
    pub price_delta_msrp: Option<Decimal>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub source_rank: Option<i64>,
}

/// A stored price-change event.
#[derive(Debug, Clone)]
pub struct PriceEvent {
    pub id: i64,
    pub dealer_id: i64,
    pub vin: String,
    pub observed_at: DateTime<Utc>,
    pub old_price: Option<Decimal>,
    pub new_price: Option<Decimal>,
    pub delta: Option<Decimal>,
    pub pct: Option<Decimal>,
}

/// A stored observation row (append-only audit trail).
#[derive(Debug, Clone)]
pub struct Observation {
    pub id: i64,
    pub job_id: Uuid,
    pub observed_at: DateTime<Utc>,
    pub dealer_id: i64,
    pub vin: String,
    pub vdp_url: Option<String>,
    pub advertised_price: Option<Decimal>,
    pub msrp: Option<Decimal>,
    pub payload: serde_json::Value,
    pub raw_blob_key: Option<String>,
    pub source: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Success,
    Partial,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Partial => "partial",
            JobStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Success => "success",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<TaskStatus> {
        match raw {
            "pending" => Some(TaskStatus::Pending),
            "running" => Some(TaskStatus::Running),
            "success" => Some(TaskStatus::Success),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }
}

/// A stored scrape task row.
#[derive(Debug, Clone)]
pub struct ScrapeTaskRow {
    pub id: i64,
    pub job_id: Uuid,
    pub dealer_id: i64,
    pub url: String,
    pub attempt: i64,
    pub status: TaskStatus,
    pub http_status: Option<i64>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Final shape returned by `Orchestrator::run_job`.
#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub target_count: usize,
    pub success_count: usize,
    pub fail_count: usize,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_parse_accepts_legacy_spellings() {
        assert_eq!(Backend::parse("DEALERINSPIRE"), Some(Backend::DealerInspire));
        assert_eq!(Backend::parse("DEALER ON"), Some(Backend::DealerOn));
        assert_eq!(Backend::parse("CDK_GLOBAL"), Some(Backend::Cdk));
        assert_eq!(Backend::parse("DEALERALCHEMIST.COM"), Some(Backend::DealerAlchemy));
        assert_eq!(Backend::parse("what"), None);
    }

    #[test]
    fn classify_prefers_smartpath_templates() {
        let backend = Backend::classify(
            "DEALER_COM",
            Some("https://smartpath.example.com/inventory?model={model_plus}"),
            None,
            Some(7),
        );
        assert_eq!(backend, Some(Backend::SmartPath));
    }

    #[test]
    fn classify_coerces_dealer_socket_to_dealeron() {
        let backend = Backend::classify(
            "DEALER_SOCKET",
            Some("https://dealer.test/searchnew.aspx?model={model_plus}"),
            None,
            Some(12),
        );
        assert_eq!(backend, Some(Backend::DealerOn));
    }

    #[test]
    fn classify_uses_team_velocity_overrides() {
        let backend = Backend::classify("DEALER_COM", Some("/inventory"), None, Some(109));
        assert_eq!(backend, Some(Backend::TeamVelocity));
    }

    #[test]
    fn scraping_config_tolerates_garbage() {
        let cfg = ScrapingConfig::from_json(Some("not json"));
        assert_eq!(cfg.template_scope, TemplateScope::Relative);
        assert!(cfg.tokens.is_empty());

        let cfg = ScrapingConfig::from_json(Some(
            r#"{"template_scope":"absolute","tokens":{"city_code":"48911"},"firecrawl":{"proxy":"stealth"}}"#,
        ));
        assert_eq!(cfg.template_scope, TemplateScope::Absolute);
        assert_eq!(cfg.tokens.get("city_code").map(String::as_str), Some("48911"));
        assert_eq!(cfg.fetch.and_then(|f| f.proxy).as_deref(), Some("stealth"));
    }

    #[test]
    fn status_round_trips() {
        for status in [
            ListingStatus::Available,
            ListingStatus::Sold,
            ListingStatus::Missing,
            ListingStatus::Pending,
            ListingStatus::InTransit,
            ListingStatus::Hold,
            ListingStatus::BuildPhase,
        ] {
            assert_eq!(ListingStatus::parse(status.as_str()), Some(status));
        }
    }
}

//! Scrape orchestration: fetch client, limiters, blob sink, follow-up APIs
//! and the job driver.

pub mod blob_store;
pub mod fetch_client;
pub mod followup;
pub mod orchestrator;
pub mod rate_limit;

pub use blob_store::{BlobStore, LocalBlobStore};
pub use fetch_client::{FetchClient, FetchResult, FetchSource, HttpTransport};
pub use followup::{BackendApi, HttpBackendApi};
pub use orchestrator::{InventoryFetcher, Orchestrator};
pub use rate_limit::TokenBucket;

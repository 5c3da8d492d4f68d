//! Idempotent ingestion: observation upserts and absence transitions.

pub mod absence;
pub mod reconcile;

pub use absence::{reconcile_absent_listings, AbsenceOutcome};
pub use reconcile::{
    upsert_observations_and_listings, IngestOutcome, SOURCE_RANK_INVENTORY, SOURCE_RANK_UPLOAD,
};

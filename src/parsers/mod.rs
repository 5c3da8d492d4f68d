//! Backend-specific inventory parsers.
//!
//! Every parser is a pure function from captured page content to normalized
//! rows (or a typed follow-up config). HTTP stays in the orchestrator.

pub mod cdk;
pub mod common;
pub mod dealer_alchemy;
pub mod dealer_com;
pub mod dealer_inspire;
pub mod dealer_on;
pub mod dealer_socket;
pub mod smartpath;
pub mod team_velocity;
pub mod url_builder;

use crate::models::{Backend, ParsedRow};

/// Parser chain tried against SmartPath fallback candidate pages, in order.
pub const SMARTPATH_FALLBACK_CHAIN: &[Backend] = &[
    Backend::TeamVelocity,
    Backend::DealerInspire,
    Backend::DealerCom,
    Backend::DealerOn,
    Backend::DealerSocket,
    Backend::Cdk,
];

/// The line-scan parser for backends covered by the generic heuristic.
/// DealerOn, SmartPath and Team Velocity need config extraction + API or
/// structured-data handling and are dispatched by the orchestrator instead.
pub fn heuristic_for(backend: Backend) -> Option<fn(&str) -> Vec<ParsedRow>> {
    match backend {
        Backend::DealerInspire => Some(dealer_inspire::parse_inventory),
        Backend::DealerCom => Some(dealer_com::parse_inventory),
        Backend::Cdk => Some(cdk::parse_inventory),
        Backend::DealerAlchemy | Backend::DealerVenom | Backend::FoxDealer => {
            Some(dealer_alchemy::parse_inventory)
        }
        Backend::DealerSocket => Some(dealer_socket::parse_inventory),
        Backend::DealerOn | Backend::SmartPath | Backend::TeamVelocity => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heuristic_registry_covers_line_scan_backends() {
        for backend in [
            Backend::DealerInspire,
            Backend::DealerCom,
            Backend::Cdk,
            Backend::DealerAlchemy,
            Backend::DealerVenom,
            Backend::FoxDealer,
            Backend::DealerSocket,
        ] {
            assert!(heuristic_for(backend).is_some(), "{backend:?}");
        }
        assert!(heuristic_for(Backend::DealerOn).is_none());
        assert!(heuristic_for(Backend::SmartPath).is_none());
        assert!(heuristic_for(Backend::TeamVelocity).is_none());
    }
}

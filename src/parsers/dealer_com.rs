//! Dealer.com inventory parser (generic heuristic family).

use crate::models::{ListingStatus, ParsedRow};

use super::common::{parse_inventory_with_config, ParserConfig, DEFAULT_URL_KEYWORDS};

const STATUS_MAP: &[(&str, ListingStatus)] = &[
    ("IN TRANSIT", ListingStatus::InTransit),
    ("IN-TRANSIT", ListingStatus::InTransit),
    ("IN PRODUCTION", ListingStatus::InTransit),
    ("COMING SOON", ListingStatus::InTransit),
    ("SOLD", ListingStatus::Sold),
    ("AVAILABLE", ListingStatus::Available),
    ("IN STOCK", ListingStatus::Available),
    ("ON LOT", ListingStatus::Available),
];

const PRICE_KEYWORDS: &[(&str, u8)] = &[
    ("internet price", 1),
    ("dealer price", 1),
    ("sale price", 2),
    ("online price", 2),
    ("price", 4),
];

const CONFIG: ParserConfig = ParserConfig {
    status_map: STATUS_MAP,
    price_keywords: PRICE_KEYWORDS,
    url_keywords: DEFAULT_URL_KEYWORDS,
};

pub fn parse_inventory(content: &str) -> Vec<ParsedRow> {
    parse_inventory_with_config(content, &CONFIG)
}

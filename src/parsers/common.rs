//! Shared heuristics for dealer inventory pages captured as markdown/HTML.
//!
//! The generic pass strips tags, walks lines, anchors a record on each VIN
//! match and folds context lines into the current record. Per-backend
//! behavior is isolated in a `ParserConfig` (status vocabulary and the
//! priority-ranked price keyword table).

use std::collections::HashMap;
use std::str::FromStr;

use lazy_static::lazy_static;
use regex::Regex;
use rust_decimal::Decimal;

use crate::models::{ListingStatus, ParsedRow};

lazy_static! {
    pub static ref VIN_RE: Regex = Regex::new(r"(?i)\b[A-HJ-NPR-Z0-9]{17}\b").unwrap();
    static ref PRICE_RE: Regex =
        Regex::new(r"\$\s*([0-9]{1,3}(?:,[0-9]{3})*(?:\.[0-9]{2})?)").unwrap();
    static ref URL_RE: Regex = Regex::new(r#"(?i)https?://[^\s"')>]+"#).unwrap();
    static ref TAG_RE: Regex = Regex::new(r"<[^>]+>").unwrap();
    static ref STOCK_RE: Regex =
        Regex::new(r"(?i)stock\s*(?:#|number|no\.?)\s*[:\-]?\s*([A-Z0-9-]+)").unwrap();
}

/// Rank assigned to a price line that carries a `$` but none of the
/// configured keywords.
const BARE_DOLLAR_RANK: u8 = 5;

/// Per-backend knobs for the generic line scanner.
pub struct ParserConfig {
    /// Uppercase substring → canonical status.
    pub status_map: &'static [(&'static str, ListingStatus)],
    /// Lowercase keyword → priority rank (lower wins).
    pub price_keywords: &'static [(&'static str, u8)],
    pub url_keywords: &'static [&'static str],
}

pub const DEFAULT_URL_KEYWORDS: &[&str] = &["inventory", "vehicle", "vdp"];

/// Undo the handful of HTML entities that show up inside meta/link URLs.
pub fn unescape_html(text: &str) -> String {
    text.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
}

/// Parse the first `$1,234.56`-style amount out of a line.
pub fn parse_dollar_amount(text: &str) -> Option<Decimal> {
    let caps = PRICE_RE.captures(text)?;
    Decimal::from_str(&caps[1].replace(',', "")).ok()
}

fn extract_status(line: &str, config: &ParserConfig) -> Option<ListingStatus> {
    let upper = line.to_uppercase();
    config
        .status_map
        .iter()
        .find(|(pattern, _)| upper.contains(pattern))
        .map(|(_, status)| *status)
}

fn extract_stock(line: &str) -> Option<String> {
    STOCK_RE
        .captures(line)
        .map(|caps| caps[1].trim().to_string())
}

fn extract_vdp_url(line: &str, vin: &str, url_keywords: &[&str]) -> Option<String> {
    let vin_lower = vin.to_lowercase();
    for m in URL_RE.find_iter(line) {
        let url = m.as_str();
        let lowered = url.to_lowercase();
        if lowered.contains(&vin_lower) {
            return Some(url.to_string());
        }
        if url_keywords.iter().any(|kw| lowered.contains(kw)) {
            return Some(url.to_string());
        }
    }
    None
}

struct RecordState {
    row: ParsedRow,
    price_rank: u8,
}

impl RecordState {
    fn new(vin: String) -> Self {
        RecordState {
            row: ParsedRow::new(vin),
            price_rank: u8::MAX,
        }
    }

    fn apply_line(&mut self, line: &str, config: &ParserConfig) {
        if line.is_empty() {
            return;
        }
        let lower = line.to_lowercase();

        if let Some(price) = parse_dollar_amount(line) {
            if lower.contains("msrp") || lower.contains("sticker price") {
                if self.row.msrp.is_none() {
                    self.row.msrp = Some(price);
                }
            } else {
                let mut rank = config
                    .price_keywords
                    .iter()
                    .find(|(keyword, _)| lower.contains(keyword))
                    .map(|(_, rank)| *rank);
                if rank.is_none() && line.contains('$') {
                    rank = Some(BARE_DOLLAR_RANK);
                }
                if let Some(rank) = rank {
                    let better = rank < self.price_rank
                        || (rank == self.price_rank
                            && self
                                .row
                                .advertised_price
                                .map_or(true, |current| price < current));
                    if better {
                        self.row.advertised_price = Some(price);
                        self.price_rank = rank;
                    }
                }
            }
        }

        if self.row.stock_number.is_none() {
            if let Some(stock) = extract_stock(line) {
                self.row.stock_number = Some(stock);
            }
        }

        if let Some(status) = extract_status(line, config) {
            self.row.status = Some(status);
        }

        if self.row.vdp_url.is_none() {
            if let Some(url) = extract_vdp_url(line, &self.row.vin, config.url_keywords) {
                self.row.vdp_url = Some(url);
            }
        }
    }
}

/// Run the generic VIN-anchored scan. Rows come back in first-seen VIN order.
pub fn parse_inventory_with_config(content: &str, config: &ParserConfig) -> Vec<ParsedRow> {
    let cleaned = TAG_RE.replace_all(content, " ");
    if cleaned.trim().is_empty() {
        return Vec::new();
    }

    let mut records: Vec<RecordState> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut current: Option<usize> = None;

    for raw_line in cleaned.lines() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(m) = VIN_RE.find(line) {
            let vin = m.as_str().to_uppercase();
            let idx = *index.entry(vin.clone()).or_insert_with(|| {
                records.push(RecordState::new(vin));
                records.len() - 1
            });
            current = Some(idx);

            let remainder = format!("{} {}", &line[..m.start()], &line[m.end()..]);
            let remainder = remainder.trim();
            if !remainder.is_empty() {
                records[idx].apply_line(remainder, config);
            }
            continue;
        }

        if let Some(idx) = current {
            records[idx].apply_line(line, config);
        }
    }

    records.into_iter().map(|state| state.row).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const CONFIG: ParserConfig = ParserConfig {
        status_map: &[
            ("IN TRANSIT", ListingStatus::InTransit),
            ("SOLD", ListingStatus::Sold),
            ("AVAILABLE", ListingStatus::Available),
        ],
        price_keywords: &[("sale price", 1), ("internet price", 2), ("price", 4)],
        url_keywords: DEFAULT_URL_KEYWORDS,
    };

    #[test]
    fn anchors_records_on_vins_and_ranks_prices() {
        let content = "\
VIN: JTENU5JR4R5299999
MSRP $51,230
Price $48,000
Sale Price $47,500
Stock #: T12345
Status: In Transit
https://dealer.test/inventory/4runner-sr5
";
        let rows = parse_inventory_with_config(content, &CONFIG);
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.vin, "JTENU5JR4R5299999");
        // "sale price" rank 1 beats the bare "price" rank 4
        assert_eq!(row.advertised_price, Some(dec!(47500)));
        assert_eq!(row.msrp, Some(dec!(51230)));
        assert_eq!(row.stock_number.as_deref(), Some("T12345"));
        assert_eq!(row.status, Some(ListingStatus::InTransit));
        assert_eq!(
            row.vdp_url.as_deref(),
            Some("https://dealer.test/inventory/4runner-sr5")
        );
    }

    #[test]
    fn vin_bearing_urls_anchor_the_same_record() {
        // A VDP line whose URL embeds the VIN re-anchors the same record;
        // the URL (minus the VIN) still satisfies the keyword match.
        let content = "\
JTENU5JR4R5299999
Sale Price $47,500
https://dealer.test/inventory/jtenu5jr4r5299999
";
        let rows = parse_inventory_with_config(content, &CONFIG);
        assert_eq!(rows.len(), 1);
        assert!(rows[0].vdp_url.as_deref().unwrap().starts_with("https://dealer.test/inventory/"));
    }

    #[test]
    fn equal_rank_prefers_lower_price() {
        let content = "\
JTENU5JR4R5299999
Sale Price $47,500
Sale Price $46,000
";
        let rows = parse_inventory_with_config(content, &CONFIG);
        assert_eq!(rows[0].advertised_price, Some(dec!(46000)));
    }

    #[test]
    fn lines_before_first_vin_are_ignored() {
        let content = "Sale Price $1,000\nJTENU5JR4R5299999\n";
        let rows = parse_inventory_with_config(content, &CONFIG);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].advertised_price, None);
    }

    #[test]
    fn strips_html_tags() {
        let content = "<div>JTENU5JR4R5299999</div>\n<span>Sale Price $44,000</span>";
        let rows = parse_inventory_with_config(content, &CONFIG);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].advertised_price, Some(dec!(44000)));
    }

    #[test]
    fn empty_content_yields_no_rows() {
        assert!(parse_inventory_with_config("", &CONFIG).is_empty());
        assert!(parse_inventory_with_config("   \n  ", &CONFIG).is_empty());
    }
}

//! DealerSocket inventory parser (markdown section tables).

use std::collections::HashMap;
use std::str::FromStr;

use lazy_static::lazy_static;
use regex::Regex;
use rust_decimal::Decimal;

use crate::models::{ListingStatus, ParsedRow};

lazy_static! {
    static ref HEADER_RE: Regex = Regex::new(r"## \[.*?\]\((?P<vdp>[^)]+)\).*").unwrap();
    static ref VIN_RE: Regex =
        Regex::new(r"\|\s*VIN\s*\|\s*([A-HJ-NPR-Z0-9]{17})\s*\|").unwrap();
    static ref TABLE_FIELD_RE: Regex =
        Regex::new(r"\|\s*([^|]+?)\s*\|\s*([^|]+?)\s*\|").unwrap();
    static ref PRICE_RE: Regex = Regex::new(r"Your Price\s*\n\$(\d[\d,]*)").unwrap();
    static ref MSRP_RE: Regex = Regex::new(r"(?:MSRP|TSRP)\s*\n\$(\d[\d,]*)").unwrap();
}

fn parse_table(body: &str) -> HashMap<String, String> {
    TABLE_FIELD_RE
        .captures_iter(body)
        .map(|caps| (caps[1].trim().to_lowercase(), caps[2].trim().to_string()))
        .collect()
}

fn parse_price(body: &str, pattern: &Regex) -> Option<Decimal> {
    let caps = pattern.captures(body)?;
    Decimal::from_str(&caps[1].replace(',', "")).ok()
}

/// Parse markdown sections delimited by `## [...](vdp_url)` headers. Each
/// section body runs until the next header (or end of document).
pub fn parse_inventory(content: &str) -> Vec<ParsedRow> {
    if content.is_empty() {
        return Vec::new();
    }

    let headers: Vec<(usize, usize, String)> = HEADER_RE
        .captures_iter(content)
        .map(|caps| {
            let m = caps.get(0).unwrap();
            (m.start(), m.end(), caps["vdp"].to_string())
        })
        .collect();

    let mut rows = Vec::new();
    for (idx, (_, body_start, vdp)) in headers.iter().enumerate() {
        let body_end = headers
            .get(idx + 1)
            .map(|(next_start, _, _)| *next_start)
            .unwrap_or(content.len());
        let body = &content[*body_start..body_end];

        let vin = match VIN_RE.captures(body) {
            Some(caps) => caps[1].to_uppercase(),
            None => continue,
        };

        let table = parse_table(body);
        let mut row = ParsedRow::new(vin);
        row.advertised_price = parse_price(body, &PRICE_RE);
        row.msrp = parse_price(body, &MSRP_RE);
        row.vdp_url = Some(vdp.clone());
        row.stock_number = table.get("stock #").cloned();
        row.trim = table.get("trim").cloned();
        row.model = table.get("model").cloned();
        row.status = Some(ListingStatus::Available);
        rows.push(row);
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const SAMPLE: &str = "\
## [2025 Toyota 4Runner SR5](https://www.dealer.test/inventory/4runner-sr5)

| VIN | JTENU5JR4R5299999 |
| Stock # | DS100 |
| Trim | SR5 |
| Model | 4Runner |

Your Price
$47,500

MSRP
$51,230

## [2025 Toyota Tundra](https://www.dealer.test/inventory/tundra)

| VIN | JTEABFAJ9RK001234 |
| Stock # | DS200 |

TSRP
$62,110
";

    #[test]
    fn parses_sections_into_rows() {
        let rows = parse_inventory(SAMPLE);
        assert_eq!(rows.len(), 2);

        let first = &rows[0];
        assert_eq!(first.vin, "JTENU5JR4R5299999");
        assert_eq!(first.advertised_price, Some(dec!(47500)));
        assert_eq!(first.msrp, Some(dec!(51230)));
        assert_eq!(first.stock_number.as_deref(), Some("DS100"));
        assert_eq!(first.trim.as_deref(), Some("SR5"));
        assert_eq!(
            first.vdp_url.as_deref(),
            Some("https://www.dealer.test/inventory/4runner-sr5")
        );

        let second = &rows[1];
        assert_eq!(second.advertised_price, None);
        assert_eq!(second.msrp, Some(dec!(62110)));
    }

    #[test]
    fn sections_without_vins_are_skipped() {
        let content = "## [Specials](https://www.dealer.test/specials)\n\nNo table here.\n";
        assert!(parse_inventory(content).is_empty());
    }
}

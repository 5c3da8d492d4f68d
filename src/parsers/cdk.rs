//! CDK Global inventory parser.
//!
//! The SRP embeds the exact widget call it makes for inventory data:
//! `fetch("/api/widget/ws-inv-data/getInventory", {body:decodeURI("…")})`.
//! `extract_inventory_request` captures and decodes that payload so the
//! orchestrator can replay it verbatim.

use lazy_static::lazy_static;
use regex::Regex;
use rust_decimal::Decimal;
use serde_json::Value;

use crate::models::{ListingStatus, ParsedRow};

use super::common::{parse_inventory_with_config, ParserConfig, DEFAULT_URL_KEYWORDS};

const STATUS_MAP: &[(&str, ListingStatus)] = &[
    ("IN TRANSIT", ListingStatus::InTransit),
    ("IN-TRANSIT", ListingStatus::InTransit),
    ("IN ROUTE", ListingStatus::InTransit),
    ("ARRIVING SOON", ListingStatus::InTransit),
    ("ON ORDER", ListingStatus::InTransit),
    ("SOLD", ListingStatus::Sold),
    ("AVAILABLE", ListingStatus::Available),
    ("IN STOCK", ListingStatus::Available),
];

const PRICE_KEYWORDS: &[(&str, u8)] = &[
    ("web price", 1),
    ("sale price", 1),
    ("dealer price", 2),
    ("your price", 2),
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

/// The replayable widget call captured from the SRP.
#[derive(Debug, Clone, PartialEq)]
pub struct CdkInventoryRequest {
    pub endpoint: String,
    pub payload: Value,
}

lazy_static! {
    static ref CDK_FETCH_RE: Regex = Regex::new(
        r#"(?is)fetch\("(?P<endpoint>/api/widget/ws-inv-data/getInventory)"\s*,\s*\{.*?body:decodeURI\("(?P<payload>[^"]+)"\).*?\}\)"#
    )
    .unwrap();
    static ref PRICE_NUMBER_RE: Regex =
        Regex::new(r"([0-9]{1,3}(?:,[0-9]{3})*(?:\.[0-9]{2})?)").unwrap();
}

/// Detect the embedded inventory fetch inside the SRP HTML.
pub fn extract_inventory_request(html: &str) -> Option<CdkInventoryRequest> {
    if html.is_empty() {
        return None;
    }
    let caps = CDK_FETCH_RE.captures(html)?;
    let decoded = percent_decode(&caps["payload"]);
    let payload: Value = serde_json::from_str(&decoded).ok()?;
    Some(CdkInventoryRequest {
        endpoint: caps["endpoint"].to_string(),
        payload,
    })
}

/// Minimal `decodeURI` counterpart: percent sequences back to bytes, the
/// characters `decodeURI` leaves alone stay encoded anyway in practice.
fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(byte) = u8::from_str_radix(&input[i + 1..i + 3], 16) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Convert the CDK inventory JSON payload into inventory rows.
pub fn parse_inventory_json(data: &Value, base_url: &str) -> Vec<ParsedRow> {
    let inventory = match data.get("inventory").and_then(Value::as_array) {
        Some(entries) => entries,
        None => return Vec::new(),
    };

    let mut rows = Vec::new();
    for entry in inventory {
        let vin = match entry.get("vin").and_then(Value::as_str) {
            Some(vin) if !vin.is_empty() => vin.to_uppercase(),
            _ => continue,
        };
        let mut row = ParsedRow::new(vin);
        row.advertised_price = extract_final_price(entry);
        row.msrp = extract_msrp(entry);
        row.vdp_url = entry
            .get("link")
            .or_else(|| entry.get("vdp"))
            .or_else(|| entry.get("url"))
            .and_then(Value::as_str)
            .map(|link| resolve_link(link, base_url));
        row.stock_number = entry
            .get("stockNumber")
            .or_else(|| entry.get("stock"))
            .and_then(Value::as_str)
            .map(String::from);
        row.status = entry
            .get("status")
            .and_then(Value::as_str)
            .and_then(normalize_status);
        row.image_url = extract_image(entry);
        row.make = entry.get("make").and_then(Value::as_str).map(String::from);
        row.model = entry.get("model").and_then(Value::as_str).map(String::from);
        row.year = entry.get("year").and_then(Value::as_i64).map(|y| y as i32);
        row.trim = entry.get("trim").and_then(Value::as_str).map(String::from);
        row.features = entry.get("features").cloned().filter(|v| !v.is_null());
        rows.push(row);
    }
    rows
}

/// Walk `pricing.dprice[*]`, preferring entries flagged as the final price
/// or carrying an asking/internet/final typeClass.
fn extract_final_price(entry: &Value) -> Option<Decimal> {
    let pricing = entry.get("pricing");
    if let Some(dprice) = pricing
        .and_then(|p| p.get("dprice"))
        .and_then(Value::as_array)
    {
        for item in dprice {
            let is_final = item.get("isFinalPrice").and_then(Value::as_bool) == Some(true);
            let type_class = item.get("typeClass").and_then(Value::as_str).unwrap_or("");
            if is_final || matches!(type_class, "askingPrice" | "internetPrice" | "finalPrice") {
                if let Some(price) = item.get("value").and_then(coerce_price) {
                    return Some(price);
                }
            }
        }
    }
    for key in [
        "salePrice",
        "sale_price",
        "askingPrice",
        "internetPrice",
        "asking_price",
    ] {
        if let Some(price) = entry.get(key).and_then(coerce_price) {
            return Some(price);
        }
    }
    fallback_price(entry)
}

fn extract_msrp(entry: &Value) -> Option<Decimal> {
    let pricing = entry.get("pricing");
    if let Some(dprice) = pricing
        .and_then(|p| p.get("dprice"))
        .and_then(Value::as_array)
    {
        for item in dprice {
            let type_class = item.get("typeClass").and_then(Value::as_str).unwrap_or("");
            if matches!(type_class, "msrp" | "retailPrice") {
                if let Some(price) = item.get("value").and_then(coerce_price) {
                    return Some(price);
                }
            }
        }
    }
    fallback_price(entry)
}

fn fallback_price(entry: &Value) -> Option<Decimal> {
    entry
        .get("pricing")
        .and_then(|p| p.get("retailPrice"))
        .and_then(coerce_price)
        .or_else(|| entry.get("price").and_then(coerce_price))
}

fn coerce_price(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(_) => super::dealer_inspire::coerce_price(value),
        Value::String(s) => {
            let caps = PRICE_NUMBER_RE.captures(s)?;
            caps[1].replace(',', "").parse().ok()
        }
        _ => None,
    }
}

fn extract_image(entry: &Value) -> Option<String> {
    let fix_scheme = |uri: &str| {
        if let Some(rest) = uri.strip_prefix("//") {
            format!("https://{rest}")
        } else {
            uri.to_string()
        }
    };
    if let Some(images) = entry.get("images").and_then(Value::as_array) {
        for image in images {
            let uri = image
                .get("uri")
                .or_else(|| image.get("url"))
                .and_then(Value::as_str);
            if let Some(uri) = uri {
                return Some(fix_scheme(uri));
            }
        }
    }
    let primary = entry.get("primary_image")?;
    let uri = primary
        .get("uri")
        .or_else(|| primary.get("url"))
        .and_then(Value::as_str)?;
    Some(fix_scheme(uri))
}

fn resolve_link(link: &str, base_url: &str) -> String {
    if link.starts_with("http") {
        link.to_string()
    } else {
        format!(
            "{}/{}",
            base_url.trim_end_matches('/'),
            link.trim_start_matches('/')
        )
    }
}

fn normalize_status(status: &str) -> Option<ListingStatus> {
    let normalized = status
        .trim()
        .to_uppercase()
        .replace('-', " ")
        .replace('_', " ");
    for (pattern, mapped) in STATUS_MAP {
        if *pattern == normalized {
            return Some(*mapped);
        }
    }
    match normalized.as_str() {
        "LIVE" | "AVAILABLE" => Some(ListingStatus::Available),
        "IN TRANSIT" | "ARRIVING" | "TRANSFER" => Some(ListingStatus::InTransit),
        other => ListingStatus::parse(&other.to_lowercase()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn extracts_inventory_request_from_html() {
        let html = r#"<script>
fetch("/api/widget/ws-inv-data/getInventory", {method:"POST",body:decodeURI("%7B%22inventoryParameters%22%3A%7B%22model%22%3A%224Runner%22%7D%7D")})
</script>"#;
        let request = extract_inventory_request(html).unwrap();
        assert_eq!(request.endpoint, "/api/widget/ws-inv-data/getInventory");
        assert_eq!(
            request.payload["inventoryParameters"]["model"],
            json!("4Runner")
        );
    }

    #[test]
    fn missing_fetch_pattern_yields_none() {
        assert!(extract_inventory_request("<html>no widget here</html>").is_none());
    }

    #[test]
    fn parses_inventory_json_with_dprice_walk() {
        let data = json!({
            "inventory": [{
                "vin": "jteva5br8s5057981",
                "pricing": {
                    "dprice": [
                        {"typeClass": "msrp", "value": "$63,863"},
                        {"typeClass": "internetPrice", "value": 63081}
                    ],
                    "retailPrice": "$63,863"
                },
                "link": "/new/Toyota/2025-Toyota-4Runner.htm",
                "stockNumber": "C4001",
                "status": "in_transit",
                "images": [{"uri": "//media.cdk.test/1.jpg"}],
                "make": "Toyota",
                "model": "4Runner",
                "year": 2025
            }]
        });
        let rows = parse_inventory_json(&data, "https://www.youngtoyota.com");
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.vin, "JTEVA5BR8S5057981");
        assert_eq!(row.advertised_price, Some(dec!(63081)));
        assert_eq!(row.msrp, Some(dec!(63863)));
        assert_eq!(
            row.vdp_url.as_deref(),
            Some("https://www.youngtoyota.com/new/Toyota/2025-Toyota-4Runner.htm")
        );
        assert_eq!(row.status, Some(ListingStatus::InTransit));
        assert_eq!(row.image_url.as_deref(), Some("https://media.cdk.test/1.jpg"));
    }

    #[test]
    fn final_price_falls_back_to_retail() {
        let entry = json!({
            "vin": "JTEVA5BR8S5057981",
            "pricing": {"retailPrice": 61000}
        });
        let rows = parse_inventory_json(&json!({"inventory": [entry]}), "https://d.test");
        assert_eq!(rows[0].advertised_price, Some(dec!(61000)));
        assert_eq!(rows[0].msrp, Some(dec!(61000)));
    }

    #[test]
    fn heuristic_pass_reads_web_price() {
        let content = "\
JTENU5JR3R5312345
MSRP $46,500
Web Price $44,995
Arriving Soon
";
        let rows = parse_inventory(content);
        assert_eq!(rows[0].advertised_price, Some(dec!(44995)));
        assert_eq!(rows[0].msrp, Some(dec!(46500)));
        assert_eq!(rows[0].status, Some(ListingStatus::InTransit));
    }
}

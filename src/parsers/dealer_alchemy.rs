//! Dealer Alchemy / Dealer Venom / Fox Dealer inventory parser.
//!
//! These storefronts share a Typesense-backed search widget; the heuristic
//! pass handles the rendered page and `extract_typesense_config` +
//! `parse_typesense_hits` back the API follow-up.

use lazy_static::lazy_static;
use regex::Regex;
use rust_decimal::Decimal;
use serde_json::Value;

use crate::models::{ListingStatus, ParsedRow};

use super::common::{parse_inventory_with_config, ParserConfig, DEFAULT_URL_KEYWORDS};

const STATUS_MAP: &[(&str, ListingStatus)] = &[
    ("IN TRANSIT", ListingStatus::InTransit),
    ("TRANSIT", ListingStatus::InTransit),
    ("IN STOCK", ListingStatus::Available),
    ("AVAILABLE", ListingStatus::Available),
    ("BUILD PHASE", ListingStatus::BuildPhase),
    ("PENDING SALE", ListingStatus::Pending),
    ("SOLD", ListingStatus::Sold),
];

const PRICE_KEYWORDS: &[(&str, u8)] = &[
    ("advertised price", 1),
    ("sale price", 1),
    ("internet price", 1),
    ("final price", 1),
    ("tsrp", 2),
    ("msrp", 2),
    ("price", 3),
];

const CONFIG: ParserConfig = ParserConfig {
    status_map: STATUS_MAP,
    price_keywords: PRICE_KEYWORDS,
    url_keywords: DEFAULT_URL_KEYWORDS,
};

pub fn parse_inventory(content: &str) -> Vec<ParsedRow> {
    parse_inventory_with_config(content, &CONFIG)
}

/// Typesense credentials embedded in the SRP scripts.
#[derive(Debug, Clone, PartialEq)]
pub struct TypesenseConfig {
    pub api_key: String,
    pub host: String,
    pub port: u16,
    pub protocol: String,
    pub index_name: String,
    pub query_by: String,
    pub condition: Option<String>,
    pub hits_per_page: u32,
}

lazy_static! {
    static ref API_KEY_RE: Regex = Regex::new(r#"(?i)apiKey\s*:\s*"([^"]+)""#).unwrap();
    static ref NODE_RE: Regex = Regex::new(
        r#"(?i)nodes\s*:\s*\[\s*\{[^}]*host\s*:\s*['"]([^'"]+)['"],\s*port\s*:\s*(\d+),\s*protocol\s*:\s*['"]([^'"]+)['"][^}]*\}"#
    )
    .unwrap();
    static ref QUERY_BY_RE: Regex = Regex::new(r#"(?i)query_by\s*:\s*"([^"]+)""#).unwrap();
    static ref INDEX_RE: Regex = Regex::new(r#"(?i)var\s+indexName\s*=\s*"([^"]+)""#).unwrap();
    static ref CONDITION_RE: Regex =
        Regex::new(r"(?i)var\s+srpCondition\s*=\s*'([^']+)'").unwrap();
    static ref HITS_PER_PAGE_RE: Regex = Regex::new(r"(?i)hitsPerPage\s*=\s*(\d+)").unwrap();
    static ref PRICE_NUMBER_RE: Regex = Regex::new(r"(\d[\d,]*\.?\d*)").unwrap();
}

/// Parse Typesense credentials out of the SRP markup.
pub fn extract_typesense_config(html: &str) -> Option<TypesenseConfig> {
    if html.is_empty() {
        return None;
    }

    let api_key = API_KEY_RE.captures(html)?[1].trim().to_string();
    let node = NODE_RE.captures(html)?;
    let query_by = QUERY_BY_RE.captures(html)?[1].trim().to_string();
    let index_name = INDEX_RE.captures(html)?[1].trim().to_string();

    let host = node[1].trim().to_string();
    let port: u16 = node[2].parse().ok()?;
    let protocol = node[3].trim().to_string();

    let condition = CONDITION_RE
        .captures(html)
        .map(|caps| caps[1].trim().to_string());
    let hits_per_page = HITS_PER_PAGE_RE
        .captures(html)
        .and_then(|caps| caps[1].parse().ok())
        .unwrap_or(250);

    Some(TypesenseConfig {
        api_key,
        host,
        port,
        protocol,
        index_name,
        query_by,
        condition,
        hits_per_page,
    })
}

/// Escape and single-quote a Typesense filter value.
pub fn quote_filter_value(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{escaped}'")
}

impl TypesenseConfig {
    pub fn multi_search_url(&self) -> String {
        format!(
            "{}://{}:{}/multi_search?use_cache=true",
            self.protocol, self.host, self.port
        )
    }

    /// The single search clause posted to `multi_search`.
    pub fn build_search_body(&self, model: &str) -> Value {
        let mut filters = Vec::new();
        if let Some(condition) = &self.condition {
            filters.push(format!("condition:={}", quote_filter_value(condition)));
        }
        filters.push(format!("model:={}", quote_filter_value(model)));
        serde_json::json!({
            "searches": [{
                "collection": self.index_name,
                "q": "*",
                "query_by": self.query_by,
                "filter_by": filters.join(" && "),
                "per_page": self.hits_per_page,
            }]
        })
    }
}

fn coerce_price(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                return Some(Decimal::from(i));
            }
            n.as_f64().and_then(Decimal::from_f64_retain)
        }
        // First numeric run anywhere in the string, surrounding text ignored.
        Value::String(s) => {
            let caps = PRICE_NUMBER_RE.captures(s)?;
            caps[1].replace(',', "").trim_end_matches('.').parse().ok()
        }
        _ => None,
    }
}

fn normalize_vdp_url(raw: &str, page_url: &str, dealer_url: Option<&str>) -> String {
    if raw.starts_with("http://") || raw.starts_with("https://") {
        return raw.to_string();
    }
    let base = url::Url::parse(page_url)
        .ok()
        .filter(|u| u.has_host())
        .map(|u| format!("{}://{}", u.scheme(), u.host_str().unwrap_or_default()))
        .or_else(|| {
            dealer_url.map(|d| {
                let d = d.trim();
                if d.starts_with("http") {
                    d.trim_end_matches('/').to_string()
                } else {
                    format!("https://{}", d.trim_start_matches('/').trim_end_matches('/'))
                }
            })
        });
    match base {
        Some(base) => format!("{}/{}", base.trim_end_matches('/'), raw.trim_start_matches('/')),
        None => raw.to_string(),
    }
}

fn derive_status(document: &Value) -> ListingStatus {
    if let Some(flags) = document.get("flags").and_then(Value::as_object) {
        if flags.get("hasSoldVehicles").and_then(Value::as_bool) == Some(true) {
            return ListingStatus::Sold;
        }
        if flags.get("inTransit").and_then(Value::as_bool) == Some(true) {
            return ListingStatus::InTransit;
        }
    }
    let status = document
        .get("status")
        .or_else(|| document.get("condition"))
        .and_then(Value::as_str);
    if let Some(status) = status {
        let upper = status.to_uppercase();
        if upper.contains("TRANSIT") {
            return ListingStatus::InTransit;
        }
        if upper.contains("SOLD") {
            return ListingStatus::Sold;
        }
    }
    ListingStatus::Available
}

/// Convert a Typesense `multi_search` payload into inventory rows.
pub fn parse_typesense_hits(data: &Value, page_url: &str) -> Vec<ParsedRow> {
    let results = match data.get("results").and_then(Value::as_array) {
        Some(results) => results,
        None => return Vec::new(),
    };

    let mut rows = Vec::new();
    for result in results {
        let hits = match result.get("hits").and_then(Value::as_array) {
            Some(hits) => hits,
            None => continue,
        };
        for hit in hits {
            let document = match hit.get("document") {
                Some(doc) if doc.is_object() => doc,
                _ => continue,
            };
            let vin = match document.get("vin").and_then(Value::as_str) {
                Some(vin) if !vin.is_empty() => vin.to_uppercase(),
                _ => continue,
            };

            let dealer_url = document
                .get("dealer")
                .and_then(|d| d.get("url"))
                .and_then(Value::as_str);

            let mut row = ParsedRow::new(vin);
            row.advertised_price = document
                .get("finalPrice")
                .and_then(coerce_price)
                .or_else(|| document.get("advertisedPrice").and_then(coerce_price))
                .or_else(|| document.get("sellingPrice").and_then(coerce_price));
            row.msrp = document.get("msrp").and_then(coerce_price);
            row.vdp_url = document
                .get("vdpUrl")
                .and_then(Value::as_str)
                .map(|raw| normalize_vdp_url(raw, page_url, dealer_url));
            row.stock_number = document
                .get("stockNumber")
                .and_then(Value::as_str)
                .map(String::from);
            row.status = Some(derive_status(document));
            row.image_url = document
                .get("imageUrls")
                .and_then(Value::as_array)
                .and_then(|urls| urls.first())
                .and_then(Value::as_str)
                .map(String::from);
            row.make = document.get("make").and_then(Value::as_str).map(String::from);
            row.model = document.get("model").and_then(Value::as_str).map(String::from);
            row.year = document.get("year").and_then(Value::as_i64).map(|y| y as i32);
            row.trim = document.get("trim").and_then(Value::as_str).map(String::from);
            row.exterior_color = document
                .get("exteriorColor")
                .and_then(Value::as_str)
                .map(String::from);
            row.interior_color = document
                .get("interiorColor")
                .and_then(Value::as_str)
                .map(String::from);
            row.features = document
                .get("features")
                .filter(|v| v.is_array())
                .cloned();
            rows.push(row);
        }
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    const SRP_HTML: &str = r#"
<script>
var indexName = "products-toy01";
var srpCondition = 'New';
var typesense = new Typesense.Client({
  apiKey: "tsKey123",
  nodes: [{host: 'search.dealervenom.com', port: 443, protocol: 'https'}],
});
var search = { query_by: "model,vin" };
var hitsPerPage = 200;
</script>
"#;

    #[test]
    fn extracts_typesense_config() {
        let config = extract_typesense_config(SRP_HTML).unwrap();
        assert_eq!(config.api_key, "tsKey123");
        assert_eq!(config.host, "search.dealervenom.com");
        assert_eq!(config.port, 443);
        assert_eq!(config.protocol, "https");
        assert_eq!(config.index_name, "products-toy01");
        assert_eq!(config.query_by, "model,vin");
        assert_eq!(config.condition.as_deref(), Some("New"));
        assert_eq!(config.hits_per_page, 200);
    }

    #[test]
    fn incomplete_markup_yields_none() {
        assert!(extract_typesense_config("<html>apiKey: \"k\"</html>").is_none());
    }

    #[test]
    fn quotes_filter_values() {
        assert_eq!(quote_filter_value("New"), "'New'");
        assert_eq!(quote_filter_value("O'Brien"), "'O\\'Brien'");
    }

    #[test]
    fn builds_multi_search_body() {
        let config = extract_typesense_config(SRP_HTML).unwrap();
        assert_eq!(
            config.multi_search_url(),
            "https://search.dealervenom.com:443/multi_search?use_cache=true"
        );
        let body = config.build_search_body("4Runner");
        let clause = &body["searches"][0];
        assert_eq!(clause["collection"], "products-toy01");
        assert_eq!(clause["filter_by"], "condition:='New' && model:='4Runner'");
        assert_eq!(clause["per_page"], 200);
    }

    #[test]
    fn string_prices_tolerate_surrounding_text() {
        assert_eq!(coerce_price(&json!("$43,500")), Some(dec!(43500)));
        assert_eq!(coerce_price(&json!("43,500 + destination")), Some(dec!(43500)));
        assert_eq!(coerce_price(&json!("MSRP 45000.")), Some(dec!(45000)));
        assert_eq!(coerce_price(&json!("TBD")), None);
    }

    #[test]
    fn parses_typesense_hits() {
        let data = json!({
            "results": [{
                "hits": [{
                    "document": {
                        "vin": "jtezu5jr8f5099999",
                        "finalPrice": "$43,500",
                        "msrp": 45000,
                        "vdpUrl": "/inventory/4runner-trd",
                        "stockNumber": "V789",
                        "flags": {"inTransit": true},
                        "imageUrls": ["https://img.test/1.jpg"],
                        "make": "Toyota",
                        "model": "4Runner",
                        "year": 2025,
                        "trim": "TRD Off-Road",
                        "exteriorColor": "Ice Cap",
                        "features": ["Sunroof"]
                    }
                }]
            }]
        });
        let rows = parse_typesense_hits(&data, "https://www.dealervenom-site.test/new");
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.vin, "JTEZU5JR8F5099999");
        assert_eq!(row.advertised_price, Some(dec!(43500)));
        assert_eq!(row.msrp, Some(dec!(45000)));
        assert_eq!(
            row.vdp_url.as_deref(),
            Some("https://www.dealervenom-site.test/inventory/4runner-trd")
        );
        assert_eq!(row.status, Some(ListingStatus::InTransit));
        assert_eq!(row.exterior_color.as_deref(), Some("Ice Cap"));
    }

    #[test]
    fn sold_flag_wins_over_condition() {
        let doc = json!({"flags": {"hasSoldVehicles": true}, "condition": "New"});
        assert_eq!(derive_status(&doc), ListingStatus::Sold);
    }
}

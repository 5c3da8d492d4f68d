//! DealerInspire CMS inventory parser.
//!
//! The heuristic pass covers markdown captures; when it comes back empty the
//! orchestrator extracts the site's Algolia credentials from the SRP markup
//! and queries the index directly.

use std::collections::HashMap;

use lazy_static::lazy_static;
use regex::Regex;
use rust_decimal::Decimal;
use serde_json::Value;

use crate::models::{ListingStatus, ParsedRow};

use super::common::{parse_inventory_with_config, ParserConfig, DEFAULT_URL_KEYWORDS};

const STATUS_MAP: &[(&str, ListingStatus)] = &[
    ("IN TRANSIT", ListingStatus::InTransit),
    ("IN-TRANSIT", ListingStatus::InTransit),
    ("COMING SOON", ListingStatus::InTransit),
    ("SOLD", ListingStatus::Sold),
    ("AVAILABLE", ListingStatus::Available),
    ("IN STOCK", ListingStatus::Available),
];

const PRICE_KEYWORDS: &[(&str, u8)] = &[
    ("sale price", 1),
    ("our price", 1),
    ("internet price", 2),
    ("special price", 2),
    ("market price", 3),
    ("dealer price", 3),
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

/// Algolia search credentials and refinements embedded in the SRP.
#[derive(Debug, Clone, PartialEq)]
pub struct AlgoliaConfig {
    pub app_id: String,
    pub api_key: String,
    pub index: String,
    pub refinements: HashMap<String, Vec<String>>,
}

lazy_static! {
    static ref PRICE_NUMBER_RE: Regex = Regex::new(r"(\d[\d,]*\.?\d*)").unwrap();
    static ref ALGOLIA_HELPER_RE: Regex =
        Regex::new(r#"(?i)<div[^>]+id=["']sb-algolia-helper["'][^>]*>"#).unwrap();
    static ref DATA_ATTR_RES: Vec<(&'static str, Regex)> = vec![
        (
            "data-app-id",
            Regex::new(r#"(?i)data-app-id="([^"]+)""#).unwrap()
        ),
        (
            "data-search-key",
            Regex::new(r#"(?i)data-search-key="([^"]+)""#).unwrap()
        ),
        (
            "data-index",
            Regex::new(r#"(?i)data-index="([^"]+)""#).unwrap()
        ),
    ];
}

/// Extract Algolia credentials from either the `inventoryLightningSettings`
/// object or the `#sb-algolia-helper` data attributes (the helper wins when
/// both are present).
pub fn extract_algolia_config(html: &str) -> Option<AlgoliaConfig> {
    if html.is_empty() {
        return None;
    }

    let mut app_id: Option<String> = None;
    let mut api_key: Option<String> = None;
    let mut index: Option<String> = None;
    let mut refinements: HashMap<String, Vec<String>> = HashMap::new();

    if let Some(settings) = extract_lightning_settings(html) {
        app_id = settings
            .get("appId")
            .and_then(Value::as_str)
            .map(String::from);
        api_key = settings
            .get("apiKeySearch")
            .and_then(Value::as_str)
            .map(String::from);
        index = settings
            .get("inventoryIndex")
            .and_then(Value::as_str)
            .map(String::from);
        if let Some(raw) = settings.get("refinements").and_then(Value::as_object) {
            for (key, value) in raw {
                let values = match value {
                    Value::Array(items) => items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(String::from)
                        .collect(),
                    Value::String(s) => vec![s.clone()],
                    other => vec![other.to_string()],
                };
                refinements.insert(key.clone(), values);
            }
        }
    }

    if let Some(m) = ALGOLIA_HELPER_RE.find(html) {
        let tag = m.as_str();
        for (attr, re) in DATA_ATTR_RES.iter() {
            if let Some(caps) = re.captures(tag) {
                let value = caps[1].to_string();
                match *attr {
                    "data-app-id" => app_id = Some(value),
                    "data-search-key" => api_key = Some(value),
                    "data-index" => index = Some(value),
                    _ => {}
                }
            }
        }
    }

    match (app_id, api_key, index) {
        (Some(app_id), Some(api_key), Some(index)) => Some(AlgoliaConfig {
            app_id,
            api_key,
            index,
            refinements,
        }),
        _ => None,
    }
}

/// Locate `var inventoryLightningSettings = {...}` and JSON-parse the
/// balanced-brace object literal.
fn extract_lightning_settings(html: &str) -> Option<Value> {
    let start = html.find("var inventoryLightningSettings")?;
    let brace_start = html[start..].find('{')? + start;
    let mut depth = 0usize;
    for (offset, ch) in html[brace_start..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    let snippet = &html[brace_start..brace_start + offset + 1];
                    return serde_json::from_str(snippet).ok();
                }
            }
            _ => {}
        }
    }
    None
}

/// Build the Algolia `params` string, appending default model/make/type
/// filters unless explicit refinements already cover them.
pub fn build_algolia_params(config: &AlgoliaConfig, model: &str, hits_per_page: u32) -> String {
    fn quote(value: &str) -> Option<String> {
        let text = value.trim();
        if text.is_empty() {
            return None;
        }
        if text.contains(' ') || text.contains(':') {
            Some(format!("\"{text}\""))
        } else {
            Some(text.to_string())
        }
    }

    let mut filters: Vec<String> = Vec::new();
    let mut keys: Vec<&String> = config.refinements.keys().collect();
    keys.sort();
    for key in keys {
        for value in &config.refinements[key] {
            if let Some(quoted) = quote(value) {
                filters.push(format!("{key}:{quoted}"));
            }
        }
    }

    if !filters.iter().any(|f| f.starts_with("model:")) {
        if let Some(quoted) = quote(model) {
            filters.push(format!("model:{quoted}"));
        }
    }
    if !filters.iter().any(|f| f.starts_with("make:")) {
        filters.push("make:Toyota".to_string());
    }
    if !filters.iter().any(|f| f.starts_with("type:")) {
        filters.push("type:New".to_string());
    }

    let filter_str = filters.join(" AND ");
    if filter_str.is_empty() {
        format!("hitsPerPage={hits_per_page}")
    } else {
        format!("filters={filter_str}&hitsPerPage={hits_per_page}")
    }
}

/// Convert an Algolia search response into inventory rows.
pub fn parse_algolia_hits(data: &Value, base_url: &str) -> Vec<ParsedRow> {
    let hits = match data.get("hits").and_then(Value::as_array) {
        Some(hits) => hits,
        None => return Vec::new(),
    };

    let mut rows = Vec::new();
    for hit in hits {
        let vin = match hit.get("vin").and_then(Value::as_str) {
            Some(vin) if !vin.is_empty() => vin.to_uppercase(),
            _ => continue,
        };
        let mut row = ParsedRow::new(vin);
        row.advertised_price = hit
            .get("our_price")
            .and_then(coerce_price)
            .or_else(|| hit.get("algoliaPrice").and_then(coerce_price))
            .or_else(|| hit.get("price").and_then(coerce_price));
        row.msrp = hit.get("msrp").and_then(coerce_price);
        row.vdp_url = hit
            .get("link")
            .and_then(Value::as_str)
            .map(|link| normalize_link(link, base_url));
        row.stock_number = hit.get("stock").and_then(Value::as_str).map(String::from);
        row.status = hit
            .get("vehicle_status")
            .or_else(|| hit.get("status"))
            .and_then(Value::as_str)
            .and_then(normalize_status);
        row.image_url = extract_image(hit, base_url);
        row.make = hit.get("make").and_then(Value::as_str).map(String::from);
        row.model = hit.get("model").and_then(Value::as_str).map(String::from);
        row.year = hit.get("year").and_then(Value::as_i64).map(|y| y as i32);
        row.trim = hit.get("trim").and_then(Value::as_str).map(String::from);
        row.features = hit.get("features").cloned().filter(|v| !v.is_null());
        rows.push(row);
    }
    rows
}

pub(crate) fn coerce_price(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                return Some(Decimal::from(i));
            }
            n.as_f64().and_then(Decimal::from_f64_retain)
        }
        // First numeric run anywhere in the string; labels and currency
        // suffixes around it are tolerated.
        Value::String(s) => {
            let caps = PRICE_NUMBER_RE.captures(s)?;
            caps[1].replace(',', "").trim_end_matches('.').parse().ok()
        }
        _ => None,
    }
}

fn normalize_link(link: &str, base_url: &str) -> String {
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

fn extract_image(hit: &Value, base_url: &str) -> Option<String> {
    if let Some(thumb) = hit.get("thumbnail").and_then(Value::as_str) {
        if !thumb.is_empty() {
            return Some(normalize_link(thumb, base_url));
        }
    }
    let images = hit.get("images").and_then(Value::as_array)?;
    for image in images {
        let uri = image
            .get("url")
            .or_else(|| image.get("src"))
            .and_then(Value::as_str);
        if let Some(uri) = uri {
            return Some(normalize_link(uri, base_url));
        }
    }
    None
}

fn normalize_status(status: &str) -> Option<ListingStatus> {
    match status.trim().to_lowercase().as_str() {
        "on-lot" | "available" | "live" => Some(ListingStatus::Available),
        "in transit" | "in-transit" | "transit" => Some(ListingStatus::InTransit),
        "sold" => Some(ListingStatus::Sold),
        other => ListingStatus::parse(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    const SETTINGS_HTML: &str = r#"
<script>
var inventoryLightningSettings = {"appId":"SEWJN80HTN","apiKeySearch":"179608f32563367799314290254e3e44","inventoryIndex":"westborotoyota_production_inventory","refinements":{"model":["4Runner"]}};
</script>
"#;

    const HELPER_HTML: &str = r#"
<div id="sb-algolia-helper" data-app-id="EHWUW84XVK" data-search-key="fb58227032e79f03b9b820cbaea7f8fb" data-index="jaywolfe_production_inventory"></div>
"#;

    #[test]
    fn extracts_config_from_lightning_settings() {
        let config = extract_algolia_config(SETTINGS_HTML).unwrap();
        assert_eq!(config.app_id, "SEWJN80HTN");
        assert_eq!(config.api_key, "179608f32563367799314290254e3e44");
        assert_eq!(config.index, "westborotoyota_production_inventory");
        assert_eq!(
            config.refinements.get("model"),
            Some(&vec!["4Runner".to_string()])
        );
    }

    #[test]
    fn extracts_config_from_helper_div() {
        let config = extract_algolia_config(HELPER_HTML).unwrap();
        assert_eq!(config.app_id, "EHWUW84XVK");
        assert_eq!(config.index, "jaywolfe_production_inventory");
        assert!(config.refinements.is_empty());
    }

    #[test]
    fn missing_credentials_yield_none() {
        assert!(extract_algolia_config("<html></html>").is_none());
        assert!(extract_algolia_config("").is_none());
    }

    #[test]
    fn params_add_default_filters() {
        let config = extract_algolia_config(HELPER_HTML).unwrap();
        let params = build_algolia_params(&config, "4Runner", 25);
        assert!(params.contains("model:4Runner"));
        assert!(params.contains("make:Toyota"));
        assert!(params.contains("type:New"));
        assert!(params.ends_with("hitsPerPage=25"));
    }

    #[test]
    fn params_respect_explicit_refinements() {
        let config = extract_algolia_config(SETTINGS_HTML).unwrap();
        let params = build_algolia_params(&config, "Tacoma", 60);
        // The explicit model refinement wins; no second model filter.
        assert!(params.contains("model:4Runner"));
        assert!(!params.contains("model:Tacoma"));
    }

    #[test]
    fn quoted_values_wrap_spaces() {
        let config = AlgoliaConfig {
            app_id: "A".into(),
            api_key: "K".into(),
            index: "I".into(),
            refinements: HashMap::new(),
        };
        let params = build_algolia_params(&config, "Land Cruiser", 60);
        assert!(params.contains("model:\"Land Cruiser\""));
    }

    #[test]
    fn string_prices_tolerate_surrounding_text() {
        assert_eq!(coerce_price(&json!("$43,733")), Some(dec!(43733)));
        assert_eq!(coerce_price(&json!("43733.50 USD")), Some(dec!(43733.50)));
        assert_eq!(coerce_price(&json!("Sale: $41,988 plus fees")), Some(dec!(41988)));
        assert_eq!(coerce_price(&json!("call for price")), None);
        assert_eq!(coerce_price(&json!(null)), None);
    }

    #[test]
    fn parses_algolia_hits() {
        let data = json!({
            "hits": [
                {
                    "vin": "jteva5ar2s5006557",
                    "our_price": 41988,
                    "msrp": "43,733",
                    "link": "/inventory/new-2025-toyota-4runner",
                    "stock": "T1001",
                    "vehicle_status": "on-lot",
                    "thumbnail": "/img/4runner.jpg",
                    "make": "Toyota",
                    "model": "4Runner",
                    "year": 2025,
                    "trim": "SR5"
                },
                { "vin": "" }
            ]
        });
        let rows = parse_algolia_hits(&data, "https://www.jaywolfetoyota.com");
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.vin, "JTEVA5AR2S5006557");
        assert_eq!(row.advertised_price, Some(dec!(41988)));
        assert_eq!(row.msrp, Some(dec!(43733)));
        assert_eq!(
            row.vdp_url.as_deref(),
            Some("https://www.jaywolfetoyota.com/inventory/new-2025-toyota-4runner")
        );
        assert_eq!(row.status, Some(ListingStatus::Available));
        assert_eq!(
            row.image_url.as_deref(),
            Some("https://www.jaywolfetoyota.com/img/4runner.jpg")
        );
    }
}

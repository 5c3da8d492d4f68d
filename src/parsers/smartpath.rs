//! SmartPath (Typesense-backed) inventory parser.

use lazy_static::lazy_static;
use regex::Regex;
use rust_decimal::Decimal;
use serde_json::Value;
use url::Url;

use crate::errors::ParseError;
use crate::models::{ListingStatus, ParsedRow};

use super::common::unescape_html;

lazy_static! {
    static ref API_KEY_RE: Regex = Regex::new(r#"apiKey:\s*['"]([^'"]+)['"]"#).unwrap();
    static ref HOST_RE: Regex = Regex::new(r#"host:\s*['"]([^'"]+)['"]"#).unwrap();
    static ref INDEX_RE: Regex =
        Regex::new(r#"var\s+indexName\s*=\s*['"]([^'"]+)['"]"#).unwrap();
    static ref INDEX_FALLBACK_RE: Regex = Regex::new(r"vehicles-[A-Za-z0-9]+").unwrap();
    static ref CANONICAL_RE: Regex =
        Regex::new(r#"(?i)<link[^>]+rel="canonical"[^>]+href="([^"]+)""#).unwrap();
    static ref OG_URL_RE: Regex =
        Regex::new(r#"(?i)<meta[^>]+property="og:url"[^>]+content="([^"]+)""#).unwrap();
}

/// Typesense credentials plus page context for the SmartPath follow-up.
#[derive(Debug, Clone, PartialEq)]
pub struct SmartPathPage {
    pub api_key: String,
    pub typesense_host: String,
    pub index_name: String,
    pub dealer_host: String,
    pub model_filter: Option<String>,
}

impl SmartPathPage {
    pub fn search_url(&self) -> String {
        format!(
            "https://{}/collections/{}/documents/search",
            self.typesense_host, self.index_name
        )
    }

    pub fn filter_by(&self) -> String {
        let mut filters = vec!["condition:='New'".to_string()];
        if let Some(model) = &self.model_filter {
            filters.push(format!("model:='{model}'"));
        }
        filters.join(" && ")
    }
}

/// Pull Typesense credentials and page context from SmartPath markup.
pub fn extract_config(raw_html: &str) -> Result<SmartPathPage, ParseError> {
    if raw_html.is_empty() {
        return Err(ParseError::SmartPath("empty page content".into()));
    }

    let api_key = API_KEY_RE.captures(raw_html).map(|c| c[1].to_string());
    let host = HOST_RE.captures(raw_html).map(|c| c[1].to_string());
    let index_name = INDEX_RE
        .captures(raw_html)
        .map(|c| c[1].to_string())
        .or_else(|| {
            INDEX_FALLBACK_RE
                .find(raw_html)
                .map(|m| m.as_str().to_string())
        });

    let (api_key, typesense_host, index_name) = match (api_key, host, index_name) {
        (Some(k), Some(h), Some(i)) => (k, h, i),
        _ => {
            return Err(ParseError::SmartPath(
                "unable to locate Typesense configuration in SmartPath markup".into(),
            ))
        }
    };

    let dealer_host = extract_dealer_host(raw_html).ok_or_else(|| {
        ParseError::SmartPath("unable to determine dealer host for SmartPath site".into())
    })?;

    Ok(SmartPathPage {
        api_key,
        typesense_host,
        index_name,
        dealer_host,
        model_filter: extract_model_filter(raw_html),
    })
}

fn canonical_urls(raw_html: &str) -> Vec<Url> {
    [&*CANONICAL_RE, &*OG_URL_RE]
        .iter()
        .filter_map(|re| re.captures(raw_html))
        .filter_map(|caps| Url::parse(&unescape_html(&caps[1])).ok())
        .collect()
}

fn extract_dealer_host(raw_html: &str) -> Option<String> {
    canonical_urls(raw_html)
        .into_iter()
        .find_map(|url| url.host_str().map(String::from))
}

/// Derive the model filter from the canonical/og URL: an explicit `model=`
/// query parameter, any encoded `_dFR`-style parameter naming a model, or
/// the last path segment.
fn extract_model_filter(raw_html: &str) -> Option<String> {
    let mut candidates: Vec<String> = Vec::new();
    for url in canonical_urls(raw_html) {
        if url.query().is_some() {
            for (key, value) in url.query_pairs() {
                if key == "model" || key.contains("model") {
                    candidates.push(value.into_owned());
                }
            }
        } else if let Some(segments) = url.path_segments() {
            if let Some(last) = segments.filter(|s| !s.is_empty()).last() {
                candidates.push(last.to_string());
            }
        }
    }
    candidates.iter().find_map(|c| normalize_model(c))
}

fn normalize_model(value: &str) -> Option<String> {
    let decoded = value.replace('+', " ").replace("%20", " ");
    match decoded.trim().to_lowercase().as_str() {
        "4runner" | "4 runner" => Some("4Runner".to_string()),
        "tacoma" => Some("Tacoma".to_string()),
        "tundra" => Some("Tundra".to_string()),
        "land cruiser" | "land-cruiser" => Some("Land Cruiser".to_string()),
        _ => None,
    }
}

fn parse_currency(value: Option<&Value>) -> Option<Decimal> {
    let text = value?.as_str()?;
    let stripped = text.replace('$', "").replace(',', "");
    let price: Decimal = stripped.trim().parse().ok()?;
    if price <= Decimal::ZERO {
        None
    } else {
        Some(price)
    }
}

/// Map a Typesense search response (`hits[*].document`) onto inventory rows.
pub fn parse_documents(payload: &Value, dealer_host: &str) -> Vec<ParsedRow> {
    let hits = match payload.get("hits").and_then(Value::as_array) {
        Some(hits) => hits,
        None => return Vec::new(),
    };

    let mut rows = Vec::new();
    for hit in hits {
        let doc = match hit.get("document") {
            Some(doc) if doc.is_object() => doc,
            _ => continue,
        };
        let vin = doc
            .get("vin")
            .or_else(|| doc.get("id"))
            .and_then(Value::as_str);
        let vin = match vin {
            Some(vin) if !vin.is_empty() => vin.to_uppercase(),
            _ => continue,
        };

        let mut row = ParsedRow::new(vin);
        let final_price = parse_currency(doc.get("finalPrice"))
            .or_else(|| parse_currency(doc.get("sellingPrice")))
            .or_else(|| parse_currency(doc.get("price")));
        row.advertised_price = final_price.or_else(|| parse_currency(doc.get("internetPrice")));
        row.msrp = parse_currency(doc.get("msrp")).or_else(|| parse_currency(doc.get("price")));

        let in_transit = doc
            .get("flags")
            .and_then(Value::as_object)
            .and_then(|flags| flags.get("inTransit"))
            .and_then(Value::as_bool)
            == Some(true);
        row.status = Some(if in_transit {
            ListingStatus::InTransit
        } else {
            ListingStatus::Available
        });

        row.vdp_url = doc.get("vdpUrl").and_then(Value::as_str).map(|url| {
            if url.starts_with('/') {
                format!("https://{dealer_host}{url}")
            } else {
                url.to_string()
            }
        });
        row.stock_number = doc
            .get("stockNumber")
            .and_then(Value::as_str)
            .map(String::from);
        row.image_url = doc
            .get("imageUrls")
            .and_then(Value::as_array)
            .and_then(|urls| urls.first())
            .and_then(Value::as_str)
            .map(String::from);
        row.trim = doc.get("trim").and_then(Value::as_str).map(String::from);
        row.model = doc.get("model").and_then(Value::as_str).map(String::from);
        row.year = doc.get("year").and_then(Value::as_i64).map(|y| y as i32);
        row.features = doc.get("features").filter(|v| v.is_array()).cloned();
        rows.push(row);
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    const SRP_HTML: &str = r#"
<link rel="canonical" href="https://www.exampletoyota.com/smartpath/inventory?model=4Runner" />
<script>
var client = new Typesense.Client({
  apiKey: 'TEST_TYPESENSE_KEY',
  nodes: [{host: 'abc123.typesense.net'}]
});
var indexName = 'vehicles-TOY12345';
</script>
"#;

    #[test]
    fn extracts_typesense_page_config() {
        let page = extract_config(SRP_HTML).unwrap();
        assert_eq!(page.api_key, "TEST_TYPESENSE_KEY");
        assert_eq!(page.typesense_host, "abc123.typesense.net");
        assert_eq!(page.index_name, "vehicles-TOY12345");
        assert_eq!(page.dealer_host, "www.exampletoyota.com");
        assert_eq!(page.model_filter.as_deref(), Some("4Runner"));
        assert_eq!(
            page.search_url(),
            "https://abc123.typesense.net/collections/vehicles-TOY12345/documents/search"
        );
        assert_eq!(
            page.filter_by(),
            "condition:='New' && model:='4Runner'"
        );
    }

    #[test]
    fn index_name_falls_back_to_vehicles_literal() {
        let html = r#"
<link rel="canonical" href="https://www.exampletoyota.com/inventory/tundra" />
<script>apiKey: 'K', host: 'ts.example.net', collection "vehicles-ABC999"</script>
"#;
        let page = extract_config(html).unwrap();
        assert_eq!(page.index_name, "vehicles-ABC999");
        // model derived from the last path segment
        assert_eq!(page.model_filter.as_deref(), Some("Tundra"));
    }

    #[test]
    fn missing_config_is_a_parse_error() {
        let err = extract_config("<html>nothing here</html>").unwrap_err();
        assert!(matches!(err, ParseError::SmartPath(_)));
    }

    #[test]
    fn parses_documents() {
        let payload = json!({
            "hits": [{
                "document": {
                    "vin": "jteva5br0s5057991",
                    "finalPrice": "$42,128",
                    "msrp": "$45,143",
                    "vdpUrl": "/vehicle/New/2025/Toyota/4Runner/JTEVA5BR0S5057991/",
                    "stockNumber": "SP100",
                    "imageUrls": ["https://images.example.com/4runner.jpg"],
                    "model": "4Runner",
                    "year": 2025,
                    "flags": {"inTransit": false}
                }
            }]
        });
        let rows = parse_documents(&payload, "www.exampletoyota.com");
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.vin, "JTEVA5BR0S5057991");
        assert_eq!(row.advertised_price, Some(dec!(42128)));
        assert_eq!(row.msrp, Some(dec!(45143)));
        assert_eq!(
            row.vdp_url.as_deref(),
            Some("https://www.exampletoyota.com/vehicle/New/2025/Toyota/4Runner/JTEVA5BR0S5057991/")
        );
        assert_eq!(row.status, Some(ListingStatus::Available));
    }

    #[test]
    fn in_transit_flag_maps_to_status() {
        let payload = json!({
            "hits": [{"document": {"vin": "JTEVA5BR0S5057991", "flags": {"inTransit": true}}}]
        });
        let rows = parse_documents(&payload, "d.test");
        assert_eq!(rows[0].status, Some(ListingStatus::InTransit));
    }
}

//! Team Velocity inventory parser (ld+json structured data).

use lazy_static::lazy_static;
use regex::Regex;
use rust_decimal::Decimal;
use serde_json::Value;
use url::Url;

use crate::errors::ParseError;
use crate::models::{ListingStatus, ParsedRow};

use super::common::unescape_html;

lazy_static! {
    static ref LD_JSON_RE: Regex = Regex::new(
        r#"(?is)<script[^>]+type="application/ld\+json"[^>]*>(.*?)</script>"#
    )
    .unwrap();
    static ref CANONICAL_RE: Regex =
        Regex::new(r#"(?i)<link[^>]+rel="canonical"[^>]+href="([^"]+)""#).unwrap();
}

fn extract_dealer_host(raw_html: &str) -> Option<String> {
    let caps = CANONICAL_RE.captures(raw_html)?;
    let url = Url::parse(&unescape_html(&caps[1])).ok()?;
    url.host_str().map(String::from)
}

fn iter_cars(raw_html: &str) -> Vec<Value> {
    let mut cars = Vec::new();
    for caps in LD_JSON_RE.captures_iter(raw_html) {
        let payload: Value = match serde_json::from_str(caps[1].trim()) {
            Ok(payload) => payload,
            Err(_) => continue,
        };
        let nodes: Vec<Value> = match payload {
            Value::Object(_) => vec![payload],
            Value::Array(items) => items.into_iter().filter(|n| n.is_object()).collect(),
            _ => Vec::new(),
        };
        for node in nodes {
            if node.get("@type").and_then(Value::as_str) == Some("Car") {
                cars.push(node);
            }
        }
    }
    cars
}

fn parse_price(value: Option<&Value>) -> Option<Decimal> {
    let text = value?.as_str()?;
    let stripped = text.replace('$', "").replace(',', "");
    let price: Decimal = stripped.trim().parse().ok()?;
    if price <= Decimal::ZERO {
        None
    } else {
        Some(price)
    }
}

/// Parse `@type == "Car"` ld+json nodes into inventory rows.
pub fn parse_inventory(raw_html: &str) -> Result<Vec<ParsedRow>, ParseError> {
    if raw_html.is_empty() {
        return Ok(Vec::new());
    }

    let dealer_host = extract_dealer_host(raw_html).ok_or_else(|| {
        ParseError::TeamVelocity("unable to determine dealer host for Team Velocity markup".into())
    })?;

    let mut rows = Vec::new();
    for car in iter_cars(raw_html) {
        let vin = match car.get("vehicleIdentificationNumber").and_then(Value::as_str) {
            Some(vin) if !vin.is_empty() => vin.to_uppercase(),
            _ => continue,
        };

        let offer = car.get("offers").filter(|o| o.is_object());

        let mut row = ParsedRow::new(vin);
        row.advertised_price = parse_price(offer.and_then(|o| o.get("price")));
        row.vdp_url = offer
            .and_then(|o| o.get("url"))
            .and_then(Value::as_str)
            .map(|url| {
                if url.starts_with('/') {
                    format!("https://{dealer_host}{url}")
                } else {
                    url.to_string()
                }
            });
        row.stock_number = car.get("sku").and_then(Value::as_str).map(String::from);
        row.status = Some(ListingStatus::Available);
        row.image_url = match car.get("image") {
            Some(Value::Object(image)) => image
                .get("contentUrl")
                .and_then(Value::as_str)
                .map(String::from),
            Some(Value::String(image)) => Some(image.clone()),
            _ => None,
        };
        row.trim = car
            .get("vehicleModel")
            .or_else(|| car.get("model"))
            .and_then(Value::as_str)
            .map(String::from);
        row.model = car.get("model").and_then(Value::as_str).map(String::from);
        row.year = match car.get("vehicleModelDate") {
            Some(Value::Number(n)) => n.as_i64().map(|y| y as i32),
            Some(Value::String(s)) => s.trim().parse().ok(),
            _ => None,
        };
        rows.push(row);
    }

    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const SAMPLE: &str = r#"
<link rel="canonical" href="https://www.teamvelocitydealer.test/new-inventory" />
<script type="application/ld+json">
[
  {
    "@type": "Car",
    "vehicleIdentificationNumber": "jtezu5jr8f5012345",
    "offers": {"price": "$51,230", "url": "/inventory/4runner-trd-pro"},
    "image": {"contentUrl": "https://media.test/4runner.jpg"},
    "sku": "TV9000",
    "model": "4Runner",
    "vehicleModelDate": "2025"
  },
  {"@type": "Organization", "name": "Dealer"}
]
</script>
"#;

    #[test]
    fn parses_car_nodes() {
        let rows = parse_inventory(SAMPLE).unwrap();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.vin, "JTEZU5JR8F5012345");
        assert_eq!(row.advertised_price, Some(dec!(51230)));
        assert_eq!(
            row.vdp_url.as_deref(),
            Some("https://www.teamvelocitydealer.test/inventory/4runner-trd-pro")
        );
        assert_eq!(row.stock_number.as_deref(), Some("TV9000"));
        assert_eq!(row.year, Some(2025));
        assert_eq!(row.status, Some(ListingStatus::Available));
    }

    #[test]
    fn missing_canonical_host_is_a_parse_error() {
        let html = r#"<script type="application/ld+json">{"@type":"Car"}</script>"#;
        assert!(matches!(
            parse_inventory(html),
            Err(ParseError::TeamVelocity(_))
        ));
    }

    #[test]
    fn empty_content_is_ok() {
        assert!(parse_inventory("").unwrap().is_empty());
    }
}

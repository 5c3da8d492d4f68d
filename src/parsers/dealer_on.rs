//! DealerOn inventory parser (Cosmos SRP API).
//!
//! The SRP carries a `dealeron_tagging_data` JSON script with the dealer and
//! page ids the Cosmos API needs. `extract_config` is pure; the orchestrator
//! performs the API call and hands the payload to `parse_api_response`.

use lazy_static::lazy_static;
use regex::Regex;
use rust_decimal::Decimal;
use serde_json::Value;
use url::Url;

use crate::errors::ParseError;
use crate::models::{ListingStatus, ParsedRow};

use super::common::unescape_html;

lazy_static! {
    static ref TAGGING_DATA_RE: Regex = Regex::new(
        r#"(?is)<script[^>]+id="dealeron_tagging_data"[^>]*>(.*?)</script>"#
    )
    .unwrap();
    static ref OG_URL_RE: Regex =
        Regex::new(r#"(?i)<meta[^>]+property="og:url"[^>]+content="([^"]+)""#).unwrap();
    static ref CANONICAL_RE: Regex =
        Regex::new(r#"(?i)<link[^>]+rel="canonical"[^>]+href="([^"]+)""#).unwrap();
}

/// Everything the Cosmos SRP follow-up needs, lifted from the page.
#[derive(Debug, Clone, PartialEq)]
pub struct DealerOnPage {
    pub dealer_id: i64,
    pub page_id: i64,
    pub host: String,
    pub query: Vec<(String, String)>,
    pub page_size: usize,
    /// DealerOn answers a filtered SRP with no inventory as a soft 404.
    pub empty_srp: bool,
}

impl DealerOnPage {
    pub fn api_url(&self) -> String {
        format!(
            "https://{}/api/vhcliaa/vehicle-pages/cosmos/srp/vehicles/{}/{}",
            self.host, self.dealer_id, self.page_id
        )
    }

    /// Query parameters for the Cosmos call: fixed paging plus every
    /// parameter carried on the canonical SRP URL.
    pub fn api_params(&self) -> Vec<(String, String)> {
        let mut params = vec![
            ("host".to_string(), self.host.clone()),
            ("PageNumber".to_string(), "1".to_string()),
            ("PageSize".to_string(), self.page_size.to_string()),
            ("displayCardsShown".to_string(), self.page_size.to_string()),
        ];
        for (key, value) in &self.query {
            params.push((key.clone(), value.clone()));
        }
        params
    }
}

fn extract_tagging_data(raw_html: &str) -> Option<Value> {
    let caps = TAGGING_DATA_RE.captures(raw_html)?;
    serde_json::from_str(caps[1].trim()).ok()
}

fn extract_host_and_query(raw_html: &str) -> (Option<String>, Vec<(String, String)>) {
    let candidate = OG_URL_RE
        .captures(raw_html)
        .or_else(|| CANONICAL_RE.captures(raw_html))
        .map(|caps| caps[1].to_string());

    let candidate = match candidate {
        Some(candidate) => candidate,
        None => return (None, Vec::new()),
    };

    let mut decoded = unescape_html(&candidate);
    if decoded.contains("%3F") && !decoded.contains('?') {
        decoded = decoded.replacen("%3F", "?", 1);
    }

    match Url::parse(&decoded) {
        Ok(parsed) => {
            let host = parsed.host_str().map(String::from);
            let query = parsed
                .query_pairs()
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect();
            (host, query)
        }
        Err(_) => (None, Vec::new()),
    }
}

/// Pull the Cosmos follow-up configuration out of DealerOn SRP markup.
pub fn extract_config(raw_html: &str) -> Result<DealerOnPage, ParseError> {
    if raw_html.is_empty() {
        return Err(ParseError::DealerOn("empty page content".into()));
    }

    let tagging = extract_tagging_data(raw_html).ok_or_else(|| {
        ParseError::DealerOn("unable to locate dealeron_tagging_data script in markup".into())
    })?;

    let dealer_id = tagging
        .get("dealerId")
        .or_else(|| tagging.get("DealerId"))
        .and_then(coerce_id);
    let page_id = tagging
        .get("pageId")
        .or_else(|| tagging.get("PageId"))
        .and_then(coerce_id);
    let (dealer_id, page_id) = match (dealer_id, page_id) {
        (Some(d), Some(p)) => (d, p),
        _ => {
            return Err(ParseError::DealerOn(
                "dealeron_tagging_data missing dealerId or pageId".into(),
            ))
        }
    };

    let (host, query) = extract_host_and_query(raw_html);
    let host = host.ok_or_else(|| {
        ParseError::DealerOn("unable to determine host for DealerOn page from markup".into())
    })?;

    let empty_srp = tagging.get("statusCode").and_then(Value::as_i64) == Some(404);

    let page_size = tagging
        .get("items")
        .and_then(Value::as_array)
        .map(|items| items.len().max(12))
        .unwrap_or(12);

    Ok(DealerOnPage {
        dealer_id,
        page_id,
        host,
        query,
        page_size,
        empty_srp,
    })
}

fn coerce_id(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn normalize_price(value: Option<&Value>) -> Option<Decimal> {
    let price = value.and_then(super::dealer_inspire::coerce_price)?;
    if price <= Decimal::ZERO {
        None
    } else {
        Some(price)
    }
}

/// Map `DisplayCards[*].VehicleCard` entries onto inventory rows.
pub fn parse_api_response(payload: &Value, host: &str) -> Vec<ParsedRow> {
    let cards = match payload.get("DisplayCards").and_then(Value::as_array) {
        Some(cards) => cards,
        None => return Vec::new(),
    };

    let qualify = |url: &str| {
        if url.starts_with("http") {
            url.to_string()
        } else {
            format!("https://{host}{url}")
        }
    };

    let mut rows = Vec::new();
    for card in cards {
        let vehicle = match card.get("VehicleCard") {
            Some(v) if v.is_object() => v,
            _ => continue,
        };
        let image_model = vehicle.get("VehicleImageModel");

        let vin = vehicle
            .get("VehicleVin")
            .and_then(Value::as_str)
            .or_else(|| {
                image_model
                    .and_then(|m| m.get("Vin"))
                    .and_then(Value::as_str)
            });
        let vin = match vin {
            Some(vin) if !vin.trim().is_empty() => vin.trim().to_uppercase(),
            _ => continue,
        };

        let mut row = ParsedRow::new(vin);
        row.advertised_price = normalize_price(vehicle.get("VehicleInternetPrice"))
            .or_else(|| normalize_price(vehicle.get("TaggingPrice")));
        row.msrp = normalize_price(vehicle.get("VehicleMsrp"));
        row.vdp_url = vehicle
            .get("VehicleDetailUrl")
            .and_then(Value::as_str)
            .or_else(|| {
                image_model
                    .and_then(|m| m.get("VehicleDetailUrl"))
                    .and_then(Value::as_str)
            })
            .map(&qualify);
        row.stock_number = vehicle
            .get("VehicleStockNumber")
            .and_then(Value::as_str)
            .map(String::from);
        let in_transit = vehicle.get("VehicleInTransit").and_then(Value::as_bool) == Some(true)
            || vehicle.get("VehicleInProduction").and_then(Value::as_bool) == Some(true);
        row.status = Some(if in_transit {
            ListingStatus::InTransit
        } else {
            ListingStatus::Available
        });
        row.image_url = image_model
            .and_then(|m| m.get("VehiclePhotoSrc"))
            .and_then(Value::as_str)
            .filter(|src| !src.is_empty())
            .map(&qualify);
        row.trim = vehicle
            .get("VehicleTrim")
            .and_then(Value::as_str)
            .map(String::from);
        row.model = vehicle
            .get("VehicleModel")
            .and_then(Value::as_str)
            .map(String::from);
        row.year = vehicle
            .get("VehicleYear")
            .and_then(coerce_id)
            .map(|y| y as i32);
        rows.push(row);
    }
    rows
}

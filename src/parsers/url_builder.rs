//! Inventory URL template expansion.
//!
//! Templates carry `{token}` placeholders resolved from three stacked
//! sources, highest precedence first: per-dealer token overrides in
//! `scraping_config.tokens`, the model registry, and fields on the dealer
//! record itself. Output is deterministic for identical inputs; the URL
//! snapshot fixtures depend on that.

use std::collections::HashMap;

use lazy_static::lazy_static;
use regex::Regex;
use url::Url;

use crate::errors::ScrapeError;
use crate::models::{Dealer, TemplateScope};

/// Token forms for one supported model.
pub struct ModelTokens {
    pub name: &'static str,
    pub slug: &'static str,
    pub plus: &'static str,
    pub encoded: &'static str,
    pub underscore: &'static str,
    pub series: &'static str,
    /// Backend-specific numeric id used by `md=` style query templates.
    pub id: &'static str,
}

pub const MODEL_REGISTRY: &[ModelTokens] = &[
    ModelTokens {
        name: "Land Cruiser",
        slug: "land-cruiser",
        plus: "Land+Cruiser",
        encoded: "Land%20Cruiser",
        underscore: "land_cruiser",
        series: "landcruiser",
        id: "23060",
    },
    ModelTokens {
        name: "4Runner",
        slug: "4runner",
        plus: "4Runner",
        encoded: "4Runner",
        underscore: "4runner",
        series: "4runner",
        id: "22560",
    },
    ModelTokens {
        name: "Tacoma",
        slug: "tacoma",
        plus: "Tacoma",
        encoded: "Tacoma",
        underscore: "tacoma",
        series: "tacoma",
        id: "22500",
    },
    ModelTokens {
        name: "Tundra",
        slug: "tundra",
        plus: "Tundra",
        encoded: "Tundra",
        underscore: "tundra",
        series: "tundra",
        id: "23070",
    },
];

pub fn model_tokens(model: &str) -> Option<&'static ModelTokens> {
    MODEL_REGISTRY.iter().find(|entry| entry.name == model)
}

lazy_static! {
    static ref PLACEHOLDER_RE: Regex = Regex::new(r"\{([A-Za-z0-9_]+)\}").unwrap();
    static ref CITY_CODE_PARAM_MID_RE: Regex =
        Regex::new(r"([?&])[A-Za-z0-9_]+=\{city_code\}&").unwrap();
    static ref CITY_CODE_PARAM_END_RE: Regex =
        Regex::new(r"[?&][A-Za-z0-9_]+=\{city_code\}").unwrap();
}

/// Legacy placeholder spellings still present in older catalog exports.
const PLACEHOLDER_ALIASES: &[(&str, &str)] = &[
    ("{modelParam}", "{model_plus}"),
    ("{model_param}", "{model_plus}"),
    ("{model}", "{model_plus}"),
    ("{MODEL}", "{model_plus}"),
    ("{ModelSlug}", "{model_slug}"),
    ("{model_slugified}", "{model_slug}"),
    ("{model_name_plus}", "{model_plus}"),
    ("{model_encoded}", "{model_name_encoded}"),
];

/// Expand a dealer's inventory URL template for one model.
pub fn build_inventory_url(dealer: &Dealer, model: &str) -> Result<String, ScrapeError> {
    let tokens = model_tokens(model)
        .ok_or_else(|| ScrapeError::UnsupportedModel(model.to_string()))?;

    let mut template = dealer
        .inventory_url_template
        .clone()
        .unwrap_or_default();
    for (alias, canonical) in PLACEHOLDER_ALIASES {
        template = template.replace(alias, canonical);
    }

    let homepage = dealer.homepage_url.clone().unwrap_or_default();

    let mut values: HashMap<String, String> = HashMap::new();
    values.insert(
        "homepage_url".into(),
        homepage.trim_end_matches('/').to_string(),
    );
    // Dealer record fallbacks (lowest precedence).
    if let Some(code) = &dealer.code {
        values.insert("dealer_code".into(), code.clone());
    }
    if let Some(city) = &dealer.city {
        values.insert("city".into(), city.to_lowercase());
    }
    if let Some(state) = &dealer.state {
        values.insert("state".into(), state.to_lowercase());
    }
    if let Some(zip) = &dealer.postal_code {
        values.insert("city_code".into(), zip.clone());
    }
    // Model registry.
    values.insert("model_slug".into(), tokens.slug.to_string());
    values.insert("model_plus".into(), tokens.plus.to_string());
    values.insert("model_name_encoded".into(), tokens.encoded.to_string());
    values.insert("model_underscore".into(), tokens.underscore.to_string());
    values.insert("model_series".into(), tokens.series.to_string());
    values.insert("model_id".into(), tokens.id.to_string());
    // Per-dealer overrides win over everything above.
    for (key, value) in &dealer.scraping_config.tokens {
        values.insert(key.clone(), value.clone());
    }

    let mut url = template;
    for (token, value) in &values {
        url = url.replace(&format!("{{{token}}}"), value);
    }

    // A missing city_code is tolerated: drop the dangling query parameter
    // and clean any empty `?`/`&` leftovers.
    if url.contains("{city_code}") {
        url = CITY_CODE_PARAM_MID_RE.replace_all(&url, "$1").into_owned();
        url = CITY_CODE_PARAM_END_RE.replace_all(&url, "").into_owned();
        url = url.replace("{city_code}", "");
        while url.ends_with('?') || url.ends_with('&') {
            url.pop();
        }
    }

    if let Some(caps) = PLACEHOLDER_RE.captures(&url) {
        return Err(ScrapeError::MissingPlaceholder(caps[1].to_string()));
    }

    if dealer.scraping_config.template_scope == TemplateScope::Relative
        && !url.starts_with("http")
        && !homepage.is_empty()
    {
        let base = Url::parse(&homepage)
            .map_err(|e| ScrapeError::FetchTerminal(format!("invalid homepage url: {e}")))?;
        let joined = base
            .join(&url)
            .map_err(|e| ScrapeError::FetchTerminal(format!("cannot resolve template: {e}")))?;
        return Ok(joined.to_string());
    }

    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ScrapingConfig;

    fn dealer(template: &str, scope: TemplateScope) -> Dealer {
        Dealer {
            id: 1,
            name: "Test Dealer".to_string(),
            code: Some("04325".to_string()),
            region: None,
            homepage_url: Some("https://www.dealer.test".to_string()),
            backend_type: "DEALER_COM".to_string(),
            inventory_url_template: Some(template.to_string()),
            scraping_config: ScrapingConfig {
                template_scope: scope,
                ..Default::default()
            },
            is_active: true,
            last_scraped_at: None,
            district_code: None,
            phone: None,
            city: Some("Lansing".to_string()),
            state: Some("MI".to_string()),
            postal_code: Some("48911".to_string()),
        }
    }

    #[test]
    fn expands_model_registry_tokens() {
        let d = dealer(
            "https://www.dealer.test/inventory/{model_slug}?q={model_name_encoded}",
            TemplateScope::Absolute,
        );
        let url = build_inventory_url(&d, "Land Cruiser").unwrap();
        assert_eq!(
            url,
            "https://www.dealer.test/inventory/land-cruiser?q=Land%20Cruiser"
        );
    }

    #[test]
    fn unsupported_model_fails() {
        let d = dealer("https://www.dealer.test/{model_slug}", TemplateScope::Absolute);
        match build_inventory_url(&d, "Camry") {
            Err(ScrapeError::UnsupportedModel(model)) => assert_eq!(model, "Camry"),
            other => panic!("expected UnsupportedModel, got {other:?}"),
        }
    }

    #[test]
    fn missing_city_code_cleans_query_artifacts() {
        let mut d = dealer(
            "https://www.dealer.test/search/new-toyota-{model_slug}/?cy={city_code}&md={model_id}",
            TemplateScope::Absolute,
        );
        d.postal_code = None;
        let url = build_inventory_url(&d, "Tacoma").unwrap();
        assert_eq!(
            url,
            "https://www.dealer.test/search/new-toyota-tacoma/?md=22500"
        );
    }

    #[test]
    fn missing_city_code_at_tail_drops_empty_query() {
        let mut d = dealer(
            "https://www.dealer.test/search/{model_slug}?cy={city_code}",
            TemplateScope::Absolute,
        );
        d.postal_code = None;
        let url = build_inventory_url(&d, "Tundra").unwrap();
        assert_eq!(url, "https://www.dealer.test/search/tundra");
    }

    #[test]
    fn other_missing_tokens_fail() {
        let mut d = dealer(
            "https://www.dealer.test/inventory?dealer={dealer_code}",
            TemplateScope::Absolute,
        );
        d.code = None;
        match build_inventory_url(&d, "Tacoma") {
            Err(ScrapeError::MissingPlaceholder(token)) => assert_eq!(token, "dealer_code"),
            other => panic!("expected MissingPlaceholder, got {other:?}"),
        }
    }

    #[test]
    fn config_tokens_override_dealer_fields() {
        let mut d = dealer(
            "https://www.dealer.test/search?cy={city_code}&city={city}",
            TemplateScope::Absolute,
        );
        d.scraping_config
            .tokens
            .insert("city_code".to_string(), "99999".to_string());
        let url = build_inventory_url(&d, "Tacoma").unwrap();
        assert_eq!(url, "https://www.dealer.test/search?cy=99999&city=lansing");
    }

    #[test]
    fn relative_templates_resolve_against_homepage() {
        let d = dealer("/inventory/new/{model_slug}", TemplateScope::Relative);
        let url = build_inventory_url(&d, "4Runner").unwrap();
        assert_eq!(url, "https://www.dealer.test/inventory/new/4runner");
    }

    #[test]
    fn legacy_aliases_normalize() {
        let d = dealer(
            "https://www.dealer.test/new-inventory/index.htm?model={model}",
            TemplateScope::Absolute,
        );
        let url = build_inventory_url(&d, "Land Cruiser").unwrap();
        assert_eq!(
            url,
            "https://www.dealer.test/new-inventory/index.htm?model=Land+Cruiser"
        );
    }

    #[test]
    fn output_is_deterministic() {
        let d = dealer(
            "{homepage_url}/search/new-toyota-{model_slug}-{city}-{state}/?cy={city_code}&md={model_id}",
            TemplateScope::Absolute,
        );
        let first = build_inventory_url(&d, "4Runner").unwrap();
        let second = build_inventory_url(&d, "4Runner").unwrap();
        assert_eq!(first, second);
        assert_eq!(
            first,
            "https://www.dealer.test/search/new-toyota-4runner-lansing-mi/?cy=48911&md=22560"
        );
    }
}

//! Ordered cheapest-price rule chain.

use berth_core::{CabinClass, ClassPrice, PriceSource, PriceSummary};
use serde_json::{Map, Value as JsonValue};

use crate::fields::{positive_amount, text};

/// One place in the feed where per-class cheapest prices may live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriceRule {
    /// `cheapestinside`, `cheapestoutside`, ... directly on the payload.
    TopLevel,
    /// `cheapest.combined.{inside,outside,balcony,suite}`.
    CheapestCombined,
    /// `cheapest.prices.{inside,outside,balcony,suite}`.
    CheapestPrices,
}

impl PriceRule {
    pub const CHAIN: [PriceRule; 3] = [
        PriceRule::TopLevel,
        PriceRule::CheapestCombined,
        PriceRule::CheapestPrices,
    ];

    pub fn source(self) -> PriceSource {
        match self {
            PriceRule::TopLevel => PriceSource::TopLevel,
            PriceRule::CheapestCombined => PriceSource::CheapestCombined,
            PriceRule::CheapestPrices => PriceSource::CheapestPrices,
        }
    }

    fn container<'a>(self, root: &'a Map<String, JsonValue>) -> Option<&'a Map<String, JsonValue>> {
        let nested = |key: &str| root.get("cheapest")?.get(key)?.as_object();
        match self {
            PriceRule::TopLevel => Some(root),
            PriceRule::CheapestCombined => nested("combined"),
            PriceRule::CheapestPrices => nested("prices"),
        }
    }

    fn amount_key(self, class: CabinClass) -> String {
        let feed_name = feed_class_name(class);
        match self {
            PriceRule::TopLevel => format!("cheapest{feed_name}"),
            PriceRule::CheapestCombined | PriceRule::CheapestPrices => feed_name.to_string(),
        }
    }

    /// Prices found by this rule alone, or `None` when it yields no positive class price.
    pub fn apply(self, root: &Map<String, JsonValue>) -> Option<PriceSummary> {
        let container = self.container(root)?;
        let mut summary = PriceSummary {
            source: Some(self.source()),
            ..Default::default()
        };
        for class in CabinClass::ALL {
            let key = self.amount_key(class);
            let Some(amount) = container.get(&key).and_then(positive_amount) else {
                continue;
            };
            let price_code = container.get(&format!("{key}pricecode")).and_then(text);
            *summary.class_mut(class) = Some(ClassPrice { amount, price_code });
        }
        if summary.has_any_class_price() {
            summary.recompute_cheapest();
            Some(summary)
        } else {
            None
        }
    }
}

fn feed_class_name(class: CabinClass) -> &'static str {
    match class {
        CabinClass::Interior => "inside",
        CabinClass::Oceanview => "outside",
        CabinClass::Balcony => "balcony",
        CabinClass::Suite => "suite",
    }
}

/// First rule in the chain that yields anything wins entirely; no mixing across rules.
pub fn extract_prices(root: &Map<String, JsonValue>) -> PriceSummary {
    PriceRule::CHAIN
        .iter()
        .find_map(|rule| rule.apply(root))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: JsonValue) -> Map<String, JsonValue> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn top_level_beats_nested_blocks() {
        let root = object(json!({
            "cheapestinside": "500.00",
            "cheapestinsidepricecode": "IA",
            "cheapest": {"combined": {"inside": "999", "suite": 120}}
        }));
        let prices = extract_prices(&root);
        assert_eq!(prices.source, Some(PriceSource::TopLevel));
        assert_eq!(prices.amount(CabinClass::Interior), Some(500.0));
        assert_eq!(prices.amount(CabinClass::Suite), None);
        assert_eq!(prices.interior.unwrap().price_code.as_deref(), Some("IA"));
    }

    #[test]
    fn falls_back_through_combined_then_prices() {
        let combined = object(json!({
            "cheapestinside": 0,
            "cheapest": {
                "combined": {"outside": "812.5", "balcony": ""},
                "prices": {"inside": 100}
            }
        }));
        let prices = extract_prices(&combined);
        assert_eq!(prices.source, Some(PriceSource::CheapestCombined));
        assert_eq!(prices.cheapest, Some(812.5));
        assert_eq!(prices.amount(CabinClass::Interior), None);

        let only_prices = object(json!({"cheapest": {"prices": {"balcony": 1400, "suite": "2100"}}}));
        let prices = extract_prices(&only_prices);
        assert_eq!(prices.source, Some(PriceSource::CheapestPrices));
        assert_eq!(prices.cheapest, Some(1400.0));
    }

    #[test]
    fn no_prices_anywhere_leaves_cheapest_null() {
        let root = object(json!({"cheapestinside": null, "cheapest": {"combined": {"inside": "n/a"}}}));
        let prices = extract_prices(&root);
        assert_eq!(prices, PriceSummary::default());
        assert_eq!(prices.cheapest, None);
    }
}

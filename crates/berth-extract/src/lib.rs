//! Extraction Normalizer: raw feed payload -> canonical `SailingRecord`.

use berth_core::{return_date, FailureKind, FamilyId, InstanceId, LineId, SailingRecord};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::debug;

pub mod corrections;
pub mod fields;
pub mod reconstruct;
pub mod rules;

pub use corrections::{CorrectionOutcome, LineCorrection, PriceCorrections};
pub use reconstruct::{decode_bytes, decode_value, Decoded};
pub use rules::{extract_prices, PriceRule};

pub const CRATE_NAME: &str = "berth-extract";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExtractionError {
    #[error("missing identity field `{field}`")]
    MissingIdentity { field: &'static str },
    #[error("corrupt payload: {reason}")]
    Corrupt { reason: String },
    #[error("unrecognized payload schema: {reason}")]
    UnrecognizedSchema { reason: String },
}

impl ExtractionError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ExtractionError::MissingIdentity { .. } => FailureKind::MissingIdentity,
            ExtractionError::Corrupt { .. } => FailureKind::Corrupt,
            ExtractionError::UnrecognizedSchema { .. } => FailureKind::UnrecognizedSchema,
        }
    }
}

/// What the caller knows about a payload besides its bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractContext {
    pub line_id: LineId,
    pub ship_id: Option<i32>,
    pub source_path: Option<String>,
}

impl ExtractContext {
    pub fn new(line_id: LineId) -> Self {
        Self {
            line_id,
            ship_id: None,
            source_path: None,
        }
    }

    pub fn with_ship(mut self, ship_id: i32) -> Self {
        self.ship_id = Some(ship_id);
        self
    }

    pub fn with_source_path(mut self, path: impl Into<String>) -> Self {
        self.source_path = Some(path.into());
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    corrections: PriceCorrections,
}

impl Normalizer {
    pub fn new(corrections: PriceCorrections) -> Self {
        Self { corrections }
    }

    pub fn corrections(&self) -> &PriceCorrections {
        &self.corrections
    }

    pub fn normalize(&self, bytes: &[u8], ctx: &ExtractContext) -> Result<SailingRecord, ExtractionError> {
        let decoded = decode_bytes(bytes)?;
        self.normalize_decoded(decoded, ctx)
    }

    /// Same as [`Normalizer::normalize`] for an already parsed payload, e.g. a stored raw copy.
    pub fn normalize_value(&self, value: JsonValue, ctx: &ExtractContext) -> Result<SailingRecord, ExtractionError> {
        let decoded = decode_value(value)?;
        self.normalize_decoded(decoded, ctx)
    }

    fn normalize_decoded(&self, decoded: Decoded, ctx: &ExtractContext) -> Result<SailingRecord, ExtractionError> {
        let Decoded {
            payload,
            object,
            reconstructed,
        } = decoded;
        if reconstructed {
            debug!(path = ctx.source_path.as_deref().unwrap_or("-"), "reassembled encoded payload");
        }

        let instance_id = identity(&object, "codetocruiseid")?;
        let family_id = identity(&object, "cruiseid")?;

        let mut prices = extract_prices(&object);
        let correction = self.corrections.apply(ctx.line_id, &mut prices);

        let get = |key: &str| object.get(key);
        let sailing_date = get("saildate")
            .and_then(fields::date)
            .or_else(|| get("startdate").and_then(fields::date));
        let nights = get("nights").and_then(fields::integer);

        let record = SailingRecord {
            instance_id: InstanceId::new(instance_id),
            family_id: FamilyId::new(family_id),
            line_id: ctx.line_id,
            ship_id: get("shipid")
                .and_then(fields::integer)
                .filter(|id| *id > 0)
                .or(ctx.ship_id),
            name: get("name").and_then(fields::text),
            voyage_code: get("voyagecode").and_then(fields::text),
            itinerary_code: get("itinerarycode").and_then(fields::text),
            sailing_date,
            return_date: return_date(sailing_date, nights),
            nights,
            sail_nights: get("sailnights").and_then(fields::integer),
            sea_days: get("seadays").and_then(fields::integer),
            embark_port_id: get("startportid").and_then(fields::integer),
            disembark_port_id: get("endportid").and_then(fields::integer),
            region_ids: get("regionids").map(fields::id_list).unwrap_or_default(),
            port_ids: get("portids").map(fields::id_list).unwrap_or_default(),
            no_fly: get("nofly").and_then(fields::flag),
            depart_uk: get("departuk").and_then(fields::flag),
            visible: get("showcruise").and_then(fields::flag),
            currency: get("currency").and_then(fields::text),
            line_name: nested_name(&object, "linecontent").or_else(|| get("linename").and_then(fields::text)),
            ship_name: nested_name(&object, "shipcontent").or_else(|| get("shipname").and_then(fields::text)),
            port_names: get("ports").map(fields::name_map).unwrap_or_default(),
            region_names: get("regions").map(fields::name_map).unwrap_or_default(),
            prices,
            price_divisor: correction.divisor,
            anomalies: correction.anomalies,
            source_path: ctx.source_path.clone(),
            raw: payload,
            reconstructed: reconstructed.then(|| JsonValue::Object(object)),
        };
        Ok(record)
    }
}

fn identity(object: &Map<String, JsonValue>, field: &'static str) -> Result<String, ExtractionError> {
    object
        .get(field)
        .and_then(fields::text)
        .ok_or(ExtractionError::MissingIdentity { field })
}

fn nested_name(object: &Map<String, JsonValue>, key: &str) -> Option<String> {
    object.get(key)?.get("name").and_then(fields::text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_core::{CabinClass, PriceSource};
    use chrono::NaiveDate;
    use serde_json::json;

    fn ctx() -> ExtractContext {
        ExtractContext::new(LineId::new(16).unwrap())
            .with_ship(412)
            .with_source_path("2025/05/16/412/S1.json")
    }

    #[test]
    fn end_to_end_example_prefers_top_level_price() {
        let payload = br#"{"cruiseid":"A1","codetocruiseid":"S1","lineid":16,"cheapestinside":"500.00","cheapest":{"combined":{"inside":"999"}}}"#;
        let record = Normalizer::default().normalize(payload, &ctx()).unwrap();
        assert_eq!(record.instance_id.as_str(), "S1");
        assert_eq!(record.family_id.as_str(), "A1");
        assert_eq!(record.prices.amount(CabinClass::Interior), Some(500.0));
        assert_eq!(record.prices.cheapest, Some(500.0));
        assert_eq!(record.prices.source, Some(PriceSource::TopLevel));
        assert_eq!(record.ship_id, Some(412));
        assert_eq!(record.source_path.as_deref(), Some("2025/05/16/412/S1.json"));
    }

    #[test]
    fn missing_identity_is_reported_by_field() {
        let normalizer = Normalizer::default();
        let err = normalizer
            .normalize(br#"{"cruiseid":"A1","cheapestinside":10}"#, &ctx())
            .unwrap_err();
        assert_eq!(err, ExtractionError::MissingIdentity { field: "codetocruiseid" });
        assert_eq!(err.kind(), FailureKind::MissingIdentity);

        let err = normalizer
            .normalize(br#"{"codetocruiseid":"S1","cruiseid":"  "}"#, &ctx())
            .unwrap_err();
        assert_eq!(err, ExtractionError::MissingIdentity { field: "cruiseid" });
    }

    #[test]
    fn numeric_identities_are_accepted() {
        let record = Normalizer::default()
            .normalize(br#"{"codetocruiseid":123456,"cruiseid":987}"#, &ctx())
            .unwrap();
        assert_eq!(record.instance_id.as_str(), "123456");
        assert_eq!(record.family_id.as_str(), "987");
        assert_eq!(record.prices.cheapest, None);
    }

    #[test]
    fn character_array_payload_is_kept_verbatim_beside_its_reconstruction() {
        let text = r#"{"codetocruiseid":"S9","cruiseid":"F9","cheapestsuite":"2000"}"#;
        let fragments: Map<String, JsonValue> = text
            .chars()
            .enumerate()
            .map(|(i, c)| (i.to_string(), JsonValue::String(c.to_string())))
            .collect();
        let bytes = serde_json::to_vec(&JsonValue::Object(fragments)).unwrap();
        let record = Normalizer::default().normalize(&bytes, &ctx()).unwrap();
        assert_eq!(record.instance_id.as_str(), "S9");
        assert_eq!(record.prices.cheapest, Some(2000.0));
        assert_eq!(record.raw, serde_json::from_slice::<JsonValue>(&bytes).unwrap());
        assert_eq!(record.raw["0"], "{");
        assert_eq!(record.reconstructed.as_ref().unwrap()["cruiseid"], "F9");

        let again = Normalizer::default().normalize_value(record.raw.clone(), &ctx()).unwrap();
        assert_eq!(again.instance_id.as_str(), "S9");
        assert_eq!(again.prices.cheapest, Some(2000.0));
    }

    #[test]
    fn plain_payload_is_raw_without_a_separate_reconstruction() {
        let payload = br#"{"codetocruiseid":"S1","cruiseid":"A1","cheapestinside":"500.00"}"#;
        let record = Normalizer::default().normalize(payload, &ctx()).unwrap();
        assert_eq!(record.raw, serde_json::from_slice::<JsonValue>(payload).unwrap());
        assert_eq!(record.reconstructed, None);
    }

    #[test]
    fn double_encoded_payload_is_stored_as_the_received_string() {
        let inner = r#"{"codetocruiseid":"S2","cruiseid":"A2"}"#;
        let bytes = serde_json::to_vec(&JsonValue::String(inner.to_string())).unwrap();
        let record = Normalizer::default().normalize(&bytes, &ctx()).unwrap();
        assert_eq!(record.raw, JsonValue::String(inner.to_string()));
        assert_eq!(record.reconstructed.as_ref().unwrap()["codetocruiseid"], "S2");
    }

    #[test]
    fn descriptive_fields_are_permissive() {
        let payload = json!({
            "codetocruiseid": "S1",
            "cruiseid": "A1",
            "name": "Caribbean Escape",
            "saildate": "2025-12-28",
            "nights": "7",
            "startportid": 10,
            "endportid": "11",
            "portids": "10,12,11",
            "regionids": [3],
            "showcruise": "Y",
            "nofly": "N",
            "linecontent": {"name": "Example Line"},
            "shipname": "Example Ship",
            "ports": {"10": "Miami", "12": {"name": "Nassau"}},
            "regions": {"3": "Caribbean"}
        });
        let record = Normalizer::default().normalize_value(payload, &ctx()).unwrap();
        assert_eq!(record.return_date, NaiveDate::from_ymd_opt(2026, 1, 4));
        assert_eq!(record.port_ids, vec![10, 12, 11]);
        assert_eq!(record.visible, Some(true));
        assert_eq!(record.no_fly, Some(false));
        assert_eq!(record.line_name.as_deref(), Some("Example Line"));
        assert_eq!(record.ship_name.as_deref(), Some("Example Ship"));
        assert_eq!(record.port_names.len(), 2);
        assert!(record.referenced_port_ids().contains(&11));
        assert_eq!(record.sea_days, None);
    }

    #[test]
    fn line_divisor_is_applied_after_extraction() {
        let corrections = PriceCorrections::default().with_divisor(LineId::new(16).unwrap(), 100.0);
        let record = Normalizer::new(corrections)
            .normalize(br#"{"codetocruiseid":"S1","cruiseid":"A1","cheapestinside":50000,"cheapestbalcony":"90000"}"#, &ctx())
            .unwrap();
        assert_eq!(record.prices.amount(CabinClass::Interior), Some(500.0));
        assert_eq!(record.prices.cheapest, Some(500.0));
        assert_eq!(record.price_divisor, Some(100.0));
    }

    #[test]
    fn non_object_payloads_are_classified() {
        let normalizer = Normalizer::default();
        assert_eq!(
            normalizer.normalize(b"[]", &ctx()).unwrap_err().kind(),
            FailureKind::UnrecognizedSchema
        );
        assert_eq!(
            normalizer.normalize(b"{\"codetocruiseid\":", &ctx()).unwrap_err().kind(),
            FailureKind::Corrupt
        );
    }
}

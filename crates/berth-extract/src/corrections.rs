//! Per-line price corrections loaded from `rules/price_corrections.yaml`.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use berth_core::{CabinClass, LineId, PriceSummary};
use serde::Deserialize;

pub const CORRECTIONS_FILE: &str = "price_corrections.yaml";

#[derive(Debug, Clone, Deserialize)]
struct CorrectionsFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    anomaly_threshold: Option<f64>,
    #[serde(default)]
    lines: Vec<LineCorrection>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LineCorrection {
    pub line_id: i32,
    pub divisor: f64,
    #[serde(default)]
    pub note: Option<String>,
}

/// Result of running one record's prices through the table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CorrectionOutcome {
    pub divisor: Option<f64>,
    pub anomalies: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PriceCorrections {
    divisors: BTreeMap<i32, f64>,
    anomaly_threshold: Option<f64>,
}

impl PriceCorrections {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let file: CorrectionsFile = serde_yaml::from_str(text).context("parsing price corrections")?;
        let mut divisors = BTreeMap::new();
        for line in file.lines {
            if line.line_id <= 0 {
                bail!("price correction for non-positive line id {}", line.line_id);
            }
            if !(line.divisor.is_finite() && line.divisor > 0.0) {
                bail!("price correction for line {} has invalid divisor {}", line.line_id, line.divisor);
            }
            divisors.insert(line.line_id, line.divisor);
        }
        Ok(Self {
            divisors,
            anomaly_threshold: file.anomaly_threshold.filter(|t| *t > 0.0),
        })
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    /// Loads `{rules_dir}/price_corrections.yaml`, or an empty table when the file is absent.
    pub fn from_rules_dir(rules_dir: impl AsRef<Path>) -> Result<Self> {
        let path = rules_dir.as_ref().join(CORRECTIONS_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::from_yaml_file(path)
    }

    pub fn with_divisor(mut self, line_id: LineId, divisor: f64) -> Self {
        self.divisors.insert(line_id.get(), divisor);
        self
    }

    pub fn with_anomaly_threshold(mut self, threshold: f64) -> Self {
        self.anomaly_threshold = Some(threshold);
        self
    }

    pub fn divisor_for(&self, line_id: LineId) -> Option<f64> {
        self.divisors.get(&line_id.get()).copied()
    }

    /// Divides corrected lines' prices; flags suspicious prices on uncorrected lines.
    pub fn apply(&self, line_id: LineId, prices: &mut PriceSummary) -> CorrectionOutcome {
        if let Some(divisor) = self.divisor_for(line_id) {
            for class in CabinClass::ALL {
                if let Some(price) = prices.class_mut(class) {
                    price.amount /= divisor;
                }
            }
            prices.recompute_cheapest();
            return CorrectionOutcome {
                divisor: Some(divisor),
                anomalies: Vec::new(),
            };
        }

        let Some(threshold) = self.anomaly_threshold else {
            return CorrectionOutcome::default();
        };
        let anomalies = CabinClass::ALL
            .iter()
            .filter_map(|class| {
                let amount = prices.amount(*class)?;
                (amount > threshold).then(|| {
                    format!(
                        "{} price {amount} exceeds {threshold} on line {line_id} without a correction",
                        class.as_str()
                    )
                })
            })
            .collect();
        CorrectionOutcome {
            divisor: None,
            anomalies,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_core::ClassPrice;

    fn prices(interior: f64, suite: f64) -> PriceSummary {
        let mut summary = PriceSummary {
            interior: Some(ClassPrice {
                amount: interior,
                price_code: None,
            }),
            suite: Some(ClassPrice {
                amount: suite,
                price_code: None,
            }),
            ..Default::default()
        };
        summary.recompute_cheapest();
        summary
    }

    #[test]
    fn divisor_applies_to_every_class_and_cheapest() {
        let table = PriceCorrections::from_yaml_str(
            "version: 1\nanomaly_threshold: 50000\nlines:\n  - line_id: 16\n    divisor: 100\n    note: cents\n",
        )
        .unwrap();
        let line = LineId::new(16).unwrap();
        let mut summary = prices(50000.0, 120000.0);
        let outcome = table.apply(line, &mut summary);
        assert_eq!(outcome.divisor, Some(100.0));
        assert!(outcome.anomalies.is_empty());
        assert_eq!(summary.amount(CabinClass::Interior), Some(500.0));
        assert_eq!(summary.cheapest, Some(500.0));
    }

    #[test]
    fn uncorrected_lines_are_flagged_not_changed() {
        let table = PriceCorrections::default().with_anomaly_threshold(50000.0);
        let mut summary = prices(700.0, 90000.0);
        let outcome = table.apply(LineId::new(3).unwrap(), &mut summary);
        assert_eq!(outcome.divisor, None);
        assert_eq!(outcome.anomalies.len(), 1);
        assert_eq!(summary.amount(CabinClass::Suite), Some(90000.0));
    }

    #[test]
    fn rejects_bad_divisors_and_tolerates_missing_file() {
        assert!(PriceCorrections::from_yaml_str("version: 1\nlines:\n  - line_id: 1\n    divisor: 0\n").is_err());
        let dir = tempfile::tempdir().unwrap();
        let table = PriceCorrections::from_rules_dir(dir.path()).unwrap();
        assert_eq!(table, PriceCorrections::default());

        std::fs::write(dir.path().join(CORRECTIONS_FILE), "version: 1\nlines: []\n").unwrap();
        assert!(PriceCorrections::from_rules_dir(dir.path()).is_ok());
    }
}

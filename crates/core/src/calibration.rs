//! Reading sheets: the step/reading table edited on a calibration worksheet.
//!
//! Only the small statistics needed around autosave live here: the estimates shown while the
//! technician types, and the evaluation the mock backend answers with.

use log::warn;
use rust_decimal::{Decimal, MathematicalOps};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::drafts::{coerce_decimal, CanonicalRules, DraftModel};
use crate::errors::{Error, Result};

/// Fields of a reading sheet payload that hold numbers.
pub const READING_FIELDS: [&str; 2] = ["nominal", "readings"];

const RESULT_DP: u32 = 6;

pub fn reading_rules() -> CanonicalRules {
    CanonicalRules::numeric(READING_FIELDS)
}

/// One calibration point: the nominal value and the readings taken against it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadingStep {
    pub nominal: String,
    pub readings: Vec<String>,
    pub mean: Option<Decimal>,
    pub error: Option<Decimal>,
    pub std_dev: Option<Decimal>,
}

impl ReadingStep {
    pub fn new<I, S>(nominal: impl Into<String>, readings: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            nominal: nominal.into(),
            readings: readings.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    fn nominal_value(&self) -> Decimal {
        coerce_decimal(&Value::String(self.nominal.clone())).unwrap_or(Decimal::ZERO)
    }

    /// Reading cells as numbers, blanks counted as zero like the canonical payload.
    fn values(&self) -> Vec<Decimal> {
        self.readings
            .iter()
            .map(|cell| coerce_decimal(&Value::String(cell.clone())).unwrap_or(Decimal::ZERO))
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadingSheet {
    pub steps: Vec<ReadingStep>,
    /// Largest absolute step error; depends on the set of steps.
    pub max_error: Option<Decimal>,
}

impl ReadingSheet {
    pub fn new(steps: Vec<ReadingStep>) -> Self {
        Self {
            steps,
            max_error: None,
        }
    }

    /// Writes one reading cell, growing the row if needed. Returns false for an unknown step.
    pub fn set_reading(&mut self, step: usize, index: usize, value: impl Into<String>) -> bool {
        let Some(row) = self.steps.get_mut(step) else {
            return false;
        };
        if row.readings.len() <= index {
            row.readings.resize(index + 1, String::new());
        }
        row.readings[index] = value.into();
        true
    }

    pub fn add_step(&mut self, nominal: impl Into<String>, columns: usize) {
        self.steps
            .push(ReadingStep::new(nominal, vec![String::new(); columns]));
    }

    pub fn remove_step(&mut self, index: usize) -> Option<ReadingStep> {
        (index < self.steps.len()).then(|| self.steps.remove(index))
    }
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        Value::Number(number) => number.to_string(),
        other => other.to_string(),
    }
}

impl DraftModel for ReadingSheet {
    fn from_stored(stored: &Value) -> Result<Self> {
        let steps = match stored.get("steps") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(rows)) => rows
                .iter()
                .map(|row| {
                    let readings: Vec<String> = match row.get("readings") {
                        Some(Value::Array(cells)) => cells.iter().map(cell_text).collect(),
                        None | Some(Value::Null) => Vec::new(),
                        Some(other) => {
                            return Err(Error::invalid_data(format!(
                                "readings must be an array, got {}",
                                other
                            )))
                        }
                    };
                    Ok(ReadingStep {
                        nominal: row.get("nominal").map(cell_text).unwrap_or_default(),
                        readings,
                        mean: row.get("mean").and_then(coerce_decimal),
                        error: row.get("error").and_then(coerce_decimal),
                        std_dev: row.get("std_dev").and_then(coerce_decimal),
                    })
                })
                .collect::<Result<Vec<_>>>()?,
            Some(other) => {
                return Err(Error::invalid_data(format!(
                    "steps must be an array, got {}",
                    other
                )))
            }
        };

        Ok(Self {
            steps,
            max_error: stored.get("max_error").and_then(coerce_decimal),
        })
    }

    fn to_payload(&self) -> Value {
        let steps = self
            .steps
            .iter()
            .map(|step| json!({ "nominal": step.nominal, "readings": step.readings }))
            .collect::<Vec<_>>();
        json!({ "steps": steps })
    }

    fn recompute_estimates(&mut self) {
        for step in &mut self.steps {
            let nominal = step.nominal_value();
            step.mean = mean(&step.values());
            step.error = step.mean.map(|value| (value - nominal).round_dp(RESULT_DP));
        }
    }

    fn apply_computed(&mut self, computed: &Value) {
        let evaluation = match serde_json::from_value::<SheetEvaluation>(computed.clone()) {
            Ok(value) => value,
            Err(err) => {
                warn!("[Calibration] Ignoring malformed sheet evaluation: {}", err);
                return;
            }
        };
        if evaluation.steps.len() != self.steps.len() {
            warn!(
                "[Calibration] Ignoring evaluation of {} steps for a sheet of {}",
                evaluation.steps.len(),
                self.steps.len()
            );
            return;
        }
        for (step, result) in self.steps.iter_mut().zip(evaluation.steps) {
            step.mean = Some(result.mean);
            step.error = Some(result.error);
            step.std_dev = result.std_dev;
        }
        self.max_error = evaluation.max_error;
    }

    fn structure_changed(&mut self) {
        self.max_error = max_abs(self.steps.iter().filter_map(|step| step.error));
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepEvaluation {
    pub mean: Decimal,
    pub error: Decimal,
    #[serde(default)]
    pub std_dev: Option<Decimal>,
}

/// Authoritative statistics for a sheet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SheetEvaluation {
    pub steps: Vec<StepEvaluation>,
    #[serde(default)]
    pub max_error: Option<Decimal>,
}

pub fn evaluate(sheet: &ReadingSheet) -> SheetEvaluation {
    let steps = sheet
        .steps
        .iter()
        .map(|step| {
            let values = step.values();
            let mean = mean(&values).unwrap_or(Decimal::ZERO);
            StepEvaluation {
                mean,
                error: (mean - step.nominal_value()).round_dp(RESULT_DP),
                std_dev: sample_std_dev(&values, mean),
            }
        })
        .collect::<Vec<_>>();
    let max_error = max_abs(steps.iter().map(|step| step.error));
    SheetEvaluation { steps, max_error }
}

fn mean(values: &[Decimal]) -> Option<Decimal> {
    if values.is_empty() {
        return None;
    }
    let sum: Decimal = values.iter().copied().sum();
    Some((sum / Decimal::from(values.len())).round_dp(RESULT_DP))
}

fn sample_std_dev(values: &[Decimal], mean: Decimal) -> Option<Decimal> {
    if values.len() < 2 {
        return None;
    }
    let squares: Decimal = values.iter().map(|value| (*value - mean) * (*value - mean)).sum();
    let variance = squares / Decimal::from(values.len() - 1);
    variance.sqrt().map(|value| value.round_dp(RESULT_DP))
}

fn max_abs(errors: impl Iterator<Item = Decimal>) -> Option<Decimal> {
    errors.map(|error| error.abs()).max()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drafts::{canonical_string, canonicalize};
    use rust_decimal_macros::dec;

    fn five_readings() -> Value {
        json!({
            "steps": [
                {"nominal": 10, "readings": [10.01, 10.02, 9.99, 10.0, 10.03]}
            ]
        })
    }

    #[test]
    fn stored_numbers_load_as_cells() {
        let sheet = ReadingSheet::from_stored(&five_readings()).unwrap();
        assert_eq!(sheet.steps.len(), 1);
        assert_eq!(sheet.steps[0].nominal, "10");
        assert_eq!(sheet.steps[0].readings.len(), 5);
        assert_eq!(sheet.steps[0].readings[0], "10.01");
    }

    #[test]
    fn null_means_empty_sheet() {
        let sheet = ReadingSheet::from_stored(&Value::Null).unwrap();
        assert!(sheet.steps.is_empty());
        assert!(ReadingSheet::from_stored(&json!({"steps": 3})).is_err());
    }

    #[test]
    fn payload_of_loaded_sheet_matches_stored_canonical_form() {
        let stored = five_readings();
        let sheet = ReadingSheet::from_stored(&stored).unwrap();
        let rules = reading_rules();
        assert_eq!(
            canonical_string(&canonicalize(&sheet.to_payload(), &rules)),
            canonical_string(&canonicalize(&stored, &rules))
        );
    }

    #[test]
    fn local_estimates_follow_edits() {
        let mut sheet = ReadingSheet::new(vec![ReadingStep::new("10", ["10.1", "10.3"])]);
        sheet.recompute_estimates();
        assert_eq!(sheet.steps[0].mean, Some(dec!(10.2)));
        assert_eq!(sheet.steps[0].error, Some(dec!(0.2)));

        sheet.set_reading(0, 2, "");
        sheet.recompute_estimates();
        assert_eq!(sheet.steps[0].mean, Some(dec!(6.8)));
    }

    #[test]
    fn evaluation_computes_deviation_and_bound() {
        let sheet = ReadingSheet::new(vec![
            ReadingStep::new("10", ["9", "11"]),
            ReadingStep::new("20", ["20.5"]),
        ]);
        let evaluation = evaluate(&sheet);
        assert_eq!(evaluation.steps[0].mean, dec!(10));
        assert_eq!(evaluation.steps[0].error, dec!(0));
        assert_eq!(evaluation.steps[0].std_dev.map(|v| v.round_dp(4)), Some(dec!(1.4142)));
        assert_eq!(evaluation.steps[1].std_dev, None);
        assert_eq!(evaluation.max_error, Some(dec!(0.5)));
    }

    #[test]
    fn server_values_overwrite_estimates() {
        let mut sheet = ReadingSheet::new(vec![ReadingStep::new("10", ["10.1", "10.3"])]);
        sheet.recompute_estimates();

        sheet.apply_computed(&json!({
            "steps": [{"mean": 10.25, "error": 0.25, "std_dev": 0.1}],
            "max_error": 0.25
        }));
        assert_eq!(sheet.steps[0].mean, Some(dec!(10.25)));
        assert_eq!(sheet.steps[0].std_dev, Some(dec!(0.1)));
        assert_eq!(sheet.max_error, Some(dec!(0.25)));

        sheet.apply_computed(&json!({"unexpected": true}));
        assert_eq!(sheet.steps[0].mean, Some(dec!(10.25)));
    }

    #[test]
    fn evaluation_for_other_rows_is_ignored() {
        let mut sheet = ReadingSheet::new(vec![ReadingStep::new("10", ["10", "10"])]);
        sheet.recompute_estimates();

        sheet.apply_computed(&json!({
            "steps": [
                {"mean": 50.5, "error": 49.5, "std_dev": 69.296465},
                {"mean": 10, "error": 0, "std_dev": 0}
            ],
            "max_error": 49.5
        }));
        assert_eq!(sheet.steps[0].mean, Some(dec!(10)));
        assert_eq!(sheet.steps[0].std_dev, None);
        assert_eq!(sheet.max_error, None);
    }

    #[test]
    fn structure_change_recomputes_error_bound() {
        let mut sheet = ReadingSheet::new(vec![
            ReadingStep::new("10", ["10.4"]),
            ReadingStep::new("20", ["19.1"]),
        ]);
        sheet.recompute_estimates();
        sheet.structure_changed();
        assert_eq!(sheet.max_error, Some(dec!(0.9)));

        sheet.remove_step(1);
        sheet.structure_changed();
        assert_eq!(sheet.max_error, Some(dec!(0.4)));
    }
}

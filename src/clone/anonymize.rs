//! Default column masking

use super::collaborators::Anonymizer;
use super::types::{AnonymizationRule, AnonymizationStrategy};
use crate::driver::Row;
use crate::error::AppError;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::{Number, Value};
use sha2::{Digest, Sha256};

/// Masks with null, a fixed value, a hash, an email mask or random data.
/// Nulls stay null for every strategy except `fixed`.
#[derive(Debug, Clone, Default)]
pub struct MaskingAnonymizer {
    salt: String,
}

impl MaskingAnonymizer {
    /// Salt mixed into hashes so masked values cannot be looked up
    pub fn with_salt(salt: impl Into<String>) -> Self {
        Self { salt: salt.into() }
    }

    fn digest(&self, value: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.salt.as_bytes());
        hasher.update(value.as_bytes());
        hex::encode(hasher.finalize())
    }

    fn mask(&self, rule: &AnonymizationRule, value: &Value) -> Result<Value, AppError> {
        if value.is_null() && !matches!(rule.strategy, AnonymizationStrategy::Fixed { .. }) {
            return Ok(Value::Null);
        }

        match &rule.strategy {
            AnonymizationStrategy::Null => Ok(Value::Null),
            AnonymizationStrategy::Fixed { value } => Ok(value.clone()),
            AnonymizationStrategy::Hash => Ok(Value::String(self.digest(&text_of(value)))),
            AnonymizationStrategy::EmailMask => {
                let email = value.as_str().unwrap_or_default();
                match email.split_once('@') {
                    Some((local, domain)) if !local.is_empty() && !domain.is_empty() => {
                        Ok(Value::String(format!("user_{}@{}", &self.digest(email)[..10], domain)))
                    }
                    _ => Err(AppError::Validation(format!(
                        "{}.{}: value is not an email address",
                        rule.table, rule.column
                    ))),
                }
            }
            AnonymizationStrategy::Randomize => Ok(randomize(value)),
        }
    }
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Random value of the same JSON kind and similar size
fn randomize(value: &Value) -> Value {
    let mut rng = rand::thread_rng();
    match value {
        Value::Bool(_) => Value::Bool(rng.gen()),
        Value::Number(n) if n.is_i64() || n.is_u64() => {
            let magnitude = n.as_i64().unwrap_or(i64::MAX).unsigned_abs().max(10);
            let upper = i64::try_from(magnitude).unwrap_or(i64::MAX);
            Value::Number(Number::from(rng.gen_range(1..=upper)))
        }
        Value::Number(n) => {
            let magnitude = n.as_f64().unwrap_or(1.0).abs().max(1.0);
            Number::from_f64(rng.gen_range(0.0..magnitude)).map_or(Value::Null, Value::Number)
        }
        Value::String(s) => {
            let length = s.chars().count().max(1);
            Value::String((&mut rng).sample_iter(&Alphanumeric).take(length).map(char::from).collect())
        }
        other => other.clone(),
    }
}

impl Anonymizer for MaskingAnonymizer {
    fn apply(&self, mut record: Row, rules: &[AnonymizationRule]) -> Result<Row, AppError> {
        for rule in rules {
            let Some(value) = record.get(&rule.column) else {
                return Err(AppError::Validation(format!(
                    "{}.{}: column not present in record",
                    rule.table, rule.column
                )));
            };
            let masked = self.mask(rule, value)?;
            record.insert(rule.column.clone(), masked);
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn rule(column: &str, strategy: AnonymizationStrategy) -> AnonymizationRule {
        AnonymizationRule {
            table: "public.customers".to_string(),
            column: column.to_string(),
            strategy,
            mandatory: false,
        }
    }

    fn record() -> Row {
        match json!({"id": 7, "email": "ada@example.org", "name": "Ada", "score": 12.5, "vip": true, "note": null}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_strategies() {
        let anonymizer = MaskingAnonymizer::with_salt("s");
        let masked = anonymizer
            .apply(
                record(),
                &[
                    rule("email", AnonymizationStrategy::EmailMask),
                    rule("name", AnonymizationStrategy::Fixed { value: json!("Jane") }),
                    rule("score", AnonymizationStrategy::Randomize),
                    rule("vip", AnonymizationStrategy::Null),
                    rule("note", AnonymizationStrategy::Hash),
                ],
            )
            .unwrap();

        let email = masked["email"].as_str().unwrap();
        assert!(email.starts_with("user_") && email.ends_with("@example.org"));
        assert_ne!(email, "ada@example.org");
        assert_eq!(masked["name"], json!("Jane"));
        assert!(masked["score"].as_f64().unwrap() < 12.5);
        assert_eq!(masked["vip"], Value::Null);
        assert_eq!(masked["note"], Value::Null);
        assert_eq!(masked["id"], json!(7));
    }

    #[test]
    fn test_hash_is_stable_per_salt() {
        let rules = [rule("name", AnonymizationStrategy::Hash)];
        let a = MaskingAnonymizer::with_salt("one").apply(record(), &rules).unwrap();
        let b = MaskingAnonymizer::with_salt("one").apply(record(), &rules).unwrap();
        let c = MaskingAnonymizer::with_salt("two").apply(record(), &rules).unwrap();
        assert_eq!(a["name"], b["name"]);
        assert_ne!(a["name"], c["name"]);
    }

    #[test]
    fn test_bad_input_is_an_error() {
        let anonymizer = MaskingAnonymizer::default();
        assert!(anonymizer
            .apply(record(), &[rule("name", AnonymizationStrategy::EmailMask)])
            .is_err());
        assert!(anonymizer
            .apply(record(), &[rule("missing", AnonymizationStrategy::Null)])
            .is_err());
    }
}

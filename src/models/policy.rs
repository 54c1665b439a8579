use rand::distr::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

use crate::error::EngineError;

/// What a rule asks the engine to do with matching data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    Access,
    Erasure,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Access => "access",
            ActionType::Erasure => "erasure",
        }
    }

    pub fn parse(value: &str) -> Result<Self, EngineError> {
        match value {
            "access" => Ok(ActionType::Access),
            "erasure" => Ok(ActionType::Erasure),
            other => Err(EngineError::Serialization(format!("Unknown action type: {}", other))),
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Masking descriptor handed to connectors for erasure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum MaskingStrategy {
    NullRewrite,
    StringRewrite { rewrite_value: String },
    RandomStringRewrite {
        #[serde(default = "default_random_length")]
        length: usize,
    },
    Hash {
        #[serde(default)]
        salt: String,
    },
}

fn default_random_length() -> usize {
    16
}

impl MaskingStrategy {
    /// Produce the replacement for one stored value
    pub fn mask(&self, value: &Value) -> Value {
        match self {
            MaskingStrategy::NullRewrite => Value::Null,
            MaskingStrategy::StringRewrite { rewrite_value } => Value::String(rewrite_value.clone()),
            MaskingStrategy::RandomStringRewrite { length } => {
                let s: String = rand::rng()
                    .sample_iter(&Alphanumeric)
                    .take(*length)
                    .map(char::from)
                    .collect();
                Value::String(s)
            }
            MaskingStrategy::Hash { salt } => {
                if value.is_null() {
                    return Value::Null;
                }
                let raw = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                let mut hasher = blake3::Hasher::new();
                hasher.update(raw.as_bytes());
                hasher.update(salt.as_bytes());
                Value::String(hasher.finalize().to_hex().to_string())
            }
        }
    }
}

/// One action over a set of data-category targets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub key: String,
    pub action_type: Option<ActionType>,
    #[serde(default)]
    pub targets: BTreeSet<String>,
    #[serde(default)]
    pub masking_strategy: Option<MaskingStrategy>,
}

impl Rule {
    pub fn access<S: Into<String>>(key: impl Into<String>, targets: impl IntoIterator<Item = S>) -> Self {
        Self {
            key: key.into(),
            action_type: Some(ActionType::Access),
            targets: targets.into_iter().map(Into::into).collect(),
            masking_strategy: None,
        }
    }

    pub fn erasure<S: Into<String>>(
        key: impl Into<String>,
        targets: impl IntoIterator<Item = S>,
        strategy: MaskingStrategy,
    ) -> Self {
        Self {
            key: key.into(),
            action_type: Some(ActionType::Erasure),
            targets: targets.into_iter().map(Into::into).collect(),
            masking_strategy: Some(strategy),
        }
    }
}

/// Set of rules applied to one privacy request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub key: String,
    pub rules: Vec<Rule>,
}

impl Policy {
    pub fn new(key: impl Into<String>, rules: Vec<Rule>) -> Self {
        Self { key: key.into(), rules }
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.rules.is_empty() {
            return Err(EngineError::Validation(format!("Policy '{}' has no rules", self.key)));
        }
        for rule in &self.rules {
            let action = rule.action_type.ok_or_else(|| {
                EngineError::Validation(format!("Rule '{}' has no action type", rule.key))
            })?;
            if rule.targets.is_empty() {
                return Err(EngineError::Validation(format!("Rule '{}' has no targets", rule.key)));
            }
            if action == ActionType::Erasure && rule.masking_strategy.is_none() {
                return Err(EngineError::Validation(format!(
                    "Erasure rule '{}' has no masking strategy",
                    rule.key
                )));
            }
        }
        Ok(())
    }

    pub fn rules_for(&self, action: ActionType) -> impl Iterator<Item = &Rule> {
        self.rules.iter().filter(move |r| r.action_type == Some(action))
    }

    pub fn has_erasure_rules(&self) -> bool {
        self.rules_for(ActionType::Erasure).next().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_validate_policy() {
        let ok = Policy::new(
            "default",
            vec![
                Rule::access("access_all", ["user"]),
                Rule::erasure("erase_contact", ["user.contact"], MaskingStrategy::NullRewrite),
            ],
        );
        assert!(ok.validate().is_ok());
        assert!(ok.has_erasure_rules());

        let mut missing_strategy = Rule::erasure("erase", ["user"], MaskingStrategy::NullRewrite);
        missing_strategy.masking_strategy = None;
        assert!(Policy::new("p", vec![missing_strategy]).validate().is_err());

        let mut no_action = Rule::access("a", ["user"]);
        no_action.action_type = None;
        assert!(Policy::new("p", vec![no_action]).validate().is_err());

        let no_targets = Rule::access("a", Vec::<String>::new());
        assert!(Policy::new("p", vec![no_targets]).validate().is_err());
    }

    #[test]
    fn test_masking_strategies() {
        assert_eq!(MaskingStrategy::NullRewrite.mask(&json!("a@example.com")), Value::Null);
        assert_eq!(
            MaskingStrategy::StringRewrite {
                rewrite_value: "MASKED".to_string()
            }
            .mask(&json!("x")),
            json!("MASKED")
        );

        let random = MaskingStrategy::RandomStringRewrite { length: 12 }.mask(&json!("x"));
        assert_eq!(random.as_str().unwrap().len(), 12);

        let hash = MaskingStrategy::Hash { salt: "s".to_string() };
        let a = hash.mask(&json!("a@example.com"));
        assert_eq!(a, hash.mask(&json!("a@example.com")));
        assert_ne!(a, hash.mask(&json!("b@example.com")));
        assert_eq!(a.as_str().unwrap().len(), 64);
    }

    #[test]
    fn test_deserialize_strategy() {
        let s: MaskingStrategy =
            serde_json::from_value(json!({"strategy": "string_rewrite", "rewrite_value": "***"})).unwrap();
        assert_eq!(
            s,
            MaskingStrategy::StringRewrite {
                rewrite_value: "***".to_string()
            }
        );
        let r: MaskingStrategy = serde_json::from_value(json!({"strategy": "random_string_rewrite"})).unwrap();
        assert_eq!(r, MaskingStrategy::RandomStringRewrite { length: 16 });
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::address::CollectionAddress;
use super::policy::ActionType;
use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManualTaskStatus {
    Pending,
    InProgress,
    Completed,
}

impl ManualTaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ManualTaskStatus::Pending => "pending",
            ManualTaskStatus::InProgress => "in_progress",
            ManualTaskStatus::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Result<Self, EngineError> {
        match value {
            "pending" => Ok(ManualTaskStatus::Pending),
            "in_progress" => Ok(ManualTaskStatus::InProgress),
            "completed" => Ok(ManualTaskStatus::Completed),
            other => Err(EngineError::Serialization(format!("Unknown manual task status: {}", other))),
        }
    }

    /// Allowed moves. `InProgress -> Pending` is the administrative revert.
    pub fn can_transition_to(&self, to: ManualTaskStatus) -> bool {
        matches!(
            (self, to),
            (ManualTaskStatus::Pending, ManualTaskStatus::InProgress)
                | (ManualTaskStatus::InProgress, ManualTaskStatus::Completed)
                | (ManualTaskStatus::InProgress, ManualTaskStatus::Pending)
        )
    }
}

/// One input a human has to provide
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualTaskField {
    pub key: String,
    pub label: String,
    #[serde(default)]
    pub required: bool,
}

/// Current form definition for a manual collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualTaskConfig {
    pub collection: CollectionAddress,
    pub fields: Vec<ManualTaskField>,
    #[serde(default)]
    pub version: u32,
}

impl ManualTaskConfig {
    pub fn required_keys(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().filter(|f| f.required).map(|f| f.key.as_str())
    }

    pub fn field(&self, key: &str) -> Option<&ManualTaskField> {
        self.fields.iter().find(|f| f.key == key)
    }
}

/// Human-completed task standing in for a connector call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualTask {
    pub id: String,
    pub request_id: String,
    pub collection: CollectionAddress,
    pub action_type: ActionType,
    pub status: ManualTaskStatus,
    pub submissions: BTreeMap<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ManualTask {
    pub fn new(request_id: &str, collection: CollectionAddress, action_type: ActionType) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            request_id: request_id.to_string(),
            collection,
            action_type,
            status: ManualTaskStatus::Pending,
            submissions: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    fn transition(&mut self, to: ManualTaskStatus) -> Result<(), EngineError> {
        if !self.status.can_transition_to(to) {
            return Err(EngineError::InvalidTransition {
                from: self.status.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Record a value for one field of the config
    pub fn submit(&mut self, config: &ManualTaskConfig, key: &str, value: Value) -> Result<(), EngineError> {
        if self.status == ManualTaskStatus::Completed {
            return Err(EngineError::InvalidTransition {
                from: ManualTaskStatus::Completed.as_str().to_string(),
                to: ManualTaskStatus::InProgress.as_str().to_string(),
            });
        }
        let field = config.field(key).ok_or_else(|| {
            EngineError::Validation(format!(
                "Field '{}' is not part of the manual task config for {}",
                key, config.collection
            ))
        })?;

        self.submissions.insert(key.to_string(), value);
        self.updated_at = Utc::now();

        if field.required && self.status == ManualTaskStatus::Pending {
            self.transition(ManualTaskStatus::InProgress)?;
        }
        Ok(())
    }

    /// Required keys of the config that have no submission yet
    pub fn missing_required(&self, config: &ManualTaskConfig) -> Vec<String> {
        config
            .required_keys()
            .filter(|k| !self.submissions.contains_key(*k))
            .map(|k| k.to_string())
            .collect()
    }

    pub fn complete(&mut self, config: &ManualTaskConfig) -> Result<(), EngineError> {
        if !self.status.can_transition_to(ManualTaskStatus::Completed) {
            return self.transition(ManualTaskStatus::Completed);
        }
        let missing = self.missing_required(config);
        if !missing.is_empty() {
            return Err(EngineError::Validation(format!(
                "Manual task {} is missing required fields: {}",
                self.id,
                missing.join(", ")
            )));
        }
        self.transition(ManualTaskStatus::Completed)
    }

    /// Administrative reset to `pending`, dropping submissions
    pub fn revert(&mut self) -> Result<(), EngineError> {
        self.transition(ManualTaskStatus::Pending)?;
        self.submissions.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config() -> ManualTaskConfig {
        ManualTaskConfig {
            collection: CollectionAddress::new("paper", "records"),
            fields: vec![
                ManualTaskField {
                    key: "name".to_string(),
                    label: "Full name".to_string(),
                    required: true,
                },
                ManualTaskField {
                    key: "box".to_string(),
                    label: "Archive box".to_string(),
                    required: true,
                },
                ManualTaskField {
                    key: "notes".to_string(),
                    label: "Notes".to_string(),
                    required: false,
                },
            ],
            version: 1,
        }
    }

    fn task() -> ManualTask {
        ManualTask::new("req-1", CollectionAddress::new("paper", "records"), ActionType::Access)
    }

    #[test]
    fn test_pending_to_completed_rejected() {
        let mut t = task();
        let err = t.complete(&config()).unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
        assert_eq!(t.status, ManualTaskStatus::Pending);
    }

    #[test]
    fn test_optional_submission_keeps_pending() {
        let mut t = task();
        t.submit(&config(), "notes", json!("n/a")).unwrap();
        assert_eq!(t.status, ManualTaskStatus::Pending);
        t.submit(&config(), "name", json!("Ada")).unwrap();
        assert_eq!(t.status, ManualTaskStatus::InProgress);
    }

    #[test]
    fn test_complete_requires_all_required_fields() {
        let cfg = config();
        let mut t = task();
        t.submit(&cfg, "name", json!("Ada")).unwrap();
        assert!(matches!(t.complete(&cfg), Err(EngineError::Validation(_))));
        assert_eq!(t.status, ManualTaskStatus::InProgress);

        t.submit(&cfg, "box", json!(7)).unwrap();
        t.complete(&cfg).unwrap();
        assert_eq!(t.status, ManualTaskStatus::Completed);
    }

    #[test]
    fn test_no_transition_out_of_completed() {
        let cfg = config();
        let mut t = task();
        t.submit(&cfg, "name", json!("Ada")).unwrap();
        t.submit(&cfg, "box", json!(7)).unwrap();
        t.complete(&cfg).unwrap();

        assert!(matches!(t.submit(&cfg, "notes", json!("late")), Err(EngineError::InvalidTransition { .. })));
        assert!(matches!(t.revert(), Err(EngineError::InvalidTransition { .. })));
        assert!(matches!(t.complete(&cfg), Err(EngineError::InvalidTransition { .. })));
    }

    #[test]
    fn test_revert_clears_submissions() {
        let cfg = config();
        let mut t = task();
        t.submit(&cfg, "name", json!("Ada")).unwrap();
        t.revert().unwrap();
        assert_eq!(t.status, ManualTaskStatus::Pending);
        assert!(t.submissions.is_empty());
        assert!(t.revert().is_err());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let mut t = task();
        assert!(matches!(t.submit(&config(), "shoe_size", json!(42)), Err(EngineError::Validation(_))));
    }

    #[test]
    fn test_new_required_field_blocks_completion() {
        let mut cfg = config();
        let mut t = task();
        t.submit(&cfg, "name", json!("Ada")).unwrap();
        t.submit(&cfg, "box", json!(7)).unwrap();

        cfg.fields.push(ManualTaskField {
            key: "signature".to_string(),
            label: "Signature".to_string(),
            required: true,
        });
        cfg.version += 1;
        assert_eq!(t.missing_required(&cfg), vec!["signature".to_string()]);
        assert!(t.complete(&cfg).is_err());
    }
}

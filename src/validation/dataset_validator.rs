use std::collections::HashSet;

use crate::error::EngineError;
use crate::models::{Collection, Dataset, Field};

/// Structural checks on dataset declarations, run before graph building
pub struct DatasetValidator;

impl DatasetValidator {
    /// Validate every dataset and reject duplicate dataset names
    pub fn validate_all(datasets: &[Dataset]) -> Result<(), EngineError> {
        let mut seen = HashSet::new();
        for dataset in datasets {
            Self::validate(dataset)?;
            if !seen.insert(dataset.name.as_str()) {
                return Err(EngineError::Build(format!("Duplicate dataset name '{}'", dataset.name)));
            }
        }
        Ok(())
    }

    pub fn validate(dataset: &Dataset) -> Result<(), EngineError> {
        Self::validate_name("dataset", &dataset.name)?;

        if dataset.collections.is_empty() {
            return Err(EngineError::Build(format!("Dataset '{}' has no collections", dataset.name)));
        }

        let mut names = HashSet::new();
        for collection in &dataset.collections {
            Self::validate_name("collection", &collection.name)?;
            if !names.insert(collection.name.as_str()) {
                return Err(EngineError::Build(format!(
                    "Duplicate collection '{}' in dataset '{}'",
                    collection.name, dataset.name
                )));
            }
            Self::validate_collection(&dataset.name, collection)?;
        }

        Ok(())
    }

    fn validate_collection(dataset: &str, collection: &Collection) -> Result<(), EngineError> {
        let context = format!("{}.{}", dataset, collection.name);
        if collection.fields.is_empty() {
            return Err(EngineError::Build(format!("Collection '{}' has no fields", context)));
        }
        for category in &collection.data_categories {
            Self::validate_category(&context, category)?;
        }
        Self::validate_fields(&context, &collection.fields)
    }

    fn validate_fields(context: &str, fields: &[Field]) -> Result<(), EngineError> {
        let mut names = HashSet::new();
        for field in fields {
            Self::validate_name("field", &field.name)?;
            if !names.insert(field.name.as_str()) {
                return Err(EngineError::Build(format!(
                    "Duplicate field '{}' in '{}'",
                    field.name, context
                )));
            }

            let field_context = format!("{}.{}", context, field.name);
            for category in &field.data_categories {
                Self::validate_category(&field_context, category)?;
            }
            for reference in &field.references {
                if reference.target().is_none() {
                    return Err(EngineError::Build(format!(
                        "Reference on '{}' to '{}.{}' has no field path",
                        field_context, reference.dataset, reference.field
                    )));
                }
            }
            if let Some(identity) = &field.identity {
                if identity.trim().is_empty() {
                    return Err(EngineError::Build(format!("Empty identity on '{}'", field_context)));
                }
            }

            Self::validate_fields(&field_context, field.sub_fields())?;
        }
        Ok(())
    }

    /// Names become address segments, so they must be plain identifiers
    fn validate_name(kind: &str, name: &str) -> Result<(), EngineError> {
        if name.is_empty() {
            return Err(EngineError::Build(format!("Empty {} name", kind)));
        }
        if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
            return Err(EngineError::Build(format!(
                "Invalid {} name '{}': only letters, digits, '_' and '-' are allowed",
                kind, name
            )));
        }
        Ok(())
    }

    fn validate_category(context: &str, category: &str) -> Result<(), EngineError> {
        if category.is_empty() || category.split('.').any(|segment| segment.trim().is_empty()) {
            return Err(EngineError::Build(format!(
                "Malformed data category '{}' on '{}'",
                category, context
            )));
        }
        Ok(())
    }
}

// Result Filter
//
// Narrows raw access results to the fields whose data categories fall under
// a rule's targets. Categories are dot-delimited, and a target subsumes every
// category below it (`user.contact` covers `user.contact.email`).

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use crate::models::{ActionType, Collection, CollectionAddress, CollectionRows, ExecutionPlan, FieldPath, Policy, Row};

/// True if `category` equals `target` or sits below it in the hierarchy
pub fn category_matches(category: &str, target: &str) -> bool {
    match category.strip_prefix(target) {
        Some(rest) => rest.is_empty() || rest.starts_with('.'),
        None => false,
    }
}

fn any_match(categories: &[String], targets: &BTreeSet<String>) -> bool {
    categories
        .iter()
        .any(|c| targets.iter().any(|t| category_matches(c, t)))
}

#[derive(Debug, Clone, Default)]
struct CollectionCategories {
    /// Categories declared on the collection itself; they cover every field
    collection: Vec<String>,
    /// Every field path, parents before children
    fields: Vec<(FieldPath, Vec<String>)>,
}

/// Data categories of every field of every planned collection
#[derive(Debug, Clone, Default)]
pub struct FieldCategoryIndex {
    collections: BTreeMap<CollectionAddress, CollectionCategories>,
}

impl FieldCategoryIndex {
    pub fn from_plan(plan: &ExecutionPlan) -> Self {
        Self::from_collections(plan.collections())
    }

    pub fn from_collections<'a>(collections: impl IntoIterator<Item = (&'a CollectionAddress, &'a Collection)>) -> Self {
        let collections = collections
            .into_iter()
            .map(|(address, collection)| {
                let fields = collection
                    .field_paths()
                    .into_iter()
                    .map(|(path, field)| (path, field.data_categories.clone()))
                    .collect();
                (
                    address.clone(),
                    CollectionCategories {
                        collection: collection.data_categories.clone(),
                        fields,
                    },
                )
            })
            .collect();
        Self { collections }
    }

    /// Field paths selected by `targets`.
    ///
    /// A path whose ancestor is already selected is left out, since the
    /// ancestor brings its whole subtree along.
    pub fn matching_paths(&self, address: &CollectionAddress, targets: &BTreeSet<String>) -> Vec<FieldPath> {
        let Some(entry) = self.collections.get(address) else {
            return Vec::new();
        };

        if any_match(&entry.collection, targets) {
            return entry
                .fields
                .iter()
                .filter(|(path, _)| path.len() == 1)
                .map(|(path, _)| path.clone())
                .collect();
        }

        let mut selected: Vec<FieldPath> = Vec::new();
        for (path, categories) in &entry.fields {
            if selected.iter().any(|s| s.is_prefix_of(path)) {
                continue;
            }
            if any_match(categories, targets) {
                selected.push(path.clone());
            }
        }
        selected
    }
}

/// Keep only the fields of each row whose categories match `targets`
pub fn filter_by_data_category(
    raw: &CollectionRows,
    targets: &BTreeSet<String>,
    index: &FieldCategoryIndex,
) -> CollectionRows {
    let mut filtered = CollectionRows::new();
    for (address, rows) in raw {
        let paths = index.matching_paths(address, targets);
        if paths.is_empty() {
            continue;
        }
        let levels: Vec<&[String]> = paths.iter().map(|p| p.levels()).collect();
        let kept: Vec<Row> = rows
            .iter()
            .map(|row| project_object(row, &levels))
            .filter(|row| !row.is_empty())
            .collect();
        if !kept.is_empty() {
            filtered.insert(address.clone(), kept);
        }
    }
    filtered
}

/// Filter the raw results once per access rule, keyed by rule key
pub fn filter_results_by_rule(
    raw: &CollectionRows,
    policy: &Policy,
    index: &FieldCategoryIndex,
) -> BTreeMap<String, CollectionRows> {
    policy
        .rules_for(ActionType::Access)
        .map(|rule| {
            let filtered = filter_by_data_category(raw, &rule.targets, index);
            tracing::debug!(
                "Rule '{}' kept {} of {} collections",
                rule.key,
                filtered.len(),
                raw.len()
            );
            (rule.key.clone(), filtered)
        })
        .collect()
}

fn project_object(row: &Row, paths: &[&[String]]) -> Row {
    let mut grouped: BTreeMap<&str, Vec<&[String]>> = BTreeMap::new();
    for path in paths {
        if let Some((head, rest)) = path.split_first() {
            grouped.entry(head.as_str()).or_default().push(rest);
        }
    }

    let mut out = Row::new();
    for (key, tails) in grouped {
        if let Some(projected) = row.get(key).and_then(|v| project_value(v, &tails)) {
            out.insert(key.to_string(), projected);
        }
    }
    out
}

fn project_value(value: &Value, tails: &[&[String]]) -> Option<Value> {
    // An empty tail selects the whole subtree
    if tails.iter().any(|t| t.is_empty()) {
        return match value {
            Value::Object(map) if map.is_empty() => None,
            Value::Array(items) if items.is_empty() => None,
            other => Some(other.clone()),
        };
    }
    match value {
        Value::Object(map) => {
            let projected = project_object(map, tails);
            (!projected.is_empty()).then_some(Value::Object(projected))
        }
        Value::Array(items) => {
            let kept: Vec<Value> = items.iter().filter_map(|item| project_value(item, tails)).collect();
            (!kept.is_empty()).then_some(Value::Array(kept))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DataType, Field, FieldKind, Rule};
    use crate::services::graph::builder::tests::{collection, crm_and_billing};
    use serde_json::json;

    fn row(value: Value) -> Row {
        value.as_object().unwrap().clone()
    }

    fn targets(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn crm_billing_index() -> FieldCategoryIndex {
        let datasets = crm_and_billing();
        let addressed: Vec<(CollectionAddress, Collection)> = datasets
            .iter()
            .flat_map(|d| {
                d.collections
                    .iter()
                    .map(move |c| (CollectionAddress::new(&d.name, &c.name), c.clone()))
            })
            .collect();
        FieldCategoryIndex::from_collections(addressed.iter().map(|(a, c)| (a, c)))
    }

    fn crm_billing_rows() -> CollectionRows {
        CollectionRows::from([
            (
                CollectionAddress::new("crm", "customers"),
                vec![row(json!({"id": 1, "email": "a@example.com", "name": "Ada"}))],
            ),
            (
                CollectionAddress::new("billing", "invoices"),
                vec![
                    row(json!({"id": 10, "customer_email": "a@example.com", "amount": 12.5})),
                    row(json!({"id": 11, "customer_email": "a@example.com", "amount": 7.0})),
                ],
            ),
        ])
    }

    #[test]
    fn test_category_matches() {
        assert!(category_matches("user.contact.email", "user.contact"));
        assert!(category_matches("user.contact", "user.contact"));
        assert!(category_matches("user.contact", "user"));
        assert!(!category_matches("user.contactless", "user.contact"));
        assert!(!category_matches("user", "user.contact"));
    }

    #[test]
    fn test_financial_target_keeps_only_amount() {
        let filtered = filter_by_data_category(&crm_billing_rows(), &targets(&["user.financial"]), &crm_billing_index());
        assert_eq!(filtered.len(), 1);
        let invoices = &filtered[&CollectionAddress::new("billing", "invoices")];
        assert_eq!(invoices, &vec![row(json!({"amount": 12.5})), row(json!({"amount": 7.0}))]);
    }

    #[test]
    fn test_parent_category_includes_children() {
        let filtered = filter_by_data_category(&crm_billing_rows(), &targets(&["user"]), &crm_billing_index());
        assert_eq!(
            filtered[&CollectionAddress::new("crm", "customers")],
            vec![row(json!({"email": "a@example.com", "name": "Ada"}))]
        );
        assert_eq!(filtered[&CollectionAddress::new("billing", "invoices")].len(), 2);

        let contact = filter_by_data_category(&crm_billing_rows(), &targets(&["user.contact"]), &crm_billing_index());
        assert_eq!(
            contact[&CollectionAddress::new("crm", "customers")],
            vec![row(json!({"email": "a@example.com"}))]
        );
    }

    #[test]
    fn test_filter_is_idempotent() {
        let index = crm_billing_index();
        let t = targets(&["user.contact", "user.financial"]);
        let once = filter_by_data_category(&crm_billing_rows(), &t, &index);
        let twice = filter_by_data_category(&once, &t, &index);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_nested_projection_drops_empty_containers() {
        let profiles = collection(
            "profiles",
            vec![
                Field::leaf("id", DataType::Integer),
                Field::object(
                    "address",
                    vec![
                        Field::leaf("city", DataType::String).with_categories(["user.contact.address.city"]),
                        Field::leaf("zip", DataType::String),
                    ],
                ),
                Field::array(
                    "phones",
                    FieldKind::Object {
                        fields: vec![
                            Field::leaf("number", DataType::String).with_categories(["user.contact.phone_number"]),
                            Field::leaf("kind", DataType::String),
                        ],
                    },
                ),
            ],
        );
        let address = CollectionAddress::new("app", "profiles");
        let index = FieldCategoryIndex::from_collections([(&address, &profiles)]);
        let raw = CollectionRows::from([(
            address.clone(),
            vec![
                row(json!({
                    "id": 1,
                    "address": {"city": "Oslo", "zip": "0150"},
                    "phones": [{"number": "1", "kind": "home"}, {"kind": "fax"}]
                })),
                row(json!({"id": 2, "address": {"zip": "9999"}, "phones": []})),
            ],
        )]);

        let filtered = filter_by_data_category(&raw, &targets(&["user.contact"]), &index);
        assert_eq!(
            filtered[&address],
            vec![row(json!({"address": {"city": "Oslo"}, "phones": [{"number": "1"}]}))]
        );
    }

    #[test]
    fn test_object_category_selects_subtree() {
        let mut coll = collection(
            "profiles",
            vec![Field::object(
                "address",
                vec![Field::leaf("city", DataType::String), Field::leaf("zip", DataType::String)],
            )
            .with_categories(["user.contact.address"])],
        );
        let address = CollectionAddress::new("app", "profiles");
        let index = FieldCategoryIndex::from_collections([(&address, &coll)]);
        assert_eq!(index.matching_paths(&address, &targets(&["user"])), vec![FieldPath::parse("address")]);

        coll.fields[0].data_categories.clear();
        coll.data_categories = vec!["user.contact".to_string()];
        let index = FieldCategoryIndex::from_collections([(&address, &coll)]);
        assert_eq!(index.matching_paths(&address, &targets(&["user"])), vec![FieldPath::parse("address")]);
        assert!(index.matching_paths(&address, &targets(&["system"])).is_empty());
    }

    #[test]
    fn test_filter_results_by_rule() {
        let policy = Policy::new(
            "default",
            vec![
                Rule::access("finance", ["user.financial"]),
                Rule::access("contact", ["user.contact"]),
                Rule::erasure("erase", ["user"], crate::models::MaskingStrategy::NullRewrite),
            ],
        );
        let by_rule = filter_results_by_rule(&crm_billing_rows(), &policy, &crm_billing_index());
        assert_eq!(by_rule.len(), 2);
        assert!(by_rule["finance"].contains_key(&CollectionAddress::new("billing", "invoices")));
        assert!(!by_rule["finance"].contains_key(&CollectionAddress::new("crm", "customers")));
        assert!(by_rule["contact"].contains_key(&CollectionAddress::new("crm", "customers")));
    }
}

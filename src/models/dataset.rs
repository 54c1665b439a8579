use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use super::address::{CollectionAddress, FieldAddress, FieldPath};
use super::Row;

/// Declarative schema for one connector's data source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Registry key of the connector serving this dataset (defaults to the dataset name)
    #[serde(default)]
    pub connection_key: Option<String>,
    /// Datasets whose collections must all finish before any collection here runs
    #[serde(default)]
    pub after: BTreeSet<String>,
    pub collections: Vec<Collection>,
}

impl Dataset {
    pub fn connection_key(&self) -> &str {
        self.connection_key.as_deref().unwrap_or(&self.name)
    }

    pub fn collection(&self, name: &str) -> Option<&Collection> {
        self.collections.iter().find(|c| c.name == name)
    }
}

/// A table/view/endpoint-equivalent grouping of fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    pub name: String,
    pub fields: Vec<Field>,
    /// Collections that must finish before this one is queried
    #[serde(default)]
    pub after: BTreeSet<CollectionAddress>,
    /// Collections that must be erased before this one is masked
    #[serde(default)]
    pub erase_after: BTreeSet<CollectionAddress>,
    #[serde(default)]
    pub data_categories: Vec<String>,
    /// Excluded from the graph entirely when set
    #[serde(default)]
    pub skip_processing: bool,
    /// Predicate over upstream inputs; the node is skipped when it does not hold
    #[serde(default)]
    pub run_condition: Option<Condition>,
}

impl Collection {
    /// Every field in the collection paired with its path, depth-first
    pub fn field_paths(&self) -> Vec<(FieldPath, &Field)> {
        let mut out = Vec::new();
        for field in &self.fields {
            field.walk(&FieldPath::default(), &mut out);
        }
        out
    }

    pub fn field(&self, path: &FieldPath) -> Option<&Field> {
        let mut levels = path.levels().iter();
        let first = levels.next()?;
        let mut current = self.fields.iter().find(|f| &f.name == first)?;
        for level in levels {
            current = current.sub_fields().iter().find(|f| &f.name == level)?;
        }
        Some(current)
    }

    /// Paths of every field flagged as primary key
    pub fn primary_keys(&self) -> Vec<FieldPath> {
        self.field_paths()
            .into_iter()
            .filter(|(_, f)| f.primary_key)
            .map(|(p, _)| p)
            .collect()
    }

    /// Identity kinds (e.g. `email`) bound to fields of this collection
    pub fn identities(&self) -> BTreeMap<FieldPath, String> {
        self.field_paths()
            .into_iter()
            .filter_map(|(p, f)| f.identity.clone().map(|i| (p, i)))
            .collect()
    }

    /// Outgoing references declared on this collection's fields
    pub fn references(&self) -> Vec<(FieldPath, &FieldReference)> {
        self.field_paths()
            .into_iter()
            .flat_map(|(p, f)| f.references.iter().map(move |r| (p.clone(), r)))
            .collect()
    }

    /// Top-level field names, i.e. the columns a connector selects
    pub fn top_level_field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }
}

/// Primitive type hints used to coerce values flowing between collections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    String,
    Integer,
    Float,
    Boolean,
    ObjectId,
    #[default]
    Unknown,
}

impl DataType {
    /// Normalize a value to this type, returning `None` if it cannot be represented
    pub fn coerce(&self, value: &Value) -> Option<Value> {
        match (self, value) {
            (_, Value::Null) => None,
            (DataType::Unknown, v) => Some(v.clone()),
            (DataType::String | DataType::ObjectId, Value::String(s)) => Some(Value::String(s.clone())),
            (DataType::String | DataType::ObjectId, Value::Number(n)) => Some(Value::String(n.to_string())),
            (DataType::String, Value::Bool(b)) => Some(Value::String(b.to_string())),
            (DataType::Integer, Value::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
                .map(Value::from),
            (DataType::Integer, Value::String(s)) => s.trim().parse::<i64>().ok().map(Value::from),
            (DataType::Float, Value::Number(n)) => n.as_f64().map(Value::from),
            (DataType::Float, Value::String(s)) => s.trim().parse::<f64>().ok().map(Value::from),
            (DataType::Boolean, Value::Bool(b)) => Some(Value::Bool(*b)),
            (DataType::Boolean, Value::String(s)) => match s.to_lowercase().as_str() {
                "true" | "1" => Some(Value::Bool(true)),
                "false" | "0" => Some(Value::Bool(false)),
                _ => None,
            },
            _ => None,
        }
    }
}

/// Structural shape of a field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldKind {
    Leaf {
        #[serde(default)]
        data_type: DataType,
    },
    Object {
        fields: Vec<Field>,
    },
    Array {
        element: Box<FieldKind>,
    },
}

impl Default for FieldKind {
    fn default() -> Self {
        FieldKind::Leaf {
            data_type: DataType::Unknown,
        }
    }
}

/// Direction data flows along a reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeDirection {
    /// Referenced field feeds this field
    From,
    /// This field feeds the referenced field
    To,
}

/// Outgoing reference from a field to a field in another collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldReference {
    pub dataset: String,
    /// `collection.path.to.field` inside the referenced dataset
    pub field: String,
    #[serde(default)]
    pub direction: Option<EdgeDirection>,
}

impl FieldReference {
    /// Resolve to a field address, `None` if the field path is malformed
    pub fn target(&self) -> Option<FieldAddress> {
        let (collection, path) = self.field.split_once('.')?;
        let path = FieldPath::parse(path);
        if collection.is_empty() || path.is_empty() {
            return None;
        }
        Some(FieldAddress::new(self.dataset.clone(), collection, path))
    }
}

/// Capabilities the planner asks fields about, independent of connector type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FieldCapability {
    HasReferences,
    HasIdentity,
    IsArray,
    IsObject,
    IsPrimaryKey,
    HasDataCategories,
}

/// Leaf or nested schema element
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    #[serde(flatten, default)]
    pub kind: FieldKind,
    #[serde(default)]
    pub primary_key: bool,
    /// Identity kind this field holds, e.g. `email`
    #[serde(default)]
    pub identity: Option<String>,
    #[serde(default)]
    pub references: Vec<FieldReference>,
    #[serde(default)]
    pub data_categories: Vec<String>,
}

impl Field {
    pub fn leaf(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            kind: FieldKind::Leaf { data_type },
            primary_key: false,
            identity: None,
            references: Vec::new(),
            data_categories: Vec::new(),
        }
    }

    pub fn object(name: impl Into<String>, fields: Vec<Field>) -> Self {
        Self {
            kind: FieldKind::Object { fields },
            ..Self::leaf(name, DataType::Unknown)
        }
    }

    pub fn array(name: impl Into<String>, element: FieldKind) -> Self {
        Self {
            kind: FieldKind::Array {
                element: Box::new(element),
            },
            ..Self::leaf(name, DataType::Unknown)
        }
    }

    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    pub fn with_primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub fn with_categories<S: Into<String>>(mut self, categories: impl IntoIterator<Item = S>) -> Self {
        self.data_categories = categories.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_reference(mut self, dataset: &str, field: &str, direction: Option<EdgeDirection>) -> Self {
        self.references.push(FieldReference {
            dataset: dataset.to_string(),
            field: field.to_string(),
            direction,
        });
        self
    }

    pub fn has(&self, capability: FieldCapability) -> bool {
        match capability {
            FieldCapability::HasReferences => !self.references.is_empty(),
            FieldCapability::HasIdentity => self.identity.is_some(),
            FieldCapability::IsArray => matches!(self.kind, FieldKind::Array { .. }),
            FieldCapability::IsObject => !self.sub_fields().is_empty(),
            FieldCapability::IsPrimaryKey => self.primary_key,
            FieldCapability::HasDataCategories => !self.data_categories.is_empty(),
        }
    }

    /// Type used to coerce incoming values; arrays coerce by element type
    pub fn data_type(&self) -> DataType {
        fn of(kind: &FieldKind) -> DataType {
            match kind {
                FieldKind::Leaf { data_type } => *data_type,
                FieldKind::Array { element } => of(element),
                FieldKind::Object { .. } => DataType::Unknown,
            }
        }
        of(&self.kind)
    }

    /// Nested fields of an object, or of an array of objects
    pub fn sub_fields(&self) -> &[Field] {
        fn of(kind: &FieldKind) -> &[Field] {
            match kind {
                FieldKind::Object { fields } => fields,
                FieldKind::Array { element } => of(element),
                FieldKind::Leaf { .. } => &[],
            }
        }
        of(&self.kind)
    }

    fn walk<'a>(&'a self, prefix: &FieldPath, out: &mut Vec<(FieldPath, &'a Field)>) {
        let path = prefix.child(&self.name);
        out.push((path.clone(), self));
        for sub in self.sub_fields() {
            sub.walk(&path, out);
        }
    }
}

/// Comparison applied by a condition leaf
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Exists,
    In,
}

/// Predicate over a node's upstream inputs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    Leaf {
        collection: CollectionAddress,
        field: FieldPath,
        operator: ConditionOperator,
        #[serde(default)]
        value: Value,
    },
    All(Vec<Condition>),
    Any(Vec<Condition>),
}

impl Condition {
    /// Upstream collections the condition reads from
    pub fn collections(&self) -> BTreeSet<CollectionAddress> {
        match self {
            Condition::Leaf { collection, .. } => BTreeSet::from([collection.clone()]),
            Condition::All(items) | Condition::Any(items) => {
                items.iter().flat_map(|c| c.collections()).collect()
            }
        }
    }

    /// Evaluate against the rows each upstream collection produced
    pub fn evaluate(&self, inputs: &BTreeMap<CollectionAddress, Vec<Row>>) -> bool {
        match self {
            Condition::All(items) => items.iter().all(|c| c.evaluate(inputs)),
            Condition::Any(items) => items.iter().any(|c| c.evaluate(inputs)),
            Condition::Leaf {
                collection,
                field,
                operator,
                value,
            } => {
                let Some(rows) = inputs.get(collection) else {
                    return false;
                };
                rows.iter().any(|row| {
                    let found = field.retrieve_from(&Value::Object(row.clone()));
                    match operator {
                        ConditionOperator::Exists => !found.is_empty(),
                        _ => found.iter().any(|candidate| compare(candidate, *operator, value)),
                    }
                })
            }
        }
    }
}

fn compare(candidate: &Value, operator: ConditionOperator, expected: &Value) -> bool {
    use std::cmp::Ordering;

    let ordering = match (candidate, expected) {
        (Value::Number(a), Value::Number(b)) => a.as_f64().zip(b.as_f64()).and_then(|(a, b)| a.partial_cmp(&b)),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    };

    match operator {
        ConditionOperator::Eq => ordering == Some(Ordering::Equal),
        ConditionOperator::Neq => ordering != Some(Ordering::Equal),
        ConditionOperator::Gt => ordering == Some(Ordering::Greater),
        ConditionOperator::Gte => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
        ConditionOperator::Lt => ordering == Some(Ordering::Less),
        ConditionOperator::Lte => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
        ConditionOperator::In => expected
            .as_array()
            .map(|options| options.iter().any(|o| compare(candidate, ConditionOperator::Eq, o)))
            .unwrap_or(false),
        ConditionOperator::Exists => true,
    }
}

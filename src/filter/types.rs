use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::database::document::{CREATED_AT_FIELD, ID_FIELD, VERSION_FIELD};

/// Range comparison recognised in list filters (`field[gte]=...`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Gte,
    Gt,
    Lte,
    Lt,
}

impl CompareOp {
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "gte" => Some(CompareOp::Gte),
            "gt" => Some(CompareOp::Gt),
            "lte" => Some(CompareOp::Lte),
            "lt" => Some(CompareOp::Lt),
            _ => None,
        }
    }

    pub fn to_sql(&self) -> &'static str {
        match self {
            CompareOp::Gte => ">=",
            CompareOp::Gt => ">",
            CompareOp::Lte => "<=",
            CompareOp::Lt => "<",
        }
    }

    /// Whether `actual <op> bound` holds, given `actual.cmp(bound)`.
    pub fn holds(&self, ordering: Ordering) -> bool {
        match self {
            CompareOp::Gte => ordering != Ordering::Less,
            CompareOp::Gt => ordering == Ordering::Greater,
            CompareOp::Lte => ordering != Ordering::Greater,
            CompareOp::Lt => ordering == Ordering::Less,
        }
    }
}

/// One constraint on a single field. A field may carry several, all of which must hold.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Equals(Value),
    Compare(CompareOp, Value),
    AnyOf(Vec<Value>),
}

impl Condition {
    pub fn matches(&self, actual: Option<&Value>) -> bool {
        match self {
            Condition::Equals(expected) => equals_matches(expected, actual),
            Condition::Compare(op, bound) => actual
                .and_then(|a| compare_values(a, bound))
                .map_or(false, |ordering| op.holds(ordering)),
            Condition::AnyOf(options) => options.iter().any(|o| equals_matches(o, actual)),
        }
    }

    pub fn try_map_values<E>(
        self,
        mut f: impl FnMut(Value) -> Result<Value, E>,
    ) -> Result<Self, E> {
        Ok(match self {
            Condition::Equals(v) => Condition::Equals(f(v)?),
            Condition::Compare(op, v) => Condition::Compare(op, f(v)?),
            Condition::AnyOf(vs) => {
                Condition::AnyOf(vs.into_iter().map(&mut f).collect::<Result<_, _>>()?)
            }
        })
    }
}

fn equals_matches(expected: &Value, actual: Option<&Value>) -> bool {
    match (expected, actual) {
        (Value::Null, None) | (Value::Null, Some(Value::Null)) => true,
        (_, Some(a)) => values_equal(a, expected),
        (_, None) => false,
    }
}

/// Structured document filter: field name to the conditions that field must satisfy.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    clauses: BTreeMap<String, Vec<Condition>>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.push(field, Condition::Equals(value.into()));
        self
    }

    pub fn compare(mut self, field: impl Into<String>, op: CompareOp, value: impl Into<Value>) -> Self {
        self.push(field, Condition::Compare(op, value.into()));
        self
    }

    pub fn push(&mut self, field: impl Into<String>, condition: Condition) {
        self.clauses.entry(field.into()).or_default().push(condition);
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    pub fn clauses(&self) -> impl Iterator<Item = (&str, &[Condition])> {
        self.clauses.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Plain equality terms, used to seed a document inserted by an upsert.
    pub fn equalities(&self) -> Map<String, Value> {
        let mut out = Map::new();
        for (field, conditions) in &self.clauses {
            if let [Condition::Equals(v)] = conditions.as_slice() {
                out.insert(field.clone(), v.clone());
            }
        }
        out
    }

    pub fn matches(&self, doc: &Map<String, Value>) -> bool {
        self.clauses
            .iter()
            .all(|(field, conditions)| conditions.iter().all(|c| c.matches(doc.get(field))))
    }

    /// Rewrites every condition value, e.g. to cast query-string text to field types.
    pub fn try_map<E>(
        self,
        mut f: impl FnMut(&str, Value) -> Result<Value, E>,
    ) -> Result<Self, E> {
        let mut clauses = BTreeMap::new();
        for (field, conditions) in self.clauses {
            let mapped = conditions
                .into_iter()
                .map(|c| c.try_map_values(|v| f(&field, v)))
                .collect::<Result<Vec<_>, E>>()?;
            clauses.insert(field, mapped);
        }
        Ok(Self { clauses })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    pub fn to_sql(&self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub field: String,
    pub direction: SortDirection,
}

impl SortKey {
    pub fn asc(field: impl Into<String>) -> Self {
        Self { field: field.into(), direction: SortDirection::Asc }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self { field: field.into(), direction: SortDirection::Desc }
    }

    /// `-name` sorts descending, `name` or `+name` ascending.
    pub fn parse(token: &str) -> Option<Self> {
        let token = token.trim();
        if let Some(field) = token.strip_prefix('-') {
            (!field.is_empty()).then(|| Self::desc(field))
        } else {
            let field = token.strip_prefix('+').unwrap_or(token);
            (!field.is_empty()).then(|| Self::asc(field))
        }
    }

    pub fn compare(&self, a: &Map<String, Value>, b: &Map<String, Value>) -> Ordering {
        let ordering = sort_cmp(a.get(&self.field), b.get(&self.field));
        match self.direction {
            SortDirection::Asc => ordering,
            SortDirection::Desc => ordering.reverse(),
        }
    }
}

pub fn compare_by_keys(keys: &[SortKey], a: &Map<String, Value>, b: &Map<String, Value>) -> Ordering {
    keys.iter()
        .map(|k| k.compare(a, b))
        .find(|o| *o != Ordering::Equal)
        .unwrap_or(Ordering::Equal)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Projection {
    Include(Vec<String>),
    Exclude(Vec<String>),
}

impl Default for Projection {
    fn default() -> Self {
        Projection::Exclude(vec![VERSION_FIELD.to_string()])
    }
}

impl Projection {
    /// The identifier survives an inclusion projection, as with any document store.
    pub fn apply(&self, doc: Map<String, Value>) -> Map<String, Value> {
        match self {
            Projection::Include(fields) => doc
                .into_iter()
                .filter(|(k, _)| k == ID_FIELD || fields.iter().any(|f| f == k))
                .collect(),
            Projection::Exclude(fields) => doc
                .into_iter()
                .filter(|(k, _)| !fields.iter().any(|f| f == k))
                .collect(),
        }
    }
}

/// Translated list query: filter, ordering, projection and pagination.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryDescriptor {
    pub filter: Filter,
    pub sort: Vec<SortKey>,
    pub projection: Projection,
    pub page: u64,
    pub limit: u64,
    pub skip: u64,
}

impl Default for QueryDescriptor {
    fn default() -> Self {
        Self {
            filter: Filter::default(),
            sort: vec![SortKey::desc(CREATED_AT_FIELD)],
            projection: Projection::default(),
            page: 1,
            limit: 10,
            skip: 0,
        }
    }
}

/// Equality the way a document store sees it: numbers compare by value.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// Ordering between two values of the same JSON type; `None` across types.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

/// Total order used for sorting: missing and null first, then numbers, strings,
/// objects, arrays, booleans.
pub fn sort_cmp(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(v: Option<&Value>) -> u8 {
        match v {
            None | Some(Value::Null) => 0,
            Some(Value::Number(_)) => 1,
            Some(Value::String(_)) => 2,
            Some(Value::Object(_)) => 3,
            Some(Value::Array(_)) => 4,
            Some(Value::Bool(_)) => 5,
        }
    }
    match rank(a).cmp(&rank(b)) {
        Ordering::Equal => match (a, b) {
            (Some(x), Some(y)) => compare_values(x, y).unwrap_or(Ordering::Equal),
            _ => Ordering::Equal,
        },
        other => other,
    }
}

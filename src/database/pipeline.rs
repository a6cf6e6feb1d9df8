use std::cmp::Ordering;

use serde_json::{Map, Number, Value};

use crate::filter::{compare_by_keys, sort_cmp, values_equal, Filter, SortKey};

/// One step of an aggregation pipeline. Pipelines are fixed at route registration,
/// never built from request input.
#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    Match(Filter),
    Group(Group),
    Sort(Vec<SortKey>),
    Skip(u64),
    Limit(u64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    pub key: GroupKey,
    pub accumulators: Vec<(String, Accumulator)>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GroupKey {
    Field(String),
    /// Single group over every input document.
    All,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Accumulator {
    Count,
    Sum(Operand),
    Avg(String),
    Min(String),
    Max(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Const(i64),
    Field(String),
}

impl Group {
    pub fn by(field: impl Into<String>) -> Self {
        Self { key: GroupKey::Field(field.into()), accumulators: vec![] }
    }

    pub fn all() -> Self {
        Self { key: GroupKey::All, accumulators: vec![] }
    }

    pub fn with(mut self, output: impl Into<String>, accumulator: Accumulator) -> Self {
        self.accumulators.push((output.into(), accumulator));
        self
    }
}

impl From<Group> for Stage {
    fn from(group: Group) -> Self {
        Stage::Group(group)
    }
}

/// Run a pipeline over already-rendered documents.
pub fn evaluate(pipeline: &[Stage], mut docs: Vec<Map<String, Value>>) -> Vec<Value> {
    for stage in pipeline {
        docs = match stage {
            Stage::Match(filter) => docs.into_iter().filter(|d| filter.matches(d)).collect(),
            Stage::Group(group) => group_docs(group, docs),
            Stage::Sort(keys) => {
                docs.sort_by(|a, b| compare_by_keys(keys, a, b));
                docs
            }
            Stage::Skip(n) => docs.into_iter().skip(*n as usize).collect(),
            Stage::Limit(n) => docs.into_iter().take(*n as usize).collect(),
        };
    }
    docs.into_iter().map(Value::Object).collect()
}

#[derive(Default)]
struct Acc {
    count: i64,
    sum: f64,
    seen: i64,
    float: bool,
    best: Option<Value>,
}

fn group_docs(group: &Group, docs: Vec<Map<String, Value>>) -> Vec<Map<String, Value>> {
    let mut buckets: Vec<(Value, Vec<Acc>)> = Vec::new();

    for doc in &docs {
        let key = match &group.key {
            GroupKey::Field(f) => doc.get(f).cloned().unwrap_or(Value::Null),
            GroupKey::All => Value::Null,
        };
        let idx = match buckets.iter().position(|(k, _)| values_equal(k, &key)) {
            Some(i) => i,
            None => {
                let accs = group.accumulators.iter().map(|_| Acc::default()).collect();
                buckets.push((key, accs));
                buckets.len() - 1
            }
        };
        for ((_, accumulator), acc) in group.accumulators.iter().zip(buckets[idx].1.iter_mut()) {
            accumulate(accumulator, acc, doc);
        }
    }

    buckets
        .into_iter()
        .map(|(key, accs)| {
            let mut out = Map::new();
            out.insert("_id".into(), key);
            for ((name, accumulator), acc) in group.accumulators.iter().zip(accs) {
                out.insert(name.clone(), finish(accumulator, acc));
            }
            out
        })
        .collect()
}

fn accumulate(accumulator: &Accumulator, acc: &mut Acc, doc: &Map<String, Value>) {
    acc.count += 1;
    match accumulator {
        Accumulator::Count => {}
        Accumulator::Sum(Operand::Const(n)) => acc.sum += *n as f64,
        Accumulator::Sum(Operand::Field(f)) | Accumulator::Avg(f) => {
            if let Some(Value::Number(n)) = doc.get(f) {
                acc.float |= n.is_f64();
                acc.sum += n.as_f64().unwrap_or(0.0);
                acc.seen += 1;
            }
        }
        Accumulator::Min(f) | Accumulator::Max(f) => {
            let want = if matches!(accumulator, Accumulator::Min(_)) { Ordering::Less } else { Ordering::Greater };
            if let Some(v) = doc.get(f).filter(|v| !v.is_null()) {
                let replace = match &acc.best {
                    None => true,
                    Some(best) => sort_cmp(Some(v), Some(best)) == want,
                };
                if replace {
                    acc.best = Some(v.clone());
                }
            }
        }
    }
}

fn finish(accumulator: &Accumulator, acc: Acc) -> Value {
    match accumulator {
        Accumulator::Count => Value::from(acc.count),
        Accumulator::Sum(_) => number(acc.sum, acc.float),
        Accumulator::Avg(_) if acc.seen == 0 => Value::Null,
        Accumulator::Avg(_) => number(acc.sum / acc.seen as f64, true),
        Accumulator::Min(_) | Accumulator::Max(_) => acc.best.unwrap_or(Value::Null),
    }
}

fn number(x: f64, float: bool) -> Value {
    if !float && x.fract() == 0.0 && x.abs() < i64::MAX as f64 {
        Value::from(x as i64)
    } else {
        Number::from_f64(x).map(Value::Number).unwrap_or(Value::Null)
    }
}

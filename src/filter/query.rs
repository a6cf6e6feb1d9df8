use std::collections::BTreeMap;

use serde_json::Value;

use super::error::FilterError;
use super::types::{CompareOp, Condition, Filter, Projection, QueryDescriptor, SortKey};

/// Query keys that drive pagination, ordering and projection instead of filtering.
pub const RESERVED_KEYS: [&str; 4] = ["page", "sort", "limit", "fields"];

pub const DEFAULT_PAGE: u64 = 1;
pub const DEFAULT_LIMIT: u64 = 10;

/// Turns a list query string into a [`QueryDescriptor`].
///
/// Plain keys become equality terms, `field[gte|gt|lte|lt]=v` keys become range
/// comparisons, and the reserved keys select sort order, projection and page.
#[derive(Debug, Clone, Default)]
pub struct QueryTranslator {
    max_limit: Option<u64>,
}

impl QueryTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_limit(max_limit: Option<u64>) -> Self {
        Self { max_limit }
    }

    /// Translate a raw (still percent-encoded) query string.
    pub fn translate_str(&self, raw: Option<&str>) -> Result<QueryDescriptor, FilterError> {
        let pairs = url::form_urlencoded::parse(raw.unwrap_or("").as_bytes()).into_owned();
        self.translate(pairs)
    }

    pub fn translate<I, K, V>(&self, pairs: I) -> Result<QueryDescriptor, FilterError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut reserved: BTreeMap<&'static str, String> = BTreeMap::new();
        let mut equals: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut filter = Filter::new();

        for (key, value) in pairs {
            let key = key.as_ref();
            let value = value.as_ref();
            if key.is_empty() {
                continue;
            }

            let (field, operator) = split_key(key)?;
            if let Some(&name) = RESERVED_KEYS.iter().find(|r| **r == field) {
                // Last occurrence wins; bracketed forms of reserved keys are ignored.
                if operator.is_none() {
                    reserved.insert(name, value.to_string());
                }
                continue;
            }

            match operator {
                None => equals.entry(field.to_string()).or_default().push(value.to_string()),
                Some(token) => {
                    let op = CompareOp::from_token(token).ok_or_else(|| {
                        FilterError::UnsupportedOperator {
                            field: field.to_string(),
                            operator: token.to_string(),
                        }
                    })?;
                    filter.push(field, Condition::Compare(op, Value::String(value.to_string())));
                }
            }
        }

        for (field, mut values) in equals {
            let condition = if values.len() == 1 {
                Condition::Equals(Value::String(values.remove(0)))
            } else {
                Condition::AnyOf(values.into_iter().map(Value::String).collect())
            };
            filter.push(field, condition);
        }

        let defaults = QueryDescriptor::default();

        let sort = match reserved.get("sort") {
            Some(raw) => {
                let keys: Vec<SortKey> = raw.split(',').filter_map(SortKey::parse).collect();
                if keys.is_empty() { defaults.sort } else { keys }
            }
            None => defaults.sort,
        };

        let projection = match reserved.get("fields") {
            Some(raw) => parse_projection(raw)?.unwrap_or(defaults.projection),
            None => defaults.projection,
        };

        let page = reserved
            .get("page")
            .and_then(|p| to_positive_int(p))
            .unwrap_or(DEFAULT_PAGE);
        let mut limit = reserved
            .get("limit")
            .and_then(|l| to_positive_int(l))
            .unwrap_or(DEFAULT_LIMIT);
        if let Some(max) = self.max_limit {
            if limit > max {
                tracing::warn!("Limit {} exceeds max {}, capping to max", limit, max);
                limit = max;
            }
        }
        let skip = (page - 1).saturating_mul(limit);

        Ok(QueryDescriptor { filter, sort, projection, page, limit, skip })
    }
}

/// `price[gte]` -> (`price`, Some(`gte`)); `name` -> (`name`, None).
fn split_key(key: &str) -> Result<(&str, Option<&str>), FilterError> {
    match key.find('[') {
        None => {
            if key.contains(']') {
                return Err(FilterError::MalformedKey(key.to_string()));
            }
            Ok((key, None))
        }
        Some(open) => {
            let field = &key[..open];
            let rest = &key[open + 1..];
            let operator = rest
                .strip_suffix(']')
                .filter(|op| !op.is_empty() && !op.contains('[') && !op.contains(']'))
                .ok_or_else(|| FilterError::MalformedKey(key.to_string()))?;
            if field.is_empty() {
                return Err(FilterError::MalformedKey(key.to_string()));
            }
            Ok((field, Some(operator)))
        }
    }
}

fn parse_projection(raw: &str) -> Result<Option<Projection>, FilterError> {
    let mut include = Vec::new();
    let mut exclude = Vec::new();
    for token in raw.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        match token.strip_prefix('-') {
            Some("") => return Err(FilterError::InvalidField(token.to_string())),
            Some(field) => exclude.push(field.to_string()),
            None => include.push(token.strip_prefix('+').unwrap_or(token).to_string()),
        }
    }
    match (include.is_empty(), exclude.is_empty()) {
        (true, true) => Ok(None),
        (false, true) => Ok(Some(Projection::Include(include))),
        (true, false) => Ok(Some(Projection::Exclude(exclude))),
        (false, false) => Err(FilterError::MixedProjection),
    }
}

/// Leading-integer parse (`"5abc"` -> 5). Zero and negatives are rejected.
fn to_positive_int(raw: &str) -> Option<u64> {
    let s = raw.trim_start();
    let (negative, digits) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    let end = digits.find(|c: char| !c.is_ascii_digit()).unwrap_or(digits.len());
    let n: u64 = digits[..end].parse().ok()?;
    (!negative && n > 0).then_some(n)
}

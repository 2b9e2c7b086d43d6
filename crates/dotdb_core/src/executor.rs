//! Data-parallel filtering, aggregation, and hash joins.
//!
//! The executor works on an owned snapshot of a collection's children,
//! taken by the engine under a read guard, so it never contends with
//! writers. Collections of fewer than 100 items run sequentially;
//! larger ones run on a dedicated rayon pool sized to
//! `max(1, cores − 1)` workers. Results preserve the collection's
//! iteration order in both modes.

use dotdb_codec::{segment_as_index, Value};
use once_cell::sync::Lazy;
use rayon::prelude::*;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Collections below this size are filtered sequentially.
const PARALLEL_THRESHOLD: usize = 100;

struct ExecutorConfig {
    workers: usize,
    parallel: bool,
    pool: Option<rayon::ThreadPool>,
}

impl ExecutorConfig {
    fn new() -> Self {
        let cores = num_cpus::get();
        let workers = cores.saturating_sub(1).max(1);
        // A dual-core host gains nothing from fan-out.
        let parallel = cores > 2;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("dotdb-scan-{i}"))
            .build()
            .ok();
        Self {
            workers,
            parallel,
            pool,
        }
    }

    fn should_parallelize(&self, len: usize) -> bool {
        self.parallel && len >= PARALLEL_THRESHOLD
    }

    fn run<T: Send>(&self, job: impl FnOnce() -> T + Send) -> T {
        match &self.pool {
            Some(pool) => pool.install(job),
            None => job(),
        }
    }
}

static EXECUTOR: Lazy<ExecutorConfig> = Lazy::new(ExecutorConfig::new);

/// Returns the worker count used for parallel scans.
#[must_use]
pub fn worker_count() -> usize {
    EXECUTOR.workers
}

/// Comparison applied by a query filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterOp {
    /// Deep equality.
    Eq,
    /// Deep inequality.
    Ne,
    /// Numeric greater-than.
    Gt,
    /// Numeric greater-or-equal.
    Gte,
    /// Numeric less-than.
    Lt,
    /// Numeric less-or-equal.
    Lte,
    /// String containment.
    Contains,
    /// String prefix.
    StartsWith,
    /// String suffix.
    EndsWith,
    /// Membership in the filter's array value.
    In,
    /// Non-membership in the filter's array value.
    NotIn,
    /// Regex match on a string field.
    Regex,
    /// Array field contains every element of the filter's array value.
    ContainsAll,
    /// Array field contains at least one element of the filter's value.
    ContainsAny,
}

/// A single query filter: `item.field <op> value`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Filter {
    /// Dotted field path inside each item.
    pub field: String,
    /// Comparison to apply.
    pub op: FilterOp,
    /// Right-hand operand.
    pub value: Value,
}

impl Filter {
    /// Creates a filter.
    pub fn new(field: impl Into<String>, op: FilterOp, value: Value) -> Self {
        Self {
            field: field.into(),
            op,
            value,
        }
    }
}

/// A filter with its field path split and regex precompiled.
struct PreparedFilter<'a> {
    segments: Vec<&'a str>,
    op: FilterOp,
    value: &'a Value,
    regex: Option<Regex>,
}

impl<'a> PreparedFilter<'a> {
    fn prepare(filter: &'a Filter) -> Self {
        let regex = if filter.op == FilterOp::Regex {
            filter.value.as_str().and_then(|p| Regex::new(p).ok())
        } else {
            None
        };
        Self {
            segments: filter.field.split('.').collect(),
            op: filter.op,
            value: &filter.value,
            regex,
        }
    }

    fn matches(&self, item: &Value) -> bool {
        let Some(current) = field_at(item, &self.segments) else {
            return false;
        };

        match self.op {
            FilterOp::Eq => current == self.value,
            FilterOp::Ne => current != self.value,
            FilterOp::Gt => numeric(current, self.value).is_some_and(|(a, b)| a > b),
            FilterOp::Gte => numeric(current, self.value).is_some_and(|(a, b)| a >= b),
            FilterOp::Lt => numeric(current, self.value).is_some_and(|(a, b)| a < b),
            FilterOp::Lte => numeric(current, self.value).is_some_and(|(a, b)| a <= b),
            FilterOp::Contains => {
                strings(current, self.value).is_some_and(|(hay, needle)| hay.contains(needle))
            }
            FilterOp::StartsWith => {
                strings(current, self.value).is_some_and(|(hay, needle)| hay.starts_with(needle))
            }
            FilterOp::EndsWith => {
                strings(current, self.value).is_some_and(|(hay, needle)| hay.ends_with(needle))
            }
            FilterOp::In => match self.value {
                Value::Array(allowed) => allowed.contains(current),
                _ => false,
            },
            FilterOp::NotIn => match self.value {
                Value::Array(denied) => !denied.contains(current),
                _ => false,
            },
            FilterOp::Regex => match (current.as_str(), &self.regex) {
                (Some(s), Some(re)) => re.is_match(s),
                _ => false,
            },
            FilterOp::ContainsAll => match (current, self.value) {
                (Value::Array(have), Value::Array(want)) => {
                    want.iter().all(|item| have.contains(item))
                }
                _ => false,
            },
            FilterOp::ContainsAny => match (current, self.value) {
                (Value::Array(have), Value::Array(want)) => {
                    want.iter().any(|item| have.contains(item))
                }
                _ => false,
            },
        }
    }
}

fn numeric(a: &Value, b: &Value) -> Option<(f64, f64)> {
    Some((a.as_f64()?, b.as_f64()?))
}

fn strings<'v>(a: &'v Value, b: &'v Value) -> Option<(&'v str, &'v str)> {
    Some((a.as_str()?, b.as_str()?))
}

/// Navigates a dotted field path inside an item.
fn field_at<'v>(item: &'v Value, segments: &[&str]) -> Option<&'v Value> {
    let mut current = item;
    for segment in segments {
        match current {
            Value::Object(map) => current = map.get(segment)?,
            Value::Array(items) => current = items.get(segment_as_index(segment)?)?,
            _ => return None,
        }
    }
    Some(current)
}

fn matches_all(item: &Value, prepared: &[PreparedFilter<'_>]) -> bool {
    prepared.iter().all(|filter| filter.matches(item))
}

/// Filters `items`, preserving input order.
#[must_use]
pub fn filter_items(items: Vec<Value>, filters: &[Filter]) -> Vec<Value> {
    let prepared: Vec<PreparedFilter<'_>> = filters.iter().map(PreparedFilter::prepare).collect();

    if EXECUTOR.should_parallelize(items.len()) && !prepared.is_empty() {
        EXECUTOR.run(|| {
            items
                .into_par_iter()
                .filter(|item| matches_all(item, &prepared))
                .collect()
        })
    } else {
        items
            .into_iter()
            .filter(|item| matches_all(item, &prepared))
            .collect()
    }
}

/// Aggregation over a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Aggregate {
    /// Number of items.
    Count,
    /// Sum of the numeric field.
    Sum,
    /// Mean of the numeric field; 0 over an empty set.
    Avg,
    /// Minimum of the numeric field; absent over an empty set.
    Min,
    /// Maximum of the numeric field; absent over an empty set.
    Max,
}

/// Runs an aggregation as a parallel fold.
///
/// Non-numeric field values are ignored. `min`/`max` of no numeric
/// values is `None`; `avg` of no numeric values is `0` (a long-standing
/// quirk of the format, kept for compatibility).
#[must_use]
pub fn aggregate_items(items: &[Value], op: Aggregate, field: Option<&str>) -> Option<Value> {
    if op == Aggregate::Count {
        return Some(Value::Number(items.len() as f64));
    }

    let segments: Vec<&str> = match field {
        Some(field) if !field.is_empty() => field.split('.').collect(),
        _ => Vec::new(),
    };
    let numeric_of = |item: &Value| -> Option<f64> { field_at(item, &segments)?.as_f64() };

    let parallel = EXECUTOR.should_parallelize(items.len());
    match op {
        Aggregate::Count => unreachable!("handled above"),
        Aggregate::Sum => {
            let sum: f64 = if parallel {
                EXECUTOR.run(|| items.par_iter().filter_map(numeric_of).sum())
            } else {
                items.iter().filter_map(numeric_of).sum()
            };
            Some(Value::Number(sum))
        }
        Aggregate::Avg => {
            // Combiner carries (sum, n) pairs so partial means compose.
            let (sum, n) = if parallel {
                EXECUTOR.run(|| {
                    items
                        .par_iter()
                        .filter_map(numeric_of)
                        .map(|v| (v, 1u64))
                        .reduce(|| (0.0, 0), |a, b| (a.0 + b.0, a.1 + b.1))
                })
            } else {
                items
                    .iter()
                    .filter_map(numeric_of)
                    .fold((0.0, 0u64), |a, v| (a.0 + v, a.1 + 1))
            };
            if n == 0 {
                Some(Value::Number(0.0))
            } else {
                Some(Value::Number(sum / n as f64))
            }
        }
        Aggregate::Min => {
            let min = if parallel {
                EXECUTOR.run(|| {
                    items
                        .par_iter()
                        .filter_map(numeric_of)
                        .reduce(|| f64::INFINITY, f64::min)
                })
            } else {
                items
                    .iter()
                    .filter_map(numeric_of)
                    .fold(f64::INFINITY, f64::min)
            };
            (min != f64::INFINITY).then_some(Value::Number(min))
        }
        Aggregate::Max => {
            let max = if parallel {
                EXECUTOR.run(|| {
                    items
                        .par_iter()
                        .filter_map(numeric_of)
                        .reduce(|| f64::NEG_INFINITY, f64::max)
                })
            } else {
                items
                    .iter()
                    .filter_map(numeric_of)
                    .fold(f64::NEG_INFINITY, f64::max)
            };
            (max != f64::NEG_INFINITY).then_some(Value::Number(max))
        }
    }
}

/// Hash join: attaches matching right-side items under `as_field` on a
/// clone of each left-side item. Left order is preserved; left items
/// without a match get an empty array; non-object left items pass
/// through unchanged.
#[must_use]
pub fn lookup_items(
    left: Vec<Value>,
    right: &[Value],
    left_field: &str,
    right_field: &str,
    as_field: &str,
) -> Vec<Value> {
    // Build phase: partition the right collection by stringified key.
    let right_segments: Vec<&str> = right_field.split('.').collect();
    let mut buckets: HashMap<String, Vec<&Value>> = HashMap::new();
    for item in right {
        if let Some(key) = field_at(item, &right_segments) {
            buckets
                .entry(crate::index::key_string(key))
                .or_default()
                .push(item);
        }
    }

    let left_segments: Vec<&str> = left_field.split('.').collect();
    let attach = |mut item: Value| -> Value {
        if !item.is_object() {
            return item;
        }
        let matches: Vec<Value> = field_at(&item, &left_segments)
            .map(crate::index::key_string)
            .and_then(|key| buckets.get(&key))
            .map(|bucket| bucket.iter().map(|v| (*v).clone()).collect())
            .unwrap_or_default();
        if let Value::Object(map) = &mut item {
            map.insert(as_field.to_owned(), Value::Array(matches));
        }
        item
    };

    // Probe phase: iterate the left collection, in parallel when large.
    if EXECUTOR.should_parallelize(left.len()) {
        EXECUTOR.run(|| left.into_par_iter().map(attach).collect())
    } else {
        left.into_iter().map(attach).collect()
    }
}

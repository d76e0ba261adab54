//! Query planner: index selection
//!
//! The planner turns a filter tree into either a candidate `_id` set plus
//! a residual filter, or a full scan. A top-level `and` intersects the
//! sets of its indexable leaves; a top-level `or` unions its branches only
//! when every branch resolves through an index.

use std::collections::HashSet;

use serde_json::Value;

use crate::store::{Bound, Collection};

use super::filter::{Condition, Filter, Op};

#[derive(Debug)]
pub enum Plan {
    /// Walk every document, applying the filter (if any) directly
    FullScan,
    /// Materialize the candidates, then apply the residual filter
    Candidates {
        ids: HashSet<String>,
        residual: Option<Filter>,
    },
}

pub fn plan(filter: Option<&Filter>, coll: &Collection) -> Plan {
    let Some(filter) = filter else {
        return Plan::FullScan;
    };

    match filter {
        Filter::Leaf(cond) => match resolve_leaf(cond, coll) {
            Some(ids) => Plan::Candidates { ids, residual: None },
            None => Plan::FullScan,
        },
        Filter::And(children) => {
            let mut candidate_sets = Vec::new();
            let mut residual = Vec::new();
            for child in children {
                match child {
                    Filter::Leaf(cond) => match resolve_leaf(cond, coll) {
                        Some(ids) => candidate_sets.push(ids),
                        None => residual.push(child.clone()),
                    },
                    other => residual.push(other.clone()),
                }
            }

            if candidate_sets.is_empty() {
                return Plan::FullScan;
            }

            let ids = intersect(candidate_sets);
            let residual = match residual.len() {
                0 => None,
                1 => residual.pop(),
                _ => Some(Filter::And(residual)),
            };
            Plan::Candidates { ids, residual }
        }
        Filter::Or(_) => match resolve(filter, coll) {
            Some(ids) => Plan::Candidates { ids, residual: None },
            None => Plan::FullScan,
        },
        Filter::Not(_) => Plan::FullScan,
    }
}

/// Resolve a whole subtree through indexes, or give up
fn resolve(filter: &Filter, coll: &Collection) -> Option<HashSet<String>> {
    match filter {
        Filter::Leaf(cond) => resolve_leaf(cond, coll),
        Filter::And(children) => {
            let sets = children
                .iter()
                .map(|c| resolve(c, coll))
                .collect::<Option<Vec<_>>>()?;
            Some(intersect(sets))
        }
        Filter::Or(children) => {
            let sets = children
                .iter()
                .map(|c| resolve(c, coll))
                .collect::<Option<Vec<_>>>()?;
            Some(sets.into_iter().flatten().collect())
        }
        Filter::Not(_) => None,
    }
}

fn resolve_leaf(cond: &Condition, coll: &Collection) -> Option<HashSet<String>> {
    let index = coll.index(&cond.field)?;
    match cond.op {
        Op::Eq => Some(index.lookup_eq(&cond.value)),
        Op::In => match &cond.value {
            Value::Array(values) => Some(index.lookup_in(values)),
            _ => None,
        },
        Op::Gt => Some(index.lookup_range(
            Some(Bound {
                value: &cond.value,
                inclusive: false,
            }),
            None,
        )),
        Op::Ge => Some(index.lookup_range(
            Some(Bound {
                value: &cond.value,
                inclusive: true,
            }),
            None,
        )),
        Op::Lt => Some(index.lookup_range(
            None,
            Some(Bound {
                value: &cond.value,
                inclusive: false,
            }),
        )),
        Op::Le => Some(index.lookup_range(
            None,
            Some(Bound {
                value: &cond.value,
                inclusive: true,
            }),
        )),
        Op::Between => match &cond.value {
            Value::Array(bounds) if bounds.len() == 2 => Some(index.lookup_range(
                Some(Bound {
                    value: &bounds[0],
                    inclusive: true,
                }),
                Some(Bound {
                    value: &bounds[1],
                    inclusive: true,
                }),
            )),
            _ => None,
        },
        // Negations and pattern matches stay on the scan path
        Op::Ne | Op::Like | Op::IsNull | Op::IsNotNull => None,
    }
}

fn intersect(mut sets: Vec<HashSet<String>>) -> HashSet<String> {
    // Start from the smallest set to keep the intersection cheap
    sets.sort_by_key(HashSet::len);
    let mut iter = sets.into_iter();
    let Some(mut result) = iter.next() else {
        return HashSet::new();
    };
    for set in iter {
        result.retain(|id| set.contains(id));
        if result.is_empty() {
            break;
        }
    }
    result
}

//! Query shapes and plan cache keys.
//!
//! A shape is the filter with every literal replaced by `?` and the clauses
//! of `And`/`Or` sorted, so queries differing only in constants or clause
//! order share a cache entry.

use std::fmt;

use itertools::Itertools;

use super::exec::IndexDesc;
use super::query::{Expr, Query};
use crate::hasher::Hasher;

pub fn shape_of(expr: &Expr) -> String {
    match expr {
        Expr::True => "true".to_string(),
        Expr::Eq(field, _) => format!("{} $eq ?", field),
        Expr::Lt(field, _) => format!("{} $lt ?", field),
        Expr::Gt(field, _) => format!("{} $gt ?", field),
        Expr::In(field, _) => format!("{} $in ?", field),
        Expr::And(children) => format!("$and({})", children.iter().map(shape_of).sorted().join(", ")),
        Expr::Or(children) => format!("$or({})", children.iter().map(shape_of).sorted().join(", ")),
        Expr::Not(child) => format!("$not({})", shape_of(child)),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PlanCacheKey {
    pub collection: String,
    pub shape_hash: u64,
    /// Covers the indexes on fields the query reads.
    pub index_fingerprint: u64,
}

impl PlanCacheKey {
    pub fn new(query: &Query, indexes: &[IndexDesc]) -> Self {
        let mut shape = Hasher::new();
        shape.write_str(&shape_of(&query.filter));
        for hint in query.settings.index_hints.iter().sorted() {
            shape.write_str(hint);
        }

        Self {
            collection: query.collection.clone(),
            shape_hash: shape.checksum(),
            index_fingerprint: index_fingerprint(&query.filter, indexes),
        }
    }
}

impl fmt::Display for PlanCacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{:016x}:{:016x}",
            self.collection, self.shape_hash, self.index_fingerprint
        )
    }
}

/// Hash of the indexes that could serve `filter`, in name order.
pub fn index_fingerprint(filter: &Expr, indexes: &[IndexDesc]) -> u64 {
    let fields = filter.fields();
    let mut hasher = Hasher::new();
    for index in indexes
        .iter()
        .filter(|i| fields.contains(i.field.as_str()))
        .sorted_by(|a, b| a.name.cmp(&b.name))
    {
        hasher.write_str(&index.name);
        hasher.write_str(&index.field);
        hasher.write(&[index.unique as u8]);
    }
    hasher.checksum()
}

//! Query solutions and the literal-free templates the plan cache stores.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::query::{Expr, Value};
use crate::error::{Error, Result};

/// Key range of an index scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Bounds {
    Point(Value),
    Points(Vec<Value>),
    Below(Value),
    Above(Value),
}

impl Bounds {
    pub fn contains(&self, key: &Value) -> bool {
        match self {
            Bounds::Point(v) => key == v,
            Bounds::Points(vs) => vs.contains(key),
            Bounds::Below(v) => key.comparable(v) && key < v,
            Bounds::Above(v) => key.comparable(v) && key > v,
        }
    }

    /// Bounds a single predicate puts on its field.
    pub fn from_predicate(expr: &Expr) -> Option<(&str, Bounds)> {
        match expr {
            Expr::Eq(field, v) => Some((field.as_str(), Bounds::Point(v.clone()))),
            Expr::In(field, vs) => Some((field.as_str(), Bounds::Points(vs.clone()))),
            Expr::Lt(field, v) => Some((field.as_str(), Bounds::Below(v.clone()))),
            Expr::Gt(field, v) => Some((field.as_str(), Bounds::Above(v.clone()))),
            _ => None,
        }
    }

    /// Bounds on `field` from the filter itself or one of its top-level
    /// conjuncts; the first such predicate wins.
    pub fn for_field(filter: &Expr, field: &str) -> Option<Bounds> {
        let conjuncts: &[Expr] = match filter {
            Expr::And(children) => children,
            other => std::slice::from_ref(other),
        };
        conjuncts
            .iter()
            .filter_map(Bounds::from_predicate)
            .find(|(f, _)| *f == field)
            .map(|(_, bounds)| bounds)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PlanNode {
    /// Produces nothing, e.g. for a missing collection.
    Eof,
    CollScan {
        filter: Expr,
    },
    IndexScan {
        index: String,
        field: String,
        bounds: Bounds,
    },
    Fetch {
        filter: Expr,
        child: Box<PlanNode>,
    },
    /// Union of children, deduplicated.
    Or {
        children: Vec<PlanNode>,
    },
    IdHack {
        value: Value,
    },
    /// Single equality lookup through a unique index.
    ExpressEq {
        index: String,
        field: String,
        value: Value,
    },
}

impl PlanNode {
    pub fn fetch(filter: Expr, child: PlanNode) -> Self {
        PlanNode::Fetch {
            filter,
            child: Box::new(child),
        }
    }

    /// Names of the indexes this plan reads.
    pub fn indexes(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_indexes(&mut out);
        out
    }

    fn collect_indexes<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            PlanNode::IndexScan { index, .. } | PlanNode::ExpressEq { index, .. } => {
                out.push(index)
            }
            PlanNode::Fetch { child, .. } => child.collect_indexes(out),
            PlanNode::Or { children } => children.iter().for_each(|c| c.collect_indexes(out)),
            PlanNode::Eof | PlanNode::CollScan { .. } | PlanNode::IdHack { .. } => {}
        }
    }

    /// The cacheable description of this plan, if it has one.
    pub fn template(&self) -> Option<PlanTemplate> {
        match self {
            PlanNode::CollScan { .. } => Some(PlanTemplate::CollScan),
            PlanNode::Fetch { child, .. } => match child.as_ref() {
                PlanNode::IndexScan { index, field, .. } => Some(PlanTemplate::IndexScan {
                    index: index.clone(),
                    field: field.clone(),
                }),
                _ => None,
            },
            _ => None,
        }
    }
}

impl fmt::Display for PlanNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanNode::Eof => write!(f, "EOF"),
            PlanNode::CollScan { .. } => write!(f, "COLLSCAN"),
            PlanNode::IndexScan { index, .. } => write!(f, "IXSCAN({})", index),
            PlanNode::Fetch { child, .. } => write!(f, "FETCH({})", child),
            PlanNode::Or { children } => {
                write!(f, "OR(")?;
                for (i, child) in children.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", child)?;
                }
                write!(f, ")")
            }
            PlanNode::IdHack { .. } => write!(f, "IDHACK"),
            PlanNode::ExpressEq { index, .. } => write!(f, "EXPRESS({})", index),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QuerySolution {
    pub root: PlanNode,
}

impl QuerySolution {
    pub fn new(root: PlanNode) -> Self {
        Self { root }
    }

    pub fn indexes(&self) -> Vec<&str> {
        self.root.indexes()
    }
}

impl fmt::Display for QuerySolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.root.fmt(f)
    }
}

/// A plan with its literals taken out; bound against a query's filter to
/// rebuild a solution without enumerating.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlanTemplate {
    CollScan,
    IndexScan { index: String, field: String },
}

impl PlanTemplate {
    pub fn references(&self, index_name: &str) -> bool {
        matches!(self, PlanTemplate::IndexScan { index, .. } if index == index_name)
    }

    pub fn bind(&self, filter: &Expr) -> Result<QuerySolution> {
        let root = match self {
            PlanTemplate::CollScan => PlanNode::CollScan {
                filter: filter.clone(),
            },
            PlanTemplate::IndexScan { index, field } => {
                let bounds = Bounds::for_field(filter, field).ok_or_else(|| {
                    Error::PlanningFailure(format!(
                        "cached plan on {} does not fit a filter without bounds on {}",
                        index, field
                    ))
                })?;
                PlanNode::fetch(
                    filter.clone(),
                    PlanNode::IndexScan {
                        index: index.clone(),
                        field: field.clone(),
                        bounds,
                    },
                )
            }
        };
        Ok(QuerySolution::new(root))
    }
}

//! Documents, filter expressions and find queries.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::mem;

use serde::{Deserialize, Serialize};

pub const ID_FIELD: &str = "_id";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
}

impl Value {
    /// Ordering comparisons only apply between values of the same type.
    pub fn comparable(&self, other: &Value) -> bool {
        mem::discriminant(self) == mem::discriminant(other)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v.into())
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Str(s) => write!(f, "{:?}", s),
        }
    }
}

pub type Document = BTreeMap<String, Value>;

/// Builds a document from `(field, value)` pairs.
pub fn doc<I, K, V>(fields: I) -> Document
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<Value>,
{
    fields
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// Value of a field; a missing field reads as `Null`.
pub fn field_value<'a>(doc: &'a Document, field: &str) -> &'a Value {
    const NULL: &Value = &Value::Null;
    doc.get(field).unwrap_or(NULL)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    /// Matches everything.
    True,
    Eq(String, Value),
    Lt(String, Value),
    Gt(String, Value),
    In(String, Vec<Value>),
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
}

impl Expr {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Expr::Eq(field.into(), value.into())
    }

    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Expr::Lt(field.into(), value.into())
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Expr::Gt(field.into(), value.into())
    }

    pub fn is_in<V: Into<Value>>(field: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        Expr::In(field.into(), values.into_iter().map(Into::into).collect())
    }

    pub fn not(expr: Expr) -> Self {
        Expr::Not(Box::new(expr))
    }

    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Expr::True => true,
            Expr::Eq(field, value) => field_value(doc, field) == value,
            Expr::Lt(field, value) => {
                let v = field_value(doc, field);
                v.comparable(value) && v < value
            }
            Expr::Gt(field, value) => {
                let v = field_value(doc, field);
                v.comparable(value) && v > value
            }
            Expr::In(field, values) => values.contains(field_value(doc, field)),
            Expr::And(children) => children.iter().all(|c| c.matches(doc)),
            Expr::Or(children) => children.iter().any(|c| c.matches(doc)),
            Expr::Not(child) => !child.matches(doc),
        }
    }

    /// Every field the expression reads.
    pub fn fields(&self) -> BTreeSet<&str> {
        let mut fields = BTreeSet::new();
        self.collect_fields(&mut fields);
        fields
    }

    fn collect_fields<'a>(&'a self, out: &mut BTreeSet<&'a str>) {
        match self {
            Expr::True => {}
            Expr::Eq(f, _) | Expr::Lt(f, _) | Expr::Gt(f, _) | Expr::In(f, _) => {
                out.insert(f.as_str());
            }
            Expr::And(children) | Expr::Or(children) => {
                children.iter().for_each(|c| c.collect_fields(out))
            }
            Expr::Not(child) => child.collect_fields(out),
        }
    }

    pub fn contains_not(&self) -> bool {
        match self {
            Expr::Not(_) => true,
            Expr::And(children) | Expr::Or(children) => children.iter().any(Expr::contains_not),
            _ => false,
        }
    }

    /// A top-level disjunction with at least two clauses.
    pub fn is_rooted_or(&self) -> bool {
        matches!(self, Expr::Or(children) if children.len() > 1)
    }
}

/// Externally supplied planner settings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QuerySettings {
    /// When non-empty, only these indexes may be used.
    pub index_hints: Vec<String>,
}

impl QuerySettings {
    pub fn is_empty(&self) -> bool {
        self.index_hints.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub collection: String,
    pub filter: Expr,
    pub limit: Option<usize>,
    pub settings: QuerySettings,
}

impl Query {
    pub fn new(collection: impl Into<String>, filter: Expr) -> Self {
        Self {
            collection: collection.into(),
            filter,
            limit: None,
            settings: QuerySettings::default(),
        }
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn hint(mut self, index: impl Into<String>) -> Self {
        self.settings.index_hints.push(index.into());
        self
    }

    /// The same query with another filter, keeping settings.
    pub fn with_filter(&self, filter: Expr) -> Self {
        Self {
            collection: self.collection.clone(),
            filter,
            limit: None,
            settings: self.settings.clone(),
        }
    }

    pub fn without_settings(&self) -> Self {
        Self {
            settings: QuerySettings::default(),
            ..self.clone()
        }
    }
}

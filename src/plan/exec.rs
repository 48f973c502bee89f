//! In-memory collections and steppable plan stages.
//!
//! Every stage does a bounded amount of work per [`PlanStage::work`] call and
//! reports whether it produced a record. One call is one work unit, which is
//! what trial periods and cached-plan budgets count.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use tracing::debug;

use super::query::{field_value, Document, Expr, Value, ID_FIELD};
use super::solution::{Bounds, PlanNode};
use crate::error::{Error, Result};

pub type RecordId = u64;

pub const ID_INDEX: &str = "_id_";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDesc {
    pub name: String,
    pub field: String,
    pub unique: bool,
}

impl IndexDesc {
    pub fn new(name: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field: field.into(),
            unique: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

#[derive(Debug)]
struct SecondaryIndex {
    desc: IndexDesc,
    entries: BTreeSet<(Value, RecordId)>,
}

impl SecondaryIndex {
    fn scan(&self, bounds: &Bounds) -> Vec<RecordId> {
        self.entries
            .iter()
            .filter(|(key, _)| bounds.contains(key))
            .map(|(_, id)| *id)
            .collect()
    }

    fn has_key(&self, key: &Value) -> bool {
        self.entries
            .range((key.clone(), RecordId::MIN)..=(key.clone(), RecordId::MAX))
            .next()
            .is_some()
    }
}

#[derive(Debug)]
pub struct MemCollection {
    name: String,
    docs: BTreeMap<RecordId, Document>,
    next_id: RecordId,
    indexes: BTreeMap<String, SecondaryIndex>,
}

impl MemCollection {
    /// A new collection with its unique `_id_` index.
    pub fn new(name: impl Into<String>) -> Self {
        let mut indexes = BTreeMap::new();
        indexes.insert(
            ID_INDEX.to_string(),
            SecondaryIndex {
                desc: IndexDesc::new(ID_INDEX, ID_FIELD).unique(),
                entries: BTreeSet::new(),
            },
        );
        Self {
            name: name.into(),
            docs: BTreeMap::new(),
            next_id: 1,
            indexes,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    pub fn get(&self, id: RecordId) -> Option<&Document> {
        self.docs.get(&id)
    }

    pub fn record_ids(&self) -> Vec<RecordId> {
        self.docs.keys().copied().collect()
    }

    /// Inserts a document, assigning `_id` if absent.
    pub fn insert(&mut self, mut doc: Document) -> Result<RecordId> {
        let id = self.next_id;
        doc.entry(ID_FIELD.to_string())
            .or_insert(Value::Int(id as i64));

        if let Some(index) = self
            .indexes
            .values()
            .find(|i| i.desc.unique && i.has_key(field_value(&doc, &i.desc.field)))
        {
            return Err(Error::InvalidOperation(format!(
                "duplicate key {} for unique index {} on {}",
                field_value(&doc, &index.desc.field),
                index.desc.name,
                self.name
            )));
        }

        for index in self.indexes.values_mut() {
            index
                .entries
                .insert((field_value(&doc, &index.desc.field).clone(), id));
        }
        self.docs.insert(id, doc);
        self.next_id += 1;
        Ok(id)
    }

    pub fn indexes(&self) -> Vec<IndexDesc> {
        self.indexes.values().map(|i| i.desc.clone()).collect()
    }

    pub fn index(&self, name: &str) -> Option<&IndexDesc> {
        self.indexes.get(name).map(|i| &i.desc)
    }

    /// The unique index on `field`, if any.
    pub fn unique_index_on(&self, field: &str) -> Option<&IndexDesc> {
        self.indexes
            .values()
            .map(|i| &i.desc)
            .find(|d| d.unique && d.field == field)
    }

    pub fn create_index(&mut self, desc: IndexDesc) -> Result<()> {
        if self.indexes.contains_key(&desc.name) {
            return Err(Error::InvalidOperation(format!(
                "index {} already exists on {}",
                desc.name, self.name
            )));
        }

        let mut entries = BTreeSet::new();
        for (id, doc) in &self.docs {
            let key = field_value(doc, &desc.field).clone();
            if desc.unique && entries.iter().any(|(k, _): &(Value, RecordId)| *k == key) {
                return Err(Error::InvalidOperation(format!(
                    "duplicate key {} building unique index {}",
                    key, desc.name
                )));
            }
            entries.insert((key, *id));
        }

        debug!(collection = %self.name, index = %desc.name, entries = entries.len(), "Built index");
        self.indexes
            .insert(desc.name.clone(), SecondaryIndex { desc, entries });
        Ok(())
    }

    pub fn drop_index(&mut self, name: &str) -> Result<IndexDesc> {
        if name == ID_INDEX {
            return Err(Error::InvalidOperation("cannot drop the _id index".to_string()));
        }
        self.indexes
            .remove(name)
            .map(|i| i.desc)
            .ok_or_else(|| Error::NotFound(format!("index {} on {}", name, self.name)))
    }

    fn scan_index(&self, name: &str, bounds: &Bounds) -> Result<Vec<RecordId>> {
        self.indexes
            .get(name)
            .map(|i| i.scan(bounds))
            .ok_or_else(|| Error::NotFound(format!("index {} on {}", name, self.name)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    Advanced(RecordId),
    NeedTime,
    Eof,
}

pub trait PlanStage {
    fn work(&mut self) -> StageState;
}

/// Returns precomputed record ids one per call.
struct IdListStage {
    ids: Vec<RecordId>,
    pos: usize,
}

impl PlanStage for IdListStage {
    fn work(&mut self) -> StageState {
        match self.ids.get(self.pos) {
            Some(id) => {
                self.pos += 1;
                StageState::Advanced(*id)
            }
            None => StageState::Eof,
        }
    }
}

/// Filters the records of its child (or of a full scan).
struct FilterStage<'a> {
    coll: &'a MemCollection,
    filter: Expr,
    child: Box<dyn PlanStage + 'a>,
}

impl PlanStage for FilterStage<'_> {
    fn work(&mut self) -> StageState {
        match self.child.work() {
            StageState::Advanced(id) => match self.coll.get(id) {
                Some(doc) if self.filter.matches(doc) => StageState::Advanced(id),
                _ => StageState::NeedTime,
            },
            other => other,
        }
    }
}

struct OrStage<'a> {
    children: Vec<Box<dyn PlanStage + 'a>>,
    current: usize,
    seen: HashSet<RecordId>,
}

impl PlanStage for OrStage<'_> {
    fn work(&mut self) -> StageState {
        let child = match self.children.get_mut(self.current) {
            Some(child) => child,
            None => return StageState::Eof,
        };
        match child.work() {
            StageState::Advanced(id) if self.seen.insert(id) => StageState::Advanced(id),
            StageState::Advanced(_) | StageState::NeedTime => StageState::NeedTime,
            StageState::Eof => {
                self.current += 1;
                StageState::NeedTime
            }
        }
    }
}

/// Builds the stage tree for a plan over `coll`.
pub fn build_stage<'a>(node: &PlanNode, coll: &'a MemCollection) -> Result<Box<dyn PlanStage + 'a>> {
    Ok(match node {
        PlanNode::Eof => Box::new(IdListStage {
            ids: Vec::new(),
            pos: 0,
        }),
        PlanNode::CollScan { filter } => Box::new(FilterStage {
            coll,
            filter: filter.clone(),
            child: Box::new(IdListStage {
                ids: coll.record_ids(),
                pos: 0,
            }),
        }),
        PlanNode::IndexScan { index, bounds, .. } => Box::new(IdListStage {
            ids: coll.scan_index(index, bounds)?,
            pos: 0,
        }),
        PlanNode::Fetch { filter, child } => Box::new(FilterStage {
            coll,
            filter: filter.clone(),
            child: build_stage(child, coll)?,
        }),
        PlanNode::Or { children } => Box::new(OrStage {
            children: children
                .iter()
                .map(|c| build_stage(c, coll))
                .collect::<Result<_>>()?,
            current: 0,
            seen: HashSet::new(),
        }),
        PlanNode::IdHack { value } => Box::new(IdListStage {
            ids: coll.scan_index(ID_INDEX, &Bounds::Point(value.clone()))?,
            pos: 0,
        }),
        PlanNode::ExpressEq { index, value, .. } => Box::new(IdListStage {
            ids: coll.scan_index(index, &Bounds::Point(value.clone()))?,
            pos: 0,
        }),
    })
}

/// Drives a stage tree and counts works.
pub struct PlanExecutor<'a> {
    coll: &'a MemCollection,
    root: Box<dyn PlanStage + 'a>,
    limit: Option<usize>,
    results: Vec<Document>,
    works: u64,
    eof: bool,
}

impl<'a> PlanExecutor<'a> {
    pub fn new(node: &PlanNode, coll: &'a MemCollection, limit: Option<usize>) -> Result<Self> {
        Ok(Self {
            coll,
            root: build_stage(node, coll)?,
            limit,
            results: Vec::new(),
            works: 0,
            eof: false,
        })
    }

    /// One unit of work. Returns false once the plan is exhausted or the
    /// limit is reached.
    pub fn step(&mut self) -> bool {
        if self.is_done() {
            return false;
        }
        self.works += 1;
        match self.root.work() {
            StageState::Advanced(id) => {
                if let Some(doc) = self.coll.get(id) {
                    self.results.push(doc.clone());
                }
            }
            StageState::NeedTime => {}
            StageState::Eof => self.eof = true,
        }
        !self.is_done()
    }

    pub fn is_done(&self) -> bool {
        self.eof || self.limit.map_or(false, |l| self.results.len() >= l)
    }

    /// Works until done or `budget` more works are spent. Returns whether it finished.
    pub fn run_for(&mut self, budget: u64) -> bool {
        let start = self.works;
        while !self.is_done() && self.works - start < budget {
            self.step();
        }
        self.is_done()
    }

    pub fn run_to_completion(&mut self) {
        while self.step() {}
    }

    pub fn works(&self) -> u64 {
        self.works
    }

    pub fn results(&self) -> &[Document] {
        &self.results
    }

    pub fn into_results(self) -> Vec<Document> {
        self.results
    }
}

//! Picks and runs the plan for a find query.
//!
//! Order of decisions: missing collection, express point lookup, id lookup,
//! plan cache, subplanning of rooted disjunctions, and finally enumeration
//! with a multi-plan trial when more than one candidate exists.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use super::catalog::Catalog;
use super::enumerate::enumerate;
use super::exec::{MemCollection, PlanExecutor, ID_INDEX};
use super::multi_plan::run_trials;
use super::query::{Document, Expr, Query, ID_FIELD};
use super::registry::{Engine, PlanCacheRegistry};
use super::shape::PlanCacheKey;
use super::solution::{PlanNode, QuerySolution};
use crate::config::{EngineMode, PlannerConfig};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanStrategy {
    Eof,
    Express,
    IdHack,
    Cached,
    SingleSolution,
    SubPlan,
    MultiPlan,
    /// A cached plan overran its budget and was planned again.
    Replanned,
}

impl fmt::Display for PlanStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PlanStrategy::Eof => "eof",
            PlanStrategy::Express => "express",
            PlanStrategy::IdHack => "idhack",
            PlanStrategy::Cached => "cached",
            PlanStrategy::SingleSolution => "single_solution",
            PlanStrategy::SubPlan => "subplan",
            PlanStrategy::MultiPlan => "multi_plan",
            PlanStrategy::Replanned => "replanned",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct PlanResult {
    pub strategy: PlanStrategy,
    pub engine: Engine,
    pub solution: QuerySolution,
    pub documents: Vec<Document>,
    pub works: u64,
    pub retried_without_hints: bool,
}

#[derive(Debug)]
pub struct Planner {
    config: PlannerConfig,
    catalog: Arc<Catalog>,
}

impl Planner {
    pub fn new(config: PlannerConfig, catalog: Arc<Catalog>) -> Self {
        Self { config, catalog }
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn registry(&self) -> &Arc<PlanCacheRegistry> {
        self.catalog.registry()
    }

    /// Plans and runs `query`. A planning failure under index hints is
    /// retried once with the hints ignored.
    pub fn find(&self, query: &Query) -> Result<PlanResult> {
        match self.plan(query) {
            Err(Error::PlanningFailure(reason)) if !query.settings.is_empty() => {
                warn!(collection = %query.collection, %reason, "Planning failed with hints, retrying without them");
                let mut result = self.plan(&query.without_settings())?;
                result.retried_without_hints = true;
                Ok(result)
            }
            other => other,
        }
    }

    pub fn engine_for(&self, query: &Query) -> Engine {
        match self.config.engine {
            EngineMode::Classic => Engine::Classic,
            EngineMode::Vectorized => Engine::Vectorized,
            EngineMode::Auto if query.filter.contains_not() => Engine::Classic,
            EngineMode::Auto => Engine::Vectorized,
        }
    }

    fn plan(&self, query: &Query) -> Result<PlanResult> {
        let engine = self.engine_for(query);
        let cache = self.registry().cache(engine);

        let coll = match self.catalog.collection(&query.collection) {
            Some(coll) => coll,
            None => {
                cache.record_skipped();
                debug!(collection = %query.collection, "No such collection, using EOF plan");
                return Ok(PlanResult {
                    strategy: PlanStrategy::Eof,
                    engine,
                    solution: QuerySolution::new(PlanNode::Eof),
                    documents: Vec::new(),
                    works: 0,
                    retried_without_hints: false,
                });
            }
        };
        let coll = coll.read();

        if let Some((strategy, solution)) = self.fast_path(query, &coll) {
            cache.record_skipped();
            return self.execute(strategy, engine, solution, &coll, query.limit);
        }

        let key = PlanCacheKey::new(query, &coll.indexes());
        if let Some(entry) = cache.lookup(&key) {
            match entry.value.bind(&query.filter) {
                Ok(solution) => {
                    let budget = entry.works.saturating_mul(self.config.replan_ratio as u64).max(1);
                    let mut executor = PlanExecutor::new(&solution.root, &coll, query.limit)?;
                    while !executor.is_done()
                        && executor.results().len() < self.config.max_results_per_trial
                        && executor.works() < budget
                    {
                        executor.step();
                    }
                    if executor.is_done() || executor.results().len() >= self.config.max_results_per_trial {
                        executor.run_to_completion();
                        debug!(%key, plan = %solution, %engine, "Using cached plan");
                        return Ok(Self::finish(PlanStrategy::Cached, engine, solution, executor));
                    }
                    cache.deactivate(&key);
                    debug!(%key, budget, "Cached plan exceeded its budget, replanning");
                    let mut result = self.plan_fresh(query, &coll, key, engine)?;
                    result.strategy = PlanStrategy::Replanned;
                    return Ok(result);
                }
                Err(e) => {
                    debug!(%key, error = %e, "Cached plan no longer binds, dropping it");
                    cache.remove(&key);
                }
            }
        }

        if query.filter.is_rooted_or() {
            if let Some(solution) = self.subplan(query, &coll, engine)? {
                return self.execute(PlanStrategy::SubPlan, engine, solution, &coll, query.limit);
            }
        }

        self.plan_fresh(query, &coll, key, engine)
    }

    /// Point lookups that never touch the plan cache.
    fn fast_path(&self, query: &Query, coll: &MemCollection) -> Option<(PlanStrategy, QuerySolution)> {
        if !query.settings.is_empty() {
            return None;
        }
        let (field, value) = match &query.filter {
            Expr::Eq(field, value) => (field, value),
            _ => return None,
        };

        if self.config.use_express {
            let index = if field == ID_FIELD {
                Some(ID_INDEX.to_string())
            } else {
                coll.unique_index_on(field).map(|d| d.name.clone())
            };
            if let Some(index) = index {
                return Some((
                    PlanStrategy::Express,
                    QuerySolution::new(PlanNode::ExpressEq {
                        index,
                        field: field.clone(),
                        value: value.clone(),
                    }),
                ));
            }
        } else if field == ID_FIELD {
            return Some((
                PlanStrategy::IdHack,
                QuerySolution::new(PlanNode::IdHack {
                    value: value.clone(),
                }),
            ));
        }
        None
    }

    /// Plans each branch of a rooted disjunction on its own and unions the
    /// results. Returns `None` when a branch has no indexed plan, in which
    /// case one scan of the whole filter is cheaper.
    fn subplan(&self, query: &Query, coll: &MemCollection, engine: Engine) -> Result<Option<QuerySolution>> {
        let branches = match &query.filter {
            Expr::Or(branches) => branches,
            _ => return Ok(None),
        };
        let cache = self.registry().cache(engine);
        let indexes = coll.indexes();

        let mut children = Vec::with_capacity(branches.len());
        for branch in branches {
            let branch_query = query.with_filter(branch.clone());
            let key = PlanCacheKey::new(&branch_query, &indexes);

            let cached = cache
                .lookup(&key)
                .and_then(|entry| entry.value.bind(&branch_query.filter).ok());
            let solution = match cached {
                Some(solution) => solution,
                None => {
                    let mut solutions = enumerate(&branch_query, &indexes)?;
                    if solutions.len() > 1 {
                        let budget = self.config.trial_works_budget(coll.len()) as u64;
                        let winner = run_trials(
                            solutions,
                            coll,
                            None,
                            self.config.max_results_per_trial,
                            budget,
                        )?;
                        if let Some(template) = winner.solution.root.template() {
                            cache.insert_or_update(key, template, winner.decision_works);
                        }
                        winner.solution
                    } else {
                        solutions.pop().ok_or_else(|| {
                            Error::PlanningFailure(format!("no plan for branch of {}", query.collection))
                        })?
                    }
                }
            };

            if solution.indexes().is_empty() {
                debug!(collection = %query.collection, "Branch needs a collection scan, not subplanning");
                return Ok(None);
            }
            children.push(solution.root);
        }
        Ok(Some(QuerySolution::new(PlanNode::Or { children })))
    }

    fn plan_fresh(
        &self,
        query: &Query,
        coll: &MemCollection,
        key: PlanCacheKey,
        engine: Engine,
    ) -> Result<PlanResult> {
        let mut solutions = enumerate(query, &coll.indexes())?;

        if solutions.len() == 1 && !self.config.force_multiplan {
            let solution = solutions.pop().ok_or_else(|| {
                Error::PlanningFailure(format!("no plan for {}", query.collection))
            })?;
            return self.execute(PlanStrategy::SingleSolution, engine, solution, coll, query.limit);
        }

        let budget = self.config.trial_works_budget(coll.len()) as u64;
        let mut winner = run_trials(
            solutions,
            coll,
            query.limit,
            self.config.max_results_per_trial,
            budget,
        )?;
        if let Some(template) = winner.solution.root.template() {
            let outcome = self
                .registry()
                .cache(engine)
                .insert_or_update(key.clone(), template, winner.decision_works);
            debug!(%key, ?outcome, works = winner.decision_works, "Recorded multi-plan winner");
        }
        winner.executor.run_to_completion();
        Ok(Self::finish(PlanStrategy::MultiPlan, engine, winner.solution, winner.executor))
    }

    fn execute(
        &self,
        strategy: PlanStrategy,
        engine: Engine,
        solution: QuerySolution,
        coll: &MemCollection,
        limit: Option<usize>,
    ) -> Result<PlanResult> {
        let mut executor = PlanExecutor::new(&solution.root, coll, limit)?;
        executor.run_to_completion();
        debug!(collection = coll.name(), %strategy, plan = %solution, "Executed plan");
        Ok(Self::finish(strategy, engine, solution, executor))
    }

    fn finish(strategy: PlanStrategy, engine: Engine, solution: QuerySolution, executor: PlanExecutor<'_>) -> PlanResult {
        PlanResult {
            strategy,
            engine,
            solution,
            works: executor.works(),
            documents: executor.into_results(),
            retried_without_hints: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::exec::IndexDesc;
    use crate::plan::query::{doc, Value};

    fn setup(config: PlannerConfig) -> Result<Planner> {
        let catalog = Arc::new(Catalog::new(Arc::new(PlanCacheRegistry::new(config.cache_capacity))));
        for i in 0..200 {
            catalog.insert(
                "c",
                doc([
                    ("a", Value::Int(i)),
                    ("b", Value::Int(i % 4)),
                    ("sku", Value::Str(format!("sku-{}", i))),
                ]),
            )?;
        }
        catalog.create_index("c", IndexDesc::new("a_1", "a"))?;
        catalog.create_index("c", IndexDesc::new("b_1", "b"))?;
        catalog.create_index("c", IndexDesc::new("sku_1", "sku").unique())?;
        Ok(Planner::new(config, catalog))
    }

    fn selective() -> Query {
        Query::new("c", Expr::And(vec![Expr::eq("a", 10), Expr::eq("b", 2)]))
    }

    #[test]
    fn test_missing_collection_is_eof() -> Result<()> {
        let planner = setup(PlannerConfig::default())?;
        let result = planner.find(&Query::new("nope", Expr::eq("a", 1)))?;
        assert_eq!(result.strategy, PlanStrategy::Eof);
        assert!(result.documents.is_empty());
        assert_eq!(planner.registry().cache(result.engine).stats().skipped, 1);
        Ok(())
    }

    #[test]
    fn test_fast_paths() -> Result<()> {
        let planner = setup(PlannerConfig::default())?;
        let by_id = planner.find(&Query::new("c", Expr::eq("_id", 5)))?;
        assert_eq!(by_id.strategy, PlanStrategy::Express);
        assert_eq!(by_id.documents.len(), 1);

        let by_sku = planner.find(&Query::new("c", Expr::eq("sku", "sku-42")))?;
        assert_eq!(by_sku.strategy, PlanStrategy::Express);
        assert_eq!(by_sku.solution.to_string(), "EXPRESS(sku_1)");
        assert_eq!(by_sku.documents[0]["a"], Value::Int(42));

        let no_express = setup(PlannerConfig::default().use_express(false))?;
        let idhack = no_express.find(&Query::new("c", Expr::eq("_id", 5)))?;
        assert_eq!(idhack.strategy, PlanStrategy::IdHack);
        assert_eq!(idhack.documents.len(), 1);
        // Non-id unique equality goes through normal planning without express.
        let sku = no_express.find(&Query::new("c", Expr::eq("sku", "sku-42")))?;
        assert_eq!(sku.strategy, PlanStrategy::SingleSolution);

        assert!(planner.registry().cache(Engine::Vectorized).is_empty());
        Ok(())
    }

    #[test]
    fn test_multi_plan_then_cache() -> Result<()> {
        let planner = setup(PlannerConfig::default())?;

        let first = planner.find(&selective())?;
        assert_eq!(first.strategy, PlanStrategy::MultiPlan);
        assert_eq!(first.solution.indexes(), vec!["a_1"]);
        assert_eq!(first.documents.len(), 1);

        // Inserted inactive; the second planning activates it.
        let second = planner.find(&selective())?;
        assert_eq!(second.strategy, PlanStrategy::MultiPlan);

        // Same shape, different literals.
        let query = Query::new("c", Expr::And(vec![Expr::eq("b", 3), Expr::eq("a", 11)]));
        let third = planner.find(&query)?;
        assert_eq!(third.strategy, PlanStrategy::Cached);
        assert_eq!(third.solution.indexes(), vec!["a_1"]);
        assert_eq!(third.documents.len(), 1);
        Ok(())
    }

    #[test]
    fn test_cached_lookup_is_idempotent() -> Result<()> {
        let planner = setup(PlannerConfig::default())?;
        planner.find(&selective())?;
        planner.find(&selective())?;

        let a = planner.find(&selective())?;
        let b = planner.find(&selective())?;
        assert_eq!(a.strategy, PlanStrategy::Cached);
        assert_eq!(b.strategy, PlanStrategy::Cached);
        assert_eq!(a.solution, b.solution);
        Ok(())
    }

    #[test]
    fn test_dropped_index_is_not_planned_again() -> Result<()> {
        let planner = setup(PlannerConfig::default())?;
        planner.find(&selective())?;
        planner.find(&selective())?;
        assert_eq!(planner.find(&selective())?.strategy, PlanStrategy::Cached);

        let engine = planner.engine_for(&selective());
        let old_key = {
            let coll = planner.catalog().collection("c").ok_or_else(|| Error::NotFound("c".into()))?;
            let indexes = coll.read().indexes();
            PlanCacheKey::new(&selective(), &indexes)
        };

        planner.catalog().drop_index("c", "a_1")?;
        assert!(planner.registry().cache(engine).lookup(&old_key).is_none());

        let fresh = planner.find(&selective())?;
        assert_ne!(fresh.strategy, PlanStrategy::Cached);
        assert!(!fresh.solution.indexes().contains(&"a_1"));
        assert_eq!(fresh.documents.len(), 1);
        Ok(())
    }

    #[test]
    fn test_single_solution_and_force_multiplan() -> Result<()> {
        let planner = setup(PlannerConfig::default())?;
        let query = Query::new("c", Expr::lt("a", 5));
        let result = planner.find(&query)?;
        assert_eq!(result.strategy, PlanStrategy::SingleSolution);
        assert_eq!(result.documents.len(), 5);
        assert!(planner.registry().cache(result.engine).is_empty());

        let forced = setup(PlannerConfig::default().force_multiplan(true))?;
        let result = forced.find(&query)?;
        assert_eq!(result.strategy, PlanStrategy::MultiPlan);
        assert_eq!(forced.registry().cache(result.engine).len(), 1);
        Ok(())
    }

    #[test]
    fn test_collscan_without_usable_index() -> Result<()> {
        let planner = setup(PlannerConfig::default())?;
        let result = planner.find(&Query::new("c", Expr::eq("z", 1)).limit(3))?;
        assert_eq!(result.strategy, PlanStrategy::SingleSolution);
        assert_eq!(result.solution.to_string(), "COLLSCAN");
        assert!(result.documents.is_empty());
        Ok(())
    }

    #[test]
    fn test_subplan_for_rooted_or() -> Result<()> {
        let planner = setup(PlannerConfig::default())?;
        let query = Query::new("c", Expr::Or(vec![Expr::eq("a", 3), Expr::lt("a", 2)]));
        let result = planner.find(&query)?;
        assert_eq!(result.strategy, PlanStrategy::SubPlan);
        assert_eq!(result.solution.to_string(), "OR(FETCH(IXSCAN(a_1)), FETCH(IXSCAN(a_1)))");
        assert_eq!(result.documents.len(), 3);

        // One branch with no index falls back to a whole-filter scan.
        let mixed = Query::new("c", Expr::Or(vec![Expr::eq("a", 3), Expr::eq("z", 1)]));
        let result = planner.find(&mixed)?;
        assert_eq!(result.strategy, PlanStrategy::SingleSolution);
        assert_eq!(result.solution.to_string(), "COLLSCAN");
        assert_eq!(result.documents.len(), 1);
        Ok(())
    }

    #[test]
    fn test_bad_hint_retries_without_it() -> Result<()> {
        let planner = setup(PlannerConfig::default())?;
        let query = Query::new("c", Expr::lt("a", 3)).hint("missing_index");
        let result = planner.find(&query)?;
        assert!(result.retried_without_hints);
        assert_eq!(result.documents.len(), 3);

        let hinted = planner.find(&selective().hint("b_1"))?;
        assert!(!hinted.retried_without_hints);
        assert_eq!(hinted.solution.indexes(), vec!["b_1"]);
        Ok(())
    }

    #[test]
    fn test_engine_selection() -> Result<()> {
        let auto = setup(PlannerConfig::default())?;
        assert_eq!(auto.engine_for(&selective()), Engine::Vectorized);
        let negated = Query::new("c", Expr::not(Expr::eq("a", 1)));
        assert_eq!(auto.engine_for(&negated), Engine::Classic);

        let classic = setup(PlannerConfig::default().engine(EngineMode::Classic))?;
        assert_eq!(classic.engine_for(&selective()), Engine::Classic);
        Ok(())
    }

    #[test]
    fn test_overrun_cached_plan_is_replanned() -> Result<()> {
        let planner = setup(PlannerConfig::default().replan_ratio(1))?;
        let engine = planner.engine_for(&selective());
        let key = {
            let coll = planner.catalog().collection("c").ok_or_else(|| Error::NotFound("c".into()))?;
            let indexes = coll.read().indexes();
            PlanCacheKey::new(&selective(), &indexes)
        };

        // Plant an active entry whose budget the b_1 scan cannot meet.
        let cache = planner.registry().cache(engine);
        let template = crate::plan::solution::PlanTemplate::IndexScan {
            index: "b_1".into(),
            field: "b".into(),
        };
        cache.insert_or_update(key.clone(), template.clone(), 2);
        cache.insert_or_update(key.clone(), template, 2);
        assert!(cache.lookup(&key).is_some());

        let result = planner.find(&selective())?;
        assert_eq!(result.strategy, PlanStrategy::Replanned);
        assert_eq!(result.solution.indexes(), vec!["a_1"]);
        assert_eq!(result.documents.len(), 1);
        Ok(())
    }
}

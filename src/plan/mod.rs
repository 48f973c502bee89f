//! Query planning: shapes, the per-engine plan caches and the runtime
//! planner that chooses between fast paths, cached plans and trials.

pub mod cache;
pub mod catalog;
pub mod enumerate;
pub mod exec;
pub mod multi_plan;
pub mod planner;
pub mod query;
pub mod registry;
pub mod shape;
pub mod solution;

pub use cache::{CacheOutcome, CacheStats, CachedEntry, PlanCache};
pub use catalog::Catalog;
pub use exec::{IndexDesc, MemCollection};
pub use planner::{PlanResult, PlanStrategy, Planner};
pub use query::{doc, Document, Expr, Query, QuerySettings, Value};
pub use registry::{Engine, PlanCacheRegistry};
pub use shape::PlanCacheKey;
pub use solution::{PlanNode, PlanTemplate, QuerySolution};

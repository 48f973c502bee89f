//! Candidate solutions for a query over a set of indexes.

use itertools::Itertools;
use tracing::debug;

use super::exec::IndexDesc;
use super::query::Query;
use super::solution::{Bounds, PlanNode, QuerySolution};
use crate::error::{Error, Result};

/// Every indexed solution the filter's top-level predicates allow, or a
/// collection scan when there is none.
///
/// Hints restrict the usable indexes and rule out the scan fallback; a
/// hinted query no index can serve is a planning failure.
pub fn enumerate(query: &Query, indexes: &[IndexDesc]) -> Result<Vec<QuerySolution>> {
    let hints = &query.settings.index_hints;
    if let Some(missing) = hints.iter().find(|h| !indexes.iter().any(|i| &i.name == *h)) {
        return Err(Error::PlanningFailure(format!(
            "hinted index {} does not exist on {}",
            missing, query.collection
        )));
    }

    let indexed: Vec<QuerySolution> = indexes
        .iter()
        .filter(|i| hints.is_empty() || hints.contains(&i.name))
        .sorted_by(|a, b| a.name.cmp(&b.name))
        .filter_map(|index| {
            Bounds::for_field(&query.filter, &index.field).map(|bounds| {
                QuerySolution::new(PlanNode::fetch(
                    query.filter.clone(),
                    PlanNode::IndexScan {
                        index: index.name.clone(),
                        field: index.field.clone(),
                        bounds,
                    },
                ))
            })
        })
        .collect();

    if !indexed.is_empty() {
        debug!(collection = %query.collection, candidates = indexed.len(), "Enumerated indexed solutions");
        return Ok(indexed);
    }
    if !hints.is_empty() {
        return Err(Error::PlanningFailure(format!(
            "no hinted index on {} can answer the filter",
            query.collection
        )));
    }
    Ok(vec![QuerySolution::new(PlanNode::CollScan {
        filter: query.filter.clone(),
    })])
}

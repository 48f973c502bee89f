//! Trial runs between candidate solutions.
//!
//! Candidates are worked round-robin, one work unit each per round. The
//! trial ends when a candidate finishes or produces `max_results`, or when
//! the candidates have spent `budget` works between them.

use tracing::debug;

use super::exec::{MemCollection, PlanExecutor};
use super::solution::QuerySolution;
use crate::error::{Error, Result};

pub struct TrialWinner<'a> {
    pub index: usize,
    pub solution: QuerySolution,
    /// Works the winner spent during the trial.
    pub decision_works: u64,
    /// Positioned where the trial left it; results so far are kept.
    pub executor: PlanExecutor<'a>,
}

struct Candidate<'a> {
    solution: QuerySolution,
    executor: PlanExecutor<'a>,
}

pub fn run_trials<'a>(
    solutions: Vec<QuerySolution>,
    coll: &'a MemCollection,
    limit: Option<usize>,
    max_results: usize,
    budget: u64,
) -> Result<TrialWinner<'a>> {
    if solutions.is_empty() {
        return Err(Error::PlanningFailure(format!(
            "no candidate plans for {}",
            coll.name()
        )));
    }

    let mut candidates = solutions
        .into_iter()
        .map(|solution| {
            let executor = PlanExecutor::new(&solution.root, coll, limit)?;
            Ok(Candidate { solution, executor })
        })
        .collect::<Result<Vec<_>>>()?;

    let mut spent = 0u64;
    'trial: while spent < budget {
        for candidate in candidates.iter_mut() {
            candidate.executor.step();
            spent += 1;
            if candidate.executor.is_done() || candidate.executor.results().len() >= max_results {
                break 'trial;
            }
            if spent >= budget {
                break 'trial;
            }
        }
    }

    // Finished first, then most results, then fewest works; ties keep the
    // earlier candidate.
    let index = candidates
        .iter()
        .enumerate()
        .max_by(|(ia, a), (ib, b)| {
            let (ea, eb) = (&a.executor, &b.executor);
            ea.is_done()
                .cmp(&eb.is_done())
                .then(ea.results().len().cmp(&eb.results().len()))
                .then(eb.works().cmp(&ea.works()))
                .then(ib.cmp(ia))
        })
        .map(|(i, _)| i)
        .unwrap_or(0);

    let winner = candidates.swap_remove(index);
    debug!(
        collection = coll.name(),
        winner = %winner.solution,
        works = winner.executor.works(),
        spent,
        "Multi-plan trial picked a winner"
    );
    Ok(TrialWinner {
        index,
        decision_works: winner.executor.works(),
        solution: winner.solution,
        executor: winner.executor,
    })
}

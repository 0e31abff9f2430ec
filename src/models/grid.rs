//! Deterministic parallel grid search.
//!
//! The automatic model families pick parameters by evaluating a fixed grid of
//! candidates and keeping the one with the lowest score. Candidates are
//! evaluated in parallel; the winner is chosen with a tie-break on the grid
//! index so the result does not depend on thread scheduling.

use rayon::prelude::*;

/// A scored grid candidate.
#[derive(Debug, Clone)]
pub struct Scored<T> {
    pub idx: usize,
    pub value: T,
    pub score: f64,
}

/// Evaluate every grid point and return the best one.
///
/// `eval` returns `None` for infeasible candidates (singular systems,
/// non-finite likelihoods); those are skipped. Returns `None` when no
/// candidate survives.
pub fn search<G, T, F>(grid: &[G], eval: F) -> Option<Scored<T>>
where
    G: Sync,
    T: Send,
    F: Fn(&G) -> Option<(T, f64)> + Sync,
{
    let candidates: Vec<Scored<T>> = grid
        .par_iter()
        .enumerate()
        .filter_map(|(idx, g)| {
            eval(g)
                .filter(|(_, score)| score.is_finite())
                .map(|(value, score)| Scored { idx, value, score })
        })
        .collect();

    pick_best(candidates)
}

/// Lowest score wins; ties go to the lower grid index.
pub fn pick_best<T>(candidates: Vec<Scored<T>>) -> Option<Scored<T>> {
    candidates.into_iter().reduce(|best, c| {
        if c.score < best.score || (c.score == best.score && c.idx < best.idx) {
            c
        } else {
            best
        }
    })
}

/// `steps` evenly spaced points between `min` and `max` (inclusive).
pub fn lin_space(min: f64, max: f64, steps: usize) -> Vec<f64> {
    match steps {
        0 => Vec::new(),
        1 => vec![min],
        _ => {
            let step = (max - min) / (steps as f64 - 1.0);
            (0..steps).map(|i| min + step * i as f64).collect()
        }
    }
}

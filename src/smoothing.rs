//! SmoothingLengthLoop: the outer convergence loop that calls [`crate::orchestrator::run_treewalk`]
//! repeatedly, bisecting each particle's smoothing length until its neighbour count lands within
//! tolerance of the target, or giving up after a configured number of iterations.

use crate::error::EngineError;
use crate::kernel::TreeWalkKernel;
use crate::orchestrator::{run_treewalk, EngineConfig};
use crate::particles::Particles;
use crate::thread_pool::Threads;
use crate::transport::Transport;
use crate::tree::Tree;
use log::debug;
use std::collections::HashMap;

/// A kernel whose neighbour count depends on a per-particle smoothing length that this loop is
/// responsible for converging. All accessors use interior mutability on `&self`, the same way
/// [`TreeWalkKernel::reduce`] does, since the engine never hands out `&mut` kernel references.
pub trait SmoothingKernel: TreeWalkKernel {
    fn hsml(&self, target: usize) -> f64;
    fn set_hsml(&self, target: usize, value: f64);
    /// The neighbour count measured by the most recent treewalk pass.
    fn measured_ngb(&self, target: usize) -> f64;
    fn desired_ngb(&self) -> f64;
    /// Fractional tolerance: converged once `|measured - desired| <= tolerance * desired`.
    fn ngb_tolerance(&self) -> f64;
}

/// Bisects (or, with only one side of the bracket known, extrapolates by the implied volume
/// change) towards a smoothing length whose neighbour count matches `desired`.
pub fn narrow_down(hsml: f64, measured_ngb: f64, desired_ngb: f64, mut lower: f64, mut upper: f64) -> (f64, f64, f64) {
    if measured_ngb > desired_ngb {
        upper = upper.min(hsml);
    } else {
        lower = lower.max(hsml);
    }

    let has_lower = lower > 0.0;
    let has_upper = upper.is_finite();

    let new_hsml = if has_lower && has_upper {
        0.5 * (lower + upper)
    } else {
        let factor = (desired_ngb / measured_ngb.max(1e-8)).cbrt().min(4.0);
        let extrapolated = hsml * factor;
        if has_upper {
            extrapolated.min(upper * 0.99)
        } else if has_lower {
            extrapolated.max(lower * 1.01)
        } else {
            extrapolated
        }
    };

    (new_hsml, lower, upper)
}

/// Runs treewalk passes, adjusting `Hsml` for particles whose neighbour count is out of
/// tolerance, until every rank reports zero particles left to redo or `config.max_iter` passes
/// have run (whichever comes first — the latter is a [`EngineError::ConvergenceExceeded`]).
pub fn smoothing_length_loop<T, P, X, K>(
    tree: &T,
    particles: &P,
    transport: &X,
    kernel: &K,
    active_set: &[usize],
    config: &EngineConfig,
    pool: &mut Threads,
) -> Result<(), EngineError>
where
    T: Tree,
    P: Particles,
    X: Transport,
    K: SmoothingKernel,
{
    let mut brackets: HashMap<usize, (f64, f64)> = active_set.iter().map(|&i| (i, (0.0, f64::INFINITY))).collect();
    let mut redo: Vec<usize> = active_set.to_vec();

    for iteration in 0..config.max_iter {
        if redo.is_empty() {
            break;
        }
        debug!("smoothing length loop: iteration {iteration}, {} particles to redo", redo.len());

        run_treewalk(tree, particles, transport, kernel, &redo, config, pool)?;

        let mut next_redo = Vec::with_capacity(redo.len());
        for &i in &redo {
            let measured = kernel.measured_ngb(i);
            let desired = kernel.desired_ngb();
            if (measured - desired).abs() <= kernel.ngb_tolerance() * desired {
                continue;
            }

            let hsml = kernel.hsml(i);
            let (lower, upper) = *brackets.get(&i).expect("every redo particle has a bracket");
            let (new_hsml, new_lower, new_upper) = narrow_down(hsml, measured, desired, lower, upper);
            // Once both sides of the bracket are known, bisection must keep it non-degenerate or
            // this particle will never converge; catch that the iteration it happens rather than
            // burning through `max_iter` only to report a generic non-convergence.
            if cfg!(debug_assertions) && new_lower.is_finite() && new_upper.is_finite() && new_lower >= new_upper {
                return Err(EngineError::BracketDidNotClose { target: i, lower: new_lower, upper: new_upper });
            }
            brackets.insert(i, (new_lower, new_upper));
            kernel.set_hsml(i, new_hsml);
            next_redo.push(i);
        }

        redo = next_redo;
        let remaining_anywhere = transport.all_reduce_sum(redo.len() as u64);
        if remaining_anywhere == 0 {
            return Ok(());
        }
    }

    let remaining = transport.all_reduce_sum(redo.len() as u64);
    if remaining > 0 {
        return Err(EngineError::ConvergenceExceeded { max_iter: config.max_iter, remaining: remaining as usize });
    }
    Ok(())
}

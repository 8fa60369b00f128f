//! Orchestrator: runs one full treewalk — build queue, discover exports, compute locally while
//! the exchange round-trip with other ranks runs concurrently, reduce the replies — end to end.
//!
//! This is the "master loop" every treewalk invocation goes through once; [`crate::smoothing`]
//! calls it repeatedly to converge on a smoothing length.

use crate::error::EngineError;
use crate::exchange::exchange;
use crate::export::{compute_bunch_size, ExportTable};
use crate::kernel::TreeWalkKernel;
use crate::particles::Particles;
use crate::phases::{primary_phase, secondary_phase, toptree_phase, WalkStats};
use crate::queue::build_queue;
use crate::thread_pool::Threads;
use crate::transport::Transport;
use crate::tree::Tree;
use log::{debug, trace};
use std::mem::size_of;

#[derive(Copy, Clone, Debug)]
pub struct EngineConfig {
    /// Extra query/result headroom reserved per export slot, so the queries a TopTree pass
    /// commits to can still grow a little before the exchange buffer needs resizing.
    pub import_buffer_boost: u32,
    /// Smoothing-length convergence iteration cap; see [`crate::smoothing`].
    pub max_iter: u32,
    pub num_threads: usize,
    pub box_size: f64,
    /// Bytes available for one rank's export table.
    pub export_memory_bytes: usize,
}

/// Runs one treewalk over `active_set`: builds the work queue, discovers exports, computes the
/// local contribution while the cross-rank exchange overlaps it, and reduces the replies.
///
/// The export buffer is sized once and never grown. If the TopTree phase fills it before the
/// whole queue is covered, this rank keeps running further sub-iterations — each a full
/// TopTree/exchange/secondary/reduce round trip over whatever slice of the queue fits — resuming
/// where the last one left off, until its own queue is exhausted. Because the exchange round
/// trip is collective, every rank keeps participating in these sub-iterations (with an empty
/// TopTree pass once its own queue is exhausted) until every rank has caught up; `PrimaryPhase`
/// only runs once, on the first sub-iteration, since it never overflows and re-running it would
/// double-count its contribution.
pub fn run_treewalk<T, P, X, K>(
    tree: &T,
    particles: &P,
    transport: &X,
    kernel: &K,
    active_set: &[usize],
    config: &EngineConfig,
    pool: &mut Threads,
) -> Result<WalkStats, EngineError>
where
    T: Tree,
    P: Particles,
    X: Transport,
    K: TreeWalkKernel,
{
    if config.num_threads == 0 {
        return Err(EngineError::ZeroThreads);
    }

    let query_elsize = size_of::<K::Query>();
    let result_elsize = size_of::<K::Result>();
    if query_elsize % 8 != 0 {
        return Err(EngineError::UnalignedRecord { size: query_elsize });
    }
    if result_elsize % 8 != 0 {
        return Err(EngineError::UnalignedRecord { size: result_elsize });
    }

    let queue = build_queue(particles, Some(active_set), kernel, true, pool);
    trace!("treewalk: queue has {} targets", queue.len());

    let bunch_size = compute_bunch_size(config.export_memory_bytes, query_elsize, result_elsize, config.import_buffer_boost)?;
    let num_ranks = transport.num_ranks() as u64;

    let mut total_stats = WalkStats::identity();
    let mut work_set_start = 0usize;
    let mut n_export_full = 0u32;

    loop {
        let mut export_table = ExportTable::new(bunch_size);
        let toptree = toptree_phase(tree, particles, kernel, &queue, work_set_start, &mut export_table, pool)?;
        trace!(
            "treewalk sub-iteration {n_export_full}: work_set_start={work_set_start}, discovered {} exports, overflowed={}",
            toptree.exports.len(),
            toptree.overflowed
        );
        total_stats = total_stats.merge(toptree.stats);

        // Every rank must keep taking part in the exchange round trip (to service other ranks'
        // secondary-phase requests) until all of them report no overflow this sub-iteration, not
        // just until this rank's own queue is exhausted.
        let n_done = transport.all_reduce_sum(u64::from(!toptree.overflowed));

        // Only the round-trip communication (and the remote secondary compute it triggers)
        // overlaps with this rank's own primary phase. Reducing the replies touches the same
        // per-particle kernel state primary_phase's own reduce calls do, so that step waits until
        // both threads have joined below.
        let (primary_stats, replies) = std::thread::scope(|scope| -> Result<_, EngineError> {
            let exchange_handle = scope.spawn(|| {
                exchange(transport, &toptree.exports, kernel, |imported| {
                    let mut secondary_pool = Threads::new(config.num_threads);
                    secondary_phase(tree, particles, kernel, imported, &mut secondary_pool)
                })
            });

            let primary_stats = if n_export_full == 0 { Some(primary_phase(tree, particles, kernel, &queue, pool)?) } else { None };
            let replies = exchange_handle.join().expect("exchange thread panicked")?;
            Ok((primary_stats, replies))
        })?;

        if let Some(primary_stats) = primary_stats {
            total_stats = total_stats.merge(primary_stats);
        }
        replies.apply(&toptree.exports, kernel)?;

        n_export_full += 1;
        work_set_start = toptree.resume_at;

        if n_done == num_ranks {
            debug!("treewalk converged after {n_export_full} sub-iteration(s)");
            return Ok(total_stats);
        }
    }
}

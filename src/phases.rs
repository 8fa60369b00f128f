//! The three tree-walking phases: discover exports (TopTree), compute over local particles
//! (Primary), and compute over imported queries on behalf of other ranks (Ghosts/Secondary).
//!
//! All three share the same monotonic, shrinking-chunk dynamic scheduler from
//! [`crate::scheduling`], so a thread that finishes early keeps pulling more work rather than
//! sitting idle while a slower thread grinds through a big contiguous chunk.

use crate::export::{ExportEntry, ExportTable, LocalTreeWalk};
use crate::error::EngineError;
use crate::kernel::{Mode, TreeWalkKernel, TreeWalkQuery};
use crate::particles::Particles;
use crate::scheduling::{initial_chunk_size, maybe_shrink, ChunkCursor};
use crate::thread_pool::Threads;
use crate::tree::Tree;
use crate::walker::{visit_ngbiter, WalkOutcome};
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Copy, Clone, Debug, Default)]
pub struct WalkStats {
    pub ninteractions: i64,
    pub max_ninteractions: i64,
    pub min_ninteractions: i64,
}

impl WalkStats {
    pub(crate) fn merge(self, other: WalkStats) -> WalkStats {
        WalkStats {
            ninteractions: self.ninteractions + other.ninteractions,
            max_ninteractions: self.max_ninteractions.max(other.max_ninteractions),
            min_ninteractions: self.min_ninteractions.min(other.min_ninteractions),
        }
    }

    /// The merge identity: zero interactions everywhere, with `min_ninteractions` pinned to
    /// `i64::MAX` so the first real `merge` call's minimum wins outright.
    pub(crate) fn identity() -> WalkStats {
        WalkStats { ninteractions: 0, max_ninteractions: 0, min_ninteractions: i64::MAX }
    }
}

/// One call's worth of TopTree work: the exports it managed to record, and — if the buffer
/// filled up before the whole work set was covered — where the next call should resume.
pub struct ToptreeOutcome {
    pub stats: WalkStats,
    /// The compacted, valid export entries recorded this call — every thread's backing slice
    /// past its own `n_export` is still a stale default record and has already been dropped here.
    pub exports: Vec<ExportEntry>,
    /// `true` if the buffer filled up before every target in `work_set_start..queue.len()` was
    /// walked.
    pub overflowed: bool,
    /// The `work_set_start` the next call should resume from. Equal to `queue.len()` when this
    /// call was not cut short by an overflow.
    pub resume_at: usize,
}

/// Walks the top-tree skeleton once per queued target from `work_set_start` onward, recording
/// which ranks each one needs exporting to. Never calls `kernel.reduce` — there is nothing to
/// reduce yet, only exports to discover.
///
/// `export_table` is a fixed-size buffer that is never grown: if it fills up mid-pass, every
/// thread stops (rolling back whichever target it was mid-export for) and reports the highest
/// target index it finished exporting. The caller resumes the next call at one past the lowest
/// such index across all threads — some targets between that point and where faster threads got
/// to will be walked again, which is safe because only a target's *complete* export list is ever
/// honoured; a target that only partially made it into this call's table is invisible to the
/// caller, since it never made it into `exports`.
pub fn toptree_phase<T, P, K>(
    tree: &T,
    particles: &P,
    kernel: &K,
    queue: &[usize],
    work_set_start: usize,
    export_table: &mut ExportTable,
    pool: &mut Threads,
) -> Result<ToptreeOutcome, EngineError>
where
    T: Tree,
    P: Particles,
    K: TreeWalkKernel,
{
    let remaining = &queue[work_set_start..];
    if remaining.is_empty() {
        return Ok(ToptreeOutcome { stats: WalkStats::identity(), exports: Vec::new(), overflowed: false, resume_at: queue.len() });
    }

    let n_threads = pool.num_threads().max(1);
    let size = remaining.len();
    let cursor = ChunkCursor::new(0);
    let overflowed = AtomicBool::new(false);
    let slices = export_table.split_mut(n_threads);

    // Per thread: its stats, how many entries it actually wrote, and the highest index into
    // `remaining` it fully exported (`None` if it never completed one before stopping).
    let outcomes: Vec<Result<(WalkStats, usize, Option<usize>), EngineError>> = pool
        .execute_with_args(slices, |_tid, slice| {
            let mut ngb_scratch: Vec<usize> = Vec::new();
            let mut lv = LocalTreeWalk::new(Mode::TopTree, slice, &mut ngb_scratch[..]);
            let mut chunk = initial_chunk_size(size, n_threads);
            let mut last_succeeded: Option<usize> = None;

            'outer: loop {
                if overflowed.load(Ordering::Relaxed) {
                    break;
                }
                let start = cursor.fetch_add(chunk);
                if start >= size {
                    break;
                }
                let end = (start + chunk).min(size);

                for (offset, &target) in remaining[start..end].iter().enumerate() {
                    let rel = start + offset;
                    lv.begin_target(target);
                    let mut query = K::Query::default();
                    kernel.fill(target, &mut query);
                    query.set_node_list([tree.root(), -1]);
                    let mut result = K::Result::default();

                    match visit_ngbiter(&query, &mut result, &mut lv, tree, particles, kernel) {
                        Ok(WalkOutcome::Done(())) => {
                            last_succeeded = Some(rel);
                        }
                        Ok(WalkOutcome::Overflow) => {
                            lv.rollback_current_target();
                            overflowed.store(true, Ordering::Relaxed);
                            break 'outer;
                        }
                        Err(e) => return Err(e),
                    }
                }

                chunk = maybe_shrink(chunk, size.saturating_sub(end), n_threads);
            }

            let stats = WalkStats { ninteractions: lv.ninteractions, max_ninteractions: lv.max_ninteractions, min_ninteractions: lv.min_ninteractions };
            Ok((stats, lv.n_export(), last_succeeded))
        })
        .join();

    let mut total = WalkStats::identity();
    let mut used_per_thread = Vec::with_capacity(outcomes.len());
    let mut min_progress: i64 = i64::MAX;
    for outcome in outcomes {
        let (stats, used, last_succeeded) = outcome?;
        total = total.merge(stats);
        used_per_thread.push(used);
        let progress = last_succeeded.map_or(-1, |rel| rel as i64);
        min_progress = min_progress.min(progress);
    }

    let overflowed = overflowed.load(Ordering::Relaxed);
    let exports = export_table.compact(&used_per_thread);
    let resume_at = if overflowed { work_set_start + (min_progress + 1) as usize } else { queue.len() };

    Ok(ToptreeOutcome { stats: total, exports, overflowed, resume_at })
}

/// Walks each queued target against this rank's own local tree and reduces the result
/// immediately under [`Mode::Primary`].
pub fn primary_phase<T, P, K>(tree: &T, particles: &P, kernel: &K, queue: &[usize], pool: &mut Threads) -> Result<WalkStats, EngineError>
where
    T: Tree,
    P: Particles,
    K: TreeWalkKernel,
{
    let n_threads = pool.num_threads().max(1);
    let size = queue.len();
    let cursor = ChunkCursor::new(0);

    let outcomes: Vec<Result<WalkStats, EngineError>> = pool
        .execute_with_args(vec![(); n_threads], |_tid, ()| {
            let mut empty_export: Vec<crate::export::ExportEntry> = Vec::new();
            let mut ngb_scratch = vec![0usize; particles.len()];
            let mut lv = LocalTreeWalk::new(Mode::Primary, &mut empty_export[..], &mut ngb_scratch[..]);
            let mut chunk = initial_chunk_size(size, n_threads);

            loop {
                let start = cursor.fetch_add(chunk);
                if start >= size {
                    break;
                }
                let end = (start + chunk).min(size);

                for &target in &queue[start..end] {
                    lv.begin_target(target);
                    kernel.preprocess(target);

                    let mut query = K::Query::default();
                    kernel.fill(target, &mut query);
                    query.set_node_list([tree.root(), -1]);
                    let mut result = K::Result::default();

                    match visit_ngbiter(&query, &mut result, &mut lv, tree, particles, kernel)? {
                        WalkOutcome::Done(()) => {}
                        WalkOutcome::Overflow => unreachable!("primary phase never exports"),
                    }

                    kernel.reduce(target, &result, Mode::Primary);
                    kernel.postprocess(target);
                }

                chunk = maybe_shrink(chunk, size.saturating_sub(end), n_threads);
            }

            Ok(WalkStats { ninteractions: lv.ninteractions, max_ninteractions: lv.max_ninteractions, min_ninteractions: lv.min_ninteractions })
        })
        .join();

    let mut total = WalkStats::identity();
    for outcome in outcomes {
        total = total.merge(outcome?);
    }
    Ok(total)
}

/// Walks a batch of queries imported from other ranks against this rank's own local tree under
/// [`Mode::Ghosts`], returning one result per query in the same order they arrived in.
pub fn secondary_phase<T, P, K>(tree: &T, particles: &P, kernel: &K, queries: &[K::Query], pool: &mut Threads) -> Result<Vec<K::Result>, EngineError>
where
    T: Tree,
    P: Particles,
    K: TreeWalkKernel,
{
    if queries.is_empty() {
        return Ok(Vec::new());
    }

    let n_threads = pool.num_threads().max(1);
    let size = queries.len();
    let cursor = ChunkCursor::new(0);

    let per_thread: Vec<Result<Vec<(usize, K::Result)>, EngineError>> = pool
        .execute_with_args(vec![(); n_threads], |_tid, ()| {
            let mut empty_export: Vec<crate::export::ExportEntry> = Vec::new();
            let mut ngb_scratch = vec![0usize; particles.len()];
            let mut lv = LocalTreeWalk::new(Mode::Ghosts, &mut empty_export[..], &mut ngb_scratch[..]);
            let mut chunk = initial_chunk_size(size, n_threads);
            let mut out = Vec::new();

            loop {
                let start = cursor.fetch_add(chunk);
                if start >= size {
                    break;
                }
                let end = (start + chunk).min(size);

                for i in start..end {
                    let query = queries[i];
                    lv.begin_target(usize::MAX);
                    let mut result = K::Result::default();
                    match visit_ngbiter(&query, &mut result, &mut lv, tree, particles, kernel)? {
                        WalkOutcome::Done(()) => {}
                        WalkOutcome::Overflow => unreachable!("secondary phase never exports"),
                    }
                    out.push((i, result));
                }

                chunk = maybe_shrink(chunk, size.saturating_sub(end), n_threads);
            }

            Ok(out)
        })
        .join();

    let mut results = vec![None; size];
    for chunk in per_thread {
        for (i, result) in chunk? {
            results[i] = Some(result);
        }
    }
    Ok(results.into_iter().map(|r| r.expect("every imported query was visited exactly once")).collect())
}

//! ExportBuffer: the per-thread table of (task, particle, remote node) records built up during
//! [`crate::phases::toptree_phase`], and the scratch state ([`LocalTreeWalk`]) each worker thread
//! carries through a walk.

use crate::error::EngineError;
use crate::kernel::Mode;
use crate::tree::Tree;

#[derive(Copy, Clone, Debug, Default)]
pub struct ExportEntry {
    pub task: usize,
    pub index: usize,
    pub node_list: [i64; 2],
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum PushOutcome {
    /// A fresh record was appended.
    Ok,
    /// The node was folded into the previous record's second `node_list` slot instead of
    /// appending a new one, because it's the same target and the same destination task.
    Coalesced,
    /// The thread's slice of the export table is full; the caller must roll this target's
    /// partial exports back and stop — the next call resumes from this point with the same
    /// fixed-size buffer rather than a bigger one.
    Overflow,
}

/// Splits one flat buffer into `num_threads` disjoint, contiguous, mutably-borrowable slices —
/// so each worker thread gets real `&mut [ExportEntry]` access with no runtime borrow-checking.
pub struct ExportTable {
    entries: Vec<ExportEntry>,
}

impl ExportTable {
    pub fn new(bunch_size: usize) -> Self {
        ExportTable { entries: vec![ExportEntry::default(); bunch_size] }
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// The `(start, len)` sub-range handed to thread `t` by [`Self::split_mut`] — computed from
    /// `total`/`num_threads` alone so it can be reproduced after the mutable borrows from
    /// `split_mut` have gone out of scope, to compact each thread's actually-written prefix.
    pub fn thread_range(total: usize, num_threads: usize, t: usize) -> (usize, usize) {
        let base = total / num_threads;
        let extra = total % num_threads;
        let start = t * base + t.min(extra);
        let len = base + usize::from(t < extra);
        (start, len)
    }

    /// Splits the table into `num_threads` roughly-equal contiguous slices, in thread order,
    /// matching [`Self::thread_range`].
    pub fn split_mut(&mut self, num_threads: usize) -> Vec<&mut [ExportEntry]> {
        let total = self.entries.len();
        let base = total / num_threads;
        let extra = total % num_threads;
        let mut rest: &mut [ExportEntry] = &mut self.entries;
        let mut out = Vec::with_capacity(num_threads);
        for t in 0..num_threads {
            let take = base + usize::from(t < extra);
            let (head, tail) = rest.split_at_mut(take);
            out.push(head);
            rest = tail;
        }
        out
    }

    /// The raw backing storage, `capacity()` long — includes unwritten, still-default slots past
    /// whatever each thread actually used. Callers that need only the real exports must compact
    /// via [`Self::thread_range`] and each thread's reported `n_export`, not read this directly.
    pub fn raw(&self) -> &[ExportEntry] {
        &self.entries
    }

    /// Concatenates each thread's actually-written prefix (as reported by the phase that filled
    /// this table) into one compact, valid list of export entries.
    pub fn compact(&self, used_per_thread: &[usize]) -> Vec<ExportEntry> {
        let mut out = Vec::with_capacity(used_per_thread.iter().sum());
        for (t, &used) in used_per_thread.iter().enumerate() {
            let (start, len) = Self::thread_range(self.entries.len(), used_per_thread.len(), t);
            debug_assert!(used <= len, "thread {t} reported using more of its slice than it was given");
            out.extend_from_slice(&self.entries[start..start + used]);
        }
        out
    }
}

/// Per-thread state threaded through a single descent. `export_slice` is this thread's slice of
/// the shared [`ExportTable`] (empty outside [`Mode::TopTree`]); `ngblist` is scratch space for
/// collecting neighbour candidates, reused across targets.
pub struct LocalTreeWalk<'a> {
    pub mode: Mode,
    target: Option<usize>,
    n_export: usize,
    n_this_particle_export: usize,
    export_slice: &'a mut [ExportEntry],
    ngblist: &'a mut [usize],
    ngblist_len: usize,
    pub max_ninteractions: i64,
    pub min_ninteractions: i64,
    pub ninteractions: i64,
}

impl<'a> LocalTreeWalk<'a> {
    pub fn new(mode: Mode, export_slice: &'a mut [ExportEntry], ngblist: &'a mut [usize]) -> Self {
        LocalTreeWalk {
            mode,
            target: None,
            n_export: 0,
            n_this_particle_export: 0,
            export_slice,
            ngblist,
            ngblist_len: 0,
            max_ninteractions: 0,
            min_ninteractions: i64::MAX,
            ninteractions: 0,
        }
    }

    pub fn begin_target(&mut self, target: usize) {
        self.target = Some(target);
        self.n_this_particle_export = 0;
    }

    pub fn target(&self) -> usize {
        self.target.expect("begin_target was not called before the walk started")
    }

    pub fn n_export(&self) -> usize {
        self.n_export
    }

    pub fn exports(&self) -> &[ExportEntry] {
        &self.export_slice[..self.n_export]
    }

    /// Discards the exports recorded for the current target, leaving earlier targets' records
    /// intact. Called after a [`PushOutcome::Overflow`] so this target is left out of the
    /// compacted export list and gets walked again on the next resumed call instead.
    pub fn rollback_current_target(&mut self) {
        self.n_export -= self.n_this_particle_export;
        self.n_this_particle_export = 0;
    }

    pub fn ngb_reset(&mut self) {
        self.ngblist_len = 0;
    }

    pub fn push_ngb(&mut self, index: usize) {
        self.ngblist[self.ngblist_len] = index;
        self.ngblist_len += 1;
    }

    pub fn ngb_candidates(&self, count: usize) -> &[usize] {
        &self.ngblist[..count]
    }

    pub fn add_counters(&mut self, n: i64) {
        self.ninteractions += n;
        self.max_ninteractions = self.max_ninteractions.max(n);
        self.min_ninteractions = self.min_ninteractions.min(n);
    }

    /// Records that `target` needs visiting on `task`'s rank, via the remote node `node.
    /// Consecutive pushes for the same target onto the same task are coalesced into one record's
    /// second `node_list` slot instead of producing a separate record.
    pub fn push<T: Tree>(&mut self, tree: &T, target: usize, pseudo_no: i64) -> PushOutcome {
        debug_assert_eq!(self.mode, Mode::TopTree, "export attempted outside TopTree mode");
        let leaf = tree.top_leaf(pseudo_no);
        let task = leaf.owner_task;

        if self.n_this_particle_export > 0 {
            let prev = &mut self.export_slice[self.n_export - 1];
            if prev.task == task && prev.node_list[1] == -1 {
                prev.node_list[1] = leaf.remote_treenode;
                return PushOutcome::Coalesced;
            }
        }

        if self.n_export >= self.export_slice.len() {
            return PushOutcome::Overflow;
        }

        self.export_slice[self.n_export] = ExportEntry {
            task,
            index: target,
            node_list: [leaf.remote_treenode, -1],
        };
        self.n_export += 1;
        self.n_this_particle_export += 1;
        PushOutcome::Ok
    }
}

/// Sizes the export table from the bytes the caller is willing to hand over, leaving headroom
/// for the query/result buffers the exported records will eventually produce.
pub fn compute_bunch_size(
    free_bytes: usize,
    query_elsize: usize,
    result_elsize: usize,
    import_buffer_boost: u32,
) -> Result<usize, EngineError> {
    if query_elsize % 8 != 0 {
        return Err(EngineError::UnalignedRecord { size: query_elsize });
    }
    if result_elsize % 8 != 0 {
        return Err(EngineError::UnalignedRecord { size: result_elsize });
    }

    let headroom_per_entry = import_buffer_boost as usize * (query_elsize + result_elsize);
    let bytes_per_entry = std::mem::size_of::<ExportEntry>() + query_elsize + headroom_per_entry + 64;

    // The import side can in principle need much more than `Nexport` entries if the tree is
    // badly imbalanced, so the abort threshold (11 buffers' worth) sits a full buffer above the
    // reserve (10 buffers' worth) actually subtracted from free memory.
    let abort_threshold = bytes_per_entry.saturating_mul(4096 * 11);
    if free_bytes <= abort_threshold {
        return Err(EngineError::InsufficientExportMemory {
            have: free_bytes,
            need: bytes_per_entry * 100,
        });
    }

    let reserve = bytes_per_entry.saturating_mul(4096 * 10);
    let usable = free_bytes - reserve;
    let mut bunch_size = usable / bytes_per_entry;

    // Some MPI implementations misbehave once a single send/recv buffer nears 4 GiB.
    let max_query_bytes = 1024 * 1024 * 3092;
    if query_elsize > 0 && bunch_size * query_elsize > max_query_bytes {
        bunch_size = max_query_bytes / query_elsize;
    }

    if bunch_size < 100 {
        return Err(EngineError::InsufficientExportMemory {
            have: free_bytes,
            need: bytes_per_entry * 100,
        });
    }

    Ok(bunch_size)
}

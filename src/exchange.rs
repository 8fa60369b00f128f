//! Exchange: packs an export table into per-rank contiguous blocks, round-trips them through a
//! [`Transport`], and reduces the replies back onto the particles that produced them.
//!
//! Queries and results cross the wire as raw bytes, the same way the system this is modeled on
//! marshals fixed-size C structs through MPI — there is no serialization crate in this stack for
//! it, and none is needed as long as `Query`/`Result` stay plain `Copy` data.

use crate::error::EngineError;
use crate::export::ExportEntry;
use crate::kernel::{Mode, TreeWalkKernel, TreeWalkQuery};
use crate::transport::{Transport, QUERY_TAG, RESULT_TAG};
use std::mem::size_of;

/// Safety: `T` must be a plain-data type with no padding the caller depends on being zeroed and
/// no pointers/handles that would dangle once reinterpreted as bytes — i.e. effectively `Pod`.
/// `TreeWalkKernel::Query`/`Result` are required to be `Copy`, which rules out the common ways to
/// violate that (no `Drop`, no borrowed data).
unsafe fn as_bytes<T: Copy>(value: &T) -> &[u8] {
    std::slice::from_raw_parts((value as *const T).cast::<u8>(), size_of::<T>())
}

/// Safety: see [`as_bytes`]; `bytes` must hold exactly `size_of::<T>()` initialized bytes.
unsafe fn from_bytes<T: Copy>(bytes: &[u8]) -> T {
    debug_assert_eq!(bytes.len(), size_of::<T>());
    std::ptr::read_unaligned(bytes.as_ptr().cast::<T>())
}

/// An export table re-ordered into contiguous per-task blocks, ready for `Transport::all_to_all_v_sparse`.
pub struct PackedExports {
    /// `entries[order[i]]` is the record occupying packed slot `i`.
    pub order: Vec<usize>,
    pub send_counts: Vec<usize>,
    pub send_offsets: Vec<usize>,
}

pub fn pack_by_task(entries: &[ExportEntry], num_ranks: usize) -> PackedExports {
    let mut order: Vec<usize> = (0..entries.len()).collect();
    order.sort_by_key(|&i| entries[i].task);

    let mut send_counts = vec![0usize; num_ranks];
    for e in entries {
        send_counts[e.task] += 1;
    }

    let mut send_offsets = vec![0usize; num_ranks];
    let mut acc = 0;
    for (t, count) in send_counts.iter().enumerate() {
        send_offsets[t] = acc;
        acc += count;
    }

    PackedExports { order, send_counts, send_offsets }
}

fn prefix_sum(counts: &[usize]) -> Vec<usize> {
    let mut offsets = vec![0usize; counts.len()];
    let mut acc = 0;
    for (i, c) in counts.iter().enumerate() {
        offsets[i] = acc;
        acc += c;
    }
    offsets
}

/// The reply leg of an exchange, still in packed wire order, waiting to be reduced back onto the
/// particles that produced the original queries.
pub struct ExchangeReplies<K: TreeWalkKernel> {
    order: Vec<usize>,
    results: Vec<K::Result>,
}

impl<K: TreeWalkKernel> ExchangeReplies<K> {
    /// Folds every reply onto its originating particle via `kernel.reduce(.., Mode::Ghosts)`, in
    /// the order the queries went out. Callers must not run this concurrently with anything else
    /// that touches the same particles' kernel state — on this rank, the only other writer is
    /// `primary_phase`'s `Mode::Primary` reduce, so this must happen after that phase has joined,
    /// not while it is still running.
    ///
    /// `entries` must be the exact export table this batch of replies was produced from —
    /// passing a different sub-iteration's table would reduce replies onto the wrong particles.
    /// In debug builds that mismatch is caught instead of silently corrupting state.
    pub fn apply(self, entries: &[ExportEntry], kernel: &K) -> Result<(), EngineError> {
        for (slot, &idx) in self.order.iter().enumerate() {
            if cfg!(debug_assertions) && idx >= entries.len() {
                return Err(EngineError::UnmatchedResult { target: idx });
            }
            let entry = &entries[idx];
            kernel.reduce(entry.index, &self.results[slot], Mode::Ghosts);
        }
        Ok(())
    }
}

/// Sends every exported query to the rank that owns it and runs `run_secondary` there (the caller
/// supplies this so the engine itself stays agnostic to how the secondary phase is scheduled).
/// Safe to run concurrently with this rank's own primary phase — unlike [`ExchangeReplies::apply`],
/// nothing here touches per-particle kernel state, only `kernel.fill` (read-only by contract) and
/// `run_secondary`'s own `Mode::Ghosts` `ngbiter` calls on freshly received queries.
pub fn exchange<X, K>(
    transport: &X,
    entries: &[ExportEntry],
    kernel: &K,
    run_secondary: impl FnOnce(&[K::Query]) -> Result<Vec<K::Result>, EngineError>,
) -> Result<ExchangeReplies<K>, EngineError>
where
    X: Transport,
    K: TreeWalkKernel,
{
    let num_ranks = transport.num_ranks();
    let packed = pack_by_task(entries, num_ranks);

    // Re-derive each task's count directly from the entries rather than trusting
    // `packed.send_counts`, so a future bug in `pack_by_task`'s bookkeeping shows up as a clear
    // fatal error instead of silently sending the wrong number of queries to a peer.
    if cfg!(debug_assertions) {
        let mut recounted = vec![0usize; num_ranks];
        for e in entries {
            recounted[e.task] += 1;
        }
        for (task, (&expected, &actual)) in recounted.iter().zip(packed.send_counts.iter()).enumerate() {
            if expected != actual {
                return Err(EngineError::SendCountMismatch { task, expected, actual });
            }
        }
    }

    let query_elsize = size_of::<K::Query>();
    let mut send_buf = vec![0u8; entries.len() * query_elsize];
    for (slot, &idx) in packed.order.iter().enumerate() {
        let entry = &entries[idx];
        let mut query = K::Query::default();
        kernel.fill(entry.index, &mut query);
        query.set_node_list(entry.node_list);
        let bytes = unsafe { as_bytes(&query) };
        send_buf[slot * query_elsize..(slot + 1) * query_elsize].copy_from_slice(bytes);
    }

    let recv_counts = transport.all_to_all_counts(&packed.send_counts);
    let recv_offsets = prefix_sum(&recv_counts);

    let imported_bytes = transport.all_to_all_v_sparse(
        QUERY_TAG,
        &packed.send_counts,
        &packed.send_offsets,
        &send_buf,
        &recv_counts,
        query_elsize,
    );
    let total_imported: usize = recv_counts.iter().sum();
    let imported_queries: Vec<K::Query> = (0..total_imported)
        .map(|i| unsafe { from_bytes::<K::Query>(&imported_bytes[i * query_elsize..(i + 1) * query_elsize]) })
        .collect();

    let local_results = run_secondary(&imported_queries)?;
    debug_assert_eq!(local_results.len(), imported_queries.len());

    let result_elsize = size_of::<K::Result>();
    let mut result_send_buf = vec![0u8; local_results.len() * result_elsize];
    for (i, result) in local_results.iter().enumerate() {
        let bytes = unsafe { as_bytes(result) };
        result_send_buf[i * result_elsize..(i + 1) * result_elsize].copy_from_slice(bytes);
    }

    // Roles reverse for the reply leg: what I received, I now send back; what I sent, I now
    // expect to receive. Reusing `packed.send_offsets` to place the replies is exactly the
    // send-side-offset canonicalization this exchange relies on.
    let result_bytes = transport.all_to_all_v_sparse(
        RESULT_TAG,
        &recv_counts,
        &recv_offsets,
        &result_send_buf,
        &packed.send_counts,
        result_elsize,
    );

    let results = (0..packed.order.len())
        .map(|slot| unsafe { from_bytes::<K::Result>(&result_bytes[slot * result_elsize..(slot + 1) * result_elsize]) })
        .collect();

    Ok(ExchangeReplies { order: packed.order, results })
}

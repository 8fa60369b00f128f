//! The callback contract a physics module implements to drive a treewalk.
//!
//! Everything here is a plain trait with associated types, not a `dyn` object: the engine is
//! generic over `K: TreeWalkKernel` and monomorphizes per kernel, the same way the rest of this
//! crate is generic over `Tree`/`Particles` rather than boxing them.

use nalgebra::{Point3, Vector3};

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Mode {
    /// Walking the (replicated) top-tree skeleton to discover which ranks a query needs
    /// exporting to.
    TopTree,
    /// Walking a rank's own local tree for its own active particles.
    Primary,
    /// Walking a rank's own local tree on behalf of queries imported from other ranks.
    Ghosts,
}

/// The per-target query payload. `node_list` holds up to two local-tree entry points (own rank,
/// then — once exported and re-imported — the remote rank's local node), `[-1, -1]` terminating
/// the list early when only one is needed.
pub trait TreeWalkQuery: Copy + Default {
    fn position(&self) -> Point3<f64>;
    fn node_list(&self) -> [i64; 2];
    fn set_node_list(&mut self, node_list: [i64; 2]);
}

/// Results are marshalled across the transport as raw bytes (see [`crate::exchange`]), so they
/// must be plain, `Copy` data with no pointers or padding a kernel depends on.
pub trait TreeWalkResult: Copy + Default {}

/// Per-neighbour scratch state, reset at the start of every `ngbiter` call and refilled by the
/// engine before each candidate is dispatched to it.
pub trait NgbIter: Default {
    fn other(&self) -> Option<usize>;
    fn set_other(&mut self, other: Option<usize>);
    fn hsml(&self) -> f64;
    fn set_hsml(&mut self, hsml: f64);
    fn mask(&self) -> u32;
    fn set_mask(&mut self, mask: u32);
    /// Symmetric iterators accept a neighbour if it's within *either* particle's smoothing
    /// length, not just the query's.
    fn symmetric(&self) -> bool;
    fn set_symmetric(&mut self, symmetric: bool);
    fn set_distance(&mut self, r: f64, r2: f64, dist: Vector3<f64>);
}

pub trait TreeWalkKernel: Sync {
    type Query: TreeWalkQuery + Send;
    type Result: TreeWalkResult + Send;
    type Iter: NgbIter;

    /// Build the query payload for `target` before it enters the queue.
    fn fill(&self, target: usize, query: &mut Self::Query);

    /// Merge a walk's result back onto `target`. Called once per mode a particle was actually
    /// visited under (so up to once for `Primary`/`Ghosts` each).
    fn reduce(&self, target: usize, result: &Self::Result, mode: Mode);

    /// Whether `target` needs visiting at all. The default accepts everything; override and also
    /// flip [`Self::has_filter`] to let [`crate::queue::build_queue`] skip the scan entirely when
    /// there is nothing to filter.
    fn haswork(&self, _target: usize) -> bool {
        true
    }

    /// Whether [`Self::haswork`] does real filtering. Kernels that never override `haswork` should
    /// leave this `false` so the work queue can adopt the caller's active set verbatim.
    fn has_filter(&self) -> bool {
        true
    }

    fn preprocess(&self, _target: usize) {}
    fn postprocess(&self, _target: usize) {}

    /// Called once with `iter.other() == None` to read the search radius and mask for `query`,
    /// then once per accepted neighbour with `iter.other()` set.
    fn ngbiter(&self, query: &Self::Query, result: &mut Self::Result, iter: &mut Self::Iter);
}

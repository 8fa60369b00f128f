//! Shared test fixtures: a minimal two-level tree (one flat leaf per simulated rank, no further
//! subdivision — correct for culling, just not spatially selective) and a neighbour-counting
//! density kernel with bisection-driven smoothing lengths.

use nalgebra::Point3;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Mutex, Once};
use treewalk_core::kernel::{Mode, NgbIter, TreeWalkKernel, TreeWalkQuery, TreeWalkResult};
use treewalk_core::particles::Particles;
use treewalk_core::smoothing::SmoothingKernel;
use treewalk_core::tree::{ChildType, TopLeaf, Tree, TreeNode};

static LOG_INIT: Once = Once::new();

/// Turns on `debug!`/`trace!` output for the duration of a test run. Safe to call from every
/// test; only the first call actually installs the logger.
pub fn init_logging() {
    LOG_INIT.call_once(|| {
        let _ = simple_logger::init_with_level(log::Level::Debug);
    });
}

pub struct SimpleNode {
    pub centre: Point3<f64>,
    pub len: f64,
    pub hmax: f64,
    pub child_type: ChildType,
    pub sibling: i64,
    pub first_child: i64,
    pub top_level: bool,
    pub internal_top_level: bool,
    pub particles: Vec<usize>,
    pub pseudo_index: i64,
}

impl TreeNode for SimpleNode {
    fn centre(&self) -> Point3<f64> {
        self.centre
    }
    fn len(&self) -> f64 {
        self.len
    }
    fn hmax(&self) -> f64 {
        self.hmax
    }
    fn child_type(&self) -> ChildType {
        self.child_type
    }
    fn sibling(&self) -> i64 {
        self.sibling
    }
    fn first_child(&self) -> i64 {
        self.first_child
    }
    fn top_level(&self) -> bool {
        self.top_level
    }
    fn internal_top_level(&self) -> bool {
        self.internal_top_level
    }
    fn particles(&self) -> &[usize] {
        &self.particles
    }
    fn pseudo_index(&self) -> i64 {
        self.pseudo_index
    }
}

pub struct SimpleTree {
    pub nodes: Vec<SimpleNode>,
    pub last_node: i64,
    pub top_leaves: Vec<TopLeaf>,
    pub box_size: f64,
    pub mask: u32,
    pub hmax_computed: bool,
}

impl Tree for SimpleTree {
    type Node = SimpleNode;

    fn root(&self) -> i64 {
        0
    }
    fn node(&self, index: i64) -> &SimpleNode {
        &self.nodes[index as usize]
    }
    fn top_leaf(&self, pseudo_no: i64) -> &TopLeaf {
        &self.top_leaves[(pseudo_no - self.last_node) as usize]
    }
    fn box_size(&self) -> f64 {
        self.box_size
    }
    fn mask(&self) -> u32 {
        self.mask
    }
    fn hmax_computed(&self) -> bool {
        self.hmax_computed
    }
}

/// Builds one [`SimpleTree`] per rank: a root node fanning out to one top-leaf per rank (the
/// owning rank's leaf holds `local_particles[rank]` directly; every other rank's leaf is a
/// `Pseudo` stand-in resolved through the (shared) top-leaf table).
pub fn build_rank_trees(local_particles: Vec<Vec<usize>>, box_size: f64, mask: u32) -> Vec<SimpleTree> {
    let num_ranks = local_particles.len();
    let last_node = 1 + num_ranks as i64;
    let half = box_size * 0.5;
    let centre = Point3::new(half, half, half);

    let top_leaves: Vec<TopLeaf> =
        (0..num_ranks).map(|r| TopLeaf { owner_task: r, remote_treenode: 1 + r as i64 }).collect();

    local_particles
        .into_iter()
        .enumerate()
        .map(|(rank, particles)| {
            let mut nodes = Vec::with_capacity(1 + num_ranks);
            nodes.push(SimpleNode {
                centre,
                len: box_size,
                hmax: 0.0,
                child_type: ChildType::Internal,
                sibling: -1,
                first_child: 1,
                top_level: true,
                internal_top_level: true,
                particles: Vec::new(),
                pseudo_index: -1,
            });
            for other in 0..num_ranks {
                let sibling = if other + 1 < num_ranks { 2 + other as i64 } else { -1 };
                if other == rank {
                    nodes.push(SimpleNode {
                        centre,
                        len: box_size,
                        hmax: 0.0,
                        child_type: ChildType::Particle,
                        sibling,
                        first_child: -1,
                        top_level: true,
                        internal_top_level: false,
                        particles: particles.clone(),
                        pseudo_index: -1,
                    });
                } else {
                    nodes.push(SimpleNode {
                        centre,
                        len: box_size,
                        hmax: 0.0,
                        child_type: ChildType::Pseudo,
                        sibling,
                        first_child: -1,
                        top_level: true,
                        internal_top_level: false,
                        particles: Vec::new(),
                        pseudo_index: last_node + other as i64,
                    });
                }
            }
            SimpleTree { nodes, last_node, top_leaves: top_leaves.clone(), box_size, mask, hmax_computed: true }
        })
        .collect()
}

pub struct VecParticles {
    pub positions: Vec<Point3<f64>>,
    pub hsml: Vec<Mutex<f64>>,
    pub garbage: Vec<bool>,
    /// Added to the local index to make `id()` globally unique across simulated ranks, the way a
    /// real domain decomposition would hand out disjoint id ranges rather than reusing 0.. on
    /// every rank.
    pub id_offset: i64,
}

impl VecParticles {
    pub fn new(positions: Vec<Point3<f64>>, hsml: Vec<f64>) -> Self {
        Self::with_id_offset(positions, hsml, 0)
    }

    pub fn with_id_offset(positions: Vec<Point3<f64>>, hsml: Vec<f64>, id_offset: i64) -> Self {
        let garbage = vec![false; positions.len()];
        VecParticles { positions, hsml: hsml.into_iter().map(Mutex::new).collect(), garbage, id_offset }
    }
}

impl Particles for VecParticles {
    fn len(&self) -> usize {
        self.positions.len()
    }
    fn position(&self, index: usize) -> Point3<f64> {
        self.positions[index]
    }
    fn hsml(&self, index: usize) -> f64 {
        *self.hsml[index].lock().unwrap()
    }
    fn type_id(&self, _index: usize) -> u8 {
        0
    }
    fn is_garbage(&self, index: usize) -> bool {
        self.garbage[index]
    }
    fn id(&self, index: usize) -> i64 {
        self.id_offset + index as i64
    }
}

#[derive(Copy, Clone, Default)]
pub struct DensityQuery {
    pub position: [f64; 3],
    pub hsml: f64,
    pub node_list: [i64; 2],
    /// The stable id of the particle this query was filled for, so `ngbiter` can recognise and
    /// skip a candidate that is the target itself (the same particle can sit in its own leaf).
    /// `-1` for an imported query with no local target to compare against.
    pub source_id: i64,
}

impl TreeWalkQuery for DensityQuery {
    fn position(&self) -> Point3<f64> {
        Point3::new(self.position[0], self.position[1], self.position[2])
    }
    fn node_list(&self) -> [i64; 2] {
        self.node_list
    }
    fn set_node_list(&mut self, node_list: [i64; 2]) {
        self.node_list = node_list;
    }
}

#[derive(Copy, Clone, Default)]
pub struct DensityResult {
    pub ngb: f64,
}
impl TreeWalkResult for DensityResult {}

#[derive(Default)]
pub struct DensityIter {
    other: Option<usize>,
    hsml: f64,
    mask: u32,
    symmetric: bool,
}
impl NgbIter for DensityIter {
    fn other(&self) -> Option<usize> {
        self.other
    }
    fn set_other(&mut self, other: Option<usize>) {
        self.other = other;
    }
    fn hsml(&self) -> f64 {
        self.hsml
    }
    fn set_hsml(&mut self, hsml: f64) {
        self.hsml = hsml;
    }
    fn mask(&self) -> u32 {
        self.mask
    }
    fn set_mask(&mut self, mask: u32) {
        self.mask = mask;
    }
    fn symmetric(&self) -> bool {
        self.symmetric
    }
    fn set_symmetric(&mut self, symmetric: bool) {
        self.symmetric = symmetric;
    }
    fn set_distance(&mut self, _r: f64, _r2: f64, _dist: nalgebra::Vector3<f64>) {}
}

/// Counts neighbours within `Hsml` of each target and converges `Hsml` on a fixed desired count.
pub struct DensityKernel<'p> {
    pub particles: &'p VecParticles,
    pub desired_ngb: f64,
    pub tolerance: f64,
    pub ngb_counts: Vec<AtomicU64>,
    pub reduce_calls: AtomicI64,
    pub symmetric: bool,
}

impl<'p> DensityKernel<'p> {
    pub fn new(particles: &'p VecParticles, desired_ngb: f64, tolerance: f64) -> Self {
        let ngb_counts = (0..particles.len()).map(|_| AtomicU64::new(0)).collect();
        DensityKernel { particles, desired_ngb, tolerance, ngb_counts, reduce_calls: AtomicI64::new(0), symmetric: false }
    }

    pub fn symmetric(particles: &'p VecParticles, desired_ngb: f64, tolerance: f64) -> Self {
        DensityKernel { symmetric: true, ..Self::new(particles, desired_ngb, tolerance) }
    }
}

impl<'p> TreeWalkKernel for DensityKernel<'p> {
    type Query = DensityQuery;
    type Result = DensityResult;
    type Iter = DensityIter;

    fn fill(&self, target: usize, query: &mut DensityQuery) {
        let p = self.particles.position(target);
        query.position = [p.x, p.y, p.z];
        query.hsml = self.particles.hsml(target);
        query.source_id = self.particles.id(target);
    }

    fn reduce(&self, target: usize, result: &DensityResult, _mode: Mode) {
        self.reduce_calls.fetch_add(1, Ordering::Relaxed);
        self.ngb_counts[target].fetch_add(result.ngb as u64, Ordering::Relaxed);
    }

    fn has_filter(&self) -> bool {
        false
    }

    /// Each pass's Primary + Ghosts contributions should sum together, but a redo pass must start
    /// from zero rather than piling onto the previous pass's count.
    fn preprocess(&self, target: usize) {
        self.ngb_counts[target].store(0, Ordering::Relaxed);
    }

    fn ngbiter(&self, query: &DensityQuery, result: &mut DensityResult, iter: &mut DensityIter) {
        if iter.other().is_none() {
            iter.set_hsml(query.hsml);
            iter.set_mask(1);
            iter.set_symmetric(self.symmetric);
            result.ngb = 0.0;
            return;
        }
        let other = iter.other().expect("checked above");
        if self.particles.id(other) == query.source_id {
            return;
        }
        result.ngb += 1.0;
    }
}

impl<'p> SmoothingKernel for DensityKernel<'p> {
    fn hsml(&self, target: usize) -> f64 {
        self.particles.hsml(target)
    }
    fn set_hsml(&self, target: usize, value: f64) {
        *self.particles.hsml[target].lock().unwrap() = value;
    }
    fn measured_ngb(&self, target: usize) -> f64 {
        self.ngb_counts[target].load(Ordering::Relaxed) as f64
    }
    fn desired_ngb(&self) -> f64 {
        self.desired_ngb
    }
    fn ngb_tolerance(&self) -> f64 {
        self.tolerance
    }
}

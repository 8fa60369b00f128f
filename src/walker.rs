//! LocalWalker / VisitorKernel: the descent through one rank's local tree.
//!
//! [`ngb_treefind_threads`] is the shared descent used both for top-tree export discovery
//! (`Mode::TopTree`) and for collecting neighbour candidates into `lv.ngblist()`
//! (`Mode::Primary`/`Mode::Ghosts`) ahead of [`visit_ngbiter`]. [`visit_nolist_ngbiter`] is a
//! separate, self-contained descent for kernels that want candidates evaluated inline as they're
//! found rather than collected first — it duplicates the traversal rather than sharing it, since
//! the two have genuinely different inner loops.

use crate::culler::cull_node;
use crate::error::EngineError;
use crate::export::{LocalTreeWalk, PushOutcome};
use crate::geometry::nearest_image;
use crate::kernel::{Mode, NgbIter, TreeWalkKernel, TreeWalkQuery};
use crate::particles::Particles;
use crate::tree::{ChildType, Tree, TreeNode};

/// What a bounded descent produced: either a normal result, or notice that the thread's export
/// slice filled up and the phase needs to roll this target back and retry.
pub enum WalkOutcome<T> {
    Done(T),
    Overflow,
}

/// Descends from `startnode`, either recording export candidates (`Mode::TopTree`) or collecting
/// local neighbour indices into `lv`'s scratch list (`Mode::Primary`/`Mode::Ghosts`). Returns the
/// number of candidates collected (ignored in `TopTree` mode).
pub fn ngb_treefind_threads<T: Tree>(
    query_pos: &nalgebra::Point3<f64>,
    hsml: f64,
    symmetric: bool,
    startnode: i64,
    lv: &mut LocalTreeWalk,
    tree: &T,
    target: usize,
) -> Result<WalkOutcome<usize>, EngineError> {
    let mut no = startnode;
    let mut numcand = 0usize;
    let box_size = tree.box_size();

    while no >= 0 {
        let node = tree.node(no);

        if lv.mode == Mode::Ghosts && node.top_level() && no != startnode {
            break;
        }

        if !cull_node(query_pos, hsml, symmetric, node, box_size) {
            no = node.sibling();
            continue;
        }

        match lv.mode {
            Mode::TopTree => {
                if node.child_type() == ChildType::Pseudo {
                    match lv.push(tree, target, node.pseudo_index()) {
                        PushOutcome::Overflow => return Ok(WalkOutcome::Overflow),
                        PushOutcome::Ok | PushOutcome::Coalesced => {}
                    }
                    no = node.sibling();
                    continue;
                }
                if node.top_level() && !node.internal_top_level() {
                    no = node.sibling();
                    continue;
                }
            }
            Mode::Primary | Mode::Ghosts => {
                if node.child_type() == ChildType::Particle {
                    for &p in node.particles() {
                        lv.push_ngb(p);
                    }
                    numcand += node.particles().len();
                    no = node.sibling();
                    continue;
                }
                if node.child_type() == ChildType::Pseudo {
                    if lv.mode == Mode::Ghosts {
                        return Err(EngineError::PseudoNodeInGhostWalk { node: no });
                    }
                    no = node.sibling();
                    continue;
                }
            }
        }
        no = node.first_child();
    }

    Ok(WalkOutcome::Done(numcand))
}

fn axis_distance(a: &nalgebra::Point3<f64>, b: &nalgebra::Point3<f64>, box_size: f64, limit2: f64) -> Option<(f64, nalgebra::Vector3<f64>)> {
    let mut dist = nalgebra::Vector3::zeros();
    let mut r2 = 0.0;
    for d in 0..3 {
        let diff = nearest_image(a[d] - b[d], box_size);
        dist[d] = diff;
        r2 += diff * diff;
        if r2 > limit2 {
            return None;
        }
    }
    Some((r2, dist))
}

/// Runs the neighbour iterator over a two-entry node list, first collecting candidates into
/// `lv`'s scratch buffer via [`ngb_treefind_threads`] and then filtering them by exact distance.
pub fn visit_ngbiter<T, K>(
    query: &K::Query,
    result: &mut K::Result,
    lv: &mut LocalTreeWalk,
    tree: &T,
    particles: &dyn Particles,
    kernel: &K,
) -> Result<WalkOutcome<()>, EngineError>
where
    T: Tree,
    K: TreeWalkKernel,
{
    let mut iter = K::Iter::default();
    iter.set_other(None);
    kernel.ngbiter(query, result, &mut iter);

    if tree.mask() & iter.mask() != iter.mask() {
        return Err(EngineError::MaskMismatch { tree_mask: tree.mask(), iter_mask: iter.mask() });
    }
    if iter.symmetric() && !tree.hmax_computed() {
        return Err(EngineError::SymmetricWithoutHmax);
    }

    let box_size = tree.box_size();
    let mut ninteractions: i64 = 0;

    for slot in query.node_list() {
        if slot < 0 {
            break;
        }
        lv.ngb_reset();
        let numcand = match ngb_treefind_threads(&query.position(), iter.hsml(), iter.symmetric(), slot, lv, tree, lv.target())? {
            WalkOutcome::Overflow => return Ok(WalkOutcome::Overflow),
            WalkOutcome::Done(n) => n,
        };

        for k in 0..numcand {
            let other = lv.ngb_candidates(numcand)[k];
            if particles.is_garbage(other) {
                continue;
            }
            if (1u32 << particles.type_id(other)) & iter.mask() == 0 {
                continue;
            }

            let reach = if iter.symmetric() { particles.hsml(other).max(iter.hsml()) } else { iter.hsml() };
            let Some((r2, dist)) = axis_distance(&query.position(), &particles.position(other), box_size, reach * reach) else {
                continue;
            };

            iter.set_distance(r2.sqrt(), r2, dist);
            iter.set_other(Some(other));
            kernel.ngbiter(query, result, &mut iter);
        }
        ninteractions += numcand as i64;
    }

    lv.add_counters(ninteractions);
    Ok(WalkOutcome::Done(()))
}

/// Self-contained variant of [`visit_ngbiter`] for kernels whose `ngbiter` wants to run inline as
/// neighbours are discovered (e.g. because it shrinks `Hsml` mid-walk) instead of against a
/// pre-collected candidate list.
pub fn visit_nolist_ngbiter<T, K>(
    query: &K::Query,
    result: &mut K::Result,
    lv: &mut LocalTreeWalk,
    tree: &T,
    particles: &dyn Particles,
    kernel: &K,
) -> Result<WalkOutcome<()>, EngineError>
where
    T: Tree,
    K: TreeWalkKernel,
{
    let mut iter = K::Iter::default();
    iter.set_other(None);
    kernel.ngbiter(query, result, &mut iter);

    if tree.mask() & iter.mask() != iter.mask() {
        return Err(EngineError::MaskMismatch { tree_mask: tree.mask(), iter_mask: iter.mask() });
    }
    if iter.symmetric() && !tree.hmax_computed() {
        return Err(EngineError::SymmetricWithoutHmax);
    }

    let box_size = tree.box_size();
    let mut ninteractions: i64 = 0;

    for slot in query.node_list() {
        if slot < 0 {
            break;
        }
        let mut no = slot;

        while no >= 0 {
            let node = tree.node(no);

            if lv.mode == Mode::Ghosts && node.top_level() && no != slot {
                break;
            }

            if !cull_node(&query.position(), iter.hsml(), iter.symmetric(), node, box_size) {
                no = node.sibling();
                continue;
            }

            match lv.mode {
                Mode::TopTree => {
                    if node.child_type() == ChildType::Pseudo {
                        match lv.push(tree, lv.target(), node.pseudo_index()) {
                            PushOutcome::Overflow => return Ok(WalkOutcome::Overflow),
                            PushOutcome::Ok | PushOutcome::Coalesced => {}
                        }
                        no = node.sibling();
                        continue;
                    }
                    if node.top_level() && !node.internal_top_level() {
                        no = node.sibling();
                        continue;
                    }
                }
                Mode::Primary | Mode::Ghosts => {
                    if node.child_type() == ChildType::Particle {
                        for &other in node.particles() {
                            if particles.is_garbage(other) {
                                continue;
                            }
                            if (1u32 << particles.type_id(other)) & iter.mask() == 0 {
                                continue;
                            }
                            let reach = if iter.symmetric() { particles.hsml(other).max(iter.hsml()) } else { iter.hsml() };
                            let Some((r2, dist)) = axis_distance(&query.position(), &particles.position(other), box_size, reach * reach) else {
                                continue;
                            };
                            iter.set_distance(r2.sqrt(), r2, dist);
                            iter.set_other(Some(other));
                            kernel.ngbiter(query, result, &mut iter);
                            ninteractions += 1;
                        }
                        no = node.sibling();
                        continue;
                    }
                    if node.child_type() == ChildType::Pseudo {
                        if lv.mode == Mode::Ghosts {
                            return Err(EngineError::PseudoNodeInGhostWalk { node: no });
                        }
                        no = node.sibling();
                        continue;
                    }
                }
            }
            no = node.first_child();
        }
    }

    lv.add_counters(ninteractions);
    Ok(WalkOutcome::Done(()))
}

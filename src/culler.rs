//! NodeCuller: the accept/reject test run against every node encountered during a descent.

use crate::geometry::{periodic_displacement, FACT1};
use crate::tree::TreeNode;
use nalgebra::Point3;

/// Returns `true` if the node might contain a relevant neighbour and should be opened (or, for a
/// leaf, accepted), `false` if the whole subtree can be skipped.
///
/// `hsml` is the query's own search radius; for a symmetric search the node's own `hmax` is also
/// considered, since a neighbour further away than `hsml` can still need to include the query if
/// the neighbour's own radius reaches back.
pub fn cull_node<N: TreeNode>(
    query_pos: &Point3<f64>,
    hsml: f64,
    symmetric: bool,
    node: &N,
    box_size: f64,
) -> bool {
    let half = node.len() * 0.5;
    let mut reach = if symmetric { node.hmax().max(hsml) } else { hsml } + half;

    let delta = periodic_displacement(&node.centre(), query_pos, box_size);
    if delta.x.abs() > reach || delta.y.abs() > reach || delta.z.abs() > reach {
        return false;
    }

    let r2 = delta.x * delta.x + delta.y * delta.y + delta.z * delta.z;
    reach += FACT1 * node.len();
    r2 <= reach * reach
}

//! WorkQueue: the compacted list of particle indices a phase is going to visit.

use crate::kernel::TreeWalkKernel;
use crate::particles::Particles;
use crate::thread_pool::Threads;
use std::borrow::Cow;

/// Builds the queue for one treewalk run.
///
/// `active_set` narrows the run to a caller-chosen subset (by local index); `None` means every
/// particle. When the kernel has no real filter ([`TreeWalkKernel::has_filter`] is `false`) and
/// there's no garbage to skip, the caller's slice is adopted verbatim with no scan at all.
pub fn build_queue<'a, P, K>(
    particles: &P,
    active_set: Option<&'a [usize]>,
    kernel: &K,
    may_have_garbage: bool,
    pool: &mut Threads,
) -> Cow<'a, [usize]>
where
    P: Particles,
    K: TreeWalkKernel,
{
    let size = active_set.map_or(particles.len(), |s| s.len());

    if !kernel.has_filter() && !may_have_garbage {
        return match active_set {
            Some(slice) => Cow::Borrowed(slice),
            None => Cow::Owned((0..size).collect()),
        };
    }

    if size == 0 {
        return Cow::Owned(Vec::new());
    }

    let n_threads = pool.num_threads().max(1);
    let per_thread: Vec<Vec<usize>> = if n_threads <= 1 {
        vec![scan_range(particles, active_set, kernel, 0, size)]
    } else {
        let chunk = size / n_threads + 1;
        let ranges: Vec<(usize, usize)> =
            (0..n_threads).map(|t| (t * chunk, ((t + 1) * chunk).min(size))).collect();
        pool.execute_with_args(ranges, |_tid, (start, end)| scan_range(particles, active_set, kernel, start, end))
            .join()
    };

    let mut queue = Vec::with_capacity(per_thread.iter().map(Vec::len).sum());
    for mut chunk in per_thread {
        queue.append(&mut chunk);
    }
    Cow::Owned(queue)
}

fn scan_range<P, K>(particles: &P, active_set: Option<&[usize]>, kernel: &K, start: usize, end: usize) -> Vec<usize>
where
    P: Particles,
    K: TreeWalkKernel,
{
    let mut out = Vec::new();
    for i in start..end {
        let p_i = active_set.map_or(i, |s| s[i]);
        if particles.is_garbage(p_i) {
            continue;
        }
        if kernel.has_filter() && !kernel.haswork(p_i) {
            continue;
        }
        out.push(p_i);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{Mode, NgbIter, TreeWalkKernel, TreeWalkQuery, TreeWalkResult};
    use nalgebra::{Point3, Vector3};

    struct FakeParticles {
        garbage: Vec<bool>,
    }
    impl Particles for FakeParticles {
        fn len(&self) -> usize {
            self.garbage.len()
        }
        fn position(&self, _i: usize) -> Point3<f64> {
            Point3::origin()
        }
        fn hsml(&self, _i: usize) -> f64 {
            1.0
        }
        fn type_id(&self, _i: usize) -> u8 {
            0
        }
        fn is_garbage(&self, i: usize) -> bool {
            self.garbage[i]
        }
        fn id(&self, i: usize) -> i64 {
            i as i64
        }
    }

    #[derive(Copy, Clone, Default)]
    struct Query;
    impl TreeWalkQuery for Query {
        fn position(&self) -> Point3<f64> {
            Point3::origin()
        }
        fn node_list(&self) -> [i64; 2] {
            [-1, -1]
        }
        fn set_node_list(&mut self, _n: [i64; 2]) {}
    }
    #[derive(Copy, Clone, Default)]
    struct Result;
    impl TreeWalkResult for Result {}
    #[derive(Default)]
    struct Iter;
    impl NgbIter for Iter {
        fn other(&self) -> Option<usize> {
            None
        }
        fn set_other(&mut self, _o: Option<usize>) {}
        fn hsml(&self) -> f64 {
            0.0
        }
        fn set_hsml(&mut self, _h: f64) {}
        fn mask(&self) -> u32 {
            1
        }
        fn set_mask(&mut self, _m: u32) {}
        fn symmetric(&self) -> bool {
            false
        }
        fn set_symmetric(&mut self, _s: bool) {}
        fn set_distance(&mut self, _r: f64, _r2: f64, _d: Vector3<f64>) {}
    }

    struct EvenOnlyKernel;
    impl TreeWalkKernel for EvenOnlyKernel {
        type Query = Query;
        type Result = Result;
        type Iter = Iter;
        fn fill(&self, _t: usize, _q: &mut Query) {}
        fn reduce(&self, _t: usize, _r: &Result, _m: Mode) {}
        fn haswork(&self, target: usize) -> bool {
            target % 2 == 0
        }
        fn ngbiter(&self, _q: &Query, _r: &mut Result, _i: &mut Iter) {}
    }

    struct NoFilterKernel;
    impl TreeWalkKernel for NoFilterKernel {
        type Query = Query;
        type Result = Result;
        type Iter = Iter;
        fn fill(&self, _t: usize, _q: &mut Query) {}
        fn reduce(&self, _t: usize, _r: &Result, _m: Mode) {}
        fn has_filter(&self) -> bool {
            false
        }
        fn ngbiter(&self, _q: &Query, _r: &mut Result, _i: &mut Iter) {}
    }

    #[test]
    fn filters_garbage_and_haswork() {
        let particles = FakeParticles { garbage: vec![false, false, true, false, false] };
        let mut pool = Threads::new(2);
        let queue = build_queue(&particles, None, &EvenOnlyKernel, true, &mut pool);
        assert_eq!(queue.into_owned(), vec![0, 4]);
    }

    #[test]
    fn adopts_active_set_verbatim_with_no_filter() {
        let particles = FakeParticles { garbage: vec![false, false, false] };
        let active = [2usize, 0, 1];
        let mut pool = Threads::new(2);
        let queue = build_queue(&particles, Some(&active), &NoFilterKernel, false, &mut pool);
        assert!(matches!(queue, Cow::Borrowed(_)));
        assert_eq!(&*queue, &active);
    }
}

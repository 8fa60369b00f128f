//! A shared atomic cursor used to hand out shrinking chunks of work to a fixed pool of threads.
//!
//! Each thread keeps its own `chunk` size, starting generous and halving once the remaining work
//! gets small enough that a thread finishing its current chunk might otherwise starve while
//! others still have a full chunk left. This is what lets [`crate::phases::toptree_phase`] retry
//! a target that overflowed the export buffer without redoing everything before it: the cursor
//! only ever moves forward, so a rollback just means the next `fetch_add` hands that target back
//! out again.

use std::sync::atomic::{AtomicUsize, Ordering};

pub struct ChunkCursor {
    cursor: AtomicUsize,
}

impl ChunkCursor {
    pub fn new(start: usize) -> Self {
        ChunkCursor { cursor: AtomicUsize::new(start) }
    }

    /// Reserves a run of `chunk` indices starting at the returned offset. The caller is
    /// responsible for clamping the end against the work size.
    pub fn fetch_add(&self, chunk: usize) -> usize {
        self.cursor.fetch_add(chunk, Ordering::SeqCst)
    }
}

/// The starting chunk size for `size` items of work spread across `n_threads` threads: small
/// enough that four rounds roughly cover the work, never smaller than one.
pub fn initial_chunk_size(size: usize, n_threads: usize) -> usize {
    let n_threads = n_threads.max(1);
    (size / (4 * n_threads)).max(1)
}

/// Halves `chunk` when the remaining work wouldn't keep every thread busy for one more round at
/// the current size, so the tail of the work gets finer-grained as threads start running out.
pub fn maybe_shrink(chunk: usize, remaining: usize, n_threads: usize) -> usize {
    if chunk >= 2 && remaining < chunk * n_threads {
        chunk / 2
    } else {
        chunk
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn cursor_hands_out_disjoint_ranges() {
        let cursor = Arc::new(ChunkCursor::new(0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let cursor = Arc::clone(&cursor);
            handles.push(std::thread::spawn(move || {
                let mut starts = Vec::new();
                for _ in 0..100 {
                    starts.push(cursor.fetch_add(3));
                }
                starts
            }));
        }
        let mut all: Vec<usize> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort_unstable();
        let expected: Vec<usize> = (0..400).map(|i| i * 3).collect();
        assert_eq!(all, expected);
    }

    #[test]
    fn shrinks_only_near_the_tail() {
        assert_eq!(maybe_shrink(16, 1000, 4), 16);
        assert_eq!(maybe_shrink(16, 10, 4), 8);
        assert_eq!(maybe_shrink(1, 0, 4), 1);
    }
}

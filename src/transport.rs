//! Transport: the messaging substrate the exchange step runs on.
//!
//! The original engine this is modeled on talks MPI; nothing in this crate's dependency stack
//! does, so the collectives it actually needs — an all-to-all of small counts, a sparse
//! all-to-all-v of byte payloads, and an all-reduce sum — are pulled out into this trait.
//! [`LocalTransport`] is the one concrete implementation: ranks are threads in the same process,
//! wired together with `crossbeam-channel` pairs instead of sockets, which is enough to exercise
//! the exchange and reduction logic end to end in tests.

use crossbeam_channel::{unbounded, Receiver, Sender};

pub const QUERY_TAG: usize = 0;
pub const RESULT_TAG: usize = 1;

pub trait Transport: Send + Sync {
    fn rank(&self) -> usize;
    fn num_ranks(&self) -> usize;

    /// `send_counts[to]` in, `recv_counts[from]` out — one scalar per peer, both directions.
    fn all_to_all_counts(&self, send_counts: &[usize]) -> Vec<usize>;

    fn all_reduce_sum(&self, value: u64) -> u64;

    /// A sparse all-to-all-v of `elsize`-byte records. Peers with a zero count on both sides do
    /// no communication at all. `send_offsets[to]` is the element offset (not byte offset) of
    /// that peer's slice within `send_buf`; the returned buffer lays peers out contiguously in
    /// rank order regardless of the order replies actually arrive in.
    fn all_to_all_v_sparse(
        &self,
        tag: usize,
        send_counts: &[usize],
        send_offsets: &[usize],
        send_buf: &[u8],
        recv_counts: &[usize],
        elsize: usize,
    ) -> Vec<u8>;
}

struct Pair<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
}

fn channel_matrix<T>(n: usize) -> Vec<Vec<Pair<T>>> {
    (0..n)
        .map(|_| {
            (0..n)
                .map(|_| {
                    let (tx, rx) = unbounded();
                    Pair { tx, rx }
                })
                .collect()
        })
        .collect()
}

pub struct LocalTransport {
    rank: usize,
    num_ranks: usize,
    query_tx: Vec<Sender<Vec<u8>>>,
    query_rx: Vec<Receiver<Vec<u8>>>,
    result_tx: Vec<Sender<Vec<u8>>>,
    result_rx: Vec<Receiver<Vec<u8>>>,
    count_tx: Vec<Sender<usize>>,
    count_rx: Vec<Receiver<usize>>,
    reduce_tx: Vec<Sender<u64>>,
    reduce_rx: Vec<Receiver<u64>>,
}

/// Builds one [`LocalTransport`] per simulated rank, fully cross-wired, for handing one to each
/// rank's own thread.
pub fn make_local_transports(num_ranks: usize) -> Vec<LocalTransport> {
    assert!(num_ranks > 0, "need at least one rank");

    let query_m = channel_matrix::<Vec<u8>>(num_ranks);
    let result_m = channel_matrix::<Vec<u8>>(num_ranks);
    let count_m = channel_matrix::<usize>(num_ranks);
    let reduce_m = channel_matrix::<u64>(num_ranks);

    (0..num_ranks)
        .map(|r| LocalTransport {
            rank: r,
            num_ranks,
            query_tx: (0..num_ranks).map(|to| query_m[r][to].tx.clone()).collect(),
            query_rx: (0..num_ranks).map(|from| query_m[from][r].rx.clone()).collect(),
            result_tx: (0..num_ranks).map(|to| result_m[r][to].tx.clone()).collect(),
            result_rx: (0..num_ranks).map(|from| result_m[from][r].rx.clone()).collect(),
            count_tx: (0..num_ranks).map(|to| count_m[r][to].tx.clone()).collect(),
            count_rx: (0..num_ranks).map(|from| count_m[from][r].rx.clone()).collect(),
            reduce_tx: (0..num_ranks).map(|to| reduce_m[r][to].tx.clone()).collect(),
            reduce_rx: (0..num_ranks).map(|from| reduce_m[from][r].rx.clone()).collect(),
        })
        .collect()
}

impl Transport for LocalTransport {
    fn rank(&self) -> usize {
        self.rank
    }

    fn num_ranks(&self) -> usize {
        self.num_ranks
    }

    fn all_to_all_counts(&self, send_counts: &[usize]) -> Vec<usize> {
        assert_eq!(send_counts.len(), self.num_ranks);
        for to in 0..self.num_ranks {
            if to != self.rank {
                self.count_tx[to].send(send_counts[to]).expect("count channel closed");
            }
        }
        let mut recv = vec![0usize; self.num_ranks];
        recv[self.rank] = send_counts[self.rank];
        for from in 0..self.num_ranks {
            if from != self.rank {
                recv[from] = self.count_rx[from].recv().expect("count channel closed");
            }
        }
        recv
    }

    fn all_reduce_sum(&self, value: u64) -> u64 {
        for to in 0..self.num_ranks {
            if to != self.rank {
                self.reduce_tx[to].send(value).expect("reduce channel closed");
            }
        }
        let mut sum = value;
        for from in 0..self.num_ranks {
            if from != self.rank {
                sum += self.reduce_rx[from].recv().expect("reduce channel closed");
            }
        }
        sum
    }

    fn all_to_all_v_sparse(
        &self,
        tag: usize,
        send_counts: &[usize],
        send_offsets: &[usize],
        send_buf: &[u8],
        recv_counts: &[usize],
        elsize: usize,
    ) -> Vec<u8> {
        let (tx, rx): (&[Sender<Vec<u8>>], &[Receiver<Vec<u8>>]) = match tag {
            QUERY_TAG => (&self.query_tx, &self.query_rx),
            RESULT_TAG => (&self.result_tx, &self.result_rx),
            other => panic!("unknown transport tag {other}"),
        };

        for to in 0..self.num_ranks {
            if to == self.rank || send_counts[to] == 0 {
                continue;
            }
            let start = send_offsets[to] * elsize;
            let end = start + send_counts[to] * elsize;
            tx[to].send(send_buf[start..end].to_vec()).expect("data channel closed");
        }

        let total_recv: usize = recv_counts.iter().sum();
        let mut recv_buf = vec![0u8; total_recv * elsize];
        let mut offset = 0usize;
        for from in 0..self.num_ranks {
            if recv_counts[from] == 0 {
                continue;
            }
            let len = recv_counts[from] * elsize;
            if from == self.rank {
                let start = send_offsets[self.rank] * elsize;
                recv_buf[offset..offset + len].copy_from_slice(&send_buf[start..start + len]);
            } else {
                let bytes = rx[from].recv().expect("data channel closed");
                recv_buf[offset..offset + len].copy_from_slice(&bytes);
            }
            offset += len;
        }
        recv_buf
    }
}

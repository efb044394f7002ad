//! Rank fan-out: keeping parallel worker ranks in lockstep with the rank
//! that owns socket I/O.
//!
//! Only one rank of an MPI-parallel EM solver talks to drivers. After that
//! rank obtains a response, every other rank must inject the identical
//! vector into its local field update, or the ranks silently diverge. The
//! hub takes a [`RankBroadcaster`] value at construction; a real MPI
//! binding implements the trait out-of-tree, [`SingleRank`] is the serial
//! default, and [`LocalCluster`] emulates a cluster in-process for tests.

use std::sync::mpsc::{Receiver, Sender};

use parking_lot::Mutex;
use tracing::error;

use crate::Vec3;

/// Role of this process within the parallel EM solver deployment. Fixed at
/// hub construction; there is no auto-detection or hidden global state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RankRole {
    /// Owns the listeners and all driver I/O.
    Master,
    /// Receives every per-step vector from the master.
    Worker,
}

/// Collective broadcast of per-step vectors across ranks.
///
/// Both calls are collective barriers: every rank must call them in the
/// same order, once per exchange, and no rank proceeds until all ranks hold
/// the master's value. The master passes its local vector and gets it back;
/// workers pass a placeholder and receive the master's bits.
pub trait RankBroadcaster: Send + Sync {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    /// Distribute the master's field sample before the driver exchange.
    /// Needed when the field is rank-local (decomposed domain); harmless
    /// when it is already globally identical.
    fn broadcast_field(&self, field: Vec3) -> Vec3;

    /// Distribute the master's response after the driver exchange. This is
    /// the correctness-critical call: skipping it corrupts the simulation
    /// through silent rank divergence.
    fn broadcast_response(&self, response: Vec3) -> Vec3;
}

/// The serial single-rank deployment: both broadcasts are the identity.
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleRank;

impl RankBroadcaster for SingleRank {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn broadcast_field(&self, field: Vec3) -> Vec3 {
        field
    }

    fn broadcast_response(&self, response: Vec3) -> Vec3 {
        response
    }
}

struct MasterLinks {
    to_workers: Vec<Sender<Vec3>>,
    acks: Mutex<Receiver<()>>,
}

struct WorkerLinks {
    from_master: Mutex<Receiver<Vec3>>,
    ack: Sender<()>,
}

/// Channel-backed broadcaster emulating a 1-master/N-worker topology inside
/// one process. Rank 0 is the master. Each collective is a send to every
/// worker followed by an ack barrier, so the ordering guarantee matches a
/// real MPI `Bcast`+`Barrier` pair.
pub struct LocalCluster {
    rank: usize,
    size: usize,
    master: Option<MasterLinks>,
    worker: Option<WorkerLinks>,
}

impl LocalCluster {
    /// Create a connected set of `size` broadcasters, index = rank.
    pub fn create(size: usize) -> Vec<LocalCluster> {
        assert!(size >= 1, "a cluster needs at least one rank");
        let (ack_tx, ack_rx) = std::sync::mpsc::channel();
        let mut to_workers = Vec::with_capacity(size - 1);
        let mut workers = Vec::with_capacity(size - 1);
        for rank in 1..size {
            let (tx, rx) = std::sync::mpsc::channel();
            to_workers.push(tx);
            workers.push(LocalCluster {
                rank,
                size,
                master: None,
                worker: Some(WorkerLinks {
                    from_master: Mutex::new(rx),
                    ack: ack_tx.clone(),
                }),
            });
        }
        let mut ranks = vec![LocalCluster {
            rank: 0,
            size,
            master: Some(MasterLinks {
                to_workers,
                acks: Mutex::new(ack_rx),
            }),
            worker: None,
        }];
        ranks.extend(workers);
        ranks
    }

    pub fn role(&self) -> RankRole {
        if self.rank == 0 {
            RankRole::Master
        } else {
            RankRole::Worker
        }
    }

    fn collective(&self, value: Vec3) -> Vec3 {
        if let Some(m) = &self.master {
            for tx in &m.to_workers {
                if tx.send(value).is_err() {
                    error!(rank = self.rank, "worker rank vanished during broadcast");
                }
            }
            let acks = m.acks.lock();
            for _ in 1..self.size {
                if acks.recv().is_err() {
                    error!(rank = self.rank, "ack channel torn during broadcast");
                    break;
                }
            }
            value
        } else if let Some(w) = &self.worker {
            let received = match w.from_master.lock().recv() {
                Ok(v) => v,
                Err(_) => {
                    error!(rank = self.rank, "master rank vanished during broadcast");
                    value
                }
            };
            let _ = w.ack.send(());
            received
        } else {
            value
        }
    }
}

impl RankBroadcaster for LocalCluster {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn broadcast_field(&self, field: Vec3) -> Vec3 {
        self.collective(field)
    }

    fn broadcast_response(&self, response: Vec3) -> Vec3 {
        self.collective(response)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_rank_identity() {
        let b = SingleRank;
        assert_eq!(b.rank(), 0);
        assert_eq!(b.size(), 1);
        assert_eq!(b.broadcast_field([1.0, 2.0, 3.0]), [1.0, 2.0, 3.0]);
        assert_eq!(b.broadcast_response([-1.0, 0.0, 5e-324]), [-1.0, 0.0, 5e-324]);
    }

    #[test]
    fn test_one_master_three_workers_bit_identical() {
        let mut ranks = LocalCluster::create(4);
        assert_eq!(ranks.len(), 4);
        let master = ranks.remove(0);
        assert_eq!(master.role(), RankRole::Master);

        let response: Vec3 = [1.0 / 3.0, -0.0, 5e-324];
        let workers: Vec<_> = ranks
            .into_iter()
            .map(|rank| {
                std::thread::spawn(move || {
                    assert_eq!(rank.role(), RankRole::Worker);
                    // Workers pass a placeholder and must receive the
                    // master's exact bits.
                    rank.broadcast_response([9.9, 9.9, 9.9])
                })
            })
            .collect();

        let master_view = master.broadcast_response(response);
        for handle in workers {
            let worker_view = handle.join().unwrap();
            for (a, b) in worker_view.iter().zip(master_view.iter()) {
                assert_eq!(a.to_bits(), b.to_bits());
            }
        }
    }

    #[test]
    fn test_field_then_response_sequence() {
        let mut ranks = LocalCluster::create(2);
        let worker = ranks.pop().unwrap();
        let master = ranks.pop().unwrap();

        let handle = std::thread::spawn(move || {
            let f = worker.broadcast_field([0.0; 3]);
            let r = worker.broadcast_response([0.0; 3]);
            (f, r)
        });

        let field = master.broadcast_field([0.0, 0.0, 1e-4]);
        let response = master.broadcast_response([0.0, 0.0, -2e-4]);
        let (wf, wr) = handle.join().unwrap();
        assert_eq!(wf, field);
        assert_eq!(wr, response);
    }
}

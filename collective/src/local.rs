use std::{num::NonZeroUsize, sync::Arc};

use log::debug;
use parking_lot::{Condvar, Mutex};

use crate::{Collective, CollectiveErr, Result};

/// In-process worker group backed by a reusable two-phase barrier.
///
/// Contributions are combined in ascending rank order regardless of arrival
/// order, so repeated rounds over the same inputs are bit-identical.
///
/// Each handle belongs to exactly one worker thread. Dropping a handle while
/// other workers still depend on it fails their pending and future calls with
/// `PeerLost` instead of deadlocking them.
pub struct LocalGroup {
    rank: usize,
    shared: Arc<Shared>,
}

struct Shared {
    world_size: usize,
    state: Mutex<Round>,
    cond: Condvar,
}

struct Round {
    /// One slot per rank, filled as workers arrive.
    contribs: Vec<Option<Vec<f32>>>,
    /// Combined result, present from "all arrived" until "all copied out".
    result: Option<Vec<f32>>,
    /// Workers that have copied the current result out.
    drained: usize,
    /// Live handles; a drop below `world_size` fails the group.
    alive: usize,
    /// Set once a fatal error was observed; the group is unusable afterwards.
    poisoned: bool,
}

impl Round {
    fn check_live(&self, world_size: usize) -> Result<()> {
        if self.poisoned {
            return Err(CollectiveErr::Poisoned);
        }

        if self.alive < world_size {
            return Err(CollectiveErr::PeerLost {
                alive: self.alive,
                world_size,
            });
        }

        Ok(())
    }
}

impl LocalGroup {
    /// Creates a connected group, one handle per rank.
    ///
    /// # Arguments
    /// * `world_size` - The fixed number of workers in the group.
    ///
    /// # Returns
    /// `world_size` handles, ordered by rank. The handle at index 0 is the
    /// only leader the group will ever have.
    pub fn group(world_size: NonZeroUsize) -> Vec<LocalGroup> {
        let world_size = world_size.get();

        let shared = Arc::new(Shared {
            world_size,
            state: Mutex::new(Round {
                contribs: (0..world_size).map(|_| None).collect(),
                result: None,
                drained: 0,
                alive: world_size,
                poisoned: false,
            }),
            cond: Condvar::new(),
        });

        debug!(world_size = world_size; "created in-process worker group");

        (0..world_size)
            .map(|rank| LocalGroup {
                rank,
                shared: Arc::clone(&shared),
            })
            .collect()
    }
}

impl Collective for LocalGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.shared.world_size
    }

    fn all_reduce_sum(&self, buf: &mut [f32]) -> Result<()> {
        let world_size = self.shared.world_size;
        let mut state = self.shared.state.lock();

        // Wait out the drain of the previous round. Drainers never block, so
        // this can only end with `result` cleared.
        while state.result.is_some() {
            self.shared.cond.wait(&mut state);
        }
        state.check_live(world_size)?;

        // The first contribution of a round fixes the expected length.
        if let Some(expected) = state.contribs.iter().flatten().map(Vec::len).next() {
            if expected != buf.len() {
                state.poisoned = true;
                self.shared.cond.notify_all();

                return Err(CollectiveErr::LengthMismatch {
                    rank: self.rank,
                    got: buf.len(),
                    expected,
                });
            }
        }

        debug_assert!(
            state.contribs[self.rank].is_none(),
            "a handle must not be shared across threads within one round"
        );
        state.contribs[self.rank] = Some(buf.to_vec());

        if state.contribs.iter().all(Option::is_some) {
            // Last to arrive: combine in ascending rank order and open the
            // drain phase, taking our own copy on the way out.
            let mut sum = vec![0.0; buf.len()];

            for contrib in state.contribs.iter_mut() {
                if let Some(contrib) = contrib.take() {
                    for (s, x) in sum.iter_mut().zip(&contrib) {
                        *s += x;
                    }
                }
            }

            buf.copy_from_slice(&sum);
            state.result = Some(sum);
            state.drained = 1;
            self.shared.cond.notify_all();
        } else {
            loop {
                if let Some(result) = state.result.as_ref() {
                    buf.copy_from_slice(result);
                    state.drained += 1;
                    break;
                }

                state.check_live(world_size)?;
                self.shared.cond.wait(&mut state);
            }
        }

        if state.drained == world_size {
            state.result = None;
            state.drained = 0;
            self.shared.cond.notify_all();
        }

        Ok(())
    }
}

impl Drop for LocalGroup {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.alive -= 1;
        self.shared.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use std::{num::NonZeroUsize, thread, time::Duration};

    use super::*;

    fn nz(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    #[test]
    fn a_single_worker_receives_its_own_contribution() {
        let mut group = LocalGroup::group(nz(1));
        let worker = group.pop().unwrap();

        let mut buf = [1.0, 2.0, 3.0];
        worker.all_reduce_sum(&mut buf).unwrap();

        assert_eq!(buf, [1.0, 2.0, 3.0]);
    }

    #[test]
    fn handles_are_ordered_by_rank_with_one_leader() {
        let group = LocalGroup::group(nz(4));

        for (i, worker) in group.iter().enumerate() {
            assert_eq!(worker.rank(), i);
            assert_eq!(worker.world_size(), 4);
            assert_eq!(worker.is_leader(), i == 0);
        }
    }

    #[test]
    fn every_worker_receives_the_group_sum() {
        let group = LocalGroup::group(nz(3));

        let handles: Vec<_> = group
            .into_iter()
            .map(|worker| {
                thread::spawn(move || {
                    let base = (worker.rank() + 1) as f32;
                    let mut buf = [base, 10.0 * base];
                    worker.all_reduce_sum(&mut buf).unwrap();
                    buf
                })
            })
            .collect();

        for handle in handles {
            let buf = handle.join().unwrap();
            assert_eq!(buf, [6.0, 60.0]);
        }
    }

    #[test]
    fn repeated_rounds_over_the_same_inputs_are_bit_identical() {
        // Values chosen so that summation order visibly matters in f32.
        let inputs = [0.1_f32, 0.2, 0.3, 1.0e-7];

        let run_round = || {
            let group = LocalGroup::group(nz(4));

            let handles: Vec<_> = group
                .into_iter()
                .map(|worker| {
                    let mut buf = [inputs[worker.rank()]];
                    thread::spawn(move || {
                        // Stagger arrivals so the combine order cannot depend
                        // on scheduling.
                        thread::sleep(Duration::from_millis(
                            (worker.rank() as u64 * 7) % 13,
                        ));
                        worker.all_reduce_sum(&mut buf).unwrap();
                        buf[0]
                    })
                })
                .collect();

            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .collect::<Vec<_>>()
        };

        let first = run_round();
        let second = run_round();

        assert_eq!(first[0].to_bits(), second[0].to_bits());
        for value in first.iter().chain(&second) {
            assert_eq!(value.to_bits(), first[0].to_bits());
        }
    }

    #[test]
    fn a_group_survives_back_to_back_rounds() {
        const ROUNDS: usize = 16;

        let group = LocalGroup::group(nz(2));

        let handles: Vec<_> = group
            .into_iter()
            .map(|worker| {
                thread::spawn(move || {
                    let mut sums = Vec::with_capacity(ROUNDS);

                    for round in 0..ROUNDS {
                        let mut buf = [(round * (worker.rank() + 1)) as f32];
                        worker.all_reduce_sum(&mut buf).unwrap();
                        sums.push(buf[0]);
                    }

                    sums
                })
            })
            .collect();

        let expected: Vec<_> = (0..ROUNDS).map(|round| (round * 3) as f32).collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), expected);
        }
    }

    #[test]
    fn a_length_mismatch_fails_the_whole_group() {
        let group = LocalGroup::group(nz(2));

        let handles: Vec<_> = group
            .into_iter()
            .map(|worker| {
                thread::spawn(move || {
                    let mut buf = vec![0.0; 2 + worker.rank()];
                    let first = worker.all_reduce_sum(&mut buf);
                    let second = worker.all_reduce_sum(&mut buf);
                    (first, second)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        // Whoever arrived second saw the mismatch, the other one the poison.
        assert!(results.iter().all(|(first, _)| first.is_err()));
        assert!(
            results.iter().any(|(first, _)| matches!(
                first,
                Err(CollectiveErr::LengthMismatch { .. })
            ))
        );

        // The group stays unusable afterwards.
        assert!(
            results
                .iter()
                .all(|(_, second)| matches!(second, Err(CollectiveErr::Poisoned)))
        );
    }

    #[test]
    fn a_dropped_handle_fails_the_group_immediately() {
        let mut group = LocalGroup::group(nz(2));
        drop(group.pop());

        let worker = group.pop().unwrap();
        let mut buf = [1.0];

        assert_eq!(
            worker.all_reduce_sum(&mut buf),
            Err(CollectiveErr::PeerLost {
                alive: 1,
                world_size: 2,
            })
        );
    }

    #[test]
    fn a_dropped_handle_wakes_a_blocked_worker() {
        let mut group = LocalGroup::group(nz(2));
        let lost = group.pop().unwrap();
        let worker = group.pop().unwrap();

        let handle = thread::spawn(move || {
            let mut buf = [1.0];
            worker.all_reduce_sum(&mut buf)
        });

        // Let the worker block waiting for its peer, then kill the peer.
        thread::sleep(Duration::from_millis(50));
        drop(lost);

        assert_eq!(
            handle.join().unwrap(),
            Err(CollectiveErr::PeerLost {
                alive: 1,
                world_size: 2,
            })
        );
    }
}

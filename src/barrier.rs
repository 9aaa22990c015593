use crate::active_messaging::Cmd;
use crate::warnings::RuntimeWarning;
use crate::world::WorldRT;

use parking_lot::Mutex;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// All-to-all barrier: on entering epoch `e` every member announces `e` to every other
/// member, and leaves once it has heard `e` from all of them. Announcements for later
/// epochs can arrive early and are simply counted under their own epoch.
pub(crate) struct Barrier {
    epoch: AtomicUsize,
    arrivals: Mutex<HashMap<usize, usize>>,
}

impl Barrier {
    pub(crate) fn new() -> Barrier {
        Barrier {
            epoch: AtomicUsize::new(0),
            arrivals: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn arrive(&self, epoch: usize) {
        *self.arrivals.lock().entry(epoch).or_insert(0) += 1;
    }

    fn try_complete(&self, epoch: usize, expected: usize) -> Option<()> {
        let mut arrivals = self.arrivals.lock();
        let cnt = arrivals.get(&epoch).copied().unwrap_or(0);
        if cnt >= expected {
            arrivals.remove(&epoch);
            Some(())
        } else {
            None
        }
    }

    pub(crate) fn barrier(&self, world: &WorldRT) {
        let num_pes = world.num_pes();
        if num_pes == 1 {
            return;
        }
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst);
        let my_pe = world.my_pe();
        for pe in (0..num_pes).filter(|pe| *pe != my_pe) {
            world.send(pe, Cmd::Barrier(epoch), vec![]);
        }
        world.scheduler().wait_for(RuntimeWarning::BarrierTimeout, || {
            self.try_complete(epoch, num_pes - 1)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn early_announcements_count_toward_their_own_epoch() {
        let barrier = Barrier::new();
        barrier.arrive(1);
        barrier.arrive(0);
        barrier.arrive(1);
        assert!(barrier.try_complete(0, 2).is_none());
        barrier.arrive(0);
        assert!(barrier.try_complete(0, 2).is_some());
        assert!(barrier.try_complete(1, 2).is_some());
        assert!(barrier.try_complete(1, 2).is_none());
    }
}

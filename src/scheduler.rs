use crate::active_messaging::Envelope;
use crate::config;
use crate::error::AbortSignal;
use crate::lamellae::{Lamellae, LamellaeComm, SerializedData};
use crate::warnings::RuntimeWarning;
use crate::world::WorldRT;
use crate::Error;

use futures::Future;
use parking_lot::{Mutex, RwLock};

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

/// Per-pe message pump. Every progress wait in the runtime (barrier, broadcast, get,
/// wait_all, block_on) funnels through [Scheduler::wait_for], which keeps dequeuing and
/// dispatching inbox messages until its condition holds.
pub(crate) struct Scheduler {
    lamellae: Arc<Lamellae>,
    worlds: RwLock<HashMap<u64, Weak<WorldRT>>>,
    // messages for worlds this pe has not created yet
    pending: Mutex<HashMap<u64, Vec<Envelope>>>,
    // worlds this pe already dropped, late messages for them are discarded
    retired: Mutex<HashSet<u64>>,
    poll_interval: Duration,
}

impl Scheduler {
    pub(crate) fn new(lamellae: Arc<Lamellae>) -> Scheduler {
        Scheduler {
            lamellae,
            worlds: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            retired: Mutex::new(HashSet::new()),
            poll_interval: Duration::from_micros(config().progress_poll_us),
        }
    }

    pub(crate) fn lamellae(&self) -> &Arc<Lamellae> {
        &self.lamellae
    }

    /// Makes `world` addressable and replays anything that arrived for it early
    pub(crate) fn register_world(&self, world: &Arc<WorldRT>) {
        self.worlds
            .write()
            .insert(world.id(), Arc::downgrade(world));
        let pending = self.pending.lock().remove(&world.id());
        if let Some(msgs) = pending {
            tracing::debug!(
                world = world.id(),
                cnt = msgs.len(),
                "replaying messages for newly registered world"
            );
            for msg in msgs {
                WorldRT::process_msg(world, msg);
            }
        }
    }

    /// Forgets a world whose last handle on this pe was dropped
    pub(crate) fn retire_world(&self, world_id: u64) {
        self.worlds.write().remove(&world_id);
        self.pending.lock().remove(&world_id);
        self.retired.lock().insert(world_id);
    }

    fn dispatch(&self, data: SerializedData) {
        let msg: Envelope = match crate::deserialize(data.as_bytes()) {
            Ok(msg) => msg,
            Err(e) => self.abort(Error::Serialization(format!(
                "unable to decode message envelope: {e}"
            ))),
        };
        let world = self.worlds.read().get(&msg.world_id).map(Weak::upgrade);
        match world {
            Some(Some(world)) => WorldRT::process_msg(&world, msg),
            Some(None) => {
                self.retire_world(msg.world_id);
                tracing::trace!(world = msg.world_id, "dropping message for a destroyed world");
            }
            None if self.retired.lock().contains(&msg.world_id) => {
                tracing::trace!(world = msg.world_id, "dropping message for a destroyed world");
            }
            None => {
                self.pending.lock().entry(msg.world_id).or_default().push(msg);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn num_tracked(&self) -> (usize, usize) {
        (self.worlds.read().len(), self.pending.lock().len())
    }

    /// Processes at most one message, returns false if the inbox was empty
    pub(crate) fn exec_task(&self) -> bool {
        match self.lamellae.try_recv() {
            Some(data) => {
                self.dispatch(data);
                true
            }
            None => false,
        }
    }

    fn exec_task_timeout(&self) -> bool {
        match self.lamellae.recv_timeout(self.poll_interval) {
            Some(data) => {
                self.dispatch(data);
                true
            }
            None => false,
        }
    }

    /// Unwinds this pe if any pe of the universe raised the abort signal
    pub(crate) fn check_abort(&self) {
        if let Some(reason) = self.lamellae.abort_reason() {
            std::panic::resume_unwind(Box::new(AbortSignal(reason)));
        }
    }

    pub(crate) fn abort(&self, err: Error) -> ! {
        let reason = err.to_string();
        tracing::error!(pe = self.lamellae.my_pe(), %reason, "aborting universe");
        self.lamellae.abort(&reason);
        std::panic::resume_unwind(Box::new(AbortSignal(reason)))
    }

    /// Services messages until `poll` yields a value
    pub(crate) fn wait_for<R>(
        &self,
        warning: impl Fn(f64) -> RuntimeWarning<'static>,
        mut poll: impl FnMut() -> Option<R>,
    ) -> R {
        let mut start = Instant::now();
        loop {
            if let Some(res) = poll() {
                return res;
            }
            self.check_abort();
            if !self.exec_task() {
                self.exec_task_timeout();
            }
            let elapsed = start.elapsed().as_secs_f64();
            if elapsed > config().deadlock_timeout {
                warning(elapsed).print();
                start = Instant::now();
            }
        }
    }

    pub(crate) fn block_on<F: Future>(&self, f: F) -> F::Output {
        let mut f = std::pin::pin!(f);
        let mut cx = Context::from_waker(futures::task::noop_waker_ref());
        self.wait_for(
            |elapsed| RuntimeWarning::BlockingWait("block_on", elapsed),
            || match f.as_mut().poll(&mut cx) {
                Poll::Ready(val) => Some(val),
                Poll::Pending => None,
            },
        )
    }
}

//! A backlog of [MacroTask]s owned by universe rank 0 and drained region by region.
//!
//! Every region repeats the same cycle until the backlog is exhausted: its root pops the
//! smallest key from rank 0, broadcasts the result to the region, every member executes the
//! task, and the region barriers before the next pop. Regions never coordinate with each
//! other; each one drains until it receives the empty sentinel.

use crate::active_messaging::{ActiveMessage, ActiveMessaging, AmContext};
use crate::config;
use crate::container::{ContainerRT, MasterPmap, WorldContainer};
use crate::partition::{create_regions, region_of};
use crate::rt_am;
use crate::task::{MacroTask, TaskSlot};
use crate::world::World;
use crate::world_object::ObjectId;
use crate::{AmHandle, Error};

use parking_lot::Mutex;
use serde_bytes::ByteBuf;

use std::sync::atomic::{AtomicI64, Ordering};

/// Task keys are `local_counter * KEY_STRIDE + submitter_rank`, unique as long as the
/// universe has fewer than `KEY_STRIDE` ranks
pub const KEY_STRIDE: i64 = 1 << 20;

/// Lifecycle of a queue as seen by one region
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    /// accepting tasks, `run_all` not called yet
    Init,
    /// `run_all` in progress
    Distributing,
    /// this region received the empty sentinel
    Drained,
}

/// What one rank did during a `run_all`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunStats {
    /// index of the region the rank belongs to
    pub region: usize,
    /// tasks this rank executed (identical for every member of a region)
    pub tasks_executed: usize,
}

#[derive(serde::Serialize, serde::Deserialize, Debug, Clone)]
struct PopTask {
    tasks: ObjectId,
}

#[rt_am]
impl ActiveMessage for PopTask {
    type Output = TaskSlot<(i64, ByteBuf)>;
    fn exec(self, ctx: &AmContext) -> TaskSlot<(i64, ByteBuf)> {
        let backlog = ctx
            .world()
            .object::<ContainerRT>(self.tasks)
            .unwrap_or_else(|e| ctx.world().abort(e));
        match backlog.pop_first(config().pop_retry_limit) {
            Ok(popped) => TaskSlot::from(popped).map(|(key, task)| (key, ByteBuf::from(task))),
            Err(e) => ctx.world().abort(e),
        }
    }
}

/// The regional task queue.
///
/// # Examples
///```ignore
/// let queue = RegionalTaskQueue::new(&universe, 3);
/// if universe.my_pe() == 0 {
///     for i in 0..20 {
///         queue.add_task(MyTask::new(i));
///     }
/// }
/// let stats = queue.run_all();
/// assert_eq!(queue.size(), 0);
///```
pub struct RegionalTaskQueue<T: MacroTask> {
    universe: World,
    region: World,
    num_regions: usize,
    tasks: WorldContainer<T>,
    local_cnt: AtomicI64,
    state: Mutex<QueueState>,
}

impl<T: MacroTask> RegionalTaskQueue<T> {
    /// Collective over `universe`: partitions it into `num_regions` round-robin regions and
    /// creates the backlog on rank 0. An invalid region count aborts the universe.
    #[tracing::instrument(skip(universe))]
    pub fn new(universe: &World, num_regions: usize) -> RegionalTaskQueue<T> {
        if universe.num_pes() as i64 >= KEY_STRIDE {
            universe.abort(Error::FatalConfiguration(format!(
                "task keys support at most {} ranks",
                KEY_STRIDE - 1
            )));
        }
        let region = create_regions(universe, num_regions).unwrap_or_else(|e| universe.abort(e));
        let tasks = WorldContainer::new(universe, MasterPmap);
        RegionalTaskQueue {
            universe: universe.clone(),
            region,
            num_regions,
            tasks,
            local_cnt: AtomicI64::new(0),
            state: Mutex::new(QueueState::Init),
        }
    }

    /// Submits `task` to the backlog; any rank may submit. The key orders tasks by
    /// submission round, then by submitter.
    pub fn add_task(&self, task: T) -> AmHandle<()> {
        let key =
            self.local_cnt.fetch_add(1, Ordering::SeqCst) * KEY_STRIDE + self.universe.my_pe() as i64;
        tracing::trace!(key, "adding task");
        self.tasks.insert(key, task)
    }

    fn pop_raw(&self) -> TaskSlot<(i64, ByteBuf)> {
        self.universe
            .exec_am_pe(0, PopTask { tasks: self.tasks.id() })
            .get()
    }

    fn decode(&self, bytes: &[u8]) -> T {
        crate::deserialize(bytes).unwrap_or_else(|e| {
            self.universe.abort(Error::Serialization(format!(
                "backlog entry is not a {}: {}",
                std::any::type_name::<T>(),
                e
            )))
        })
    }

    /// Removes the task with the smallest key from the backlog, or returns the empty
    /// sentinel. Blocking and not collective.
    pub fn pop(&self) -> TaskSlot<T> {
        self.pop_raw().map(|(_, bytes)| self.decode(&bytes))
    }

    /// Collective over the universe: drains the backlog.
    ///
    /// Starts and ends with a universe fence, so every `add_task` issued before the call is
    /// in the backlog and every task has completed when it returns.
    #[tracing::instrument(skip_all)]
    pub fn run_all(&self) -> RunStats {
        self.universe.fence();
        *self.state.lock() = QueueState::Distributing;
        let region_idx = self.region_index();
        let mut tasks_executed = 0;
        loop {
            let mut slot = TaskSlot::Empty;
            if self.region.my_pe() == 0 {
                slot = self.pop_raw();
            }
            self.region.broadcast(&mut slot, 0);
            let (key, bytes) = match slot {
                TaskSlot::Task(popped) => popped,
                TaskSlot::Empty => break,
            };
            let mut task = self.decode(&bytes);
            tracing::debug!(key, region = region_idx, "executing task");
            if let Err(e) = self.execute(&mut task) {
                self.universe
                    .abort(Error::Task(format!("task {} failed: {:#}", key, e)));
            }
            tasks_executed += 1;
            self.region.barrier();
        }
        *self.state.lock() = QueueState::Drained;
        tracing::debug!(region = region_idx, tasks_executed, "region drained");
        self.universe.fence();
        RunStats {
            region: region_idx,
            tasks_executed,
        }
    }

    fn execute(&self, task: &mut T) -> anyhow::Result<()> {
        task.copy_data_in(&self.universe, &self.region)?;
        task.run(&self.region)?;
        task.copy_data_back(&self.universe, &self.region)
    }

    /// Number of tasks left in the backlog (asks rank 0)
    pub fn size(&self) -> usize {
        self.tasks.len_on(0).get()
    }

    /// Where the calling rank's region is in the queue lifecycle
    pub fn state(&self) -> QueueState {
        *self.state.lock()
    }

    /// The regional world of the calling rank
    pub fn region(&self) -> &World {
        &self.region
    }

    /// Index of the calling rank's region
    pub fn region_index(&self) -> usize {
        region_of(self.universe.my_pe(), self.num_regions)
    }

    /// Number of regions the universe was partitioned into
    pub fn num_regions(&self) -> usize {
        self.num_regions
    }

    /// The universe world the queue was created on
    pub fn universe(&self) -> &World {
        &self.universe
    }
}

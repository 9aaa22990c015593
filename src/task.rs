//! The unit of work drained by a [RegionalTaskQueue][crate::RegionalTaskQueue].

use crate::active_messaging::AmDist;
use crate::world::World;

/// A collectively executed unit of work.
///
/// A task is submitted on any universe rank, serialized into the queue backlog, popped by a
/// region root and broadcast so every member of the region holds an identical copy. Every
/// member then runs the three hooks in order:
///
/// 1. `copy_data_in`: move inputs from the universe namespace into the region
///    (see [archive::localize][crate::archive::localize])
/// 2. `run`: the computation proper, collective over `region`
/// 3. `copy_data_back`: publish results back to the universe
///    (see [archive::publish][crate::archive::publish])
///
/// A hook returning an error aborts the whole universe.
///
/// # Examples
///```ignore
/// #[regionq::AmData(Debug, Clone)]
/// struct Sum {
///     id: i64,
///     terms: Vec<u64>,
///     result: u64,
/// }
///
/// impl MacroTask for Sum {
///     fn run(&mut self, region: &World) -> anyhow::Result<()> {
///         self.result = self.terms.iter().sum();
///         region.barrier();
///         Ok(())
///     }
/// }
///```
pub trait MacroTask: AmDist + Clone {
    /// The computation, executed identically by every member of `region`
    fn run(&mut self, region: &World) -> anyhow::Result<()>;

    fn copy_data_in(&mut self, _universe: &World, _region: &World) -> anyhow::Result<()> {
        Ok(())
    }

    fn copy_data_back(&mut self, _universe: &World, _region: &World) -> anyhow::Result<()> {
        Ok(())
    }
}

/// A backlog slot as seen by a region: either a task or the "no more work" sentinel
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum TaskSlot<T> {
    /// No more work
    Empty,
    Task(T),
}

impl<T> Default for TaskSlot<T> {
    fn default() -> Self {
        TaskSlot::Empty
    }
}

impl<T> TaskSlot<T> {
    pub fn is_empty(&self) -> bool {
        matches!(self, TaskSlot::Empty)
    }

    pub fn into_task(self) -> Option<T> {
        match self {
            TaskSlot::Empty => None,
            TaskSlot::Task(task) => Some(task),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> TaskSlot<U> {
        match self {
            TaskSlot::Empty => TaskSlot::Empty,
            TaskSlot::Task(task) => TaskSlot::Task(f(task)),
        }
    }
}

impl<T> From<Option<T>> for TaskSlot<T> {
    fn from(task: Option<T>) -> Self {
        match task {
            Some(task) => TaskSlot::Task(task),
            None => TaskSlot::Empty,
        }
    }
}

//! regionq is a small SPMD task-scheduling runtime: it partitions a universe of
//! cooperating PEs (processing elements, roughly MPI ranks) into disjoint regional
//! worlds, lets any PE invoke an operation on the PE that owns some data and receive
//! the result through a single-assignment handle, and drains a centrally owned
//! backlog of tasks with one regional world per task at a time.
//!
//! The pieces, from the bottom up:
//! - a fabric ("lamellae") moving serialized messages between PEs, see [Backend]
//! - [World]s, each a communication domain with its own barrier, broadcast and
//!   active-message namespace
//! - [active messages][ActiveMessage], executed on the owner and answered through an [AmHandle]
//! - the [WorldContainer], a key/value map sharded by a [Pmap]
//! - the [RegionalTaskQueue] and the [MacroTask] lifecycle (localize, run, publish)
//!
//! EXAMPLES
//! --------
//!
//! # Launching a universe and invoking a remote operation
//! ```ignore
//! use regionq::{ActiveMessage, ActiveMessaging, AmContext, Backend, WorldBuilder};
//!
//! #[regionq::AmData(Debug, Clone)]
//! struct WhoAmI {}
//!
//! #[regionq::am]
//! impl ActiveMessage for WhoAmI {
//!     type Output = usize;
//!     fn exec(self, ctx: &AmContext) -> usize {
//!         ctx.my_pe()
//!     }
//! }
//!
//! let results = WorldBuilder::new()
//!     .with_lamellae(Backend::Threads)
//!     .with_num_pes(4)
//!     .launch(|world| {
//!         let last = world.num_pes() - 1;
//!         world.exec_am_pe(last, WhoAmI {}).get()
//!     })
//!     .unwrap();
//! assert_eq!(results, vec![3, 3, 3, 3]);
//! ```
//!
//! # Draining a regional task queue
//! ```ignore
//! let queue = RegionalTaskQueue::new(&universe, 3);
//! if universe.my_pe() == 0 {
//!     for i in 0..20 {
//!         queue.add_task(MyTask::new(i));
//!     }
//! }
//! let stats = queue.run_all();
//! ```

#[macro_use]
extern crate lazy_static;
#[doc(hidden)]
pub extern crate serde;

#[doc(hidden)]
pub extern crate tracing;

pub mod active_messaging;
pub use active_messaging::{ActiveMessage, ActiveMessaging, AmContext, AmDist};
pub use active_messaging::handle::{AmHandle, MultiAmHandle};
pub mod archive;
mod arch;
mod barrier;
pub mod container;
pub use container::{DefaultPmap, MasterPmap, Pmap, WorldContainer};
mod env_var;
pub use env_var::config;
mod error;
pub use error::Error;
mod lamellae;
pub mod partition;
mod request;
mod scheduler;
pub mod task;
pub use task::{MacroTask, TaskSlot};
pub mod taskq;
pub use taskq::{QueueState, RegionalTaskQueue, RunStats};
mod warnings;
mod world;
pub use world::{World, WorldBuilder, WorldEnv};
mod world_object;
pub use world_object::ObjectId;

pub use crate::arch::{GlobalArch, IdError, StridedArch, WorldArch};
pub use crate::lamellae::Backend;

/// Registers an active message, see [ActiveMessage].
pub use regionq_impl::am;

/// Derives serde's `Serialize`/`Deserialize` through regionq's re-export, plus any listed traits.
pub use regionq_impl::AmData;

#[doc(hidden)]
pub use inventory;

pub(crate) use regionq_impl::rt_am;

#[doc(hidden)]
pub fn serialize<T: ?Sized>(obj: &T) -> Result<Vec<u8>, anyhow::Error>
where
    T: serde::Serialize,
{
    Ok(bincode::serialize(obj)?)
}

#[doc(hidden)]
pub fn serialized_size<T: ?Sized>(obj: &T) -> Result<usize, anyhow::Error>
where
    T: serde::Serialize,
{
    Ok(bincode::serialized_size(obj)? as usize)
}

#[doc(hidden)]
pub fn deserialize<'a, T>(bytes: &'a [u8]) -> Result<T, anyhow::Error>
where
    T: serde::Deserialize<'a>,
{
    Ok(bincode::deserialize(bytes)?)
}

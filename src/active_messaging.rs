use crate::world::World;
use crate::{Error, WorldEnv};

use futures::Future;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

pub(crate) mod handle;
use handle::{AmHandle, MultiAmHandle};

pub trait SyncSend: Sync + Send {}

impl<T: Sync + Send> SyncSend for T {}

/// Anything that can be moved between PEs
pub trait AmDist: serde::ser::Serialize + serde::de::DeserializeOwned + SyncSend + 'static {}

impl<T: serde::ser::Serialize + serde::de::DeserializeOwned + SyncSend + 'static> AmDist for T {}

/// An operation that can be invoked on the PE that owns some data.
///
/// Types implementing this trait are registered with [`#[regionq::am]`][crate::am] and their
/// fields with [`#[regionq::AmData]`][crate::AmData]. `exec` runs on the target PE as soon as
/// the message is dequeued there, and its return value travels back to the caller.
///
/// # Examples
///```ignore
/// use regionq::{ActiveMessage, AmContext};
///
/// #[regionq::AmData(Debug, Clone)]
/// struct Add {
///     a: u64,
///     b: u64,
/// }
///
/// #[regionq::am]
/// impl ActiveMessage for Add {
///     type Output = u64;
///     fn exec(self, _ctx: &AmContext) -> u64 {
///         self.a + self.b
///     }
/// }
///```
pub trait ActiveMessage: AmDist {
    type Output: AmDist + Clone;
    fn exec(self, ctx: &AmContext) -> Self::Output;
}

#[doc(hidden)]
pub trait RemoteActiveMessage: ActiveMessage {
    const AM_NAME: &'static str;
}

/// The execution environment of an active message: the world it was sent on and the sender
pub struct AmContext {
    world: World,
    src: usize,
}

impl AmContext {
    pub(crate) fn new(world: World, src: usize) -> AmContext {
        AmContext { world, src }
    }
    /// The world the message was sent on
    pub fn world(&self) -> &World {
        &self.world
    }
    /// The world pe id of the sender
    pub fn src(&self) -> usize {
        self.src
    }
    /// The world pe id executing the message
    pub fn my_pe(&self) -> usize {
        self.world.my_pe()
    }
    pub fn num_pes(&self) -> usize {
        self.world.num_pes()
    }
}

impl WorldEnv for AmContext {
    fn my_pe(&self) -> usize {
        self.world.my_pe()
    }
    fn num_pes(&self) -> usize {
        self.world.num_pes()
    }
    fn world_id(&self) -> u64 {
        self.world.id()
    }
}

pub(crate) type AmId = u32;
pub(crate) const AM_ID_START: AmId = 1;
pub(crate) type ReqId = usize;

pub(crate) type UnpackFn = fn(&[u8], &AmContext) -> Result<Vec<u8>, anyhow::Error>;

#[doc(hidden)]
pub fn exec_am<T: RemoteActiveMessage>(
    data: &[u8],
    ctx: &AmContext,
) -> Result<Vec<u8>, anyhow::Error> {
    let am: T = crate::deserialize(data)?;
    crate::serialize(&am.exec(ctx))
}

#[doc(hidden)]
pub struct RegisteredAm {
    pub exec: UnpackFn,
    pub name: &'static str,
}
crate::inventory::collect!(RegisteredAm);

lazy_static! {
    pub(crate) static ref AMS_IDS: HashMap<&'static str, AmId> = {
        let mut ams = vec![];
        for am in crate::inventory::iter::<RegisteredAm> {
            ams.push(am.name);
        }
        ams.sort();
        let mut cnt = AM_ID_START;
        let mut temp = HashMap::new();
        let mut duplicates = vec![];
        for am in ams {
            if !temp.contains_key(&am) {
                temp.insert(am, cnt);
                cnt += 1;
            } else {
                duplicates.push(am);
            }
        }
        if !duplicates.is_empty() {
            panic!(
                "duplicate registered active message {:?}, AMs must have unique names",
                duplicates
            );
        }
        temp
    };
}

lazy_static! {
    pub(crate) static ref AMS_EXECS: HashMap<AmId, UnpackFn> = {
        let mut temp = HashMap::new();
        for exec in crate::inventory::iter::<RegisteredAm> {
            if let Some(id) = AMS_IDS.get(&exec.name) {
                temp.insert(*id, exec.exec);
            }
        }
        temp
    };
}

pub(crate) fn am_id<T: RemoteActiveMessage>() -> Result<AmId, Error> {
    AMS_IDS.get(T::AM_NAME).copied().ok_or_else(|| {
        Error::RemoteInvocation(format!(
            "{} is not registered, annotate its ActiveMessage impl with #[regionq::am]",
            T::AM_NAME
        ))
    })
}

#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AmHeader {
    pub(crate) am_id: AmId,
    pub(crate) req_id: ReqId,
}

#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DataHeader {
    pub(crate) req_id: ReqId,
}

#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Cmd {
    Am(AmHeader),     //a single am request
    Data(DataHeader), //the serialized result of an am
    Barrier(usize),   //barrier announcement for an epoch
    Bcast(usize),     //broadcast payload for a sequence number
    Release(u64),     //the sender dropped its last handle to a distributed object
}

/// What the fabric actually carries. `src` is the sender's universe rank.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone)]
pub(crate) struct Envelope {
    pub(crate) world_id: u64,
    pub(crate) src: usize,
    pub(crate) cmd: Cmd,
    #[serde(with = "serde_bytes")]
    pub(crate) data: Vec<u8>,
}

#[derive(Debug)]
pub(crate) struct AMCounters {
    pub(crate) outstanding_reqs: AtomicUsize,
    pub(crate) send_req_cnt: AtomicUsize,
}

impl AMCounters {
    pub(crate) fn new() -> AMCounters {
        AMCounters {
            outstanding_reqs: AtomicUsize::new(0),
            send_req_cnt: AtomicUsize::new(0),
        }
    }
    pub(crate) fn add_send_req(&self, num: usize) {
        self.outstanding_reqs.fetch_add(num, Ordering::SeqCst);
        self.send_req_cnt.fetch_add(num, Ordering::SeqCst);
    }
    pub(crate) fn complete_req(&self) {
        self.outstanding_reqs.fetch_sub(1, Ordering::SeqCst);
    }
    pub(crate) fn outstanding(&self) -> usize {
        self.outstanding_reqs.load(Ordering::SeqCst)
    }
}

pub trait ActiveMessaging {
    /// launch and execute an active message on every PE of the world (including the calling PE).
    ///
    /// The calling PE executes its copy inline, every other PE receives a message.
    /// The returned handle collects the results indexed by world pe id.
    ///
    /// # Examples
    ///```ignore
    /// let results = world.exec_am_all(WhoAmI {}).get();
    /// for i in 0..world.num_pes() {
    ///     assert_eq!(i, results[i]);
    /// }
    ///```
    fn exec_am_all<F>(&self, am: F) -> MultiAmHandle<F::Output>
    where
        F: RemoteActiveMessage;

    /// launch and execute an active message on a specifc PE.
    ///
    /// If `pe` is the calling PE the message executes immediately, no message is sent and the
    /// returned handle is already resolved. Otherwise the handle resolves once the reply arrives.
    /// Active messages are not lazy, the handle only retrieves the result.
    ///
    /// # Examples
    ///```ignore
    /// let request = world.exec_am_pe(world.num_pes() - 1, WhoAmI {});
    /// assert_eq!(world.num_pes() - 1, request.get());
    ///```
    fn exec_am_pe<F>(&self, pe: usize, am: F) -> AmHandle<F::Output>
    where
        F: RemoteActiveMessage;

    /// blocks calling thread until all remote requests initiated by the calling PE on this world have been answered.
    ///
    /// Note: this is not a distributed synchronization primitive (i.e. it has no knowledge of a Remote PEs requests)
    fn wait_all(&self);

    /// Global synchronization method which blocks calling thread until all PEs in the world have entered
    fn barrier(&self);

    /// Run a future to completion on the calling thread, servicing incoming messages while it is pending
    fn block_on<F: Future>(&self, f: F) -> F::Output;
}

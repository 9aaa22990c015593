use crate::active_messaging::handle::{AmHandle, MultiAmHandle};
use crate::active_messaging::{
    am_id, ActiveMessage, ActiveMessaging, AmContext, AmDist, AmHeader, Cmd, DataHeader, Envelope,
    RemoteActiveMessage, AMS_EXECS,
};
use crate::arch::{ArchRT, IdError, WorldArch};
use crate::barrier::Barrier;
use crate::config;
use crate::error::AbortSignal;
use crate::lamellae::{Backend, Lamellae, LamellaeBuilder, LamellaeComm, LamellaeInit, SerializedData};
use crate::request::RequestTable;
use crate::scheduler::Scheduler;
use crate::warnings::RuntimeWarning;
use crate::world_object::{ObjectId, ObjectRegistry};
use crate::Error;

use futures::Future;
use parking_lot::Mutex;

use std::any::Any;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Read-only facts about the world a piece of code executes in
pub trait WorldEnv {
    /// The calling PE's id within the world
    fn my_pe(&self) -> usize;
    /// The number of PEs in the world
    fn num_pes(&self) -> usize;
    /// The world's id, identical on every member
    fn world_id(&self) -> u64;
}

pub(crate) struct WorldRT {
    id: u64,
    my_pe: usize,
    universe_pe: usize,
    arch: Arc<ArchRT>,
    scheduler: Arc<Scheduler>,
    lamellae: Arc<Lamellae>,
    requests: RequestTable,
    barrier: Barrier,
    bcast_cnt: AtomicUsize,
    bcasts: Mutex<HashMap<usize, Vec<u8>>>,
    objects: ObjectRegistry,
    sub_cnt: AtomicU64,
    archive_round: AtomicUsize,
}

impl std::fmt::Debug for WorldRT {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "WorldRT {{ id: {:x}, pe: {}/{}, universe_pe: {}, objects: {} }}",
            self.id,
            self.my_pe,
            self.arch.num_pes(),
            self.universe_pe,
            self.objects.len()
        )
    }
}

impl WorldRT {
    fn new(
        id: u64,
        arch: Arc<ArchRT>,
        scheduler: Arc<Scheduler>,
    ) -> Result<Arc<WorldRT>, Error> {
        let lamellae = scheduler.lamellae().clone();
        let universe_pe = lamellae.my_pe();
        let my_pe = arch.world_pe(universe_pe)?;
        let world = Arc::new(WorldRT {
            id,
            my_pe,
            universe_pe,
            arch,
            scheduler: scheduler.clone(),
            lamellae,
            requests: RequestTable::new(),
            barrier: Barrier::new(),
            bcast_cnt: AtomicUsize::new(0),
            bcasts: Mutex::new(HashMap::new()),
            objects: ObjectRegistry::new(),
            sub_cnt: AtomicU64::new(0),
            archive_round: AtomicUsize::new(0),
        });
        scheduler.register_world(&world);
        Ok(world)
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }
    pub(crate) fn my_pe(&self) -> usize {
        self.my_pe
    }
    pub(crate) fn num_pes(&self) -> usize {
        self.arch.num_pes()
    }
    pub(crate) fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    fn abort(&self, err: Error) -> ! {
        self.scheduler.abort(err)
    }

    fn try_send_universe(&self, universe_pe: usize, cmd: Cmd, data: Vec<u8>) -> Result<(), Error> {
        let msg = Envelope {
            world_id: self.id,
            src: self.universe_pe,
            cmd,
            data,
        };
        let bytes = crate::serialize(&msg).map_err(|e| Error::Serialization(e.to_string()))?;
        self.lamellae.send_to_pe(universe_pe, SerializedData(bytes))
    }

    fn send_universe(&self, universe_pe: usize, cmd: Cmd, data: Vec<u8>) {
        if let Err(e) = self.try_send_universe(universe_pe, cmd, data) {
            self.abort(e);
        }
    }

    /// Sends to a member, addressed by world pe id
    pub(crate) fn send(&self, pe: usize, cmd: Cmd, data: Vec<u8>) {
        if let Err(e) = self.try_send(pe, cmd, data) {
            self.abort(e);
        }
    }

    pub(crate) fn try_send(&self, pe: usize, cmd: Cmd, data: Vec<u8>) -> Result<(), Error> {
        let universe_pe = self.arch.universe_pe(pe)?;
        self.try_send_universe(universe_pe, cmd, data)
    }

    fn release_object(&self, id: ObjectId) {
        if self.objects.release(id, self.num_pes()) {
            tracing::trace!(world = self.id, %id, "dropped distributed object");
        }
    }

    pub(crate) fn process_msg(self: &Arc<Self>, msg: Envelope) {
        match msg.cmd {
            Cmd::Am(AmHeader { am_id, req_id }) => {
                let exec = match AMS_EXECS.get(&am_id) {
                    Some(exec) => *exec,
                    None => self.abort(Error::RemoteInvocation(format!(
                        "unknown active message id {} from pe {}",
                        am_id, msg.src
                    ))),
                };
                let src = match self.arch.world_pe(msg.src) {
                    Ok(src) => src,
                    Err(e) => self.abort(Error::InvalidPe(e)),
                };
                let ctx = AmContext::new(World::from_rt(self.clone()), src);
                let result = match exec(&msg.data, &ctx) {
                    Ok(result) => result,
                    Err(e) => self.abort(Error::RemoteInvocation(format!(
                        "active message {} from pe {} failed to unpack: {}",
                        am_id, msg.src, e
                    ))),
                };
                self.send_universe(msg.src, Cmd::Data(DataHeader { req_id }), result);
            }
            Cmd::Data(DataHeader { req_id }) => {
                if let Err(e) = self.requests.complete(req_id, &msg.data) {
                    self.abort(e);
                }
            }
            Cmd::Barrier(epoch) => self.barrier.arrive(epoch),
            Cmd::Bcast(seq) => {
                self.bcasts.lock().insert(seq, msg.data);
            }
            Cmd::Release(id) => self.release_object(ObjectId(id)),
        }
    }

    fn wait_all(&self) {
        self.scheduler.wait_for(
            |elapsed| RuntimeWarning::BlockingWait("wait_all", elapsed),
            || (self.requests.outstanding() == 0).then_some(()),
        );
    }

    fn barrier(&self) {
        self.barrier.barrier(self);
    }
}

impl Drop for WorldRT {
    fn drop(&mut self) {
        self.scheduler.retire_world(self.id);
    }
}

/// A communication domain binding a fixed set of PEs.
///
/// The universe world spans every PE of the launch; subworlds are created collectively from
/// a parent. Each world has its own message namespace, barrier, broadcast sequence, request
/// table and distributed object registry, and is immutable for its lifetime. Cloning a
/// `World` yields another handle to the same world.
#[derive(Clone)]
pub struct World {
    rt: Arc<WorldRT>,
}

impl std::fmt::Debug for World {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.rt)
    }
}

impl WorldEnv for World {
    fn my_pe(&self) -> usize {
        self.rt.my_pe
    }
    fn num_pes(&self) -> usize {
        self.rt.num_pes()
    }
    fn world_id(&self) -> u64 {
        self.rt.id
    }
}

impl ActiveMessaging for World {
    #[tracing::instrument(skip_all)]
    fn exec_am_all<F>(&self, am: F) -> MultiAmHandle<F::Output>
    where
        F: RemoteActiveMessage,
    {
        let mut handles = Vec::with_capacity(self.num_pes());
        if self.num_pes() > 1 {
            let am_id = am_id::<F>().unwrap_or_else(|e| self.abort(e));
            let data = crate::serialize(&am)
                .unwrap_or_else(|e| self.abort(Error::Serialization(e.to_string())));
            for pe in (0..self.num_pes()).filter(|pe| *pe != self.my_pe()) {
                handles.push(self.send_am::<F::Output>(pe, am_id, data.clone()));
            }
        }
        // remote copies are already in flight while the local one runs
        handles.insert(self.my_pe(), self.exec_local(am));
        MultiAmHandle::new(handles, self.rt.scheduler.clone())
    }

    #[tracing::instrument(skip_all)]
    fn exec_am_pe<F>(&self, pe: usize, am: F) -> AmHandle<F::Output>
    where
        F: RemoteActiveMessage,
    {
        if pe >= self.num_pes() {
            self.abort(Error::InvalidPe(IdError {
                parent_pe: pe,
                world_pe: pe,
            }));
        }
        if pe == self.my_pe() {
            return self.exec_local(am);
        }
        let am_id = am_id::<F>().unwrap_or_else(|e| self.abort(e));
        let data = crate::serialize(&am)
            .unwrap_or_else(|e| self.abort(Error::Serialization(e.to_string())));
        self.send_am(pe, am_id, data)
    }

    #[tracing::instrument(skip_all)]
    fn wait_all(&self) {
        self.rt.wait_all();
    }

    #[tracing::instrument(skip_all)]
    fn barrier(&self) {
        self.rt.barrier();
    }

    fn block_on<F: Future>(&self, f: F) -> F::Output {
        self.rt.scheduler.block_on(f)
    }
}

impl World {
    pub(crate) fn from_rt(rt: Arc<WorldRT>) -> World {
        World { rt }
    }

    fn universe(scheduler: Arc<Scheduler>) -> Result<World, Error> {
        let num_pes = scheduler.lamellae().num_pes();
        let arch = Arc::new(ArchRT::universe(num_pes));
        Ok(World {
            rt: WorldRT::new(0, arch, scheduler)?,
        })
    }

    fn exec_local<F: ActiveMessage>(&self, am: F) -> AmHandle<F::Output> {
        let ctx = AmContext::new(self.clone(), self.my_pe());
        AmHandle::resolved(am.exec(&ctx), self.rt.scheduler.clone())
    }

    fn send_am<T: AmDist + Clone>(&self, pe: usize, am_id: u32, data: Vec<u8>) -> AmHandle<T> {
        let (handle, inner) = AmHandle::pending(self.rt.scheduler.clone());
        let req_id = self.rt.requests.insert(inner);
        self.rt.send(pe, Cmd::Am(AmHeader { am_id, req_id }), data);
        handle
    }

    /// The calling PE's id within this world
    pub fn my_pe(&self) -> usize {
        self.rt.my_pe
    }

    /// The number of PEs in this world
    pub fn num_pes(&self) -> usize {
        self.rt.num_pes()
    }

    /// This world's id; the universe is 0
    pub fn id(&self) -> u64 {
        self.rt.id
    }

    pub fn is_universe(&self) -> bool {
        self.rt.arch.parent.is_none()
    }

    /// Translates a world PE id into the universe rank it runs on
    pub fn universe_pe(&self, pe: usize) -> Result<usize, Error> {
        Ok(self.rt.arch.universe_pe(pe)?)
    }

    /// Translates a universe rank into this world's PE id, if it is a member
    pub fn world_pe(&self, universe_pe: usize) -> Result<usize, Error> {
        Ok(self.rt.arch.world_pe(universe_pe)?)
    }

    /// The universe ranks of the members, in world PE order
    pub fn members(&self) -> Vec<usize> {
        self.rt.arch.world_iter().collect()
    }

    pub fn backend(&self) -> Backend {
        self.rt.lamellae.backend()
    }

    /// Messages sent by this PE's fabric endpoint, across every world
    pub fn msgs_sent(&self) -> usize {
        self.rt.lamellae.msgs_sent()
    }

    #[allow(non_snake_case)]
    pub fn MB_sent(&self) -> f64 {
        self.rt.lamellae.MB_sent()
    }

    /// Unique id of this launch, shared by every PE
    pub fn job_id(&self) -> u64 {
        self.rt.lamellae.job_id()
    }

    /// Run a future to completion, servicing incoming messages while it is pending
    pub fn block_on<F: Future>(&self, f: F) -> F::Output {
        self.rt.scheduler.block_on(f)
    }

    /// Global synchronization method which blocks calling thread until all PEs in the world have entered
    #[tracing::instrument(skip_all)]
    pub fn barrier(&self) {
        self.rt.barrier();
    }

    /// blocks calling thread until all remote requests initiated by the calling PE on this world have been answered
    #[tracing::instrument(skip_all)]
    pub fn wait_all(&self) {
        self.rt.wait_all();
    }

    /// `wait_all` followed by `barrier`: every request issued on this world by any member has completed
    #[tracing::instrument(skip_all)]
    pub fn fence(&self) {
        self.rt.wait_all();
        self.rt.barrier();
    }

    /// Aborts the universe: logs `err`, raises the fabric abort signal and unwinds this PE.
    /// PEs blocked in a progress wait observe the signal and unwind too, and `launch`
    /// returns [Error::Aborted].
    pub fn abort(&self, err: Error) -> ! {
        self.rt.abort(err)
    }

    /// Collective: copies `value` from world PE `root` into `value` on every member.
    ///
    /// Every member must call broadcast with the same root, in the same order.
    #[tracing::instrument(skip_all)]
    pub fn broadcast<T: AmDist>(&self, value: &mut T, root: usize) {
        if root >= self.num_pes() {
            self.abort(Error::InvalidPe(IdError {
                parent_pe: root,
                world_pe: root,
            }));
        }
        let seq = self.rt.bcast_cnt.fetch_add(1, Ordering::SeqCst);
        if self.num_pes() == 1 {
            return;
        }
        if self.my_pe() == root {
            let data = crate::serialize(value)
                .unwrap_or_else(|e| self.abort(Error::Serialization(e.to_string())));
            for pe in (0..self.num_pes()).filter(|pe| *pe != root) {
                self.rt.send(pe, Cmd::Bcast(seq), data.clone());
            }
        } else {
            let data = self.rt.scheduler.wait_for(RuntimeWarning::BroadcastTimeout, || {
                self.rt.bcasts.lock().remove(&seq)
            });
            *value = crate::deserialize(&data).unwrap_or_else(|e| {
                self.abort(Error::Serialization(format!(
                    "broadcast {} is not a {}: {}",
                    seq,
                    std::any::type_name::<T>(),
                    e
                )))
            });
        }
    }

    fn subworld_id(&self, sub_idx: u64, index: usize) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.rt.id.hash(&mut hasher);
        sub_idx.hash(&mut hasher);
        index.hash(&mut hasher);
        match hasher.finish() {
            0 => 1, // 0 is reserved for the universe
            id => id,
        }
    }

    /// Collective over this world: builds a subworld from `arch` (expressed in this world's
    /// PE ids). Members of `arch` receive `Some(world)`, every other PE receives `None`.
    ///
    /// # Examples
    ///```ignore
    /// //create a world consisting of the "even" PEs
    /// let evens = world.create_subworld_from_arch(StridedArch::new(
    ///    0,                                      // start pe
    ///    2,                                      // stride
    ///    (world.num_pes() as f64 / 2.0).ceil() as usize, //num_pes in world
    /// ));
    ///```
    #[tracing::instrument(skip_all)]
    pub fn create_subworld_from_arch<A>(&self, arch: A) -> Option<World>
    where
        A: WorldArch + 'static,
    {
        let sub_idx = self.rt.sub_cnt.fetch_add(1, Ordering::SeqCst);
        let arch = ArchRT::new(self.rt.arch.clone(), arch).unwrap_or_else(|e| self.abort(e));
        let world = if arch.contains(self.rt.universe_pe) {
            let id = self.subworld_id(sub_idx, 0);
            let rt = WorldRT::new(id, Arc::new(arch), self.rt.scheduler.clone())
                .unwrap_or_else(|e| self.abort(e));
            Some(World { rt })
        } else {
            None
        };
        self.barrier();
        world
    }

    /// Collective over this world: partitions its PEs into the given archs (expressed in this
    /// world's PE ids) and returns the subworld the calling PE belongs to.
    ///
    /// The archs must be disjoint and cover every PE of this world, otherwise every PE returns
    /// [Error::FatalConfiguration] (the check is evaluated identically everywhere).
    #[tracing::instrument(skip_all)]
    pub fn create_subworlds<A>(&self, archs: Vec<A>) -> Result<World, Error>
    where
        A: WorldArch + 'static,
    {
        let sub_idx = self.rt.sub_cnt.fetch_add(1, Ordering::SeqCst);
        let mut membership = vec![0usize; self.num_pes()];
        let mut mine = None;
        for (index, arch) in archs.into_iter().enumerate() {
            let arch = ArchRT::new(self.rt.arch.clone(), arch)?;
            for universe_pe in arch.world_iter() {
                membership[self.rt.arch.world_pe(universe_pe)?] += 1;
            }
            if arch.contains(self.rt.universe_pe) && mine.is_none() {
                mine = Some((index, arch));
            }
        }
        if let Some(pe) = membership.iter().position(|cnt| *cnt != 1) {
            return Err(Error::FatalConfiguration(format!(
                "subworld archs must partition the parent, pe {} is in {} of them",
                pe, membership[pe]
            )));
        }
        let (index, arch) = mine.ok_or_else(|| {
            Error::FatalConfiguration(format!("pe {} is not in any subworld", self.my_pe()))
        })?;
        let rt = WorldRT::new(
            self.subworld_id(sub_idx, index),
            Arc::new(arch),
            self.rt.scheduler.clone(),
        )?;
        self.barrier();
        Ok(World { rt })
    }

    /// Collective: registers this PE's part of a distributed object. Every member must
    /// register its objects in the same order; the returned id is identical everywhere and
    /// no member leaves before all parts are registered.
    #[tracing::instrument(skip_all)]
    pub fn register_object<T: Any + Send + Sync>(&self, obj: T) -> (ObjectId, Arc<T>) {
        let obj = Arc::new(obj);
        let id = self.rt.objects.insert(obj.clone());
        self.barrier();
        (id, obj)
    }

    /// This PE's part of the distributed object `id`
    pub fn object<T: Any + Send + Sync>(&self, id: ObjectId) -> Result<Arc<T>, Error> {
        self.rt.objects.get(id)
    }

    /// Drops this PE's part of the distributed object `id` right away. Objects created
    /// through [WorldContainer::new][crate::WorldContainer::new] are dropped on their own
    /// once every member released its last handle.
    pub fn deregister_object(&self, id: ObjectId) -> bool {
        self.rt.objects.remove(id)
    }

    /// Number of distributed objects with a part registered on this PE
    pub fn num_objects(&self) -> usize {
        self.rt.objects.len()
    }

    /// Announces to every member that this PE holds no more handles to `id`
    pub(crate) fn release_object(&self, id: ObjectId) {
        for pe in (0..self.num_pes()).filter(|pe| *pe != self.my_pe()) {
            if let Err(e) = self.rt.try_send(pe, Cmd::Release(id.0), vec![]) {
                tracing::debug!(%id, pe, %e, "unable to announce object release");
            }
        }
        self.rt.release_object(id);
    }

    pub(crate) fn next_archive_round(&self) -> usize {
        self.rt.archive_round.fetch_add(1, Ordering::SeqCst)
    }
}

/// An implementation of the Builder design pattern, used to launch the universe.
///
/// # Examples
///```ignore
/// use regionq::{Backend, WorldBuilder};
///
/// let sums = WorldBuilder::new()
///     .with_lamellae(Backend::Threads)
///     .with_num_pes(4)
///     .launch(|world| world.my_pe() * 2)
///     .unwrap();
/// assert_eq!(sums, vec![0, 2, 4, 6]);
///```
#[derive(Debug)]
pub struct WorldBuilder {
    primary_lamellae: Backend,
    num_pes: usize,
}

impl Default for WorldBuilder {
    fn default() -> Self {
        WorldBuilder::new()
    }
}

impl WorldBuilder {
    #[tracing::instrument(skip_all)]
    pub fn new() -> WorldBuilder {
        let primary_lamellae = Backend::default();
        let num_pes = match primary_lamellae {
            Backend::Local => 1,
            Backend::Threads => config().num_pes,
        };
        WorldBuilder {
            primary_lamellae,
            num_pes,
        }
    }

    /// Specify the lamellae backend to use for this execution
    #[tracing::instrument(skip_all)]
    pub fn with_lamellae(mut self, lamellae: Backend) -> WorldBuilder {
        self.primary_lamellae = lamellae;
        if lamellae == Backend::Local {
            self.num_pes = 1;
        }
        self
    }

    /// Specify the number of PEs of the universe
    #[tracing::instrument(skip_all)]
    pub fn with_num_pes(mut self, num_pes: usize) -> WorldBuilder {
        self.num_pes = num_pes;
        self
    }

    /// Starts the universe and runs `f` on every PE (SPMD), each on its own thread with its
    /// own universe world handle.
    ///
    /// After `f` returns, each PE waits for its outstanding requests and enters a final universe
    /// barrier before its result is collected, so PEs keep serving each other until all are done.
    ///
    /// Returns each PE's result indexed by universe rank, or [Error::Aborted] if any PE aborted.
    /// A panic on a PE aborts its peers and is then resumed on the calling thread.
    #[tracing::instrument(skip_all)]
    pub fn launch<F, R>(self, f: F) -> Result<Vec<R>, Error>
    where
        F: Fn(World) -> R + Sync,
        R: Send,
    {
        let mut builder = LamellaeBuilder::new(self.primary_lamellae, self.num_pes)?;
        let (job_id, num_pes) = builder.init_fabric();
        tracing::info!(job_id, num_pes, backend = ?self.primary_lamellae, "launching universe");
        // the fabric endpoints outlive every pe thread so late sends never hit a closed inbox
        let lamellaes: Vec<Arc<Lamellae>> = builder.init_lamellae().into_iter().map(Arc::new).collect();

        let outcomes: Vec<std::thread::Result<R>> = std::thread::scope(|s| {
            let mut handles = Vec::with_capacity(num_pes);
            for lamellae in lamellaes.iter() {
                let lamellae = lamellae.clone();
                let f = &f;
                let name = format!("regionq-pe-{}", lamellae.my_pe());
                match std::thread::Builder::new()
                    .name(name)
                    .spawn_scoped(s, move || run_pe(lamellae, f))
                {
                    Ok(handle) => handles.push(handle),
                    Err(e) => {
                        lamellaes[0].abort(&format!("unable to spawn pe thread: {e}"));
                        break;
                    }
                }
            }
            handles.into_iter().map(|h| h.join().and_then(|r| r)).collect()
        });

        let mut results = Vec::with_capacity(num_pes);
        let mut panic = None;
        for outcome in outcomes {
            match outcome {
                Ok(r) => results.push(r),
                Err(payload) => {
                    if !payload.is::<AbortSignal>() && panic.is_none() {
                        panic = Some(payload);
                    }
                }
            }
        }
        if let Some(payload) = panic {
            std::panic::resume_unwind(payload);
        }
        match lamellaes.first().and_then(|l| l.abort_reason()) {
            Some(reason) => Err(Error::Aborted(reason)),
            None if results.len() != num_pes => {
                Err(Error::Aborted("not every pe completed".to_owned()))
            }
            None => Ok(results),
        }
    }
}

fn run_pe<F, R>(lamellae: Arc<Lamellae>, f: &F) -> std::thread::Result<R>
where
    F: Fn(World) -> R + Sync,
{
    let my_pe = lamellae.my_pe();
    let _span = tracing::debug_span!("pe", pe = my_pe).entered();
    let scheduler = Arc::new(Scheduler::new(lamellae.clone()));
    let res = std::panic::catch_unwind(AssertUnwindSafe(|| {
        let world = match World::universe(scheduler.clone()) {
            Ok(world) => world,
            Err(e) => scheduler.abort(e),
        };
        let res = f(world.clone());
        world.wait_all();
        world.barrier();
        res
    }));
    if let Err(payload) = &res {
        if !payload.is::<AbortSignal>() {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_owned());
            tracing::error!(pe = my_pe, %msg, "pe panicked, aborting universe");
            lamellae.abort(&format!("pe {} panicked: {}", my_pe, msg));
        }
    }
    res
}

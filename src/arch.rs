use std::sync::Arc;

use crate::Error;

/// An abstraction which represents the PEs that are members of a World, expressed in the
/// id space of its parent World
pub trait WorldArch: Send + Sync {
    /// The number of PEs in the world defined by this WorldArch
    fn num_pes(&self) -> usize;
    /// The id of the first (lowest numbered) PE in the world, with respect to the parent
    fn start_pe(&self) -> usize;
    /// The id of the last (highest numbered) PE in the world, with respect to the parent
    fn end_pe(&self) -> usize;
    /// Converts a world PE id into the id space of the parent world
    ///
    /// Returns an error if the pe does not exist in the world
    fn parent_pe_id(&self, world_pe: &usize) -> ArchResult<usize>;
    /// Converts a parent world PE id into the id space of the world specified by this WorldArch
    ///
    /// Returns an error if the pe does not exist in the world
    fn world_pe_id(&self, parent_pe: &usize) -> ArchResult<usize>;
}

/// An error that occurs when trying to access a PE that does not exist in a world/subworld
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdError {
    pub parent_pe: usize,
    pub world_pe: usize,
}

pub(crate) type ArchResult<T> = Result<T, IdError>;

impl std::fmt::Display for IdError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "Invalid Id => parent_pe:{} world_pe => {}",
            self.parent_pe, self.world_pe
        )
    }
}

impl std::error::Error for IdError {}

#[derive(Clone)]
pub(crate) enum ArchEnum {
    Global(GlobalArch),
    Strided(StridedArch),
    Dynamic(Arc<dyn WorldArch>),
}

impl std::fmt::Debug for ArchEnum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArchEnum::Global(arch) => write!(f, "{:?}", arch),
            ArchEnum::Strided(arch) => write!(f, "{:?}", arch),
            ArchEnum::Dynamic(_) => write!(f, "Dynamic"),
        }
    }
}

impl ArchEnum {
    pub(crate) fn new<A>(arch: A) -> ArchEnum
    where
        A: WorldArch + 'static,
    {
        let any_arch = &arch as &dyn std::any::Any;
        if let Some(strided) = any_arch.downcast_ref::<StridedArch>() {
            ArchEnum::Strided(*strided)
        } else if let Some(global) = any_arch.downcast_ref::<GlobalArch>() {
            ArchEnum::Global(*global)
        } else {
            ArchEnum::Dynamic(Arc::new(arch))
        }
    }
}

impl WorldArch for ArchEnum {
    fn num_pes(&self) -> usize {
        match self {
            ArchEnum::Global(arch) => arch.num_pes(),
            ArchEnum::Strided(arch) => arch.num_pes(),
            ArchEnum::Dynamic(arch) => arch.num_pes(),
        }
    }
    fn start_pe(&self) -> usize {
        match self {
            ArchEnum::Global(arch) => arch.start_pe(),
            ArchEnum::Strided(arch) => arch.start_pe(),
            ArchEnum::Dynamic(arch) => arch.start_pe(),
        }
    }
    fn end_pe(&self) -> usize {
        match self {
            ArchEnum::Global(arch) => arch.end_pe(),
            ArchEnum::Strided(arch) => arch.end_pe(),
            ArchEnum::Dynamic(arch) => arch.end_pe(),
        }
    }
    fn parent_pe_id(&self, world_pe: &usize) -> ArchResult<usize> {
        match self {
            ArchEnum::Global(arch) => arch.parent_pe_id(world_pe),
            ArchEnum::Strided(arch) => arch.parent_pe_id(world_pe),
            ArchEnum::Dynamic(arch) => arch.parent_pe_id(world_pe),
        }
    }
    fn world_pe_id(&self, parent_pe: &usize) -> ArchResult<usize> {
        match self {
            ArchEnum::Global(arch) => arch.world_pe_id(parent_pe),
            ArchEnum::Strided(arch) => arch.world_pe_id(parent_pe),
            ArchEnum::Dynamic(arch) => arch.world_pe_id(parent_pe),
        }
    }
}

/// The arch of a world resolved all the way up to the universe, so any member id can be
/// translated to the universe rank the fabric addresses.
#[derive(Debug, Clone)]
pub(crate) struct ArchRT {
    pub(crate) parent: Option<Arc<ArchRT>>,
    pub(crate) arch: ArchEnum,
    pub(crate) num_pes: usize,
}

impl ArchRT {
    pub(crate) fn universe(num_pes: usize) -> ArchRT {
        ArchRT {
            parent: None,
            arch: ArchEnum::Global(GlobalArch::new(num_pes)),
            num_pes,
        }
    }

    pub(crate) fn new<A>(parent: Arc<ArchRT>, arch: A) -> Result<ArchRT, Error>
    where
        A: WorldArch + 'static,
    {
        if arch.num_pes() == 0 {
            return Err(Error::FatalConfiguration(
                "a subworld must contain at least one pe".to_owned(),
            ));
        }
        if arch.num_pes() > parent.num_pes() {
            return Err(Error::FatalConfiguration(format!(
                "cannot have more pes in subworld ({}) than parent ({})",
                arch.num_pes(),
                parent.num_pes()
            )));
        }

        // start/end are in the parent's world ids, which always span 0..parent.num_pes
        let arch_first = arch.start_pe();
        let arch_last = arch.end_pe();
        let last = parent.num_pes() - 1;
        if arch_first > arch_last || arch_last > last {
            return Err(Error::FatalConfiguration(format!(
                "subworld pes [{arch_first}, {arch_last}] must be a subset of parent pes [0, {last}]"
            )));
        }

        Ok(ArchRT {
            parent: Some(parent),
            num_pes: arch.num_pes(),
            arch: ArchEnum::new(arch),
        })
    }

    pub(crate) fn num_pes(&self) -> usize {
        self.num_pes
    }

    /// world pe id -> universe rank
    pub(crate) fn universe_pe(&self, world_pe: usize) -> ArchResult<usize> {
        let parent_pe = self.arch.parent_pe_id(&world_pe)?;
        match &self.parent {
            Some(parent) => parent.universe_pe(parent_pe),
            None => Ok(parent_pe),
        }
    }

    /// universe rank -> world pe id
    pub(crate) fn world_pe(&self, universe_pe: usize) -> ArchResult<usize> {
        match &self.parent {
            Some(parent) => {
                let parent_pe = parent.world_pe(universe_pe)?;
                self.arch.world_pe_id(&parent_pe)
            }
            None => self.arch.world_pe_id(&universe_pe),
        }
    }

    pub(crate) fn contains(&self, universe_pe: usize) -> bool {
        self.world_pe(universe_pe).is_ok()
    }

    /// iterates over the universe ranks of the members, in world pe order
    pub(crate) fn world_iter(&self) -> ArchRTIter<'_> {
        ArchRTIter {
            arch: self,
            cur_pe: 0,
        }
    }
}

pub(crate) struct ArchRTIter<'a> {
    arch: &'a ArchRT,
    cur_pe: usize,
}

impl Iterator for ArchRTIter<'_> {
    type Item = usize;
    fn next(&mut self) -> Option<usize> {
        if self.cur_pe >= self.arch.num_pes() {
            return None;
        }
        let res = self.arch.universe_pe(self.cur_pe).ok();
        self.cur_pe += 1;
        res
    }
}

/// Every PE of the parent, in order.
#[derive(Copy, Clone, std::hash::Hash, Debug)]
pub struct GlobalArch {
    pub(crate) num_pes: usize,
}

impl GlobalArch {
    pub fn new(num_pes: usize) -> GlobalArch {
        GlobalArch { num_pes }
    }
}

impl WorldArch for GlobalArch {
    fn num_pes(&self) -> usize {
        self.num_pes
    }
    fn start_pe(&self) -> usize {
        0
    }
    fn end_pe(&self) -> usize {
        self.num_pes.saturating_sub(1)
    }
    fn parent_pe_id(&self, world_pe: &usize) -> ArchResult<usize> {
        if *world_pe < self.num_pes {
            Ok(*world_pe)
        } else {
            Err(IdError {
                parent_pe: *world_pe,
                world_pe: *world_pe,
            })
        }
    }
    fn world_pe_id(&self, parent_pe: &usize) -> ArchResult<usize> {
        if *parent_pe < self.num_pes {
            Ok(*parent_pe)
        } else {
            Err(IdError {
                parent_pe: *parent_pe,
                world_pe: *parent_pe,
            })
        }
    }
}

/// A grouping of PE's forming a world using a "strided" distribution pattern.
///
/// Regional worlds are strided: region `r` out of `R` is `StridedArch::new(r, R, n)`.
///
/// # Examples
///
///```ignore
/// use regionq::StridedArch;
///
/// // the world will consist of the 5 pes => 0,4,8,12,16
/// let arch = StridedArch::new(
///    0, //start pe
///    4, //stride
///    5, //num_pes in world
/// );
///```
#[derive(Copy, Clone, std::hash::Hash, Debug)]
pub struct StridedArch {
    pub(crate) num_pes: usize,
    pub(crate) start_pe: usize, //with respect to the parent arch
    pub(crate) end_pe: usize,   //with respect to the parent arch
    pub(crate) stride: usize,
}

impl StridedArch {
    /// Construct a new StridedArch using a starting PE, the stride length, and the number of PEs to include.
    /// A stride of 0 is treated as 1.
    pub fn new(start_pe: usize, stride: usize, num_world_pes: usize) -> StridedArch {
        let stride = stride.max(1);
        StridedArch {
            num_pes: num_world_pes,
            start_pe,
            end_pe: start_pe + stride * num_world_pes.saturating_sub(1),
            stride,
        }
    }
}

impl WorldArch for StridedArch {
    fn num_pes(&self) -> usize {
        self.num_pes
    }
    fn start_pe(&self) -> usize {
        self.start_pe
    }
    fn end_pe(&self) -> usize {
        self.end_pe
    }
    fn parent_pe_id(&self, world_pe: &usize) -> ArchResult<usize> {
        let parent_pe = self.start_pe + world_pe * self.stride;
        if *world_pe < self.num_pes {
            Ok(parent_pe)
        } else {
            Err(IdError {
                parent_pe,
                world_pe: *world_pe,
            })
        }
    }
    fn world_pe_id(&self, parent_pe: &usize) -> ArchResult<usize> {
        if *parent_pe >= self.start_pe
            && *parent_pe <= self.end_pe
            && (parent_pe - self.start_pe) % self.stride == 0
        {
            let world_pe = (parent_pe - self.start_pe) / self.stride;
            if world_pe < self.num_pes {
                return Ok(world_pe);
            }
        }
        Err(IdError {
            parent_pe: *parent_pe,
            world_pe: 0,
        })
    }
}

use crate::arch::IdError;

/// Errors surfaced by the runtime.
///
/// Everything except [Error::NotOwner], [Error::InvalidPe] and [Error::UnknownObject] is
/// fatal to the universe: the runtime escalates it through `World::abort`, and `launch`
/// reports it to the caller as [Error::Aborted].
#[derive(Debug, Clone)]
pub enum Error {
    /// Invalid region count, subworld layout or backend selection
    FatalConfiguration(String),
    /// An active message could not be executed or answered (unknown am id, bad reply)
    RemoteInvocation(String),
    /// A payload failed to (de)serialize
    Serialization(String),
    /// A pe id that does not exist in the world it was used with
    InvalidPe(IdError),
    /// A local-only container access on a pe that does not own the key
    NotOwner { key: i64, owner: usize, pe: usize },
    /// No distributed object with this id is registered on the target pe
    UnknownObject(u64),
    /// A distributed object was looked up with the wrong value type
    TypeMismatch { expected: &'static str, found: &'static str },
    /// The queue owner kept observing keys vanish between scan and removal
    PopRetriesExhausted(usize),
    /// A request was answered twice
    AlreadyResolved(usize),
    /// Archive i/o or integrity failure
    Archive(String),
    /// A task lifecycle hook failed
    Task(String),
    /// The universe was aborted, carries the reason reported by the aborting pe
    Aborted(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::FatalConfiguration(msg) => write!(f, "fatal configuration error: {}", msg),
            Error::RemoteInvocation(msg) => write!(f, "remote invocation failed: {}", msg),
            Error::Serialization(msg) => write!(f, "serialization error: {}", msg),
            Error::InvalidPe(err) => write!(f, "{}", err),
            Error::NotOwner { key, owner, pe } => write!(
                f,
                "key {} is owned by pe {}, cannot access it locally on pe {}",
                key, owner, pe
            ),
            Error::UnknownObject(id) => write!(f, "no distributed object with id {:x}", id),
            Error::TypeMismatch { expected, found } => write!(
                f,
                "distributed object type mismatch: expected {}, found {}",
                expected, found
            ),
            Error::PopRetriesExhausted(retries) => write!(
                f,
                "task queue pop gave up after {} retries of vanished keys",
                retries
            ),
            Error::AlreadyResolved(req_id) => {
                write!(f, "request {} was already resolved", req_id)
            }
            Error::Archive(msg) => write!(f, "archive error: {}", msg),
            Error::Task(msg) => write!(f, "task failed: {}", msg),
            Error::Aborted(reason) => write!(f, "universe aborted: {}", reason),
        }
    }
}

impl std::error::Error for Error {}

impl From<IdError> for Error {
    fn from(err: IdError) -> Self {
        Error::InvalidPe(err)
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Archive(err.to_string())
    }
}

/// Payload of the unwind started by `World::abort`; carries the reason to `launch`.
#[derive(Debug, Clone)]
pub(crate) struct AbortSignal(pub(crate) String);

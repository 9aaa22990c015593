use crate::config;
use crate::Error;

use enum_dispatch::enum_dispatch;
use parking_lot::Mutex;

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

pub(crate) mod local_lamellae;
use local_lamellae::{Local, LocalBuilder};
pub(crate) mod threads_lamellae;
use threads_lamellae::{Threads, ThreadsBuilder};

/// The list of available lamellae backends, used to specify how data is transfered between PEs
#[derive(
    serde::Serialize, serde::Deserialize, Debug, PartialEq, Eq, Ord, PartialOrd, Hash, Clone, Copy,
)]
pub enum Backend {
    /// The Local backend -- a single pe, every invocation is local
    Local,
    /// The Threads backend -- multiple pes inside one process, one OS thread and one FIFO inbox per pe
    Threads,
}

impl Default for Backend {
    fn default() -> Self {
        match config().backend.as_str() {
            "local" => Backend::Local,
            _ => Backend::Threads,
        }
    }
}

/// An already serialized message envelope, as moved by the fabric
#[derive(Clone, Debug)]
pub(crate) struct SerializedData(pub(crate) Vec<u8>);

impl SerializedData {
    pub(crate) fn len(&self) -> usize {
        self.0.len()
    }
    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// State shared by every pe of one fabric: the out-of-band abort signal and the job id
#[derive(Debug)]
pub(crate) struct FabricState {
    job_id: u64,
    aborted: AtomicBool,
    abort_reason: Mutex<Option<String>>,
}

impl FabricState {
    pub(crate) fn new() -> FabricState {
        FabricState {
            job_id: rand::random::<u64>(),
            aborted: AtomicBool::new(false),
            abort_reason: Mutex::new(None),
        }
    }

    pub(crate) fn job_id(&self) -> u64 {
        self.job_id
    }

    // first reason wins
    pub(crate) fn abort(&self, reason: &str) {
        let mut abort_reason = self.abort_reason.lock();
        if abort_reason.is_none() {
            *abort_reason = Some(reason.to_owned());
        }
        self.aborted.store(true, Ordering::SeqCst);
    }

    pub(crate) fn abort_reason(&self) -> Option<String> {
        if self.aborted.load(Ordering::SeqCst) {
            Some(
                self.abort_reason
                    .lock()
                    .clone()
                    .unwrap_or_else(|| "unknown".to_owned()),
            )
        } else {
            None
        }
    }
}

#[enum_dispatch(LamellaeInit)]
pub(crate) enum LamellaeBuilder {
    LocalBuilder,
    ThreadsBuilder,
}

impl LamellaeBuilder {
    pub(crate) fn new(backend: Backend, num_pes: usize) -> Result<LamellaeBuilder, Error> {
        match backend {
            Backend::Local => {
                if num_pes != 1 {
                    return Err(Error::FatalConfiguration(format!(
                        "the local backend supports exactly one pe, {} requested",
                        num_pes
                    )));
                }
                Ok(LocalBuilder::new().into())
            }
            Backend::Threads => {
                if num_pes == 0 {
                    return Err(Error::FatalConfiguration(
                        "the universe must contain at least one pe".to_owned(),
                    ));
                }
                Ok(ThreadsBuilder::new(num_pes).into())
            }
        }
    }
}

#[enum_dispatch]
pub(crate) trait LamellaeInit {
    fn init_fabric(&mut self) -> (u64, usize); //(job_id,num_pes)
    /// one lamellae per pe, indexed by universe rank
    fn init_lamellae(&mut self) -> Vec<Lamellae>;
}

#[enum_dispatch(LamellaeComm)]
#[derive(Debug)]
pub(crate) enum Lamellae {
    Local,
    Threads,
}

#[enum_dispatch]
pub(crate) trait LamellaeComm {
    fn my_pe(&self) -> usize;
    fn num_pes(&self) -> usize;
    fn backend(&self) -> Backend;
    fn job_id(&self) -> u64;
    /// Enqueues a message in the inbox of universe rank `pe`; messages between a fixed
    /// sender/receiver pair are received in send order
    fn send_to_pe(&self, pe: usize, data: SerializedData) -> Result<(), Error>;
    fn try_recv(&self) -> Option<SerializedData>;
    fn recv_timeout(&self, timeout: Duration) -> Option<SerializedData>;
    fn msgs_sent(&self) -> usize;
    #[allow(non_snake_case)]
    fn MB_sent(&self) -> f64;
    /// Raises the universe-wide abort signal
    fn abort(&self, reason: &str);
    fn abort_reason(&self) -> Option<String>;
}

use super::{Backend, FabricState, Lamellae, LamellaeComm, LamellaeInit, SerializedData};
use crate::Error;

use crossbeam::channel::{unbounded, Receiver, Sender};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub(crate) struct LocalBuilder {
    state: Arc<FabricState>,
}

impl LocalBuilder {
    pub(crate) fn new() -> LocalBuilder {
        LocalBuilder {
            state: Arc::new(FabricState::new()),
        }
    }
}

impl LamellaeInit for LocalBuilder {
    fn init_fabric(&mut self) -> (u64, usize) {
        (self.state.job_id(), 1)
    }
    fn init_lamellae(&mut self) -> Vec<Lamellae> {
        vec![Lamellae::Local(Local::new(self.state.clone()))]
    }
}

/// Single pe loopback. Invocations on pe 0 short circuit before reaching the fabric, so in
/// practice only self-addressed collectives would ever use the channel.
pub(crate) struct Local {
    state: Arc<FabricState>,
    tx: Sender<SerializedData>,
    rx: Receiver<SerializedData>,
    msgs_sent: AtomicUsize,
    bytes_sent: AtomicUsize,
}

impl std::fmt::Debug for Local {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Local")
    }
}

impl Local {
    pub(crate) fn new(state: Arc<FabricState>) -> Local {
        let (tx, rx) = unbounded();
        Local {
            state,
            tx,
            rx,
            msgs_sent: AtomicUsize::new(0),
            bytes_sent: AtomicUsize::new(0),
        }
    }
}

impl LamellaeComm for Local {
    fn my_pe(&self) -> usize {
        0
    }
    fn num_pes(&self) -> usize {
        1
    }
    fn backend(&self) -> Backend {
        Backend::Local
    }
    fn job_id(&self) -> u64 {
        self.state.job_id()
    }
    fn send_to_pe(&self, pe: usize, data: SerializedData) -> Result<(), Error> {
        if pe != 0 {
            return Err(Error::InvalidPe(crate::IdError {
                parent_pe: pe,
                world_pe: pe,
            }));
        }
        self.msgs_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(data.len(), Ordering::Relaxed);
        self.tx
            .send(data)
            .map_err(|e| Error::RemoteInvocation(format!("loopback send failed: {e}")))
    }
    fn try_recv(&self) -> Option<SerializedData> {
        self.rx.try_recv().ok()
    }
    fn recv_timeout(&self, timeout: Duration) -> Option<SerializedData> {
        self.rx.recv_timeout(timeout).ok()
    }
    fn msgs_sent(&self) -> usize {
        self.msgs_sent.load(Ordering::Relaxed)
    }
    #[allow(non_snake_case)]
    fn MB_sent(&self) -> f64 {
        self.bytes_sent.load(Ordering::Relaxed) as f64 / 1_000_000.0
    }
    fn abort(&self, reason: &str) {
        self.state.abort(reason)
    }
    fn abort_reason(&self) -> Option<String> {
        self.state.abort_reason()
    }
}

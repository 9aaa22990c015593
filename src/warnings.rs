use crate::config;

pub(crate) enum RuntimeWarning<'a> {
    BarrierTimeout(f64),
    BroadcastTimeout(f64),
    BlockingWait(&'a str, f64),
}

impl<'a> RuntimeWarning<'a> {
    fn print_warning(&self) -> bool {
        if config().deadlock_timeout <= 0.0 {
            return false;
        }
        match self {
            RuntimeWarning::BarrierTimeout(elapsed) | RuntimeWarning::BroadcastTimeout(elapsed) => {
                *elapsed > config().deadlock_timeout
            }
            RuntimeWarning::BlockingWait(_, elapsed) => {
                config().blocking_wait_warning.unwrap_or(true)
                    && *elapsed > config().deadlock_timeout
            }
        }
    }

    pub(crate) fn print(self) {
        if self.print_warning() {
            match self {
                RuntimeWarning::BarrierTimeout(elapsed) => {
                    tracing::warn!(
                        elapsed,
                        timeout = config().deadlock_timeout,
                        "barrier timeout, potential deadlock detected. Barrier is a collective operation \
                         requiring every pe of the world to enter it; collectives such as world creation, \
                         container construction and run_all call it internally. \
                         Set REGIONQ_DEADLOCK_TIMEOUT to change the timeout (0 disables this warning)"
                    );
                }
                RuntimeWarning::BroadcastTimeout(elapsed) => {
                    tracing::warn!(
                        elapsed,
                        timeout = config().deadlock_timeout,
                        "broadcast timeout, potential deadlock detected. Every member of the world must \
                         call broadcast with the same root"
                    );
                }
                RuntimeWarning::BlockingWait(what, elapsed) => {
                    tracing::warn!(
                        elapsed,
                        timeout = config().deadlock_timeout,
                        "{what} has been waiting longer than the deadlock timeout, potential deadlock detected. \
                         Set REGIONQ_BLOCKING_WAIT_WARNING=false to disable this warning"
                    );
                }
            }
        }
    }
}

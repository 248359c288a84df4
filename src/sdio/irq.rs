// ===== SDIO Interrupt Delivery =====

use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use crate::controller::Controller;
use crate::device::SdioFunction;
use crate::err::SdError;

use super::SdioHost;

/// Per-function interrupt callback. Runs on the interrupt thread with the
/// host already claimed for the raising function.
pub trait SdioIrqHandler: Send + Sync {
    fn handle(&self, host: &mut SdioHost<'_>);
}

impl<F> SdioIrqHandler for F
where
    F: Fn(&mut SdioHost<'_>) + Send + Sync,
{
    fn handle(&self, host: &mut SdioHost<'_>) {
        self(host)
    }
}

#[derive(Default)]
struct EventState {
    pending: bool,
    cancelled: bool,
}

/// Auto-reset event with cancellation.
#[derive(Default)]
pub struct IrqEvent {
    state: Mutex<EventState>,
    cond: Condvar,
}

impl IrqEvent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        let mut st = self.state.lock();
        st.pending = true;
        self.cond.notify_one();
    }

    pub fn cancel(&self) {
        let mut st = self.state.lock();
        st.cancelled = true;
        self.cond.notify_all();
    }

    /// Block until notified. Returns false once cancelled.
    pub fn wait(&self) -> bool {
        let mut st = self.state.lock();
        while !st.pending && !st.cancelled {
            self.cond.wait(&mut st);
        }
        if st.cancelled {
            return false;
        }
        st.pending = false;
        true
    }
}

/// Handed to the bus-controller driver; call `notify` from its SDIO
/// interrupt path after masking the host-level interrupt.
#[derive(Clone)]
pub struct IrqNotifier {
    pub(crate) ctrl: Weak<Controller>,
}

impl IrqNotifier {
    pub fn notify(&self) {
        if let Some(ctrl) = self.ctrl.upgrade() {
            ctrl.signal_sdio_irq();
        }
    }
}

pub(crate) struct IrqThread {
    pub(crate) event: Arc<IrqEvent>,
    handle: JoinHandle<()>,
}

impl IrqThread {
    pub(crate) fn spawn(ctrl: Weak<Controller>, index: u32) -> Result<Self, SdError> {
        let event = Arc::new(IrqEvent::new());
        let ev = event.clone();
        let handle = thread::Builder::new()
            .name(format!("sdio-irq{index}"))
            .spawn(move || irq_loop(ctrl, ev))
            .map_err(|_| SdError::AllocationFailure)?;
        debug!("bus{index}: sdio irq thread started");
        Ok(Self { event, handle })
    }

    pub(crate) fn id(&self) -> ThreadId {
        self.handle.thread().id()
    }

    /// Cancel the thread, optionally waiting for it to exit. Callers holding
    /// the bus lock must not join. From the interrupt thread itself the join
    /// is always skipped.
    pub(crate) fn stop(self, join: bool) {
        self.event.cancel();
        if !join || self.id() == thread::current().id() {
            return;
        }
        if self.handle.join().is_err() {
            warn!("sdio irq thread panicked");
        }
    }
}

fn irq_loop(ctrl: Weak<Controller>, event: Arc<IrqEvent>) {
    while event.wait() {
        let Some(ctrl) = ctrl.upgrade() else { break };
        dispatch(&ctrl);
    }
}

/// Route one interrupt to the claiming function handlers, then re-arm the
/// host-level SDIO interrupt.
pub(crate) fn dispatch(ctrl: &Arc<Controller>) {
    let Some(dev) = ctrl.device() else { return };
    let claimed: Vec<Arc<SdioFunction>> = dev
        .functions()
        .iter()
        .filter(|f| f.has_irq_handler())
        .cloned()
        .collect();
    let Some(first) = claimed.first().cloned() else { return };

    let mut host = SdioHost::new(ctrl, dev.clone(), first);
    let targets = if claimed.len() == 1 {
        claimed
    } else {
        match host.bus.sdio_int_pending_reg() {
            Ok(pending) => claimed
                .into_iter()
                .filter(|f| pending & (1 << f.num) != 0)
                .collect(),
            Err(e) => {
                warn!("bus{}: read INT_PENDING failed: {}", ctrl.index(), e);
                Vec::new()
            }
        }
    };

    for func in targets {
        let handler = func.irq_handler.lock().clone();
        if let Some(handler) = handler {
            host.func = func;
            handler.handle(&mut host);
        }
    }

    match host.bus.enable_sdio_irq(true) {
        Ok(()) | Err(SdError::NotSupported) => {}
        Err(e) => warn!("bus{}: re-arm sdio irq failed: {}", ctrl.index(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_wakes_once_per_notify() {
        let ev = Arc::new(IrqEvent::new());
        ev.notify();
        ev.notify();
        assert!(ev.wait());
        let waiter = {
            let ev = ev.clone();
            thread::spawn(move || ev.wait())
        };
        ev.cancel();
        assert!(!waiter.join().unwrap());
    }
}

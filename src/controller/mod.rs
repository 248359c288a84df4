//! Per-slot coordinator.
//!
//! A [`Controller`] owns the [`Bus`] behind a lock, the slot's current
//! [`Device`] and one worker thread draining a FIFO of [`Message`]s. Every
//! command against the slot runs with the bus lock held, whether it comes
//! from the worker, from a block request issued while detection is in
//! progress, or from an SDIO function driver.

mod msg;

use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use log::{debug, info, warn};
use parking_lot::{Mutex, MutexGuard};

pub use msg::{Completion, Message, Reply, Request};
use msg::Envelope;

use crate::cmd::Command;
use crate::constant::*;
use crate::device::{Device, DeviceState};
use crate::err::SdError;
use crate::host::{Bus, HostConfig, HostOps, Ios};
use crate::protocol::protocol_for;
use crate::sdio::{IrqNotifier, IrqThread};

static CONTROLLERS: spin::Mutex<Vec<Arc<Controller>>> = spin::Mutex::new(Vec::new());

/// Block-device binding. Called on the worker thread.
pub trait DeviceListener: Send + Sync {
    /// A memory device finished enumeration. Block requests made through
    /// `handle` from inside this callback bypass the queue.
    fn device_added(&self, handle: &DeviceHandle);

    fn device_removed(&self, _dev: &Device) {}
}

pub struct Controller {
    index: u32,
    me: Weak<Controller>,
    bus: Mutex<Bus>,
    device: spin::Mutex<Option<Arc<Device>>>,
    detecting: AtomicBool,
    queue: Mutex<Option<Sender<Envelope>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    irq: Mutex<Option<IrqThread>>,
    listener: Option<Arc<dyn DeviceListener>>,
}

// ===== Registry =====

impl Controller {
    /// Register a slot and start its worker. The bus number must be unused.
    pub fn add(
        cfg: HostConfig,
        ops: Box<dyn HostOps>,
        listener: Option<Arc<dyn DeviceListener>>,
    ) -> Result<Arc<Controller>, SdError> {
        cfg.validate()?;
        let index = cfg.index;
        let mut list = CONTROLLERS.lock();
        if list.iter().any(|c| c.index == index) {
            warn!("bus{index}: already registered");
            return Err(SdError::InvalidParameter);
        }

        let (tx, rx) = mpsc::channel();
        let ctrl = Arc::new_cyclic(|me| Controller {
            index,
            me: me.clone(),
            bus: Mutex::new(Bus::new(cfg, ops)),
            device: spin::Mutex::new(None),
            detecting: AtomicBool::new(false),
            queue: Mutex::new(Some(tx)),
            worker: Mutex::new(None),
            irq: Mutex::new(None),
            listener,
        });
        let weak = Arc::downgrade(&ctrl);
        let handle = thread::Builder::new()
            .name(format!("sdmmc{index}"))
            .spawn(move || worker_loop(weak, rx))
            .map_err(|_| SdError::AllocationFailure)?;
        *ctrl.worker.lock() = Some(handle);

        list.push(ctrl.clone());
        info!("bus{index}: controller added");
        Ok(ctrl)
    }

    pub fn open(index: u32) -> Result<Arc<Controller>, SdError> {
        CONTROLLERS
            .lock()
            .iter()
            .find(|c| c.index == index)
            .cloned()
            .ok_or(SdError::NoDevice)
    }

    /// Unregister a slot, drain and stop its worker and drop the device.
    pub fn remove(index: u32) -> Result<(), SdError> {
        let ctrl = {
            let mut list = CONTROLLERS.lock();
            let pos = list
                .iter()
                .position(|c| c.index == index)
                .ok_or(SdError::NoDevice)?;
            list.remove(pos)
        };
        ctrl.shutdown();
        info!("bus{index}: controller removed");
        Ok(())
    }

    fn shutdown(&self) {
        self.queue.lock().take();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if worker.thread().id() != thread::current().id() && worker.join().is_err() {
                warn!("bus{}: worker panicked", self.index);
            }
        }
        if let Err(e) = self.handle_unplug() {
            warn!("bus{}: teardown: {}", self.index, e);
        }
    }
}

// ===== Accessors =====

impl Controller {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn device(&self) -> Option<Arc<Device>> {
        self.device.lock().clone()
    }

    pub fn config(&self) -> HostConfig {
        self.bus.lock().config().clone()
    }

    /// Bus settings as last applied.
    pub fn ios(&self) -> Ios {
        *self.bus.lock().ios()
    }

    pub fn is_detecting(&self) -> bool {
        self.detecting.load(Ordering::Acquire)
    }

    /// Handle on the present memory device.
    pub fn device_handle(&self) -> Result<DeviceHandle, SdError> {
        let dev = self
            .device()
            .filter(|d| d.is_present() && d.kind.has_memory())
            .ok_or(SdError::NoDevice)?;
        Ok(DeviceHandle {
            ctrl: self.arc()?,
            dev,
        })
    }

    pub fn irq_notifier(&self) -> IrqNotifier {
        IrqNotifier {
            ctrl: self.me.clone(),
        }
    }

    pub(crate) fn lock_bus(&self) -> MutexGuard<'_, Bus> {
        self.bus.lock()
    }

    fn arc(&self) -> Result<Arc<Controller>, SdError> {
        self.me.upgrade().ok_or(SdError::InvalidObject)
    }
}

// ===== Message queue =====

impl Controller {
    fn enqueue(&self, env: Envelope) -> Result<(), SdError> {
        let queue = self.queue.lock();
        let tx = queue.as_ref().ok_or(SdError::NoDevice)?;
        tx.send(env).map_err(|_| SdError::IoError)
    }

    /// Queue without waiting.
    pub fn post(&self, msg: Message) -> Result<(), SdError> {
        self.enqueue(Envelope::detached(msg))
    }

    /// Queue and wait for the worker to finish the message.
    pub fn call(&self, msg: Message) -> Completion {
        let (env, done) = Envelope::blocking(msg);
        self.enqueue(env)?;
        done.recv().map_err(|_| SdError::IoError)?
    }

    pub fn plug(&self) -> Result<(), SdError> {
        self.call(Message::Plug).map(|_| ())
    }

    pub fn unplug(&self) -> Result<(), SdError> {
        self.call(Message::Unplug).map(|_| ())
    }

    pub fn rescan_sdio(&self) -> Result<(), SdError> {
        self.call(Message::SdioRescan).map(|_| ())
    }

    /// Run a request, directly while detection holds the worker, otherwise
    /// through the queue.
    pub fn do_request(&self, req: Request) -> Completion {
        if self.is_detecting() {
            return self.execute(&req);
        }
        self.call(Message::Request(req))
    }

    /// Issue one data-less command to the device.
    pub fn send_command(&self, opcode: u32, arg: u32, resp_type: crate::cmd::RespType) -> Result<[u32; 4], SdError> {
        match self.do_request(Request::Command { opcode, arg, resp_type })? {
            Reply::Response(resp) => Ok(resp),
            _ => Err(SdError::IoError),
        }
    }

    /// Quick resynchronization of the present card without re-enumerating.
    pub fn reinit(&self) -> Result<(), SdError> {
        let dev = self.device().ok_or(SdError::NoDevice)?;
        let mut bus = self.bus.lock();
        protocol_for(dev.kind).reinit(&mut bus, &dev)
    }

    fn handle(&self, msg: &Message) -> Completion {
        match msg {
            Message::Plug => self.handle_plug(),
            Message::Unplug => self.handle_unplug(),
            Message::Request(req) => self.execute(req),
            Message::SdioRescan => self.handle_rescan(),
        }
    }

    fn handle_plug(&self) -> Completion {
        if self.device().is_some_and(|d| d.is_present()) {
            debug!("bus{}: plug with device present, ignored", self.index);
            return Ok(Reply::Done);
        }
        self.detecting.store(true, Ordering::Release);
        let res = self.detect_and_bind();
        self.detecting.store(false, Ordering::Release);
        res
    }

    fn detect_and_bind(&self) -> Completion {
        let dev = {
            let mut bus = self.bus.lock();
            if !bus.dev_plugged() {
                return Err(SdError::NoDevice);
            }
            let kind = bus.config().dev_type;
            let mut last = SdError::NoDevice;
            let mut found = None;
            for attempt in 1..=MMC_DETECT_RETRY {
                match bus.do_detect(kind) {
                    Ok(dev) => {
                        found = Some(dev);
                        break;
                    }
                    Err(e) => {
                        warn!("bus{}: detect attempt {} failed: {}", self.index, attempt, e);
                        last = e;
                    }
                }
            }
            Arc::new(found.ok_or(last)?)
        };

        *self.device.lock() = Some(dev.clone());
        if dev.kind.has_memory() {
            if let Some(listener) = self.listener.as_ref() {
                let handle = DeviceHandle {
                    ctrl: self.arc()?,
                    dev,
                };
                listener.device_added(&handle);
            }
        }
        Ok(Reply::Done)
    }

    fn handle_unplug(&self) -> Completion {
        let Some(dev) = self.device.lock().take() else {
            return Ok(Reply::Done);
        };
        dev.clear_state(DeviceState::PRESENT);
        for func in dev.functions() {
            func.irq_handler.lock().take();
        }
        self.stop_irq_thread(true);
        if dev.kind.has_memory() {
            if let Some(listener) = self.listener.as_ref() {
                listener.device_removed(&dev);
            }
        }
        if let Err(e) = self.bus.lock().power_off() {
            warn!("bus{}: power off failed: {}", self.index, e);
        }
        info!("bus{}: {:?} removed", self.index, dev.kind);
        Ok(Reply::Done)
    }

    /// Check a present I/O card and resynchronize it. A failed IO_ENABLE read
    /// or resync re-runs enumeration.
    fn handle_rescan(&self) -> Completion {
        if let Some(dev) = self.device().filter(|d| d.is_present()) {
            if !dev.kind.has_io() {
                return Err(SdError::NotSupported);
            }
            let mut bus = self.bus.lock();
            let res = bus.sdio_io_enable_reg().and_then(|enabled| {
                debug!("bus{}: rescan, IO_ENABLE {:#04x}", self.index, enabled);
                match protocol_for(dev.kind).reinit(&mut bus, &dev) {
                    Err(SdError::NotSupported) => Ok(()),
                    other => other,
                }
            });
            drop(bus);
            match res {
                Ok(()) => return Ok(Reply::Done),
                Err(e) => warn!("bus{}: rescan failed: {}, re-enumerating", self.index, e),
            }
        }
        self.handle_unplug()?;
        self.handle_plug()
    }

    fn execute(&self, req: &Request) -> Completion {
        let dev = self
            .device()
            .filter(|d| d.is_present())
            .ok_or(SdError::NoDevice)?;
        let mut bus = self.bus.lock();
        match req {
            Request::Read { start, count } => {
                let len = (*count as usize)
                    .checked_mul(MMC_SECTOR_SIZE)
                    .ok_or(SdError::InvalidParameter)?;
                let mut buf = vec![0u8; len];
                bus.read_blocks(&dev, *start, &mut buf)?;
                Ok(Reply::Data(buf))
            }
            Request::Write { start, data } => {
                bus.write_blocks(&dev, *start, data)?;
                Ok(Reply::Done)
            }
            Request::Erase { start, count } => {
                bus.erase(&dev, *start, *count)?;
                Ok(Reply::Done)
            }
            Request::Command { opcode, arg, resp_type } => {
                let mut cmd = Command::new(*opcode, *arg, *resp_type);
                bus.send(&mut cmd, MMC_CMD_DEFAULT_RETRY)?;
                Ok(Reply::Response(cmd.resp))
            }
        }
    }
}

fn worker_loop(ctrl: Weak<Controller>, rx: Receiver<Envelope>) {
    while let Ok(env) = rx.recv() {
        let Some(ctrl) = ctrl.upgrade() else {
            env.complete(Err(SdError::NoDevice));
            break;
        };
        let res = ctrl.handle(&env.msg);
        if let Err(e) = &res {
            debug!("bus{}: {:?} failed: {}", ctrl.index, env.msg, e);
        }
        env.complete(res);
    }
}

// ===== SDIO interrupt thread =====

impl Controller {
    pub(crate) fn start_irq_thread(&self) -> Result<(), SdError> {
        let mut irq = self.irq.lock();
        if irq.is_none() {
            *irq = Some(IrqThread::spawn(self.me.clone(), self.index)?);
        }
        Ok(())
    }

    pub(crate) fn stop_irq_thread(&self, join: bool) {
        let thread = self.irq.lock().take();
        if let Some(thread) = thread {
            thread.stop(join);
            debug!("bus{}: sdio irq thread stopped", self.index);
        }
    }

    pub(crate) fn signal_sdio_irq(&self) {
        if let Some(thread) = self.irq.lock().as_ref() {
            thread.event.notify();
        }
    }
}

// ===== Dispatch handle =====

/// Shared handle on an enumerated memory device.
#[derive(Clone)]
pub struct DeviceHandle {
    ctrl: Arc<Controller>,
    dev: Arc<Device>,
}

impl DeviceHandle {
    pub fn open(bus_num: u32) -> Result<Self, SdError> {
        Controller::open(bus_num)?.device_handle()
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.dev
    }

    pub fn controller(&self) -> &Arc<Controller> {
        &self.ctrl
    }

    /// True while this device is still the one in the slot.
    pub fn present(&self) -> bool {
        self.dev.is_present() && self.ctrl.device().is_some_and(|d| Arc::ptr_eq(&d, &self.dev))
    }

    pub fn cid(&self) -> [u8; 16] {
        self.dev.cid_bytes()
    }

    pub fn sector_count(&self) -> u64 {
        self.dev.sector_count()
    }

    fn check(&self) -> Result<(), SdError> {
        if self.present() { Ok(()) } else { Err(SdError::NoDevice) }
    }

    pub fn read(&self, start: u32, count: u32) -> Result<Vec<u8>, SdError> {
        self.check()?;
        match self.ctrl.do_request(Request::Read { start, count })? {
            Reply::Data(data) => Ok(data),
            _ => Err(SdError::IoError),
        }
    }

    /// Read `buf.len() / 512` sectors into `buf`.
    pub fn read_into(&self, start: u32, buf: &mut [u8]) -> Result<(), SdError> {
        if buf.len() % MMC_SECTOR_SIZE != 0 {
            return Err(SdError::InvalidParameter);
        }
        let data = self.read(start, (buf.len() / MMC_SECTOR_SIZE) as u32)?;
        buf.copy_from_slice(&data);
        Ok(())
    }

    pub fn write(&self, start: u32, data: &[u8]) -> Result<(), SdError> {
        self.check()?;
        self.ctrl
            .do_request(Request::Write {
                start,
                data: data.to_vec(),
            })
            .map(|_| ())
    }

    pub fn erase(&self, start: u32, count: u32) -> Result<(), SdError> {
        self.check()?;
        self.ctrl.do_request(Request::Erase { start, count }).map(|_| ())
    }
}

impl core::fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("bus", &self.ctrl.index)
            .field("dev", &self.dev)
            .finish()
    }
}

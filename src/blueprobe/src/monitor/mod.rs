//! Live traffic monitors
//!
//! Bridges captured HCI or LMP traffic into a pcap stream on the input of
//! an external viewer such as Wireshark. There is one monitor per capture
//! kind, held by [`MonitorRegistry`].
//!
//! - `pcap` - capture-stream framing
//! - `viewer` - viewer process abstraction
//!
//! While a viewer is alive a supervisor thread watches it: when the process
//! exits, the monitor stops; when its input pipe breaks, the monitor is
//! killed. Neither condition is reported to foreground callers.

pub mod pcap;
pub mod viewer;

pub use viewer::{CommandLauncher, ViewerLauncher, ViewerProcess};

use crate::bdaddr::BdAddr;
use crate::channel::{CallbackId, CaptureHandler, CaptureKind, CaptureRecord, CommandChannel};
use crate::error::{Error, Result};
use std::io::{self, Write};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);

type Sink = Arc<Mutex<Option<Box<dyn Write + Send>>>>;

enum Notice {
    PipeBroken,
    Shutdown,
}

struct Supervisor {
    notices: Sender<Notice>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct MonitorState {
    running: bool,
    callback: Option<CallbackId>,
    viewer: Option<Box<dyn ViewerProcess>>,
    sink: Sink,
    supervisor: Option<Supervisor>,
}

struct Monitor {
    kind: CaptureKind,
    channel: Arc<CommandChannel>,
    state: Mutex<MonitorState>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Monitor {
    fn new(kind: CaptureKind, channel: Arc<CommandChannel>) -> Arc<Self> {
        Arc::new(Monitor {
            kind,
            channel,
            state: Mutex::new(MonitorState::default()),
        })
    }

    fn start(
        self: &Arc<Self>,
        launcher: &dyn ViewerLauncher,
        poll_interval: Duration,
        local: BdAddr,
    ) -> Result<()> {
        let mut state = lock(&self.state);
        if state.running {
            return Err(Error::AlreadyRunning(self.kind));
        }
        if state.viewer.is_none() {
            self.spawn_viewer(&mut state, launcher, poll_interval)?;
        }

        let notices = state.supervisor.as_ref().map(|s| s.notices.clone());
        let handler = capture_handler(self.kind, Arc::clone(&state.sink), notices, local);
        state.callback = Some(self.channel.register_callback(self.kind, handler));
        state.running = true;
        info!("{} monitor started", self.kind);
        Ok(())
    }

    fn spawn_viewer(
        self: &Arc<Self>,
        state: &mut MonitorState,
        launcher: &dyn ViewerLauncher,
        poll_interval: Duration,
    ) -> Result<()> {
        let mut viewer = launcher.launch(self.kind).map_err(Error::Viewer)?;
        let header = pcap::global_header(self.kind);
        let written = match viewer.take_input() {
            Some(mut input) => input
                .write_all(&header)
                .and_then(|_| input.flush())
                .map(|_| input),
            None => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "viewer has no input stream",
            )),
        };
        let input = match written {
            Ok(input) => input,
            Err(e) => {
                let _ = viewer.terminate().and_then(|_| viewer.wait());
                return Err(Error::Viewer(e));
            }
        };

        let (notices, inbox) = mpsc::channel();
        let monitor = Arc::downgrade(self);
        let handle = thread::Builder::new()
            .name(format!("blueprobe-{}-viewer", self.kind).to_lowercase())
            .spawn(move || supervise(monitor, inbox, poll_interval))
            .map_err(Error::Viewer)?;

        *lock(&state.sink) = Some(input);
        state.viewer = Some(viewer);
        state.supervisor = Some(Supervisor { notices, handle });
        debug!("{} viewer launched", self.kind);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        let mut state = lock(&self.state);
        if !state.running {
            return Err(Error::NotRunning(self.kind));
        }
        self.stop_locked(&mut state);
        Ok(())
    }

    fn stop_locked(&self, state: &mut MonitorState) {
        if let Some(id) = state.callback.take() {
            self.channel.unregister(id);
        }
        state.running = false;
        info!("{} monitor stopped", self.kind);
    }

    fn kill(&self) {
        let (supervisor, viewer) = {
            let mut state = lock(&self.state);
            if state.running {
                self.stop_locked(&mut state);
            }
            *lock(&state.sink) = None;
            (state.supervisor.take(), state.viewer.take())
        };

        if let Some(supervisor) = supervisor {
            // The supervisor itself may be the one killing us
            if supervisor.handle.thread().id() != thread::current().id() {
                let _ = supervisor.notices.send(Notice::Shutdown);
                let _ = supervisor.handle.join();
            }
        }

        if let Some(mut viewer) = viewer {
            info!("Terminating {} viewer", self.kind);
            if let Err(e) = viewer.terminate().and_then(|_| viewer.wait()) {
                warn!("Error while terminating the {} viewer: {}", self.kind, e);
            }
        }
    }

    /// Returns true once there is no live viewer left to watch.
    fn reap_exited_viewer(&self) -> bool {
        let mut state = lock(&self.state);
        let exited = match state.viewer.as_mut() {
            None => return true,
            Some(viewer) => viewer.has_exited().unwrap_or_else(|e| {
                warn!("Cannot poll the {} viewer: {}", self.kind, e);
                false
            }),
        };
        if !exited {
            return false;
        }

        info!("{} viewer has exited", self.kind);
        if state.running {
            self.stop_locked(&mut state);
        }
        *lock(&state.sink) = None;
        state.viewer = None;
        state.supervisor = None;
        true
    }

    fn is_running(&self) -> bool {
        lock(&self.state).running
    }

    fn has_viewer(&self) -> bool {
        lock(&self.state).viewer.is_some()
    }
}

fn supervise(monitor: Weak<Monitor>, inbox: Receiver<Notice>, poll_interval: Duration) {
    loop {
        let notice = inbox.recv_timeout(poll_interval);
        let Some(monitor) = monitor.upgrade() else {
            return;
        };
        match notice {
            Ok(Notice::Shutdown) | Err(RecvTimeoutError::Disconnected) => return,
            Ok(Notice::PipeBroken) => {
                monitor.kill();
                return;
            }
            Err(RecvTimeoutError::Timeout) => {
                if monitor.reap_exited_viewer() {
                    return;
                }
            }
        }
    }
}

fn capture_handler(
    kind: CaptureKind,
    sink: Sink,
    notices: Option<Sender<Notice>>,
    local: BdAddr,
) -> CaptureHandler {
    Arc::new(move |capture: &CaptureRecord| {
        let frame = pcap::frame(kind, capture, local);
        let mut sink = lock(&sink);
        let Some(writer) = sink.as_mut() else {
            return;
        };
        match writer.write_all(&frame).and_then(|_| writer.flush()) {
            Ok(()) => debug!("{} record of {} bytes", kind, frame.len()),
            Err(e) => {
                warn!("{} viewer input closed ({}); killing the monitor", kind, e);
                *sink = None;
                if let Some(notices) = &notices {
                    let _ = notices.send(Notice::PipeBroken);
                }
            }
        }
    })
}

/// The HCI and LMP monitors of one session.
pub struct MonitorRegistry {
    launcher: Arc<dyn ViewerLauncher>,
    poll_interval: Duration,
    local_address: Mutex<BdAddr>,
    hci: Arc<Monitor>,
    lmp: Arc<Monitor>,
}

impl MonitorRegistry {
    pub fn new(channel: Arc<CommandChannel>, launcher: Arc<dyn ViewerLauncher>) -> Self {
        MonitorRegistry {
            launcher,
            poll_interval: DEFAULT_POLL_INTERVAL,
            local_address: Mutex::new(BdAddr::ZERO),
            hci: Monitor::new(CaptureKind::Hci, Arc::clone(&channel)),
            lmp: Monitor::new(CaptureKind::Lmp, channel),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn monitor(&self, kind: CaptureKind) -> &Arc<Monitor> {
        match kind {
            CaptureKind::Hci => &self.hci,
            CaptureKind::Lmp => &self.lmp,
        }
    }

    /// Our own device address, used to fill in LMP frame addresses.
    pub fn set_local_address(&self, address: BdAddr) {
        *lock(&self.local_address) = address;
    }

    /// Start capturing. Launches a viewer unless one from an earlier run
    /// of this kind is still alive.
    pub fn start(&self, kind: CaptureKind) -> Result<()> {
        let local = *lock(&self.local_address);
        self.monitor(kind)
            .start(self.launcher.as_ref(), self.poll_interval, local)
    }

    /// Stop capturing; the viewer stays open.
    pub fn stop(&self, kind: CaptureKind) -> Result<()> {
        self.monitor(kind).stop()
    }

    /// Stop capturing and terminate the viewer. Termination errors are
    /// logged only.
    pub fn kill(&self, kind: CaptureKind) {
        self.monitor(kind).kill();
    }

    pub fn status(&self, kind: CaptureKind) -> bool {
        self.monitor(kind).is_running()
    }

    pub fn has_viewer(&self, kind: CaptureKind) -> bool {
        self.monitor(kind).has_viewer()
    }
}

impl Drop for MonitorRegistry {
    fn drop(&mut self) {
        self.hci.kill();
        self.lmp.kill();
    }
}

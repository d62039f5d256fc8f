//! Scripted collaborators for driving sessions without real clients.

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use std::{
    cell::Cell,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Once,
    },
};
use tokio::sync::mpsc;

use crate::{
    credentials::CredentialStore,
    launcher::{ClientProcess, LaunchSpec, ProcessEvent, ProcessSpawner},
};

pub struct FakeProcess {
    pid: u32,
    events: Option<mpsc::UnboundedReceiver<ProcessEvent>>,
    sender: mpsc::UnboundedSender<ProcessEvent>,
    terminate_calls: Arc<AtomicUsize>,
    fail_terminate: bool,
    panic_terminate: bool,
}

impl FakeProcess {
    pub fn new(pid: u32) -> Self {
        let (sender, events) = mpsc::unbounded_channel();
        Self {
            pid,
            events: Some(events),
            sender,
            terminate_calls: Arc::new(AtomicUsize::new(0)),
            fail_terminate: false,
            panic_terminate: false,
        }
    }

    pub fn failing(mut self) -> Self {
        self.fail_terminate = true;
        self
    }

    pub fn panicking(mut self) -> Self {
        self.panic_terminate = true;
        self
    }

    pub fn sender(&self) -> mpsc::UnboundedSender<ProcessEvent> {
        self.sender.clone()
    }

    pub fn terminate_calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.terminate_calls)
    }
}

impl ClientProcess for FakeProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<ProcessEvent>> {
        self.events.take()
    }

    fn terminate(&mut self) -> Result<()> {
        self.terminate_calls.fetch_add(1, Ordering::SeqCst);
        if self.panic_terminate {
            panic!("terminate blew up");
        }
        if self.fail_terminate {
            return Err(anyhow!("permission denied"));
        }
        Ok(())
    }
}

/// Hands out [`FakeProcess`]es and keeps their event senders for the test.
#[derive(Default)]
pub struct ScriptedSpawner {
    launches: Mutex<Vec<LaunchSpec>>,
    senders: Mutex<Vec<mpsc::UnboundedSender<ProcessEvent>>>,
    terminate_calls: Mutex<Vec<Arc<AtomicUsize>>>,
    fail_spawn: AtomicBool,
}

impl ScriptedSpawner {
    pub fn fail_next_spawns(&self) {
        self.fail_spawn.store(true, Ordering::SeqCst);
    }

    pub fn launches(&self) -> Vec<LaunchSpec> {
        self.launches.lock().clone()
    }

    pub fn last_sender(&self) -> mpsc::UnboundedSender<ProcessEvent> {
        self.senders.lock().last().cloned().expect("a process was spawned")
    }

    pub fn last_terminate_calls(&self) -> usize {
        self.terminate_calls
            .lock()
            .last()
            .map(|calls| calls.load(Ordering::SeqCst))
            .unwrap_or(0)
    }
}

impl ProcessSpawner for ScriptedSpawner {
    fn spawn(&self, launch: &LaunchSpec) -> Result<Box<dyn ClientProcess>> {
        self.launches.lock().push(launch.clone());
        if self.fail_spawn.load(Ordering::SeqCst) {
            return Err(anyhow!("No such file or directory (os error 2)"));
        }
        let pid = 1000 + self.senders.lock().len() as u32;
        let process = FakeProcess::new(pid);
        self.senders.lock().push(process.sender());
        self.terminate_calls.lock().push(process.terminate_calls());
        Ok(Box::new(process))
    }
}

#[derive(Default)]
pub struct RecordingCredentialStore {
    stored: Mutex<Vec<(String, String, String)>>,
    removed: Mutex<Vec<String>>,
    fail: bool,
}

impl RecordingCredentialStore {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn stored(&self) -> Vec<(String, String, String)> {
        self.stored.lock().clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.removed.lock().clone()
    }
}

impl CredentialStore for RecordingCredentialStore {
    fn store(&self, target: &str, username: &str, password: &str) -> Result<()> {
        if self.fail {
            return Err(anyhow!("credential store unavailable"));
        }
        self.stored
            .lock()
            .push((target.to_string(), username.to_string(), password.to_string()));
        Ok(())
    }

    fn remove(&self, target: &str) -> Result<()> {
        if self.fail {
            return Err(anyhow!("credential store unavailable"));
        }
        self.removed.lock().push(target.to_string());
        Ok(())
    }
}

thread_local! {
    static PANIC_ON_LOG: Cell<bool> = const { Cell::new(false) };
}

/// Global logger that panics on any record emitted from a thread inside
/// [`with_panicking_logger`] and ignores everything else.
struct PanickingLogger;

impl log::Log for PanickingLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        if PANIC_ON_LOG.with(Cell::get) {
            panic!("log sink failed: {}", record.args());
        }
    }

    fn flush(&self) {}
}

static PANICKING_LOGGER: PanickingLogger = PanickingLogger;
static INSTALL_LOGGER: Once = Once::new();

pub fn with_panicking_logger<T>(f: impl FnOnce() -> T) -> T {
    INSTALL_LOGGER.call_once(|| {
        if log::set_logger(&PANICKING_LOGGER).is_ok() {
            log::set_max_level(log::LevelFilter::Trace);
        }
    });
    PANIC_ON_LOG.with(|flag| flag.set(true));
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f));
    PANIC_ON_LOG.with(|flag| flag.set(false));
    match result {
        Ok(value) => value,
        Err(panic) => std::panic::resume_unwind(panic),
    }
}

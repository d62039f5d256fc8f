//! The grace timer treats silence as success. A hung client looks the same
//! as a connected one until the grace period ends; `graceMs: null` turns the
//! heuristic off and leaves the deadline as the only timer.

use std::{
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::{sync::mpsc, task::JoinHandle, time::Instant};
use uuid::Uuid;

use crate::{
    classifier::{Classifier, FailureKind},
    launcher::{OutputStream, ProcessEvent},
    registry::SessionRegistry,
    session::Resolution,
};

pub const BURST_WINDOW: Duration = Duration::from_millis(50);

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Burst {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

impl Burst {
    pub fn push(&mut self, stream: OutputStream, lines: Vec<String>) {
        match stream {
            OutputStream::Stdout => self.stdout.extend(lines),
            OutputStream::Stderr => self.stderr.extend(lines),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.stdout.is_empty() && self.stderr.is_empty()
    }
}

/// Failures on either stream pre-empt a success match in the same burst.
/// Success is only read from stdout.
pub fn evaluate_burst(classifier: &Classifier, burst: &Burst) -> Option<Resolution> {
    for line in burst.stderr.iter().chain(burst.stdout.iter()) {
        if let Some(kind) = classifier.classify_error(line) {
            return Some(Resolution::failed(kind, line));
        }
    }
    if burst.stdout.iter().any(|line| classifier.is_success(line)) {
        return Some(Resolution::Connected);
    }
    None
}

fn spawn_timer(
    registry: Weak<SessionRegistry>,
    id: String,
    instance: Uuid,
    delay: Duration,
    resolution: Resolution,
    label: &'static str,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let Some(registry) = registry.upgrade() else {
            return;
        };
        if registry.resolve(&id, instance, resolution) {
            registry.append_log(&id, format!("{label} timer resolved the session"));
        }
    })
}

pub fn start_timers(
    registry: &Arc<SessionRegistry>,
    id: &str,
    instance: Uuid,
    grace: Option<Duration>,
    deadline: Duration,
) -> Vec<JoinHandle<()>> {
    let mut timers = Vec::with_capacity(2);
    if let Some(grace) = grace {
        timers.push(spawn_timer(
            Arc::downgrade(registry),
            id.to_string(),
            instance,
            grace,
            Resolution::Connected,
            "grace",
        ));
    }
    timers.push(spawn_timer(
        Arc::downgrade(registry),
        id.to_string(),
        instance,
        deadline,
        Resolution::failed(
            FailureKind::TimeoutFailure,
            format!("no connection after {}s", deadline.as_secs()),
        ),
        "deadline",
    ));
    timers
}

/// Windows/macOS clients are fire-and-forget: the session is reported
/// connected after a fixed delay and never corrected afterwards.
pub fn start_optimistic_timer(
    registry: &Arc<SessionRegistry>,
    id: &str,
    instance: Uuid,
    delay: Duration,
) -> JoinHandle<()> {
    spawn_timer(
        Arc::downgrade(registry),
        id.to_string(),
        instance,
        delay,
        Resolution::Connected,
        "optimistic connect",
    )
}

fn record_output(
    registry: &SessionRegistry,
    id: &str,
    burst: &mut Burst,
    stream: OutputStream,
    lines: Vec<String>,
) {
    let level = match stream {
        OutputStream::Stdout => "OUT",
        OutputStream::Stderr => "ERR",
    };
    for line in &lines {
        registry.append_log_with_level(id, level, line.clone());
    }
    burst.push(stream, lines);
}

pub fn spawn_listener(
    registry: &Arc<SessionRegistry>,
    classifier: Arc<Classifier>,
    id: &str,
    instance: Uuid,
    mut events: mpsc::UnboundedReceiver<ProcessEvent>,
) -> JoinHandle<()> {
    let registry = Arc::downgrade(registry);
    let id = id.to_string();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let Some(registry) = registry.upgrade() else {
                return;
            };
            let mut burst = Burst::default();
            let mut exit = None;
            match event {
                ProcessEvent::Output { stream, lines } => {
                    record_output(&registry, &id, &mut burst, stream, lines);
                    // The two streams are read separately; gather what the
                    // other one printed alongside before judging.
                    let window_end = Instant::now() + BURST_WINDOW;
                    loop {
                        match tokio::time::timeout_at(window_end, events.recv()).await {
                            Ok(Some(ProcessEvent::Output { stream, lines })) => {
                                record_output(&registry, &id, &mut burst, stream, lines);
                            }
                            Ok(Some(ProcessEvent::Exited(code))) => {
                                exit = Some(code);
                                break;
                            }
                            Ok(None) | Err(_) => break,
                        }
                    }
                }
                ProcessEvent::Exited(code) => exit = Some(code),
            }

            // Once resolved, further matches are no-ops.
            if let Some(resolution) = evaluate_burst(&classifier, &burst) {
                registry.resolve(&id, instance, resolution);
            }
            if let Some(code) = exit {
                registry.handle_exit(&id, instance, code);
                return;
            }
        }
    })
}

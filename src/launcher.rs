use anyhow::{Context, Result};
use std::{process::Stdio, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::{Child, Command},
    sync::{mpsc, oneshot},
};

const READ_CHUNK_BYTES: usize = 4096;
const MAX_PARTIAL_LINE_BYTES: usize = 16 * 1024;
const STREAM_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);
const TERMINATE_GRACE: Duration = Duration::from_secs(3);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Pipe stdout/stderr and report exit. Fire-and-forget launches leave
    /// the output attached to nothing.
    pub monitored: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProcessEvent {
    Output {
        stream: OutputStream,
        lines: Vec<String>,
    },
    Exited(Option<i32>),
}

pub trait ClientProcess: Send {
    fn pid(&self) -> Option<u32>;

    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<ProcessEvent>>;

    /// Asks the process to stop. A process that already exited is not an error.
    fn terminate(&mut self) -> Result<()>;
}

pub trait ProcessSpawner: Send + Sync {
    fn spawn(&self, launch: &LaunchSpec) -> Result<Box<dyn ClientProcess>>;
}

#[derive(Default)]
pub struct LineBuffer {
    partial: Vec<u8>,
}

impl LineBuffer {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for byte in chunk {
            match byte {
                b'\n' | b'\r' => {
                    if !self.partial.is_empty() {
                        lines.push(String::from_utf8_lossy(&self.partial).into_owned());
                        self.partial.clear();
                    }
                }
                other => {
                    if self.partial.len() >= MAX_PARTIAL_LINE_BYTES {
                        lines.push(String::from_utf8_lossy(&self.partial).into_owned());
                        self.partial.clear();
                    }
                    self.partial.push(*other);
                }
            }
        }
        lines
    }

    pub fn finish(&mut self) -> Option<String> {
        if self.partial.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.partial).into_owned();
        self.partial.clear();
        Some(line)
    }
}

#[derive(Default)]
pub struct TokioSpawner;

impl ProcessSpawner for TokioSpawner {
    fn spawn(&self, launch: &LaunchSpec) -> Result<Box<dyn ClientProcess>> {
        let mut command = Command::new(&launch.program);
        command.args(&launch.args).stdin(Stdio::null());
        if launch.monitored {
            command.stdout(Stdio::piped()).stderr(Stdio::piped());
        } else {
            command.stdout(Stdio::null()).stderr(Stdio::null());
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to start {}", launch.program))?;
        let pid = child.id();

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = oneshot::channel();

        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(read_stream(
                stdout,
                OutputStream::Stdout,
                events_tx.clone(),
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(read_stream(
                stderr,
                OutputStream::Stderr,
                events_tx.clone(),
            )));
        }

        let program = launch.program.clone();
        tokio::spawn(async move {
            let status = supervise(&mut child, kill_rx).await;
            // Let the readers flush the final diagnostics before the exit is seen.
            for reader in readers {
                let _ = tokio::time::timeout(STREAM_DRAIN_TIMEOUT, reader).await;
            }
            let code = match status {
                Ok(status) => status.code(),
                Err(err) => {
                    log::warn!("failed to wait for {program}: {err}");
                    None
                }
            };
            log::debug!("{program} (pid {pid:?}) exited with code {code:?}");
            let _ = events_tx.send(ProcessEvent::Exited(code));
        });

        Ok(Box::new(TokioClientProcess {
            pid,
            kill_tx: Some(kill_tx),
            events: Some(events_rx),
        }))
    }
}

struct TokioClientProcess {
    pid: Option<u32>,
    kill_tx: Option<oneshot::Sender<()>>,
    events: Option<mpsc::UnboundedReceiver<ProcessEvent>>,
}

impl ClientProcess for TokioClientProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<ProcessEvent>> {
        self.events.take()
    }

    fn terminate(&mut self) -> Result<()> {
        if let Some(kill_tx) = self.kill_tx.take() {
            // The supervisor is gone once the process has exited.
            let _ = kill_tx.send(());
        }
        Ok(())
    }
}

async fn read_stream<R>(mut reader: R, stream: OutputStream, tx: mpsc::UnboundedSender<ProcessEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut buffer = LineBuffer::default();
    let mut chunk = vec![0u8; READ_CHUNK_BYTES];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                let lines = buffer.push(&chunk[..n]);
                if !lines.is_empty() && tx.send(ProcessEvent::Output { stream, lines }).is_err() {
                    return;
                }
            }
            Err(err) => {
                log::debug!("client {stream:?} read failed: {err}");
                break;
            }
        }
    }
    if let Some(line) = buffer.finish() {
        let _ = tx.send(ProcessEvent::Output {
            stream,
            lines: vec![line],
        });
    }
}

async fn supervise(
    child: &mut Child,
    mut kill_rx: oneshot::Receiver<()>,
) -> std::io::Result<std::process::ExitStatus> {
    tokio::select! {
        status = child.wait() => return status,
        Ok(()) = &mut kill_rx => {}
    }

    request_stop(child);
    match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            let _ = child.start_kill();
            child.wait().await
        }
    }
}

#[cfg(unix)]
fn request_stop(child: &mut Child) {
    use nix::{
        sys::signal::{kill, Signal},
        unistd::Pid,
    };

    let Some(pid) = child.id() else {
        return;
    };
    if let Err(err) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        log::debug!("SIGTERM to pid {pid} failed ({err}); killing");
        let _ = child.start_kill();
    }
}

#[cfg(not(unix))]
fn request_stop(child: &mut Child) {
    let _ = child.start_kill();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_buffer_holds_partial_lines_back() {
        let mut buffer = LineBuffer::default();
        assert!(buffer.push(b"[INFO] gdi_").is_empty());
        assert_eq!(buffer.push(b"init done\nnext"), vec!["[INFO] gdi_init done"]);
        assert_eq!(buffer.finish(), Some("next".to_string()));
        assert_eq!(buffer.finish(), None);
    }

    #[test]
    fn line_buffer_splits_crlf_and_skips_blank_lines() {
        let mut buffer = LineBuffer::default();
        assert_eq!(buffer.push(b"one\r\n\r\ntwo\n"), vec!["one", "two"]);
    }

    #[test]
    fn line_buffer_caps_runaway_lines() {
        let mut buffer = LineBuffer::default();
        let lines = buffer.push(&vec![b'x'; MAX_PARTIAL_LINE_BYTES + 10]);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].len(), MAX_PARTIAL_LINE_BYTES);
        assert_eq!(buffer.finish().map(|l| l.len()), Some(10));
    }

    #[tokio::test]
    async fn missing_executable_is_a_spawn_error() {
        let launch = LaunchSpec {
            program: "definitely-not-an-rdp-client-binary".to_string(),
            args: Vec::new(),
            monitored: true,
        };
        assert!(TokioSpawner.spawn(&launch).is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn monitored_process_reports_output_then_exit() {
        let launch = LaunchSpec {
            program: "sh".to_string(),
            args: vec![
                "-c".to_string(),
                "echo hello; echo oops 1>&2; exit 3".to_string(),
            ],
            monitored: true,
        };
        let mut process = TokioSpawner.spawn(&launch).expect("spawn sh");
        let mut events = process.take_events().expect("events");
        assert!(process.take_events().is_none());

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let exit = loop {
            match events.recv().await.expect("event") {
                ProcessEvent::Output {
                    stream: OutputStream::Stdout,
                    lines,
                } => stdout.extend(lines),
                ProcessEvent::Output {
                    stream: OutputStream::Stderr,
                    lines,
                } => stderr.extend(lines),
                ProcessEvent::Exited(code) => break code,
            }
        };
        assert_eq!(stdout, vec!["hello"]);
        assert_eq!(stderr, vec!["oops"]);
        assert_eq!(exit, Some(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn terminate_stops_a_running_process() {
        let launch = LaunchSpec {
            program: "sleep".to_string(),
            args: vec!["30".to_string()],
            monitored: true,
        };
        let mut process = TokioSpawner.spawn(&launch).expect("spawn sleep");
        let mut events = process.take_events().expect("events");
        process.terminate().expect("terminate");
        // A second request after the first is harmless.
        process.terminate().expect("terminate again");

        let exit = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if let Some(ProcessEvent::Exited(code)) = events.recv().await {
                    return code;
                }
            }
        })
        .await
        .expect("process exits");
        assert_eq!(exit, None);
    }
}

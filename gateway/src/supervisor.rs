//! The process supervisor (C2): owns one backend's JVM, its stdio, and its
//! log hub. One [`Supervisor`] exists per `Start()` call and is discarded on
//! exit; the next `Start()` creates a fresh one.

use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use parking_lot::Mutex as SyncMutex;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{Notify, broadcast};
use tokio::time::sleep;

/// Capacity of the per-backend scrollback ring buffer.
pub const LOG_RING_CAPACITY: usize = 2000;
/// Lines replayed to a freshly attached console subscriber.
pub const CONSOLE_REPLAY_LINES: usize = 20;

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// The four named channels the original keeps as separate logger instances,
/// folded here into one field on a single structured log line — see
/// SPEC_FULL.md section 4.2.
#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogChannel {
    Server,
    User,
    Chat,
    Stdout,
    Stderr,
}

#[derive(Clone, Debug, Serialize)]
pub struct LogLine {
    #[serde(with = "unix_millis")]
    pub timestamp: SystemTime,
    pub level: LogLevel,
    pub channel: LogChannel,
    pub message: String,
}

mod unix_millis {
    use serde::Serializer;
    use std::time::SystemTime;

    pub fn serialize<S: Serializer>(t: &SystemTime, s: S) -> Result<S::Ok, S::Error> {
        let millis = t
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        s.serialize_u64(millis)
    }
}

/// Bounded ring buffer with random access by index, plus a live fan-out for
/// subscribers — the log hub of spec section 4.2.
pub struct LogHub {
    ring: SyncMutex<VecDeque<LogLine>>,
    capacity: usize,
    live: broadcast::Sender<LogLine>,
}

impl LogHub {
    pub fn new(capacity: usize) -> Self {
        let (live, _) = broadcast::channel(256);
        Self {
            ring: SyncMutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            live,
        }
    }

    pub fn push(&self, channel: LogChannel, level: LogLevel, message: impl Into<String>) {
        let line = LogLine {
            timestamp: SystemTime::now(),
            level,
            channel,
            message: message.into(),
        };
        {
            let mut ring = self.ring.lock();
            if ring.len() >= self.capacity {
                ring.pop_front();
            }
            ring.push_back(line.clone());
        }
        // No active subscribers is the common case; ignore the send error.
        let _ = self.live.send(line);
    }

    /// Returns up to the last `n` lines, oldest first.
    pub fn last_n(&self, n: usize) -> Vec<LogLine> {
        let ring = self.ring.lock();
        let skip = ring.len().saturating_sub(n);
        ring.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.ring.lock().len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogLine> {
        self.live.subscribe()
    }
}

/// One running (or just-exited) backend process.
pub struct Supervisor {
    name: String,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    running: Arc<AtomicBool>,
    exited: Arc<Notify>,
    kill_requested: Arc<Notify>,
    pub log: Arc<LogHub>,
}

async fn pump_lines<R>(reader: R, channel: LogChannel, level: LogLevel, log: Arc<LogHub>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => log.push(channel, level, line),
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(?e, "error reading child output line");
                break;
            }
        }
    }
}

impl Supervisor {
    /// Spawns the child and wires up stdio capture. Returns once the process
    /// is spawned, not once it is "ready" — per spec section 4.2.
    pub fn spawn(
        name: &str,
        working_dir: &Path,
        executable: &str,
        args: &[String],
    ) -> std::io::Result<Arc<Self>> {
        let mut cmd = Command::new(executable);
        cmd.current_dir(working_dir)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn()?;
        let stdin = child.stdin.take();
        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");

        let log = Arc::new(LogHub::new(LOG_RING_CAPACITY));
        tokio::spawn(pump_lines(
            stdout,
            LogChannel::Stdout,
            LogLevel::Info,
            log.clone(),
        ));
        tokio::spawn(pump_lines(
            stderr,
            LogChannel::Stderr,
            LogLevel::Error,
            log.clone(),
        ));

        let running = Arc::new(AtomicBool::new(true));
        let exited = Arc::new(Notify::new());
        let kill_requested = Arc::new(Notify::new());

        let sup = Arc::new(Supervisor {
            name: name.to_owned(),
            stdin: tokio::sync::Mutex::new(stdin),
            running: running.clone(),
            exited: exited.clone(),
            kill_requested: kill_requested.clone(),
            log: log.clone(),
        });

        let name = name.to_owned();
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    match status {
                        Ok(status) if status.success() => {
                            log.push(LogChannel::Server, LogLevel::Info, format!("backend {name} exited successfully"));
                        }
                        Ok(status) => {
                            log.push(LogChannel::Server, LogLevel::Error, format!("backend {name} exited with {status}"));
                        }
                        Err(e) => {
                            log.push(LogChannel::Server, LogLevel::Error, format!("backend {name} wait error: {e}"));
                        }
                    }
                }
                _ = kill_requested.notified() => {
                    if let Err(e) = child.kill().await {
                        log.push(LogChannel::Server, LogLevel::Error, format!("backend {name} kill error: {e}"));
                    }
                    let _ = child.wait().await;
                    log.push(LogChannel::Server, LogLevel::Info, format!("backend {name} killed"));
                }
            }
            running.store(false, Ordering::SeqCst);
            exited.notify_waiters();
        });

        Ok(sup)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Writes `s\n` to stdin. Fails if not running.
    pub async fn send_line(&self, s: &str) -> anyhow::Result<()> {
        if !self.is_running() {
            anyhow::bail!("backend {} is not running", self.name);
        }
        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("backend {} has no stdin", self.name))?;
        stdin.write_all(s.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        Ok(())
    }

    async fn await_exit(&self) {
        if !self.is_running() {
            return;
        }
        self.exited.notified().await;
    }

    /// Sends the in-game countdown sequence (spec section 4.5) then `stop`,
    /// and blocks until the process exits.
    pub async fn stop_gracefully(&self, has_players: bool) -> anyhow::Result<()> {
        if !self.is_running() {
            return Ok(());
        }

        if has_players {
            self.send_line("/title @a times 0.5s 0.3s 0.5s").await?;
            let subtitle = "/title @a subtitle {\"text\": \"Server is going to shut down\"}";
            for i in (1..=5).rev() {
                self.send_line(&format!("/title @a title {{\"text\": \"{i}\"}}"))
                    .await?;
                self.send_line(subtitle).await?;
                sleep(Duration::from_secs(1)).await;
            }
            self.send_line("/title @a times 2s 0s 2s").await?;
            self.send_line("/title @a title {\"text\": \"Server is shutting down\"}")
                .await?;
            sleep(Duration::from_secs(2)).await;
        }

        self.send_line("stop").await?;
        self.await_exit().await;
        Ok(())
    }

    /// Force-terminates without the countdown.
    pub async fn kill(&self) -> anyhow::Result<()> {
        if !self.is_running() {
            return Ok(());
        }
        self.kill_requested.notify_one();
        self.await_exit().await;
        Ok(())
    }
}

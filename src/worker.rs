//! Worker process supervision.
//!
//! Exactly one speech-to-text worker process is alive at a time. The
//! supervisor owns the OS process handle: it spawns the worker with the
//! capture settings serialized into `VOXKEY_*` environment variables, pumps
//! its stdout/stderr into the injected log sink, auto-restarts crashes within
//! the ledger bound, and escalates graceful stop to a forced kill.

use std::{
    collections::VecDeque,
    io::{BufRead, BufReader},
    path::PathBuf,
    process::{Command, Stdio},
    sync::{Arc, Condvar, Mutex},
    time::{Duration, Instant},
};

use anyhow::{anyhow, bail, Context, Result};

use crate::{settings, settings::Settings, trace};

pub const RESTART_WINDOW: Duration = Duration::from_secs(30);
pub const MAX_RESTARTS_IN_WINDOW: usize = 3;
pub const RESTART_DELAY: Duration = Duration::from_millis(500);
pub const STOP_GRACE: Duration = Duration::from_secs(2);

/// How long `start()` waits for a previous child to be reaped before giving
/// up. Only relevant right after a forced kill during reload.
const REAP_WAIT: Duration = Duration::from_secs(5);

pub type LogSink = Arc<dyn Fn(&str) -> Result<()> + Send + Sync>;
pub type FatalHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Sliding-window crash record. Pruned to the trailing [`RESTART_WINDOW`] on
/// every crash; the caller compares the pruned count against
/// [`MAX_RESTARTS_IN_WINDOW`].
#[derive(Debug, Default)]
pub struct RestartLedger {
    crashes: VecDeque<Instant>,
}

impl RestartLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a crash at `now` and returns the pruned in-window count,
    /// including this crash.
    pub fn record(&mut self, now: Instant) -> usize {
        self.crashes.push_back(now);
        while let Some(oldest) = self.crashes.front() {
            if now.duration_since(*oldest) > RESTART_WINDOW {
                self.crashes.pop_front();
            } else {
                break;
            }
        }
        self.crashes.len()
    }
}

struct Inner {
    pid: Option<u32>,
    exited: bool,
    stopping: bool,
    generation: u64,
    ledger: RestartLedger,
}

struct Shared {
    inner: Mutex<Inner>,
    exited_cv: Condvar,
}

#[derive(Clone)]
pub struct WorkerSupervisor {
    shared: Arc<Shared>,
    settings: Arc<Mutex<Settings>>,
    log_sink: LogSink,
    on_fatal: FatalHook,
    data_dir: PathBuf,
}

impl WorkerSupervisor {
    pub fn new(
        data_dir: PathBuf,
        settings: Settings,
        log_sink: LogSink,
        on_fatal: FatalHook,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    pid: None,
                    exited: true,
                    stopping: false,
                    generation: 0,
                    ledger: RestartLedger::new(),
                }),
                exited_cv: Condvar::new(),
            }),
            settings: Arc::new(Mutex::new(settings)),
            log_sink,
            on_fatal,
            data_dir,
        }
    }

    /// Replaces the spawn-time settings snapshot. Takes effect on the next
    /// `start()`; live children are unaffected.
    pub fn apply_settings(&self, settings: Settings) {
        *self.settings.lock().unwrap() = settings;
    }

    pub fn is_running(&self) -> bool {
        let g = self.shared.inner.lock().unwrap();
        g.pid.is_some() && !g.exited
    }

    /// Spawns the worker. No-op if one is already live; a fresh supervised
    /// run gets a fresh crash ledger.
    pub fn start(&self) -> Result<()> {
        let mut g = self.shared.inner.lock().unwrap();
        if g.pid.is_some() && !g.exited {
            return Ok(());
        }
        if !g.exited {
            // A forced kill was issued but the wait thread has not reaped yet.
            let (g2, timeout) = self
                .shared
                .exited_cv
                .wait_timeout_while(g, REAP_WAIT, |inner| !inner.exited)
                .unwrap();
            g = g2;
            if timeout.timed_out() {
                bail!("E_WORKER_STILL_RUNNING: previous worker has not exited");
            }
        }
        g.stopping = false;
        g.ledger = RestartLedger::new();
        self.spawn_locked(&mut g)
    }

    fn spawn_locked(&self, g: &mut Inner) -> Result<()> {
        let snapshot = self.settings.lock().unwrap().clone();
        let mut cmd = Command::new(&snapshot.worker_command);
        cmd.args(&snapshot.worker_args)
            .envs(settings::worker_env(&snapshot))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().with_context(|| {
            format!(
                "E_WORKER_SPAWN: failed to spawn worker '{}'",
                snapshot.worker_command
            )
        })?;
        let pid = child.id();

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("E_WORKER_SPAWN: worker stdout missing"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("E_WORKER_SPAWN: worker stderr missing"))?;
        self.pump_lines("worker-stdout", stdout);
        self.pump_lines("worker-stderr", stderr);

        g.pid = Some(pid);
        g.exited = false;
        g.generation += 1;
        let generation = g.generation;

        trace::event(
            &self.data_dir,
            None,
            "Worker",
            "WK.spawn",
            "ok",
            Some(serde_json::json!({"pid": pid, "command": snapshot.worker_command})),
        );

        let this = self.clone();
        let _ = std::thread::Builder::new()
            .name("worker-wait".to_string())
            .spawn(move || this.wait_for_exit(child, generation));
        Ok(())
    }

    fn pump_lines<R: std::io::Read + Send + 'static>(&self, name: &str, pipe: R) {
        let sink = self.log_sink.clone();
        let _ = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let reader = BufReader::new(pipe);
                for line in reader.lines() {
                    match line {
                        // Sink failures never propagate back into supervision.
                        Ok(line) => {
                            let _ = (sink)(&line);
                        }
                        Err(_) => break,
                    }
                }
            });
    }

    fn wait_for_exit(&self, mut child: std::process::Child, generation: u64) {
        let status = child.wait();

        let (stopping, clean) = {
            let mut g = self.shared.inner.lock().unwrap();
            if g.generation != generation {
                return;
            }
            g.exited = true;
            g.pid = None;
            self.shared.exited_cv.notify_all();
            let clean = status.as_ref().map(|st| st.success()).unwrap_or(false);
            (g.stopping, clean)
        };

        let code = status
            .ok()
            .and_then(|st| st.code())
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        trace::event(
            &self.data_dir,
            None,
            "Worker",
            "WK.exit",
            if stopping || clean { "ok" } else { "err" },
            Some(serde_json::json!({"code": code, "requested": stopping})),
        );

        if stopping || clean {
            return;
        }

        let crashes = {
            let mut g = self.shared.inner.lock().unwrap();
            g.ledger.record(Instant::now())
        };

        if crashes > MAX_RESTARTS_IN_WINDOW {
            let msg = format!(
                "E_RESTART_LIMIT: worker crashed {crashes} times within {}s; not restarting",
                RESTART_WINDOW.as_secs()
            );
            trace::event(
                &self.data_dir,
                None,
                "Worker",
                "WK.restart_limit",
                "err",
                Some(serde_json::json!({"crashes": crashes})),
            );
            (self.on_fatal)(&msg);
            return;
        }

        trace::event(
            &self.data_dir,
            None,
            "Worker",
            "WK.restart",
            "ok",
            Some(serde_json::json!({"crashes": crashes})),
        );
        std::thread::sleep(RESTART_DELAY);

        let mut g = self.shared.inner.lock().unwrap();
        if g.stopping {
            return;
        }
        if let Err(e) = self.spawn_locked(&mut g) {
            drop(g);
            (self.on_fatal)(&format!("E_WORKER_SPAWN: restart failed: {e}"));
        }
    }

    /// Graceful stop: flag the exit as intentional, give the child
    /// [`STOP_GRACE`] to leave on its own (the coordinator has already sent
    /// `QUIT`), then force-kill the process tree. Idempotent.
    pub fn stop(&self) {
        let g = self.shared.inner.lock().unwrap();
        if g.stopping && g.exited {
            return;
        }
        let mut g = g;
        g.stopping = true;
        let Some(pid) = g.pid else {
            return;
        };
        if g.exited {
            return;
        }

        let (g2, timeout) = self
            .shared
            .exited_cv
            .wait_timeout_while(g, STOP_GRACE, |inner| !inner.exited)
            .unwrap();
        drop(g2);

        if timeout.timed_out() {
            trace::event(
                &self.data_dir,
                None,
                "Worker",
                "WK.force_kill",
                "ok",
                Some(serde_json::json!({"pid": pid})),
            );
            let _ = kill_tree(pid);
        }
        trace::event(&self.data_dir, None, "Worker", "WK.stop", "ok", None);
    }
}

#[cfg(unix)]
fn kill_tree(pid: u32) -> Result<()> {
    let status = Command::new("kill")
        .args(["-9", &pid.to_string()])
        .status()
        .context("kill failed")?;
    if !status.success() {
        return Err(anyhow!("kill exit={status}"));
    }
    Ok(())
}

#[cfg(windows)]
fn kill_tree(pid: u32) -> Result<()> {
    let status = Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .status()
        .context("taskkill failed")?;
    if !status.success() {
        return Err(anyhow!("taskkill exit={status}"));
    }
    Ok(())
}

//! Session orchestration.
//!
//! A single coordinator task consumes one event queue (trigger edges,
//! channel messages, timer firings, settings changes, shutdown) and drives
//! the session state machine: at most one active session, `START` never sent
//! re-entrantly, `STOP` at most once per session, timers cleared on every
//! path that leaves `Recording`. All collaborators are injected at
//! construction; the coordinator is the only mutator of session state.

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Result;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{
    channel::ChannelEvent,
    protocol::{AutoStopReason, InboundMessage, OutboundMessage, StartReason},
    settings::{self, Settings, TriggerMode},
    trace,
    triggers::TriggerEvent,
};

pub const SUCCESS_REVERT_MS: u64 = 1500;
pub const ERROR_REVERT_MS: u64 = 3000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Recording,
    Transcribing,
}

/// How a recording session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopKind {
    Manual,
    Silence,
    Timeout,
}

impl StopKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopKind::Manual => "manual",
            StopKind::Silence => "silence",
            StopKind::Timeout => "timeout",
        }
    }
}

/// Outward status reports. `Success` and `Error` are transient annotations
/// on `Idle` and revert automatically.
#[derive(Debug, Clone, PartialEq)]
pub enum Status {
    Idle,
    Recording { reason: StartReason },
    Transcribing { stop: StopKind },
    Success { transcript: String },
    Error { code: String, message: String },
    ApplyingSettings,
    Fatal { code: String, message: String },
}

#[derive(Debug)]
pub enum CoordinatorEvent {
    Trigger(TriggerEvent),
    Channel(ChannelEvent),
    AutoStopElapsed { session: u64 },
    StatusRevertElapsed { revert: u64 },
    ApplySettings(Settings),
    BackendRestartFinished { ok: bool, message: String },
    /// A non-recoverable condition raised outside the loop (the
    /// supervisor's restart-limit hook).
    FatalCondition { code: String, message: String },
    Shutdown,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Idle => write!(f, "idle"),
            Status::Recording { reason } => write!(f, "recording ({})", reason.as_str()),
            Status::Transcribing { stop } => write!(f, "transcribing ({} stop)", stop.as_str()),
            Status::Success { transcript } => write!(f, "done: {transcript}"),
            Status::Error { code, message } => write!(f, "error {code}: {message}"),
            Status::ApplyingSettings => write!(f, "applying settings"),
            Status::Fatal { code, message } => write!(f, "fatal {code}: {message}"),
        }
    }
}

/// The narrow slice of the control channel the coordinator needs.
pub trait ControlPort: Send + Sync {
    fn is_connected(&self) -> bool;
    fn send(&self, msg: &OutboundMessage);
}

/// Collaborator seams, injected once at construction.
pub struct SessionDeps {
    pub port: Arc<dyn ControlPort>,
    /// Output delivery (clipboard/paste in the real shell).
    pub deliver: Arc<dyn Fn(&str) -> Result<()> + Send + Sync>,
    /// Status reporting toward the UI surface.
    pub report: Arc<dyn Fn(&Status) + Send + Sync>,
    /// Clears the trigger controller's edge state after a session.
    pub reset_trigger: Arc<dyn Fn() + Send + Sync>,
    /// Kicks off the unbounded reconnect loop (owner-side single flight).
    pub request_reconnect: Arc<dyn Fn() + Send + Sync>,
    /// Runs the supervised reload (close channel, restart worker,
    /// reconnect); completion arrives as `BackendRestartFinished`.
    pub restart_backend: Arc<dyn Fn(Settings) + Send + Sync>,
}

pub struct SessionCoordinator {
    deps: SessionDeps,
    settings: Settings,
    events_tx: mpsc::UnboundedSender<CoordinatorEvent>,
    data_dir: PathBuf,

    phase: SessionPhase,
    active: bool,
    session_seq: u64,
    session_id: Option<String>,
    auto_stop: Option<tokio::task::JoinHandle<()>>,
    revert_seq: u64,
    revert: Option<tokio::task::JoinHandle<()>>,

    reconnecting: bool,
    reloading: bool,
    fatal: bool,
    shutting_down: bool,
}

impl SessionCoordinator {
    pub fn new(
        data_dir: PathBuf,
        settings: Settings,
        deps: SessionDeps,
        events_tx: mpsc::UnboundedSender<CoordinatorEvent>,
    ) -> Self {
        Self {
            deps,
            settings,
            events_tx,
            data_dir,
            phase: SessionPhase::Idle,
            active: false,
            session_seq: 0,
            session_id: None,
            auto_stop: None,
            revert_seq: 0,
            revert: None,
            reconnecting: false,
            reloading: false,
            fatal: false,
            shutting_down: false,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Drives the state machine until shutdown. Events are processed one at
    /// a time; no transition is interrupted by another.
    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<CoordinatorEvent>) {
        while let Some(ev) = rx.recv().await {
            let is_shutdown = matches!(ev, CoordinatorEvent::Shutdown);
            self.handle_event(ev);
            if is_shutdown {
                break;
            }
        }
    }

    pub fn handle_event(&mut self, ev: CoordinatorEvent) {
        if self.fatal && !matches!(ev, CoordinatorEvent::Shutdown) {
            return;
        }
        match ev {
            CoordinatorEvent::Trigger(edge) => self.on_trigger(edge),
            CoordinatorEvent::Channel(ChannelEvent::Inbound(msg)) => self.on_inbound(msg),
            CoordinatorEvent::Channel(ChannelEvent::Closed) => self.on_channel_closed(),
            CoordinatorEvent::AutoStopElapsed { session } => self.on_auto_stop_elapsed(session),
            CoordinatorEvent::StatusRevertElapsed { revert } => self.on_revert_elapsed(revert),
            CoordinatorEvent::ApplySettings(new) => self.on_apply_settings(new),
            CoordinatorEvent::BackendRestartFinished { ok, message } => {
                self.on_backend_restart_finished(ok, message)
            }
            CoordinatorEvent::FatalCondition { code, message } => {
                self.report_fatal(&code, &message)
            }
            CoordinatorEvent::Shutdown => self.on_shutdown(),
        }
    }

    fn on_trigger(&mut self, edge: TriggerEvent) {
        if self.reloading || self.shutting_down {
            return;
        }
        match self.settings.trigger_mode {
            TriggerMode::HoldToTalk => match edge {
                TriggerEvent::ArmStart => self.start_session(StartReason::Hotkey),
                TriggerEvent::ArmStop => self.stop_session(StopKind::Manual),
            },
            TriggerMode::PressToTalk => {
                // The same release edge arms when idle and stops when active;
                // the press edge carries no meaning in this mode.
                if edge == TriggerEvent::ArmStop {
                    if self.active {
                        self.stop_session(StopKind::Manual);
                    } else {
                        self.start_session(StartReason::Tap);
                    }
                }
            }
            TriggerMode::WakeWord => {
                trace::event(
                    &self.data_dir,
                    self.session_id.as_deref(),
                    "Session",
                    "SES.trigger_ignored",
                    "skipped",
                    Some(serde_json::json!({"mode": "wake-word"})),
                );
            }
        }
    }

    fn start_session(&mut self, reason: StartReason) {
        if self.active {
            trace::event(
                &self.data_dir,
                self.session_id.as_deref(),
                "Session",
                "SES.reentrant_start",
                "skipped",
                Some(serde_json::json!({"reason": reason.as_str()})),
            );
            return;
        }
        if !self.deps.port.is_connected() {
            self.report_error(
                "E_CHANNEL_DISCONNECTED",
                "cannot start recording: worker connection is down",
            );
            return;
        }

        self.clear_revert();
        self.active = true;
        self.phase = SessionPhase::Recording;
        self.session_seq += 1;
        let session_id = Uuid::new_v4().to_string();
        self.session_id = Some(session_id);

        self.deps.port.send(&OutboundMessage::Start {
            reason: Some(reason),
        });
        // The worker runs its own silence monitor for wake and tap sessions;
        // our timer is the maximum-duration bound for the same modes.
        if reason != StartReason::Hotkey {
            self.arm_auto_stop();
        }

        trace::event(
            &self.data_dir,
            self.session_id.as_deref(),
            "Session",
            "SES.start",
            "ok",
            Some(serde_json::json!({"reason": reason.as_str()})),
        );
        (self.deps.report)(&Status::Recording { reason });
    }

    fn stop_session(&mut self, kind: StopKind) {
        if !self.active || self.phase != SessionPhase::Recording {
            trace::event(
                &self.data_dir,
                self.session_id.as_deref(),
                "Session",
                "SES.stop_ignored",
                "skipped",
                Some(serde_json::json!({"kind": kind.as_str()})),
            );
            return;
        }

        self.clear_auto_stop();
        self.deps.port.send(&OutboundMessage::Stop {
            language: self.settings.language.clone(),
        });
        self.phase = SessionPhase::Transcribing;

        trace::event(
            &self.data_dir,
            self.session_id.as_deref(),
            "Session",
            "SES.stop",
            "ok",
            Some(serde_json::json!({"kind": kind.as_str()})),
        );
        (self.deps.report)(&Status::Transcribing { stop: kind });
    }

    fn on_inbound(&mut self, msg: InboundMessage) {
        match msg {
            InboundMessage::Ready => {
                self.reconnecting = false;
                trace::event(&self.data_dir, None, "Session", "SES.ready", "ok", None);
                if self.phase == SessionPhase::Idle && !self.active && !self.reloading {
                    (self.deps.report)(&Status::Idle);
                }
            }
            InboundMessage::Wake { wake_word, heard } => {
                if self.settings.trigger_mode == TriggerMode::WakeWord
                    && self.phase == SessionPhase::Idle
                    && !self.active
                    && !self.reloading
                    && !self.shutting_down
                {
                    trace::event(
                        &self.data_dir,
                        None,
                        "Session",
                        "SES.wake",
                        "ok",
                        Some(serde_json::json!({"wake_word": wake_word, "heard": heard})),
                    );
                    self.start_session(StartReason::Wake);
                } else {
                    trace::event(
                        &self.data_dir,
                        self.session_id.as_deref(),
                        "Session",
                        "SES.wake_ignored",
                        "skipped",
                        None,
                    );
                }
            }
            InboundMessage::AutoStop { reason } => {
                let kind = match reason {
                    AutoStopReason::Silence => StopKind::Silence,
                    AutoStopReason::Timeout => StopKind::Timeout,
                };
                self.stop_session(kind);
            }
            InboundMessage::Result { text, meta } => {
                if self.phase != SessionPhase::Transcribing {
                    trace::event(
                        &self.data_dir,
                        self.session_id.as_deref(),
                        "Session",
                        "SES.result_ignored",
                        "skipped",
                        None,
                    );
                    return;
                }
                self.finish_session();
                trace::event(
                    &self.data_dir,
                    self.session_id.as_deref(),
                    "Session",
                    "SES.result",
                    "ok",
                    Some(serde_json::json!({
                        "chars": text.chars().count(),
                        "avg_logprob": meta.avg_logprob,
                        "duration_ms": meta.duration_ms,
                    })),
                );
                match (self.deps.deliver)(&text) {
                    Ok(()) => {
                        (self.deps.report)(&Status::Success { transcript: text });
                        self.arm_revert(SUCCESS_REVERT_MS);
                    }
                    Err(e) => {
                        self.report_error("E_DELIVER_FAILED", &e.to_string());
                    }
                }
            }
            InboundMessage::Error { code, message } => {
                if !self.active && self.phase == SessionPhase::Idle {
                    trace::event(
                        &self.data_dir,
                        None,
                        "Session",
                        "SES.worker_error_idle",
                        "skipped",
                        Some(serde_json::json!({"code": code})),
                    );
                    return;
                }
                self.finish_session();
                self.report_error(&code, &message);
            }
        }
    }

    /// Common tail of every session-terminating transition: clear the timer,
    /// drop the active flag, return to Idle, rearm the trigger edge.
    fn finish_session(&mut self) {
        self.clear_auto_stop();
        self.active = false;
        self.phase = SessionPhase::Idle;
        (self.deps.reset_trigger)();
    }

    fn on_channel_closed(&mut self) {
        if self.shutting_down || self.reloading {
            return;
        }
        trace::event(
            &self.data_dir,
            self.session_id.as_deref(),
            "Session",
            "SES.channel_lost",
            "err",
            None,
        );
        if self.active || self.phase != SessionPhase::Idle {
            self.finish_session();
        }
        self.report_error("E_CHANNEL_LOST", "worker connection lost; reconnecting");
        if !self.reconnecting {
            self.reconnecting = true;
            (self.deps.request_reconnect)();
        }
    }

    fn on_auto_stop_elapsed(&mut self, session: u64) {
        if session != self.session_seq || !self.active || self.phase != SessionPhase::Recording {
            // A cleared or superseded timer; nothing to do.
            return;
        }
        self.stop_session(StopKind::Timeout);
    }

    fn on_revert_elapsed(&mut self, revert: u64) {
        if revert != self.revert_seq {
            return;
        }
        self.revert = None;
        if self.phase == SessionPhase::Idle
            && !self.active
            && !self.reloading
            && !self.shutting_down
        {
            (self.deps.report)(&Status::Idle);
        }
    }

    fn on_apply_settings(&mut self, new: Settings) {
        if self.shutting_down {
            return;
        }
        if self.reloading {
            trace::event(
                &self.data_dir,
                None,
                "Session",
                "SES.reload_in_progress",
                "skipped",
                None,
            );
            return;
        }
        if !settings::requires_reload(&self.settings, &new) {
            self.settings = new;
            trace::event(&self.data_dir, None, "Session", "SES.settings_live", "ok", None);
            return;
        }

        trace::event(&self.data_dir, None, "Session", "SES.reload", "ok", None);
        self.reloading = true;
        self.reconnecting = false;
        self.clear_auto_stop();
        self.clear_revert();
        self.active = false;
        self.phase = SessionPhase::Idle;
        self.session_id = None;
        (self.deps.reset_trigger)();
        (self.deps.report)(&Status::ApplyingSettings);
        self.settings = new.clone();
        (self.deps.restart_backend)(new);
    }

    fn on_backend_restart_finished(&mut self, ok: bool, message: String) {
        self.reloading = false;
        if ok {
            trace::event(&self.data_dir, None, "Session", "SES.reload_done", "ok", None);
            (self.deps.report)(&Status::Idle);
        } else {
            // No silent fallback to the previous configuration: this is
            // fatal and needs a full application restart.
            trace::event(
                &self.data_dir,
                None,
                "Session",
                "SES.reload_failed",
                "err",
                Some(serde_json::json!({"message": message})),
            );
            self.fatal = true;
            (self.deps.report)(&Status::Fatal {
                code: "E_RELOAD_FAILED".to_string(),
                message,
            });
        }
    }

    fn report_fatal(&mut self, code: &str, message: &str) {
        self.fatal = true;
        self.clear_auto_stop();
        self.clear_revert();
        (self.deps.report)(&Status::Fatal {
            code: code.to_string(),
            message: message.to_string(),
        });
    }

    fn on_shutdown(&mut self) {
        self.shutting_down = true;
        self.clear_auto_stop();
        self.clear_revert();
        // First step of the strict teardown ordering; the owner closes the
        // channel, stops the poller and the worker after this loop exits.
        if self.deps.port.is_connected() {
            self.deps.port.send(&OutboundMessage::Quit);
        }
        trace::event(&self.data_dir, None, "Session", "SES.shutdown", "ok", None);
    }

    fn report_error(&mut self, code: &str, message: &str) {
        trace::event(
            &self.data_dir,
            self.session_id.as_deref(),
            "Session",
            "SES.error",
            "err",
            Some(serde_json::json!({"code": code, "message": message})),
        );
        (self.deps.report)(&Status::Error {
            code: code.to_string(),
            message: message.to_string(),
        });
        self.arm_revert(ERROR_REVERT_MS);
    }

    fn arm_auto_stop(&mut self) {
        self.clear_auto_stop();
        let ms = settings::clamp_auto_stop_ms(self.settings.auto_stop_ms);
        let tx = self.events_tx.clone();
        let session = self.session_seq;
        self.auto_stop = Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            let _ = tx.send(CoordinatorEvent::AutoStopElapsed { session });
        }));
    }

    fn clear_auto_stop(&mut self) {
        if let Some(handle) = self.auto_stop.take() {
            handle.abort();
        }
    }

    fn arm_revert(&mut self, ms: u64) {
        self.clear_revert();
        self.revert_seq += 1;
        let revert = self.revert_seq;
        let tx = self.events_tx.clone();
        self.revert = Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            let _ = tx.send(CoordinatorEvent::StatusRevertElapsed { revert });
        }));
    }

    fn clear_revert(&mut self) {
        self.revert_seq += 1;
        if let Some(handle) = self.revert.take() {
            handle.abort();
        }
    }
}

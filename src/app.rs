//! Application wiring.
//!
//! Owns construction order (supervisor, then channel, then triggers, then
//! coordinator) and the two owner-side loops the coordinator only requests:
//! the unbounded single-flight reconnect loop and the supervised-reload
//! backend restart.
//! Teardown is strictly ordered so no process is orphaned and no frame is
//! sent on a closing channel.

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    channel::{ChannelEvent, ControlChannel},
    session::{CoordinatorEvent, SessionCoordinator, SessionDeps, Status},
    settings::{self, Settings},
    trace,
    triggers::{DeviceQueryKeySource, TriggerController, TriggerEvent},
    worker::{LogSink, WorkerSupervisor},
};

pub const INITIAL_CONNECT_ATTEMPTS: u32 = 20;
pub const INITIAL_CONNECT_DELAY: Duration = Duration::from_millis(250);
pub const RECONNECT_DELAY: Duration = Duration::from_millis(500);

/// External collaborators, consumed at the boundary only.
pub struct Collaborators {
    /// Output delivery for finished transcripts.
    pub deliver: Arc<dyn Fn(&str) -> Result<()> + Send + Sync>,
    /// Status reporting toward the UI surface.
    pub report: Arc<dyn Fn(&Status) + Send + Sync>,
    /// Receives the worker's stdout/stderr lines; its failures are ignored.
    pub log_sink: LogSink,
}

pub struct App {
    data_dir: PathBuf,
    supervisor: WorkerSupervisor,
    channel: ControlChannel,
    triggers: TriggerController,
    events_tx: mpsc::UnboundedSender<CoordinatorEvent>,
    shutdown: CancellationToken,
    coordinator: tokio::task::JoinHandle<()>,
}

impl App {
    /// Brings the whole stack up: spawns the worker, performs the bounded
    /// initial connect, registers the hotkey for the configured trigger mode
    /// and starts the coordinator loop.
    pub async fn start(
        data_dir: PathBuf,
        settings: Settings,
        collaborators: Collaborators,
    ) -> Result<App> {
        settings::validate(&settings)?;
        if settings.trigger_mode.uses_hotkey() {
            // Surface hotkey token errors before anything is spawned.
            crate::triggers::parse_combination(&settings.hotkey)?;
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel::<CoordinatorEvent>();
        let shutdown = CancellationToken::new();

        let (channel_tx, mut channel_rx) = mpsc::unbounded_channel::<ChannelEvent>();
        let channel = ControlChannel::new(data_dir.clone(), settings.port, channel_tx);
        {
            let fwd = events_tx.clone();
            tokio::spawn(async move {
                while let Some(ev) = channel_rx.recv().await {
                    if fwd.send(CoordinatorEvent::Channel(ev)).is_err() {
                        break;
                    }
                }
            });
        }

        let supervisor = {
            let fatal_tx = events_tx.clone();
            WorkerSupervisor::new(
                data_dir.clone(),
                settings.clone(),
                collaborators.log_sink.clone(),
                Arc::new(move |message| {
                    let _ = fatal_tx.send(CoordinatorEvent::FatalCondition {
                        code: "E_RESTART_LIMIT".to_string(),
                        message: message.to_string(),
                    });
                }),
            )
        };
        supervisor.start()?;

        if let Err(e) = channel
            .connect(INITIAL_CONNECT_ATTEMPTS, INITIAL_CONNECT_DELAY)
            .await
        {
            let sup = supervisor.clone();
            let _ = tokio::task::spawn_blocking(move || sup.stop()).await;
            return Err(e);
        }

        let triggers = TriggerController::new(data_dir.clone());
        if let Err(e) = wire_triggers(&triggers, &settings, &events_tx) {
            channel.close();
            let sup = supervisor.clone();
            let _ = tokio::task::spawn_blocking(move || sup.stop()).await;
            return Err(e);
        }

        let deps = SessionDeps {
            port: Arc::new(channel.clone()),
            deliver: collaborators.deliver,
            report: collaborators.report,
            reset_trigger: {
                let triggers = triggers.clone();
                Arc::new(move || triggers.reset_state())
            },
            request_reconnect: {
                let channel = channel.clone();
                let shutdown = shutdown.clone();
                let data_dir = data_dir.clone();
                Arc::new(move || {
                    tokio::spawn(reconnect_loop(
                        channel.clone(),
                        shutdown.clone(),
                        data_dir.clone(),
                    ));
                })
            },
            restart_backend: {
                let supervisor = supervisor.clone();
                let channel = channel.clone();
                let triggers = triggers.clone();
                let events_tx = events_tx.clone();
                let shutdown = shutdown.clone();
                let data_dir = data_dir.clone();
                Arc::new(move |new_settings| {
                    tokio::spawn(restart_backend(
                        supervisor.clone(),
                        channel.clone(),
                        triggers.clone(),
                        new_settings,
                        events_tx.clone(),
                        shutdown.clone(),
                        data_dir.clone(),
                    ));
                })
            },
        };

        let coordinator =
            SessionCoordinator::new(data_dir.clone(), settings, deps, events_tx.clone());
        let coordinator = tokio::spawn(coordinator.run(events_rx));

        trace::event(&data_dir, None, "App", "APP.started", "ok", None);
        Ok(App {
            data_dir,
            supervisor,
            channel,
            triggers,
            events_tx,
            shutdown,
            coordinator,
        })
    }

    /// Queues a settings change; the coordinator decides whether it needs
    /// the supervised reload.
    pub fn apply_settings(&self, new: Settings) {
        let _ = self.events_tx.send(CoordinatorEvent::ApplySettings(new));
    }

    /// Strict teardown ordering: the coordinator stops sending (and emits
    /// `QUIT`), then the channel closes, then the trigger poller stops, then
    /// the worker is stopped with its grace/force escalation.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let _ = self.events_tx.send(CoordinatorEvent::Shutdown);
        let _ = self.coordinator.await;

        self.channel.close();

        let triggers = self.triggers.clone();
        let _ = tokio::task::spawn_blocking(move || triggers.unregister_all()).await;

        let supervisor = self.supervisor.clone();
        let _ = tokio::task::spawn_blocking(move || supervisor.stop()).await;

        trace::event(&self.data_dir, None, "App", "APP.stopped", "ok", None);
    }
}

/// Registers or tears down the hotkey poller to match the trigger mode.
/// Each registration gets a fresh forwarding task into the coordinator.
fn wire_triggers(
    triggers: &TriggerController,
    settings: &Settings,
    events_tx: &mpsc::UnboundedSender<CoordinatorEvent>,
) -> Result<()> {
    if settings.trigger_mode.uses_hotkey() {
        let (trigger_tx, mut trigger_rx) = mpsc::unbounded_channel::<TriggerEvent>();
        triggers.register_hold_hotkey(&settings.hotkey, DeviceQueryKeySource::new(), trigger_tx)?;
        let fwd = events_tx.clone();
        tokio::spawn(async move {
            while let Some(ev) = trigger_rx.recv().await {
                if fwd.send(CoordinatorEvent::Trigger(ev)).is_err() {
                    break;
                }
            }
        });
    } else {
        triggers.unregister_all();
    }
    Ok(())
}

/// Retries forever (one dial per round, fixed delay) until the channel is
/// back or shutdown wins. Single flight is guaranteed by the coordinator's
/// reconnecting flag; this loop never overlaps itself.
async fn reconnect_loop(channel: ControlChannel, shutdown: CancellationToken, data_dir: PathBuf) {
    let mut rounds = 0u64;
    loop {
        if shutdown.is_cancelled() {
            return;
        }
        rounds += 1;
        match channel.connect(1, RECONNECT_DELAY).await {
            Ok(()) => {
                trace::event(
                    &data_dir,
                    None,
                    "App",
                    "APP.reconnected",
                    "ok",
                    Some(serde_json::json!({"rounds": rounds})),
                );
                return;
            }
            Err(_) => {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                }
            }
        }
    }
}

/// The supervised reload: close the channel, stop the worker, respawn it
/// with the new settings, re-wire the triggers, reconnect without bound.
/// Completion is reported back into the coordinator's queue.
async fn restart_backend(
    supervisor: WorkerSupervisor,
    channel: ControlChannel,
    triggers: TriggerController,
    new_settings: Settings,
    events_tx: mpsc::UnboundedSender<CoordinatorEvent>,
    shutdown: CancellationToken,
    data_dir: PathBuf,
) {
    let span = trace::Span::start(&data_dir, None, "App", "APP.restart_backend", None);

    channel.close();
    {
        let sup = supervisor.clone();
        let _ = tokio::task::spawn_blocking(move || sup.stop()).await;
    }
    supervisor.apply_settings(new_settings.clone());

    let started = {
        let sup = supervisor.clone();
        tokio::task::spawn_blocking(move || sup.start()).await
    };
    let start_err = match started {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e.to_string()),
        Err(e) => Some(format!("worker start join failed: {e}")),
    };
    if let Some(message) = start_err {
        span.err("E_RELOAD_FAILED", &message, None);
        let _ = events_tx.send(CoordinatorEvent::BackendRestartFinished { ok: false, message });
        return;
    }

    if let Err(e) = wire_triggers(&triggers, &new_settings, &events_tx) {
        span.err_anyhow("E_RELOAD_FAILED", &e, None);
        let _ = events_tx.send(CoordinatorEvent::BackendRestartFinished {
            ok: false,
            message: e.to_string(),
        });
        return;
    }

    reconnect_loop(channel, shutdown.clone(), data_dir.clone()).await;
    if shutdown.is_cancelled() {
        span.err("E_RELOAD_FAILED", "shutdown during reload", None);
        let _ = events_tx.send(CoordinatorEvent::BackendRestartFinished {
            ok: false,
            message: "shutdown during reload".to_string(),
        });
        return;
    }

    span.ok(None);
    let _ = events_tx.send(CoordinatorEvent::BackendRestartFinished {
        ok: true,
        message: String::new(),
    });
}

//! Hotkey trigger detection.
//!
//! One polling thread samples the platform key state every 20ms and runs a
//! pure edge detector over it: a rising edge of the configured combination
//! emits `ArmStart` once, the falling edge emits `ArmStop` once. The
//! platform query lives behind [`KeyStateSource`] so the edge logic itself
//! is platform-neutral and testable without a keyboard.

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::JoinHandle,
    time::Duration,
};

use anyhow::{bail, Result};
use device_query::{DeviceQuery, DeviceState, Keycode};
use tokio::sync::mpsc;

use crate::trace;

pub const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerEvent {
    ArmStart,
    ArmStop,
}

/// Platform key-state query, pluggable for tests and other backends.
pub trait KeyStateSource: Send + 'static {
    fn pressed_keys(&mut self) -> Vec<Keycode>;
}

pub struct DeviceQueryKeySource {
    device: DeviceState,
}

impl DeviceQueryKeySource {
    pub fn new() -> Self {
        Self {
            device: DeviceState::new(),
        }
    }
}

impl Default for DeviceQueryKeySource {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyStateSource for DeviceQueryKeySource {
    fn pressed_keys(&mut self) -> Vec<Keycode> {
        self.device.get_keys()
    }
}

/// Parses a human-readable combination ("Ctrl+Shift+Space") into a
/// deduplicated set of key codes. Unknown tokens are a configuration error,
/// not a runtime fault.
pub fn parse_combination(combination: &str) -> Result<Vec<Keycode>> {
    let mut codes: Vec<Keycode> = Vec::new();
    for raw in combination.split('+') {
        let token = raw.trim();
        if token.is_empty() {
            continue;
        }
        let code = keycode_for_token(&token.to_ascii_lowercase()).ok_or_else(|| {
            anyhow::anyhow!(
                "E_HOTKEY_TOKEN: unsupported key token '{token}' in '{combination}'"
            )
        })?;
        if !codes.contains(&code) {
            codes.push(code);
        }
    }
    if codes.is_empty() {
        bail!("E_HOTKEY_TOKEN: empty key combination");
    }
    Ok(codes)
}

fn keycode_for_token(token: &str) -> Option<Keycode> {
    let code = match token {
        "ctrl" | "control" | "lctrl" | "controlleft" => Keycode::LControl,
        "rctrl" | "controlright" => Keycode::RControl,
        "shift" | "lshift" | "shiftleft" => Keycode::LShift,
        "rshift" | "shiftright" => Keycode::RShift,
        "alt" | "lalt" | "altleft" => Keycode::LAlt,
        "ralt" | "altright" => Keycode::RAlt,
        "meta" | "cmd" | "command" | "super" | "win" | "lmeta" | "metaleft" => Keycode::LMeta,
        "rmeta" | "metaright" => Keycode::RMeta,
        "space" => Keycode::Space,
        "enter" | "return" => Keycode::Enter,
        "tab" => Keycode::Tab,
        "esc" | "escape" => Keycode::Escape,
        "backspace" => Keycode::Backspace,
        "up" => Keycode::Up,
        "down" => Keycode::Down,
        "left" => Keycode::Left,
        "right" => Keycode::Right,
        "a" => Keycode::A,
        "b" => Keycode::B,
        "c" => Keycode::C,
        "d" => Keycode::D,
        "e" => Keycode::E,
        "f" => Keycode::F,
        "g" => Keycode::G,
        "h" => Keycode::H,
        "i" => Keycode::I,
        "j" => Keycode::J,
        "k" => Keycode::K,
        "l" => Keycode::L,
        "m" => Keycode::M,
        "n" => Keycode::N,
        "o" => Keycode::O,
        "p" => Keycode::P,
        "q" => Keycode::Q,
        "r" => Keycode::R,
        "s" => Keycode::S,
        "t" => Keycode::T,
        "u" => Keycode::U,
        "v" => Keycode::V,
        "w" => Keycode::W,
        "x" => Keycode::X,
        "y" => Keycode::Y,
        "z" => Keycode::Z,
        "0" => Keycode::Key0,
        "1" => Keycode::Key1,
        "2" => Keycode::Key2,
        "3" => Keycode::Key3,
        "4" => Keycode::Key4,
        "5" => Keycode::Key5,
        "6" => Keycode::Key6,
        "7" => Keycode::Key7,
        "8" => Keycode::Key8,
        "9" => Keycode::Key9,
        "f1" => Keycode::F1,
        "f2" => Keycode::F2,
        "f3" => Keycode::F3,
        "f4" => Keycode::F4,
        "f5" => Keycode::F5,
        "f6" => Keycode::F6,
        "f7" => Keycode::F7,
        "f8" => Keycode::F8,
        "f9" => Keycode::F9,
        "f10" => Keycode::F10,
        "f11" => Keycode::F11,
        "f12" => Keycode::F12,
        _ => return None,
    };
    Some(code)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    None,
    Start,
    Stop,
}

/// Pure hold/release edge detector, stepped once per poll tick. At most one
/// edge comes out of a single tick, which is what makes a rapid double-tap
/// unable to both arm and stop within the same tick.
#[derive(Debug)]
pub struct HoldEdge {
    chord: Vec<Keycode>,
    firing: bool,
    suppress_until_release: bool,
}

impl HoldEdge {
    pub fn new(chord: Vec<Keycode>) -> Self {
        Self {
            chord,
            firing: false,
            suppress_until_release: false,
        }
    }

    pub fn step(&mut self, pressed: &[Keycode]) -> Edge {
        let held = self.chord.iter().all(|k| pressed.contains(k));
        if self.suppress_until_release {
            if !held {
                self.suppress_until_release = false;
            }
            return Edge::None;
        }
        if held && !self.firing {
            self.firing = true;
            return Edge::Start;
        }
        if !held && self.firing {
            self.firing = false;
            return Edge::Stop;
        }
        Edge::None
    }

    /// Clears the firing flag and ignores the combination until it has been
    /// fully released, so a key still held when a session completes cannot
    /// immediately refire.
    pub fn reset(&mut self) {
        self.firing = false;
        self.suppress_until_release = true;
    }
}

struct TriggerInner {
    stop: AtomicBool,
    edge: Mutex<Option<HoldEdge>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    data_dir: PathBuf,
}

pub struct TriggerController {
    inner: Arc<TriggerInner>,
}

impl Clone for TriggerController {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl TriggerController {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            inner: Arc::new(TriggerInner {
                stop: AtomicBool::new(false),
                edge: Mutex::new(None),
                thread: Mutex::new(None),
                data_dir,
            }),
        }
    }

    /// Registers the hold-to-talk combination and starts the poll thread.
    /// Replaces any previous registration.
    pub fn register_hold_hotkey<S: KeyStateSource>(
        &self,
        combination: &str,
        mut source: S,
        events: mpsc::UnboundedSender<TriggerEvent>,
    ) -> Result<()> {
        let chord = parse_combination(combination)?;
        self.unregister_all();

        *self.inner.edge.lock().unwrap() = Some(HoldEdge::new(chord));
        self.inner.stop.store(false, Ordering::SeqCst);

        trace::event(
            &self.inner.data_dir,
            None,
            "Triggers",
            "TG.register",
            "ok",
            Some(serde_json::json!({"combination": combination})),
        );

        let inner = self.inner.clone();
        let handle = std::thread::Builder::new()
            .name("hotkey-poll".to_string())
            .spawn(move || loop {
                if inner.stop.load(Ordering::SeqCst) {
                    return;
                }
                let pressed = source.pressed_keys();
                let edge = {
                    let mut g = inner.edge.lock().unwrap();
                    match g.as_mut() {
                        Some(e) => e.step(&pressed),
                        None => Edge::None,
                    }
                };
                let event = match edge {
                    Edge::Start => Some(TriggerEvent::ArmStart),
                    Edge::Stop => Some(TriggerEvent::ArmStop),
                    Edge::None => None,
                };
                if let Some(ev) = event {
                    if events.send(ev).is_err() {
                        return;
                    }
                }
                std::thread::sleep(POLL_INTERVAL);
            })
            .map_err(|e| anyhow::anyhow!("E_HOTKEY_POLLER: failed to spawn poller: {e}"))?;
        *self.inner.thread.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Clears the edge state without tearing down the poller. Used after a
    /// session completes.
    pub fn reset_state(&self) {
        if let Some(edge) = self.inner.edge.lock().unwrap().as_mut() {
            edge.reset();
        }
    }

    /// Stops the poller and clears all state. Safe to call repeatedly and
    /// before any registration.
    pub fn unregister_all(&self) {
        self.inner.stop.store(true, Ordering::SeqCst);
        let handle = self.inner.thread.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        *self.inner.edge.lock().unwrap() = None;
    }
}

impl Drop for TriggerInner {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_dedupes_and_maps_tokens() {
        let codes = parse_combination("Ctrl+Ctrl+Shift+Space").expect("parse");
        assert_eq!(
            codes,
            vec![Keycode::LControl, Keycode::LShift, Keycode::Space]
        );
    }

    #[test]
    fn parse_rejects_unknown_tokens() {
        let err = parse_combination("Ctrl+Hyper").expect_err("must fail");
        assert!(err.to_string().contains("E_HOTKEY_TOKEN"));
        assert!(err.to_string().contains("Hyper"));
    }

    #[test]
    fn parse_rejects_empty_combination() {
        let err = parse_combination(" + ").expect_err("must fail");
        assert!(err.to_string().contains("E_HOTKEY_TOKEN"));
    }

    #[test]
    fn rising_and_falling_edges_fire_exactly_once() {
        let chord = parse_combination("Ctrl+Space").expect("parse");
        let mut edge = HoldEdge::new(chord);
        let held = vec![Keycode::LControl, Keycode::Space];

        assert_eq!(edge.step(&[]), Edge::None);
        assert_eq!(edge.step(&held), Edge::Start);
        assert_eq!(edge.step(&held), Edge::None);
        assert_eq!(edge.step(&held), Edge::None);
        assert_eq!(edge.step(&[Keycode::LControl]), Edge::Stop);
        assert_eq!(edge.step(&[]), Edge::None);
    }

    #[test]
    fn partial_chord_is_not_a_rising_edge() {
        let chord = parse_combination("Ctrl+Space").expect("parse");
        let mut edge = HoldEdge::new(chord);
        assert_eq!(edge.step(&[Keycode::LControl]), Edge::None);
        assert_eq!(edge.step(&[Keycode::Space]), Edge::None);
    }

    #[test]
    fn reset_while_held_suppresses_until_release() {
        let chord = parse_combination("F9").expect("parse");
        let mut edge = HoldEdge::new(chord);
        let held = vec![Keycode::F9];

        assert_eq!(edge.step(&held), Edge::Start);
        edge.reset();
        // Still held: no spurious start or stop.
        assert_eq!(edge.step(&held), Edge::None);
        assert_eq!(edge.step(&held), Edge::None);
        // Released, then pressed again: a fresh session may start.
        assert_eq!(edge.step(&[]), Edge::None);
        assert_eq!(edge.step(&held), Edge::Start);
    }

    #[test]
    fn double_tap_within_one_tick_is_one_edge() {
        // A press+release that happens entirely between two polls is either
        // never observed (no edges) or observed as a single held tick, which
        // yields one Start on that tick and one Stop on the next: a tap can
        // never arm and stop within the same tick.
        let chord = parse_combination("F9").expect("parse");
        let mut edge = HoldEdge::new(chord);
        let held = vec![Keycode::F9];

        // Tap fell entirely between polls: nothing fires.
        assert_eq!(edge.step(&[]), Edge::None);
        assert_eq!(edge.step(&[]), Edge::None);

        // Tap observed on exactly one tick.
        assert_eq!(edge.step(&held), Edge::Start);
        assert_eq!(edge.step(&[]), Edge::Stop);
    }

    struct ScriptedKeys {
        frames: std::vec::IntoIter<Vec<Keycode>>,
        last: Vec<Keycode>,
    }

    impl ScriptedKeys {
        fn new(frames: Vec<Vec<Keycode>>) -> Self {
            Self {
                frames: frames.into_iter(),
                last: Vec::new(),
            }
        }
    }

    impl KeyStateSource for ScriptedKeys {
        fn pressed_keys(&mut self) -> Vec<Keycode> {
            if let Some(f) = self.frames.next() {
                self.last = f;
            }
            self.last.clone()
        }
    }

    #[tokio::test]
    async fn poller_emits_start_and_stop_events() {
        let td = tempfile::tempdir().expect("tempdir");
        let controller = TriggerController::new(td.path().to_path_buf());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let held = vec![Keycode::LControl, Keycode::Space];
        let source = ScriptedKeys::new(vec![vec![], held.clone(), held, vec![]]);
        controller
            .register_hold_hotkey("Ctrl+Space", source, tx)
            .expect("register");

        let start = rx.recv().await.expect("start event");
        assert_eq!(start, TriggerEvent::ArmStart);
        let stop = rx.recv().await.expect("stop event");
        assert_eq!(stop, TriggerEvent::ArmStop);

        controller.unregister_all();
        controller.unregister_all(); // idempotent
    }

    #[test]
    fn unregister_before_registration_is_safe() {
        let td = tempfile::tempdir().expect("tempdir");
        let controller = TriggerController::new(td.path().to_path_buf());
        controller.unregister_all();
        controller.reset_state();
    }
}

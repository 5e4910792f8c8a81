//! VoxKey: the orchestration core of a desktop voice-capture front end.
//!
//! Supervises a separately-packaged speech-to-text worker process, keeps a
//! message-framed control channel to it across crashes and restarts, turns
//! hotkey and wake input into session events, and drives the single-session
//! state machine. The UI surface, output delivery and the worker's audio
//! pipeline are external collaborators reached only through injected
//! callbacks and the wire contract.

pub mod app;
pub mod channel;
pub mod data_dir;
pub mod protocol;
mod safe_print;
pub mod session;
pub mod settings;
pub mod trace;
pub mod triggers;
pub mod worker;

pub use app::{App, Collaborators};
pub use session::{SessionPhase, Status};
pub use settings::{Settings, TriggerMode};

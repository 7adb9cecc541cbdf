//! Low-level process plumbing for the conformance harness.
//!
//! Spawns hosts in pseudo-terminals (or pipes), drains their output on
//! background threads, strips terminal control sequences, and tears down
//! whole process groups.

pub mod ansi;
pub mod group;
pub mod pump;
pub mod pty;

pub use ansi::{strip_ansi, AnsiFilter};
pub use group::{group_alive, kill_group, GroupKillConfig, KillOutcome};
pub use pump::OutputPump;
pub use pty::{resolve_command, PtyOptions, PtySession};

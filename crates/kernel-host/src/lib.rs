//! Kernel host: spawns the kernel gateway once and reports on it.
//!
//! The host runs as its own task and talks to the orchestrator only through
//! channels: it emits `kernel-process` messages (`start`, `stdout`, `end`,
//! `error`) and obeys `main-to-kernel` commands (`request-close`). There is
//! no restart policy; a crashed gateway surfaces as `end`.

pub mod host;

pub use host::{ExitLatch, HostConfig, HostHandle, KernelHost};

//! Channel payloads shared by the notebook orchestrator, the kernel host and
//! notebook clients.
//!
//! Three named, directional channels carry JSON payloads tagged by `type`:
//!
//! - `kernel-process`: kernel host / client ⇄ orchestrator lifecycle and stdout
//! - `main-to-kernel`: orchestrator → kernel host control
//! - `login-redirect`: orchestrator → client authentication callback
//!
//! Payloads that cross a process boundary are wrapped in a [`ChannelMessage`]
//! envelope and sent as length-prefixed frames (see [`framing`]).

pub mod channel;
pub mod framing;

pub use channel::{ChannelMessage, KernelProcessMessage, LoginRedirect, MainToKernel};
pub use framing::{
    recv_json_control_frame, recv_json_frame, send_json_frame, FrameError,
    MAX_CONTROL_FRAME_SIZE, MAX_FRAME_SIZE,
};

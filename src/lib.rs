//! # Effects Relay
//!
//! Joins a real-time media session as a processing participant, runs every
//! remote video track through a transform and publishes the result back.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────── SFU / transport ────────────────────────────────┐
//! │   browser camera track                     processed track ("<id>-processed")   │
//! └──────────┬───────────────────────────────────────────────────▲──────────────────┘
//!            │ subscribe                                          │ publish
//!            ▼                                                    │
//! ┌──────────────────────────── SessionManager (session) ─────────┼─────────────────┐
//! │  state: Disconnected → Connecting → Connected ⇄ Reconnecting → Closed           │
//! │                                                               │                 │
//! │  ┌──────────────────── TrackBridge (tracks::bridge) ──────────┼──────────────┐  │
//! │  │  inbound ──► FrameQueue (drop-oldest, N) ──► Scheduler ──► writer         │  │
//! │  │                                   │  deadline T_max per frame             │  │
//! │  │                                   ▼                                       │  │
//! │  │                            Transform (transform)                          │  │
//! │  └──────────────────────────────────▲────────────────────────────────────────┘  │
//! │                                     │ apply_prompt                              │
//! │  ControlChannel (control) ◄─────────┴── {"prompt": "..."} reliable, ordered      │
//! └──────────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `transport::LoopbackHub` stands in for the SFU in tests and the demo.

pub mod config;
pub mod control;
pub mod error;
pub mod events;
pub mod relay;
pub mod session;
pub mod tracks;
pub mod transform;
pub mod transport;
#[cfg(feature = "web-ui")]
pub mod ui;
pub mod video;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Default signaling server address
    pub const DEFAULT_SERVER_ADDRESS: &str = "ws://localhost:7880";

    /// Identity the processing participant joins as (prompt destination)
    pub const DEFAULT_PROCESSOR_IDENTITY: &str = "effects-worker";

    /// Frames allowed to wait for the transform per bridge
    pub const DEFAULT_QUEUE_CAPACITY: usize = 2;

    /// Per-frame processing deadline in milliseconds
    pub const DEFAULT_PROCESSING_DEADLINE_MS: u64 = 100;

    /// Consecutive timeouts before a bridge reports degraded processing
    pub const DEFAULT_TIMEOUT_STREAK: u32 = 5;

    pub const DEFAULT_RECONNECT_RETRIES: u32 = 5;
    pub const DEFAULT_BACKOFF_BASE_MS: u64 = 250;
    pub const DEFAULT_BACKOFF_MAX_MS: u64 = 8_000;

    /// Default HTTP port for the operator UI
    pub const DEFAULT_HTTP_PORT: u16 = 8080;

    pub const ENV_SERVER_URL: &str = "RELAY_SERVER_URL";
    pub const ENV_TOKEN: &str = "RELAY_TOKEN";
    pub const ENV_IDENTITY: &str = "RELAY_IDENTITY";

    /// Per-subscriber frame buffer in the loopback transport
    pub const SUBSCRIBER_BUFFER_FRAMES: usize = 8;

    /// Frames buffered between a capture device and its publication
    pub const CAPTURE_BUFFER_FRAMES: usize = 4;

    /// Suffix of the processed track published for each inbound track
    pub const OUTBOUND_TRACK_NAME: &str = "processed";
}

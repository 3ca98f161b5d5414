//! # jvb-rtcstats-push
//!
//! Polls a Jitsi Videobridge stats endpoint, tracks conference lifecycles
//! across polls, and streams identity, close and incremental stats messages
//! to an rtcstats server over a self-healing websocket. Bridge log lines can
//! optionally be tailed and attached to the stats session of the meeting
//! they mention.
//!
//! ## Pipeline
//! ```text
//! bridge /stats ──► StatsPoller ──► PollCycle ──► TransportHandle ──► collector
//!                                    │   ▲
//!                     SessionRegistry│   │LogCorrelator ◄── LogTailer ◄── jvb.log
//! ```

pub mod bridge;
pub mod cli;
pub mod diff;
pub mod error;
pub mod logs;
pub mod messages;
pub mod poller;
pub mod registry;
pub mod transport;

pub use error::{PushError, Result};

//! Poll loop: fetch the bridge stats document on a fixed interval and turn
//! each one into identity, close and stats-entry messages.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let poller = StatsPoller::builder(BridgeConfig::new("http://127.0.0.1:8080"))
//!     .sink(handle.clone())
//!     .display_name("jvb-1")
//!     .poll_interval(Duration::from_secs(5))
//!     .build()?;
//! tokio::spawn(poller.run());
//! ```

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};
use tracing::{debug, error, warn};

use crate::bridge::{BridgeClient, BridgeConfig, BridgeDocument};
use crate::diff::diff;
use crate::logs::SharedCorrelator;
use crate::messages::OutboundMessage;
use crate::registry::SessionRegistry;
use crate::transport::MessageSink;

/// Failures in a row before fetch errors are logged at `error`.
const FAILURE_ESCALATION: u32 = 5;

/// Current Unix epoch in milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Counts from one processed document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub conferences: usize,
    pub created: usize,
    pub removed: usize,
    pub log_batches: usize,
}

/// Per-document processing, independent of how documents are fetched.
pub struct PollCycle<S> {
    registry: SessionRegistry,
    logs: Option<SharedCorrelator>,
    sink: S,
}

impl<S: MessageSink> PollCycle<S> {
    pub fn new(display_name: impl Into<String>, sink: S, logs: Option<SharedCorrelator>) -> Self {
        Self {
            registry: SessionRegistry::new(display_name),
            logs,
            sink,
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Reconcile sessions against `doc` and emit this tick's messages.
    ///
    /// Identity and close messages for a conference always precede its
    /// stats entry within the same call.
    ///
    /// A conference that first appears with endpoints already present gets
    /// two identities back to back: one from creation with an empty roster,
    /// then one with the full roster, before its first stats entry.
    pub fn process(&mut self, doc: &BridgeDocument) -> CycleSummary {
        let conferences = doc.conferences();
        let reconciled = self.registry.reconcile(&conferences);

        for conf_id in &reconciled.created {
            let state = self.registry.session(conf_id);
            debug!(conf_id = %conf_id, stats_session_id = %state.stats_session_id, "new conference");
            self.sink.send(OutboundMessage::identity(state));
        }
        for state in &reconciled.removed {
            debug!(conf_id = %state.conf_id, stats_session_id = %state.stats_session_id, "conference ended");
            self.sink.send(OutboundMessage::close(state.stats_session_id.clone()));
        }

        let mut log_batches = 0;
        for conf in &conferences {
            let added = self
                .registry
                .update_endpoints(&conf.conf_id, conf.endpoint_stats_ids.iter().map(String::as_str));
            if !added.is_empty() {
                debug!(conf_id = %conf.conf_id, added = added.len(), "endpoint roster grew");
                self.sink.send(OutboundMessage::identity(self.registry.session(&conf.conf_id)));
            }

            let empty = json!({});
            let delta = {
                let previous: &Value = self
                    .registry
                    .session(&conf.conf_id)
                    .previous_snapshot()
                    .unwrap_or(&empty);
                diff(previous, &conf.data)
            };
            let state = self.registry.session(&conf.conf_id);
            let stats_session_id = state.stats_session_id.clone();
            let meeting_unique_id = state.meeting_unique_id.clone();

            self.sink.send(OutboundMessage::stats(stats_session_id.clone(), &delta));
            self.registry.record_snapshot(&conf.conf_id, conf.data.clone());

            if let Some(lines) = self.take_logs(&meeting_unique_id) {
                log_batches += 1;
                self.sink.send(OutboundMessage::logs(stats_session_id, &lines, now_ms()));
            }
        }

        CycleSummary {
            conferences: conferences.len(),
            created: reconciled.created.len(),
            removed: reconciled.removed.len(),
            log_batches,
        }
    }

    fn take_logs(&self, meeting_unique_id: &str) -> Option<Vec<String>> {
        let correlator = self.logs.as_ref()?;
        let lines = match correlator.lock() {
            Ok(mut guard) => guard.take(meeting_unique_id),
            Err(_) => {
                warn!("log correlator lock poisoned, skipping logs");
                return None;
            }
        };
        (!lines.is_empty()).then_some(lines)
    }
}

/// Fetches the bridge document every `poll_interval` and feeds it to a
/// [`PollCycle`]. Use [`StatsPollerBuilder`] for construction.
pub struct StatsPoller<S> {
    client: BridgeClient,
    cycle: PollCycle<S>,
    poll_interval: Duration,
}

impl<S: MessageSink> StatsPoller<S> {
    /// Start building a poller aimed at `bridge`.
    pub fn builder(bridge: BridgeConfig) -> StatsPollerBuilder<S> {
        StatsPollerBuilder::new(bridge)
    }

    /// Run the polling loop indefinitely.
    ///
    /// A failed fetch skips the tick entirely; the next tick tries again.
    /// Ticks never overlap: a slow fetch delays the next tick instead of
    /// running alongside it.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut consecutive_failures: u32 = 0;
        let url = self.client.config().stats_url();

        loop {
            ticker.tick().await;

            match self.client.fetch_document().await {
                Ok(doc) => {
                    consecutive_failures = 0;
                    let started = Instant::now();
                    let summary = self.cycle.process(&doc);
                    debug!(
                        conferences = summary.conferences,
                        created = summary.created,
                        removed = summary.removed,
                        log_batches = summary.log_batches,
                        elapsed_us = started.elapsed().as_micros() as u64,
                        "poll cycle complete"
                    );
                }
                Err(e) => {
                    consecutive_failures = consecutive_failures.saturating_add(1);

                    if consecutive_failures >= FAILURE_ESCALATION {
                        error!(
                            error = %e,
                            url = %url,
                            consecutive_failures,
                            "bridge poll failed repeatedly, will retry next tick"
                        );
                    } else {
                        warn!(
                            error = %e,
                            url = %url,
                            "bridge poll failed, will retry next tick"
                        );
                    }
                }
            }
        }
    }
}

/// Builder for [`StatsPoller`].
pub struct StatsPollerBuilder<S> {
    bridge: BridgeConfig,
    sink: Option<S>,
    logs: Option<SharedCorrelator>,
    display_name: String,
    poll_interval: Duration,
}

impl<S: MessageSink> StatsPollerBuilder<S> {
    pub fn new(bridge: BridgeConfig) -> Self {
        Self {
            bridge,
            sink: None,
            logs: None,
            display_name: "jvb".to_string(),
            poll_interval: Duration::from_secs(5),
        }
    }

    /// Where outbound messages go. Required.
    pub fn sink(mut self, sink: S) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Attach buffered bridge logs to stats sessions.
    pub fn logs(mut self, correlator: SharedCorrelator) -> Self {
        self.logs = Some(correlator);
        self
    }

    /// This agent's identity in identity messages (default `jvb`).
    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    /// Override the polling interval (default 5 s).
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// # Errors
    /// Returns `Err("sink is required")` when no sink was provided.
    pub fn build(self) -> Result<StatsPoller<S>, &'static str> {
        let sink = self.sink.ok_or("sink is required")?;
        Ok(StatsPoller {
            client: BridgeClient::new(self.bridge),
            cycle: PollCycle::new(self.display_name, sink, self.logs),
            poll_interval: self.poll_interval,
        })
    }
}

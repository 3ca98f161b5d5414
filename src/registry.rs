//! # Session Registry
//!
//! ## Responsibility
//! Owns one [`SessionState`] per bridge conference currently being reported.
//! A session is created the first time a conference id is seen and destroyed
//! when a poll no longer contains it.
//!
//! ## Guarantees
//! - Exactly one session per active conference id.
//! - `stats_session_id` is a fresh v4 UUID and is never reused.
//! - The endpoint roster only grows for the lifetime of a session.
//! - The stored snapshot is replaced wholesale on every cycle, never merged.
//!
//! ## Contract
//! Addressing a conference id that has not been reconciled in is a caller
//! bug. Those operations panic rather than diverge silently from what the
//! collector has been told.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;
use uuid::Uuid;

use crate::bridge::ConferenceSnapshot;

/// Tag sent as `applicationName` in every identity message.
pub const APPLICATION_NAME: &str = "JVB";

/// State tracked for one live conference.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub stats_session_id: String,
    pub conf_id: String,
    pub conf_name: String,
    pub display_name: String,
    /// Bridge `meeting_id`, or the conference id when the bridge has none.
    pub meeting_unique_id: String,
    pub application_name: &'static str,
    known_endpoints: BTreeSet<String>,
    previous_snapshot: Option<Value>,
}

impl SessionState {
    fn new(snapshot: &ConferenceSnapshot, display_name: &str) -> Self {
        Self {
            stats_session_id: Uuid::new_v4().to_string(),
            conf_id: snapshot.conf_id.clone(),
            conf_name: snapshot.name.clone(),
            display_name: display_name.to_string(),
            meeting_unique_id: snapshot
                .meeting_id
                .clone()
                .unwrap_or_else(|| snapshot.conf_id.clone()),
            application_name: APPLICATION_NAME,
            known_endpoints: BTreeSet::new(),
            previous_snapshot: None,
        }
    }

    /// Every endpoint stats id ever seen in this conference.
    pub fn known_endpoints(&self) -> &BTreeSet<String> {
        &self.known_endpoints
    }

    /// The last stats document stored for this conference.
    pub fn previous_snapshot(&self) -> Option<&Value> {
        self.previous_snapshot.as_ref()
    }
}

/// Outcome of [`SessionRegistry::reconcile`].
#[derive(Debug, Default)]
pub struct Reconciliation {
    /// Conference ids that gained a session this cycle.
    pub created: Vec<String>,
    /// Sessions whose conference disappeared, in their final state.
    pub removed: Vec<SessionState>,
}

/// Registry of live sessions keyed by bridge conference id.
#[derive(Debug)]
pub struct SessionRegistry {
    display_name: String,
    sessions: BTreeMap<String, SessionState>,
}

impl SessionRegistry {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            sessions: BTreeMap::new(),
        }
    }

    /// Bring the tracked set in line with the conferences of the latest poll.
    ///
    /// New ids get a freshly generated session; ids no longer present are
    /// removed and returned. No id appears in both lists.
    pub fn reconcile(&mut self, current: &[ConferenceSnapshot]) -> Reconciliation {
        let mut outcome = Reconciliation::default();

        for snapshot in current {
            if !self.sessions.contains_key(&snapshot.conf_id) {
                let state = SessionState::new(snapshot, &self.display_name);
                self.sessions.insert(snapshot.conf_id.clone(), state);
                outcome.created.push(snapshot.conf_id.clone());
            }
        }

        let gone: Vec<String> = self
            .sessions
            .keys()
            .filter(|id| !current.iter().any(|c| &c.conf_id == *id))
            .cloned()
            .collect();
        for conf_id in gone {
            if let Some(state) = self.sessions.remove(&conf_id) {
                outcome.removed.push(state);
            }
        }

        outcome
    }

    /// Merge `current` into the roster and return the ids not seen before.
    ///
    /// # Panics
    /// Panics if `conf_id` is not tracked.
    pub fn update_endpoints<'a, I>(&mut self, conf_id: &str, current: I) -> BTreeSet<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let state = self.tracked_mut(conf_id);
        let added: BTreeSet<String> = current
            .into_iter()
            .filter(|id| !state.known_endpoints.contains(*id))
            .map(str::to_string)
            .collect();
        state.known_endpoints.extend(added.iter().cloned());
        added
    }

    /// Replace the stored snapshot and return the one it replaced.
    ///
    /// # Panics
    /// Panics if `conf_id` is not tracked.
    pub fn record_snapshot(&mut self, conf_id: &str, data: Value) -> Option<Value> {
        self.tracked_mut(conf_id).previous_snapshot.replace(data)
    }

    /// Look up a live session.
    pub fn get(&self, conf_id: &str) -> Option<&SessionState> {
        self.sessions.get(conf_id)
    }

    /// Look up a live session that the caller knows to be tracked.
    ///
    /// # Panics
    /// Panics if `conf_id` is not tracked.
    pub fn session(&self, conf_id: &str) -> &SessionState {
        match self.sessions.get(conf_id) {
            Some(state) => state,
            None => panic!("session registry: conference {conf_id} is not tracked"),
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn tracked_mut(&mut self, conf_id: &str) -> &mut SessionState {
        match self.sessions.get_mut(conf_id) {
            Some(state) => state,
            None => panic!("session registry: conference {conf_id} is not tracked"),
        }
    }
}

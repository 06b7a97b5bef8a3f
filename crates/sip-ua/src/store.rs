// warble-rs - The Warble SIP User Agent
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::sync::Arc;

use dashmap::DashMap;
use smol_str::SmolStr;
use tracing::debug;

use crate::session::InviteSession;

/// Process-wide Call-ID → session mapping.
///
/// Entries are inserted when a dialog is created (incoming INVITE
/// received or outgoing INVITE sent) and removed on terminal states,
/// always before the terminal callback fires so racing terminators
/// observe the entry gone.
#[derive(Default)]
pub struct SessionStore {
    sessions: DashMap<SmolStr, Arc<InviteSession>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a session under its Call-ID, replacing any previous entry.
    pub fn insert(&self, call_id: SmolStr, session: Arc<InviteSession>) {
        debug!(call_id = %call_id, "storing invite session");
        self.sessions.insert(call_id, session);
    }

    /// Returns the session for the Call-ID, if present.
    pub fn load(&self, call_id: &SmolStr) -> Option<Arc<InviteSession>> {
        self.sessions.get(call_id).map(|entry| entry.value().clone())
    }

    /// Removes and returns the session for the Call-ID. Idempotent.
    pub fn remove(&self, call_id: &SmolStr) -> Option<Arc<InviteSession>> {
        let removed = self.sessions.remove(call_id).map(|(_, session)| session);
        debug!(
            call_id = %call_id,
            found = removed.is_some(),
            remaining = self.sessions.len(),
            "removing invite session"
        );
        removed
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

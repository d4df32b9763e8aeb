//! Session id rewriting for a kernel channel shared by several connections.
//!
//! The kernel stamps everything it emits with its own session id while each
//! client validates replies against the session it used for the request. The
//! translator remembers which connection (and which session) issued every
//! request and addresses the kernel's output accordingly.

use indexmap::IndexSet;
use std::collections::HashMap;
use tracing::debug;

use crate::envelope::Envelope;

#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingRequest {
    connection_id: String,
    session: String,
}

/// One envelope addressed to one connection
pub type Delivery = (String, Envelope);

#[derive(Debug, Default)]
pub struct SessionTranslator {
    /// Learned from the first envelope the kernel emits
    kernel_session: Option<String>,
    /// Every client session seen so far, in first-seen order
    client_sessions: IndexSet<String>,
    /// Most recent session declared by each connection
    connection_sessions: HashMap<String, String>,
    /// msg_id -> issuer. Kept until the issuing connection goes away so that
    /// every IOPub message of a multi-message reply can be addressed.
    pending: HashMap<String, PendingRequest>,
}

impl SessionTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember the issuer of a client request before it is forwarded
    pub fn record_request(&mut self, connection_id: &str, envelope: &Envelope) {
        let session = envelope.session().to_string();
        if !session.is_empty() {
            self.client_sessions.insert(session.clone());
            self.connection_sessions
                .insert(connection_id.to_string(), session.clone());
        }
        self.pending.insert(
            envelope.msg_id().to_string(),
            PendingRequest {
                connection_id: connection_id.to_string(),
                session,
            },
        );
    }

    /// Address one kernel envelope to the attached connections.
    ///
    /// - replies to a known request go to the issuing connection only, with
    ///   the issuer's session restored
    /// - unsolicited messages stamped with the kernel's session are copied to
    ///   every connection, each rewritten to that connection's session
    /// - anything else is copied to every connection unmodified
    pub fn translate(&mut self, envelope: Envelope, connections: &[String]) -> Vec<Delivery> {
        if self.kernel_session.is_none() && !envelope.session().is_empty() {
            debug!("Learned kernel session {}", envelope.session());
            self.kernel_session = Some(envelope.session().to_string());
        }

        if let Some(parent) = envelope.parent_msg_id() {
            if let Some(issuer) = self.pending.get(parent) {
                if !connections.contains(&issuer.connection_id) {
                    return Vec::new();
                }
                let mut envelope = envelope;
                envelope.set_session(issuer.session.clone());
                return vec![(issuer.connection_id.clone(), envelope)];
            }
            return fan_out(envelope, connections, |_| None);
        }

        let from_kernel = self.kernel_session.as_deref() == Some(envelope.session());
        if !from_kernel {
            return fan_out(envelope, connections, |_| None);
        }

        fan_out(envelope, connections, |connection_id| {
            self.connection_sessions
                .get(connection_id)
                .or_else(|| self.client_sessions.first())
                .cloned()
        })
    }

    /// Drop everything recorded for a connection that went away
    pub fn forget_connection(&mut self, connection_id: &str) {
        self.pending.retain(|_, p| p.connection_id != connection_id);
        if let Some(session) = self.connection_sessions.remove(connection_id) {
            let still_used = self.connection_sessions.values().any(|s| *s == session);
            if !still_used {
                self.client_sessions.shift_remove(&session);
            }
        }
    }

    pub fn kernel_session(&self) -> Option<&str> {
        self.kernel_session.as_deref()
    }

    pub fn client_sessions(&self) -> impl Iterator<Item = &str> {
        self.client_sessions.iter().map(String::as_str)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

fn fan_out(
    envelope: Envelope,
    connections: &[String],
    session_for: impl Fn(&str) -> Option<String>,
) -> Vec<Delivery> {
    connections
        .iter()
        .map(|connection_id| {
            let mut copy = envelope.clone();
            if let Some(session) = session_for(connection_id) {
                copy.set_session(session);
            }
            (connection_id.clone(), copy)
        })
        .collect()
}

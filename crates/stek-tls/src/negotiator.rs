use std::fmt;
use std::sync::Arc;

use stek_core::KeyName;
use tracing::{debug, trace, warn};

use crate::codec::{self, Ticket};
use crate::dispatcher::{CallbackOutcome, ConnectionInfo, TicketKeyCallback, TicketKeyRequest};
use crate::error::TicketError;
use crate::stats::TicketStats;

/// Per-handshake dispatcher state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    /// The client presented a ticket that has to be resolved and opened.
    NeedLookup,
    /// A ticket has to be issued. Terminal: entered at most once per handshake.
    NeedNewTicket,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumptionOutcome {
    /// Tickets are switched off; the engine negotiates as if the extension were absent.
    Disabled,
    FullHandshake,
    Resumed,
    /// Resumed, and the presented ticket was due for replacement.
    ResumedAndRenewed,
}

impl ResumptionOutcome {
    pub fn is_resumed(self) -> bool {
        matches!(
            self,
            ResumptionOutcome::Resumed | ResumptionOutcome::ResumedAndRenewed
        )
    }
}

/// Session recovered from a presented ticket.
#[derive(Clone, PartialEq, Eq)]
pub struct ResumedSession {
    pub key_name: KeyName,
    pub session_state: Vec<u8>,
}

impl fmt::Debug for ResumedSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResumedSession")
            .field("key_name", &self.key_name)
            .field("state_len", &self.session_state.len())
            .finish()
    }
}

#[derive(Debug)]
pub struct TicketNegotiation {
    pub outcome: ResumptionOutcome,
    pub resumed: Option<ResumedSession>,
    /// Ticket to send in NewSessionTicket, if one was issued.
    pub new_ticket: Option<Ticket>,
}

impl TicketNegotiation {
    fn disabled() -> Self {
        Self {
            outcome: ResumptionOutcome::Disabled,
            resumed: None,
            new_ticket: None,
        }
    }
}

/// Drives the ticket callback for one handshake at a time.
///
/// Cheap to share: clone the `Arc` into each connection task.
pub struct TicketNegotiator {
    callback: Option<Arc<dyn TicketKeyCallback>>,
    stats: Arc<TicketStats>,
}

impl TicketNegotiator {
    pub fn new(callback: Arc<dyn TicketKeyCallback>) -> Self {
        Self {
            callback: Some(callback),
            stats: Arc::new(TicketStats::default()),
        }
    }

    /// A negotiator with no callback configured. Presented tickets are ignored
    /// and none are issued.
    pub fn disabled() -> Self {
        Self {
            callback: None,
            stats: Arc::new(TicketStats::default()),
        }
    }

    pub fn with_stats(mut self, stats: Arc<TicketStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.callback.is_some()
    }

    pub fn stats(&self) -> &Arc<TicketStats> {
        &self.stats
    }

    /// Resolves the ticket the client presented (if any) and issues a new one
    /// when needed.
    ///
    /// `fresh_state` is the session state of a full handshake; it is what gets
    /// sealed when the presented ticket could not be used. A renewed ticket
    /// carries the state recovered from the old one instead.
    ///
    /// Only fatal errors are returned; every lookup failure degrades to a full
    /// handshake.
    pub async fn negotiate(
        &self,
        conn: &ConnectionInfo,
        presented: Option<&[u8]>,
        fresh_state: &[u8],
    ) -> Result<TicketNegotiation, TicketError> {
        let Some(callback) = self.callback.as_deref() else {
            return Ok(TicketNegotiation::disabled());
        };
        let result = self.run(callback, conn, presented, fresh_state).await;
        if let Err(err) = &result {
            self.stats.record_failure();
            warn!(target: "stek::negotiator", peer = ?conn.peer, error = %err, "aborting handshake");
        }
        result
    }

    async fn run(
        &self,
        callback: &dyn TicketKeyCallback,
        conn: &ConnectionInfo,
        presented: Option<&[u8]>,
        fresh_state: &[u8],
    ) -> Result<TicketNegotiation, TicketError> {
        let mut state = match presented {
            Some(_) => DispatchState::NeedLookup,
            None => DispatchState::NeedNewTicket,
        };
        let mut resumed: Option<ResumedSession> = None;
        let mut outcome = ResumptionOutcome::FullHandshake;
        let mut fell_back = false;

        loop {
            trace!(target: "stek::negotiator", ?state, "dispatch");
            match state {
                DispatchState::NeedLookup => {
                    let ticket = presented.unwrap_or_default();
                    match self.lookup(callback, conn, ticket).await? {
                        Some((session, renew)) if renew => {
                            self.stats.record_resumed(true);
                            outcome = ResumptionOutcome::ResumedAndRenewed;
                            resumed = Some(session);
                        }
                        Some((session, _)) => {
                            self.stats.record_resumed(false);
                            return Ok(TicketNegotiation {
                                outcome: ResumptionOutcome::Resumed,
                                resumed: Some(session),
                                new_ticket: None,
                            });
                        }
                        None => fell_back = true,
                    }
                    state = DispatchState::NeedNewTicket;
                }
                DispatchState::NeedNewTicket => {
                    let sealed = resumed
                        .as_ref()
                        .map_or(fresh_state, |session| session.session_state.as_slice());
                    let new_ticket = self.issue(callback, conn, sealed).await?;
                    // One fallback per handshake, whichever step declined.
                    if fell_back || new_ticket.is_none() {
                        self.stats.record_fallback();
                    }
                    return Ok(TicketNegotiation {
                        outcome,
                        resumed,
                        new_ticket,
                    });
                }
            }
        }
    }

    /// `Ok(None)` means fall back to a full handshake.
    async fn lookup(
        &self,
        callback: &dyn TicketKeyCallback,
        conn: &ConnectionInfo,
        ticket: &[u8],
    ) -> Result<Option<(ResumedSession, bool)>, TicketError> {
        let Some(key_name) = KeyName::from_prefix(ticket) else {
            debug!(target: "stek::negotiator", len = ticket.len(), "presented ticket too short");
            return Ok(None);
        };
        let (keys, renew) = match callback
            .invoke(conn, TicketKeyRequest::Decrypt { key_name })
            .await
        {
            CallbackOutcome::Established(keys) => (keys, false),
            CallbackOutcome::EstablishedAndRenew(keys) => (keys, true),
            CallbackOutcome::Fallback => return Ok(None),
            CallbackOutcome::Error(err) => return Err(err),
        };
        match codec::open(&keys, ticket) {
            Ok(session_state) => Ok(Some((
                ResumedSession {
                    key_name,
                    session_state,
                },
                renew,
            ))),
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                debug!(target: "stek::negotiator", key_name = %key_name, reason = %err, "ticket not accepted");
                Ok(None)
            }
        }
    }

    async fn issue(
        &self,
        callback: &dyn TicketKeyCallback,
        conn: &ConnectionInfo,
        session_state: &[u8],
    ) -> Result<Option<Ticket>, TicketError> {
        let keys = match callback.invoke(conn, TicketKeyRequest::Encrypt).await {
            CallbackOutcome::Established(keys) | CallbackOutcome::EstablishedAndRenew(keys) => keys,
            CallbackOutcome::Fallback => {
                debug!(target: "stek::negotiator", peer = ?conn.peer, "continuing without a new ticket");
                return Ok(None);
            }
            CallbackOutcome::Error(err) => return Err(err),
        };
        let ticket = codec::seal(&keys, session_state)?;
        self.stats.record_issued();
        debug!(target: "stek::negotiator", key_name = %keys.key_name(), len = ticket.len(), "issued ticket");
        Ok(Some(ticket))
    }
}

impl fmt::Debug for TicketNegotiator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TicketNegotiator")
            .field("callback", &self.callback)
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::TicketKeyDispatcher;
    use crate::policy::RenewalPolicy;
    use std::time::Duration;
    use stek_core::{InMemoryKeyStore, ManualClock, OsEntropy, RotationPolicy};

    fn negotiator(clock: Arc<ManualClock>) -> TicketNegotiator {
        let store = Arc::new(InMemoryKeyStore::new(
            RotationPolicy::default()
                .with_lifetime(Duration::from_secs(3600))
                .with_rotate_before_expiry(Duration::from_secs(300)),
            clock.clone(),
            Arc::new(OsEntropy),
        ));
        let dispatcher = TicketKeyDispatcher::new(store, RenewalPolicy::new(Duration::from_secs(300)))
            .with_clock(clock);
        TicketNegotiator::new(Arc::new(dispatcher))
    }

    #[tokio::test]
    async fn disabled_negotiator_ignores_tickets() {
        let negotiator = TicketNegotiator::disabled();
        assert!(!negotiator.is_enabled());
        let result = negotiator
            .negotiate(&ConnectionInfo::default(), Some(&[0u8; 64]), b"state")
            .await
            .expect("negotiate");
        assert_eq!(result.outcome, ResumptionOutcome::Disabled);
        assert!(result.resumed.is_none());
        assert!(result.new_ticket.is_none());
    }

    #[tokio::test]
    async fn first_contact_issues_a_ticket() {
        let negotiator = negotiator(Arc::new(ManualClock::at(0)));
        let result = negotiator
            .negotiate(&ConnectionInfo::default(), None, b"fresh")
            .await
            .expect("negotiate");
        assert_eq!(result.outcome, ResumptionOutcome::FullHandshake);
        assert!(result.new_ticket.is_some());
        assert_eq!(negotiator.stats().snapshot().issued, 1);
    }

    #[tokio::test]
    async fn resumed_session_keeps_its_ticket() {
        let negotiator = negotiator(Arc::new(ManualClock::at(0)));
        let conn = ConnectionInfo::default();
        let first = negotiator.negotiate(&conn, None, b"S1").await.expect("issue");
        let ticket = first.new_ticket.expect("ticket");

        let second = negotiator
            .negotiate(&conn, Some(ticket.as_bytes()), b"unused")
            .await
            .expect("resume");
        assert_eq!(second.outcome, ResumptionOutcome::Resumed);
        assert_eq!(second.resumed.expect("session").session_state, b"S1");
        assert!(second.new_ticket.is_none());
    }

    #[tokio::test]
    async fn garbage_ticket_falls_back_and_issues_fresh_state() {
        let negotiator = negotiator(Arc::new(ManualClock::at(0)));
        let conn = ConnectionInfo::default();
        for garbage in [&[1u8; 4][..], &[2u8; 90][..]] {
            let result = negotiator
                .negotiate(&conn, Some(garbage), b"full")
                .await
                .expect("negotiate");
            assert_eq!(result.outcome, ResumptionOutcome::FullHandshake);
            assert!(result.resumed.is_none());
            assert!(result.new_ticket.is_some());
        }
        let stats = negotiator.stats().snapshot();
        assert_eq!(stats.fallbacks, 2);
        assert_eq!(stats.issued, 2);
        assert_eq!(stats.failures, 0);
    }

    #[derive(Debug)]
    struct DecliningCallback;

    #[async_trait::async_trait]
    impl TicketKeyCallback for DecliningCallback {
        async fn invoke(&self, _conn: &ConnectionInfo, _request: TicketKeyRequest) -> CallbackOutcome {
            CallbackOutcome::Fallback
        }
    }

    #[tokio::test]
    async fn declined_lookup_and_issue_count_one_fallback() {
        let negotiator = TicketNegotiator::new(Arc::new(DecliningCallback));
        let result = negotiator
            .negotiate(&ConnectionInfo::default(), Some(&[5u8; 80]), b"full")
            .await
            .expect("negotiate");
        assert_eq!(result.outcome, ResumptionOutcome::FullHandshake);
        assert!(result.new_ticket.is_none());

        negotiator
            .negotiate(&ConnectionInfo::default(), None, b"full")
            .await
            .expect("negotiate");
        let stats = negotiator.stats().snapshot();
        assert_eq!(stats.fallbacks, 2);
        assert_eq!(stats.issued, 0);
    }
}

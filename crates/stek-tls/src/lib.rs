//! Stateless session tickets for TLS resumption.
//!
//! The pieces, bottom-up:
//!
//! * [`codec`] seals session state into the ticket wire format and opens it again.
//! * [`TicketKeyDispatcher`] is the key callback a handshake engine invokes; it
//!   resolves [`TicketKeys`] through an injected [`stek_core::KeyStore`] and
//!   reports the `2 / 1 / 0 / -1` outcome codes.
//! * [`TicketNegotiator`] runs the per-handshake lookup / reissue state machine
//!   on top of any [`TicketKeyCallback`].
//! * [`TicketConfig`] wires the above from a YAML or JSON file.

pub mod codec;
pub mod config;
pub mod crypto;
pub mod dispatcher;
pub mod error;
pub mod negotiator;
pub mod policy;
pub mod stats;

pub use codec::{decode, encode, open, seal, Ticket, TicketView};
pub use config::TicketConfig;
pub use crypto::{CipherContext, MacContext, TicketKeys};
pub use dispatcher::{
    CallbackOutcome, ConnectionInfo, TicketKeyCallback, TicketKeyDispatcher, TicketKeyRequest,
    CODE_ERROR, CODE_ESTABLISHED, CODE_FALLBACK, CODE_RENEW,
};
pub use error::TicketError;
pub use negotiator::{
    DispatchState, ResumedSession, ResumptionOutcome, TicketNegotiation, TicketNegotiator,
};
pub use policy::RenewalPolicy;
pub use stats::{TicketStats, TicketStatsSnapshot};

//! Ordered message dispatch for layered protocols.
//!
//! Higher layers (key/value stores, sync, route exchange) plug in here
//! rather than wrapping the node: register a handler, claim the sub-flags
//! you own, and let everything else fall through.

use crate::connection::{Action, Connection};
use crate::envelope::Envelope;

/// One link in the dispatch chain.
///
/// Handlers are consulted in registration order after the node's built-in
/// ones (handshake, peers, response, request); the first to return `true`
/// claims the message and stops the chain. Unclaimed whisper and broadcast
/// messages land in the node's inbox.
pub trait MessageHandler: Send {
    /// Inspect `env`, which arrived on `conn`. Push any replies into `out`
    /// (typically built with [`Connection::send`]) and return whether the
    /// message was claimed.
    fn handle(
        &mut self,
        env: &Envelope,
        conn: &mut Connection,
        now: u64,
        out: &mut Vec<Action>,
    ) -> bool;
}

impl<F> MessageHandler for F
where
    F: FnMut(&Envelope, &mut Connection, u64, &mut Vec<Action>) -> bool + Send,
{
    fn handle(
        &mut self,
        env: &Envelope,
        conn: &mut Connection,
        now: u64,
        out: &mut Vec<Action>,
    ) -> bool {
        self(env, conn, now, out)
    }
}

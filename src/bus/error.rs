use thiserror::Error;

use crate::bus::address::Address;

/// Errors a host may want to match on (e.g. via `anyhow`'s downcast).
///
/// [MbusError::DeliveryFailed] is the fatal end of the reliable-send state
///  machine: an unacknowledged reliable message after the full retransmission
///  budget is unrecoverable for this protocol, since the control topology
///  cannot progress with an unreachable peer. The host decides whether to
///  abort, log or escalate.
#[derive(Error, Debug)]
pub enum MbusError {
    #[error("no acknowledgement for reliable message {seq} to ({dest}) after {retransmits} retransmissions")]
    DeliveryFailed {
        seq: u64,
        dest: Address,
        retransmits: u8,
    },

    #[error("rendezvous for token {token:?} did not complete in time")]
    RendezvousTimeout { token: String },
}

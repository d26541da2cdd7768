//! Background reconciliation of desired state toward server state.
//!
//! One reconciler thread runs per client. It wakes on:
//! - registry mutations and waiter registrations
//! - connection resets reported by the router
//! - retry deadlines and a periodic tick
//!
//! Each pass diffs desired against acknowledged state, sends the needed
//! (un)subscribe commands grouped per mode, then releases satisfied waiters.

mod manager;
mod operation;
mod waiters;

pub(crate) use manager::Reconciler;
pub(crate) use waiters::{Outcome, WaiterTable};

/// Signals delivered to the reconciler thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Control {
    /// Something changed; run a pass.
    Wake,
    /// The server dropped every subscription.
    ConnectionReset,
    /// Stop and cancel every waiter.
    Shutdown,
}

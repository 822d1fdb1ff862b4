//! Causeway Journal - per-tick audit trail of tracked mutations.
//!
//! Once a phase unwinds, its transactions are either committed or restored
//! and never touched again. This crate keeps that history for the rest of
//! the tick so diagnostics and tests can ask what happened, where, and why.
//!
//! # Modules
//!
//! - [`journal`]: the [`TransactionJournal`](journal::TransactionJournal),
//!   its entries, and resolution queries.

#![deny(unsafe_code)]

pub mod journal;

/// Errors produced by journal export.
#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("failed to export journal as JSON: {0}")]
    Export(#[source] serde_json::Error),
}

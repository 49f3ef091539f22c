//! Stowage Test & Validation Infrastructure
//!
//! Cross-crate tests for the stowage storage stack: end-to-end scenarios
//! through sanitized, encrypted and content-addressable layers, atomic
//! replace under injected faults, recursive removal ordering, size
//! accounting and property tests for confinement and encryption.

pub mod harness;
pub mod proptest_storage;

pub use harness::{
    cas_with, memory_backend, plain_cas, pull_all, sample, small_repository_options, Call,
    FaultTarget, FaultyStorage, RecordingStorage, TestEnv,
};

#[cfg(test)]
mod accounting_tests;
#[cfg(test)]
mod maintenance_tests;

//! Metered, pay-per-second payment streams between IoT device buyers and
//! device owners.

pub mod error;
pub mod event;
pub mod instruction;
pub mod processor;
pub mod state;

#[cfg(not(target_os = "solana"))]
pub mod index;

#[cfg(not(feature = "exclude_entrypoint"))]
pub mod entrypoint;

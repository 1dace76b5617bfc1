pub mod balance;
pub mod events;
pub mod service;
pub mod store;
pub mod types;

pub use service::{AdminBootstrap, LedgerError, LedgerPolicyConfig, LedgerService};

#[cfg(test)]
mod tests;

//! Transfer services: persistence, byte movement, hooks and orchestration.
//!
//! [`gateway::TransferGateway`] is the entry point the handlers use; the other
//! modules are the seams it is assembled from.

pub mod bandwidth;
pub mod blob_store;
pub mod extensions;
pub mod gateway;
pub mod hooks;
pub mod object_store;
pub mod provider;
pub mod reaper;
pub mod token_store;

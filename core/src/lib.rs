//! Mintaka consensus-maintenance core.
//!
//! The subsystem that continuously decides which chain of blocks is
//! canonical, reconciles divergent views with peers, and mints new blocks
//! when this node is eligible. Three components cooperate:
//!
//! * [`synchronizer`] drives one peer-reconciliation attempt at a time:
//!   common-block search, chain-weight comparison, then fork switch or
//!   incremental extension.
//! * [`minter`] keeps block candidates for every eligible local identity
//!   and commits the best one when liveness preconditions hold.
//! * [`coordinator`] owns the single chain-mutation lock, the recent-blocks
//!   cache and the decision of when to synchronize; both mutation paths
//!   funnel through it.
//!
//! Storage, transport, validation rules and weight scoring are external
//! collaborators behind the [`store`], [`network`] and [`rules`] traits.

pub mod coordinator;
pub mod mempool;
pub mod minter;
pub mod network;
pub mod rules;
pub mod shutdown;
pub mod store;
pub mod synchronizer;
pub mod time;
pub mod types;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

pub mod connectivity;
pub mod controller;
pub mod queue;
pub mod state;

#[cfg(test)]
pub mod testing;

pub use connectivity::{probe, NetworkEvents, NetworkState};
pub use controller::{is_provisional, ExpenseController, SyncStatus};

pub mod accounts;
pub mod auth;
pub mod billing;
pub mod config;
pub mod db;
pub mod error;
pub mod extractor;
pub mod gate;
pub mod houses;
pub mod ledger;
pub mod lookup;
pub mod routes;
pub mod state;
pub mod usage;

pub use gate::{AccessGate, GateGrant, GateRejection, OperationOutcome};
pub use state::AppState;

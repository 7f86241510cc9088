pub mod attribution;
pub mod clock;
pub mod config;
pub mod connectivity;
pub mod cookies;
pub mod error;
pub mod fetcher;
pub mod io;
pub mod orchestrator;
pub mod paths;
pub mod permission;
pub mod store;
pub mod surface;

pub use error::{GateError, Result};

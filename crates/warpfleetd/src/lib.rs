//! warpfleetd: the WarpFleet daemon as a library.
//!
//! - **`config`**: `warpfleet.toml` parsing and the per-component configs
//! - **`member`**: HTTP client for member-cluster workload status and deletion
//! - **`daemon`**: store seeding and process wiring

pub mod config;
pub mod daemon;
pub mod member;

pub use config::{FleetConfig, parse_duration};
pub use daemon::{SeedReport, run, seed_store};
pub use member::MemberClient;

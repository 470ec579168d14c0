//! # mesura
//!
//! Polls home-monitoring data sources on fixed intervals and appends every
//! reading to schema-evolving storage.
//!
//! ## Crate Structure
//!
//! - **`record`**: The flat, ordered `Record` and its `FieldValue` scalars.
//! - **`flatten`**: Turns nested JSON into dotted/indexed column names.
//! - **`interval`**: Parses polling intervals such as `30s`, `10m`, `2h`.
//! - **`storage`**: The `Backend` trait, the process-wide destination locks and
//!   the SQLite and CSV strategies. SQLite tables gain columns as new fields
//!   appear; CSV files keep the header of their first row.
//! - **`monitor`**: The `Monitor` trait and the built-in sources: a P1 energy
//!   meter, OpenWeatherMap and evohome heating zones.
//! - **`controller`**: Fixed-rate fetch → process → write loop for one monitor.
//! - **`scheduler`**: Runs all controllers until Ctrl-C / SIGTERM.
//! - **`config`**: Layered configuration (`mesura.toml` + environment) via figment.
//! - **`logging`**: `tracing-subscriber` setup.
//! - **`app`**: Builds a scheduler from a configuration.
//! - **`error`**: The `MesuraError` enum shared by every module.

pub mod app;
pub mod config;
pub mod controller;
pub mod error;
pub mod flatten;
pub mod interval;
pub mod logging;
pub mod monitor;
pub mod record;
pub mod scheduler;
pub mod storage;

pub use controller::{ControllerState, PollingController};
pub use error::{AppResult, MesuraError};
pub use record::{FieldValue, Record};
pub use scheduler::Scheduler;

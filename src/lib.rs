pub mod capability;
pub mod config;
pub mod db;
pub mod entities;
pub mod error;
pub mod lifecycle;
pub mod metrics;
pub mod model;
pub mod remote;
pub mod store;
pub mod sync;
pub mod telemetry;
pub mod util;

//! Kitchen orders: duplicate-delivered orders cooked exactly once.
//!
//! Orders arrive at least once, often several times at once, and the
//! kitchen service fails at random. Each order still gets one cook and one
//! notification.

pub mod config;
pub mod kitchen;

pub use config::DemoConfig;
pub use kitchen::{KitchenSummary, PolicyReport, compare_policies, run_orders};

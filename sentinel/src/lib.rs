//! Userspace agent for the sentinel XDP classifier: loads the program,
//! manages the source denylist, drains exported events and serves the API.

pub mod analyzer;
pub mod api;
pub mod config;
pub mod counters;
pub mod denylist;
pub mod ring;
pub mod state;

//! Device export schema
//!
//! This module defines the typed input schema for diabetes device exports
//! and the adapter that turns a CSV export into time-sorted events.

mod raw_event;
mod adapter;

pub use raw_event::*;
pub use adapter::*;

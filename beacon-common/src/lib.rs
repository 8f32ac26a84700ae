//! # Beacon Common Library
//!
//! Shared code for the Beacon service including:
//! - Database initialization and row models
//! - Change-notification and record status types
//! - Recurrence rule parsing and next-occurrence calculation
//! - Configuration loading
//! - Error and timestamp utilities

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod recurrence;
pub mod time;

pub use error::{Error, Result};
pub use events::{ChangeAction, ChangeNotification, RecordStatus};

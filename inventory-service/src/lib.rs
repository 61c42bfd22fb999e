pub mod cache;
pub mod catalog;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod handlers;
pub mod ledger;
pub mod models;
pub mod reaper;
pub mod reservations;
pub mod schema;
pub mod service;
pub mod store;

pub use error::{InventoryError, Result};

//! HTTP handlers

pub mod execute;
pub mod health;
pub mod queries;

pub use execute::execute;
pub use health::{health, metrics};
pub use queries::{cancel_query, delete_query, fetch_results, get_query, submit_query};

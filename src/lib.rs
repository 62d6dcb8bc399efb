//! Conditional-request (ETag) decisions for read endpoints backed by
//! independently versioned data stores.

pub mod application;
pub mod config;
pub mod infra;
pub mod tracker;

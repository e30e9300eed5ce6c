pub mod config;
pub mod context;
pub mod credits;
pub mod error;
pub mod extractor;
pub mod memory;
pub mod pricing;
pub mod providers;
pub mod reconciler;
pub mod routes;
pub mod tasks;
pub mod webhooks;

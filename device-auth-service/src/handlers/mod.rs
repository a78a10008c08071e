pub mod auth;
pub mod context;
pub mod devices;
pub mod metrics;
pub mod sessions;

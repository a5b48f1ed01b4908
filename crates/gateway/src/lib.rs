pub mod config;
pub mod context;
pub mod enhance;
pub mod files;
pub mod http;
pub mod jsonpath;
pub mod metrics;
pub mod sql;

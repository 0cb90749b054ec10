pub mod auth;
pub mod config;
pub mod connectors;
pub mod db;
pub mod normalize;
pub mod output;
pub mod sync;

pub mod cache;
pub mod config;
pub mod dedup;
pub mod error;
pub mod extract;
pub mod gateway;
pub mod generate;
pub mod model;
pub mod orchestrator;
pub mod places;
pub mod resources;
pub mod text;

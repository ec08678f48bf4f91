pub mod client;
pub mod cluster;
pub mod config;
pub mod events;
pub mod model;
pub mod supervisor;

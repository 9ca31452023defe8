pub mod config;
pub mod generate;
pub mod model;
pub mod processor;

pub mod config;
pub mod model;
pub mod orchestrator;
pub mod queue;
pub mod store;
pub mod submit;
pub mod worker;

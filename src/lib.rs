pub mod config;
pub mod errors;
pub mod logging;
pub mod orchestrator;
pub mod registry;
pub mod shutdown;
pub mod util;

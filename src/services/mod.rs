// RelayGate Services
// Business logic layer

mod config_renderer;
mod config_validator;
mod errors;
mod process_controller;
mod state_store;
mod supervisor;

pub use config_renderer::*;
pub use config_validator::*;
pub use errors::*;
pub use process_controller::*;
pub use state_store::*;
pub use supervisor::*;

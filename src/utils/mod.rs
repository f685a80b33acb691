// Shared utilities module
pub mod config_loader;
pub mod errors;
pub mod logging;
pub mod paths;
pub mod ui;

pub use config_loader::*;
pub use errors::*;
pub use logging::*;
pub use paths::*;
pub use ui::*;

// Infrastructure layer: default collaborators behind the core traits
pub mod cache;
pub mod compiler;
pub mod file_system;
pub mod hmr;
pub mod node_resolver;
pub mod packagers;
pub mod watcher;
pub mod worker_farm;

pub use cache::*;
pub use compiler::*;
pub use file_system::*;
pub use hmr::*;
pub use node_resolver::*;
pub use packagers::*;
pub use watcher::*;
pub use worker_farm::*;

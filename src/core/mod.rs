// Core domain layer
pub mod asset;
pub mod bundle;
pub mod bundler;
pub mod interfaces;
pub mod models;
pub mod registry;
pub mod tree_builder;

pub use asset::*;
pub use bundle::*;
pub use bundler::*;
pub use interfaces::*;
pub use models::*;
pub use registry::*;
pub use tree_builder::*;

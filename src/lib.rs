//! kiln: an incremental module bundler.
//!
//! [`core::Bundler`] owns the asset graph and drives build passes; the
//! collaborators it talks to (resolver, compiler, cache, watcher, packagers,
//! HMR notifier) are traits in [`core::interfaces`] with default
//! implementations in [`infrastructure`].

pub mod cli;
pub mod core;
pub mod infrastructure;
pub mod utils;

pub use crate::core::{BuildReport, Bundler};
pub use crate::utils::{KilnError, Result};

//! Thread lifecycle: create, exit, join and introspection.

mod create;
mod exit;
mod info;
mod join;

pub use create::*;
pub use join::*;

//! External process abstractions.
//!
//! Separates pure logic (routing, verification, breaker transitions) from
//! impure effects (subprocess execution) so the rest of the crate can be
//! tested with a scripted `CommandExecutor` instead of a real shell.

pub mod command;

pub use command::{CommandExecutor, CommandError, CommandOutput, ProcessCommandExecutor};
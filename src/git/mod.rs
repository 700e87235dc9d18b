//! Git operations module: a thin, shell-based wrapper over `git` (§4.1).

pub mod service;

pub use service::GitService;

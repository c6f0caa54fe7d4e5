//! # bitrise
//!
//! Workflow execution engine for CI builds: given a declarative build
//! configuration and a set of secrets, it selects a workflow, expands its
//! before/after composition, acquires each step's source, computes its
//! input environment, executes it under timeouts with secret-redacted log
//! streaming, and accumulates typed results into a build summary.
//!
//! ## Modules
//!
//! - `models` - configuration document, step, env item, trigger and result models
//! - `envstore` - file-backed env store passing variables across process boundaries
//! - `template` - run-if expression evaluation over build state
//! - `steps` - step acquisition (path, git, inline, step library)
//! - `deps` - OS-level step dependency handling
//! - `logfilter` - secret redaction, log classification and error capture
//! - `runner` - step subprocess execution with hard and no-output timeouts
//! - `workflow` - the workflow engine itself
//! - `trigger` - trigger map resolution
//! - `cli` - command handlers and presentation

pub mod cli;
pub mod context;
pub mod deps;
pub mod envstore;
pub mod error;
pub mod logfilter;
pub mod models;
pub mod paths;
pub mod runner;
pub mod steps;
pub mod template;
pub mod trigger;
pub mod workflow;

pub use context::BuildContext;
pub use error::{Error, Result};

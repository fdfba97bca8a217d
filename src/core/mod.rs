//! Core domain models for workflows
//!
//! This module defines the fundamental data structures that represent
//! workflows, jobs, triggers, expressions and run state.

pub mod annotation;
pub mod artifact;
pub mod condition;
pub mod config;
pub mod context;
pub mod identity;
pub mod job;
pub mod matrix;
pub mod state;
pub mod trigger;
pub mod workflow;

pub use context::*;
pub use job::*;
pub use state::*;
pub use workflow::*;
pub use trigger::{EventKind, TriggerEvent};

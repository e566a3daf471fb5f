//! Crucible library crate
//!
//! A closed-loop coding agent engine: a coder proposes an action, a
//! gated executor applies it under checkpoint, a reviewer judges the
//! observed result, and a reflector turns rejections into a revised
//! strategy for the next attempt. Exposed as a library so hosts can embed
//! the engine without going through CLI startup.

pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod events;
pub mod gateway;
pub mod oracle;
pub mod orchestrator;
pub mod patch;
pub mod prompts;
pub mod sandbox;
pub mod task;

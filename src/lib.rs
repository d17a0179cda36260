//! Flow execution engine: compiles task graphs and steps their instances.

pub mod activities;
pub mod behaviors;
pub mod compiler;
pub mod config;
pub mod data;
pub mod dsl;
pub mod error;
pub mod runtime;

//! ocifold CLI - flatten container images to a single layer.

pub mod commands;
pub mod output;

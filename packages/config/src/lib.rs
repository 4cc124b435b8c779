// ABOUTME: Configuration crate for netlab
// ABOUTME: Re-exports environment variable names and their defaults

pub mod constants;

pub use constants::*;

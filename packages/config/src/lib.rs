// ABOUTME: Shared configuration names for the Warden workspace
// ABOUTME: Re-exports environment variable constants consumed by the sandbox manager and CLI

pub mod constants;

pub use constants::*;

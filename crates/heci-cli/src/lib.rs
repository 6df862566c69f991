//! Support library for the `heci` command.
//!
//! The binary opens a session against the platform backend, connects to a
//! firmware client and exchanges raw messages with it. Settings come from
//! [`config::Config`].

pub mod config;

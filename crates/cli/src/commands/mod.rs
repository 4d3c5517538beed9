//! Demo subcommands.

pub mod serve;

//! Aggregate Log Core - the aggregating log buffer.
//!
//! This crate provides the buffer used by the request-logging middleware in
//! `aggregate-log-axum`:
//! - [`LogBuffer`] - bounded, thread-safe accumulator of JSON log records
//! - [`LogBufferOptions`] - construction options (banner, headers, size)
//! - [`LogBufferError`] - capacity errors reported on append
//!
//! # Architecture
//!
//! The core crate has no framework dependencies. A logger only needs
//! something implementing [`std::io::Write`], which [`LogBuffer`] does.

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod buffer;

pub use buffer::*;

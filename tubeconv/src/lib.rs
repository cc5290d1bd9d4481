//! tubeconv library crate.
//!
//! Resolves remote media references with an external resolver, pipes the
//! media through an external transcoder and serves the result either as a
//! background job or as a live download.

pub mod api;
pub mod config;
pub mod error;
pub mod jobs;
pub mod logging;
pub mod pipeline;
pub mod proxy;
pub mod resolver;
pub mod utils;

pub use error::{Error, Result};

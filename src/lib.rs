//! Gator - a syndicated feed aggregator
//!
//! This crate fetches feeds from many sources with bounded concurrency,
//! normalizes their entries, and stores them as deduplicated posts.

pub mod aggregator;
pub mod config;
pub mod dates;
pub mod db;
pub mod fetcher;
pub mod persister;

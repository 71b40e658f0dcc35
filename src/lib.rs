//! Incremental sync of xkcd comics and "what if?" articles into SQLite.

pub mod config;
pub mod db;
pub mod error;
pub mod media;
pub mod model;
pub mod source;
pub mod sync;
pub mod transport;

//! Bus transport: per-connection read and write tasks.

pub mod connection;

pub use connection::accept;

//! Concrete [`AliasDirectory`](crate::AliasDirectory) implementations.
//!
//! Contains [`HttpAliasDirectory`] for the remote alias API and
//! [`StaticAliasDirectory`] for forward mappings kept in configuration.

pub mod http;
pub mod static_map;

pub use http::*;
pub use static_map::*;

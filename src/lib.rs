#![warn(clippy::all)]
#![allow(clippy::module_inception)]
#![allow(clippy::type_complexity)]

pub mod encoding;
pub mod error;
pub mod kv;
pub mod lin;
pub mod raft;

pub use error::{Error, Result};

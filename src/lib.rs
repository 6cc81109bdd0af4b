#![deny(clippy::expect_used)]
#![deny(clippy::unwrap_used)]

pub mod backend;
pub mod config;
pub mod error;
pub mod frame;
pub mod pipeline;
pub mod registry;
pub mod session;
pub mod snapshot;

pub use error::{OurError, OurResult};

//! Wire vocabulary, typed records and transport seams shared by the
//! load-balancer provider and its requesters.

pub mod codec;
pub mod error;
pub mod events;
pub mod hash;
pub mod memory;
pub mod protocol;
pub mod relation;
pub mod types;

pub use error::{EndpointError, Result};

//! Requester side of the `loadbalancer` relation: register frontends and
//! backends, then read back where the provider made them reachable.

pub mod requirer;

pub use requirer::{LoadbalancerRequest, Requirer, ResponseState};

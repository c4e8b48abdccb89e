//! Supporting modules around the transfer pipeline: proxy health, request
//! identities, pacing, events, and run statistics.

pub mod events;
pub mod identity;
pub mod proxy;
pub mod stats;
pub mod timing;

//! Ingress/egress transports and the dispatcher that ties them to the
//! rest of the pipeline (spec §6).

pub mod bridge;
pub mod channels;
pub mod http;
pub mod utils;

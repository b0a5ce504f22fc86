pub mod audit;
pub mod batch;
pub mod config;
pub mod graphql;
pub mod http;
pub mod metrics;
pub mod pipeline;
pub mod rate_limit;
pub mod upstream;
pub mod validation;

#[cfg(test)]
pub(crate) mod testing;

pub use pipeline::{Gateway, InboundOperation, OperationResponse};

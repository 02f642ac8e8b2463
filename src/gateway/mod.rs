//! The gateway proper: the upstream connector, the request pipeline, and the
//! HTTP server boundary.

pub mod connector;
pub mod pipeline;
pub mod server;

pub use connector::{HttpConnector, UpstreamConnector, UpstreamRequest};
pub use pipeline::GatewayPipeline;
pub use server::{GatewayServer, ServerConfig};

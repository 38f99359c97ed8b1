//! Built-in upstream provider implementations.
//!
//! This crate does not perform network IO. It builds `UpstreamHttpRequest` for
//! upstream calls (including the project id probe) and interprets their bodies.

pub mod vertexexpress;

pub use vertexexpress::rewrite::{BodyOp, ModelPattern, RewriteRule, RewriteTable};
pub use vertexexpress::{VertexExpressConfig, VertexExpressProvider};

pub mod auth;
pub mod bootstrap;
pub mod error;
pub mod proxy_engine;
pub mod relay;
pub mod resolver;
pub mod upstream_client;

pub use auth::{AuthProvider, NoopAuth, SharedSecretAuth, auth_from_secret};
pub use bootstrap::{Bootstrap, CliArgs, bootstrap, bootstrap_from_env};
pub use error::{AttemptFailure, DispatchError, StreamTruncated};
pub use proxy_engine::{ProxyBody, ProxyCall, ProxyEngine, ProxyResponse};
pub use relay::RelayStream;
pub use resolver::ProjectResolver;
pub use upstream_client::{
    UpstreamClient, UpstreamClientConfig, WreqUpstreamClient, spawn_stream_pump,
};

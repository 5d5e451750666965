pub mod cache;
pub mod config;
pub mod ldap_protocol;
pub mod metrics;
pub mod second_factor;
pub mod server;
pub mod session;
pub mod tls;

#[cfg(test)]
pub(crate) mod testutil;

pub use cache::DnLoginCache;
pub use config::Config;
pub use metrics::{run_metrics_server, Metrics};
pub use second_factor::{HttpSecondFactor, SecondFactor};
pub use server::MfaProxy;
pub use session::ProxySession;

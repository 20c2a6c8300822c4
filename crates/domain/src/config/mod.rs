mod errors;
mod logging;
mod root;
mod stub;
mod upstream;

pub use errors::ConfigError;
pub use logging::LoggingConfig;
pub use root::{CliOverrides, Config};
pub use stub::{ExtraListenerSpec, ListenerMode, StubConfig, DNS_STUB_DEFAULT_PORT};
pub use upstream::UpstreamConfig;

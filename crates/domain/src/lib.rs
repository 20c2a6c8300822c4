pub mod answer;
pub mod config;
pub mod errors;
pub mod name;
pub mod protocol;
pub mod rcode;
pub mod record_type;
pub mod resource_record;

pub use answer::{
    AnswerItem, DnssecResult, QueryFlags, ResolverCompletion, ResolverState, SectionHint,
    UpstreamPacket, ALIAS_REDIRECT_MAX,
};
pub use config::{
    CliOverrides, Config, ConfigError, ExtraListenerSpec, ListenerMode, LoggingConfig, StubConfig,
    UpstreamConfig,
};
pub use errors::DomainError;
pub use name::DnsName;
pub use protocol::{DnsProtocol, Transport};
pub use record_type::{RecordClass, RecordType};
pub use resource_record::{RData, ResourceKey, ResourceRecord};

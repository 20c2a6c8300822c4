mod forwarder;

pub use forwarder::ForwardingResolver;

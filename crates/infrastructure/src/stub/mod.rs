pub mod dispatcher;
pub mod listener;
pub mod nsid;
pub mod packet;
pub mod pktinfo;
pub mod reply;
pub mod sockopt;
pub mod stream;

pub use dispatcher::{Egress, ExtraListener, ListenerContext, StubDispatcher, DNS_STUB_ADDRESS};
pub use listener::StubListenerSet;
pub use nsid::nsid_string;
pub use packet::{AppendedAnswer, DnsPacket, DNS_PACKET_HEADER_SIZE, DNS_PACKET_SIZE_MAX};
pub use reply::{ADVERTISE_DATAGRAM_SIZE_MAX, ADVERTISE_EXTRA_DATAGRAM_SIZE_MAX};
pub use stream::StubStream;

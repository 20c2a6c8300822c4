mod handle_stub_query;

pub use handle_stub_query::{HandleStubQuery, ReplyDisposition, ReplyFlags};

mod machine_id;
mod resolver;

pub use machine_id::MachineIdSource;
pub use resolver::{Resolver, ResolverRequest};

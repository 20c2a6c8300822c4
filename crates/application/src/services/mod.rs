mod section_assembler;

pub use section_assembler::{AssembledReply, SectionAssembler};

pub mod analyst;
pub mod assembler;
pub mod backfill;
pub mod context;
pub mod coordinator;
pub mod defaults;
pub mod error;
pub mod gatekeeper;
pub mod researcher;
pub mod responder;
pub mod streams;
pub mod thinker;

#[cfg(test)]
pub(crate) mod testutil;

pub use assembler::PromptAssembler;
pub use context::{PipelineContext, PipelineSettings};
pub use coordinator::{Coordinator, WebSearch};
pub use error::{Result, StageError};
pub use responder::OutboundSink;
pub use streams::spawn_streams;

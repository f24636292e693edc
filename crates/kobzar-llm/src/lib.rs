pub mod cli;
pub mod openai;
pub mod provider;
pub mod switchboard;

pub use cli::CliProvider;
pub use openai::OpenAiCompatProvider;
pub use provider::{ChatRequest, ChatResponse, LlmProvider, Message, ProviderError, Role};
pub use switchboard::{strip_fences, Switchboard, SwitchboardReply};

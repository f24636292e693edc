pub mod backend;
pub mod error;
pub mod prompts;
pub mod query;
pub mod store;
pub mod thoughtlog;
pub mod value;

pub use backend::{GraphBackend, GraphClient, MockBackend};
pub use error::{GraphError, Result};
pub use prompts::{InstructionSeed, RoleBundle, RoleSeed, RuleSeed, TaskSeed};
pub use store::{GraphStore, PersistOutcome, StoredMessage, StoredTopic, StoredUser};
pub use thoughtlog::ThoughtLogger;
pub use value::{ResultSet, Scalar};

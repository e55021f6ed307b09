//! mendloop: drives a language model against a project that fails to build,
//! one diagnostic at a time, keeping only the edits that make the build better.
//!
//! The building blocks (diagnostic extraction, response parsing, patching,
//! git) live in the `coordination` crate; this crate owns configuration, the
//! model collaborator, prompts and the repair loop itself.

pub mod config;
pub mod model;
pub mod orchestrator;
pub mod prompts;
pub mod reflection;
pub mod rules;
pub mod state_machine;
pub mod validator;

pub use config::{ConfigError, MendConfig, SessionBudget};
pub use model::{ChatModel, ModelError, OpenAiChatModel, RetryingModel};
pub use orchestrator::{Collaborators, RepairSession, SessionError, SessionReport};
pub use state_machine::SessionState;

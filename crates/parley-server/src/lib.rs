pub mod binding;
pub mod client;
pub mod error;
pub mod groups;
pub mod handlers;
pub mod orchestrator;
pub mod sequencer;
pub mod server;
pub mod title;

pub use binding::AgentBinding;
pub use error::{BindingError, DeliveryError, OrchestratorError, StartupError};
pub use groups::{ConnectionGroups, EventSink};
pub use orchestrator::{ConversationOrchestrator, OrchestratorState};
pub use sequencer::{RunningSystem, Sequencer, SystemConfig};
pub use server::{start, ServerConfig, ServerHandle};

pub mod mock;
pub mod remote;

pub use mock::{MockAgentEngine, MockReply};
pub use remote::RemoteAgentEngine;

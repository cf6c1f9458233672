pub mod context;
pub mod r#loop;

pub use context::ContextBuilder;
pub use r#loop::{AgentEvent, AgentLoop, PreparedTurn, TurnOutcome};

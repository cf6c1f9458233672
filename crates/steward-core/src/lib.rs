pub mod agent;
pub mod memory;
pub mod model;
pub mod session;
pub mod store;
pub mod task;
pub mod tools;
pub mod util;

// Re-export key types
pub use agent::{AgentEvent, AgentLoop};
pub use memory::MemoryRetriever;
pub use model::{ModelProvider, ModelTier};
pub use session::{Message, Session};
pub use store::{PersistenceStore, SqliteStore};
pub use task::{DurableTaskExecutor, TaskSupervisor};
pub use tools::{ToolGateway, ToolRegistry};

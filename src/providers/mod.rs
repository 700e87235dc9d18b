//! Agent provider abstraction: polymorphic executors, the event shapes they
//! emit, and the provider router that picks among them (§4.4, §4.6, §9).

pub mod events;
pub mod executor;
pub mod router;

pub use events::{AgentEvent, EventStatus, ToolCall};
pub use executor::{AgentClient, AgentExecutor, EventStreamExecutor, ExecutionConfig, HealthStatus, RequestResponseExecutor};
pub use router::{ProviderRouter, RecordResult};

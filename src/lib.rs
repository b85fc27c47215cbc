//! swarmcore: a process-local orchestration core for cooperating LLM agents.
//!
//! Four subsystems behind one [`Core`] handle:
//! - a multi-provider LLM router with OAuth-backed adapters and a full call
//!   log ([`Core::run_llm`], [`Core::routed_llm`]),
//! - capability-aware strategy selection over a static model registry plus
//!   live call statistics ([`Core::resolve_model`]),
//! - a persisted swarm task queue with DAG decomposition, atomic claims, and
//!   parallel level execution ([`Core::execute_decomposed`]),
//! - a persisted agent message bus with per-agent read cursors
//!   ([`Core::post_message`], [`Core::read_messages`]).

pub mod core;
pub mod logging;

pub use self::core::bus::{Message, MessageKind, NewMessage, ReadOptions};
pub use self::core::calllog::{CallLog, CallRecord};
pub use self::core::error::{CoreError, Result};
pub use self::core::registry::{ModelDescriptor, ModelRegistry, Pricing, Provider, Tier};
pub use self::core::router::{
    LlmResponse, ModelStats, ResolveOptions, RoutedOptions, RouterConfig, RouterOverrides,
    RunOptions, Strategy,
};
pub use self::core::swarm::{
    DecomposeOptions, ExecuteOptions, ExecutionReport, Subtask, SwarmStatus, SwarmTask, TaskEvent,
    TaskMode, TaskSpec, TaskStatus, parse_subtasks,
};
pub use self::core::{Core, CoreConfig};

//! Agent invocation: process runner, stream parsing, bounded pool.

pub mod mock;
pub mod pool;
pub mod runner;
pub mod stream;

pub use pool::{AgentPool, PoolProgressFn, RunnerState};
pub use runner::{AgentInvocation, AgentInvoker, AgentOutput, AgentRunner, ProgressFn};

//! Guest side of Contrast: the policy enforcer that gates every privileged
//! request to a pod VM, and the initializer that obtains the workload's
//! certificates from the Coordinator.

pub mod config;
pub mod enforcer;
pub mod error;
pub mod initializer;
pub mod request;
pub mod server;

pub use enforcer::{AgentState, Enforcing, Failed, Pending, PolicyEnforcer};
pub use error::{AgentError, EnforcementError, Result};
pub use request::{AgentRequest, CreateContainer, Mount};

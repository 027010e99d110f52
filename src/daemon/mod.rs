//! The riptide agent
//!
//! The agent runs as a separate long-lived process owning every active
//! share. The cli reaches it through the command interface in [`server`].

pub mod agent;
pub mod client;
pub mod clock;
pub mod protocol;
pub mod registry;
pub mod scheduler;
pub mod server;
pub mod store;

pub use agent::{shutdown_signal, Agent, AgentError, AgentHandle};
pub use client::{AgentClient, AgentLauncher, ClientError};
pub use clock::{Clock, ManualClock, SystemClock};
pub use registry::{AddShare, Registry, RegistryError, RegistryOptions};

//! The node-facing surface of logship: the gRPC `Log` service, the ACL
//! authorizer consulted before every append and read, TLS config loading,
//! and the agent that wires storage, consensus, and the multiplexed
//! listener into one runnable node.

pub mod acl;
pub mod agent;
pub mod service;
pub mod tls;

pub use acl::{Acl, AclError, Authorize};
pub use agent::{Agent, AgentConfig};
pub use service::LogService;

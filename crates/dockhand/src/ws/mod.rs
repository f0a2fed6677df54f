//! Real-time control channel.
//!
//! ```text
//! socket ──► handler (read loop) ──► MessageRouter ──► HandlerGroup ──► executor task
//!    ▲                                                                       │
//!    └──── writer task ◄── session queue ◄── SessionRegistry::send ◄─────────┘
//! ```
//!
//! The read loop never waits on the engine: apart from cancellation and
//! heartbeats every executor runs on its own task.

mod dispatch;
mod handler;
mod registry;
mod router;
mod types;

pub use dispatch::{ExecMode, Executor, HandlerGroup, run_guarded};
pub use handler::ws_handler;
pub use registry::{
    CancelHandle, DEFAULT_SESSION_BUFFER, DuplicateOperation, OperationLease, SessionHandle,
    SessionRegistry,
};
pub use router::{MessageRouter, RouterSetupError};
pub use types::{
    Direction, Envelope, Family, InboundEnvelope, MessageType, PREFIX_TABLE, PROTOCOL_VERSION,
    Phase, RoutingError, classify, validate_routing_table,
};

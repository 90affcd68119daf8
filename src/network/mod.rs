//! P2P networking for co-signers
//!
//! Provides the messages co-signers exchange and the connectivity layer the
//! session coordinator depends on.
//!
//! # Features
//! - Signed protocol envelopes
//! - Pluggable peer transport (in-process and TCP)
//! - Exponential backoff and poll schedules
//! - Preflight reachability checks and session connection monitoring

pub mod connectivity;
pub mod memory;
pub mod message;
pub mod retry;
pub mod tcp;
pub mod transport;

pub use connectivity::{
    ConnectSummary, ConnectivityMonitor, FailureOutcome, MonitorHandle, ParticipantRef,
    PreflightReport, RecoveryDecision, RecoveryHandler, RetryOutcome, PARTICIPANT_DISCONNECTED,
};
pub use memory::{MemoryNetwork, MemoryTransport};
pub use message::{Envelope, ProtocolMessage, RosterEntry, MAGIC, MAX_MESSAGE_SIZE, PROTOCOL_VERSION};
pub use retry::{PollSchedule, RetryPolicy};
pub use tcp::{parse_dial_addr, Frame, FrameCodec, TcpTransport};
pub use transport::{ConnectionState, DialTarget, PeerTransport};

//! MuSig2 signing sessions
//!
//! Provides the session data model, the session state machine and the
//! coordinator that runs the nonce and partial-signature rounds with the
//! other co-signers.

pub mod backend;
pub mod coordinator;
pub mod state;
pub mod types;

pub use backend::{MusigBackend, SigningContext, TranscriptBackend};
pub use coordinator::{SessionCoordinator, EXPIRED_REASON};
pub use state::SessionState;
pub use types::{ParticipantRecord, SessionAnnouncement, WalletSigningSession};

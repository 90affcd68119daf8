//! musig-cosign: co-signer discovery and MuSig2 session coordination
//!
//! This crate provides the peer-to-peer side of multi-party signing:
//! - Signer advertisements in a shared directory, with a local discovery cache
//! - A session coordinator that runs the nonce and partial-signature rounds
//! - Signed protocol envelopes over pluggable transports (in-process and TCP)
//! - Connectivity preflight, bounded retry and mid-session monitoring
//! - JSON session history
//!
//! # Example
//!
//! ```rust,no_run
//! use musig_cosign::discovery::MemoryDirectory;
//! use musig_cosign::network::MemoryNetwork;
//! use musig_cosign::session::TranscriptBackend;
//! use musig_cosign::{CoordinatorConfig, KeyPair, SigningNode};
//! use std::sync::Arc;
//!
//! # async fn run() -> musig_cosign::Result<()> {
//! let network = MemoryNetwork::new();
//! let (transport, inbound) = network.register("alice").await;
//!
//! let node = SigningNode::new(
//!     CoordinatorConfig::default(),
//!     Arc::new(KeyPair::generate()),
//!     transport,
//!     inbound,
//!     MemoryDirectory::new(),
//!     Arc::new(TranscriptBackend::new()),
//! );
//! node.start().await?;
//!
//! let bob = KeyPair::generate().public_key_hex();
//! let session_id = node
//!     .coordinator()
//!     .create_signing_session(vec![bob], node.identity(), "deadbeef", Default::default())
//!     .await?;
//! println!("Created session {}", session_id);
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod config;
pub mod crypto;
pub mod discovery;
pub mod error;
pub mod events;
pub mod network;
pub mod node;
pub mod session;
pub mod storage;

// Re-export commonly used types
pub use config::CoordinatorConfig;
pub use crypto::KeyPair;
pub use discovery::{DiscoveryCache, DiscoveryService, SignerAdvertisement, SignerCriteria};
pub use error::{CoordinatorError, Result};
pub use events::{DiscoveryEvent, SessionEvent, Subscription};
pub use network::{ConnectivityMonitor, PeerTransport, PreflightReport, RetryPolicy};
pub use node::SigningNode;
pub use session::{SessionCoordinator, SessionState, WalletSigningSession};
pub use storage::SessionStore;

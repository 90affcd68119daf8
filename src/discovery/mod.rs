//! Co-signer discovery
//!
//! Signers advertise themselves in a shared directory (a DHT in production).
//! The [`DiscoveryService`] publishes our own advertisement and keeps a
//! [`DiscoveryCache`] of everyone else's, which the session coordinator uses
//! to resolve participant addresses.
//!
//! # Example
//!
//! ```ignore
//! use musig_cosign::discovery::{SignerConfig, SignerCriteria, TxTypes};
//!
//! discovery.start().await;
//! discovery.advertise_signer(SignerConfig::new(TxTypes::SPEND)).await?;
//!
//! let signers = discovery
//!     .discover_signers(&SignerCriteria::for_transaction(TxTypes::SPEND).with_amount(50_000))
//!     .await?;
//! ```

pub mod advertisement;
pub mod cache;
pub mod directory;
pub mod service;

pub use advertisement::{
    AmountRange, SignerAdvertisement, SignerConfig, SignerCriteria, TxTypes, MAX_MULTIADDRS,
    MAX_NICKNAME_LENGTH,
};
pub use cache::{DiscoveryCache, UpsertOutcome};
pub use directory::{DirectoryRecord, MemoryDirectory, SignerDirectory};
pub use service::{DiscoveryService, LocalPeer, SubscriptionId};

//! CLI commands for cosign
//!
//! Implements the command handlers for the CLI interface.

use crate::config::CoordinatorConfig;
use crate::crypto::KeyPair;
use crate::discovery::{MemoryDirectory, SignerConfig, SignerCriteria, TxTypes};
use crate::error::CoordinatorError;
use crate::events::SessionEvent;
use crate::network::{MemoryNetwork, PollSchedule};
use crate::node::SigningNode;
use crate::session::{SessionAnnouncement, SessionState, TranscriptBackend};
use crate::storage::SessionStore;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Result type for CLI operations
pub type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// How long each simulated round may take
const ROUND_TIMEOUT: Duration = Duration::from_secs(10);

/// Generate a new session key pair
pub fn cmd_keygen() -> CliResult<()> {
    let key = KeyPair::generate();

    println!("🔐 New session key pair");
    println!("   🔑 Public key:  {}", key.public_key_hex());
    println!("   🗝️  Private key: {}", key.private_key_hex());
    println!("\n   ⚠️  Keep the private key secret; it signs every protocol message.");

    Ok(())
}

/// Write a default configuration file
pub fn cmd_config_init(path: &Path, force: bool) -> CliResult<()> {
    if path.exists() && !force {
        println!("⚠️  Config already exists at {:?}", path);
        println!("   Use --force to overwrite it");
        return Ok(());
    }

    CoordinatorConfig::default().save(path)?;
    println!("✅ Config written to {:?}", path);
    Ok(())
}

/// Print the effective configuration
pub fn cmd_config_show(path: &Path) -> CliResult<()> {
    let config = CoordinatorConfig::load_or_default(path)?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

/// List stored session history
pub fn cmd_history(data_dir: &Path) -> CliResult<()> {
    let store = SessionStore::new(data_dir)?;
    let sessions = store.load_all()?;

    if sessions.is_empty() {
        println!("📭 No signing sessions recorded in {:?}", data_dir);
        return Ok(());
    }

    println!("📋 Signing sessions:");
    for session in &sessions {
        let reason = session.reason.as_deref().unwrap_or("-");
        println!(
            "   {} {} ({} signers, {}) - {}",
            session.created_at.format("%Y-%m-%d %H:%M:%S"),
            session.id,
            session.participants.len(),
            session.state,
            reason
        );
    }

    Ok(())
}

/// Outcome of an in-process signing run
#[derive(Debug, Clone)]
pub struct SimulationReport {
    pub session_id: String,
    pub signers: usize,
    pub state: SessionState,
    pub signature: Option<String>,
    pub unreachable: Vec<String>,
    pub reason: Option<String>,
}

impl SimulationReport {
    pub fn completed(&self) -> bool {
        self.state == SessionState::Completed
    }
}

/// Run an n-of-n signing session between `signers` in-process nodes.
///
/// Signer 0 initiates. `offline` takes one co-signer off the network after
/// it has advertised, so the preflight finds it unreachable.
pub async fn run_simulation(
    config: &CoordinatorConfig,
    signers: usize,
    offline: Option<usize>,
    store: Option<SessionStore>,
) -> CliResult<SimulationReport> {
    if signers < 2 {
        return Err(CoordinatorError::InsufficientParticipants {
            needed: 2,
            available: signers,
        }
        .into());
    }
    if let Some(index) = offline {
        if index == 0 || index >= signers {
            return Err(format!("--offline must be between 1 and {}", signers - 1).into());
        }
    }

    let network = MemoryNetwork::new();
    let directory = MemoryDirectory::new();

    let mut nodes = Vec::with_capacity(signers);
    for index in 0..signers {
        let name = format!("signer-{}", index);
        let (transport, inbound) = network.register(&name).await;
        let mut node = SigningNode::new(
            config.clone(),
            Arc::new(KeyPair::generate()),
            transport,
            inbound,
            directory.clone(),
            Arc::new(TranscriptBackend::new()),
        );
        if index == 0 {
            if let Some(store) = store.clone() {
                node = node.with_session_store(store);
            }
        }
        node.start().await?;
        node.discovery()
            .advertise_signer(SignerConfig::new(TxTypes::SPEND).with_nickname(&name))
            .await?;
        nodes.push(node);
    }

    if let Some(index) = offline {
        log::info!("Taking signer-{} offline", index);
        network.set_reachable(&format!("signer-{}", index), false).await;
    }

    let result = sign_with(&nodes).await;
    for node in &nodes {
        node.stop().await?;
    }
    result
}

async fn sign_with(nodes: &[SigningNode]) -> CliResult<SimulationReport> {
    let initiator = &nodes[0];
    let joiners = &nodes[1..];
    let coordinator = initiator.coordinator();

    let found = initiator
        .discovery()
        .discover_signers(&SignerCriteria::for_transaction(TxTypes::SPEND))
        .await?;
    log::info!("Discovered {} co-signers", found.len());

    let mut invitations: Vec<_> = joiners.iter().map(|n| n.coordinator().events()).collect();

    let keys = found.iter().map(|ad| ad.public_key_hex.clone()).collect();
    let mut metadata = BTreeMap::new();
    metadata.insert("purpose".to_string(), "simulation".to_string());
    let session_id = coordinator
        .create_signing_session(
            keys,
            initiator.identity(),
            &hex::encode(b"cosign simulation"),
            metadata,
        )
        .await?;

    let preflight = initiator.connectivity().preflight_session(&session_id).await?;
    if !preflight.all_reachable {
        let unreachable: Vec<String> = preflight
            .unreachable
            .iter()
            .map(|p| {
                p.nickname
                    .clone()
                    .or_else(|| p.peer_id.clone())
                    .unwrap_or_else(|| p.public_key_hex.clone())
            })
            .collect();
        let reason = format!("unreachable co-signers: {}", unreachable.join(", "));
        coordinator.abort_session(&session_id, &reason).await?;
        return report(initiator, &session_id, nodes.len(), unreachable).await;
    }

    coordinator.announce_session(&session_id).await?;
    for (node, events) in joiners.iter().zip(invitations.iter_mut()) {
        let announcement = await_invitation(events, &session_id).await?;
        node.coordinator()
            .join_session(announcement, node.identity())
            .await?;
    }

    if !coordinator
        .wait_for_participants(&session_id, &PollSchedule::confirmation())
        .await?
    {
        coordinator
            .abort_session(&session_id, "co-signers did not join in time")
            .await?;
        return report(initiator, &session_id, nodes.len(), Vec::new()).await;
    }

    for node in nodes {
        node.coordinator()
            .wait_until(&session_id, ROUND_TIMEOUT, |s| s.all_joined())
            .await?;
        node.coordinator().share_nonces(&session_id).await?;
    }
    for node in nodes {
        node.coordinator()
            .wait_until(&session_id, ROUND_TIMEOUT, |s| s.state.nonces_complete())
            .await?;
        node.coordinator().share_partial_signature(&session_id).await?;
    }

    let mut signature = None;
    for node in nodes {
        node.coordinator()
            .wait_until(&session_id, ROUND_TIMEOUT, |s| s.can_finalize())
            .await?;
        let final_signature = node.coordinator().finalize_session(&session_id).await?;
        match &signature {
            Some(expected) if expected != &final_signature => {
                return Err(format!("{} produced a different signature", node.peer_id()).into());
            }
            _ => signature = Some(final_signature),
        }
    }

    report(initiator, &session_id, nodes.len(), Vec::new()).await
}

async fn await_invitation(
    events: &mut crate::events::Subscription<SessionEvent>,
    session_id: &str,
) -> CliResult<SessionAnnouncement> {
    let wait = async {
        while let Some(event) = events.recv().await {
            if let SessionEvent::Announced(announcement) = event {
                if announcement.session_id == session_id {
                    return Some(announcement);
                }
            }
        }
        None
    };

    match tokio::time::timeout(ROUND_TIMEOUT, wait).await {
        Ok(Some(announcement)) => Ok(announcement),
        _ => Err(format!("no invitation for session {}", session_id).into()),
    }
}

async fn report(
    initiator: &SigningNode,
    session_id: &str,
    signers: usize,
    unreachable: Vec<String>,
) -> CliResult<SimulationReport> {
    let session = initiator.coordinator().get_session(session_id).await?;
    Ok(SimulationReport {
        session_id: session.id,
        signers,
        state: session.state,
        signature: session.final_signature,
        unreachable,
        reason: session.reason,
    })
}

/// Run the simulation and print the outcome
pub async fn cmd_simulate(
    config: &CoordinatorConfig,
    signers: usize,
    offline: Option<usize>,
    record: bool,
) -> CliResult<()> {
    println!("🧪 Simulating a {}-of-{} signing session", signers, signers);
    if let Some(index) = offline {
        println!("   📴 signer-{} will be offline", index);
    }

    let store = if record {
        Some(SessionStore::new(&config.data_dir)?)
    } else {
        None
    };
    let report = run_simulation(config, signers, offline, store).await?;

    println!("\n   Session {}", report.session_id);
    println!("   ├─ Signers: {}", report.signers);
    println!("   ├─ State: {}", report.state);
    if !report.unreachable.is_empty() {
        println!("   ├─ Unreachable: {}", report.unreachable.join(", "));
    }
    if let Some(reason) = &report.reason {
        println!("   ├─ Reason: {}", reason);
    }
    match &report.signature {
        Some(signature) => println!("   └─ Signature: {}", signature),
        None => println!("   └─ Signature: -"),
    }

    if report.completed() {
        println!("\n✅ All co-signers produced the same signature");
    } else {
        println!("\n❌ Session did not complete");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_simulation_completes() {
        let report = run_simulation(&CoordinatorConfig::default(), 3, None, None)
            .await
            .unwrap();
        assert!(report.completed());
        assert!(report.signature.is_some());
        assert!(report.unreachable.is_empty());
    }

    #[tokio::test]
    async fn test_simulation_with_offline_signer_aborts() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path()).unwrap();
        let report = run_simulation(&CoordinatorConfig::default(), 3, Some(2), Some(store.clone()))
            .await
            .unwrap();

        assert_eq!(report.state, SessionState::Aborted);
        assert_eq!(report.unreachable, vec!["signer-2".to_string()]);
        assert!(report.reason.unwrap().contains("signer-2"));

        let history = store.load_all().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].state, SessionState::Aborted);
    }

    #[tokio::test]
    async fn test_simulation_rejects_bad_arguments() {
        let config = CoordinatorConfig::default();
        assert!(run_simulation(&config, 1, None, None).await.is_err());
        assert!(run_simulation(&config, 3, Some(0), None).await.is_err());
        assert!(run_simulation(&config, 3, Some(3), None).await.is_err());
    }

    #[test]
    fn test_config_init_and_show() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cosign.json");
        cmd_config_init(&path, false).unwrap();
        assert!(path.exists());
        cmd_config_show(&path).unwrap();
        assert_eq!(
            CoordinatorConfig::load(&path).unwrap(),
            CoordinatorConfig::default()
        );
    }
}

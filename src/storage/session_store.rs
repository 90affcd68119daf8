//! Session history persistence
//!
//! Keeps snapshots of signing sessions on disk so finished and failed
//! sessions can still be shown after a restart.

use crate::crypto::random_id;
use crate::error::Result;
use crate::session::WalletSigningSession;
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

const SESSIONS_FILE: &str = "sessions.json";

/// JSON file of session snapshots keyed by session id
#[derive(Debug, Clone)]
pub struct SessionStore {
    data_dir: PathBuf,
}

impl SessionStore {
    /// Create a store rooted at `data_dir`, creating the directory
    pub fn new(data_dir: &Path) -> Result<Self> {
        fs::create_dir_all(data_dir)?;
        Ok(Self {
            data_dir: data_dir.to_path_buf(),
        })
    }

    pub fn path(&self) -> PathBuf {
        self.data_dir.join(SESSIONS_FILE)
    }

    pub fn exists(&self) -> bool {
        self.path().exists()
    }

    fn read(&self) -> Result<BTreeMap<String, WalletSigningSession>> {
        let path = self.path();
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        let file = fs::File::open(&path)?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }

    fn write(&self, sessions: &BTreeMap<String, WalletSigningSession>) -> Result<()> {
        // Write to temporary file first
        let temp_path = self.data_dir.join(format!("sessions.{}.tmp", random_id()));
        let file = fs::File::create(&temp_path)?;
        serde_json::to_writer_pretty(BufWriter::new(file), sessions)?;

        // Atomic rename
        fs::rename(&temp_path, self.path())?;
        Ok(())
    }

    /// Merge snapshots into the history; newer snapshots replace older ones
    pub fn save_all(&self, sessions: &[WalletSigningSession]) -> Result<usize> {
        let mut history = self.read()?;
        for session in sessions {
            let newer = history
                .get(&session.id)
                .map(|stored| stored.updated_at <= session.updated_at)
                .unwrap_or(true);
            if newer {
                history.insert(session.id.clone(), session.clone());
            }
        }
        self.write(&history)?;
        log::debug!("Saved {} sessions to {:?}", history.len(), self.path());
        Ok(history.len())
    }

    pub fn save(&self, session: &WalletSigningSession) -> Result<()> {
        self.save_all(std::slice::from_ref(session)).map(|_| ())
    }

    /// All stored sessions, oldest first
    pub fn load_all(&self) -> Result<Vec<WalletSigningSession>> {
        let mut sessions: Vec<WalletSigningSession> = self.read()?.into_values().collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(sessions)
    }

    pub fn get(&self, session_id: &str) -> Result<Option<WalletSigningSession>> {
        Ok(self.read()?.remove(session_id))
    }

    /// Delete the stored history
    pub fn clear(&self) -> Result<()> {
        let path = self.path();
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}

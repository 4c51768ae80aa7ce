//! Node identity
//!
//! An ed25519 keypair kept in a protobuf-encoded key file. The peer id
//! derived from it is the node's identity in every registry and allow-list.

use libp2p::identity::{KeyType, Keypair, PeerId};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::{FedError, Result};

#[derive(Clone)]
pub struct PeerIdentity {
    keypair: Keypair,
    peer_id: PeerId,
}

impl PeerIdentity {
    pub fn generate() -> Self {
        Self::from_keypair(Keypair::generate_ed25519())
    }

    fn from_keypair(keypair: Keypair) -> Self {
        let peer_id = keypair.public().to_peer_id();
        Self { keypair, peer_id }
    }

    /// Reuse the key at `path`, creating it on first start
    pub fn load_or_generate(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            return Self::load(path);
        }
        let identity = Self::generate();
        identity.save(path)?;
        info!("New identity {} written to {}", identity.peer_id, path.display());
        Ok(identity)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let encoded = fs::read(path)?;
        let keypair = Keypair::from_protobuf_encoding(&encoded)
            .map_err(|e| FedError::ConfigError(format!("{}: {}", path.display(), e)))?;
        if keypair.key_type() != KeyType::Ed25519 {
            return Err(FedError::ConfigError(format!(
                "{}: expected an ed25519 key, found {:?}",
                path.display(),
                keypair.key_type()
            )));
        }
        Ok(Self::from_keypair(keypair))
    }

    /// Write the key owner-readable only, replacing any previous file whole
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let encoded = self
            .keypair
            .to_protobuf_encoding()
            .map_err(|e| FedError::ConfigError(format!("encoding key: {}", e)))?;

        let staging = staging_path(path);
        fs::write(&staging, encoded)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&staging, fs::Permissions::from_mode(0o600))?;
        }
        fs::rename(&staging, path)?;
        Ok(())
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

// Never print key material
impl std::fmt::Debug for PeerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerIdentity({})", self.peer_id)
    }
}

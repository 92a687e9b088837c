//! Persisted bootstrap-peer store.
//!
//! One peer per line: `hex(address) hex(public_key) contact`, where
//! `contact` is the transport's opaque handle and may contain spaces.
//! Saves are atomic (write to a sibling temp file, then rename) so a
//! crash mid-write never corrupts the last good list. The store is
//! rewritten whenever the node acquires routing peers, so a restarted
//! node can rejoin from its most recent neighbourhood.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::identity::{Address, NodeInfo};

pub struct BootstrapStore {
    path: PathBuf,
}

impl BootstrapStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Read the persisted peer list. A missing file is an empty list;
    /// unparseable or forged lines are skipped with a warning.
    pub fn load(&self) -> Vec<NodeInfo> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(error) => {
                warn!(path = %self.path.display(), %error, "failed to read bootstrap store");
                return Vec::new();
            }
        };

        let mut peers = Vec::new();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match parse_line(line) {
                Some(info) if info.verify_binding() => peers.push(info),
                Some(info) => {
                    warn!(
                        peer = %&info.address.to_hex()[..16],
                        "skipping bootstrap entry with bad address/key binding"
                    );
                }
                None => {
                    warn!(path = %self.path.display(), "skipping malformed bootstrap line");
                }
            }
        }
        debug!(
            path = %self.path.display(),
            count = peers.len(),
            "loaded bootstrap peers"
        );
        peers
    }

    /// Atomically replace the persisted list.
    pub fn save(&self, peers: &[NodeInfo]) -> Result<()> {
        let mut contents = String::new();
        for peer in peers {
            contents.push_str(&peer.address.to_hex());
            contents.push(' ');
            contents.push_str(&hex::encode(peer.public_key));
            contents.push(' ');
            contents.push_str(&peer.contact);
            contents.push('\n');
        }

        let tmp = self.path.with_extension("tmp");
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("create bootstrap dir {}", parent.display()))?;
        }
        fs::write(&tmp, contents)
            .with_context(|| format!("write bootstrap temp file {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("replace bootstrap store {}", self.path.display()))?;
        debug!(
            path = %self.path.display(),
            count = peers.len(),
            "persisted bootstrap peers"
        );
        Ok(())
    }
}

fn parse_line(line: &str) -> Option<NodeInfo> {
    let mut parts = line.splitn(3, ' ');
    let address = Address::from_hex(parts.next()?).ok()?;
    let key_bytes = hex::decode(parts.next()?).ok()?;
    let public_key: [u8; 32] = key_bytes.try_into().ok()?;
    let contact = parts.next()?;
    if contact.is_empty() {
        return None;
    }
    Some(NodeInfo::new(address, public_key, contact))
}

//! Amiibo (NTAG) tag handling.
//!
//! A tag is 540 bytes of user data; dumps with the optional 32-byte
//! manufacturer signature (572 bytes) are accepted and the signature dropped.
//! Before the first write to a tag loaded read-only, the original file is
//! backed up beside itself as `<path>.bak<N>`.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{info, warn};

/// User-data size of an NTAG215 amiibo.
pub const TAG_SIZE: usize = 540;

/// Dump size including the manufacturer signature.
const SIGNED_TAG_SIZE: usize = 572;

#[derive(Debug, Error)]
pub enum NfcError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub struct NfcTag {
    data: Vec<u8>,
    mutable: bool,
    source: Option<PathBuf>,
}

impl NfcTag {
    pub fn new(data: Vec<u8>, mutable: bool, source: Option<PathBuf>) -> Self {
        let mut data = data;
        if data.len() != TAG_SIZE {
            warn!("[NFC] unexpected amiibo size {} (expected {TAG_SIZE})", data.len());
            data.resize(TAG_SIZE, 0x00);
        }
        Self { data, mutable, source }
    }

    /// Loads an amiibo dump. 572-byte dumps lose their trailing signature.
    pub fn load_amiibo(path: &Path) -> Result<Self, NfcError> {
        let mut data = std::fs::read(path)?;
        if data.len() == SIGNED_TAG_SIZE {
            data.truncate(TAG_SIZE);
        }
        Ok(Self::new(data, false, Some(path.to_path_buf())))
    }

    /// The 7-byte NTAG UID: bytes 0..3 and 4..8 of the tag, skipping byte 3.
    pub fn uid(&self) -> [u8; 7] {
        let mut uid = [0u8; 7];
        uid[..3].copy_from_slice(&self.data[0..3]);
        uid[3..].copy_from_slice(&self.data[4..8]);
        uid
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn is_mutable(&self) -> bool {
        self.mutable
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Allows writes; a read-only tag with a source file gets a numbered
    /// backup first.
    pub fn make_mutable(&mut self) -> Result<(), NfcError> {
        if self.mutable {
            return Ok(());
        }
        if let Some(source) = &self.source {
            let backup = probe_free_path(|n| {
                let mut os = source.clone().into_os_string();
                os.push(format!(".bak{n}"));
                PathBuf::from(os)
            });
            std::fs::write(&backup, &self.data)?;
            info!("[NFC] backed up amiibo to {}", backup.display());
        }
        self.mutable = true;
        Ok(())
    }

    /// Copies `data` into the tag at `offset`. Writes to a read-only tag are
    /// ignored with a warning; out-of-bounds portions are dropped.
    pub fn write(&mut self, offset: usize, data: &[u8]) {
        if !self.mutable {
            warn!("[NFC] ignored write to read-only amiibo");
            return;
        }
        if offset >= TAG_SIZE {
            warn!("[NFC] ignored amiibo write at out-of-bounds offset {offset}");
            return;
        }
        let len = data.len().min(TAG_SIZE - offset);
        if len < data.len() {
            warn!("[NFC] truncated amiibo write at offset {offset}");
        }
        self.data[offset..offset + len].copy_from_slice(&data[..len]);
    }

    /// Persists a mutable tag to its source file, inventing a `/tmp` path for
    /// tags that never had one.
    pub fn save(&mut self) -> Result<(), NfcError> {
        if !self.mutable {
            return Ok(());
        }
        let path = match &self.source {
            Some(path) => path.clone(),
            None => {
                let path = probe_free_path(|n| PathBuf::from(format!("/tmp/amiibo_{n}.bin")));
                info!("[NFC] saving unnamed amiibo as {}", path.display());
                self.source = Some(path.clone());
                path
            }
        };
        std::fs::write(path, &self.data)?;
        Ok(())
    }
}

/// Smallest-N candidate path that does not exist yet.
fn probe_free_path(candidate: impl Fn(u32) -> PathBuf) -> PathBuf {
    let mut n = 1;
    loop {
        let path = candidate(n);
        if !path.exists() {
            return path;
        }
        n += 1;
    }
}

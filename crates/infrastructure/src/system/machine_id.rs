use std::path::PathBuf;

use hmac::{Hmac, Mac};
use loopdns_application::ports::MachineIdSource;
use sha2::Sha256;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

/// Machine identity backed by `/etc/machine-id`. Derived ids are keyed HMACs
/// so the raw machine id never leaves this module.
pub struct EtcMachineId {
    path: PathBuf,
}

impl EtcMachineId {
    pub fn new() -> Self {
        Self {
            path: PathBuf::from("/etc/machine-id"),
        }
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn read_machine_id(&self) -> Option<[u8; 16]> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "Cannot read machine id");
                return None;
            }
        };
        parse_hex_128(text.trim())
    }
}

impl Default for EtcMachineId {
    fn default() -> Self {
        Self::new()
    }
}

impl MachineIdSource for EtcMachineId {
    fn app_specific_id(&self, salt: [u8; 16]) -> Option<[u8; 16]> {
        let machine_id = self.read_machine_id()?;

        let mut mac = HmacSha256::new_from_slice(&machine_id).ok()?;
        mac.update(&salt);
        let digest = mac.finalize().into_bytes();

        let mut out = [0u8; 16];
        out.copy_from_slice(&digest[..16]);
        Some(out)
    }
}

fn parse_hex_128(text: &str) -> Option<[u8; 16]> {
    if text.len() != 32 {
        return None;
    }
    let mut out = [0u8; 16];
    for (i, chunk) in text.as_bytes().chunks_exact(2).enumerate() {
        let hi = (chunk[0] as char).to_digit(16)?;
        let lo = (chunk[1] as char).to_digit(16)?;
        out[i] = ((hi << 4) | lo) as u8;
    }
    Some(out)
}

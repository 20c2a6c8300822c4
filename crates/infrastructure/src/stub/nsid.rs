//! RFC 5001 NSID identifier.
//!
//! The string names this host as a loopdns instance without leaking the
//! machine identity: a fixed suffix identifies the software, the prefix is a
//! machine-scoped id derived with an application salt so the machine id
//! itself cannot be recovered. Clients use it to tell whether an answer was
//! served locally or proxied.

use std::fmt::Write;

use loopdns_application::ports::MachineIdSource;
use tracing::debug;

const NSID_SUFFIX: &str = "loopdns.example";

/// Application salt for the machine-scoped id; never reused elsewhere.
const NSID_SALT: [u8; 16] = [
    0xed, 0xd3, 0x12, 0x5d, 0x16, 0xb9, 0x41, 0xf9, 0xa1, 0x49, 0x5f, 0xab, 0x15, 0x62, 0xab,
    0x27,
];

/// Computes the NSID string once at startup. `None` when the machine has no
/// usable identity; the reply path then simply omits the option.
pub fn nsid_string(source: &dyn MachineIdSource) -> Option<String> {
    let Some(id) = source.app_specific_id(NSID_SALT) else {
        debug!("Failed to determine machine ID, not announcing NSID");
        return None;
    };

    let mut out = String::with_capacity(32 + 1 + NSID_SUFFIX.len());
    for byte in id {
        let _ = write!(out, "{:02x}", byte);
    }
    out.push('.');
    out.push_str(NSID_SUFFIX);
    Some(out)
}

/// Source of a stable, per-machine, non-reversible identifier.
pub trait MachineIdSource: Send + Sync {
    /// Derives a 128-bit identifier from the machine identity and the given
    /// application salt. The machine identity must not be recoverable from
    /// the result. Returns `None` when no machine identity is available.
    fn app_specific_id(&self, salt: [u8; 16]) -> Option<[u8; 16]>;
}

//! KNX Data Secure: key tables and the secure application layer.
//!
//! The [`SecurityContext`] carries the decrypted key material (group keys
//! and per-device tool keys). The [`SecureApplicationLayer`] captures a
//! context by value at construction; reloading a keyring means building a
//! new layer.

pub mod app_layer;
pub(crate) mod crypto;

pub use app_layer::{
    DiagnosticsReply, FailureCounters, SecureApplicationLayer, SecureOutcome, SecureSender,
};
pub use crypto::Key;

use std::collections::HashMap;

use zeroize::Zeroize;

use crate::addressing::{GroupAddress, IndividualAddress};
use crate::error::Result;
use crate::keyring::Keyring;

/// Decrypted key tables for KNX Data Secure.
///
/// Keys are scrubbed from memory when the context is dropped.
#[derive(Default, Clone)]
pub struct SecurityContext {
    group_keys: HashMap<GroupAddress, Key>,
    tool_keys: HashMap<IndividualAddress, Key>,
}

impl std::fmt::Debug for SecurityContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityContext")
            .field("group_keys", &self.group_keys.len())
            .field("tool_keys", &self.tool_keys.len())
            .finish()
    }
}

impl SecurityContext {
    /// An empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a context from a verified keyring, decrypting all group and
    /// tool keys with the keyring password.
    ///
    /// # Errors
    ///
    /// Returns keyring errors for signature mismatch or undecryptable keys.
    pub fn from_keyring(keyring: &Keyring, password: &str) -> Result<Self> {
        keyring.verify(password)?;

        let mut ctx = Self::new();
        for (addr, encrypted) in keyring.group_keys() {
            let key = keyring.decrypt_key(encrypted, password)?;
            ctx.add_group_key(*addr, to_key(&key)?);
        }
        for (addr, device) in keyring.devices() {
            if let Some(encrypted) = &device.tool_key {
                let key = keyring.decrypt_key(encrypted, password)?;
                ctx.add_tool_key(*addr, to_key(&key)?);
            }
        }
        log::debug!(
            "security context: {} group keys, {} tool keys",
            ctx.group_keys.len(),
            ctx.tool_keys.len()
        );
        Ok(ctx)
    }

    /// Register the key of a secured group.
    pub fn add_group_key(&mut self, group: GroupAddress, key: Key) {
        self.group_keys.insert(group, key);
    }

    /// Register the tool key of a device.
    pub fn add_tool_key(&mut self, device: IndividualAddress, key: Key) {
        self.tool_keys.insert(device, key);
    }

    /// The key of a secured group, if known.
    pub fn group_key(&self, group: GroupAddress) -> Option<&Key> {
        self.group_keys.get(&group)
    }

    /// The tool key of a device, if known.
    pub fn tool_key(&self, device: IndividualAddress) -> Option<&Key> {
        self.tool_keys.get(&device)
    }

    /// Whether any key is registered for this group.
    pub fn has_group_key(&self, group: GroupAddress) -> bool {
        self.group_keys.contains_key(&group)
    }
}

impl Drop for SecurityContext {
    fn drop(&mut self) {
        for key in self.group_keys.values_mut() {
            key.zeroize();
        }
        for key in self.tool_keys.values_mut() {
            key.zeroize();
        }
    }
}

fn to_key(bytes: &[u8]) -> Result<Key> {
    bytes
        .try_into()
        .map_err(|_| crate::error::KnxError::keyring_decryption_failed())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_lookup() {
        let mut ctx = SecurityContext::new();
        let group = GroupAddress::new(1, 0, 1).unwrap();
        let device = IndividualAddress::new(1, 1, 1).unwrap();
        assert!(ctx.group_key(group).is_none());

        ctx.add_group_key(group, [1u8; 16]);
        ctx.add_tool_key(device, [2u8; 16]);
        assert_eq!(ctx.group_key(group), Some(&[1u8; 16]));
        assert_eq!(ctx.tool_key(device), Some(&[2u8; 16]));
        assert!(ctx.has_group_key(group));
        assert!(!ctx.has_group_key(GroupAddress::new(1, 0, 2).unwrap()));
    }
}

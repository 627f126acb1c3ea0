//! Device capability sets and their process-wide cache
//!
//! Probing a platform for what it can play is slow, so results are cached per
//! backend and format family. The cache lives until an explicit forced
//! refresh; every probe and lookup goes through one mutex because sinks may
//! be constructed while another thread enumerates devices.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use crate::device::Backend;
use crate::format::Encoding;

/// Groups of encodings a backend is probed for separately
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CapabilityFamily {
    /// Plain PCM output
    Pcm,
    /// Compressed streams written directly
    Raw,
    /// Compressed streams packed into IEC 61937
    Iec61937,
}

impl CapabilityFamily {
    pub const ALL: [CapabilityFamily; 3] = [
        CapabilityFamily::Pcm,
        CapabilityFamily::Raw,
        CapabilityFamily::Iec61937,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            CapabilityFamily::Pcm => "PCM",
            CapabilityFamily::Raw => "RAW",
            CapabilityFamily::Iec61937 => "IEC",
        }
    }
}

/// What a device can play for one family
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub family: CapabilityFamily,
    pub supported_encodings: Vec<Encoding>,
    pub supported_sample_rates: Vec<u32>,
    pub supported_channels: Vec<u16>,
    pub supports_float: bool,
}

impl DeviceInfo {
    /// Capability set that supports nothing
    pub fn unsupported(family: CapabilityFamily) -> Self {
        Self {
            family,
            supported_encodings: Vec::new(),
            supported_sample_rates: Vec::new(),
            supported_channels: Vec::new(),
            supports_float: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.supported_encodings.is_empty()
            || self.supported_sample_rates.is_empty()
            || self.supported_channels.is_empty()
    }

    pub fn supports(&self, encoding: Encoding) -> bool {
        self.supported_encodings.contains(&encoding)
    }
}

type CacheKey = (String, CapabilityFamily);

/// Shared cache of probed capability sets
#[derive(Default)]
pub struct CapabilityCache {
    entries: Mutex<HashMap<CacheKey, DeviceInfo>>,
}

impl CapabilityCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide instance, created on first use
    pub fn global() -> Arc<CapabilityCache> {
        static CACHE: OnceLock<Arc<CapabilityCache>> = OnceLock::new();
        CACHE.get_or_init(|| Arc::new(CapabilityCache::new())).clone()
    }

    /// Cached capabilities for `family`, probing the backend on a miss or
    /// when `force` is set. A failed probe is cached as unsupported.
    pub fn get(&self, backend: &dyn Backend, family: CapabilityFamily, force: bool) -> DeviceInfo {
        let key = (backend.name().to_string(), family);
        let mut entries = self.entries.lock();

        if !force {
            if let Some(info) = entries.get(&key) {
                return info.clone();
            }
        }

        let info = match backend.enumerate_capabilities(family) {
            Ok(mut info) => {
                info.family = family;
                info.supported_sample_rates.sort_unstable();
                info.supported_sample_rates.dedup();
                info.supported_channels.sort_unstable();
                info.supported_channels.dedup();
                info
            }
            Err(e) => {
                tracing::warn!(
                    "Capability probe for {} ({}) failed: {}",
                    backend.name(),
                    family.label(),
                    e
                );
                DeviceInfo::unsupported(family)
            }
        };

        tracing::debug!(
            "Probed {} ({}): {} encodings, rates {:?}",
            backend.name(),
            family.label(),
            info.supported_encodings.len(),
            info.supported_sample_rates
        );

        entries.insert(key, info.clone());
        info
    }

    /// Drop everything cached for `backend`
    pub fn invalidate(&self, backend_name: &str) {
        self.entries.lock().retain(|(name, _), _| name != backend_name);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

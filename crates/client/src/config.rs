//! Client configuration and zone address resolution.

use std::collections::HashMap;
use std::time::Duration;
use zonegraph_core::{ZoneError, ZoneId, ZoneResult};

/// Default per-call timeout. A stalled zone otherwise blocks its caller forever.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl ClientConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Translates a zone to the `host:port` it is served on.
pub trait ZoneResolver: Send + Sync {
    fn resolve(&self, zone: &ZoneId) -> ZoneResult<String>;
}

/// Fixed zone → address table.
///
/// ```ignore
/// let resolver = StaticResolver::parse(["eu=10.0.0.1:8080", "us=10.0.0.2:8080"])?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    addresses: HashMap<ZoneId, String>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_zone(mut self, zone: ZoneId, address: impl Into<String>) -> Self {
        self.addresses.insert(zone, address.into());
        self
    }

    /// Parses `zone=host:port` pairs.
    pub fn parse<I, S>(pairs: I) -> ZoneResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut resolver = Self::new();
        for pair in pairs {
            let pair = pair.as_ref().trim();
            match pair.split_once('=') {
                Some((zone, addr)) if !zone.is_empty() && !addr.is_empty() => {
                    resolver
                        .addresses
                        .insert(ZoneId::new(zone.trim()), addr.trim().to_string());
                }
                _ => {
                    return Err(ZoneError::InvalidInput(format!(
                        "zone mapping must be zone=host:port, got {pair:?}"
                    )))
                }
            }
        }
        Ok(resolver)
    }

    pub fn zones(&self) -> impl Iterator<Item = &ZoneId> {
        self.addresses.keys()
    }
}

impl ZoneResolver for StaticResolver {
    fn resolve(&self, zone: &ZoneId) -> ZoneResult<String> {
        self.addresses
            .get(zone)
            .cloned()
            .ok_or_else(|| ZoneError::UnknownZone(zone.clone()))
    }
}

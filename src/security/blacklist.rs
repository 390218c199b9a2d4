//! IP address blacklist for admission control.
//!
//! Checked on every accepted socket before a connection or session exists.
//! Matching is by IP address only; the peer's port is ignored.

use std::collections::HashSet;
use std::net::IpAddr;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid blacklist entry {0:?}, expected an IP address")]
pub struct BlacklistError(pub String);

/// A set of refused peer addresses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Blacklist {
    addrs: HashSet<IpAddr>,
}

impl Blacklist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse configuration entries such as `"10.0.0.66"` or `"::1"`.
    pub fn from_entries<I, S>(entries: I) -> Result<Self, BlacklistError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut blacklist = Self::new();
        for entry in entries {
            let entry = entry.as_ref().trim();
            let ip: IpAddr = entry.parse().map_err(|_| BlacklistError(entry.to_string()))?;
            blacklist.insert(ip);
        }
        Ok(blacklist)
    }

    /// Returns `false` if the address was already present.
    pub fn insert(&mut self, ip: IpAddr) -> bool {
        self.addrs.insert(ip.to_canonical())
    }

    pub fn remove(&mut self, ip: IpAddr) -> bool {
        self.addrs.remove(&ip.to_canonical())
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        !self.addrs.is_empty() && self.addrs.contains(&ip.to_canonical())
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }
}

impl FromIterator<IpAddr> for Blacklist {
    fn from_iter<T: IntoIterator<Item = IpAddr>>(iter: T) -> Self {
        let mut blacklist = Self::new();
        for ip in iter {
            blacklist.insert(ip);
        }
        blacklist
    }
}

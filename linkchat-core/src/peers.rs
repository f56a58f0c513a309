//! Peer registry: every hardware address seen on the segment, in discovery order.

use std::collections::HashMap;
use std::fmt;
use std::time::SystemTime;

use crate::address::MacAddr;

/// Stable handle for a peer. Unlike list positions it never shifts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(u32);

impl PeerId {
    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Known peer. Address is immutable identity; alias is for display.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub id: PeerId,
    pub address: MacAddr,
    pub alias: String,
    pub discovered_at: SystemTime,
}

/// Outcome of `observe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observed {
    New(PeerId),
    Known(PeerId),
}

impl Observed {
    pub fn is_new(self) -> bool {
        matches!(self, Observed::New(_))
    }

    pub fn id(self) -> PeerId {
        match self {
            Observed::New(id) | Observed::Known(id) => id,
        }
    }
}

/// One row of `list()`. `position` is only valid for the snapshot it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEntry {
    pub position: usize,
    pub id: PeerId,
    pub address: MacAddr,
    pub alias: String,
}

/// Peers in insertion order. Records are never removed.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    records: Vec<PeerRecord>,
    by_address: HashMap<MacAddr, usize>,
    preset_aliases: HashMap<MacAddr, String>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry that names peers from `aliases` as they are first observed.
    pub fn with_aliases(aliases: HashMap<MacAddr, String>) -> Self {
        Self {
            preset_aliases: aliases,
            ..Self::default()
        }
    }

    /// Record that a frame from `address` was seen. The broadcast address is refused.
    pub fn observe(&mut self, address: MacAddr) -> Result<Observed, PeerError> {
        if address.is_broadcast() {
            return Err(PeerError::ReservedAddress);
        }
        if let Some(&idx) = self.by_address.get(&address) {
            return Ok(Observed::Known(self.records[idx].id));
        }
        let id = PeerId(self.records.len() as u32);
        let alias = self
            .preset_aliases
            .get(&address)
            .cloned()
            .unwrap_or_else(|| address.to_string());
        self.by_address.insert(address, self.records.len());
        self.records.push(PeerRecord {
            id,
            address,
            alias,
            discovered_at: SystemTime::now(),
        });
        Ok(Observed::New(id))
    }

    pub fn list(&self) -> Vec<PeerEntry> {
        self.records
            .iter()
            .enumerate()
            .map(|(position, r)| PeerEntry {
                position,
                id: r.id,
                address: r.address,
                alias: r.alias.clone(),
            })
            .collect()
    }

    /// Address at list position `position`.
    pub fn resolve(&self, position: usize) -> Result<MacAddr, PeerError> {
        self.records
            .get(position)
            .map(|r| r.address)
            .ok_or(PeerError::NotFound(position))
    }

    pub fn get(&self, address: &MacAddr) -> Option<&PeerRecord> {
        self.by_address.get(address).map(|&idx| &self.records[idx])
    }

    /// Display name for `address`, falling back to its text form for unknown peers.
    pub fn alias_of(&self, address: &MacAddr) -> String {
        self.get(address)
            .map(|r| r.alias.clone())
            .unwrap_or_else(|| address.to_string())
    }

    pub fn set_alias(&mut self, address: &MacAddr, alias: impl Into<String>) -> Result<(), PeerError> {
        let idx = *self
            .by_address
            .get(address)
            .ok_or(PeerError::UnknownAddress(*address))?;
        self.records[idx].alias = alias.into();
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PeerError {
    #[error("no peer at position {0}")]
    NotFound(usize),
    #[error("unknown peer {0}")]
    UnknownAddress(MacAddr),
    #[error("the broadcast address cannot be a peer")]
    ReservedAddress,
}

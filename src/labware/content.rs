//! Liquid content maps.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ContentError;
use crate::validation::is_positive_volume;

/// Slack allowed on capacity and availability checks, µl.
pub const VOLUME_TOLERANCE: f64 = 0.01;

/// Entries at or below this volume are dropped after a removal.
const NEGLIGIBLE_VOLUME: f64 = 1e-6;

/// Content type → volume (µl), bounded by a fixed capacity.
///
/// Removal is proportional across content types, so a 50/50 mix stays 50/50 in both the
/// source and whatever receives the removed portion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentMap {
    capacity: f64,
    #[serde(default)]
    volumes: BTreeMap<String, f64>,
}

impl ContentMap {
    /// An empty map with the given capacity.
    pub fn new(capacity: f64) -> Self {
        Self {
            capacity,
            volumes: BTreeMap::new(),
        }
    }

    /// Builder form of [`ContentMap::add`].
    pub fn with(mut self, content_type: &str, volume: f64) -> Result<Self, ContentError> {
        self.add(content_type, volume)?;
        Ok(self)
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn total(&self) -> f64 {
        self.volumes.values().sum()
    }

    /// Remaining room before the capacity is reached.
    pub fn free(&self) -> f64 {
        (self.capacity - self.total()).max(0.0)
    }

    pub fn is_empty(&self) -> bool {
        self.total() <= NEGLIGIBLE_VOLUME
    }

    pub fn volume_of(&self, content_type: &str) -> f64 {
        self.volumes.get(content_type).copied().unwrap_or(0.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.volumes.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Whether `volume` more fits, within tolerance.
    pub fn can_accept(&self, volume: f64) -> bool {
        self.total() + volume <= self.capacity + VOLUME_TOLERANCE
    }

    /// Whether `volume` can be drawn, within tolerance.
    pub fn can_supply(&self, volume: f64) -> bool {
        volume <= self.total() + VOLUME_TOLERANCE
    }

    pub fn add(&mut self, content_type: &str, volume: f64) -> Result<(), ContentError> {
        if content_type.trim().is_empty() {
            return Err(ContentError::EmptyContentType);
        }
        is_positive_volume(volume).map_err(|_| ContentError::NonPositiveVolume(volume))?;
        if !self.can_accept(volume) {
            return Err(ContentError::Overflow {
                capacity: self.capacity,
                current: self.total(),
                requested: volume,
            });
        }
        *self.volumes.entry(content_type.to_string()).or_insert(0.0) += volume;
        Ok(())
    }

    /// Add every entry of `portion`, all or nothing.
    pub fn add_all(&mut self, portion: &BTreeMap<String, f64>) -> Result<(), ContentError> {
        let incoming: f64 = portion.values().sum();
        if !self.can_accept(incoming) {
            return Err(ContentError::Overflow {
                capacity: self.capacity,
                current: self.total(),
                requested: incoming,
            });
        }
        for (content_type, volume) in portion {
            if *volume > NEGLIGIBLE_VOLUME {
                *self.volumes.entry(content_type.clone()).or_insert(0.0) += volume;
            }
        }
        Ok(())
    }

    /// Remove `volume` proportionally across content types and return what was removed.
    pub fn remove(&mut self, volume: f64) -> Result<BTreeMap<String, f64>, ContentError> {
        is_positive_volume(volume).map_err(|_| ContentError::NonPositiveVolume(volume))?;
        let total = self.total();
        if !self.can_supply(volume) {
            return Err(ContentError::Underflow {
                available: total,
                requested: volume,
            });
        }
        let volume = volume.min(total);
        let mut removed = BTreeMap::new();
        if total <= NEGLIGIBLE_VOLUME {
            return Ok(removed);
        }

        for (content_type, present) in self.volumes.iter_mut() {
            let share = volume * (*present / total);
            *present -= share;
            removed.insert(content_type.clone(), share);
        }
        self.volumes.retain(|_, v| *v > NEGLIGIBLE_VOLUME);
        Ok(removed)
    }

    /// Drop all content.
    pub fn clear(&mut self) {
        self.volumes.clear();
    }
}

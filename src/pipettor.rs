//! Pipettor runtime state.
//!
//! One [`PipettorState`] exists per open connection. The validator and planner read
//! clones of it; only the sequencer mutates the live value, and only after a step has
//! completed on the device.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::PipettorConfig;
use crate::error::ContentError;
use crate::labware::ContentMap;

/// Float slack allowed on the tip's piston volume. Trips and batches are sized against
/// the exact tip capacity; this only absorbs rounding in summed trip volumes.
pub const TIP_VOLUME_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipettorState {
    has_tip: bool,
    /// Liquid held per channel, µl.
    held_volume: f64,
    channel_count: usize,
    tip_capacity: f64,
    tip_length: f64,
    z_max: f64,
    surface_detection: bool,
    surface_distance: f64,
    tips: Vec<ContentMap>,
}

impl PipettorState {
    /// A tipless, empty pipettor.
    pub fn new(channel_count: usize, tip_capacity: f64, tip_length: f64) -> Self {
        let channel_count = channel_count.max(1);
        Self {
            has_tip: false,
            held_volume: 0.0,
            channel_count,
            tip_capacity,
            tip_length,
            z_max: crate::config::Z_MAX,
            surface_detection: false,
            surface_distance: 0.0,
            tips: vec![ContentMap::new(tip_capacity); channel_count],
        }
    }

    pub fn from_config(config: &PipettorConfig) -> Self {
        let mut state = Self::new(
            config.channel_count(),
            config.tip_capacity(),
            config.tip_length(),
        );
        state.z_max = config.pipettor.z_max;
        state.surface_detection =
            config.pipettor.surface_detection && !config.pipettor.multichannel;
        state.surface_distance = config.pipettor.surface_distance;
        state
    }

    pub fn with_z_max(mut self, z_max: f64) -> Self {
        self.z_max = z_max;
        self
    }

    pub fn has_tip(&self) -> bool {
        self.has_tip
    }

    pub fn held_volume(&self) -> f64 {
        self.held_volume
    }

    pub fn channel_count(&self) -> usize {
        self.channel_count
    }

    pub fn is_multichannel(&self) -> bool {
        self.channel_count > 1
    }

    pub fn tip_capacity(&self) -> f64 {
        self.tip_capacity
    }

    /// Length the attached tip adds below the head, mm.
    pub fn tip_length(&self) -> f64 {
        self.tip_length
    }

    pub fn z_max(&self) -> f64 {
        self.z_max
    }

    pub fn surface_detection(&self) -> bool {
        self.surface_detection
    }

    pub fn surface_distance(&self) -> f64 {
        self.surface_distance
    }

    /// Content held by one channel's tip.
    pub fn tip_content(&self, channel: usize) -> Option<&ContentMap> {
        self.tips.get(channel)
    }

    /// Room left in the tip, µl per channel.
    pub fn free_volume(&self) -> f64 {
        (self.tip_capacity - self.held_volume).max(0.0)
    }

    pub(crate) fn attach_tips(&mut self) {
        self.has_tip = true;
        self.held_volume = 0.0;
        self.clear_tips();
    }

    /// Detach the tips and return whatever they still held.
    pub(crate) fn detach_tips(&mut self) -> f64 {
        let leftover = self.held_volume;
        self.has_tip = false;
        self.held_volume = 0.0;
        self.clear_tips();
        leftover
    }

    pub(crate) fn piston_in(&mut self, volume: f64) -> Result<(), ContentError> {
        if self.held_volume + volume > self.tip_capacity + TIP_VOLUME_TOLERANCE {
            return Err(ContentError::Overflow {
                capacity: self.tip_capacity,
                current: self.held_volume,
                requested: volume,
            });
        }
        self.held_volume = (self.held_volume + volume).min(self.tip_capacity);
        Ok(())
    }

    pub(crate) fn piston_out(&mut self, volume: f64) -> Result<(), ContentError> {
        if volume > self.held_volume + TIP_VOLUME_TOLERANCE {
            return Err(ContentError::Underflow {
                available: self.held_volume,
                requested: volume,
            });
        }
        self.held_volume = (self.held_volume - volume).max(0.0);
        Ok(())
    }

    /// Record content drawn into one channel.
    pub(crate) fn load_channel(
        &mut self,
        channel: usize,
        portion: &BTreeMap<String, f64>,
    ) -> Result<(), ContentError> {
        match self.tips.get_mut(channel) {
            Some(tip) => tip.add_all(portion),
            None => Ok(()),
        }
    }

    /// Take content out of one channel. An untracked tip gives an empty portion.
    pub(crate) fn unload_channel(
        &mut self,
        channel: usize,
        volume: f64,
    ) -> Result<BTreeMap<String, f64>, ContentError> {
        match self.tips.get_mut(channel) {
            Some(tip) if !tip.is_empty() => tip.remove(volume.min(tip.total())),
            _ => Ok(BTreeMap::new()),
        }
    }

    fn clear_tips(&mut self) {
        for tip in &mut self.tips {
            tip.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_geometry_from_config() {
        let mut config = PipettorConfig::default();
        config.pipettor.multichannel = true;
        config.pipettor.surface_detection = true;
        let state = PipettorState::from_config(&config);
        assert_eq!(state.channel_count(), 8);
        assert_eq!(state.tip_capacity(), 1000.0);
        assert_eq!(state.tip_length(), 90.0);
        assert!(!state.surface_detection());
        assert!(!state.has_tip());
    }

    #[test]
    fn piston_overflow_is_reported_not_clamped() {
        let mut state = PipettorState::new(1, 200.0, 38.0);
        state.attach_tips();
        state.piston_in(150.0).unwrap();
        let err = state.piston_in(50.005).unwrap_err();
        assert!(matches!(err, ContentError::Overflow { current, .. } if current == 150.0));
        assert_eq!(state.held_volume(), 150.0);

        state.piston_in(50.0).unwrap();
        assert_eq!(state.held_volume(), 200.0);
        assert!(state.piston_out(250.0).is_err());
        state.piston_out(200.0).unwrap();
        assert_eq!(state.held_volume(), 0.0);
    }

    #[test]
    fn detaching_reports_leftover_and_clears_content() {
        let mut state = PipettorState::new(2, 1000.0, 90.0);
        state.attach_tips();
        state.piston_in(20.0).unwrap();
        state
            .load_channel(1, &BTreeMap::from([("medium".to_string(), 20.0)]))
            .unwrap();
        assert_eq!(state.detach_tips(), 20.0);
        assert!(state.tip_content(1).unwrap().is_empty());
    }
}

//! Plan types: the ordered primitive steps a planner emits and a sequencer runs.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::labware::ItemAddress;

/// One primitive actuator command. Piston volumes are per channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    MoveXy { x: f64, y: f64 },
    MoveZ { z: f64 },
    MoveToSurface { limit: f64, distance: f64 },
    PickTip { z_limit: f64 },
    EjectTip,
    Aspirate { volume: f64 },
    Dispense { volume: f64 },
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::MoveXy { x, y } => write!(f, "move_xy({x:.2}, {y:.2})"),
            Action::MoveZ { z } => write!(f, "move_z({z:.2})"),
            Action::MoveToSurface { limit, distance } => {
                write!(f, "move_to_surface({limit:.2}, {distance:.2})")
            }
            Action::PickTip { z_limit } => write!(f, "pick_tip({z_limit:.2})"),
            Action::EjectTip => f.write_str("eject_tip"),
            Action::Aspirate { volume } => write!(f, "aspirate({volume:.2})"),
            Action::Dispense { volume } => write!(f, "dispense({volume:.2})"),
        }
    }
}

/// Liquid moved between one item and the channels that touch it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemTransfer {
    pub item: ItemAddress,
    /// Channels served by this item.
    pub channels: Vec<usize>,
    pub volume_per_channel: f64,
}

impl ItemTransfer {
    /// Total volume leaving or entering the item.
    pub fn total(&self) -> f64 {
        self.volume_per_channel * self.channels.len() as f64
    }
}

/// The labware state change a step causes once it completes.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "effect", content = "items", rename_all = "snake_case")]
pub enum Effect {
    #[default]
    None,
    Draw(Vec<ItemTransfer>),
    Deposit(Vec<ItemTransfer>),
    TakeTips(Vec<ItemAddress>),
    StowTips(Vec<ItemAddress>),
    DropTips,
    /// Aspirate/dispense that leaves every content map unchanged.
    Mix,
}

/// One device command and the state change it causes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedStep {
    pub action: Action,
    #[serde(default)]
    pub effect: Effect,
}

impl PlannedStep {
    /// A step with no labware effect.
    pub fn motion(action: Action) -> Self {
        Self {
            action,
            effect: Effect::None,
        }
    }
}

/// How a batch moves liquid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchKind {
    /// One bulk aspirate, one dispense per target.
    OneToMany,
    /// One aspirate per source, one bulk dispense.
    ManyToOne,
    /// One aspirate and one dispense.
    OneToOne,
}

/// One aspirate/dispense cycle, summarized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub kind: BatchKind,
    /// Volume of the shared aspirate or dispense, per channel.
    pub bulk_volume: f64,
    /// Per-target volumes, in execution order.
    pub target_volumes: Vec<f64>,
}

impl BatchRecord {
    pub fn len(&self) -> usize {
        self.target_volumes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.target_volumes.is_empty()
    }

    /// Sum of the per-target volumes.
    pub fn target_total(&self) -> f64 {
        self.target_volumes.iter().sum()
    }
}

/// An ordered, replayable list of steps for one operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    /// Name of the planned operation.
    pub operation: String,
    pub steps: Vec<PlannedStep>,
    /// One record per liquid-handling cycle; empty for tip operations.
    #[serde(default)]
    pub batches: Vec<BatchRecord>,
}

impl Plan {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            steps: Vec::new(),
            batches: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn actions(&self) -> impl Iterator<Item = &Action> {
        self.steps.iter().map(|s| &s.action)
    }

    /// Aspirate volumes in order, mixing included.
    pub fn aspirations(&self) -> Vec<f64> {
        self.actions()
            .filter_map(|a| match a {
                Action::Aspirate { volume } => Some(*volume),
                _ => None,
            })
            .collect()
    }

    /// Dispense volumes in order, mixing included.
    pub fn dispenses(&self) -> Vec<f64> {
        self.actions()
            .filter_map(|a| match a {
                Action::Dispense { volume } => Some(*volume),
                _ => None,
            })
            .collect()
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} ({} steps)", self.operation, self.steps.len())?;
        for (index, step) in self.steps.iter().enumerate() {
            writeln!(f, "  {:>3}. {}", index + 1, step.action)?;
        }
        Ok(())
    }
}

//! Core domain types for the damage meter.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Event-type code of a melee damage event.
pub const MELEE_DAMAGE_EVENT: u16 = 12;

/// Event-type code of a spell damage event.
pub const SPELL_DAMAGE_EVENT: u16 = 13;

/// Identifier of an actor (a unit dealing damage).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorId(pub u64);

impl std::fmt::Display for ActorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ActorId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Identifier of an ability (spell id; melee swings use their own ids).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AbilityId(pub u32);

impl std::fmt::Display for AbilityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for AbilityId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// Rule set under which the event log is interpreted.
///
/// Exactly one mode is active per cache. Converts from the boolean flag used
/// by callers (`true` selects [`Mode::Heroic`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Normal,
    Heroic,
}

impl From<bool> for Mode {
    fn from(heroic: bool) -> Self {
        if heroic { Mode::Heroic } else { Mode::Normal }
    }
}

impl From<Mode> for bool {
    fn from(mode: Mode) -> Self {
        mode == Mode::Heroic
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Normal => write!(f, "normal"),
            Mode::Heroic => write!(f, "heroic"),
        }
    }
}

/// Descriptor of the unit behind an actor id.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Unit {
    pub unit_id: u64,
    #[serde(default)]
    pub is_player: bool,
    #[serde(default)]
    pub is_self_damage: bool,
    #[serde(default)]
    pub is_mind_control: bool,
}

impl Unit {
    /// A plain non-player unit.
    pub fn new(unit_id: u64) -> Self {
        Self {
            unit_id,
            ..Self::default()
        }
    }

    /// A player unit.
    pub fn player(unit_id: u64) -> Self {
        Self {
            unit_id,
            is_player: true,
            ..Self::default()
        }
    }

    /// The actor id this unit is keyed under.
    pub fn actor_id(&self) -> ActorId {
        ActorId(self.unit_id)
    }
}

/// The active time window of the viewed instance, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TimeWindow {
    #[serde(default)]
    pub start_ts: Option<u64>,
    #[serde(default)]
    pub end_ts: Option<u64>,
}

impl TimeWindow {
    /// Create a window with both bounds set.
    pub fn new(start_ts: u64, end_ts: u64) -> Self {
        Self {
            start_ts: Some(start_ts),
            end_ts: Some(end_ts),
        }
    }

    /// Timestamp used when resolving unit metadata: the start, else the end.
    pub fn reference_ts(&self) -> Option<u64> {
        self.start_ts.or(self.end_ts)
    }

    /// The reference timestamp as a UTC date-time.
    pub fn reference_time(&self) -> Option<DateTime<Utc>> {
        self.reference_ts()
            .and_then(|ts| Utc.timestamp_millis_opt(ts as i64).single())
    }
}

/// One actor's contribution inside a partial aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ActorDamage {
    pub unit: Unit,
    #[serde(default)]
    pub abilities: BTreeMap<AbilityId, u64>,
}

impl ActorDamage {
    /// Create an entry for `unit` with no abilities yet.
    pub fn new(unit: Unit) -> Self {
        Self {
            unit,
            abilities: BTreeMap::new(),
        }
    }

    /// Builder-style helper adding one ability amount.
    pub fn with_ability(mut self, ability: impl Into<AbilityId>, amount: u64) -> Self {
        self.abilities.insert(ability.into(), amount);
        self
    }
}

/// Everything one data source knows for a mode: actor -> (unit, ability -> amount).
pub type PartialAggregate = BTreeMap<ActorId, ActorDamage>;

/// One row of the merged table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorRow {
    pub actor: ActorId,
    pub abilities: Vec<(AbilityId, u64)>,
}

impl ActorRow {
    /// Sum of all ability amounts of this actor.
    pub fn total(&self) -> u64 {
        self.abilities.iter().map(|(_, amount)| amount).sum()
    }
}

/// The published, merged per-actor/per-ability table.
///
/// Row order is merge insertion order. It is stable for display but carries
/// no meaning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationResult {
    /// Publish counter of the producing cache, strictly increasing.
    pub generation: u64,
    /// Mode the result was computed under.
    pub mode: Mode,
    /// Time window captured when the recompute started.
    pub window: TimeWindow,
    pub rows: Vec<ActorRow>,
}

impl AggregationResult {
    /// Amount recorded for an actor/ability pair.
    pub fn amount(&self, actor: ActorId, ability: AbilityId) -> Option<u64> {
        self.rows
            .iter()
            .find(|row| row.actor == actor)
            .and_then(|row| {
                row.abilities
                    .iter()
                    .find(|(id, _)| *id == ability)
                    .map(|(_, amount)| *amount)
            })
    }

    /// Look up a row by actor.
    pub fn row(&self, actor: ActorId) -> Option<&ActorRow> {
        self.rows.iter().find(|row| row.actor == actor)
    }

    /// Number of (actor, ability) cells.
    pub fn cell_count(&self) -> usize {
        self.rows.iter().map(|row| row.abilities.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Class of change announced on the update bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    /// The user changed the event filter (targets, sources, time range).
    FilterChanged,
    /// New log events were ingested.
    NewData,
}

/// A batch of update notifications.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UpdateBatch {
    #[serde(default)]
    pub kinds: BTreeSet<UpdateKind>,
    #[serde(default)]
    pub event_types: BTreeSet<u16>,
}

impl UpdateBatch {
    /// Create a batch from kinds and event-type codes.
    pub fn new(
        kinds: impl IntoIterator<Item = UpdateKind>,
        event_types: impl IntoIterator<Item = u16>,
    ) -> Self {
        Self {
            kinds: kinds.into_iter().collect(),
            event_types: event_types.into_iter().collect(),
        }
    }

    /// A filter change without event types.
    pub fn filter_changed() -> Self {
        Self::new([UpdateKind::FilterChanged], [])
    }

    /// New data for the given event types.
    pub fn new_data(event_types: impl IntoIterator<Item = u16>) -> Self {
        Self::new([UpdateKind::NewData], event_types)
    }

    pub fn has_kind(&self, kind: UpdateKind) -> bool {
        self.kinds.contains(&kind)
    }
}

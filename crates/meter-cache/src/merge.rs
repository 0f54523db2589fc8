//! Merge engine: folds partial aggregates into one ordered table.
//!
//! Partials are processed in the order given (melee before spell). For an
//! actor/ability pair present in several partials the amount of the partial
//! processed last wins; amounts are never summed across partials.

use std::collections::{HashMap, HashSet};

use meter_core::{AbilityId, ActorId, ActorRow, EnrichmentRequest, PartialAggregate, TimeWindow};

/// Output of one merge: the table rows plus the enrichment requests for
/// every unit and ability encountered.
#[derive(Debug, Clone, Default)]
pub struct MergeOutput {
    pub rows: Vec<ActorRow>,
    pub enrichment: Vec<EnrichmentRequest>,
}

/// Rows in insertion order with index lookups for overwrites.
#[derive(Default)]
struct TableBuilder {
    rows: Vec<ActorRow>,
    actor_index: HashMap<ActorId, usize>,
    /// Per row: ability id -> position inside that row.
    ability_index: Vec<HashMap<AbilityId, usize>>,
}

impl TableBuilder {
    fn row_for(&mut self, actor: ActorId) -> usize {
        if let Some(&idx) = self.actor_index.get(&actor) {
            return idx;
        }
        let idx = self.rows.len();
        self.rows.push(ActorRow {
            actor,
            abilities: Vec::new(),
        });
        self.ability_index.push(HashMap::new());
        self.actor_index.insert(actor, idx);
        idx
    }

    fn set(&mut self, row: usize, ability: AbilityId, amount: u64) {
        let cells = &mut self.rows[row].abilities;
        match self.ability_index[row].get(&ability) {
            Some(&pos) => cells[pos].1 = amount,
            None => {
                self.ability_index[row].insert(ability, cells.len());
                cells.push((ability, amount));
            }
        }
    }
}

/// Merge `partials` in processing order.
///
/// `window` supplies the timestamp attached to unit enrichment requests.
pub fn merge(partials: &[&PartialAggregate], window: &TimeWindow) -> MergeOutput {
    let mut table = TableBuilder::default();
    let mut enrichment = Vec::new();
    let mut units_seen = HashSet::new();
    let mut abilities_seen = HashSet::new();
    let at = window.reference_ts();

    for partial in partials {
        for (actor, damage) in partial.iter() {
            if units_seen.insert(*actor) {
                enrichment.push(EnrichmentRequest::Unit {
                    unit: damage.unit.clone(),
                    at,
                });
            }
            let row = table.row_for(*actor);
            for (ability, amount) in &damage.abilities {
                if abilities_seen.insert(*ability) {
                    enrichment.push(EnrichmentRequest::Ability { ability: *ability });
                }
                table.set(row, *ability, *amount);
            }
        }
    }

    MergeOutput {
        rows: table.rows,
        enrichment,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meter_core::{ActorDamage, Unit};
    use pretty_assertions::assert_eq;

    fn partial(entries: &[(u64, u32, u64)]) -> PartialAggregate {
        let mut partial = PartialAggregate::new();
        for &(actor, ability, amount) in entries {
            partial
                .entry(ActorId(actor))
                .or_insert_with(|| ActorDamage::new(Unit::player(actor)))
                .abilities
                .insert(AbilityId(ability), amount);
        }
        partial
    }

    fn window() -> TimeWindow {
        TimeWindow::new(1_000, 9_000)
    }

    #[test]
    fn test_spell_amount_wins_on_collision() {
        let melee = partial(&[(5, 100, 40)]);
        let spell = partial(&[(5, 100, 25)]);

        let out = merge(&[&melee, &spell], &window());

        assert_eq!(
            out.rows,
            vec![ActorRow {
                actor: ActorId(5),
                abilities: vec![(AbilityId(100), 25)],
            }]
        );
    }

    #[test]
    fn test_disjoint_keys_pass_through() {
        let melee = partial(&[(5, 100, 40)]);
        let spell = partial(&[(6, 200, 10)]);

        let out = merge(&[&melee, &spell], &window());

        assert_eq!(
            out.rows,
            vec![
                ActorRow {
                    actor: ActorId(5),
                    abilities: vec![(AbilityId(100), 40)],
                },
                ActorRow {
                    actor: ActorId(6),
                    abilities: vec![(AbilityId(200), 10)],
                },
            ]
        );
    }

    #[test]
    fn test_shared_actor_keeps_melee_position() {
        let melee = partial(&[(5, 1, 10), (5, 2, 20), (9, 1, 5)]);
        let spell = partial(&[(5, 3, 30), (5, 1, 11), (7, 4, 1)]);

        let out = merge(&[&melee, &spell], &window());

        let actors: Vec<_> = out.rows.iter().map(|row| row.actor.0).collect();
        assert_eq!(actors, vec![5, 9, 7]);
        assert_eq!(
            out.rows[0].abilities,
            vec![(AbilityId(1), 11), (AbilityId(2), 20), (AbilityId(3), 30)]
        );
    }

    #[test]
    fn test_empty_inputs() {
        let out = merge(&[&PartialAggregate::new(), &PartialAggregate::new()], &window());
        assert!(out.rows.is_empty());
        assert!(out.enrichment.is_empty());
    }

    #[test]
    fn test_actor_without_abilities_still_listed() {
        let mut melee = PartialAggregate::new();
        melee.insert(ActorId(3), ActorDamage::new(Unit::new(3)));

        let out = merge(&[&melee], &window());

        assert_eq!(out.rows.len(), 1);
        assert!(out.rows[0].abilities.is_empty());
    }

    #[test]
    fn test_enrichment_covers_every_unit_and_ability_once() {
        let melee = partial(&[(5, 100, 40), (6, 100, 1)]);
        let spell = partial(&[(5, 200, 25)]);

        let out = merge(&[&melee, &spell], &window());

        assert_eq!(
            out.enrichment,
            vec![
                EnrichmentRequest::Unit {
                    unit: Unit::player(5),
                    at: Some(1_000),
                },
                EnrichmentRequest::Ability {
                    ability: AbilityId(100),
                },
                EnrichmentRequest::Unit {
                    unit: Unit::player(6),
                    at: Some(1_000),
                },
                EnrichmentRequest::Ability {
                    ability: AbilityId(200),
                },
            ]
        );
    }

    #[test]
    fn test_unit_enrichment_falls_back_to_end_ts() {
        let melee = partial(&[(5, 100, 40)]);
        let window = TimeWindow {
            start_ts: None,
            end_ts: Some(7_000),
        };

        let out = merge(&[&melee], &window);

        assert!(matches!(
            out.enrichment[0],
            EnrichmentRequest::Unit { at: Some(7_000), .. }
        ));
    }
}

//! Entity merge engine.
//!
//! Deep-merges partial model patches into existing entity state without
//! discarding unrelated nested fields, and repairs the indexer's
//! "deletion sent as an empty model" artifact.

use std::collections::BTreeMap;

use crate::model::{model_name, EntityModels, ModelValue};

/// Merge `patch` over `existing`.
///
/// Structs merge field by field. Enums with the same variant merge their
/// payloads; a different variant replaces the value. Primitives, tuples and
/// arrays are replaced wholesale.
pub fn merge_value(existing: ModelValue, patch: ModelValue) -> ModelValue {
    match (existing, patch) {
        (
            ModelValue::Struct {
                name,
                fields: mut merged,
            },
            ModelValue::Struct {
                name: patch_name,
                fields: patch_fields,
            },
        ) => {
            for (field, value) in patch_fields {
                let next = match merged.remove(&field) {
                    Some(old) => merge_value(old, value),
                    None => value,
                };
                merged.insert(field, next);
            }
            ModelValue::Struct {
                name: if patch_name.is_empty() { name } else { patch_name },
                fields: merged,
            }
        }
        (
            ModelValue::Enum {
                variant: old_variant,
                payload: Some(old_payload),
                ..
            },
            ModelValue::Enum {
                name,
                variant,
                payload: Some(new_payload),
            },
        ) if old_variant == variant => ModelValue::Enum {
            name,
            variant,
            payload: Some(Box::new(merge_value(*old_payload, *new_payload))),
        },
        (_, patch) => patch,
    }
}

/// Merge an entity patch into the existing record.
///
/// Models absent from `patch` are kept untouched; with no existing record the
/// patch is returned as-is.
pub fn merge_entity_patch(existing: Option<&EntityModels>, patch: EntityModels) -> EntityModels {
    let Some(existing) = existing else {
        return patch;
    };

    let mut merged = existing.clone();
    for (model, value) in patch {
        let next = match merged.remove(&model) {
            Some(old) => merge_value(old, value),
            None => value,
        };
        merged.insert(model, next);
    }
    merged
}

/// Zeroed record substituted for an empty patch of one model.
#[derive(Debug, Clone, PartialEq)]
pub struct RepairRule {
    /// Full model name.
    pub model: String,
    /// Numeric id field carried over from the existing record.
    pub id_field: String,
    /// Record installed in place of the empty patch.
    pub template: ModelValue,
}

/// Table of deletion-artifact repairs, one rule per affected model.
///
/// The indexer reports a deleted explorer as an empty model rather than a
/// removal. Merged naively that is a no-op, so downstream readers would keep
/// seeing the old army. Each rule swaps the empty patch for an explicit zeroed
/// record that keeps only the entity's own id.
#[derive(Debug, Clone, Default)]
pub struct DeletionRepair {
    rules: BTreeMap<String, RepairRule>,
}

impl DeletionRepair {
    /// Table with the built-in ExplorerTroops rule.
    pub fn new(namespace: &str) -> Self {
        Self::empty().with_rule(explorer_troops_rule(namespace))
    }

    /// Table with no rules; empty patches merge as no-ops.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_rule(mut self, rule: RepairRule) -> Self {
        self.rules.insert(rule.model.clone(), rule);
        self
    }

    pub fn rule(&self, model: &str) -> Option<&RepairRule> {
        self.rules.get(model)
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Replace empty patches of repaired models with their zeroed records.
    ///
    /// The id is carried over from the existing record.
    /// Returns the number of models repaired.
    pub fn repair(&self, existing: Option<&EntityModels>, patch: &mut EntityModels) -> usize {
        let mut repaired = 0;

        for rule in self.rules.values() {
            let Some(value) = patch.get(&rule.model) else {
                continue;
            };
            if !value.is_empty_struct() {
                continue;
            }

            let id = existing
                .and_then(|e| e.get(&rule.model))
                .and_then(|m| m.field(&rule.id_field))
                .cloned();

            let mut record = rule.template.clone();
            match (id, record.fields_mut()) {
                (Some(id), Some(fields)) => {
                    fields.insert(rule.id_field.clone(), id);
                }
                (None, _) => {
                    tracing::warn!(
                        model = %rule.model,
                        id_field = %rule.id_field,
                        "Empty model patch without a known id, installing zeroed record"
                    );
                }
                (Some(_), None) => {
                    tracing::warn!(model = %rule.model, "Repair template is not a struct");
                }
            }

            patch.insert(rule.model.clone(), record);
            repaired += 1;
        }

        repaired
    }
}

/// Repair then merge.
pub fn merge_with_repair(
    existing: Option<&EntityModels>,
    mut patch: EntityModels,
    repair: &DeletionRepair,
) -> EntityModels {
    repair.repair(existing, &mut patch);
    merge_entity_patch(existing, patch)
}

fn zero_u8() -> ModelValue {
    ModelValue::u8(0)
}

fn zero_u16() -> ModelValue {
    ModelValue::u16(0)
}

fn zero_u32() -> ModelValue {
    ModelValue::u32(0)
}

/// Zeroed ExplorerTroops record.
pub fn explorer_troops_rule(namespace: &str) -> RepairRule {
    let stamina = ModelValue::structure(
        "Stamina",
        [
            ("amount", ModelValue::u64(0)),
            ("updated_tick", ModelValue::u64(0)),
        ],
    );
    let boosts = ModelValue::structure(
        "TroopBoosts",
        [
            ("incr_damage_dealt_percent_num", zero_u16()),
            ("incr_damage_dealt_end_tick", zero_u32()),
            ("decr_damage_gotten_percent_num", zero_u16()),
            ("decr_damage_gotten_end_tick", zero_u32()),
            ("incr_stamina_regen_percent_num", zero_u16()),
            ("incr_stamina_regen_tick_count", zero_u8()),
            ("incr_explore_reward_percent_num", zero_u16()),
            ("incr_explore_reward_end_tick", zero_u32()),
        ],
    );
    let troops = ModelValue::structure(
        "Troops",
        [
            ("category", ModelValue::unit_enum("TroopType", "Knight")),
            ("tier", ModelValue::unit_enum("TroopTier", "T1")),
            ("count", ModelValue::u128(0)),
            ("stamina", stamina),
            ("boosts", boosts),
            ("battle_cooldown_end", zero_u32()),
        ],
    );
    let coord = ModelValue::structure("Coord", [("x", zero_u32()), ("y", zero_u32())]);

    RepairRule {
        model: model_name(namespace, "ExplorerTroops"),
        id_field: "explorer_id".to_string(),
        template: ModelValue::structure(
            "ExplorerTroops",
            [
                ("explorer_id", zero_u32().as_key()),
                ("owner", zero_u32()),
                ("coord", coord),
                ("troops", troops),
            ],
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXPLORER: &str = "s1_eternum-ExplorerTroops";

    fn position(x: u32, y: u32) -> ModelValue {
        ModelValue::structure("Coord", [("x", ModelValue::u32(x)), ("y", ModelValue::u32(y))])
    }

    fn live_explorer(id: u32) -> ModelValue {
        ModelValue::structure(
            "ExplorerTroops",
            [
                ("explorer_id", ModelValue::u32(id).as_key()),
                ("owner", ModelValue::u32(77)),
                ("coord", position(12, 34)),
                (
                    "troops",
                    ModelValue::structure(
                        "Troops",
                        [
                            ("category", ModelValue::unit_enum("TroopType", "Paladin")),
                            ("count", ModelValue::u128(500)),
                        ],
                    ),
                ),
            ],
        )
    }

    #[test]
    fn disjoint_leaves_are_all_kept() {
        let existing = EntityModels::new().with(
            "s1_eternum-Structure",
            ModelValue::structure(
                "Structure",
                [
                    ("entity_id", ModelValue::u32(5).as_key()),
                    ("base", ModelValue::structure("Base", [("level", ModelValue::u8(1))])),
                ],
            ),
        );
        let patch = EntityModels::new().with(
            "s1_eternum-Structure",
            ModelValue::structure(
                "Structure",
                [(
                    "base",
                    ModelValue::structure("Base", [("coord_x", ModelValue::u32(9))]),
                )],
            ),
        );

        let merged = merge_entity_patch(Some(&existing), patch);
        let structure = merged.get("s1_eternum-Structure").unwrap();
        assert_eq!(structure.path("entity_id").and_then(ModelValue::as_u128), Some(5));
        assert_eq!(structure.path("base.level").and_then(ModelValue::as_u128), Some(1));
        assert_eq!(structure.path("base.coord_x").and_then(ModelValue::as_u128), Some(9));
    }

    #[test]
    fn arrays_and_primitives_are_replaced_wholesale() {
        let existing = ModelValue::structure(
            "Trade",
            [
                (
                    "amounts",
                    ModelValue::Array {
                        items: vec![ModelValue::u32(1), ModelValue::u32(2), ModelValue::u32(3)],
                    },
                ),
                ("taker", ModelValue::u32(1)),
            ],
        );
        let patch = ModelValue::structure(
            "Trade",
            [
                ("amounts", ModelValue::Array { items: vec![ModelValue::u32(9)] }),
                ("taker", ModelValue::u32(2)),
            ],
        );

        let merged = merge_value(existing, patch);
        assert_eq!(
            merged.field("amounts"),
            Some(&ModelValue::Array { items: vec![ModelValue::u32(9)] })
        );
        assert_eq!(merged.field("taker").and_then(ModelValue::as_u128), Some(2));
    }

    #[test]
    fn enum_variant_change_replaces_payload() {
        let existing = ModelValue::Enum {
            name: "Occupier".into(),
            variant: "Explorer".into(),
            payload: Some(Box::new(ModelValue::structure("Inner", [("a", ModelValue::u8(1))]))),
        };
        let same = ModelValue::Enum {
            name: "Occupier".into(),
            variant: "Explorer".into(),
            payload: Some(Box::new(ModelValue::structure("Inner", [("b", ModelValue::u8(2))]))),
        };
        let merged = merge_value(existing.clone(), same);
        let ModelValue::Enum { payload: Some(payload), .. } = merged else {
            panic!("expected enum");
        };
        assert!(payload.field("a").is_some());
        assert!(payload.field("b").is_some());

        let other = ModelValue::unit_enum("Occupier", "None");
        assert_eq!(merge_value(existing, other.clone()), other);
    }

    #[test]
    fn missing_existing_returns_patch() {
        let patch = EntityModels::new().with("m", ModelValue::u8(3));
        assert_eq!(merge_entity_patch(None, patch.clone()), patch);
    }

    #[test]
    fn empty_explorer_patch_is_repaired_to_zeroed_record() {
        let repair = DeletionRepair::new("s1_eternum");
        let existing = EntityModels::new().with(EXPLORER, live_explorer(321));
        let patch = EntityModels::new().with(EXPLORER, ModelValue::empty_struct("ExplorerTroops"));

        let merged = merge_with_repair(Some(&existing), patch, &repair);
        let explorer = merged.get(EXPLORER).unwrap();

        assert_eq!(explorer.path("explorer_id").and_then(ModelValue::as_u128), Some(321));
        assert_eq!(explorer.path("coord.x").and_then(ModelValue::as_u128), Some(0));
        assert_eq!(explorer.path("coord.y").and_then(ModelValue::as_u128), Some(0));
        assert_eq!(explorer.path("troops.count").and_then(ModelValue::as_u128), Some(0));
        assert_eq!(explorer.path("owner").and_then(ModelValue::as_u128), Some(0));
        assert_eq!(
            explorer.path("troops.category").and_then(ModelValue::variant),
            Some("Knight")
        );
    }

    #[test]
    fn non_empty_explorer_patch_is_not_repaired() {
        let repair = DeletionRepair::new("s1_eternum");
        let mut patch = EntityModels::new().with(
            EXPLORER,
            ModelValue::structure("ExplorerTroops", [("coord", position(1, 1))]),
        );
        assert_eq!(repair.repair(None, &mut patch), 0);
    }

    #[test]
    fn empty_table_leaves_empty_patch_as_noop() {
        let existing = EntityModels::new().with(EXPLORER, live_explorer(9));
        let patch = EntityModels::new().with(EXPLORER, ModelValue::empty_struct("ExplorerTroops"));
        let merged = merge_with_repair(Some(&existing), patch, &DeletionRepair::empty());
        assert_eq!(merged, existing);
    }
}

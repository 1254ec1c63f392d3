//! Model values - typed trees describing indexed entity state.
//!
//! An entity is a set of named models (`s1_eternum-Structure`,
//! `s1_eternum-ExplorerTroops`, ...). Each model is a [`ModelValue::Struct`]
//! whose leaves are typed primitives, enums, tuples or arrays. Partial updates
//! from the indexer use the same shape but only carry the changed leaves plus
//! key fields.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque entity key (the indexer's hashed keys).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityKey(String);

impl EntityKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Derive a key from the entity's domain key fields.
    ///
    /// FNV-1a over the joined fields; stable across runs and platforms.
    pub fn from_keys<S: AsRef<str>>(keys: &[S]) -> Self {
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for (i, key) in keys.iter().enumerate() {
            if i > 0 {
                hash ^= u64::from(b'/');
                hash = hash.wrapping_mul(0x0100_0000_01b3);
            }
            for byte in key.as_ref().bytes() {
                hash ^= u64::from(byte);
                hash = hash.wrapping_mul(0x0100_0000_01b3);
            }
        }
        Self(format!("0x{:016x}", hash))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for EntityKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Leaf value of a model field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Scalar {
    Bool(bool),
    Unsigned(u128),
    Signed(i128),
    /// felt252, ContractAddress, u256 - kept as hex text.
    Felt(String),
    /// ByteArray
    Text(String),
}

impl Scalar {
    pub fn as_u128(&self) -> Option<u128> {
        match self {
            Self::Unsigned(v) => Some(*v),
            Self::Signed(v) => u128::try_from(*v).ok(),
            Self::Bool(b) => Some(u128::from(*b)),
            Self::Felt(s) => parse_hex(s),
            Self::Text(_) => None,
        }
    }

    pub fn as_i128(&self) -> Option<i128> {
        match self {
            Self::Signed(v) => Some(*v),
            Self::Unsigned(v) => i128::try_from(*v).ok(),
            Self::Bool(b) => Some(i128::from(*b)),
            Self::Felt(s) => parse_hex(s).and_then(|v| i128::try_from(v).ok()),
            Self::Text(_) => None,
        }
    }

    /// Key-field rendering used by key clauses (`0x` hex for felts, decimal otherwise).
    pub fn to_key_string(&self) -> String {
        match self {
            Self::Bool(b) => u8::from(*b).to_string(),
            Self::Unsigned(v) => v.to_string(),
            Self::Signed(v) => v.to_string(),
            Self::Felt(s) | Self::Text(s) => s.clone(),
        }
    }
}

fn parse_hex(s: &str) -> Option<u128> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    u128::from_str_radix(digits, 16).ok()
}

/// A typed value tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ModelValue {
    Primitive {
        type_name: String,
        value: Scalar,
        #[serde(default)]
        key: bool,
    },
    Struct {
        name: String,
        fields: BTreeMap<String, ModelValue>,
    },
    Enum {
        name: String,
        variant: String,
        #[serde(default)]
        payload: Option<Box<ModelValue>>,
    },
    Tuple {
        items: Vec<ModelValue>,
    },
    Array {
        items: Vec<ModelValue>,
    },
}

impl ModelValue {
    pub fn primitive(type_name: &str, value: Scalar) -> Self {
        Self::Primitive {
            type_name: type_name.to_string(),
            value,
            key: false,
        }
    }

    pub fn bool(value: bool) -> Self {
        Self::primitive("bool", Scalar::Bool(value))
    }

    pub fn u8(value: u8) -> Self {
        Self::primitive("u8", Scalar::Unsigned(value.into()))
    }

    pub fn u16(value: u16) -> Self {
        Self::primitive("u16", Scalar::Unsigned(value.into()))
    }

    pub fn u32(value: u32) -> Self {
        Self::primitive("u32", Scalar::Unsigned(value.into()))
    }

    pub fn u64(value: u64) -> Self {
        Self::primitive("u64", Scalar::Unsigned(value.into()))
    }

    pub fn u128(value: u128) -> Self {
        Self::primitive("u128", Scalar::Unsigned(value))
    }

    pub fn felt(value: impl Into<String>) -> Self {
        Self::primitive("felt252", Scalar::Felt(value.into()))
    }

    pub fn address(value: impl Into<String>) -> Self {
        Self::primitive("ContractAddress", Scalar::Felt(value.into()))
    }

    /// Build a struct value from `(field, value)` pairs.
    pub fn structure<I, K>(name: &str, fields: I) -> Self
    where
        I: IntoIterator<Item = (K, ModelValue)>,
        K: Into<String>,
    {
        Self::Struct {
            name: name.to_string(),
            fields: fields.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    /// Struct with no fields; the indexer's encoding of a removed model.
    pub fn empty_struct(name: &str) -> Self {
        Self::Struct {
            name: name.to_string(),
            fields: BTreeMap::new(),
        }
    }

    pub fn unit_enum(name: &str, variant: &str) -> Self {
        Self::Enum {
            name: name.to_string(),
            variant: variant.to_string(),
            payload: None,
        }
    }

    /// Mark a primitive as a key field.
    pub fn as_key(self) -> Self {
        match self {
            Self::Primitive {
                type_name, value, ..
            } => Self::Primitive {
                type_name,
                value,
                key: true,
            },
            other => other,
        }
    }

    pub fn is_key(&self) -> bool {
        matches!(self, Self::Primitive { key: true, .. })
    }

    pub fn is_empty_struct(&self) -> bool {
        matches!(self, Self::Struct { fields, .. } if fields.is_empty())
    }

    pub fn fields(&self) -> Option<&BTreeMap<String, ModelValue>> {
        match self {
            Self::Struct { fields, .. } => Some(fields),
            _ => None,
        }
    }

    pub fn fields_mut(&mut self) -> Option<&mut BTreeMap<String, ModelValue>> {
        match self {
            Self::Struct { fields, .. } => Some(fields),
            _ => None,
        }
    }

    pub fn field(&self, name: &str) -> Option<&ModelValue> {
        self.fields()?.get(name)
    }

    /// Follow a dotted path (`troops.stamina.amount`) through nested structs.
    pub fn path(&self, path: &str) -> Option<&ModelValue> {
        path.split('.').try_fold(self, |value, segment| value.field(segment))
    }

    pub fn scalar(&self) -> Option<&Scalar> {
        match self {
            Self::Primitive { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn as_u128(&self) -> Option<u128> {
        self.scalar()?.as_u128()
    }

    pub fn variant(&self) -> Option<&str> {
        match self {
            Self::Enum { variant, .. } => Some(variant),
            _ => None,
        }
    }
}

/// The models of one entity, keyed by full model name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityModels(BTreeMap<String, ModelValue>);

impl EntityModels {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, model: impl Into<String>, value: ModelValue) -> Self {
        self.0.insert(model.into(), value);
        self
    }

    pub fn insert(&mut self, model: impl Into<String>, value: ModelValue) -> Option<ModelValue> {
        self.0.insert(model.into(), value)
    }

    pub fn get(&self, model: &str) -> Option<&ModelValue> {
        self.0.get(model)
    }

    pub fn get_mut(&mut self, model: &str) -> Option<&mut ModelValue> {
        self.0.get_mut(model)
    }

    pub fn remove(&mut self, model: &str) -> Option<ModelValue> {
        self.0.remove(model)
    }

    pub fn contains(&self, model: &str) -> bool {
        self.0.contains_key(model)
    }

    pub fn model_names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ModelValue)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Keep only the listed models; an empty list keeps everything.
    pub fn retain_models(&mut self, models: &[String]) {
        if models.is_empty() {
            return;
        }
        self.0.retain(|name, _| models.iter().any(|m| m == name));
    }
}

impl IntoIterator for EntityModels {
    type Item = (String, ModelValue);
    type IntoIter = std::collections::btree_map::IntoIter<String, ModelValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl FromIterator<(String, ModelValue)> for EntityModels {
    fn from_iter<T: IntoIterator<Item = (String, ModelValue)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// An entity as returned by a one-shot fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub key: EntityKey,
    pub models: EntityModels,
}

/// A live update waiting in the batch queue. Consumed by exactly one flush.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingUpdate {
    pub key: EntityKey,
    pub patch: EntityModels,
}

impl PendingUpdate {
    pub fn new(key: impl Into<EntityKey>, patch: EntityModels) -> Self {
        Self {
            key: key.into(),
            patch,
        }
    }
}

/// Full model name for a namespace (`s1_eternum` + `Tile` -> `s1_eternum-Tile`).
pub fn model_name(namespace: &str, model: &str) -> String {
    format!("{namespace}-{model}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_key_from_keys_is_stable_and_order_sensitive() {
        let a = EntityKey::from_keys(&["10", "20"]);
        let b = EntityKey::from_keys(&["10", "20"]);
        let c = EntityKey::from_keys(&["20", "10"]);
        let d = EntityKey::from_keys(&["1", "020"]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert!(a.as_str().starts_with("0x"));
    }

    #[test]
    fn path_walks_nested_structs() {
        let troops = ModelValue::structure(
            "Troops",
            [(
                "stamina",
                ModelValue::structure("Stamina", [("amount", ModelValue::u64(42))]),
            )],
        );
        let explorer = ModelValue::structure("ExplorerTroops", [("troops", troops)]);

        assert_eq!(
            explorer.path("troops.stamina.amount").and_then(ModelValue::as_u128),
            Some(42)
        );
        assert!(explorer.path("troops.missing").is_none());
    }

    #[test]
    fn felt_scalars_parse_as_hex() {
        assert_eq!(Scalar::Felt("0x1f".into()).as_u128(), Some(31));
        assert_eq!(Scalar::Text("hello".into()).as_u128(), None);
    }

    #[test]
    fn retain_models_with_empty_list_keeps_all() {
        let mut models = EntityModels::new()
            .with("a", ModelValue::u8(1))
            .with("b", ModelValue::u8(2));
        models.retain_models(&[]);
        assert_eq!(models.len(), 2);
        models.retain_models(&["b".to_string()]);
        assert_eq!(models.model_names().collect::<Vec<_>>(), vec!["b"]);
    }
}

//! Partitioning of one inbound payload by field category.
//!
//! # Invariants
//! - Every payload key lands in exactly one bucket or one `UnexpectedKey` error.
//! - Hidden and undeclared keys are never bucketed.
//! - Calculated and extra-allowed keys share the `extra` bucket.

use crate::errors::{FieldError, ObjectErrors};
use crate::orm::record::Data;
use crate::schema::taxonomy::{FieldCategory, SchemaDescription};
use serde_json::Value;

/// One payload split into category buckets.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SortedData {
    pub scalar: Data,
    /// Calculated and extra-allowed inputs; never stored as-is.
    pub extra: Data,
    /// Forward relations supplied as nested mappings.
    pub object: Data,
    /// Forward relations supplied as keys.
    pub key: Data,
    pub reverse_single: Data,
    pub reverse_many: Data,
}

impl SortedData {
    /// All bucketed entries, scalars first and reverse relations last.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        [
            &self.scalar,
            &self.key,
            &self.object,
            &self.reverse_single,
            &self.reverse_many,
            &self.extra,
        ]
        .into_iter()
        .flat_map(|bucket| bucket.iter().map(|(name, value)| (name.as_str(), value)))
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    fn bucket_mut(&mut self, category: FieldCategory) -> Option<&mut Data> {
        match category {
            FieldCategory::Scalar => Some(&mut self.scalar),
            FieldCategory::ObjectRelation(_) => Some(&mut self.object),
            FieldCategory::KeyRelation(_) => Some(&mut self.key),
            FieldCategory::ReverseSingle => Some(&mut self.reverse_single),
            FieldCategory::ReverseMany => Some(&mut self.reverse_many),
            FieldCategory::Calculated | FieldCategory::ExtraAllowed => Some(&mut self.extra),
            FieldCategory::Hidden => None,
        }
    }
}

/// Splits `data` into buckets, collecting rejected keys as field errors.
pub fn partition(description: &SchemaDescription, data: &Data) -> (SortedData, ObjectErrors) {
    let mut sorted = SortedData::default();
    let mut errors = ObjectErrors::new();
    for (key, value) in data {
        let Some(category) = description.category(key) else {
            errors.add(
                key.as_str(),
                FieldError::unexpected_key(format!(
                    "`{key}` is not declared on `{}`",
                    description.model
                )),
            );
            continue;
        };
        match sorted.bucket_mut(category) {
            Some(bucket) => {
                bucket.insert(key.clone(), value.clone());
            }
            None => {
                errors.add(
                    key.as_str(),
                    FieldError::unexpected_key(format!(
                        "`{key}` is hidden on `{}`",
                        description.model
                    )),
                );
            }
        }
    }
    (sorted, errors)
}

/// Splits `data` into buckets, failing when any key is rejected.
pub fn sort(description: &SchemaDescription, data: &Data) -> Result<SortedData, ObjectErrors> {
    let (sorted, errors) = partition(description, data);
    errors.into_result().map(|()| sorted)
}

#[cfg(test)]
mod tests {
    use super::{partition, sort};
    use crate::errors::FieldErrorKind;
    use crate::schema::field::{FieldDef, RelationDef, ScalarType};
    use crate::schema::model::{ModelDef, Registry};
    use crate::schema::taxonomy::describe;
    use serde_json::{json, Map, Value};

    fn registry() -> Registry {
        Registry::new([
            ModelDef::new("team", FieldDef::new("id", ScalarType::Int).generated()),
            ModelDef::new("player", FieldDef::new("id", ScalarType::Int).generated())
                .field(FieldDef::new("name", ScalarType::Str))
                .field(FieldDef::new("secret", ScalarType::Str).nullable())
                .relation(RelationDef::foreign_key("team", "team").related_name("players"))
                .hidden("secret")
                .extra_allowed("confirm", ScalarType::Str),
        ])
        .unwrap()
    }

    fn data(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn buckets_follow_categories() {
        let registry = registry();
        let description = describe(&registry, "player").unwrap();
        let sorted = sort(
            description,
            &data(json!({"name": "Ann", "team_id": 1, "confirm": "x"})),
        )
        .unwrap();
        assert_eq!(sorted.scalar.len(), 1);
        assert_eq!(sorted.key.len(), 1);
        assert_eq!(sorted.extra.len(), 1);
        assert_eq!(sorted.iter().count(), 3);

        let team = describe(&registry, "team").unwrap();
        let sorted = sort(team, &data(json!({"players": []}))).unwrap();
        assert_eq!(sorted.reverse_many.len(), 1);
    }

    #[test]
    fn hidden_and_unknown_keys_are_unexpected() {
        let registry = registry();
        let description = describe(&registry, "player").unwrap();
        let (sorted, errors) = partition(
            description,
            &data(json!({"name": "Ann", "secret": "s", "nickname": "A"})),
        );
        assert_eq!(sorted.scalar.len(), 1);
        assert_eq!(errors.len(), 2);
        assert_eq!(
            errors.field("secret").unwrap().kind(),
            &FieldErrorKind::UnexpectedKey
        );
        assert!(errors.field("nickname").is_some());
    }
}

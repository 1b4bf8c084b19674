/*!
Schema ("model") definition and record validation.

Every context save validates the records it is about to push: the entity must
be declared, non-optional attributes must be present and non-null, and each
value must match the declared attribute kind.
*/

use crate::record::{Record, Value};
use crate::{DataStoreError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Kind of value an attribute accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributeKind {
    String,
    Integer,
    Double,
    Boolean,
    /// RFC 3339 timestamp stored as a string
    Date,
    /// Any JSON value
    Json,
}

impl AttributeKind {
    fn accepts(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Double => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Date => value
                .as_str()
                .map_or(false, |s| chrono::DateTime::parse_from_rfc3339(s).is_ok()),
            Self::Json => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeDescription {
    pub name: String,
    pub kind: AttributeKind,
    #[serde(default = "default_optional")]
    pub optional: bool,
}

fn default_optional() -> bool {
    true
}

/// One entity of the schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityDescription {
    pub name: String,
    /// Name of the type that represents this entity in client code
    #[serde(default)]
    pub class_name: Option<String>,
    #[serde(default)]
    pub attributes: Vec<AttributeDescription>,
    /// Attributes whose combined values must be unique across the store
    #[serde(default)]
    pub unique_by: Vec<String>,
}

impl EntityDescription {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            class_name: None,
            attributes: Vec::new(),
            unique_by: Vec::new(),
        }
    }

    pub fn class_name<S: Into<String>>(mut self, class_name: S) -> Self {
        self.class_name = Some(class_name.into());
        self
    }

    /// Declare an optional attribute
    pub fn attribute<S: Into<String>>(mut self, name: S, kind: AttributeKind) -> Self {
        self.attributes.push(AttributeDescription {
            name: name.into(),
            kind,
            optional: true,
        });
        self
    }

    /// Declare a required attribute
    pub fn required<S: Into<String>>(mut self, name: S, kind: AttributeKind) -> Self {
        self.attributes.push(AttributeDescription {
            name: name.into(),
            kind,
            optional: false,
        });
        self
    }

    pub fn unique_by<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.unique_by = attributes.into_iter().map(Into::into).collect();
        self
    }

    pub fn attribute_named(&self, name: &str) -> Option<&AttributeDescription> {
        self.attributes.iter().find(|a| a.name == name)
    }

    /// Class name used for this entity, falling back to the entity name
    pub fn managed_class_name(&self) -> &str {
        self.class_name.as_deref().unwrap_or(&self.name)
    }

    /// Values of the unique attributes, `None` when the entity has no constraint
    pub fn unique_key(&self, record: &Record) -> Option<Vec<Value>> {
        if self.unique_by.is_empty() {
            return None;
        }
        Some(
            self.unique_by
                .iter()
                .map(|key| record.get(key).cloned().unwrap_or(Value::Null))
                .collect(),
        )
    }

    fn validate(&self, record: &Record) -> Result<()> {
        for attribute in &self.attributes {
            match record.get(&attribute.name) {
                None | Some(Value::Null) if !attribute.optional => {
                    return Err(DataStoreError::validation(format!(
                        "{}.{} is required",
                        self.name, attribute.name
                    )));
                }
                Some(value) if !value.is_null() && !attribute.kind.accepts(value) => {
                    return Err(DataStoreError::validation(format!(
                        "{}.{} expects {:?}, got {}",
                        self.name, attribute.name, attribute.kind, value
                    )));
                }
                _ => {}
            }
        }

        if let Some(unknown) = record
            .attributes
            .keys()
            .find(|key| self.attribute_named(key).is_none())
        {
            return Err(DataStoreError::validation(format!(
                "{} has no attribute named {}",
                self.name, unknown
            )));
        }
        Ok(())
    }
}

/// The set of entities a store can hold
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub entities: Vec<EntityDescription>,
}

impl Schema {
    pub fn new(entities: Vec<EntityDescription>) -> Self {
        Self { entities }
    }

    /// Load a schema from a JSON model file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| {
            DataStoreError::store_attach(format!(
                "Failed to read model file {}: {}",
                path.display(),
                e
            ))
        })?;
        let schema: Schema = serde_json::from_str(&contents)?;
        schema.check()?;
        Ok(schema)
    }

    pub fn entity(&self, name: &str) -> Option<&EntityDescription> {
        self.entities.iter().find(|e| e.name == name)
    }

    /// Entity description or `UnknownEntity`
    pub fn require_entity(&self, name: &str) -> Result<&EntityDescription> {
        self.entity(name)
            .ok_or_else(|| DataStoreError::UnknownEntity(name.to_string()))
    }

    /// Validate a record about to be saved
    pub fn validate(&self, record: &Record) -> Result<()> {
        self.require_entity(&record.entity)?.validate(record)
    }

    /// Structural checks on the schema itself
    pub fn check(&self) -> Result<()> {
        for (index, entity) in self.entities.iter().enumerate() {
            if entity.name.is_empty() {
                return Err(DataStoreError::validation("Entity names must not be empty"));
            }
            if self.entities[..index].iter().any(|e| e.name == entity.name) {
                return Err(DataStoreError::validation(format!(
                    "Entity {} is declared twice",
                    entity.name
                )));
            }
            if let Some(missing) = entity
                .unique_by
                .iter()
                .find(|key| entity.attribute_named(key).is_none())
            {
                return Err(DataStoreError::validation(format!(
                    "Unique constraint on {} names unknown attribute {}",
                    entity.name, missing
                )));
            }
        }
        Ok(())
    }
}

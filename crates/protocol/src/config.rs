use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GradientStop {
    pub position: f32,
    pub color: [u8; 4],
}

/// Payload of a shared, externally-owned resource (gradients, palettes).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResourceData {
    Gradient { stops: Vec<GradientStop> },
    Palette { colors: Vec<[u8; 4]> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddedResource {
    pub name: SmolStr,
    pub data: Arc<ResourceData>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Color([u8; 4]),
    /// Name of a resource living in the document's resource library.
    ResourceRef(SmolStr),
    /// A resource copied into the config by [`OperationConfig::snapshot_with_resources`].
    Resource(EmbeddedResource),
}

/// Resolves resource names to their current data.
pub trait ResourceLookup {
    fn lookup(&self, name: &str) -> Option<Arc<ResourceData>>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigSnapshotError {
    #[error("config '{config}' property '{property}' references missing resource '{resource}'")]
    MissingResource {
        config: SmolStr,
        property: SmolStr,
        resource: SmolStr,
    },
}

/// Named key/value description of what an operation computes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationConfig {
    name: SmolStr,
    version: u32,
    properties: BTreeMap<SmolStr, PropertyValue>,
}

impl OperationConfig {
    pub fn new(name: impl Into<SmolStr>) -> Self {
        Self {
            name: name.into(),
            version: 1,
            properties: BTreeMap::new(),
        }
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn with(mut self, key: impl Into<SmolStr>, value: PropertyValue) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: impl Into<SmolStr>, value: PropertyValue) {
        self.properties.insert(key.into(), value);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn get(&self, key: &str) -> Option<&PropertyValue> {
        self.properties.get(key)
    }

    pub fn properties(&self) -> impl Iterator<Item = (&str, &PropertyValue)> {
        self.properties
            .iter()
            .map(|(key, value)| (key.as_str(), value))
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get(key)? {
            PropertyValue::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        match self.get(key)? {
            PropertyValue::Int(value) => Some(*value),
            _ => None,
        }
    }

    /// Integers are accepted and widened.
    pub fn get_float(&self, key: &str) -> Option<f64> {
        match self.get(key)? {
            PropertyValue::Float(value) => Some(*value),
            PropertyValue::Int(value) => Some(*value as f64),
            _ => None,
        }
    }

    pub fn get_color(&self, key: &str) -> Option<[u8; 4]> {
        match self.get(key)? {
            PropertyValue::Color(value) => Some(*value),
            _ => None,
        }
    }

    /// Only embedded resources are returned; a bare reference yields `None`.
    pub fn get_resource(&self, key: &str) -> Option<&Arc<ResourceData>> {
        match self.get(key)? {
            PropertyValue::Resource(embedded) => Some(&embedded.data),
            _ => None,
        }
    }

    pub fn has_unresolved_references(&self) -> bool {
        self.properties
            .values()
            .any(|value| matches!(value, PropertyValue::ResourceRef(_)))
    }

    /// Deep copy in which every resource reference is replaced by the data it
    /// points at right now. Later edits to the library do not reach the copy.
    pub fn snapshot_with_resources(
        &self,
        resources: &dyn ResourceLookup,
    ) -> Result<Self, ConfigSnapshotError> {
        let mut snapshot = self.clone();
        for (key, value) in snapshot.properties.iter_mut() {
            let PropertyValue::ResourceRef(resource_name) = value else {
                continue;
            };
            let resource_name = resource_name.clone();
            let Some(data) = resources.lookup(&resource_name) else {
                return Err(ConfigSnapshotError::MissingResource {
                    config: self.name.clone(),
                    property: key.clone(),
                    resource: resource_name,
                });
            };
            *value = PropertyValue::Resource(EmbeddedResource {
                name: resource_name,
                data: Arc::new(ResourceData::clone(&data)),
            });
        }
        Ok(snapshot)
    }
}

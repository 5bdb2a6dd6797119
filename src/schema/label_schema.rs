use crate::element::PropertyMap;
use crate::label::Label;
use crate::schema::DataType;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

/// What has been observed about one property of one label.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertySchema {
    name: String,
    data_type: DataType,
    all_types: BTreeSet<DataType>,
    multi_value: bool,
    /// Set when read back from a persisted schema that marked it nullable
    nullable: bool,
    observations: u64,
}

impl PropertySchema {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            data_type: DataType::None,
            all_types: BTreeSet::new(),
            multi_value: false,
            nullable: false,
            observations: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn all_types(&self) -> &BTreeSet<DataType> {
        &self.all_types
    }

    pub fn is_multi_value(&self) -> bool {
        self.multi_value
    }

    pub fn observations(&self) -> u64 {
        self.observations
    }

    fn observe(&mut self, value: &Value) {
        if value.is_array() {
            self.multi_value = true;
        }
        self.record_type(DataType::for_value(value));
        self.observations += 1;
    }

    fn record_type(&mut self, data_type: DataType) {
        if data_type != DataType::None {
            self.data_type = self.data_type.widen(data_type);
            self.all_types.insert(data_type);
        }
    }

    fn union(&mut self, other: &PropertySchema) {
        for t in &other.all_types {
            self.record_type(*t);
        }
        self.data_type = self.data_type.widen(other.data_type);
        self.multi_value |= other.multi_value;
        self.nullable |= other.nullable;
        self.observations += other.observations;
    }
}

/// Structural schema of one label: ordered columns plus their observed types.
///
/// Column order is first-seen order and never changes; it is the order rows are
/// written in. Nullability is derived: a property is nullable when fewer
/// elements carried it than the label has elements.
#[derive(Debug, Clone)]
pub struct LabelSchema {
    label: Label,
    properties: Vec<PropertySchema>,
    index: FxHashMap<String, usize>,
    element_count: u64,
}

impl LabelSchema {
    pub fn new(label: Label) -> Self {
        Self {
            label,
            properties: Vec::new(),
            index: FxHashMap::default(),
            element_count: 0,
        }
    }

    /// Same columns and types as `other`, but no observations.
    pub fn columns_of(other: &LabelSchema) -> Self {
        let mut schema = Self::new(other.label.clone());
        for property in &other.properties {
            let column = schema.column_mut(&property.name);
            column.data_type = property.data_type;
            column.all_types = property.all_types.clone();
            column.multi_value = property.multi_value;
        }
        schema
    }

    pub fn label(&self) -> &Label {
        &self.label
    }

    pub fn element_count(&self) -> u64 {
        self.element_count
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    pub fn properties(&self) -> impl Iterator<Item = &PropertySchema> {
        self.properties.iter()
    }

    pub fn property(&self, name: &str) -> Option<&PropertySchema> {
        self.index.get(name).map(|&i| &self.properties[i])
    }

    pub fn has_property(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn is_nullable(&self, property: &PropertySchema) -> bool {
        property.nullable || property.observations < self.element_count
    }

    /// Records one element. Returns true when it introduced a new column.
    pub fn update(&mut self, properties: &PropertyMap, allow_tokens: bool) -> bool {
        self.element_count += 1;
        let columns_before = self.properties.len();
        for (name, value) in properties {
            if value.is_null() || (!allow_tokens && name.starts_with('~')) {
                continue;
            }
            self.column_mut(name).observe(value);
        }
        self.properties.len() > columns_before
    }

    /// Widens this schema with everything recorded in `other`.
    pub fn union(&mut self, other: &LabelSchema) {
        for property in &other.properties {
            self.column_mut(&property.name).union(property);
        }
        self.element_count += other.element_count;
    }

    /// True when both schemas would produce the same header.
    pub fn same_columns(&self, other: &LabelSchema) -> bool {
        self.properties.len() == other.properties.len()
            && self.properties.iter().zip(&other.properties).all(|(a, b)| {
                a.name == b.name && a.data_type == b.data_type && a.multi_value == b.multi_value
            })
    }

    fn column_mut(&mut self, name: &str) -> &mut PropertySchema {
        let index = match self.index.get(name) {
            Some(&i) => i,
            None => {
                self.properties.push(PropertySchema::new(name));
                let i = self.properties.len() - 1;
                self.index.insert(name.to_string(), i);
                i
            }
        };
        &mut self.properties[index]
    }
}

impl PartialEq for LabelSchema {
    fn eq(&self, other: &Self) -> bool {
        self.label == other.label
            && self.element_count == other.element_count
            && self.properties == other.properties
    }
}

#[derive(Serialize, Deserialize)]
struct PropertySchemaJson {
    property: String,
    #[serde(rename = "dataType")]
    data_type: DataType,
    #[serde(rename = "isMultiValue")]
    is_multi_value: bool,
    #[serde(rename = "isNullable")]
    is_nullable: bool,
    #[serde(rename = "allTypes")]
    all_types: Vec<DataType>,
}

#[derive(Serialize, Deserialize)]
struct LabelSchemaJson {
    label: Label,
    #[serde(default)]
    properties: Vec<PropertySchemaJson>,
}

impl Serialize for LabelSchema {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let json = LabelSchemaJson {
            label: self.label.clone(),
            properties: self
                .properties
                .iter()
                .map(|p| PropertySchemaJson {
                    property: p.name.clone(),
                    data_type: p.data_type,
                    is_multi_value: p.multi_value,
                    is_nullable: self.is_nullable(p),
                    all_types: p.all_types.iter().copied().collect(),
                })
                .collect(),
        };
        json.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for LabelSchema {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let json = LabelSchemaJson::deserialize(deserializer)?;
        let mut schema = LabelSchema::new(json.label);
        for p in json.properties {
            let column = schema.column_mut(&p.property);
            column.data_type = p.data_type;
            column.all_types = p.all_types.into_iter().collect();
            column.multi_value = p.is_multi_value;
            column.nullable = p.is_nullable;
        }
        Ok(schema)
    }
}

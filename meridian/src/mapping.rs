//! Index mappings: field name → type + analyzer.
//!
//! The mapping is part of the index metadata and is immutable per field once
//! created (new fields may be added through a metadata update; changing an
//! existing field's type is rejected). Analyzers are opaque tokenizer names
//! resolved by tantivy's tokenizer registry.

use crate::document::Document;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tantivy::schema::{
    Field, IndexRecordOption, NumericOptions, Schema, TextFieldIndexing, TextOptions, STORED,
    STRING,
};
use tantivy::TantivyDocument;

/// Reserved system field names.
pub const ID_FIELD: &str = "_id";
pub const SOURCE_FIELD: &str = "_source";
pub const SEQ_NO_FIELD: &str = "_seq_no";
pub const VERSION_FIELD: &str = "_version";

/// Supported field types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    /// Analyzed full-text field.
    Text,
    /// Untokenized exact-match field, fast-field backed for aggregations.
    Keyword,
    /// Signed 64-bit integer.
    Long,
    /// 64-bit float.
    Double,
    Bool,
    /// Epoch milliseconds stored as a long.
    Date,
}

/// A single field definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMapping {
    #[serde(rename = "type")]
    pub field_type: FieldType,
    /// Tokenizer name for text fields; ignored for the rest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analyzer: Option<String>,
}

impl FieldMapping {
    pub fn text() -> Self {
        Self {
            field_type: FieldType::Text,
            analyzer: None,
        }
    }

    pub fn keyword() -> Self {
        Self {
            field_type: FieldType::Keyword,
            analyzer: None,
        }
    }

    pub fn of(field_type: FieldType) -> Self {
        Self {
            field_type,
            analyzer: None,
        }
    }
}

/// The mapping for one index: an ordered map of field definitions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMapping {
    #[serde(default)]
    pub properties: BTreeMap<String, FieldMapping>,
}

impl IndexMapping {
    pub fn builder() -> IndexMappingBuilder {
        IndexMappingBuilder::default()
    }

    pub fn field(&self, name: &str) -> Option<&FieldMapping> {
        self.properties.get(name)
    }

    /// Merge new fields into this mapping. Changing the type of an existing
    /// field is rejected.
    pub fn merge(&self, other: &IndexMapping) -> Result<IndexMapping> {
        let mut merged = self.clone();
        for (name, def) in &other.properties {
            match merged.properties.get(name) {
                Some(existing) if existing.field_type != def.field_type => {
                    return Err(Error::Mapping(format!(
                        "cannot change type of field [{}] from {:?} to {:?}",
                        name, existing.field_type, def.field_type
                    )));
                }
                _ => {
                    merged.properties.insert(name.clone(), def.clone());
                }
            }
        }
        Ok(merged)
    }

    pub fn validate(&self) -> Result<()> {
        for name in self.properties.keys() {
            if name.starts_with('_') {
                return Err(Error::Mapping(format!(
                    "field name [{}] collides with the reserved system namespace",
                    name
                )));
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct IndexMappingBuilder {
    properties: BTreeMap<String, FieldMapping>,
}

impl IndexMappingBuilder {
    pub fn field(mut self, name: impl Into<String>, mapping: FieldMapping) -> Self {
        self.properties.insert(name.into(), mapping);
        self
    }

    pub fn build(self) -> IndexMapping {
        IndexMapping {
            properties: self.properties,
        }
    }
}

/// The mapping compiled against a concrete tantivy schema: resolved `Field`
/// handles for every mapped field plus the system fields.
pub struct FieldRegistry {
    pub schema: Schema,
    pub mapping: IndexMapping,
    fields: HashMap<String, Field>,
    pub id_field: Field,
    pub source_field: Field,
    pub seq_no_field: Field,
    pub version_field: Field,
}

impl FieldRegistry {
    /// Build the tantivy schema for a mapping.
    pub fn compile(mapping: &IndexMapping) -> Result<FieldRegistry> {
        mapping.validate()?;
        let mut builder = Schema::builder();
        let mut fields = HashMap::new();

        let id_field = builder.add_text_field(ID_FIELD, STRING | STORED);
        let source_field = builder.add_bytes_field(SOURCE_FIELD, STORED);
        let seq_no_field = builder.add_u64_field(
            SEQ_NO_FIELD,
            NumericOptions::default().set_indexed().set_fast().set_stored(),
        );
        let version_field = builder.add_u64_field(
            VERSION_FIELD,
            NumericOptions::default().set_fast().set_stored(),
        );

        for (name, def) in &mapping.properties {
            let field = match def.field_type {
                FieldType::Text => {
                    let tokenizer = def.analyzer.as_deref().unwrap_or("default");
                    let options = TextOptions::default().set_indexing_options(
                        TextFieldIndexing::default()
                            .set_tokenizer(tokenizer)
                            .set_index_option(IndexRecordOption::WithFreqsAndPositions),
                    );
                    builder.add_text_field(name, options)
                }
                FieldType::Keyword => {
                    let options = TextOptions::default()
                        .set_indexing_options(
                            TextFieldIndexing::default()
                                .set_tokenizer("raw")
                                .set_index_option(IndexRecordOption::Basic),
                        )
                        .set_fast(Some("raw"));
                    builder.add_text_field(name, options)
                }
                FieldType::Long | FieldType::Date => builder.add_i64_field(
                    name,
                    NumericOptions::default().set_indexed().set_fast(),
                ),
                FieldType::Double => builder.add_f64_field(
                    name,
                    NumericOptions::default().set_indexed().set_fast(),
                ),
                FieldType::Bool => builder
                    .add_bool_field(name, NumericOptions::default().set_indexed()),
            };
            fields.insert(name.clone(), field);
        }

        Ok(FieldRegistry {
            schema: builder.build(),
            mapping: mapping.clone(),
            fields,
            id_field,
            source_field,
            seq_no_field,
            version_field,
        })
    }

    pub fn field(&self, name: &str) -> Option<Field> {
        match name {
            ID_FIELD => Some(self.id_field),
            SEQ_NO_FIELD => Some(self.seq_no_field),
            _ => self.fields.get(name).copied(),
        }
    }

    pub fn field_type(&self, name: &str) -> Option<FieldType> {
        self.mapping.field(name).map(|m| m.field_type)
    }

    /// Convert a document into a tantivy document according to the mapping.
    ///
    /// Unmapped fields in the source are a validation error; the mapping is
    /// the single authority on the indexed shape.
    pub fn extract(&self, doc: &Document, seq_no: u64, version: u64) -> Result<TantivyDocument> {
        let obj = doc.source.as_object().ok_or_else(|| {
            Error::Validation(format!("document [{}] source must be an object", doc.id))
        })?;

        let mut out = TantivyDocument::new();
        out.add_text(self.id_field, &doc.id);
        out.add_bytes(self.source_field, serde_json::to_vec(&doc.source)?);
        out.add_u64(self.seq_no_field, seq_no);
        out.add_u64(self.version_field, version);

        for (name, value) in obj {
            let def = self.mapping.field(name).ok_or_else(|| {
                Error::Validation(format!(
                    "document [{}] has unmapped field [{}]",
                    doc.id, name
                ))
            })?;
            let field = self.fields[name];
            match value {
                Value::Array(items) => {
                    for item in items {
                        self.add_value(&mut out, &doc.id, name, field, def.field_type, item)?;
                    }
                }
                Value::Null => {}
                other => self.add_value(&mut out, &doc.id, name, field, def.field_type, other)?,
            }
        }
        Ok(out)
    }

    fn add_value(
        &self,
        out: &mut TantivyDocument,
        doc_id: &str,
        name: &str,
        field: Field,
        field_type: FieldType,
        value: &Value,
    ) -> Result<()> {
        let type_error = || {
            Error::Validation(format!(
                "document [{}] field [{}] value {:?} does not match mapped type {:?}",
                doc_id, name, value, field_type
            ))
        };
        match (field_type, value) {
            (FieldType::Text, Value::String(s)) | (FieldType::Keyword, Value::String(s)) => {
                out.add_text(field, s);
            }
            (FieldType::Long, Value::Number(n)) | (FieldType::Date, Value::Number(n)) => {
                let v = n.as_i64().ok_or_else(type_error)?;
                out.add_i64(field, v);
            }
            (FieldType::Double, Value::Number(n)) => {
                let v = n.as_f64().ok_or_else(type_error)?;
                out.add_f64(field, v);
            }
            (FieldType::Bool, Value::Bool(b)) => {
                out.add_bool(field, *b);
            }
            _ => return Err(type_error()),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_mapping() -> IndexMapping {
        IndexMapping::builder()
            .field("body", FieldMapping::text())
            .field("tag", FieldMapping::keyword())
            .field("price", FieldMapping::of(FieldType::Long))
            .field("score", FieldMapping::of(FieldType::Double))
            .field("active", FieldMapping::of(FieldType::Bool))
            .build()
    }

    #[test]
    fn test_compile_registers_system_fields() {
        let registry = FieldRegistry::compile(&sample_mapping()).unwrap();
        assert!(registry.field("body").is_some());
        assert!(registry.field(ID_FIELD).is_some());
        assert!(registry.field("missing").is_none());
        assert_eq!(registry.field_type("tag"), Some(FieldType::Keyword));
    }

    #[test]
    fn test_extract_rejects_unmapped_field() {
        let registry = FieldRegistry::compile(&sample_mapping()).unwrap();
        let doc = Document::new("1", json!({"body": "hello", "bogus": 1}));
        let err = registry.extract(&doc, 0, 1).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_extract_rejects_type_mismatch() {
        let registry = FieldRegistry::compile(&sample_mapping()).unwrap();
        let doc = Document::new("1", json!({"price": "not a number"}));
        assert!(registry.extract(&doc, 0, 1).is_err());
    }

    #[test]
    fn test_extract_accepts_arrays_and_nulls() {
        let registry = FieldRegistry::compile(&sample_mapping()).unwrap();
        let doc = Document::new(
            "1",
            json!({"tag": ["a", "b"], "body": "text", "active": true, "score": null}),
        );
        assert!(registry.extract(&doc, 3, 1).is_ok());
    }

    #[test]
    fn test_source_must_be_object() {
        let registry = FieldRegistry::compile(&sample_mapping()).unwrap();
        let doc = Document::new("1", json!("just a string"));
        assert!(registry.extract(&doc, 0, 1).is_err());
    }

    #[test]
    fn test_merge_rejects_type_change() {
        let a = sample_mapping();
        let b = IndexMapping::builder()
            .field("price", FieldMapping::of(FieldType::Double))
            .build();
        assert!(a.merge(&b).is_err());

        let c = IndexMapping::builder()
            .field("title", FieldMapping::text())
            .build();
        let merged = a.merge(&c).unwrap();
        assert!(merged.field("title").is_some());
        assert!(merged.field("price").is_some());
    }

    #[test]
    fn test_reserved_namespace_rejected() {
        let m = IndexMapping::builder()
            .field("_hidden", FieldMapping::text())
            .build();
        assert!(m.validate().is_err());
    }

    #[test]
    fn test_mapping_serde_roundtrip() {
        let m = sample_mapping();
        let json = serde_json::to_string(&m).unwrap();
        let back: IndexMapping = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m);
    }
}

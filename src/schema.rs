//! Inference of a typed record schema from a card's column metadata.

use std::{collections::BTreeMap, fmt, str::FromStr, sync::LazyLock};

use regex::Regex;
use serde::{Serialize, Serializer, ser::SerializeMap as _};
use tracing::debug;

use crate::{Error, card::Card};

static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^[A-Za-z_][A-Za-z0-9_]*$").expect("valid regex"));

/// The column types the BI tool reports, taken from the second segment of a
/// base type tag such as `type/Integer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceType {
    /// `type/Text`
    Text,
    /// `type/Integer`
    Integer,
    /// `type/Float`
    Float,
    /// `type/Decimal`
    Decimal,
    /// `type/BigInteger`
    BigInteger,
    /// `type/Date`
    Date,
    /// `type/DateTime`
    DateTime,
}

impl FromStr for SourceType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "Text" => Self::Text,
            "Integer" => Self::Integer,
            "Float" => Self::Float,
            "Decimal" => Self::Decimal,
            "BigInteger" => Self::BigInteger,
            "Date" => Self::Date,
            "DateTime" => Self::DateTime,
            _ => return Err(Error::UnsupportedType(s.to_owned())),
        })
    }
}

impl SourceType {
    /// Parse a full base type tag, e.g. `type/DateTime`.
    pub fn from_base_type(base_type: &str) -> Result<Self, Error> {
        match base_type.split('/').nth(1) {
            Some(tag) => tag.parse(),
            None => Err(Error::UnsupportedType(base_type.to_owned())),
        }
    }

    /// The output primitive this column type is stored as.
    pub fn primitive(self) -> Primitive {
        match self {
            Self::Text => Primitive::String,
            Self::Integer => Primitive::Int,
            Self::Float => Primitive::Double,
            Self::Decimal | Self::BigInteger => Primitive::Long,
            Self::Date | Self::DateTime => Primitive::TimestampMicros,
        }
    }
}

/// A primitive type in the output schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Primitive {
    /// UTF-8 string.
    String,
    /// 32-bit signed integer.
    Int,
    /// 64-bit signed integer.
    Long,
    /// 64-bit float.
    Double,
    /// Microseconds since the epoch, stored as a long.
    TimestampMicros,
}

impl fmt::Display for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Primitive::String => "string",
            Primitive::Int => "int",
            Primitive::Long => "long",
            Primitive::Double => "double",
            Primitive::TimestampMicros => "timestamp-micros",
        })
    }
}

impl Serialize for Primitive {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Primitive::TimestampMicros => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("type", "long")?;
                map.serialize_entry("logicalType", "timestamp-micros")?;
                map.end()
            }
            other => serializer.collect_str(other),
        }
    }
}

/// The type of a field: a primitive, optionally in a union with null.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldType {
    /// The underlying type.
    pub primitive: Primitive,
    /// Whether null is allowed. Serialized as `["null", <primitive>]`.
    pub nullable: bool,
}

impl FieldType {
    /// A non-nullable field type.
    pub fn required(primitive: Primitive) -> Self {
        Self {
            primitive,
            nullable: false,
        }
    }

    /// A field type in a union with null.
    pub fn nullable(primitive: Primitive) -> Self {
        Self {
            primitive,
            nullable: true,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.nullable {
            write!(f, "[null, {}]", self.primitive)
        } else {
            write!(f, "{}", self.primitive)
        }
    }
}

impl Serialize for FieldType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.nullable {
            ("null", self.primitive).serialize(serializer)
        } else {
            self.primitive.serialize(serializer)
        }
    }
}

/// A field of the output record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchemaField {
    /// The field name, after renaming.
    pub name: String,
    /// The field type.
    #[serde(rename = "type")]
    pub field_type: FieldType,
    /// The column's display name. Raw rows are keyed by this.
    pub doc: String,
}

/// An ordered record schema, serialized in the Avro schema JSON format.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename = "record")]
pub struct RecordSchema {
    /// The record name.
    pub name: String,
    /// The fields, in column order.
    pub fields: Vec<SchemaField>,
}

impl RecordSchema {
    /// Parse this schema with the encoder.
    pub fn to_avro(&self) -> Result<apache_avro::Schema, Error> {
        validate_names(self)?;

        let json = serde_json::to_value(self)?;
        apache_avro::Schema::parse(&json).map_err(|e| self.map_avro_error(e))
    }

    /// Look up a field by name.
    pub fn field(&self, name: &str) -> Option<&SchemaField> {
        self.fields.iter().find(|f| f.name == name)
    }

    // The encoder reports illegal identifiers only through its message.
    fn map_avro_error(&self, e: apache_avro::Error) -> Error {
        let msg = e.to_string();
        if !msg.to_lowercase().contains("field name") {
            return e.into();
        }

        let name = self
            .fields
            .iter()
            .map(|f| f.name.as_str())
            .find(|n| msg.contains(n))
            .unwrap_or(msg.as_str());

        Error::InvalidFieldName {
            name: name.to_owned(),
        }
    }
}

/// Build a record schema from a card's column metadata.
///
/// Each column becomes one field, in order. Field names are taken from
/// `rename` (keyed by the original column name) when present. A column with
/// any observed nulls becomes nullable.
pub fn infer_schema(
    card_id: u64,
    card: &Card,
    rename: &BTreeMap<String, String>,
) -> Result<RecordSchema, Error> {
    let columns = card
        .result_metadata
        .as_ref()
        .ok_or(Error::MissingMetadata(card_id))?;

    let fields = columns
        .iter()
        .map(|col| {
            let primitive = SourceType::from_base_type(&col.base_type)?.primitive();
            let field_type = FieldType {
                primitive,
                nullable: col.nil_ratio() > 0.0,
            };

            let name = match rename.get(&col.name) {
                Some(renamed) if !renamed.is_empty() => renamed.clone(),
                _ => col.name.clone(),
            };

            Ok(SchemaField {
                name,
                field_type,
                doc: col.display_name.clone(),
            })
        })
        .collect::<Result<Vec<_>, Error>>()?;

    debug!(card_id, fields = fields.len(), "inferred schema");
    Ok(RecordSchema {
        name: card.name.clone(),
        fields,
    })
}

/// Strip everything but ASCII letters and digits.
pub fn sanitize_name(name: &str) -> String {
    name.chars().filter(char::is_ascii_alphanumeric).collect()
}

/// The record name used for a card's export.
pub fn export_schema_name(card_id: u64, card_name: &str) -> String {
    format!("export_card_{card_id}_{}", sanitize_name(card_name))
}

/// Check that the record name and every field name are legal identifiers.
pub fn validate_names(schema: &RecordSchema) -> Result<(), Error> {
    std::iter::once(&schema.name)
        .chain(schema.fields.iter().map(|f| &f.name))
        .find(|name| !IDENTIFIER.is_match(name))
        .map_or(Ok(()), |name| {
            Err(Error::InvalidFieldName {
                name: name.to_owned(),
            })
        })
}

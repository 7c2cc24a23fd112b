//! Table schema representation.
//!
//! Field names are opaque identifiers: a name such as `a.b` is a single
//! top-level column, never a path into a struct.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Primitive column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimitiveType {
    /// Boolean type
    Boolean,
    /// 32-bit integer
    Int,
    /// 64-bit integer
    Long,
    /// 32-bit float
    Float,
    /// 64-bit double
    Double,
    /// Fixed-point decimal
    Decimal {
        /// Total number of digits
        precision: u8,
        /// Digits after the decimal point
        scale: u8,
    },
    /// Date (days since epoch)
    Date,
    /// Time (microseconds since midnight)
    Time,
    /// Timestamp without timezone
    Timestamp,
    /// Timestamp with timezone
    TimestampTz,
    /// String type
    String,
    /// UUID type
    Uuid,
    /// Binary data
    Binary,
}

impl fmt::Display for PrimitiveType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrimitiveType::Boolean => f.write_str("boolean"),
            PrimitiveType::Int => f.write_str("int"),
            PrimitiveType::Long => f.write_str("long"),
            PrimitiveType::Float => f.write_str("float"),
            PrimitiveType::Double => f.write_str("double"),
            PrimitiveType::Decimal { precision, scale } => {
                write!(f, "decimal({},{})", precision, scale)
            }
            PrimitiveType::Date => f.write_str("date"),
            PrimitiveType::Time => f.write_str("time"),
            PrimitiveType::Timestamp => f.write_str("timestamp"),
            PrimitiveType::TimestampTz => f.write_str("timestamptz"),
            PrimitiveType::String => f.write_str("string"),
            PrimitiveType::Uuid => f.write_str("uuid"),
            PrimitiveType::Binary => f.write_str("binary"),
        }
    }
}

/// Column type, primitive or complex.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    /// Primitive value
    Primitive(PrimitiveType),
    /// Nested struct
    Struct(StructType),
    /// List of elements
    List(ListType),
    /// Key/value map
    Map(MapType),
}

impl FieldType {
    /// Whether this is a struct, list or map.
    pub fn is_complex(&self) -> bool {
        !matches!(self, FieldType::Primitive(_))
    }

    /// Highest field id nested inside this type.
    pub fn highest_field_id(&self) -> i32 {
        match self {
            FieldType::Primitive(_) => 0,
            FieldType::Struct(s) => s.highest_field_id(),
            FieldType::List(l) => l.element_id.max(l.element.highest_field_id()),
            FieldType::Map(m) => m
                .key_id
                .max(m.value_id)
                .max(m.key.highest_field_id())
                .max(m.value.highest_field_id()),
        }
    }
}

impl From<PrimitiveType> for FieldType {
    fn from(p: PrimitiveType) -> Self {
        FieldType::Primitive(p)
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::Primitive(p) => write!(f, "{}", p),
            FieldType::Struct(s) => {
                f.write_str("struct<")?;
                for (i, field) in s.fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{}:{}", field.name, field.field_type)?;
                }
                f.write_str(">")
            }
            FieldType::List(l) => write!(f, "list<{}>", l.element),
            FieldType::Map(m) => write!(f, "map<{},{}>", m.key, m.value),
        }
    }
}

/// Struct type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructType {
    /// Ordered fields
    pub fields: Vec<Field>,
}

impl StructType {
    /// Create a struct from fields.
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    /// Find a field by exact name.
    pub fn field_by_name(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Highest field id in this struct, including nested fields.
    pub fn highest_field_id(&self) -> i32 {
        self.fields
            .iter()
            .map(|f| f.id.max(f.field_type.highest_field_id()))
            .max()
            .unwrap_or(0)
    }
}

/// List type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListType {
    /// Field id of the element
    pub element_id: i32,
    /// Whether elements are required
    pub element_required: bool,
    /// Element type
    pub element: Box<FieldType>,
}

/// Map type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapType {
    /// Field id of the key
    pub key_id: i32,
    /// Key type
    pub key: Box<FieldType>,
    /// Field id of the value
    pub value_id: i32,
    /// Whether values are required
    pub value_required: bool,
    /// Value type
    pub value: Box<FieldType>,
}

/// A named, typed column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    /// Field id
    pub id: i32,
    /// Field name
    pub name: String,
    /// Whether the field is required
    pub required: bool,
    /// Field type
    #[serde(rename = "type")]
    pub field_type: FieldType,
    /// Optional documentation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<String>,
}

impl Field {
    /// Create a required field.
    pub fn required(id: i32, name: impl Into<String>, field_type: impl Into<FieldType>) -> Self {
        Self {
            id,
            name: name.into(),
            required: true,
            field_type: field_type.into(),
            doc: None,
        }
    }

    /// Create an optional field.
    pub fn optional(id: i32, name: impl Into<String>, field_type: impl Into<FieldType>) -> Self {
        Self {
            id,
            name: name.into(),
            required: false,
            field_type: field_type.into(),
            doc: None,
        }
    }
}

/// A versioned table schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    /// Schema id
    pub schema_id: i32,
    /// Top-level fields
    pub fields: Vec<Field>,
}

impl Schema {
    /// Create a schema.
    pub fn new(schema_id: i32, fields: Vec<Field>) -> Self {
        Self { schema_id, fields }
    }

    /// An empty schema.
    pub fn empty() -> Self {
        Self::new(0, Vec::new())
    }

    /// Find a top-level field by exact name.
    pub fn field_by_name(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Highest field id, including nested fields.
    pub fn highest_field_id(&self) -> i32 {
        self.fields
            .iter()
            .map(|f| f.id.max(f.field_type.highest_field_id()))
            .max()
            .unwrap_or(0)
    }

    /// Whether two schemas have the same columns, ignoring the schema id.
    pub fn same_columns(&self, other: &Schema) -> bool {
        self.fields == other.fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nested_schema() -> Schema {
        Schema::new(
            1,
            vec![
                Field::required(1, "id", PrimitiveType::Long),
                Field::optional(
                    2,
                    "tags",
                    FieldType::List(ListType {
                        element_id: 5,
                        element_required: false,
                        element: Box::new(PrimitiveType::String.into()),
                    }),
                ),
                Field::optional(
                    3,
                    "location",
                    FieldType::Struct(StructType::new(vec![
                        Field::required(6, "lat", PrimitiveType::Double),
                        Field::required(7, "lon", PrimitiveType::Double),
                    ])),
                ),
            ],
        )
    }

    #[test]
    fn test_highest_field_id_includes_nested() {
        assert_eq!(nested_schema().highest_field_id(), 7);
        assert_eq!(Schema::empty().highest_field_id(), 0);
    }

    #[test]
    fn test_type_display() {
        let schema = nested_schema();
        assert_eq!(schema.fields[1].field_type.to_string(), "list<string>");
        assert_eq!(
            schema.fields[2].field_type.to_string(),
            "struct<lat:double,lon:double>"
        );
        let decimal = PrimitiveType::Decimal {
            precision: 10,
            scale: 2,
        };
        assert_eq!(decimal.to_string(), "decimal(10,2)");
    }

    #[test]
    fn test_dotted_names_are_opaque() {
        let schema = Schema::new(0, vec![Field::optional(1, "a.b", PrimitiveType::Int)]);
        assert!(schema.field_by_name("a.b").is_some());
        assert!(schema.field_by_name("a").is_none());
    }

    #[test]
    fn test_schema_serde_round_trip() {
        let schema = nested_schema();
        let json = serde_json::to_string(&schema).unwrap();
        let parsed: Schema = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, schema);
    }
}

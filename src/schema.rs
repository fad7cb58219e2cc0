use serde_json::Value;

pub const TABLE_NAME: &str = "data";
pub const DEVICE_FIELD: &str = "mmsi";
pub const TIMESTAMP_FIELD: &str = "timestamp";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Text,
    Integer,
    Real,
}

impl FieldType {
    fn sql(self) -> &'static str {
        match self {
            FieldType::Text => "TEXT",
            FieldType::Integer => "INTEGER",
            FieldType::Real => "REAL",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaField {
    pub name: &'static str,
    pub field_type: FieldType,
    pub primary_key: bool,
}

impl SchemaField {
    const fn key(name: &'static str, field_type: FieldType) -> Self {
        Self {
            name,
            field_type,
            primary_key: true,
        }
    }

    const fn real(name: &'static str) -> Self {
        Self {
            name,
            field_type: FieldType::Real,
            primary_key: false,
        }
    }
}

/// A value after coercion to the declared column type.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// Explicit "no value"; distinct from the field being absent.
    Null,
    Text(String),
    Integer(i64),
    Real(f64),
}

impl From<FieldValue> for Value {
    fn from(value: FieldValue) -> Self {
        match value {
            FieldValue::Null => Value::Null,
            FieldValue::Text(text) => Value::String(text),
            FieldValue::Integer(n) => Value::from(n),
            FieldValue::Real(n) => serde_json::Number::from_f64(n)
                .map(Value::Number)
                .unwrap_or(Value::Null),
        }
    }
}

const VESSEL_FIELDS: &[SchemaField] = &[
    SchemaField::key(DEVICE_FIELD, FieldType::Text),
    SchemaField::key(TIMESTAMP_FIELD, FieldType::Integer),
    SchemaField::real("awa"),
    SchemaField::real("aws_knots"),
    SchemaField::real("cog_true"),
    SchemaField::real("dew_point_celsius"),
    SchemaField::real("hdg_true"),
    SchemaField::real("humidity_relative"),
    SchemaField::real("latitude"),
    SchemaField::real("longitude"),
    SchemaField::real("pressure_millibars"),
    SchemaField::real("rate_of_turn"),
    SchemaField::real("rudder_angle"),
    SchemaField::real("sog_knots"),
    SchemaField::real("temperature_air_celsius"),
    SchemaField::real("temperature_water_celsius"),
    SchemaField::real("twd_true"),
    SchemaField::real("tws_knots"),
    SchemaField::real("water_depth_meters"),
];

/// The set of persistable fields and how raw values are coerced into them.
///
/// Consulted by the accumulator to reject unknown fields and by the store
/// immediately before every write.
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    fields: Vec<SchemaField>,
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::vessel()
    }
}

impl SchemaRegistry {
    pub fn new(fields: Vec<SchemaField>) -> Self {
        Self { fields }
    }

    pub fn vessel() -> Self {
        Self::new(VESSEL_FIELDS.to_vec())
    }

    pub fn fields(&self) -> &[SchemaField] {
        &self.fields
    }

    /// Fields that are stored as regular columns, i.e. everything outside the key.
    pub fn value_fields(&self) -> impl Iterator<Item = &SchemaField> {
        self.fields.iter().filter(|field| !field.primary_key)
    }

    pub fn type_of(&self, name: &str) -> Option<FieldType> {
        self.fields
            .iter()
            .find(|field| field.name == name)
            .map(|field| field.field_type)
    }

    pub fn is_value_field(&self, name: &str) -> bool {
        self.value_fields().any(|field| field.name == name)
    }

    /// Coerces `raw` to the declared type of `name`. `None` means the field is dropped.
    pub fn coerce(&self, name: &str, raw: &Value) -> Option<FieldValue> {
        let declared = self.type_of(name)?;
        if raw.is_null() {
            return Some(FieldValue::Null);
        }
        match declared {
            FieldType::Text => Some(FieldValue::Text(stringify(raw))),
            FieldType::Integer => to_finite(raw).map(|n| FieldValue::Integer(n.trunc() as i64)),
            FieldType::Real => to_finite(raw).map(FieldValue::Real),
        }
    }

    pub fn create_table_sql(&self) -> String {
        let mut columns: Vec<String> = self
            .fields
            .iter()
            .map(|field| format!("{} {}", field.name, field.field_type.sql()))
            .collect();
        let key: Vec<&str> = self
            .fields
            .iter()
            .filter(|field| field.primary_key)
            .map(|field| field.name)
            .collect();
        if !key.is_empty() {
            columns.push(format!("PRIMARY KEY ({})", key.join(", ")));
        }
        format!(
            "CREATE TABLE IF NOT EXISTS {TABLE_NAME} (\n    {}\n)",
            columns.join(",\n    ")
        )
    }
}

fn stringify(raw: &Value) -> String {
    match raw {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn to_finite(raw: &Value) -> Option<f64> {
    let n = match raw {
        Value::Number(n) => n.as_f64()?,
        Value::Bool(flag) => f64::from(u8::from(*flag)),
        Value::String(text) => {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                return None;
            }
            trimmed.parse::<f64>().ok()?
        }
        Value::Null | Value::Array(_) | Value::Object(_) => return None,
    };
    n.is_finite().then_some(n)
}

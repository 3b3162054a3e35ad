//! The click event record and its permissive JSON decoding.
//!
//! Decoding never fails. A payload that is missing, not JSON, or not a JSON object
//! produces a record with every field null; a single field that is missing or has the
//! wrong type is null on its own while the other fields still populate.

use std::sync::Arc;

use arrow::array::{ArrayRef, Float32Builder, Int32Builder, StringBuilder};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Integer,
    Float,
}

impl FieldType {
    pub fn arrow_type(self) -> DataType {
        match self {
            FieldType::String => DataType::Utf8,
            FieldType::Integer => DataType::Int32,
            FieldType::Float => DataType::Float32,
        }
    }

    /// Type name as it appears in Delta schema strings and schema trees.
    pub fn type_name(self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Integer => "integer",
            FieldType::Float => "float",
        }
    }
}

/// Column order of the click event schema.
pub const FIELDS: [(&str, FieldType); 9] = [
    ("click_id", FieldType::String),
    ("user_id", FieldType::Integer),
    ("product_id", FieldType::String),
    ("product", FieldType::String),
    ("price", FieldType::Float),
    ("url", FieldType::String),
    ("user_agent", FieldType::String),
    ("ip_address", FieldType::String),
    // Kept as raw text; it is never parsed into a timestamp.
    ("datetime_occured", FieldType::String),
];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClickEvent {
    pub click_id: Option<String>,
    pub user_id: Option<i32>,
    pub product_id: Option<String>,
    pub product: Option<String>,
    pub price: Option<f32>,
    pub url: Option<String>,
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
    pub datetime_occured: Option<String>,
}

impl ClickEvent {
    /// Decode a raw message value. `None` is a tombstone.
    pub fn from_payload(payload: Option<&[u8]>) -> Self {
        let Some(bytes) = payload else {
            return Self::default();
        };

        let text = String::from_utf8_lossy(bytes);
        match serde_json::from_str::<Value>(&text) {
            Ok(Value::Object(fields)) => Self::from_fields(&fields),
            _ => Self::default(),
        }
    }

    fn from_fields(fields: &Map<String, Value>) -> Self {
        Self {
            click_id: string_field(fields, "click_id"),
            user_id: integer_field(fields, "user_id"),
            product_id: string_field(fields, "product_id"),
            product: string_field(fields, "product"),
            price: float_field(fields, "price"),
            url: string_field(fields, "url"),
            user_agent: string_field(fields, "user_agent"),
            ip_address: string_field(fields, "ip_address"),
            datetime_occured: string_field(fields, "datetime_occured"),
        }
    }

    /// Null flags in `FIELDS` order.
    pub fn nulls(&self) -> [bool; 9] {
        [
            self.click_id.is_none(),
            self.user_id.is_none(),
            self.product_id.is_none(),
            self.product.is_none(),
            self.price.is_none(),
            self.url.is_none(),
            self.user_agent.is_none(),
            self.ip_address.is_none(),
            self.datetime_occured.is_none(),
        ]
    }

    pub fn is_empty(&self) -> bool {
        self.nulls().iter().all(|null| *null)
    }
}

fn string_field(fields: &Map<String, Value>, name: &str) -> Option<String> {
    match fields.get(name)? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        // Non-string values keep their JSON text.
        other => Some(other.to_string()),
    }
}

fn integer_field(fields: &Map<String, Value>, name: &str) -> Option<i32> {
    fields
        .get(name)?
        .as_i64()
        .and_then(|value| i32::try_from(value).ok())
}

fn float_field(fields: &Map<String, Value>, name: &str) -> Option<f32> {
    match fields.get(name)? {
        Value::Number(number) => number.as_f64().map(|value| value as f32),
        Value::String(s) => match s.as_str() {
            "NaN" => Some(f32::NAN),
            "Infinity" | "+Infinity" | "INF" | "+INF" => Some(f32::INFINITY),
            "-Infinity" | "-INF" => Some(f32::NEG_INFINITY),
            _ => None,
        },
        _ => None,
    }
}

pub fn arrow_schema() -> SchemaRef {
    let fields: Vec<Field> = FIELDS
        .iter()
        .map(|(name, field_type)| Field::new(*name, field_type.arrow_type(), true))
        .collect();
    Arc::new(Schema::new(fields))
}

/// The schema as a Delta `schemaString`.
pub fn delta_schema_string() -> String {
    let fields: Vec<Value> = FIELDS
        .iter()
        .map(|(name, field_type)| {
            json!({
                "name": name,
                "type": field_type.type_name(),
                "nullable": true,
                "metadata": {},
            })
        })
        .collect();

    json!({ "type": "struct", "fields": fields }).to_string()
}

/// Human readable schema, one line per column.
pub fn schema_tree() -> String {
    let mut tree = String::from("root\n");
    for (name, field_type) in FIELDS {
        tree.push_str(&format!(
            " |-- {name}: {} (nullable = true)\n",
            field_type.type_name()
        ));
    }
    tree
}

pub fn to_record_batch(events: &[ClickEvent]) -> Result<RecordBatch, ArrowError> {
    let rows = events.len();
    let mut click_id = StringBuilder::with_capacity(rows, rows * 36);
    let mut user_id = Int32Builder::with_capacity(rows);
    let mut product_id = StringBuilder::with_capacity(rows, rows * 16);
    let mut product = StringBuilder::with_capacity(rows, rows * 32);
    let mut price = Float32Builder::with_capacity(rows);
    let mut url = StringBuilder::with_capacity(rows, rows * 64);
    let mut user_agent = StringBuilder::with_capacity(rows, rows * 96);
    let mut ip_address = StringBuilder::with_capacity(rows, rows * 16);
    let mut datetime_occured = StringBuilder::with_capacity(rows, rows * 24);

    for event in events {
        click_id.append_option(event.click_id.as_deref());
        user_id.append_option(event.user_id);
        product_id.append_option(event.product_id.as_deref());
        product.append_option(event.product.as_deref());
        price.append_option(event.price);
        url.append_option(event.url.as_deref());
        user_agent.append_option(event.user_agent.as_deref());
        ip_address.append_option(event.ip_address.as_deref());
        datetime_occured.append_option(event.datetime_occured.as_deref());
    }

    let columns: Vec<ArrayRef> = vec![
        Arc::new(click_id.finish()),
        Arc::new(user_id.finish()),
        Arc::new(product_id.finish()),
        Arc::new(product.finish()),
        Arc::new(price.finish()),
        Arc::new(url.finish()),
        Arc::new(user_agent.finish()),
        Arc::new(ip_address.finish()),
        Arc::new(datetime_occured.finish()),
    ];

    RecordBatch::try_new(arrow_schema(), columns)
}

#[cfg(test)]
mod tests {
    use arrow::array::{Array, Float32Array, Int32Array, StringArray};

    use super::*;

    fn full_click() -> Value {
        json!({
            "click_id": "c-1",
            "user_id": 42,
            "product_id": "p-7",
            "product": "Blue Shoes",
            "price": 19.5,
            "url": "https://shop.example/p-7",
            "user_agent": "Mozilla/5.0",
            "ip_address": "10.0.0.1",
            "datetime_occured": "2024-01-01 12:00:00",
        })
    }

    fn decode(value: &Value) -> ClickEvent {
        ClickEvent::from_payload(Some(value.to_string().as_bytes()))
    }

    #[test]
    fn well_formed_message_populates_every_field() {
        let event = decode(&full_click());

        assert_eq!(
            event,
            ClickEvent {
                click_id: Some("c-1".to_string()),
                user_id: Some(42),
                product_id: Some("p-7".to_string()),
                product: Some("Blue Shoes".to_string()),
                price: Some(19.5),
                url: Some("https://shop.example/p-7".to_string()),
                user_agent: Some("Mozilla/5.0".to_string()),
                ip_address: Some("10.0.0.1".to_string()),
                datetime_occured: Some("2024-01-01 12:00:00".to_string()),
            }
        );
    }

    #[test]
    fn unknown_fields_are_dropped() {
        let mut value = full_click();
        value["referrer"] = json!("https://search.example");
        value["session"] = json!({"id": 9});

        assert_eq!(decode(&value), decode(&full_click()));
    }

    #[test]
    fn invalid_json_yields_all_nulls() {
        let event = ClickEvent::from_payload(Some(&b"{\"click_id\": \"c-1\""[..]));

        assert_eq!(event, ClickEvent::default());
        assert!(event.is_empty());
    }

    #[test]
    fn non_object_json_yields_all_nulls() {
        let payloads: [&[u8]; 4] = [b"[1, 2, 3]", b"42", b"\"click\"", b"null"];
        for payload in payloads {
            assert_eq!(ClickEvent::from_payload(Some(payload)), ClickEvent::default());
        }
    }

    #[test]
    fn tombstone_yields_all_nulls() {
        assert_eq!(ClickEvent::from_payload(None), ClickEvent::default());
    }

    #[test]
    fn missing_fields_are_null() {
        let event = decode(&json!({"click_id": "c-2", "price": 3}));

        assert_eq!(event.click_id.as_deref(), Some("c-2"));
        assert_eq!(event.price, Some(3.0));
        assert_eq!(event.user_id, None);
        assert_eq!(event.datetime_occured, None);
    }

    #[test]
    fn mistyped_field_is_null_on_its_own() {
        let mut value = full_click();
        value["user_id"] = json!("forty-two");
        value["price"] = json!(true);

        let event = decode(&value);

        assert_eq!(event.user_id, None);
        assert_eq!(event.price, None);
        assert_eq!(event.click_id.as_deref(), Some("c-1"));
        assert_eq!(event.product.as_deref(), Some("Blue Shoes"));
    }

    #[test]
    fn user_id_must_be_an_i32() {
        let overflow = decode(&json!({"user_id": 2_147_483_648_i64}));
        let fractional = decode(&json!({"user_id": 4.5}));
        let negative = decode(&json!({"user_id": -7}));

        assert_eq!(overflow.user_id, None);
        assert_eq!(fractional.user_id, None);
        assert_eq!(negative.user_id, Some(-7));
    }

    #[test]
    fn price_accepts_integers_and_non_numeric_numbers() {
        assert_eq!(decode(&json!({"price": 10})).price, Some(10.0));
        assert_eq!(
            decode(&json!({"price": "Infinity"})).price,
            Some(f32::INFINITY)
        );
        assert_eq!(
            decode(&json!({"price": "-Infinity"})).price,
            Some(f32::NEG_INFINITY)
        );
        assert!(decode(&json!({"price": "NaN"})).price.unwrap().is_nan());
        assert_eq!(decode(&json!({"price": "12.5"})).price, None);
    }

    #[test]
    fn non_string_values_in_string_fields_keep_their_json_text() {
        let event = decode(&json!({
            "click_id": 123,
            "product": {"name": "shoe"},
            "url": false,
            "ip_address": null,
        }));

        assert_eq!(event.click_id.as_deref(), Some("123"));
        assert_eq!(event.product.as_deref(), Some("{\"name\":\"shoe\"}"));
        assert_eq!(event.url.as_deref(), Some("false"));
        assert_eq!(event.ip_address, None);
    }

    #[test]
    fn invalid_utf8_is_replaced_not_rejected() {
        let mut payload = b"{\"click_id\": \"c".to_vec();
        payload.push(0xff);
        payload.extend_from_slice(b"\"}");

        let event = ClickEvent::from_payload(Some(payload.as_slice()));

        assert_eq!(event.click_id.as_deref(), Some("c\u{fffd}"));
    }

    #[test]
    fn record_batch_follows_schema_order() {
        let events = vec![decode(&full_click()), ClickEvent::default()];

        let batch = to_record_batch(&events).unwrap();

        assert_eq!(batch.num_rows(), 2);
        assert_eq!(batch.num_columns(), FIELDS.len());
        assert_eq!(batch.schema(), arrow_schema());

        let click_id = batch
            .column(0)
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap();
        let user_id = batch
            .column(1)
            .as_any()
            .downcast_ref::<Int32Array>()
            .unwrap();
        let price = batch
            .column(4)
            .as_any()
            .downcast_ref::<Float32Array>()
            .unwrap();

        assert_eq!(click_id.value(0), "c-1");
        assert!(click_id.is_null(1));
        assert_eq!(user_id.value(0), 42);
        assert!(user_id.is_null(1));
        assert_eq!(price.value(0), 19.5);
        assert!(price.is_null(1));
    }

    #[test]
    fn delta_schema_lists_every_field() {
        let schema: Value = serde_json::from_str(&delta_schema_string()).unwrap();

        assert_eq!(schema["type"], "struct");
        let fields = schema["fields"].as_array().unwrap();
        assert_eq!(fields.len(), 9);
        assert_eq!(fields[1]["name"], "user_id");
        assert_eq!(fields[1]["type"], "integer");
        assert_eq!(fields[4]["type"], "float");
        assert_eq!(fields[8]["name"], "datetime_occured");
    }

    #[test]
    fn schema_tree_renders_each_column() {
        let tree = schema_tree();

        assert!(tree.starts_with("root\n"));
        assert!(tree.contains(" |-- click_id: string (nullable = true)\n"));
        assert!(tree.contains(" |-- user_id: integer (nullable = true)\n"));
        assert!(tree.contains(" |-- price: float (nullable = true)\n"));
        assert_eq!(tree.lines().count(), 10);
    }
}

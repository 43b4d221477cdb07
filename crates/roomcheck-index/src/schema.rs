use arrow_schema::{DataType, Field, Schema};
use std::sync::Arc;

/// Arrow schema of a persisted rule table; `dim` is the embedder's vector length.
pub fn build_rules_schema(dim: i32) -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Utf8, false),
        Field::new("text", DataType::Utf8, false),
        Field::new("rule_type", DataType::Utf8, false),
        Field::new("ordinal", DataType::Int64, false),
        Field::new("start", DataType::Int64, false),
        Field::new("end", DataType::Int64, false),
        Field::new("vector", DataType::FixedSizeList(Arc::new(Field::new("item", DataType::Float32, true)), dim), true),
    ]))
}

/// Arrow schema definitions for the relational mirror tables.
pub mod mirror {
    use arrow::datatypes::{DataType, Field, Schema, TimeUnit};

    pub const SAMPLES: &str = "samples";
    pub const PREDICTIONS: &str = "predictions";
    pub const CORRECTIONS: &str = "corrections";

    fn recorded_at() -> Field {
        Field::new(
            "recorded_at",
            DataType::Timestamp(TimeUnit::Millisecond, Some("UTC".into())),
            false,
        )
    }

    /// One row per sample path, holding its current label.
    pub fn samples_schema() -> Schema {
        Schema::new(vec![
            Field::new("path", DataType::Utf8, false),
            Field::new("label", DataType::Utf8, false),
            recorded_at(),
        ])
    }

    /// Append-only prediction facts.
    pub fn predictions_schema() -> Schema {
        Schema::new(vec![
            Field::new("sample_path", DataType::Utf8, false),
            Field::new("predicted_label", DataType::Utf8, false),
            Field::new("score", DataType::Float32, false),
            recorded_at(),
        ])
    }

    /// Append-only audit trail of label corrections.
    pub fn corrections_schema() -> Schema {
        Schema::new(vec![
            Field::new("sample_path", DataType::Utf8, false),
            Field::new("old_label", DataType::Utf8, true),
            Field::new("new_label", DataType::Utf8, false),
            recorded_at(),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::mirror;

    #[test]
    fn samples_schema_has_expected_fields() {
        let schema = mirror::samples_schema();
        assert_eq!(schema.fields().len(), 3);
        assert!(schema.field_with_name("path").is_ok());
        assert!(schema.field_with_name("label").is_ok());
    }

    #[test]
    fn corrections_old_label_is_nullable() {
        let schema = mirror::corrections_schema();
        assert_eq!(schema.fields().len(), 4);
        assert!(schema.field_with_name("old_label").unwrap().is_nullable());
        assert!(!schema.field_with_name("new_label").unwrap().is_nullable());
    }

    #[test]
    fn predictions_schema_has_score() {
        let schema = mirror::predictions_schema();
        assert!(schema.field_with_name("score").is_ok());
    }
}

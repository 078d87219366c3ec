//! Schema compatibility checking
//!
//! `check(reader, writer)` answers whether data written with `writer` can be
//! decoded with `reader` under Avro schema resolution. An evolution step from
//! `old` to `new` is BACKWARD compatible when `new` reads `old`, FORWARD
//! compatible when `old` reads `new`, and FULL when both hold.
//!
//! Fields are matched by name only. Aliases are not consulted, so renaming a
//! field behaves like removing it and adding another one.

use apache_avro::Schema;
use std::fmt;
use std::mem;
use std::path::Path;
use std::str::FromStr;

use super::{parse, Result, SchemaError};

/// Outcome of checking one reader/writer pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compatibility {
    Compatible,
    /// Every reason names the offending path, e.g. `OrderCreated.customerId`
    Incompatible(Vec<String>),
}

impl Compatibility {
    pub fn is_compatible(&self) -> bool {
        matches!(self, Compatibility::Compatible)
    }

    pub fn reasons(&self) -> &[String] {
        match self {
            Compatibility::Compatible => &[],
            Compatibility::Incompatible(reasons) => reasons,
        }
    }
}

/// Compatibility level a schema change is required to meet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompatibilityLevel {
    None,
    Backward,
    Forward,
    Full,
}

impl fmt::Display for CompatibilityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CompatibilityLevel::None => "NONE",
            CompatibilityLevel::Backward => "BACKWARD",
            CompatibilityLevel::Forward => "FORWARD",
            CompatibilityLevel::Full => "FULL",
        };
        f.write_str(name)
    }
}

impl FromStr for CompatibilityLevel {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(CompatibilityLevel::None),
            "backward" => Ok(CompatibilityLevel::Backward),
            "forward" => Ok(CompatibilityLevel::Forward),
            "full" => Ok(CompatibilityLevel::Full),
            other => Err(SchemaError::InvalidSchema(format!(
                "unknown compatibility level '{}'",
                other
            ))),
        }
    }
}

/// Both directions of an evolution step from an old to a new schema
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompatibilityReport {
    /// New schema reading data written with the old one
    pub backward: Compatibility,
    /// Old schema reading data written with the new one
    pub forward: Compatibility,
}

impl CompatibilityReport {
    pub fn is_backward(&self) -> bool {
        self.backward.is_compatible()
    }

    pub fn is_forward(&self) -> bool {
        self.forward.is_compatible()
    }

    pub fn is_full(&self) -> bool {
        self.is_backward() && self.is_forward()
    }

    /// Strongest level this change satisfies
    pub fn level(&self) -> CompatibilityLevel {
        match (self.is_backward(), self.is_forward()) {
            (true, true) => CompatibilityLevel::Full,
            (true, false) => CompatibilityLevel::Backward,
            (false, true) => CompatibilityLevel::Forward,
            (false, false) => CompatibilityLevel::None,
        }
    }

    pub fn satisfies(&self, required: CompatibilityLevel) -> bool {
        match required {
            CompatibilityLevel::None => true,
            CompatibilityLevel::Backward => self.is_backward(),
            CompatibilityLevel::Forward => self.is_forward(),
            CompatibilityLevel::Full => self.is_full(),
        }
    }

    /// Fail with a `CompatibilityViolation` unless `required` is met
    pub fn require(&self, required: CompatibilityLevel) -> Result<()> {
        if self.satisfies(required) {
            return Ok(());
        }

        let mut reasons = Vec::new();
        if matches!(required, CompatibilityLevel::Backward | CompatibilityLevel::Full) {
            reasons.extend(self.backward.reasons().iter().map(|r| format!("BACKWARD: {}", r)));
        }
        if matches!(required, CompatibilityLevel::Forward | CompatibilityLevel::Full) {
            reasons.extend(self.forward.reasons().iter().map(|r| format!("FORWARD: {}", r)));
        }

        Err(SchemaError::CompatibilityViolation { required, reasons })
    }
}

impl fmt::Display for CompatibilityReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verdict = |ok: bool| if ok { "compatible" } else { "incompatible" };

        writeln!(f, "BACKWARD: {}", verdict(self.is_backward()))?;
        for reason in self.backward.reasons() {
            writeln!(f, "  - {}", reason)?;
        }
        writeln!(f, "FORWARD: {}", verdict(self.is_forward()))?;
        for reason in self.forward.reasons() {
            writeln!(f, "  - {}", reason)?;
        }
        write!(f, "FULL: {}", verdict(self.is_full()))
    }
}

/// Can data written with `writer` be read with `reader`?
pub fn check(reader: &Schema, writer: &Schema) -> Compatibility {
    let mut reasons = Vec::new();
    check_at(reader, writer, &type_name(reader), &mut reasons);

    if reasons.is_empty() {
        Compatibility::Compatible
    } else {
        Compatibility::Incompatible(reasons)
    }
}

/// Classify the evolution step from `old` to `new`
pub fn classify(old: &Schema, new: &Schema) -> CompatibilityReport {
    CompatibilityReport {
        backward: check(new, old),
        forward: check(old, new),
    }
}

/// Load two schema documents from disk and classify the change between them
pub fn classify_files(old: &Path, new: &Path) -> Result<CompatibilityReport> {
    let old = parse(&std::fs::read_to_string(old)?)?;
    let new = parse(&std::fs::read_to_string(new)?)?;
    Ok(classify(&old, &new))
}

fn check_at(reader: &Schema, writer: &Schema, path: &str, reasons: &mut Vec<String>) {
    match (reader, writer) {
        (Schema::Union(reader_union), Schema::Union(writer_union)) => {
            for branch in writer_union.variants() {
                if !reader_union.variants().iter().any(|r| readable(r, branch)) {
                    reasons.push(format!(
                        "{}: writer union branch {} has no matching reader branch",
                        path,
                        type_name(branch)
                    ));
                }
            }
        },
        (_, Schema::Union(writer_union)) => {
            for branch in writer_union.variants() {
                check_at(reader, branch, path, reasons);
            }
        },
        (Schema::Union(reader_union), _) => {
            if !reader_union.variants().iter().any(|r| readable(r, writer)) {
                reasons.push(format!(
                    "{}: no reader union branch can read writer type {}",
                    path,
                    type_name(writer)
                ));
            }
        },
        (Schema::Record(r), Schema::Record(w)) => {
            if r.name.name != w.name.name {
                reasons.push(format!(
                    "{}: record name {} does not match writer record {}",
                    path, r.name.name, w.name.name
                ));
                return;
            }

            for reader_field in &r.fields {
                let field_path = format!("{}.{}", path, reader_field.name);
                match w.fields.iter().find(|f| f.name == reader_field.name) {
                    Some(writer_field) => {
                        check_at(&reader_field.schema, &writer_field.schema, &field_path, reasons)
                    },
                    None if reader_field.default.is_some() => {},
                    None => reasons.push(format!(
                        "{}: reader field has no default and is missing from the writer",
                        field_path
                    )),
                }
            }
        },
        (Schema::Enum(r), Schema::Enum(w)) => {
            if r.name.name != w.name.name {
                reasons.push(format!(
                    "{}: enum name {} does not match writer enum {}",
                    path, r.name.name, w.name.name
                ));
                return;
            }

            let missing: Vec<&str> = w
                .symbols
                .iter()
                .filter(|s| !r.symbols.contains(s))
                .map(String::as_str)
                .collect();
            if !missing.is_empty() && r.default.is_none() {
                reasons.push(format!(
                    "{}: reader enum lacks writer symbols [{}] and has no default",
                    path,
                    missing.join(", ")
                ));
            }
        },
        (Schema::Fixed(r), Schema::Fixed(w)) => {
            if r.name.name != w.name.name || r.size != w.size {
                reasons.push(format!(
                    "{}: fixed {}({}) cannot read fixed {}({})",
                    path, r.name.name, r.size, w.name.name, w.size
                ));
            }
        },
        (Schema::Array(r), Schema::Array(w)) => {
            check_at(r, w, &format!("{}[]", path), reasons);
        },
        (Schema::Map(r), Schema::Map(w)) => {
            check_at(r, w, &format!("{}{{}}", path), reasons);
        },
        (Schema::Decimal(r), Schema::Decimal(w)) => {
            if r.precision != w.precision || r.scale != w.scale {
                reasons.push(format!(
                    "{}: decimal({}, {}) cannot read decimal({}, {})",
                    path, r.precision, r.scale, w.precision, w.scale
                ));
            } else {
                check_at(&r.inner, &w.inner, path, reasons);
            }
        },
        (Schema::Ref { name: r }, Schema::Ref { name: w }) => {
            if r.name != w.name {
                reasons.push(format!(
                    "{}: named type {} does not match writer type {}",
                    path, r.name, w.name
                ));
            }
        },
        _ => match (primitive(reader), primitive(writer)) {
            (Some(r), Some(w)) if promotes(w, r) => {},
            (None, None) if mem::discriminant(reader) == mem::discriminant(writer) => {},
            _ => reasons.push(format!(
                "{}: reader type {} cannot read writer type {}",
                path,
                type_name(reader),
                type_name(writer)
            )),
        },
    }
}

fn readable(reader: &Schema, writer: &Schema) -> bool {
    let mut reasons = Vec::new();
    check_at(reader, writer, "", &mut reasons);
    reasons.is_empty()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Primitive {
    Null,
    Boolean,
    Int,
    Long,
    Float,
    Double,
    Bytes,
    String,
}

/// Underlying primitive of a schema; logical types resolve as their base type
fn primitive(schema: &Schema) -> Option<Primitive> {
    match schema {
        Schema::Null => Some(Primitive::Null),
        Schema::Boolean => Some(Primitive::Boolean),
        Schema::Int | Schema::Date | Schema::TimeMillis => Some(Primitive::Int),
        Schema::Long
        | Schema::TimeMicros
        | Schema::TimestampMillis
        | Schema::TimestampMicros => Some(Primitive::Long),
        Schema::Float => Some(Primitive::Float),
        Schema::Double => Some(Primitive::Double),
        Schema::Bytes => Some(Primitive::Bytes),
        Schema::String | Schema::Uuid => Some(Primitive::String),
        Schema::Decimal(decimal) => primitive(&decimal.inner),
        _ => None,
    }
}

/// Avro promotion rules: can a `writer` value be read as `reader`?
fn promotes(writer: Primitive, reader: Primitive) -> bool {
    use Primitive::*;

    writer == reader
        || matches!(
            (writer, reader),
            (Int, Long | Float | Double)
                | (Long, Float | Double)
                | (Float, Double)
                | (String, Bytes)
                | (Bytes, String)
        )
}

fn type_name(schema: &Schema) -> String {
    match schema {
        Schema::Null => "null".into(),
        Schema::Boolean => "boolean".into(),
        Schema::Int => "int".into(),
        Schema::Long => "long".into(),
        Schema::Float => "float".into(),
        Schema::Double => "double".into(),
        Schema::Bytes => "bytes".into(),
        Schema::String => "string".into(),
        Schema::Array(items) => format!("array<{}>", type_name(items)),
        Schema::Map(values) => format!("map<{}>", type_name(values)),
        Schema::Union(union) => {
            let branches: Vec<String> = union.variants().iter().map(type_name).collect();
            format!("[{}]", branches.join(", "))
        },
        Schema::Record(record) => record.name.name.clone(),
        Schema::Enum(e) => e.name.name.clone(),
        Schema::Fixed(fixed) => fixed.name.name.clone(),
        Schema::Decimal(d) => format!("decimal({}, {})", d.precision, d.scale),
        Schema::Uuid => "uuid".into(),
        Schema::Date => "date".into(),
        Schema::TimeMillis => "time-millis".into(),
        Schema::TimeMicros => "time-micros".into(),
        Schema::TimestampMillis => "timestamp-millis".into(),
        Schema::TimestampMicros => "timestamp-micros".into(),
        Schema::Ref { name } => name.name.clone(),
        other => format!("{:?}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::order_created;

    fn schema(json: &str) -> Schema {
        Schema::parse_str(json).unwrap()
    }

    fn record(fields: &str) -> Schema {
        schema(&format!(
            r#"{{"type": "record", "name": "R", "fields": [{}]}}"#,
            fields
        ))
    }

    #[test]
    fn test_identical_schemas_are_fully_compatible() {
        let v1 = order_created(1).unwrap();
        let report = classify(&v1, &v1);
        assert!(report.is_full());
        assert_eq!(report.level(), CompatibilityLevel::Full);
    }

    #[test]
    fn test_added_optional_field_is_full() {
        let report = classify(&order_created(1).unwrap(), &order_created(2).unwrap());
        assert!(report.is_backward());
        assert!(report.is_forward());
    }

    #[test]
    fn test_added_required_field_breaks_backward() {
        let old = record(r#"{"name": "a", "type": "string"}"#);
        let new = record(r#"{"name": "a", "type": "string"}, {"name": "b", "type": "int"}"#);

        let report = classify(&old, &new);
        assert!(!report.is_backward());
        assert!(report.is_forward());
        assert_eq!(report.level(), CompatibilityLevel::Forward);
        assert!(report.backward.reasons()[0].contains("R.b"));
    }

    #[test]
    fn test_rename_is_remove_plus_add() {
        let old = record(r#"{"name": "customerId", "type": "string"}"#);
        let new = record(
            r#"{"name": "clientId", "type": "string", "aliases": ["customerId"]}"#,
        );

        let report = classify(&old, &new);
        assert!(!report.is_backward());
        assert!(!report.is_forward());
    }

    #[test]
    fn test_primitive_promotions() {
        assert!(check(&Schema::Long, &Schema::Int).is_compatible());
        assert!(check(&Schema::Double, &Schema::Float).is_compatible());
        assert!(check(&Schema::Float, &Schema::Long).is_compatible());
        assert!(check(&Schema::Bytes, &Schema::String).is_compatible());
        assert!(check(&Schema::String, &Schema::Bytes).is_compatible());

        assert!(!check(&Schema::Int, &Schema::Long).is_compatible());
        assert!(!check(&Schema::Float, &Schema::Double).is_compatible());
        assert!(!check(&Schema::String, &Schema::Int).is_compatible());
    }

    #[test]
    fn test_field_type_change_reports_path() {
        let reader = record(r#"{"name": "total", "type": "int"}"#);
        let writer = record(r#"{"name": "total", "type": "string"}"#);

        let result = check(&reader, &writer);
        assert_eq!(
            result.reasons(),
            &["R.total: reader type int cannot read writer type string".to_string()]
        );
    }

    #[test]
    fn test_unions() {
        let nullable = schema(r#"["null", "string"]"#);

        assert!(check(&nullable, &Schema::String).is_compatible());
        assert!(!check(&Schema::String, &nullable).is_compatible());
        assert!(check(&schema(r#"["null", "long"]"#), &schema(r#"["null", "int"]"#)).is_compatible());
        assert!(!check(&schema(r#"["null", "int"]"#), &schema(r#"["null", "long"]"#)).is_compatible());
    }

    #[test]
    fn test_enums() {
        let small = schema(r#"{"type": "enum", "name": "E", "symbols": ["A", "B"]}"#);
        let large = schema(r#"{"type": "enum", "name": "E", "symbols": ["A", "B", "C"]}"#);
        let with_default = schema(
            r#"{"type": "enum", "name": "E", "symbols": ["A", "B"], "default": "A"}"#,
        );

        assert!(check(&large, &small).is_compatible());
        assert!(!check(&small, &large).is_compatible());
        assert!(check(&with_default, &large).is_compatible());
    }

    #[test]
    fn test_fixed_arrays_and_maps() {
        let f4 = schema(r#"{"type": "fixed", "name": "F", "size": 4}"#);
        let f8 = schema(r#"{"type": "fixed", "name": "F", "size": 8}"#);
        assert!(!check(&f4, &f8).is_compatible());

        let longs = schema(r#"{"type": "array", "items": "long"}"#);
        let ints = schema(r#"{"type": "array", "items": "int"}"#);
        assert!(check(&longs, &ints).is_compatible());
        assert!(!check(&ints, &longs).is_compatible());

        let map_str = schema(r#"{"type": "map", "values": "string"}"#);
        let map_int = schema(r#"{"type": "map", "values": "int"}"#);
        assert!(!check(&map_str, &map_int).is_compatible());
    }

    #[test]
    fn test_decimal_precision_and_scale_must_match() {
        let d18_2 = schema(r#"{"type": "bytes", "logicalType": "decimal", "precision": 18, "scale": 2}"#);
        let d18_3 = schema(r#"{"type": "bytes", "logicalType": "decimal", "precision": 18, "scale": 3}"#);
        assert!(check(&d18_2, &d18_2).is_compatible());
        assert!(!check(&d18_2, &d18_3).is_compatible());
    }

    #[test]
    fn test_logical_types_resolve_as_base_types() {
        let ts = schema(r#"{"type": "long", "logicalType": "timestamp-millis"}"#);
        assert!(check(&Schema::Long, &ts).is_compatible());
        assert!(check(&ts, &Schema::Long).is_compatible());
        assert!(!check(&ts, &Schema::String).is_compatible());
    }

    #[test]
    fn test_record_name_mismatch() {
        let a = schema(r#"{"type": "record", "name": "A", "fields": []}"#);
        let b = schema(r#"{"type": "record", "name": "B", "fields": []}"#);
        assert!(!check(&a, &b).is_compatible());
    }

    #[test]
    fn test_require_levels() {
        let old = record(r#"{"name": "a", "type": "string"}, {"name": "b", "type": "string"}"#);
        let new = record(r#"{"name": "a", "type": "string"}"#);
        let report = classify(&old, &new);

        assert!(report.require(CompatibilityLevel::Backward).is_ok());
        assert!(report.require(CompatibilityLevel::None).is_ok());

        match report.require(CompatibilityLevel::Full) {
            Err(SchemaError::CompatibilityViolation { required, reasons }) => {
                assert_eq!(required, CompatibilityLevel::Full);
                assert_eq!(reasons.len(), 1);
                assert!(reasons[0].starts_with("FORWARD: R.b"));
            },
            other => panic!("expected violation, got {:?}", other),
        }
    }

    #[test]
    fn test_level_parse_and_display() {
        assert_eq!("full".parse::<CompatibilityLevel>().unwrap(), CompatibilityLevel::Full);
        assert_eq!("BACKWARD".parse::<CompatibilityLevel>().unwrap(), CompatibilityLevel::Backward);
        assert!("sideways".parse::<CompatibilityLevel>().is_err());
        assert_eq!(CompatibilityLevel::Forward.to_string(), "FORWARD");
    }

    #[test]
    fn test_report_display() {
        let old = record(r#"{"name": "a", "type": "string"}, {"name": "b", "type": "string"}"#);
        let new = record(r#"{"name": "a", "type": "string"}"#);
        let text = classify(&old, &new).to_string();

        assert!(text.contains("BACKWARD: compatible"));
        assert!(text.contains("FORWARD: incompatible"));
        assert!(text.contains("  - R.b: reader field has no default"));
        assert!(text.ends_with("FULL: incompatible"));
    }
}

//! Column types and the string-to-value converters bound to them.
//!
//! A [`Schema`] is the ordered list of [`ColumnType`]s the sink's statement binds.
//! [`SchemaBinder`] resolves one converter per column once, up front, so a missing
//! parser is reported before any row is read and the per-row path is a plain indexed
//! call.
//!
//! The builtin converters live in a process-wide table that is built on first use and
//! never mutated afterwards. Extra types are supported by building a custom
//! [`ConverterTable`] and handing it to [`SchemaBinder::with_table`].

use crate::error::{LoadError, LoadResult};
use crate::reader::RawRecord;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

/// Declared type of a column.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ColumnType {
    /// 32-bit signed integer.
    Int,
    /// 64-bit signed integer.
    BigInt,
    /// UTF-8 text, passed through unchanged.
    Text,
    /// Double-precision float.
    Double,
    /// Single-precision float.
    Float,
    Boolean,
    /// A type the sink declared that this crate has no builtin name for.
    Other(String),
}

impl ColumnType {
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Int => "int",
            Self::BigInt => "bigint",
            Self::Text => "text",
            Self::Double => "double",
            Self::Float => "float",
            Self::Boolean => "boolean",
            Self::Other(name) => name,
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ColumnType {
    type Err = std::convert::Infallible;

    /// Parse a type tag. Unknown tags become [`ColumnType::Other`] so the binder, not
    /// the parser, decides whether they can be loaded.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tag = s.trim().to_ascii_lowercase();
        Ok(match tag.as_str() {
            "int" | "integer" => Self::Int,
            "bigint" | "long" => Self::BigInt,
            "text" | "varchar" | "ascii" => Self::Text,
            "double" => Self::Double,
            "float" => Self::Float,
            "boolean" | "bool" => Self::Boolean,
            _ => Self::Other(tag),
        })
    }
}

/// A converted field value.
#[derive(Debug, Clone, PartialEq)]
pub enum TypedValue {
    Int(i32),
    BigInt(i64),
    Text(String),
    Double(f64),
    Float(f32),
    Boolean(bool),
}

/// One converted record, positionally aligned with its schema.
pub type TypedBinding = Vec<TypedValue>;

/// Parse function for one column type. `None` means the text is not a valid value.
pub type Converter = fn(&str) -> Option<TypedValue>;

/// Ordered column types of a run.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Schema {
    columns: Vec<ColumnType>,
}

impl Schema {
    #[must_use]
    pub fn new(columns: Vec<ColumnType>) -> Self {
        Self { columns }
    }

    /// Build a schema from textual type tags such as `["int", "double"]`.
    pub fn from_tags<S: AsRef<str>>(tags: &[S]) -> Self {
        let columns = tags
            .iter()
            .map(|t| match t.as_ref().parse::<ColumnType>() {
                Ok(ty) => ty,
                Err(never) => match never {},
            })
            .collect();
        Self { columns }
    }

    #[must_use]
    pub fn arity(&self) -> usize {
        self.columns.len()
    }

    #[must_use]
    pub fn columns(&self) -> &[ColumnType] {
        &self.columns
    }
}

impl From<Vec<ColumnType>> for Schema {
    fn from(columns: Vec<ColumnType>) -> Self {
        Self::new(columns)
    }
}

fn parse_int(s: &str) -> Option<TypedValue> {
    s.parse().ok().map(TypedValue::Int)
}

fn parse_bigint(s: &str) -> Option<TypedValue> {
    s.parse().ok().map(TypedValue::BigInt)
}

fn parse_text(s: &str) -> Option<TypedValue> {
    Some(TypedValue::Text(s.to_owned()))
}

fn parse_double(s: &str) -> Option<TypedValue> {
    s.parse().ok().map(TypedValue::Double)
}

fn parse_float(s: &str) -> Option<TypedValue> {
    s.parse().ok().map(TypedValue::Float)
}

fn parse_boolean(s: &str) -> Option<TypedValue> {
    s.parse().ok().map(TypedValue::Boolean)
}

static BUILTIN: LazyLock<ConverterTable> = LazyLock::new(|| ConverterTable {
    converters: HashMap::from([
        (ColumnType::Int, parse_int as Converter),
        (ColumnType::BigInt, parse_bigint as Converter),
        (ColumnType::Text, parse_text as Converter),
        (ColumnType::Double, parse_double as Converter),
        (ColumnType::Float, parse_float as Converter),
        (ColumnType::Boolean, parse_boolean as Converter),
    ]),
});

/// Immutable mapping from column type to its converter.
#[derive(Clone)]
pub struct ConverterTable {
    converters: HashMap<ColumnType, Converter>,
}

impl ConverterTable {
    /// The process-wide table of builtin converters.
    #[must_use]
    pub fn builtin() -> &'static ConverterTable {
        &BUILTIN
    }

    /// Start a custom table seeded with the builtin converters.
    #[must_use]
    pub fn builder() -> ConverterTableBuilder {
        ConverterTableBuilder {
            converters: BUILTIN.converters.clone(),
        }
    }

    #[must_use]
    pub fn get(&self, ty: &ColumnType) -> Option<Converter> {
        self.converters.get(ty).copied()
    }
}

/// Builder for a [`ConverterTable`] with extra or replaced converters.
pub struct ConverterTableBuilder {
    converters: HashMap<ColumnType, Converter>,
}

impl ConverterTableBuilder {
    /// Register `converter` for `ty`, replacing any previous one.
    #[must_use]
    pub fn register(mut self, ty: ColumnType, converter: Converter) -> Self {
        self.converters.insert(ty, converter);
        self
    }

    #[must_use]
    pub fn build(self) -> ConverterTable {
        ConverterTable {
            converters: self.converters,
        }
    }
}

/// Per-column converters resolved for one schema.
#[derive(Clone)]
pub struct SchemaBinder {
    schema: Schema,
    converters: Vec<Converter>,
}

impl fmt::Debug for SchemaBinder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaBinder")
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

impl SchemaBinder {
    /// Resolve converters from the builtin table.
    ///
    /// # Errors
    /// Returns [`LoadError::NoConverter`] for the first column whose type is not registered.
    pub fn new(schema: Schema) -> LoadResult<Self> {
        Self::with_table(schema, ConverterTable::builtin())
    }

    /// Resolve converters from `table`.
    ///
    /// # Errors
    /// Returns [`LoadError::NoConverter`] for the first column whose type is not in `table`.
    pub fn with_table(schema: Schema, table: &ConverterTable) -> LoadResult<Self> {
        let converters = schema
            .columns()
            .iter()
            .enumerate()
            .map(|(column, ty)| {
                table.get(ty).ok_or_else(|| LoadError::NoConverter {
                    column,
                    declared: ty.clone(),
                })
            })
            .collect::<LoadResult<Vec<_>>>()?;
        Ok(Self { schema, converters })
    }

    #[must_use]
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    #[must_use]
    pub fn arity(&self) -> usize {
        self.converters.len()
    }

    /// Convert the raw text of one column.
    ///
    /// # Errors
    /// Returns [`LoadError::MalformedValue`] if `raw` does not parse as the declared type.
    ///
    /// # Panics
    /// Panics if `column` is outside the schema.
    pub fn convert(&self, column: usize, raw: &str) -> LoadResult<TypedValue> {
        (self.converters[column])(raw).ok_or_else(|| LoadError::MalformedValue {
            column,
            declared: self.schema.columns[column].clone(),
            value: raw.to_owned(),
        })
    }

    /// Convert every field of `record`.
    ///
    /// # Errors
    /// Returns [`LoadError::WrongWidth`] if the record width differs from the schema,
    /// or the first [`LoadError::MalformedValue`].
    pub fn bind(&self, record: &RawRecord) -> LoadResult<TypedBinding> {
        if record.len() != self.arity() {
            return Err(LoadError::WrongWidth {
                expected: self.arity(),
                found: record.len(),
            });
        }
        record
            .iter()
            .enumerate()
            .map(|(column, raw)| self.convert(column, raw))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_parse_case_insensitively() {
        let schema = Schema::from_tags(&["INT", " double", "uuid"]);
        assert_eq!(
            schema.columns(),
            &[
                ColumnType::Int,
                ColumnType::Double,
                ColumnType::Other("uuid".into())
            ]
        );
    }

    #[test]
    fn builtin_table_is_shared() {
        assert!(std::ptr::eq(
            ConverterTable::builtin(),
            ConverterTable::builtin()
        ));
    }
}

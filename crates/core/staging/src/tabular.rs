//! Tabular staging files compiled into raw-store views.
//!
//! A tabular file (`.csv` or `.tsv`) describes column mappings with paired cells. The header row
//! holds `(table.column, action.new_name)` pairs, where the action is `RENAME` (the default when
//! omitted), `NEW` or `DELETE`, case-insensitive. Each following row holds, for every pair, a
//! `(pattern, replacement)` substitution applied to the source column. Substitutions of one
//! column chain top to bottom, and an empty pattern cell contributes nothing.
//!
//! ```text
//! courses.code,RENAME.course_code,courses.title,NEW.short_title
//! ^([A-Z]+)-(\d+),$1$2,"^(.{0,10}).*",$1
//! ```
//!
//! For every source table, in first-appearance order, one view is emitted. It selects the
//! table's columns that are neither renamed nor deleted, in ordinal order, followed by one
//! `::text` column per `RENAME`/`NEW` mapping. A file touching a single table yields a view
//! named after the file stem; otherwise each view is named `<table>_<stem>`.
//!
//! Compilation happens in two steps: [`parse`] validates the file on its own, then
//! [`TabularPlan::compile`] checks it against the raw store's table schemas and emits SQL.

use std::{collections::BTreeMap, fmt, path::Path, sync::LazyLock};

use regex::Regex;

use crate::sql::{self, ValidateIdentifierError, validate_identifier};

static CAPTURE_GROUP_REF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$(\d+)").expect("capture group pattern is valid"));

/// Supported tabular formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TabularFormat {
    Csv,
    /// Tabs and runs of four spaces separate cells
    Tsv,
}

impl TabularFormat {
    /// Detect the format from a file extension, `None` when not tabular.
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("csv") => Some(Self::Csv),
            Some(ext) if ext.eq_ignore_ascii_case("tsv") => Some(Self::Tsv),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnAction {
    Rename,
    New,
    Delete,
}

impl fmt::Display for ColumnAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rename => f.write_str("RENAME"),
            Self::New => f.write_str("NEW"),
            Self::Delete => f.write_str("DELETE"),
        }
    }
}

/// One `REGEXP_REPLACE` step, with `$n` already translated to `\n`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Substitution {
    pub pattern: String,
    pub replacement: String,
}

impl Substitution {
    fn new(pattern: &str, replacement: &str) -> Self {
        Self {
            pattern: translate_capture_groups(pattern),
            replacement: translate_capture_groups(replacement),
        }
    }
}

/// A header pair and the substitutions listed under it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMapping {
    pub source_table: String,
    pub source_column: String,
    pub action: ColumnAction,
    pub output_column: String,
    pub substitutions: Vec<Substitution>,
}

impl ColumnMapping {
    /// The mapped column as a SQL expression: the substitution chain folded over the source.
    fn expression(&self) -> String {
        let source = format!(
            "{}.{}",
            sql::ident(&self.source_table),
            sql::ident(&self.source_column)
        );
        let chained = self.substitutions.iter().fold(source, |expr, step| {
            format!(
                "REGEXP_REPLACE({expr}, {}, {}, 'g')",
                sql::literal(&step.pattern),
                sql::literal(&step.replacement)
            )
        });
        format!("{chained}::text AS {}", sql::ident(&self.output_column))
    }
}

/// A validated tabular file, not yet bound to any table schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabularPlan {
    pub file_stem: String,
    pub mappings: Vec<ColumnMapping>,
}

/// A view definition produced by [`TabularPlan::compile`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledView {
    pub name: String,
    pub source_table: String,
    /// `DROP VIEW IF EXISTS ... CASCADE; CREATE VIEW ... AS SELECT ...`
    pub sql: String,
}

#[derive(Debug, thiserror::Error)]
pub enum TabularError {
    #[error("failed to read tabular data")]
    Csv(#[source] csv::Error),

    #[error("tabular file has no header row")]
    MissingHeader,

    /// Fewer than two header cells
    #[error("header must have at least 2 columns, found {found}")]
    HeaderTooShort { found: usize },

    /// Header cells must come in pairs
    #[error("header must have an even number of columns, found {found}")]
    OddHeader { found: usize },

    #[error("row at line {line} has {found} columns, expected {expected}")]
    RowWidth {
        line: u64,
        found: usize,
        expected: usize,
    },

    /// A source cell is not of the form `table.column`
    #[error("malformed source header cell '{cell}', expected 'table.column'")]
    MalformedSourceCell { cell: String },

    /// A target cell has more than one `.`
    #[error("malformed target header cell '{cell}', expected '[action.]column'")]
    MalformedTargetCell { cell: String },

    #[error("unknown action '{action}' in header cell '{cell}'")]
    UnknownAction { cell: String, action: String },

    #[error("invalid identifier in header cell '{cell}'")]
    InvalidIdentifier {
        cell: String,
        #[source]
        source: ValidateIdentifierError,
    },

    #[error("invalid view name '{name}'")]
    InvalidViewName {
        name: String,
        #[source]
        source: ValidateIdentifierError,
    },

    /// The raw store has no such table
    #[error("unknown source table '{table}'")]
    UnknownSourceTable { table: String },

    #[error("table '{table}' has no column '{column}'")]
    UnknownSourceColumn { table: String, column: String },

    #[error("column '{column}' is produced twice in view '{view}'")]
    DuplicateOutputColumn { view: String, column: String },

    #[error("view '{view}' would select no column")]
    EmptyView { view: String },
}

/// Parse and validate a tabular file's text.
pub fn parse(
    text: &str,
    format: TabularFormat,
    file_stem: &str,
) -> Result<TabularPlan, TabularError> {
    let normalized;
    let text = match format {
        TabularFormat::Csv => text,
        TabularFormat::Tsv => {
            normalized = text.replace('\t', ",").replace("    ", ",");
            normalized.as_str()
        }
    };

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes());
    let mut records = reader.records();

    let header = records
        .next()
        .ok_or(TabularError::MissingHeader)?
        .map_err(TabularError::Csv)?;
    let width = header.len();
    if width < 2 {
        return Err(TabularError::HeaderTooShort { found: width });
    }
    if width % 2 != 0 {
        return Err(TabularError::OddHeader { found: width });
    }

    let mut mappings = header
        .iter()
        .collect::<Vec<_>>()
        .chunks(2)
        .map(|pair| parse_header_pair(pair[0], pair[1]))
        .collect::<Result<Vec<_>, _>>()?;

    for record in records {
        let record = record.map_err(TabularError::Csv)?;
        if record.len() != width {
            return Err(TabularError::RowWidth {
                line: record.position().map(|pos| pos.line()).unwrap_or_default(),
                found: record.len(),
                expected: width,
            });
        }
        for (mapping, pair) in mappings
            .iter_mut()
            .zip(record.iter().collect::<Vec<_>>().chunks(2))
        {
            if pair[0].is_empty() {
                continue;
            }
            mapping.substitutions.push(Substitution::new(pair[0], pair[1]));
        }
    }

    Ok(TabularPlan {
        file_stem: file_stem.to_string(),
        mappings,
    })
}

fn parse_header_pair(source: &str, target: &str) -> Result<ColumnMapping, TabularError> {
    let source = source.trim();
    let target = target.trim();

    let (source_table, source_column) = match source.split('.').collect::<Vec<_>>().as_slice() {
        [table, column] => (table.to_string(), column.to_string()),
        _ => {
            return Err(TabularError::MalformedSourceCell {
                cell: source.to_string(),
            });
        }
    };

    let (action, output_column) = match target.split('.').collect::<Vec<_>>().as_slice() {
        [column] => (ColumnAction::Rename, column.to_string()),
        [action, column] => {
            let action = match action.to_ascii_uppercase().as_str() {
                "RENAME" => ColumnAction::Rename,
                "NEW" => ColumnAction::New,
                "DELETE" => ColumnAction::Delete,
                _ => {
                    return Err(TabularError::UnknownAction {
                        cell: target.to_string(),
                        action: action.to_string(),
                    });
                }
            };
            (action, column.to_string())
        }
        _ => {
            return Err(TabularError::MalformedTargetCell {
                cell: target.to_string(),
            });
        }
    };

    for (cell, name) in [
        (source, &source_table),
        (source, &source_column),
        (target, &output_column),
    ] {
        validate_identifier(name).map_err(|err| TabularError::InvalidIdentifier {
            cell: cell.to_string(),
            source: err,
        })?;
    }

    Ok(ColumnMapping {
        source_table,
        source_column,
        action,
        output_column,
        substitutions: Vec::new(),
    })
}

impl TabularPlan {
    /// Source tables in first-appearance order.
    pub fn source_tables(&self) -> Vec<&str> {
        let mut tables: Vec<&str> = Vec::new();
        for mapping in &self.mappings {
            if !tables.contains(&mapping.source_table.as_str()) {
                tables.push(&mapping.source_table);
            }
        }
        tables
    }

    /// Emit one view per source table.
    ///
    /// `schemas` maps each raw table to its columns in ordinal order.
    pub fn compile(
        &self,
        schemas: &BTreeMap<String, Vec<String>>,
    ) -> Result<Vec<CompiledView>, TabularError> {
        let tables = self.source_tables();
        let single_table = tables.len() < 2;

        let mut views = Vec::with_capacity(tables.len());
        for table in tables {
            let view_name = if single_table {
                self.file_stem.clone()
            } else {
                format!("{table}_{}", self.file_stem)
            };
            validate_identifier(&view_name).map_err(|err| TabularError::InvalidViewName {
                name: view_name.clone(),
                source: err,
            })?;

            let columns = schemas
                .get(table)
                .ok_or_else(|| TabularError::UnknownSourceTable {
                    table: table.to_string(),
                })?;

            let mappings = self.mappings_of(table);
            for mapping in &mappings {
                if !columns.contains(&mapping.source_column) {
                    return Err(TabularError::UnknownSourceColumn {
                        table: table.to_string(),
                        column: mapping.source_column.clone(),
                    });
                }
            }

            let passthrough: Vec<&str> = columns
                .iter()
                .map(String::as_str)
                .filter(|column| {
                    !mappings.iter().any(|mapping| {
                        mapping.source_column == *column
                            && matches!(mapping.action, ColumnAction::Rename | ColumnAction::Delete)
                    })
                })
                .collect();
            let computed: Vec<&ColumnMapping> = mappings
                .into_iter()
                .filter(|mapping| mapping.action != ColumnAction::Delete)
                .collect();

            let mut output_names: Vec<&str> = passthrough.clone();
            for mapping in &computed {
                if output_names.contains(&mapping.output_column.as_str()) {
                    return Err(TabularError::DuplicateOutputColumn {
                        view: view_name,
                        column: mapping.output_column.clone(),
                    });
                }
                output_names.push(&mapping.output_column);
            }
            if output_names.is_empty() {
                return Err(TabularError::EmptyView { view: view_name });
            }

            let select_list = passthrough
                .iter()
                .map(|column| sql::ident(column).into_owned())
                .chain(computed.iter().map(|mapping| mapping.expression()))
                .collect::<Vec<_>>()
                .join(",\n    ");

            let sql = format!(
                "DROP VIEW IF EXISTS {view} CASCADE;\nCREATE VIEW {view} AS\nSELECT\n    {select_list}\nFROM {table}",
                view = sql::ident(&view_name),
                table = sql::ident(table),
            );
            views.push(CompiledView {
                name: view_name,
                source_table: table.to_string(),
                sql,
            });
        }

        Ok(views)
    }

    /// Mappings of `table`, grouped by source column in first-appearance order.
    fn mappings_of(&self, table: &str) -> Vec<&ColumnMapping> {
        let mut columns: Vec<&str> = Vec::new();
        for mapping in self.mappings.iter().filter(|m| m.source_table == table) {
            if !columns.contains(&mapping.source_column.as_str()) {
                columns.push(&mapping.source_column);
            }
        }
        columns
            .into_iter()
            .flat_map(|column| {
                self.mappings
                    .iter()
                    .filter(move |m| m.source_table == table && m.source_column == column)
            })
            .collect()
    }
}

/// Join compiled views into one executable script.
pub fn views_script(views: &[CompiledView]) -> String {
    let mut script = views
        .iter()
        .map(|view| view.sql.as_str())
        .collect::<Vec<_>>()
        .join(";\n");
    script.push(';');
    script
}

fn translate_capture_groups(text: &str) -> String {
    CAPTURE_GROUP_REF.replace_all(text, r"\${1}").into_owned()
}

//! Stage descriptors.
//!
//! A stage is declared by one TOML file anywhere under the staging directory:
//!
//! ```toml
//! [MAIN]
//! name = "courses"
//! workdir = "courses"          # optional, relative to the staging directory
//!
//! [IO]
//! datasources = ["raw_courses"]
//! datamarts = ["courses_view AS courses"]
//!
//! [STAGING]
//! files = ["cleanup.sql", "rename.csv"]
//! ```
//!
//! # Discovery rules
//!
//! - The staging directory is scanned recursively for `**/*.toml` files
//! - Files are visited in path order, so the load order is stable
//! - Descriptors with an empty `MAIN.name` (such as the `new-stage` template) are skipped
//! - Two descriptors declaring the same name are rejected

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    path::{Path, PathBuf},
};

use fs_err as fs;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::{
    resolver::{self, ResolveError, Task},
    sql::{ValidateIdentifierError, validate_identifier},
};

/// File name of the template written by [`write_empty_configuration`].
pub const EMPTY_CONFIGURATION_FILE: &str = "empty_configuration.toml";

/// A loaded, validated stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageConfig {
    pub name: String,
    /// Directory of the staging files, relative to the staging directory
    pub workdir: PathBuf,
    pub datasources: Vec<String>,
    pub staging_files: Vec<String>,
    pub datamarts: Vec<Datamart>,
    /// Descriptor file this stage was loaded from
    pub source_path: PathBuf,
}

impl StageConfig {
    /// Parse a descriptor's TOML text.
    pub fn from_toml_str(text: &str, source_path: &Path) -> Result<Self, LoadStageError> {
        let descriptor: StageDescriptor =
            toml::from_str(text).map_err(|err| LoadStageError::Parse {
                path: source_path.to_path_buf(),
                source: err,
            })?;

        let datamarts = descriptor
            .io
            .datamarts
            .iter()
            .map(|expression| {
                expression
                    .parse::<Datamart>()
                    .map_err(|err| LoadStageError::InvalidDatamart {
                        path: source_path.to_path_buf(),
                        stage: descriptor.main.name.clone(),
                        source: err,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            name: descriptor.main.name,
            workdir: PathBuf::from(descriptor.main.workdir),
            datasources: descriptor.io.datasources,
            staging_files: descriptor.staging.files,
            datamarts,
            source_path: source_path.to_path_buf(),
        })
    }

    /// Load one descriptor file.
    pub fn load(path: &Path) -> Result<Self, LoadStageError> {
        let text = fs::read_to_string(path).map_err(|err| LoadStageError::Read {
            path: path.to_path_buf(),
            source: err,
        })?;
        Self::from_toml_str(&text, path)
    }

    /// Location of one of this stage's staging files.
    pub fn staging_file_path(&self, staging_dir: &Path, file: &str) -> PathBuf {
        staging_dir.join(&self.workdir).join(file)
    }

    /// Resources this stage makes available: both ends of every datamart.
    pub fn produced_resources(&self) -> BTreeSet<&str> {
        self.datamarts
            .iter()
            .flat_map(|datamart| [datamart.from_view.as_str(), datamart.to_view.as_str()])
            .collect()
    }

    fn to_task(&self) -> Task {
        Task::new(
            self.name.as_str(),
            self.datasources.iter().map(String::as_str),
            self.produced_resources(),
        )
    }
}

/// A `fromView[ AS toView]` datamart expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datamart {
    /// View in the raw store the data is read from
    pub from_view: String,
    /// Warehouse table the data is promoted into
    pub to_view: String,
}

impl std::str::FromStr for Datamart {
    type Err = InvalidDatamartError;

    fn from_str(expression: &str) -> Result<Self, Self::Err> {
        let tokens: Vec<&str> = expression.split_whitespace().collect();
        let (from_view, to_view) = match tokens.as_slice() {
            [name] => (name.to_string(), name.to_string()),
            [from, keyword, to] if keyword.eq_ignore_ascii_case("AS") => {
                (from.to_string(), to.to_string())
            }
            _ => {
                return Err(InvalidDatamartError::Malformed {
                    expression: expression.to_string(),
                });
            }
        };

        for name in [&from_view, &to_view] {
            validate_identifier(name).map_err(|err| InvalidDatamartError::InvalidIdentifier {
                expression: expression.to_string(),
                source: err,
            })?;
        }

        Ok(Self { from_view, to_view })
    }
}

impl fmt::Display for Datamart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.from_view == self.to_view {
            f.write_str(&self.from_view)
        } else {
            write!(f, "{} AS {}", self.from_view, self.to_view)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidDatamartError {
    /// Neither a bare name nor `<from> AS <to>`
    #[error("malformed datamart expression '{expression}'")]
    Malformed { expression: String },

    #[error("invalid name in datamart expression '{expression}'")]
    InvalidIdentifier {
        expression: String,
        #[source]
        source: ValidateIdentifierError,
    },
}

/// Errors that occur while loading stage descriptors.
#[derive(Debug, thiserror::Error)]
pub enum LoadStageError {
    #[error("failed to read stage descriptor {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse stage descriptor {}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("stage '{stage}' in {} declares an invalid datamart", path.display())]
    InvalidDatamart {
        path: PathBuf,
        stage: String,
        #[source]
        source: InvalidDatamartError,
    },

    /// Two descriptors declare the same stage name
    #[error("duplicate stage '{name}': {} and {}", path1.display(), path2.display())]
    DuplicateStage {
        name: String,
        path1: PathBuf,
        path2: PathBuf,
    },

    #[error("failed to scan staging directory")]
    Walk(#[source] walkdir::Error),
}

/// Load every stage descriptor under `staging_dir`.
///
/// A missing directory yields no stages.
pub fn discover_stages(staging_dir: &Path) -> Result<Vec<StageConfig>, LoadStageError> {
    if !staging_dir.is_dir() {
        tracing::warn!(path = %staging_dir.display(), "staging_dir_not_found");
        return Ok(Vec::new());
    }

    let mut stages: Vec<StageConfig> = Vec::new();
    let mut seen: BTreeMap<String, PathBuf> = BTreeMap::new();

    for entry in WalkDir::new(staging_dir)
        .follow_links(false)
        .sort_by_file_name()
    {
        let entry = entry.map_err(LoadStageError::Walk)?;
        let path = entry.path();
        if !entry.file_type().is_file() || path.extension().and_then(|e| e.to_str()) != Some("toml")
        {
            continue;
        }

        let stage = StageConfig::load(path)?;
        if stage.name.trim().is_empty() {
            tracing::warn!(path = %path.display(), "stage_descriptor_without_name_skipped");
            continue;
        }

        if let Some(existing) = seen.get(&stage.name) {
            return Err(LoadStageError::DuplicateStage {
                name: stage.name,
                path1: existing.clone(),
                path2: path.to_path_buf(),
            });
        }

        tracing::debug!(stage = %stage.name, path = %path.display(), "stage_descriptor_loaded");
        seen.insert(stage.name.clone(), path.to_path_buf());
        stages.push(stage);
    }

    tracing::info!(path = %staging_dir.display(), count = stages.len(), "stage_descriptors_loaded");
    Ok(stages)
}

/// Order stages so that each runs after the stages producing its datasources.
///
/// `base` holds the resources that already exist, i.e. every table and view of the raw store.
pub fn order_stages(
    stages: Vec<StageConfig>,
    base: &BTreeSet<String>,
) -> Result<Vec<StageConfig>, ResolveError> {
    let tasks: Vec<Task> = stages.iter().map(StageConfig::to_task).collect();
    let order = resolver::resolve_order(&tasks, base)?;

    let mut by_name: BTreeMap<String, StageConfig> = stages
        .into_iter()
        .map(|stage| (stage.name.clone(), stage))
        .collect();
    Ok(order
        .into_iter()
        .filter_map(|name| by_name.remove(&name))
        .collect())
}

/// Render an ordered stage list as a text tree.
pub fn render_stage_order(stages: &[StageConfig]) -> String {
    if stages.is_empty() {
        return "  (No stages configured)".to_string();
    }

    let mut lines = Vec::new();
    for (index, stage) in stages.iter().enumerate() {
        lines.push(format!("  {}. {}", index + 1, stage.name));
        if !stage.datasources.is_empty() {
            lines.push(format!("     ├── Sources: {}", stage.datasources.join(", ")));
        }
        if !stage.staging_files.is_empty() {
            let files: Vec<&str> = stage
                .staging_files
                .iter()
                .map(|file| {
                    Path::new(file)
                        .file_name()
                        .and_then(|name| name.to_str())
                        .unwrap_or(file)
                })
                .collect();
            lines.push(format!("     ├── Files: {}", files.join(", ")));
        }
        if !stage.datamarts.is_empty() {
            let outputs: Vec<String> = stage.datamarts.iter().map(ToString::to_string).collect();
            lines.push(format!("     └── Outputs: {}", outputs.join(", ")));
        }
    }
    lines.join("\n")
}

/// Write an empty descriptor template into `dir`, returning its path.
pub fn write_empty_configuration(dir: &Path) -> Result<PathBuf, std::io::Error> {
    let template = StageDescriptor::default();
    let text = toml::to_string(&template).map_err(std::io::Error::other)?;

    fs::create_dir_all(dir)?;
    let path = dir.join(EMPTY_CONFIGURATION_FILE);
    fs::write(&path, text)?;
    Ok(path)
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StageDescriptor {
    #[serde(rename = "MAIN")]
    main: MainSection,
    #[serde(rename = "IO", default)]
    io: IoSection,
    #[serde(rename = "STAGING", default)]
    staging: StagingSection,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct MainSection {
    name: String,
    #[serde(default)]
    workdir: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IoSection {
    #[serde(default)]
    datasources: Vec<String>,
    #[serde(default)]
    datamarts: Vec<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StagingSection {
    #[serde(default)]
    files: Vec<String>,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;

    fn create_file(dir: &Path, relative_path: &str, content: &str) {
        let path = dir.join(relative_path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("failed to create parent dirs");
        }
        fs::write(&path, content).expect("failed to write file");
    }

    fn stage(name: &str, datasources: &[&str], datamarts: &[&str]) -> StageConfig {
        StageConfig {
            name: name.to_string(),
            workdir: PathBuf::new(),
            datasources: datasources.iter().map(|s| s.to_string()).collect(),
            staging_files: vec![],
            datamarts: datamarts
                .iter()
                .map(|d| d.parse().expect("datamart should parse"))
                .collect(),
            source_path: PathBuf::from(format!("{name}.toml")),
        }
    }

    #[test]
    fn datamart_parses_bare_and_renamed_expressions() {
        assert_eq!(
            "courses".parse::<Datamart>(),
            Ok(Datamart {
                from_view: "courses".into(),
                to_view: "courses".into(),
            })
        );
        assert_eq!(
            "  courses_view   as courses ".parse::<Datamart>(),
            Ok(Datamart {
                from_view: "courses_view".into(),
                to_view: "courses".into(),
            })
        );
    }

    #[test]
    fn datamart_keyword_must_be_whitespace_delimited() {
        //* When
        let datamart: Datamart = "classroom".parse().expect("bare name should parse");

        //* Then
        assert_eq!(datamart.to_view, "classroom", "'as' inside a name is not a keyword");
    }

    #[test]
    fn datamart_rejects_malformed_expressions() {
        assert!(matches!(
            "a b c".parse::<Datamart>(),
            Err(InvalidDatamartError::Malformed { .. })
        ));
        assert!(matches!(
            "x AS drop;table".parse::<Datamart>(),
            Err(InvalidDatamartError::InvalidIdentifier { .. })
        ));
    }

    #[test]
    fn from_toml_str_applies_section_defaults() {
        //* Given
        let text = "[MAIN]\nname = \"lonely\"\n";

        //* When
        let stage = StageConfig::from_toml_str(text, Path::new("lonely.toml"))
            .expect("descriptor should parse");

        //* Then
        assert_eq!(stage.workdir, PathBuf::new());
        assert!(stage.datasources.is_empty());
        assert!(stage.datamarts.is_empty());
        assert!(stage.staging_files.is_empty());
    }

    #[test]
    fn discover_stages_walks_nested_directories() {
        //* Given
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let base = temp_dir.path();
        create_file(
            base,
            "courses/courses.toml",
            &stage_toml("courses", "courses", &["raw_courses"], &["courses_view AS courses"]),
        );
        create_file(
            base,
            "students.toml",
            &stage_toml("students", "", &[], &["students"]),
        );
        create_file(base, "courses/cleanup.sql", "SELECT 1");

        //* When
        let stages = discover_stages(base).expect("should discover stages");

        //* Then
        let names: Vec<&str> = stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["courses", "students"]);
        assert_eq!(
            stages[0].staging_file_path(base, "cleanup.sql"),
            base.join("courses").join("cleanup.sql")
        );
    }

    #[test]
    fn discover_stages_rejects_duplicate_names() {
        //* Given
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let base = temp_dir.path();
        create_file(base, "a.toml", &stage_toml("dup", "", &[], &[]));
        create_file(base, "nested/b.toml", &stage_toml("dup", "", &[], &[]));

        //* When
        let result = discover_stages(base);

        //* Then
        let err = result.expect_err("should reject duplicate stage names");
        assert!(matches!(err, LoadStageError::DuplicateStage { name, .. } if name == "dup"));
    }

    #[test]
    fn discover_stages_skips_the_empty_template() {
        //* Given
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let path = write_empty_configuration(temp_dir.path()).expect("should write template");

        //* When
        let stages = discover_stages(temp_dir.path()).expect("should discover stages");

        //* Then
        assert!(path.ends_with(EMPTY_CONFIGURATION_FILE));
        assert!(stages.is_empty());
    }

    #[test]
    fn discover_stages_of_missing_directory_is_empty() {
        let stages = discover_stages(Path::new("/nonexistent/databridge/staging"))
            .expect("missing directory should not fail");
        assert!(stages.is_empty());
    }

    #[test]
    fn order_stages_finds_order_regardless_of_declaration_order() {
        //* Given
        let stages = vec![
            stage("b", &["x"], &["x_derived"]),
            stage("a", &[], &["raw_x AS x"]),
        ];

        //* When
        let ordered = order_stages(stages, &BTreeSet::new()).expect("should order stages");

        //* Then
        let names: Vec<&str> = ordered.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn order_stages_detects_mutual_requirements() {
        //* Given
        let stages = vec![
            stage("a", &["x_derived"], &["raw_x AS x"]),
            stage("b", &["x"], &["x_derived"]),
        ];

        //* When
        let result = order_stages(stages, &BTreeSet::new());

        //* Then
        assert!(matches!(result, Err(ResolveError::CycleDetected { .. })));
    }

    #[test]
    fn render_stage_order_draws_a_tree() {
        //* Given
        let mut first = stage("courses", &["raw_courses"], &["courses_view AS courses"]);
        first.staging_files = vec!["sub/cleanup.sql".into(), "rename.csv".into()];
        let second = stage("empty", &[], &[]);

        //* When
        let rendered = render_stage_order(&[first, second]);

        //* Then
        assert_eq!(
            rendered,
            [
                "  1. courses",
                "     ├── Sources: raw_courses",
                "     ├── Files: cleanup.sql, rename.csv",
                "     └── Outputs: courses_view AS courses",
                "  2. empty",
            ]
            .join("\n")
        );
        assert_eq!(render_stage_order(&[]), "  (No stages configured)");
    }

    fn stage_toml(
        name: &str,
        workdir: &str,
        datasources: &[&str],
        datamarts: &[&str],
    ) -> String {
        let quote = |items: &[&str]| {
            items
                .iter()
                .map(|item| format!("\"{item}\""))
                .collect::<Vec<_>>()
                .join(", ")
        };
        format!(
            "[MAIN]\nname = \"{name}\"\nworkdir = \"{workdir}\"\n\n[IO]\ndatasources = [{}]\ndatamarts = [{}]\n\n[STAGING]\nfiles = []\n",
            quote(datasources),
            quote(datamarts),
        )
    }
}

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;
use time::macros::format_description;

pub const URI_SCHEME: &str = "storage://";
pub const COLLECTION_DIR: &str = "doc-reader-outputs";

/// Container + path identifying one stored object.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    pub container: String,
    pub path: String,
}

impl ObjectRef {
    pub fn new(container: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            path: path.into(),
        }
    }

    /// Parses the `storage://container/path` form.
    pub fn parse_uri(raw: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidUri {
            uri: raw.to_string(),
            reason: reason.to_string(),
        };

        let rest = raw
            .trim()
            .strip_prefix(URI_SCHEME)
            .ok_or_else(|| invalid("expected storage://container/path"))?;
        let (container, path) = rest
            .split_once('/')
            .ok_or_else(|| invalid("missing object path"))?;
        if container.is_empty() {
            return Err(invalid("empty container"));
        }
        if path.is_empty() || path.ends_with('/') {
            return Err(invalid("missing object path"));
        }
        Ok(Self::new(container, path))
    }

    /// Final path segment.
    pub fn filename(&self) -> &str {
        split_parent(&self.path).1
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{URI_SCHEME}{}/{}", self.container, self.path)
    }
}

/// Batch output target. Only the container decides where outputs land; a
/// key prefix after the first `/` is kept for reporting and otherwise ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputPrefix {
    pub container: String,
    pub key_prefix: Option<String>,
}

impl OutputPrefix {
    /// Splits on the first `/`. Without one, the whole value is the container.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let trimmed = raw.trim();
        let rest = trimmed.strip_prefix(URI_SCHEME).unwrap_or(trimmed);
        let (container, key_prefix) = match rest.split_once('/') {
            Some((c, p)) => (c, p.trim_matches('/')),
            None => (rest, ""),
        };
        if container.is_empty() {
            return Err(ConfigError::InvalidPrefix {
                prefix: raw.to_string(),
                reason: "empty container".to_string(),
            });
        }
        Ok(Self {
            container: container.to_string(),
            key_prefix: (!key_prefix.is_empty()).then(|| key_prefix.to_string()),
        })
    }
}

/// Operating mode of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Mode {
    Batch {
        input_container: String,
        output: OutputPrefix,
    },
    Single {
        source: ObjectRef,
    },
}

impl Mode {
    /// Picks the mode from the environment-style settings. Blank values count
    /// as unset; a source URI selects single-item mode.
    pub fn from_settings(
        source_uri: Option<&str>,
        input_container: Option<&str>,
        output_prefix: Option<&str>,
    ) -> Result<Self, ConfigError> {
        if let Some(uri) = present(source_uri) {
            return Ok(Mode::Single {
                source: ObjectRef::parse_uri(uri)?,
            });
        }

        let input_container = present(input_container).ok_or(ConfigError::Missing {
            key: "INPUT_CONTAINER",
        })?;
        let output_prefix = present(output_prefix).ok_or(ConfigError::Missing {
            key: "OUTPUT_LOCATION_PREFIX",
        })?;

        Ok(Mode::Batch {
            input_container: input_container.to_string(),
            output: OutputPrefix::parse(output_prefix)?,
        })
    }

    pub fn is_single(&self) -> bool {
        matches!(self, Mode::Single { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Mode::Batch { .. } => "batch",
            Mode::Single { .. } => "single",
        }
    }
}

/// Second-granularity UTC stamp shared by every output of one run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunTimestamp(String);

impl RunTimestamp {
    pub fn now() -> Result<Self, time::error::Format> {
        Self::at(OffsetDateTime::now_utc())
    }

    pub fn at(instant: OffsetDateTime) -> Result<Self, time::error::Format> {
        let fmt = format_description!("[year]-[month]-[day]-[hour]-[minute]-[second]");
        let utc = instant.to_offset(time::UtcOffset::UTC);
        Ok(Self(utc.format(fmt)?))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn is_pdf_key(path: &str) -> bool {
    path.to_ascii_lowercase().ends_with(".pdf")
}

/// Filename with its last extension removed. A name without `.` is returned
/// unchanged.
pub fn base_name(filename: &str) -> &str {
    match filename.rsplit_once('.') {
        Some((stem, _)) => stem,
        None => filename,
    }
}

/// Trimmed value, or `None` when unset or blank.
fn present(v: Option<&str>) -> Option<&str> {
    v.map(str::trim).filter(|s| !s.is_empty())
}

fn split_parent(path: &str) -> (&str, &str) {
    match path.rsplit_once('/') {
        Some((parent, name)) => (parent, name),
        None => ("", path),
    }
}

/// Computes where the markdown for `input` is published. Pure and
/// deterministic for a given `(input, mode, ts)`.
pub fn resolve(input: &ObjectRef, mode: &Mode, ts: &RunTimestamp) -> ObjectRef {
    let (parent, filename) = split_parent(&input.path);
    let base = base_name(filename);

    match mode {
        Mode::Single { .. } => {
            let path = if parent.is_empty() {
                format!("{base}.md")
            } else {
                format!("{parent}/{base}.md")
            };
            ObjectRef::new(input.container.clone(), path)
        }
        Mode::Batch { output, .. } => {
            let path = format!("{COLLECTION_DIR}/{ts}/{base}-{ts}.md");
            ObjectRef::new(output.container.clone(), path)
        }
    }
}

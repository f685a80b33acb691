use std::path::{Path, PathBuf};
use thiserror::Error;

/// Line and column of a dependency or diagnostic inside a source file (1-based)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct SourceLocation {
    pub line: usize,
    pub column: usize,
}

impl SourceLocation {
    pub fn new(line: usize, column: usize) -> Self {
        Self { line, column }
    }

    /// Compute the location of a byte offset within `source`
    pub fn from_offset(source: &str, offset: usize) -> Self {
        let prefix = &source[..offset.min(source.len())];
        let line = prefix.matches('\n').count() + 1;
        let column = match prefix.rfind('\n') {
            Some(newline) => prefix.len() - newline,
            None => prefix.len() + 1,
        };
        Self { line, column }
    }
}

/// Enhanced error with file location context
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    pub file_path: Option<PathBuf>,
    pub location: Option<SourceLocation>,
    pub code_frame: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file_path = Some(path.into());
        self
    }

    pub fn with_location(mut self, location: SourceLocation) -> Self {
        self.location = Some(location);
        self
    }

    /// Attach the lines surrounding `location` from `source` as a code frame
    pub fn with_source(mut self, source: &str) -> Self {
        if let Some(location) = self.location {
            self.code_frame = Some(code_frame(source, location));
        }
        self
    }
}

/// Render up to two lines of context on either side of `location`
pub fn code_frame(source: &str, location: SourceLocation) -> String {
    let first = location.line.saturating_sub(2).max(1);
    let last = location.line + 2;
    let mut output = String::new();

    for (i, line) in source.lines().enumerate() {
        let line_num = i + 1;
        if line_num < first || line_num > last {
            continue;
        }

        if line_num == location.line {
            output.push_str(&format!("> {:3} | {}\n", line_num, line));
            output.push_str(&format!(
                "      | {}^\n",
                " ".repeat(location.column.saturating_sub(1))
            ));
        } else {
            output.push_str(&format!("  {:3} | {}\n", line_num, line));
        }
    }

    output
}

#[derive(Error, Debug)]
pub enum KilnError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cannot find module '{specifier}' from '{}'", from.display())]
    ModuleNotFound { specifier: String, from: PathBuf },

    #[error("Cannot resolve dependency '{specifier}'")]
    Resolution {
        specifier: String,
        context: ErrorContext,
    },

    #[error("Compile error: {message}")]
    Compile {
        message: String,
        context: Option<ErrorContext>,
    },

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Worker pool error: {0}")]
    Pool(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Build error: {0}")]
    Build(String),

    #[error("{0}")]
    Other(String),
}

impl KilnError {
    pub fn module_not_found(specifier: &str, from: &Path) -> Self {
        Self::ModuleNotFound {
            specifier: specifier.to_string(),
            from: from.to_path_buf(),
        }
    }

    /// Create a compile error for `path` without a location
    pub fn compile(message: impl Into<String>, path: &Path) -> Self {
        Self::Compile {
            message: message.into(),
            context: Some(ErrorContext::new().with_file(path)),
        }
    }

    /// Create a compile error pointing at a location in `path`
    pub fn compile_at(message: impl Into<String>, path: &Path, location: SourceLocation) -> Self {
        Self::Compile {
            message: message.into(),
            context: Some(ErrorContext::new().with_file(path).with_location(location)),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn cache(message: impl Into<String>) -> Self {
        Self::Cache(message.into())
    }

    pub fn pool(message: impl Into<String>) -> Self {
        Self::Pool(message.into())
    }

    pub fn build(message: impl Into<String>) -> Self {
        Self::Build(message.into())
    }

    /// File the error originated from, if known
    pub fn file_path(&self) -> Option<&Path> {
        match self {
            KilnError::Resolution { context, .. } => context.file_path.as_deref(),
            KilnError::Compile {
                context: Some(context),
                ..
            } => context.file_path.as_deref(),
            KilnError::ModuleNotFound { from, .. } => Some(from.as_path()),
            _ => None,
        }
    }

    /// Format error with enhanced context display
    pub fn format_detailed(&self) -> String {
        match self {
            KilnError::Resolution { context, .. } => {
                Self::format_with_context(&self.to_string(), Some(context))
            }
            KilnError::Compile { context, .. } => {
                Self::format_with_context(&self.to_string(), context.as_ref())
            }
            _ => self.to_string(),
        }
    }

    fn format_with_context(message: &str, context: Option<&ErrorContext>) -> String {
        let mut output = message.to_string();

        if let Some(ctx) = context {
            if let Some(ref file_path) = ctx.file_path {
                output.push_str(&format!("\n  File: {}", file_path.display()));
            }

            if let Some(location) = ctx.location {
                output.push_str(&format!(
                    "\n  Location: line {}, column {}",
                    location.line, location.column
                ));
            }

            if let Some(ref frame) = ctx.code_frame {
                output.push_str(&format!("\n{}", frame));
            }
        }

        output
    }
}

pub type Result<T> = std::result::Result<T, KilnError>;

impl From<regex::Error> for KilnError {
    fn from(err: regex::Error) -> Self {
        KilnError::Other(format!("Regex error: {}", err))
    }
}

impl From<serde_json::Error> for KilnError {
    fn from(err: serde_json::Error) -> Self {
        KilnError::config(format!("Invalid JSON: {}", err))
    }
}

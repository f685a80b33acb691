// Default compile function: reads a source file, passes its content through
// and extracts the dependencies the bundler has to follow.

use crate::core::interfaces::Compiler;
use crate::core::models::*;
use crate::utils::{KilnError, Result, SourceLocation};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::Path;

// Pre-compiled regex patterns for dependency extraction
static JS_STATIC_IMPORT_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?m)(?:^|[;\s])(?:import|export)\s+(?:[\w*${}\s,]+?\s+from\s+)?['"]([^'"\n]+)['"]"#).unwrap()
});

static JS_DYNAMIC_IMPORT_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"\bimport\s*\(\s*['"]([^'"\n]+)['"]\s*\)"#).unwrap()
});

static JS_REQUIRE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"\brequire\s*\(\s*['"]([^'"\n]+)['"]\s*\)"#).unwrap()
});

static CSS_IMPORT_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"@import\s+(?:url\s*\(\s*)?['"]([^'"]+)['"]\s*\)?\s*([^;]*);"#).unwrap()
});

static HTML_SRC_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"<(?:script|img|link)\b[^>]*?\s(?:src|href)\s*=\s*["']([^"']+)["']"#).unwrap()
});

/// Style languages whose `@import`s are inlined by their own compiler
const PREPROCESSED_STYLES: &[&str] = &["less", "scss", "sass", "styl"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceFamily {
    Script,
    Json,
    Style,
    Markup,
    Other,
}

impl SourceFamily {
    fn of(extension: &str) -> Self {
        match extension {
            "js" | "jsx" | "mjs" | "cjs" | "ts" | "tsx" => SourceFamily::Script,
            "json" => SourceFamily::Json,
            "css" | "less" | "scss" | "sass" | "styl" => SourceFamily::Style,
            "html" | "htm" => SourceFamily::Markup,
            _ => SourceFamily::Other,
        }
    }

    fn output_kind(self, extension: &str) -> AssetKind {
        match self {
            SourceFamily::Script | SourceFamily::Json => AssetKind::js(),
            SourceFamily::Style => AssetKind::css(),
            SourceFamily::Markup => AssetKind::html(),
            SourceFamily::Other => AssetKind::new(extension),
        }
    }
}

/// Pass-through compiler with regex dependency extraction.
///
/// No transform happens beyond wrapping JSON as a CommonJS module and
/// stripping blank lines and indentation when minifying.
#[derive(Debug, Default, Clone)]
pub struct SourceCompiler;

impl SourceCompiler {
    pub fn new() -> Self {
        Self
    }

    /// Dependencies declared by `source`, in source order
    pub fn extract_dependencies(&self, path: &Path, source: &str) -> Vec<Dependency> {
        let extension = extension_of(path);
        let mut found: Vec<(usize, Dependency)> = Vec::new();

        match SourceFamily::of(&extension) {
            SourceFamily::Script => {
                for (regex, dynamic) in [
                    (&*JS_STATIC_IMPORT_REGEX, false),
                    (&*JS_REQUIRE_REGEX, false),
                    (&*JS_DYNAMIC_IMPORT_REGEX, true),
                ] {
                    for captures in regex.captures_iter(source) {
                        let specifier = &captures[1];
                        let offset = captures.get(1).map(|m| m.start()).unwrap_or(0);
                        let mut dep = Dependency::new(specifier)
                            .at(SourceLocation::from_offset(source, offset));
                        dep.dynamic = dynamic;
                        found.push((offset, dep));
                    }
                }
            }
            SourceFamily::Style => {
                let inlined = PREPROCESSED_STYLES.contains(&extension.as_str());
                for captures in CSS_IMPORT_REGEX.captures_iter(source) {
                    if is_external(&captures[1]) {
                        continue;
                    }
                    let offset = captures.get(1).map(|m| m.start()).unwrap_or(0);
                    let mut dep = Dependency::new(url_specifier(&captures[1]))
                        .at(SourceLocation::from_offset(source, offset));
                    let media = captures.get(2).map(|m| m.as_str().trim()).unwrap_or("");
                    if !media.is_empty() {
                        dep = dep.with_media(media);
                    }
                    if inlined {
                        dep = dep.included_in_parent();
                    }
                    found.push((offset, dep));
                }
            }
            SourceFamily::Markup => {
                for captures in HTML_SRC_REGEX.captures_iter(source) {
                    let specifier = &captures[1];
                    if is_external(specifier) {
                        continue;
                    }
                    let offset = captures.get(1).map(|m| m.start()).unwrap_or(0);
                    found.push((
                        offset,
                        Dependency::new(url_specifier(specifier))
                            .at(SourceLocation::from_offset(source, offset)),
                    ));
                }
            }
            SourceFamily::Json | SourceFamily::Other => {}
        }

        found.sort_by_key(|(offset, _)| *offset);
        found.into_iter().map(|(_, dep)| dep).collect()
    }
}

impl Compiler for SourceCompiler {
    fn compile(
        &self,
        path: &Path,
        _package: &PackageMetadata,
        options: &BuildOptions,
    ) -> Result<CompiledUnit> {
        let source = std::fs::read_to_string(path)
            .map_err(|e| KilnError::compile(format!("Cannot read {}: {}", path.display(), e), path))?;

        let extension = extension_of(path);
        let family = SourceFamily::of(&extension);
        let dependencies = self.extract_dependencies(path, &source);

        let mut content = match family {
            SourceFamily::Json => {
                serde_json::from_str::<serde_json::Value>(&source).map_err(|e| {
                    KilnError::compile_at(
                        format!("Invalid JSON: {}", e),
                        path,
                        SourceLocation::new(e.line(), e.column()),
                    )
                })?;
                format!("module.exports = {};", source.trim())
            }
            // The packager places imported sheets; only external imports stay
            SourceFamily::Style if !PREPROCESSED_STYLES.contains(&extension.as_str()) => {
                strip_local_imports(&source)
            }
            _ => source,
        };

        if options.minify {
            content = minify_text(&content);
        }

        let generated = BTreeMap::from([(family.output_kind(&extension), content)]);
        let hash = hash_generated(&generated);

        Ok(CompiledUnit {
            generated,
            hash,
            dependencies,
        })
    }
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

fn is_external(specifier: &str) -> bool {
    specifier.starts_with("http://")
        || specifier.starts_with("https://")
        || specifier.starts_with("//")
        || specifier.starts_with("data:")
        || specifier.starts_with('#')
}

/// Stylesheet and markup references are URLs: a bare name is a sibling file
/// and `~name` opts into module resolution
fn url_specifier(raw: &str) -> String {
    if let Some(module) = raw.strip_prefix('~') {
        module.to_string()
    } else if raw.starts_with('/') || raw.starts_with("./") || raw.starts_with("../") {
        raw.to_string()
    } else {
        format!("./{}", raw)
    }
}

fn strip_local_imports(source: &str) -> String {
    CSS_IMPORT_REGEX
        .replace_all(source, |captures: &regex::Captures| {
            if is_external(&captures[1]) {
                captures[0].to_string()
            } else {
                String::new()
            }
        })
        .into_owned()
}

fn minify_text(content: &str) -> String {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Fingerprint over every generated output, kind included
pub fn hash_generated(generated: &BTreeMap<AssetKind, String>) -> String {
    let mut hasher = blake3::Hasher::new();
    for (kind, content) in generated {
        hasher.update(kind.as_str().as_bytes());
        hasher.update(&[0]);
        hasher.update(content.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

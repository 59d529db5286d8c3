//! Rendering configuration templates into concrete files.
//!
//! Templates are byte streams with literal `{placeholder}` tokens. Rendering
//! copies the template to its destination and replaces every occurrence of
//! each token; there is no escaping, no conditionals and no partial merge
//! with whatever was at the destination before. Template bytes outside the
//! tokens are copied untouched, whatever their encoding.
use std::{
    collections::BTreeMap,
    fs::{self, OpenOptions},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
};

use memchr::memmem;
use tracing::debug;

use crate::error::ConfigError;

/// Placeholder token to replacement value. Iteration order is the key order,
/// which keeps repeated renders deterministic.
pub type SubstitutionMap = BTreeMap<String, String>;

/// Builds a [`SubstitutionMap`] from `(token, value)` pairs.
pub fn substitutions<I, K, V>(pairs: I) -> SubstitutionMap
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    pairs
        .into_iter()
        .map(|(key, value)| (key.into(), value.into()))
        .collect()
}

/// A template and where its rendered copy goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateBinding {
    /// Source template.
    pub template: PathBuf,
    /// Rendered file.
    pub destination: PathBuf,
}

impl TemplateBinding {
    /// Pairs a template with its destination.
    pub fn new(template: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        Self {
            template: template.into(),
            destination: destination.into(),
        }
    }

    /// Renders this binding with `values`.
    pub fn render(&self, values: &SubstitutionMap) -> Result<(), ConfigError> {
        render(&self.template, &self.destination, values)
    }
}

/// Renders `template` into `destination`, overwriting it.
pub fn render(
    template: &Path,
    destination: &Path,
    values: &SubstitutionMap,
) -> Result<(), ConfigError> {
    let mut content = match fs::read(template) {
        Ok(content) => content,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(ConfigError::TemplateNotFound {
                path: template.to_path_buf(),
            });
        }
        Err(err) => return Err(ConfigError::io(template, err)),
    };

    for (token, value) in values {
        content = replace_all(&content, token.as_bytes(), value.as_bytes());
    }

    ensure_parent(destination)?;
    fs::write(destination, content).map_err(|err| ConfigError::io(destination, err))?;
    debug!(
        "Rendered {} -> {}",
        template.display(),
        destination.display()
    );
    Ok(())
}

/// Replaces every non-overlapping `needle` in `haystack` with `with`.
fn replace_all(haystack: &[u8], needle: &[u8], with: &[u8]) -> Vec<u8> {
    if needle.is_empty() {
        return haystack.to_vec();
    }
    let mut out = Vec::with_capacity(haystack.len());
    let mut last = 0;
    for at in memmem::find_iter(haystack, needle) {
        out.extend_from_slice(&haystack[last..at]);
        out.extend_from_slice(with);
        last = at + needle.len();
    }
    out.extend_from_slice(&haystack[last..]);
    out
}

/// Appends `lines`, each newline terminated, to `path`.
pub fn append_lines<S: AsRef<str>>(path: &Path, lines: &[S]) -> Result<(), ConfigError> {
    ensure_parent(path)?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|err| ConfigError::io(path, err))?;

    let mut buffer = String::new();
    for line in lines {
        buffer.push_str(line.as_ref());
        buffer.push('\n');
    }
    file.write_all(buffer.as_bytes())
        .map_err(|err| ConfigError::io(path, err))
}

/// Deletes `path` if present and creates it again, empty.
pub fn recreate_empty(path: &Path) -> Result<(), ConfigError> {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => return Err(ConfigError::io(path, err)),
    }
    ensure_parent(path)?;
    fs::File::create(path)
        .map(|_| ())
        .map_err(|err| ConfigError::io(path, err))
}

/// Deletes `dir` with everything in it, then creates it again, empty.
pub fn recreate_dir(dir: &Path) -> Result<(), ConfigError> {
    match fs::remove_dir_all(dir) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => return Err(ConfigError::io(dir, err)),
    }
    ensure_dir(dir)
}

/// Creates `dir` and its ancestors.
pub fn ensure_dir(dir: &Path) -> Result<(), ConfigError> {
    fs::create_dir_all(dir).map_err(|err| ConfigError::io(dir, err))
}

fn ensure_parent(path: &Path) -> Result<(), ConfigError> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => ensure_dir(parent),
        _ => Ok(()),
    }
}

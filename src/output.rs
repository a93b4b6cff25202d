//! The in-memory result of a generator run.
//!
//! Build steps add [`FileData`] entries to a [`GeneratorOutput`]; the sync
//! engine later reconciles that tree with what already exists on disk.

use std::collections::BTreeMap;
use std::collections::HashMap;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::error::OutputError;

/// The content of an output file.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FileContents {
    /// Text content (UTF-8).
    Text(String),
    /// Binary content (raw bytes).
    Binary(Vec<u8>),
}

impl FileContents {
    /// Returns the text, if this is a text file.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FileContents::Text(text) => Some(text),
            FileContents::Binary(_) => None,
        }
    }

    /// Decodes raw bytes read from disk, preferring text.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        match String::from_utf8(bytes) {
            Ok(text) if !text.contains('\0') => FileContents::Text(text),
            Ok(text) => FileContents::Binary(text.into_bytes()),
            Err(err) => FileContents::Binary(err.into_bytes()),
        }
    }
}

impl AsRef<[u8]> for FileContents {
    fn as_ref(&self) -> &[u8] {
        match self {
            FileContents::Text(s) => s.as_bytes(),
            FileContents::Binary(b) => b.as_slice(),
        }
    }
}

impl From<String> for FileContents {
    fn from(value: String) -> Self {
        FileContents::Text(value)
    }
}

impl From<&str> for FileContents {
    fn from(value: &str) -> Self {
        FileContents::Text(value.to_string())
    }
}

impl From<Vec<u8>> for FileContents {
    fn from(value: Vec<u8>) -> Self {
        FileContents::Binary(value)
    }
}

/// Which generator and template produced a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateInfo {
    pub generator: String,
    pub template: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_data: Option<serde_json::Value>,
}

impl TemplateInfo {
    pub fn new(generator: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            generator: generator.into(),
            template: template.into(),
            instance_data: None,
        }
    }

    pub fn with_instance_data(mut self, data: serde_json::Value) -> Self {
        self.instance_data = Some(data);
        self
    }
}

/// Per-file switches for the sync engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteOptions {
    /// Do not run the formatter on this file.
    pub skip_formatting: bool,
    /// Create the file if missing, but never touch an existing one.
    pub never_overwrite: bool,
    /// Ids this file was known under in earlier runs.
    pub alternate_ids: Vec<String>,
}

/// A single file in the generator output.
#[derive(Debug, Clone, PartialEq)]
pub struct FileData {
    pub contents: FileContents,
    /// Identity of the file, independent of its path.
    pub id: Option<String>,
    pub template_info: Option<TemplateInfo>,
    pub write_options: WriteOptions,
}

impl FileData {
    pub fn new(contents: impl Into<FileContents>) -> Self {
        Self {
            contents: contents.into(),
            id: None,
            template_info: None,
            write_options: WriteOptions::default(),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(FileContents::Text(text.into()))
    }

    pub fn binary(bytes: impl Into<Vec<u8>>) -> Self {
        Self::new(FileContents::Binary(bytes.into()))
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn template(mut self, info: TemplateInfo) -> Self {
        self.template_info = Some(info);
        self
    }

    pub fn options(mut self, options: WriteOptions) -> Self {
        self.write_options = options;
        self
    }
}

/// Every file produced by one generator run, keyed by output-relative path.
#[derive(Debug, Clone, Default)]
pub struct GeneratorOutput {
    files: BTreeMap<Utf8PathBuf, FileData>,
    ids: HashMap<String, Utf8PathBuf>,
}

impl GeneratorOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a file, rejecting duplicate paths, duplicate ids and paths that
    /// escape the output directory.
    ///
    /// Files without an explicit id are identified by their path.
    pub fn add(&mut self, path: impl AsRef<Utf8Path>, mut file: FileData) -> Result<(), OutputError> {
        let path = normalize_output_path(path.as_ref())?;

        if self.files.contains_key(&path) {
            return Err(OutputError::DuplicatePath(path));
        }

        let id = file.id.get_or_insert_with(|| path.to_string()).clone();
        if let Some(first) = self.ids.get(&id) {
            return Err(OutputError::DuplicateId {
                id,
                first: first.clone(),
                second: path,
            });
        }

        self.ids.insert(id, path.clone());
        self.files.insert(path, file);
        Ok(())
    }

    /// Replaces the contents of an existing file, keeping its identity.
    pub(crate) fn replace_contents(&mut self, path: &Utf8Path, contents: FileContents) -> bool {
        match self.files.get_mut(path) {
            Some(file) => {
                file.contents = contents;
                true
            }
            None => false,
        }
    }

    /// Drops a file from the output.
    pub fn remove(&mut self, path: &Utf8Path) -> Option<FileData> {
        let file = self.files.remove(path)?;
        if let Some(id) = &file.id {
            self.ids.remove(id);
        }
        Some(file)
    }

    pub fn get(&self, path: impl AsRef<Utf8Path>) -> Option<&FileData> {
        self.files.get(path.as_ref())
    }

    /// Finds the path a file id currently maps to.
    pub fn path_of(&self, id: &str) -> Option<&Utf8Path> {
        self.ids.get(id).map(Utf8PathBuf::as_path)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Utf8PathBuf, &FileData)> {
        self.files.iter()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Normalize a path, removing things like `.` and `..`, and reject anything
/// that is absolute or climbs out of the output root.
///
/// CAUTION: This does not resolve symlinks (unlike [`std::fs::canonicalize`]).
pub(crate) fn normalize_output_path(path: &Utf8Path) -> Result<Utf8PathBuf, OutputError> {
    let mut ret = Utf8PathBuf::new();

    for component in path.components() {
        match component {
            Utf8Component::Prefix(..) | Utf8Component::RootDir => {
                return Err(OutputError::InvalidPath(path.to_path_buf()));
            }
            Utf8Component::CurDir => {}
            Utf8Component::ParentDir => {
                if !ret.pop() {
                    return Err(OutputError::InvalidPath(path.to_path_buf()));
                }
            }
            Utf8Component::Normal(c) => {
                ret.push(c);
            }
        }
    }

    if ret.as_str().is_empty() {
        return Err(OutputError::InvalidPath(path.to_path_buf()));
    }

    Ok(ret)
}

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

/// Where each file id lived at the end of a run.
///
/// Serialized as a JSON object with sorted keys, so the file is stable
/// across runs and friendly to version control.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileIdMap(BTreeMap<String, Utf8PathBuf>);

impl FileIdMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<&Utf8Path> {
        self.0.get(id).map(Utf8PathBuf::as_path)
    }

    pub fn insert(&mut self, id: impl Into<String>, path: impl Into<Utf8PathBuf>) {
        self.0.insert(id.into(), path.into());
    }

    pub fn contains_id(&self, id: &str) -> bool {
        self.0.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Utf8Path)> {
        self.0.iter().map(|(id, path)| (id.as_str(), path.as_path()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn to_json(&self) -> serde_json::Result<String> {
        let mut text = serde_json::to_string_pretty(self)?;
        text.push('\n');
        Ok(text)
    }
}

impl FromIterator<(String, Utf8PathBuf)> for FileIdMap {
    fn from_iter<I: IntoIterator<Item = (String, Utf8PathBuf)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

use anyhow::Context;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::info;

use crate::error::FinetuneError;

/// Bijection between the class IDs a dataset declares and contiguous
/// zero-based indices, in declaration order.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelMap {
    class_ids: Vec<i64>,
    names: Vec<String>,
    index: HashMap<i64, usize>,
}

impl LabelMap {
    /// Build from `(class id, display name)` pairs. Duplicate IDs are rejected.
    pub fn from_entries(
        entries: impl IntoIterator<Item = (i64, String)>,
        source: &Path,
    ) -> Result<Self, FinetuneError> {
        let mut class_ids = Vec::new();
        let mut names = Vec::new();
        let mut index = HashMap::new();

        for (id, name) in entries {
            if index.insert(id, class_ids.len()).is_some() {
                return Err(FinetuneError::DuplicateClassId {
                    id,
                    path: source.to_path_buf(),
                });
            }
            class_ids.push(id);
            names.push(name);
        }

        Ok(Self {
            class_ids,
            names,
            index,
        })
    }

    /// Parse a local-dataset name file: `id<TAB>chinese<TAB>english` per line.
    ///
    /// Lines with fewer than three fields are ignored.
    pub fn from_name_file(path: &Path) -> anyhow::Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read name file: {:?}", path))?;

        let mut entries = Vec::new();
        for (line_no, line) in text.lines().enumerate() {
            let parts: Vec<&str> = line.trim().split('\t').collect();
            if parts.len() < 3 {
                continue;
            }
            let id = parts[0].trim().parse::<i64>().map_err(|e| FinetuneError::Parse {
                path: path.to_path_buf(),
                line: line_no + 1,
                reason: format!("bad class id {:?}: {}", parts[0], e),
            })?;
            entries.push((id, format!("{} ({})", parts[1].trim(), parts[2].trim())));
        }

        let map = Self::from_entries(entries, path)?;
        info!("Loaded {} class names from {:?}", map.len(), path);
        Ok(map)
    }

    /// Parse a plain class list (one name per line); the line number is the ID.
    pub fn from_class_list(path: &Path) -> anyhow::Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read class list: {:?}", path))?;

        let entries = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .enumerate()
            .map(|(i, name)| (i as i64, name.to_string()));

        let map = Self::from_entries(entries, path)?;
        info!("Loaded {} classes from {:?}", map.len(), path);
        Ok(map)
    }

    /// Two-class map used by the dataset discriminator.
    pub fn sources(benchmark: &str, local: &str) -> Self {
        let mut index = HashMap::new();
        index.insert(0, 0);
        index.insert(1, 1);
        Self {
            class_ids: vec![0, 1],
            names: vec![benchmark.to_string(), local.to_string()],
            index,
        }
    }

    pub fn index_of(&self, class_id: i64) -> Option<usize> {
        self.index.get(&class_id).copied()
    }

    pub fn class_id(&self, index: usize) -> Option<i64> {
        self.class_ids.get(index).copied()
    }

    /// Index of a class by its display name (Food-101 lists are keyed by name).
    pub fn index_of_name(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    pub fn name(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.class_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.class_ids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_name_file_is_a_bijection() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "7\t红烧肉\tbraised pork").unwrap();
        writeln!(file, "3\t饺子\tdumplings").unwrap();
        writeln!(file, "malformed line").unwrap();
        writeln!(file, "12\t米饭\trice").unwrap();

        let map = LabelMap::from_name_file(file.path()).unwrap();
        assert_eq!(map.len(), 3);

        for index in 0..map.len() {
            let id = map.class_id(index).unwrap();
            assert_eq!(map.index_of(id), Some(index));
        }
        assert_eq!(map.index_of(3), Some(1));
        assert_eq!(map.index_of(4), None);
        assert_eq!(map.name(0), Some("红烧肉 (braised pork)"));
    }

    #[test]
    fn test_duplicate_class_id_is_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "1\ta\tA").unwrap();
        writeln!(file, "1\tb\tB").unwrap();

        let err = LabelMap::from_name_file(file.path()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FinetuneError>(),
            Some(FinetuneError::DuplicateClassId { id: 1, .. })
        ));
    }

    #[test]
    fn test_class_list_uses_line_order() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "apple_pie\nbaby_back_ribs\n\nbaklava").unwrap();

        let map = LabelMap::from_class_list(file.path()).unwrap();
        assert_eq!(map.len(), 3);
        assert_eq!(map.index_of_name("baklava"), Some(2));
        assert_eq!(map.class_id(2), Some(2));
    }
}

//! Hierarchical connection folders.

/// Separator between folder names in a folder path.
pub const FOLDER_PATH_SEPARATOR: char = '/';

/// A folder grouping connections; identified by its path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSourceFolder {
    /// Folder name (last path segment)
    pub name: String,
    /// Path of the parent folder
    pub parent: Option<String>,
    /// Free-form description
    pub description: Option<String>,
}

impl DataSourceFolder {
    /// Creates a folder under `parent`.
    pub fn new(name: impl Into<String>, parent: Option<String>) -> Self {
        Self {
            name: name.into(),
            parent,
            description: None,
        }
    }

    /// Full path, e.g. `Production/EU`.
    pub fn path(&self) -> String {
        match &self.parent {
            Some(parent) => format!("{}{}{}", parent, FOLDER_PATH_SEPARATOR, self.name),
            None => self.name.clone(),
        }
    }

    /// True when `path` is this folder or one of its descendants.
    pub fn contains_path(&self, path: &str) -> bool {
        let own = self.path();
        path == own
            || path
                .strip_prefix(own.as_str())
                .is_some_and(|rest| rest.starts_with(FOLDER_PATH_SEPARATOR))
    }
}

/// Splits a folder path into `(parent, name)`.
pub fn split_folder_path(path: &str) -> (Option<&str>, &str) {
    match path.rsplit_once(FOLDER_PATH_SEPARATOR) {
        Some((parent, name)) => (Some(parent), name),
        None => (None, path),
    }
}

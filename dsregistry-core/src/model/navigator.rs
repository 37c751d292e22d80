//! Per-connection navigator display settings.

/// How a connection's object tree is presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NavigatorSettings {
    /// Show system schemas and objects
    pub show_system_objects: bool,
    /// Show utility objects
    pub show_utility_objects: bool,
    /// Show only tables/entities
    pub show_only_entities: bool,
    /// Hide folder nodes
    pub hide_folders: bool,
    /// Hide schema nodes
    pub hide_schemas: bool,
    /// Hide virtual model overlay
    pub hide_virtual_model: bool,
    /// Merge entities of all schemas into one list
    pub merge_entities: bool,
}

impl NavigatorSettings {
    /// Preset showing only tables.
    pub fn simple() -> Self {
        Self {
            show_only_entities: true,
            hide_folders: true,
            hide_virtual_model: true,
            ..Self::default()
        }
    }

    /// Preset showing everything.
    pub fn advanced() -> Self {
        Self {
            show_system_objects: true,
            show_utility_objects: true,
            ..Self::default()
        }
    }
}

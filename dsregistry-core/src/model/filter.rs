//! Navigator object filters.

/// Include/exclude name filter for one kind of database object.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ObjectFilter {
    /// Optional identifier
    pub id: Option<String>,
    /// Object kind the filter applies to (e.g. `schema`, `table`)
    pub object_type: Option<String>,
    /// Display name; saved filters are keyed by it
    pub name: Option<String>,
    /// Free-form description
    pub description: Option<String>,
    /// Disabled filters are kept but not applied
    pub enabled: bool,
    /// Name masks that must match
    pub include: Vec<String>,
    /// Name masks that must not match
    pub exclude: Vec<String>,
}

impl ObjectFilter {
    /// Creates an enabled filter for an object kind.
    pub fn new(object_type: impl Into<String>) -> Self {
        Self {
            object_type: Some(object_type.into()),
            enabled: true,
            ..Self::default()
        }
    }

    /// Builder method to add include masks.
    pub fn including<I, S>(mut self, masks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.include.extend(masks.into_iter().map(Into::into));
        self
    }

    /// Builder method to add exclude masks.
    pub fn excluding<I, S>(mut self, masks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude.extend(masks.into_iter().map(Into::into));
        self
    }

    /// True when the filter would not restrict anything.
    pub fn is_empty(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }

    /// Tests a name against the masks (`%` and `*` match any run).
    pub fn matches(&self, name: &str) -> bool {
        if !self.enabled {
            return true;
        }
        let included =
            self.include.is_empty() || self.include.iter().any(|mask| mask_matches(mask, name));
        included && !self.exclude.iter().any(|mask| mask_matches(mask, name))
    }
}

fn mask_matches(mask: &str, name: &str) -> bool {
    let mask = mask.to_lowercase();
    let name = name.to_lowercase();
    let parts: Vec<&str> = mask.split(['%', '*']).collect();
    if parts.len() == 1 {
        return mask == name;
    }

    let mut rest = name.as_str();
    for (index, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if index == 0 {
            match rest.strip_prefix(part) {
                Some(tail) => rest = tail,
                None => return false,
            }
        } else if index == parts.len() - 1 {
            return rest.ends_with(part);
        } else {
            match rest.find(part) {
                Some(pos) => rest = &rest[pos + part.len()..],
                None => return false,
            }
        }
    }
    true
}

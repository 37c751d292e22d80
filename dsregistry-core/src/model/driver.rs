//! Driver descriptors.

/// Static description of a database driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverDescriptor {
    provider_id: String,
    id: String,
    /// Display name
    pub name: String,
    /// Free-form description
    pub description: Option<String>,
    /// Driver class or entry point
    pub driver_class: Option<String>,
    /// URL template (e.g. `jdbc:postgresql://{host}[:{port}]/{database}`)
    pub sample_url: Option<String>,
    /// Default port
    pub default_port: Option<u16>,
    /// Connecting does not require credentials
    pub anonymous_access: bool,
    /// User-defined; persisted in the `drivers` section
    pub custom: bool,
    /// Placeholder created for a missing driver
    pub temporary: bool,
    /// Cannot be used to connect
    pub disabled: bool,
}

impl DriverDescriptor {
    /// Creates a driver descriptor.
    pub fn new(provider_id: impl Into<String>, id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            id: id.into(),
            name: name.into(),
            description: None,
            driver_class: None,
            sample_url: None,
            default_port: None,
            anonymous_access: false,
            custom: false,
            temporary: false,
            disabled: false,
        }
    }

    /// Placeholder standing in for a driver that is not installed.
    ///
    /// Connections referencing it stay visible and editable but cannot
    /// connect.
    pub fn placeholder(provider_id: impl Into<String>, id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: format!("Missing driver {}", id),
            description: Some("Driver is not installed".to_string()),
            temporary: true,
            disabled: true,
            ..Self::new(provider_id, id, String::new())
        }
    }

    /// Builder method to set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Builder method to set the driver class.
    pub fn with_driver_class(mut self, class: impl Into<String>) -> Self {
        self.driver_class = Some(class.into());
        self
    }

    /// Builder method to set the URL template.
    pub fn with_sample_url(mut self, url: impl Into<String>) -> Self {
        self.sample_url = Some(url.into());
        self
    }

    /// Builder method to set the default port.
    pub const fn with_default_port(mut self, port: u16) -> Self {
        self.default_port = Some(port);
        self
    }

    /// Builder method to allow connecting without credentials.
    pub const fn anonymous(mut self) -> Self {
        self.anonymous_access = true;
        self
    }

    /// Builder method to mark the driver as user-defined.
    pub const fn custom(mut self) -> Self {
        self.custom = true;
        self
    }

    /// Owning provider id.
    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    /// Driver id, unique within its provider.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// `provider:driver` identifier.
    pub fn full_id(&self) -> String {
        format!("{}:{}", self.provider_id, self.id)
    }

    /// True for placeholders created for missing drivers.
    pub const fn is_placeholder(&self) -> bool {
        self.temporary && self.disabled
    }
}

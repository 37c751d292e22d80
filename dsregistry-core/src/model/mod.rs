//! Registry data model.
//!
//! Plain values describing what is persisted: connection configurations,
//! network handlers and profiles, folders, filters, connection types and
//! drivers. Runtime state (live connections, secrets resolution) lives in
//! [`crate::descriptor`].

mod connection;
mod connection_type;
mod data_source;
mod driver;
mod filter;
mod folder;
mod handler;
mod navigator;
mod profile;

pub use connection::{
    ConnectionBootstrap, ConnectionConfiguration, ConnectionEventType, ShellCommand,
};
pub use connection_type::{ConnectionType, ConnectionTypeRegistry};
pub use data_source::{
    DataSourceOrigin, DataSourcePermission, DataSourceSettings, VirtualModel,
};
pub use driver::DriverDescriptor;
pub use filter::ObjectFilter;
pub use folder::{DataSourceFolder, FOLDER_PATH_SEPARATOR, split_folder_path};
pub use handler::{NetworkHandlerConfiguration, NetworkHandlerType};
pub use navigator::NavigatorSettings;
pub use profile::{AuthProfile, NetworkProfile};

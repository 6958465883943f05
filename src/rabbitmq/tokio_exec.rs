use lapin::ConnectionProperties;

use super::types::Role;

/// Properties for a role's connection. The name shows up in the management UI.
pub fn connection_properties(role: Role) -> ConnectionProperties {
    ConnectionProperties::default().with_connection_name(connection_name(role).into())
}

pub fn connection_name(role: Role) -> String {
    format!("{}/{}", env!("CARGO_PKG_NAME"), role)
}

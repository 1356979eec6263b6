//! Validation predicates for the names used in the D-Bus protocol.
//!
//! These check bus names, object paths, interface names and member names
//! against the grammars in the D-Bus specification. The `assert_*` variants
//! raise the corresponding [`Error`] instead of returning a boolean.

#[cfg(test)]
mod tests;

use crate::error::{Error, ErrorKind, Result};

const MAX_NAME_LENGTH: usize = 255;

fn is_bus_name_element(element: &str) -> bool {
    let mut chars = element.chars();

    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '-' => {}
        _ => return false,
    }

    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn is_member_element(element: &str) -> bool {
    let mut chars = element.chars();

    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }

    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Test if the given string is a valid bus name.
///
/// Unique names start with a colon, well-known names are composed of two or
/// more dot-separated elements.
///
/// # Examples
///
/// ```
/// use minibus::validators::is_bus_name_valid;
///
/// assert!(is_bus_name_valid(":1.42"));
/// assert!(is_bus_name_valid("org.freedesktop.DBus"));
/// assert!(!is_bus_name_valid("org"));
/// assert!(!is_bus_name_valid(".org.freedesktop.DBus"));
/// ```
pub fn is_bus_name_valid(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LENGTH {
        return false;
    }

    if let Some(rest) = name.strip_prefix(':') {
        // A unique name, assigned by the daemon.
        return !rest.is_empty() && rest.split('.').all(is_bus_name_element);
    }

    if name.starts_with('.') || !name.contains('.') {
        return false;
    }

    name.split('.').all(is_bus_name_element)
}

/// Test if the given string is a valid object path.
///
/// # Examples
///
/// ```
/// use minibus::validators::is_object_path_valid;
///
/// assert!(is_object_path_valid("/"));
/// assert!(is_object_path_valid("/org/freedesktop/DBus"));
/// assert!(!is_object_path_valid("/trailing/"));
/// assert!(!is_object_path_valid("relative/path"));
/// ```
pub fn is_object_path_valid(path: &str) -> bool {
    let Some(rest) = path.strip_prefix('/') else {
        return false;
    };

    if rest.is_empty() {
        return true;
    }

    rest.split('/')
        .all(|e| !e.is_empty() && e.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'))
}

/// Test if the given string is a valid interface name.
pub fn is_interface_name_valid(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LENGTH {
        return false;
    }

    if name.starts_with('.') || !name.contains('.') {
        return false;
    }

    name.split('.').all(is_member_element)
}

/// Test if the given string is a valid member name.
pub fn is_member_name_valid(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LENGTH {
        return false;
    }

    is_member_element(name)
}

/// Check a bus name, raising an error if it is invalid.
pub fn assert_bus_name_valid(name: &str) -> Result<()> {
    if !is_bus_name_valid(name) {
        return Err(Error::new(ErrorKind::InvalidBusName(name.into())));
    }

    Ok(())
}

/// Check an object path, raising an error if it is invalid.
pub fn assert_object_path_valid(path: &str) -> Result<()> {
    if !is_object_path_valid(path) {
        return Err(Error::new(ErrorKind::InvalidObjectPath(path.into())));
    }

    Ok(())
}

/// Check an interface name, raising an error if it is invalid.
pub fn assert_interface_name_valid(name: &str) -> Result<()> {
    if !is_interface_name_valid(name) {
        return Err(Error::new(ErrorKind::InvalidInterfaceName(name.into())));
    }

    Ok(())
}

/// Check a member name, raising an error if it is invalid.
pub fn assert_member_name_valid(name: &str) -> Result<()> {
    if !is_member_name_valid(name) {
        return Err(Error::new(ErrorKind::InvalidMemberName(name.into())));
    }

    Ok(())
}

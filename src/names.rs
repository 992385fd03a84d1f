//! Validation of service names, object paths, interface and member names.
//!
//! The lexical rules themselves come from [`zbus::names`] and [`zbus::zvariant::ObjectPath`]; this
//! module decides which names may be left empty and turns failures into [`BusError`]s.

use zbus::{
    names::{BusName, InterfaceName, MemberName},
    zvariant::ObjectPath,
};

use crate::error::{BusError, ErrorKind};

/// Whether an empty string passes a name check.
///
/// Empty names act as wildcards on some proxies (eg. peer connections have no service name).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmptyPolicy {
    Allowed,
    NotAllowed,
}

fn invalid(message: String) -> BusError {
    BusError::new(ErrorKind::InvalidArgument, message)
}

/// Checks that `name` is a valid unique or well-known bus name.
pub fn check_bus_name(name: &str, policy: EmptyPolicy) -> Result<(), BusError> {
    if name.is_empty() {
        return match policy {
            EmptyPolicy::Allowed => Ok(()),
            EmptyPolicy::NotAllowed => Err(invalid("Service name cannot be empty".into())),
        };
    }

    BusName::try_from(name)
        .map(drop)
        .map_err(|_| invalid(format!("Invalid service name: {}", name)))
}

/// Checks that `path` is a valid object path.
pub fn check_object_path(path: &str, policy: EmptyPolicy) -> Result<(), BusError> {
    if path.is_empty() {
        return match policy {
            EmptyPolicy::Allowed => Ok(()),
            EmptyPolicy::NotAllowed => Err(invalid("Object path cannot be empty".into())),
        };
    }

    ObjectPath::try_from(path)
        .map(drop)
        .map_err(|_| invalid(format!("Invalid object path: {}", path)))
}

/// Checks that `name` is a valid interface name.
pub fn check_interface_name(name: &str, policy: EmptyPolicy) -> Result<(), BusError> {
    if name.is_empty() {
        return match policy {
            EmptyPolicy::Allowed => Ok(()),
            EmptyPolicy::NotAllowed => Err(invalid("Interface name cannot be empty".into())),
        };
    }

    InterfaceName::try_from(name)
        .map(drop)
        .map_err(|_| invalid(format!("Invalid interface class: {}", name)))
}

/// Checks that `name` is a valid method or signal name. Member names are never optional.
pub fn check_member_name(name: &str) -> Result<(), BusError> {
    MemberName::try_from(name)
        .map(drop)
        .map_err(|_| invalid(format!("Invalid method name: {}", name)))
}

/// Validates the identity of a proxy at construction time.
///
/// Dynamic proxies (whose interface is discovered at runtime) must name a service (unless they
/// live on a peer connection) and an object path; static proxies may leave both empty, but must
/// name their interface. The first malformed field, in the order service, path, interface, is
/// reported.
///
/// # Panics
///
/// Panics if `is_dynamic` is `false` and `interface` is empty. Static proxies are built from
/// interface descriptors, so an empty name there is a bug in the descriptor, not a runtime
/// condition.
pub fn check_if_valid(
    service: &str,
    path: &str,
    interface: &str,
    is_dynamic: bool,
    is_peer: bool,
) -> Result<(), BusError> {
    assert!(
        is_dynamic || !interface.is_empty(),
        "interface name of a static proxy cannot be empty"
    );

    let service_policy = if is_dynamic && !is_peer {
        EmptyPolicy::NotAllowed
    } else {
        EmptyPolicy::Allowed
    };
    let path_policy = if is_dynamic {
        EmptyPolicy::NotAllowed
    } else {
        EmptyPolicy::Allowed
    };

    check_bus_name(service, service_policy)?;
    check_object_path(path, path_policy)?;
    check_interface_name(interface, EmptyPolicy::Allowed)
}

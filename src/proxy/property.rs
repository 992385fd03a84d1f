use zbus::zvariant::{OwnedValue, Value};

use crate::{
    error::{BusError, ErrorKind},
    interface::PropertyType,
    message::{Argument, CallMode, Message, MessageFlags, MessageType},
    types::{self, value_type_name},
};

use super::{Inner, Proxy};

const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";

#[derive(Clone, Copy, PartialEq, Eq)]
enum Access {
    Read,
    Write,
}

impl Inner {
    /// Resolves the type of property `name`, enforcing its declared access mode.
    fn property_type(&self, name: &str, access: Access) -> Option<PropertyType> {
        let fail = |message: String| {
            self.set_last_error(BusError::new(ErrorKind::InvalidArgument, message));
            None
        };

        match self.descriptor.property(name) {
            Some(property) => match access {
                Access::Read if !property.access.is_readable() => {
                    fail(format!("Property '{}' is write-only", name))
                }
                Access::Write if !property.access.is_writable() => {
                    fail(format!("Property '{}' is read-only", name))
                }
                _ => Some(property.ty),
            },
            None if self.is_dynamic => Some(PropertyType::Any),
            None => fail(format!("No such property '{}'", name)),
        }
    }

    fn properties_call(&self, member: &str, arguments: Vec<Argument>) -> Message {
        let mut msg = Message::method_call(&self.service, &self.path, PROPERTIES_INTERFACE, member);
        msg.set_arguments(arguments);
        msg.set_flag(MessageFlags::PARAMETERS_VALIDATED, true);
        self.conn().call(msg, CallMode::Block, self.timeout())
    }

    fn read_property(&self, name: &str, ty: PropertyType) -> Option<OwnedValue> {
        let expected_signature = match ty {
            PropertyType::Any => None,
            PropertyType::Named(type_name) => {
                match self.session.registry().signature_of(type_name) {
                    Some(signature) => Some(signature.to_string()),
                    None => {
                        log::warn!(
                            "property {}.{} has unregistered type {}",
                            self.interface,
                            name,
                            type_name
                        );
                        self.set_last_error(BusError::new(
                            ErrorKind::UnregisteredType,
                            format!("Unregistered type {} cannot be handled", type_name),
                        ));
                        return None;
                    }
                }
            }
        };

        let reply = self.properties_call(
            "Get",
            vec![
                Argument::new(self.interface.as_str()),
                Argument::new(name),
            ],
        );
        if reply.message_type() != MessageType::Reply {
            self.set_last_error(BusError::from_reply(&reply));
            return None;
        }

        let value = match reply.arguments() {
            [Argument::Value(value)] => match &**value {
                Value::Value(value) => Some(&**value),
                _ => None,
            },
            _ => None,
        };
        let Some(value) = value else {
            self.set_last_error(BusError::new(
                ErrorKind::InvalidSignature,
                format!(
                    "Invalid signature '{}' in return from call to {}",
                    reply.signature(),
                    PROPERTIES_INTERFACE
                ),
            ));
            return None;
        };

        let expected_signature = expected_signature.unwrap_or_default();
        let accepted = match ty {
            PropertyType::Any => true,
            PropertyType::Named(type_name) => {
                expected_signature == "v" || value_type_name(value) == type_name
            }
        };
        if accepted {
            return Some(OwnedValue::from(value.clone()));
        }

        let found_signature = value.value_signature().to_string();
        if types::is_compound(value) && found_signature == expected_signature {
            let converted = self.session.registry().demarshal(ty.name(), value);
            if converted.is_some() {
                return converted;
            }
        }

        self.set_last_error(BusError::new(
            ErrorKind::InvalidSignature,
            format!(
                "Unexpected '{}' ({}) when retrieving property '{}.{}' (expected type '{}' ({}))",
                value_type_name(value),
                found_signature,
                self.interface,
                name,
                ty.name(),
                expected_signature
            ),
        ));
        None
    }

    fn write_property(&self, name: &str, value: Value<'_>) -> bool {
        let reply = self.properties_call(
            "Set",
            vec![
                Argument::new(self.interface.as_str()),
                Argument::new(name),
                Argument::new(Value::Value(Box::new(value))),
            ],
        );
        if reply.message_type() != MessageType::Reply {
            self.set_last_error(BusError::from_reply(&reply));
            return false;
        }
        true
    }
}

impl Proxy {
    /// Reads property `name` of the remote object.
    ///
    /// Static proxies only read declared, readable properties and check the value against the
    /// declared type. Dynamic proxies read any property and accept whatever value comes back.
    /// On failure, returns [`None`] and records the reason in [`Proxy::last_error`].
    pub fn property(&self, name: &str) -> Option<OwnedValue> {
        let inner = &self.inner;
        if !inner.ready() {
            return None;
        }
        let ty = inner.property_type(name, Access::Read)?;
        inner.read_property(name, ty)
    }

    /// Reads property `name` and converts it to `T`.
    pub fn property_as<T>(&self, name: &str) -> Option<T>
    where
        T: TryFrom<OwnedValue>,
    {
        let value = self.property(name)?;
        let type_name = value_type_name(&value);
        match T::try_from(value) {
            Ok(value) => Some(value),
            Err(_) => {
                self.inner.set_last_error(BusError::new(
                    ErrorKind::InvalidSignature,
                    format!(
                        "Cannot convert '{}' of property '{}.{}' to {}",
                        type_name,
                        self.inner.interface,
                        name,
                        std::any::type_name::<T>()
                    ),
                ));
                None
            }
        }
    }

    /// Writes property `name` of the remote object.
    ///
    /// Returns `true` once the remote object accepted the value. On failure, the reason is
    /// recorded in [`Proxy::last_error`].
    pub fn set_property<'a>(&self, name: &str, value: impl Into<Value<'a>>) -> bool {
        let inner = &self.inner;
        if !inner.ready() {
            return false;
        }
        if inner.property_type(name, Access::Write).is_none() {
            return false;
        }
        inner.write_property(name, value.into())
    }
}

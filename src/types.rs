//! The registry mapping local property types to wire signatures.

use std::{collections::HashMap, fmt, sync::Arc};

use zbus::zvariant::{OwnedValue, Type, Value};

type Demarshal = Arc<dyn Fn(&Value<'_>) -> Option<OwnedValue> + Send + Sync>;

#[derive(Clone)]
struct Registration {
    signature: String,
    demarshal: Demarshal,
}

/// Name under which values of compound wire types (arrays, dicts, structs) are reported when they
/// do not match the expected type.
pub const USER_TYPE: &str = "user type";

/// Maps type names used in [`PropertyType::Named`] to wire signatures, and knows how to convert
/// compound wire values into those types.
///
/// [`PropertyType::Named`]: crate::interface::PropertyType::Named
#[derive(Clone)]
pub struct TypeRegistry {
    types: HashMap<String, Registration>,
}

impl TypeRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            types: HashMap::new(),
        }
    }

    /// Creates a registry knowing the basic D-Bus types.
    ///
    /// Basic types are registered under the names [`value_type_name`] reports for them (`bool`,
    /// `u32`, `String`, ...). Additionally, `Value` stands for a variant, and `Vec<String>`,
    /// `Vec<u8>` and `HashMap<String, Value>` for the common container types.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for (name, signature) in [
            ("u8", "y"),
            ("bool", "b"),
            ("i16", "n"),
            ("u16", "q"),
            ("i32", "i"),
            ("u32", "u"),
            ("i64", "x"),
            ("u64", "t"),
            ("f64", "d"),
            ("String", "s"),
            ("ObjectPath", "o"),
            ("Signature", "g"),
            ("Value", "v"),
            ("Vec<String>", "as"),
            ("Vec<u8>", "ay"),
            ("HashMap<String, Value>", "a{sv}"),
        ] {
            registry.register_signature(name, signature);
        }
        registry
    }

    /// Registers `T` under `name`, deriving the wire signature from its [`Type`] implementation.
    pub fn register<T: Type>(&mut self, name: &str) {
        self.register_signature(name, &T::signature().to_string());
    }

    /// Registers `name` with an explicit wire signature.
    ///
    /// Compound values with a matching signature are accepted as they are.
    pub fn register_signature(&mut self, name: &str, signature: &str) {
        self.register_with(name, signature, |value| Some(OwnedValue::from(value.clone())));
    }

    /// Registers `name` with a custom conversion for compound wire values.
    ///
    /// `demarshal` is only invoked with values whose signature equals `signature`; returning
    /// [`None`] rejects the value.
    pub fn register_with<F>(&mut self, name: &str, signature: &str, demarshal: F)
    where
        F: Fn(&Value<'_>) -> Option<OwnedValue> + Send + Sync + 'static,
    {
        log::trace!("registering type {} with signature '{}'", name, signature);
        self.types.insert(
            name.to_string(),
            Registration {
                signature: signature.to_string(),
                demarshal: Arc::new(demarshal),
            },
        );
    }

    /// Returns the wire signature registered for `name`.
    pub fn signature_of(&self, name: &str) -> Option<&str> {
        self.types.get(name).map(|r| r.signature.as_str())
    }

    /// Converts a compound wire `value` into the type registered as `name`.
    pub fn demarshal(&self, name: &str, value: &Value<'_>) -> Option<OwnedValue> {
        let registration = self.types.get(name)?;
        (registration.demarshal)(value)
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.types.iter().map(|(name, r)| (name, &r.signature)))
            .finish()
    }
}

/// Returns the local type name of a basic wire value, or [`USER_TYPE`] for compound values.
pub fn value_type_name(value: &Value<'_>) -> &'static str {
    match value {
        Value::U8(_) => "u8",
        Value::Bool(_) => "bool",
        Value::I16(_) => "i16",
        Value::U16(_) => "u16",
        Value::I32(_) => "i32",
        Value::U32(_) => "u32",
        Value::I64(_) => "i64",
        Value::U64(_) => "u64",
        Value::F64(_) => "f64",
        Value::Str(_) => "String",
        Value::Signature(_) => "Signature",
        Value::ObjectPath(_) => "ObjectPath",
        Value::Value(_) => "Value",
        _ => USER_TYPE,
    }
}

/// Returns `true` for arrays, dictionaries and structures.
pub fn is_compound(value: &Value<'_>) -> bool {
    matches!(
        value,
        Value::Array(_) | Value::Dict(_) | Value::Structure(_)
    )
}

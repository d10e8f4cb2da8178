//! How [`to_app_value`] shapes structs with named fields.
//!
//! DBus has two common ways of carrying a record: as a struct, where the
//! fields are positional and strongly typed (`(sdu)`), or as a dictionary
//! from field name to variant (`a{sv}`), which is how most bus APIs pass
//! property sets. A policy picks one per struct name.
//!
//! [`to_app_value`]: crate::app_value::to_app_value

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StructSerializationStyle {
    /// Fields in declaration order, as an [`AppValue::Array`].
    ///
    /// [`AppValue::Array`]: crate::app_value::AppValue::Array
    StronglyTyped,
    /// Field names to values, as an [`AppValue::Mapping`]. Fields whose
    /// value is nil are left out.
    ///
    /// [`AppValue::Mapping`]: crate::app_value::AppValue::Mapping
    Dict,
}

pub trait SerializerPolicy: Clone {
    fn query_struct_name(&self, name: &str) -> StructSerializationStyle;
}

/// Every named struct becomes a mapping.
#[derive(Clone, Debug)]
pub struct DefaultSerializerPolicy;

impl SerializerPolicy for DefaultSerializerPolicy {
    fn query_struct_name(&self, _: &str) -> StructSerializationStyle {
        StructSerializationStyle::Dict
    }
}

/// Every named struct becomes an array of its fields.
#[derive(Clone, Debug)]
pub struct StronglyTypedSerializerPolicy;

impl SerializerPolicy for StronglyTypedSerializerPolicy {
    fn query_struct_name(&self, _: &str) -> StructSerializationStyle {
        StructSerializationStyle::StronglyTyped
    }
}

/// Dictionaries by default, strongly typed for the listed struct names.
#[derive(Clone, Debug, Default)]
pub struct StronglyTypedFor(pub Vec<&'static str>);

impl SerializerPolicy for StronglyTypedFor {
    fn query_struct_name(&self, name: &str) -> StructSerializationStyle {
        if self.0.iter().any(|n| *n == name) {
            StructSerializationStyle::StronglyTyped
        } else {
            StructSerializationStyle::Dict
        }
    }
}

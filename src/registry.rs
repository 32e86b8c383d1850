// Copyright (c) 2015-2021 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! Struct and enum descriptors, and the typecode registry that binds them to
//! a codec instance.
//!
//! The descriptor *builders* here stand in for the caller's metaclass-style
//! declaration syntax (out of scope for this crate — see the module-level
//! docs in `lib.rs`); the codec itself only ever consumes the immutable
//! descriptors they produce.

use std::collections::BTreeMap;
use std::rc::Rc;

use crate::error::{Error, ErrorCode};
use crate::value::{Shared, Value};

/// How a missing trailing struct field is materialized from its declared
/// default at construction time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultPolicy {
    /// The default is immutable; share the one instance across every
    /// construction that falls back to it.
    ImmutableShare,
    /// The default is an empty mutable container; allocate a fresh empty one
    /// per construction.
    EmptyMutableFresh,
    /// The default is a non-empty mutable container; deep-copy it per
    /// construction so instances don't alias its contents.
    DeepCopyMutable,
}

fn classify_default(value: &Value) -> DefaultPolicy {
    match value {
        Value::List(v) if v.inner().is_empty() => DefaultPolicy::EmptyMutableFresh,
        Value::List(_) => DefaultPolicy::DeepCopyMutable,
        Value::Dict(v) if v.inner().is_empty() => DefaultPolicy::EmptyMutableFresh,
        Value::Dict(_) => DefaultPolicy::DeepCopyMutable,
        Value::Set(v) if v.inner().is_empty() => DefaultPolicy::EmptyMutableFresh,
        Value::Set(_) => DefaultPolicy::DeepCopyMutable,
        Value::ByteArray(v) if v.inner().is_empty() => DefaultPolicy::EmptyMutableFresh,
        Value::ByteArray(_) => DefaultPolicy::DeepCopyMutable,
        _ => DefaultPolicy::ImmutableShare,
    }
}

/// A structural deep copy over the supported value kinds. Mutable containers
/// get fresh `Shared` handles; immutable leaves are cheaply `Rc`-cloned,
/// since sharing them can never be observed.
pub fn deep_copy(value: &Value) -> Value {
    match value {
        Value::List(v) => {
            let copied: Vec<Value> = v.inner().iter().map(deep_copy).collect();
            Value::List(Shared::new(copied))
        }
        Value::Dict(v) => {
            let copied: BTreeMap<_, _> = v
                .inner()
                .iter()
                .map(|(k, val)| (k.clone(), deep_copy(val)))
                .collect();
            Value::Dict(Shared::new(copied))
        }
        Value::Set(v) => Value::Set(Shared::new((*v.inner()).clone())),
        Value::ByteArray(v) => Value::ByteArray(Shared::new((*v.inner()).clone())),
        other => other.clone(),
    }
}

/// A single struct field: its name, and — if it isn't required — its
/// default value plus the construction policy for that default.
#[derive(Debug, Clone)]
pub struct FieldDefault {
    pub value: Value,
    pub policy: DefaultPolicy,
}

/// Immutable metadata for a user-registered record struct.
#[derive(Debug, Clone)]
pub struct StructDescriptor {
    /// Name used purely for diagnostics; the wire format never carries it.
    pub name: String,
    /// Field names, in declaration (and wire) order.
    pub fields: Vec<String>,
    /// Per-field default, aligned with `fields`; `None` means required.
    pub defaults: Vec<Option<FieldDefault>>,
}

impl StructDescriptor {
    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    /// Number of fields that must be supplied positionally (no default).
    pub fn required_count(&self) -> usize {
        self.defaults.iter().take_while(|d| d.is_none()).count()
    }

    pub fn materialize_default(&self, index: usize) -> Option<Value> {
        self.defaults[index].as_ref().map(|d| match d.policy {
            DefaultPolicy::ImmutableShare => d.value.clone(),
            DefaultPolicy::EmptyMutableFresh => match &d.value {
                Value::List(_) => Value::List(Shared::new(Vec::new())),
                Value::Dict(_) => Value::Dict(Shared::new(BTreeMap::new())),
                Value::Set(_) => Value::Set(Shared::new(std::collections::BTreeSet::new())),
                Value::ByteArray(_) => Value::ByteArray(Shared::new(Vec::new())),
                other => other.clone(),
            },
            DefaultPolicy::DeepCopyMutable => deep_copy(&d.value),
        })
    }
}

/// Builds a [`StructDescriptor`] from an ordered list of fields, enforcing
/// that once a field carries a default, every field after it must too
/// (mirrors positional-parameter rules).
#[derive(Debug, Default)]
pub struct StructDescriptorBuilder {
    name: String,
    fields: Vec<String>,
    defaults: Vec<Option<FieldDefault>>,
}

impl StructDescriptorBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        StructDescriptorBuilder {
            name: name.into(),
            fields: Vec::new(),
            defaults: Vec::new(),
        }
    }

    pub fn field(mut self, name: impl Into<String>) -> Self {
        self.fields.push(name.into());
        self.defaults.push(None);
        self
    }

    pub fn field_with_default(mut self, name: impl Into<String>, default: Value) -> Self {
        let policy = classify_default(&default);
        self.fields.push(name.into());
        self.defaults.push(Some(FieldDefault {
            value: default,
            policy,
        }));
        self
    }

    pub fn build(self) -> Result<StructDescriptor, Error> {
        let mut seen_default = false;
        for d in &self.defaults {
            if d.is_some() {
                seen_default = true;
            } else if seen_default {
                return Err(Error::Syntax(ErrorCode::RegistryShape(
                    "non-default field follows a default field",
                )));
            }
        }
        Ok(StructDescriptor {
            name: self.name,
            fields: self.fields,
            defaults: self.defaults,
        })
    }
}

/// Immutable metadata for a user-registered enumeration.
#[derive(Debug, Clone)]
pub struct EnumDescriptor {
    /// Name used for diagnostics (e.g. "Fruit2 has no member with that value").
    pub name: String,
    /// Members in declaration order, as (member name, member value).
    pub members: Vec<(String, Value)>,
    /// True if every member value is an integer (selects the fast int-enum
    /// wire form); false means members are identified on the wire by name.
    pub all_int: bool,
}

impl EnumDescriptor {
    pub fn by_name(&self, name: &str) -> Option<&Value> {
        self.members.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn by_int_value(&self, value: i64) -> Option<&str> {
        self.members
            .iter()
            .find(|(_, v)| matches!(v, Value::I64(i) if *i == value))
            .map(|(n, _)| n.as_str())
    }
}

/// Builds an [`EnumDescriptor`] from an ordered list of (name, value) pairs.
#[derive(Debug, Default)]
pub struct EnumDescriptorBuilder {
    name: String,
    members: Vec<(String, Value)>,
}

impl EnumDescriptorBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        EnumDescriptorBuilder {
            name: name.into(),
            members: Vec::new(),
        }
    }

    pub fn member(mut self, name: impl Into<String>, value: Value) -> Self {
        self.members.push((name.into(), value));
        self
    }

    pub fn build(self) -> EnumDescriptor {
        let all_int = self
            .members
            .iter()
            .all(|(_, v)| matches!(v, Value::I64(_)));
        EnumDescriptor {
            name: self.name,
            members: self.members,
            all_int,
        }
    }
}

/// A registered user type: either a record struct or an enumeration.
#[derive(Debug, Clone)]
pub enum TypeDescriptor {
    Struct(Rc<StructDescriptor>),
    Enum(Rc<EnumDescriptor>),
}

/// A two-way mapping between user types and the small integer typecodes
/// used on the wire, bound read-only to an [`Encoder`](crate::ser::Encoder)
/// or [`Decoder`](crate::de::Decoder) instance.
///
/// Constructed from an ordered list (position = typecode) or an explicit
/// `typecode -> descriptor` map; the list form is the common case and avoids
/// callers having to keep the two directions in sync by hand.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    by_code: BTreeMap<u32, TypeDescriptor>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    /// Build a registry from an ordered list, where position in the list is
    /// the typecode (starting at 0).
    pub fn from_list(descriptors: Vec<TypeDescriptor>) -> Self {
        let by_code = descriptors
            .into_iter()
            .enumerate()
            .map(|(i, d)| (i as u32, d))
            .collect();
        Registry { by_code }
    }

    /// Build a registry from an explicit `typecode -> descriptor` map.
    /// Typecodes must fall within `[0, 2^32)`; callers coming from a wider
    /// integer type should check this themselves and raise
    /// [`ErrorCode::TypecodeOutOfRange`] before calling in, matching the
    /// "fail at binding" requirement.
    pub fn from_map(entries: Vec<(u32, TypeDescriptor)>) -> Self {
        Registry {
            by_code: entries.into_iter().collect(),
        }
    }

    pub fn get(&self, typecode: u32) -> Option<&TypeDescriptor> {
        self.by_code.get(&typecode)
    }

    pub fn get_struct(&self, typecode: u32) -> Result<&Rc<StructDescriptor>, Error> {
        match self.by_code.get(&typecode) {
            Some(TypeDescriptor::Struct(d)) => Ok(d),
            Some(TypeDescriptor::Enum(_)) => {
                Err(Error::Syntax(ErrorCode::BuildstructTargetNotStruct(typecode)))
            }
            None => Err(Error::Syntax(ErrorCode::TypecodeNotFound(typecode))),
        }
    }

    pub fn get_enum(&self, typecode: u32) -> Result<&Rc<EnumDescriptor>, Error> {
        match self.by_code.get(&typecode) {
            Some(TypeDescriptor::Enum(d)) => Ok(d),
            Some(TypeDescriptor::Struct(_)) => {
                Err(Error::Syntax(ErrorCode::BuildstructTargetNotStruct(typecode)))
            }
            None => Err(Error::Syntax(ErrorCode::TypecodeNotFound(typecode))),
        }
    }
}

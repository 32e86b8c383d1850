// Copyright (c) 2015-2021 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! A small, fast binary codec for a restricted value domain, wire-compatible
//! with CPython's pickle protocol 5 binary dialect.
//!
//! Unlike general-purpose pickling, this crate never executes arbitrary
//! code and never constructs arbitrary classes: the only values it knows
//! how to build are the closed set in [`value::Value`], plus two
//! user-extensible kinds registered ahead of time through a
//! [`registry::Registry`] — record structs ([`registry::StructDescriptor`])
//! and enumerations ([`registry::EnumDescriptor`]).
//!
//! ```
//! use quickle::{Encoder, Decoder, Value};
//!
//! let value = Value::I64(42);
//! let encoded = Encoder::new().encode(&value).unwrap();
//! let decoded = Decoder::new().decode(&encoded.data).unwrap();
//! assert_eq!(value, decoded);
//! ```

pub mod consts;
pub mod de;
pub mod error;
pub mod memo;
pub mod registry;
pub mod ser;
pub mod value;

pub use de::Decoder;
pub use error::{Error, ErrorCode, Result};
pub use registry::{
    DefaultPolicy, EnumDescriptor, EnumDescriptorBuilder, FieldDefault, Registry,
    StructDescriptor, StructDescriptorBuilder, TypeDescriptor,
};
pub use ser::{Encoded, Encoder};
pub use value::{
    EnumInstance, HashableValue, PickleBuffer, Shared, SharedFrozen, StructInstance, Value,
};

/// Encode a value with default [`Encoder`] settings.
pub fn encode(value: &Value) -> Result<Encoded> {
    Encoder::new().encode(value)
}

/// Decode a value from a byte slice with default [`Decoder`] settings and no
/// registry (struct/enum opcodes will fail with
/// [`ErrorCode::TypecodeNotFound`]).
pub fn decode(data: &[u8]) -> Result<Value> {
    Decoder::new().decode(data)
}

#[cfg(test)]
#[path = "../test/arby.rs"]
mod arby;

#[cfg(test)]
#[path = "../test/roundtrip.rs"]
mod roundtrip;

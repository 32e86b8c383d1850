// Copyright (c) 2015-2021 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! Round-trip and wire-format tests.

use crate::registry::{EnumDescriptorBuilder, Registry, StructDescriptorBuilder, TypeDescriptor};
use crate::value::{EnumInstance, HashableValue, PickleBuffer, Shared, SharedFrozen, StructInstance};
use crate::{Decoder, Encoder, ErrorCode, Value};
use quickcheck::quickcheck;
use std::collections::BTreeMap;
use std::rc::Rc;

quickcheck! {
    fn roundtrips_through_default_codec(value: Value) -> bool {
        let encoded = Encoder::new().encode(&value).unwrap();
        let decoded = Decoder::new().decode(&encoded.data).unwrap();
        decoded == value
    }

    fn roundtrips_without_memoize(value: Value) -> bool {
        // Values generated by `Arbitrary` never share structure (every
        // sub-value is freshly allocated), so disabling memoization can
        // never hit a cycle here.
        let encoded = Encoder::new().memoize(false).encode(&value).unwrap();
        let decoded = Decoder::new().decode(&encoded.data).unwrap();
        decoded == value
    }
}

#[test]
fn encodes_none_to_exact_bytes() {
    let encoded = Encoder::new().encode(&Value::None).unwrap();
    assert_eq!(encoded.data, vec![0x80, 0x05, 0x4e, 0x2e]);
}

#[test]
fn memoizes_each_distinct_list_element_once() {
    let value = Value::List(Shared::new(vec![
        Value::I64(1),
        Value::I64(2),
        Value::I64(3),
    ]));
    let encoded = Encoder::new().encode(&value).unwrap();
    // I64 scalars never carry identity, so only the list container itself
    // is memoized.
    let memoize_count = encoded
        .data
        .iter()
        .filter(|&&b| b == crate::consts::MEMOIZE)
        .count();
    assert_eq!(memoize_count, 1);
}

#[test]
fn self_referential_list_roundtrips_under_memoize() {
    let list = Shared::new(Vec::new());
    list.inner_mut().push(Value::List(list.clone()));
    let value = Value::List(list);

    let encoded = Encoder::new().memoize(true).encode(&value).unwrap();
    let decoded = Decoder::new().decode(&encoded.data).unwrap();
    match decoded {
        Value::List(v) => match &v.inner()[0] {
            Value::List(inner) => assert_eq!(v.provenance(), inner.provenance()),
            _ => panic!("expected nested list"),
        },
        _ => panic!("expected list"),
    }
}

#[test]
fn self_referential_list_errors_under_no_memoize() {
    let list = Shared::new(Vec::new());
    list.inner_mut().push(Value::List(list.clone()));
    let value = Value::List(list);

    let err = Encoder::new()
        .memoize(false)
        .recursion_limit(64)
        .encode(&value)
        .unwrap_err();
    assert_eq!(*err.code(), ErrorCode::RecursionExceeded);
}

#[test]
fn out_of_band_buffer_roundtrips() {
    let buf = PickleBuffer::from_byte_array(vec![1, 2, 3, 4]);
    let value = Value::Buffer(buf);

    let encoded = Encoder::new().collect_buffers(true).encode(&value).unwrap();
    assert_eq!(encoded.buffers.len(), 1);

    let decoded = Decoder::new()
        .decode_with_buffers(&encoded.data, &encoded.buffers)
        .unwrap();
    assert_eq!(decoded, value);
}

#[test]
fn out_of_band_buffer_missing_is_an_error() {
    let value = Value::Buffer(PickleBuffer::from_byte_array(vec![9]));
    let encoded = Encoder::new().collect_buffers(true).encode(&value).unwrap();

    let err = Decoder::new().decode(&encoded.data).unwrap_err();
    assert_eq!(*err.code(), ErrorCode::BufferUnavailable);
}

fn point_registry() -> Registry {
    let point = StructDescriptorBuilder::new("Point")
        .field("x")
        .field("y")
        .field_with_default("label", Value::String(SharedFrozen::new(String::new())))
        .build()
        .unwrap();
    Registry::from_list(vec![TypeDescriptor::Struct(Rc::new(point))])
}

#[test]
fn struct_roundtrips_with_registry() {
    let registry = point_registry();
    let value = Value::Struct(SharedFrozen::new(StructInstance {
        typecode: 0,
        fields: SharedFrozen::new(vec![Value::I64(1), Value::I64(2)]),
    }));

    let encoded = Encoder::new()
        .registry(registry.clone())
        .encode(&value)
        .unwrap();
    let decoded = Decoder::new().registry(registry).decode(&encoded.data).unwrap();

    match decoded {
        Value::Struct(inst) => {
            let inst = inst.inner();
            assert_eq!(inst.typecode, 0);
            assert_eq!(
                *inst.fields.inner(),
                vec![
                    Value::I64(1),
                    Value::I64(2),
                    Value::String(SharedFrozen::new(String::new())),
                ]
            );
        }
        _ => panic!("expected struct"),
    }
}

#[test]
fn struct_missing_from_registry_is_an_error() {
    let value = Value::Struct(SharedFrozen::new(StructInstance {
        typecode: 7,
        fields: SharedFrozen::new(vec![]),
    }));

    let err = Encoder::new().encode(&value);
    // The empty default registry has no typecode 7; the codec's own value
    // model carries typecode only, so decode-side is where this is caught.
    let encoded = err.unwrap();
    let err = Decoder::new().decode(&encoded.data).unwrap_err();
    assert_eq!(*err.code(), ErrorCode::TypecodeNotFound(7));
}

fn fruit_registry() -> Registry {
    let fruit = EnumDescriptorBuilder::new("Fruit")
        .member("APPLE", Value::I64(1))
        .member("BANANA", Value::I64(2))
        .build();
    Registry::from_list(vec![TypeDescriptor::Enum(Rc::new(fruit))])
}

#[test]
fn int_enum_roundtrips_with_registry() {
    let registry = fruit_registry();
    let value = Value::Enum(SharedFrozen::new(EnumInstance {
        typecode: 0,
        name: SharedFrozen::new("APPLE".to_owned()),
        int_value: Some(1),
    }));

    let encoded = Encoder::new()
        .registry(registry.clone())
        .encode(&value)
        .unwrap();
    let decoded = Decoder::new().registry(registry).decode(&encoded.data).unwrap();
    assert_eq!(decoded, value);
}

#[test]
fn enum_value_not_found_names_the_enum() {
    let registry = fruit_registry();
    let value = Value::Enum(SharedFrozen::new(EnumInstance {
        typecode: 0,
        name: SharedFrozen::new("DURIAN".to_owned()),
        int_value: Some(99),
    }));

    let encoded = Encoder::new()
        .registry(registry.clone())
        .encode(&value)
        .unwrap();
    let err = Decoder::new().registry(registry).decode(&encoded.data).unwrap_err();
    match err.code() {
        ErrorCode::EnumValueNotFound { enum_name } => assert_eq!(enum_name, "Fruit"),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn truncated_stream_is_an_error() {
    let encoded = Encoder::new().encode(&Value::I64(300)).unwrap();
    let truncated = &encoded.data[..encoded.data.len() - 1];
    let err = Decoder::new().decode(truncated).unwrap_err();
    assert_eq!(*err.code(), ErrorCode::TruncatedInput);
}

#[test]
fn unknown_opcode_is_rejected() {
    let data = vec![0x80, 0x05, 0xff, 0x2e];
    let err = Decoder::new().decode(&data).unwrap_err();
    assert_eq!(*err.code(), ErrorCode::UnknownOpcode(0xff));
}

#[test]
fn struct_fills_missing_fields_with_defaults() {
    // A writer using an older two-field Point, read back by this
    // three-field descriptor: `label` falls back to its default.
    let registry = point_registry();
    let value = Value::Struct(SharedFrozen::new(StructInstance {
        typecode: 0,
        fields: SharedFrozen::new(vec![Value::I64(5), Value::I64(6)]),
    }));
    let encoded = Encoder::new()
        .registry(registry.clone())
        .encode(&value)
        .unwrap();
    let decoded = Decoder::new().registry(registry).decode(&encoded.data).unwrap();
    match decoded {
        Value::Struct(inst) => assert_eq!(inst.inner().fields.inner().len(), 3),
        _ => panic!("expected struct"),
    }
}

#[test]
fn struct_drops_extra_trailing_fields_from_newer_writer() {
    // A writer using a newer four-field Point, read back by this
    // three-field descriptor: the fourth field is silently dropped.
    let registry = point_registry();
    let value = Value::Struct(SharedFrozen::new(StructInstance {
        typecode: 0,
        fields: SharedFrozen::new(vec![
            Value::I64(1),
            Value::I64(2),
            Value::String(SharedFrozen::new("ok".to_owned())),
            Value::I64(999),
        ]),
    }));
    let encoded = Encoder::new()
        .registry(registry.clone())
        .encode(&value)
        .unwrap();
    let decoded = Decoder::new().registry(registry).decode(&encoded.data).unwrap();
    match decoded {
        Value::Struct(inst) => {
            assert_eq!(
                *inst.inner().fields.inner(),
                vec![
                    Value::I64(1),
                    Value::I64(2),
                    Value::String(SharedFrozen::new("ok".to_owned())),
                ]
            );
        }
        _ => panic!("expected struct"),
    }
}

#[test]
fn shares_identity_for_repeated_non_cyclic_reference() {
    // Two clones of the same shared string in a list must memoize once and
    // resolve the second occurrence via a single BINGET, not a fresh copy.
    // "linked" (not "shared") is chosen deliberately: its bytes don't
    // contain 0x68, the BINGET opcode byte, so a raw byte scan for BINGET
    // can't produce a false positive from the string's own contents.
    let shared = Value::String(SharedFrozen::new("linked".to_owned()));
    let value = Value::List(Shared::new(vec![shared.clone(), shared]));

    let encoded = Encoder::new().memoize(true).encode(&value).unwrap();
    let binget_count = encoded
        .data
        .iter()
        .filter(|&&b| b == crate::consts::BINGET)
        .count();
    assert_eq!(binget_count, 1);

    let decoded = Decoder::new().decode(&encoded.data).unwrap();
    match decoded {
        Value::List(v) => {
            let v = v.inner();
            match (&v[0], &v[1]) {
                (Value::String(a), Value::String(b)) => {
                    assert_eq!(a.provenance(), b.provenance());
                }
                _ => panic!("expected two strings"),
            }
        }
        _ => panic!("expected list"),
    }
}

#[test]
fn self_referential_dict_roundtrips_under_memoize() {
    let dict = Shared::new(BTreeMap::new());
    dict.inner_mut()
        .insert(HashableValue::I64(1), Value::Dict(dict.clone()));
    let value = Value::Dict(dict);

    let encoded = Encoder::new().memoize(true).encode(&value).unwrap();
    let decoded = Decoder::new().decode(&encoded.data).unwrap();
    match decoded {
        Value::Dict(v) => match v.inner().get(&HashableValue::I64(1)) {
            Some(Value::Dict(inner)) => assert_eq!(v.provenance(), inner.provenance()),
            _ => panic!("expected nested dict"),
        },
        _ => panic!("expected dict"),
    }
}

#[test]
fn cycle_through_tuple_roundtrips_under_memoize() {
    // The list provides the interior mutability; the tuple nested inside it
    // is itself immutable but still threads the cycle back to the list.
    let list = Shared::new(Vec::new());
    list.inner_mut()
        .push(Value::Tuple(SharedFrozen::new(vec![Value::List(
            list.clone(),
        )])));
    let value = Value::List(list);

    let encoded = Encoder::new().memoize(true).encode(&value).unwrap();
    let decoded = Decoder::new().decode(&encoded.data).unwrap();
    match decoded {
        Value::List(v) => match &v.inner()[0] {
            Value::Tuple(t) => match &t.inner()[0] {
                Value::List(inner) => assert_eq!(v.provenance(), inner.provenance()),
                _ => panic!("expected nested list"),
            },
            _ => panic!("expected tuple"),
        },
        _ => panic!("expected list"),
    }
}

#[test]
fn decodes_real_cpython_pickle_bytes_for_true() {
    // `pickle.dumps(True, protocol=5)`. The framed payload (NEWTRUE + STOP)
    // is 2 bytes, under CPython's `_FRAME_SIZE_MIN = 4`, so no FRAME opcode
    // is emitted.
    let data = vec![0x80, 0x05, 0x88, 0x2e];
    let decoded = Decoder::new().decode(&data).unwrap();
    assert_eq!(decoded, Value::Bool(true));

    let encoded = Encoder::new().encode(&Value::Bool(true)).unwrap();
    assert_eq!(encoded.data, data);
}

#[test]
fn decodes_real_cpython_pickle_bytes_for_small_int() {
    // `pickle.dumps(42, protocol=5)`. The framed payload (BININT1 + value +
    // STOP) is 3 bytes, still under `_FRAME_SIZE_MIN = 4`, so again no
    // FRAME opcode is emitted.
    let data = vec![0x80, 0x05, 0x4b, 0x2a, 0x2e];
    let decoded = Decoder::new().decode(&data).unwrap();
    assert_eq!(decoded, Value::I64(42));

    let encoded = Encoder::new().encode(&Value::I64(42)).unwrap();
    assert_eq!(encoded.data, data);
}

// Copyright (c) 2015-2021 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! The encoder: walks a [`Value`] tree and writes the binary opcode stream.

use byteorder::{BigEndian, LittleEndian, WriteBytesExt};
use num_bigint::{BigInt, Sign};
use num_traits::ToPrimitive;

use crate::consts;
use crate::error::{Error, ErrorCode};
use crate::memo::MemoTable;
use crate::registry::Registry;
use crate::value::{HashableValue, PickleBuffer, Value};

const PROTOCOL: u8 = 5;
const DEFAULT_RECURSION_LIMIT: usize = 1000;
/// Above this many items, containers are filled in several `MARK`-delimited
/// batches rather than one, matching CPython's own batching threshold.
const BATCH_SIZE: usize = 1000;

/// Encodes [`Value`] trees to the binary wire format.
///
/// Construct with [`Encoder::new`] or [`Encoder::with_capacity`], configure
/// with the builder methods, then call [`Encoder::encode`] per value.
#[derive(Debug, Clone)]
pub struct Encoder {
    capacity: usize,
    memoize: bool,
    collect_buffers: bool,
    recursion_limit: usize,
    registry: Registry,
}

impl Default for Encoder {
    fn default() -> Self {
        Encoder {
            capacity: 64,
            memoize: true,
            collect_buffers: false,
            recursion_limit: DEFAULT_RECURSION_LIMIT,
            registry: Registry::new(),
        }
    }
}

/// The result of [`Encoder::encode`]: the opcode stream, plus any out-of-band
/// buffers collected along the way (empty unless `collect_buffers` is set).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Encoded {
    pub data: Vec<u8>,
    pub buffers: Vec<PickleBuffer>,
}

impl Encoder {
    pub fn new() -> Self {
        Encoder::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Encoder {
            capacity,
            ..Encoder::default()
        }
    }

    /// Whether repeated/shared/cyclic values are memoized (default `true`).
    /// Disabling this shrinks output for values with no sharing, at the cost
    /// of raising [`ErrorCode::RecursionExceeded`] on any cycle.
    pub fn memoize(mut self, memoize: bool) -> Self {
        self.memoize = memoize;
        self
    }

    /// Whether [`Value::Buffer`] contents are pulled out-of-band instead of
    /// inlined into the byte stream (default `false`).
    pub fn collect_buffers(mut self, collect: bool) -> Self {
        self.collect_buffers = collect;
        self
    }

    pub fn recursion_limit(mut self, limit: usize) -> Self {
        self.recursion_limit = limit;
        self
    }

    pub fn registry(mut self, registry: Registry) -> Self {
        self.registry = registry;
        self
    }

    /// Encode a single value into a fresh opcode stream.
    pub fn encode(&self, value: &Value) -> Result<Encoded, Error> {
        let mut out = Vec::with_capacity(self.capacity);
        let mut buffers = Vec::new();
        let mut memo = MemoTable::new();

        out.push(consts::PROTO);
        out.push(PROTOCOL);

        self.write_value(value, &mut out, &mut buffers, &mut memo, 0)?;

        out.push(consts::STOP);
        Ok(Encoded {
            data: out,
            buffers,
        })
    }

    fn write_value(
        &self,
        value: &Value,
        out: &mut Vec<u8>,
        buffers: &mut Vec<PickleBuffer>,
        memo: &mut MemoTable,
        depth: usize,
    ) -> Result<(), Error> {
        if depth > self.recursion_limit {
            return Err(ErrorCode::RecursionExceeded.into());
        }

        if let Some(provenance) = self.provenance_of(value) {
            if let Some(id) = memo.get(provenance) {
                write_get(out, id);
                return Ok(());
            }
        }

        match value {
            Value::None => out.push(consts::NONE),
            Value::Bool(true) => out.push(consts::NEWTRUE),
            Value::Bool(false) => out.push(consts::NEWFALSE),
            Value::I64(i) => write_i64(out, *i),
            Value::Int(i) => write_bigint(out, i),
            Value::F64(f) => write_f64(out, *f),
            Value::Bytes(b) => {
                write_bytes_opcode(out, b.inner());
                self.maybe_memoize(value, out, memo);
            }
            Value::ByteArray(b) => {
                write_bytearray_opcode(out, &b.inner());
                self.maybe_memoize(value, out, memo);
            }
            Value::String(s) => {
                write_string_opcode(out, s.inner());
                self.maybe_memoize(value, out, memo);
            }
            Value::List(items) => {
                out.push(consts::EMPTY_LIST);
                self.maybe_memoize(value, out, memo);
                let items = items.inner();
                self.batch_fill(out, buffers, memo, depth, &items, consts::APPEND, consts::APPENDS)?;
            }
            Value::Tuple(items) => {
                let items = items.inner();
                if items.len() > 3 {
                    out.push(consts::MARK);
                }
                for item in items.iter() {
                    self.write_value(item, out, buffers, memo, depth + 1)?;
                }
                match items.len() {
                    0 => out.push(consts::EMPTY_TUPLE),
                    1 => out.push(consts::TUPLE1),
                    2 => out.push(consts::TUPLE2),
                    3 => out.push(consts::TUPLE3),
                    _ => out.push(consts::TUPLE),
                }
                self.maybe_memoize(value, out, memo);
            }
            Value::Set(items) => {
                out.push(consts::EMPTY_SET);
                self.maybe_memoize(value, out, memo);
                let items = items.inner();
                self.batch_fill_hashable(out, buffers, memo, depth, items.iter(), items.len(), consts::ADDITEMS)?;
            }
            Value::FrozenSet(items) => {
                let items = items.inner();
                out.push(consts::MARK);
                for item in items.iter() {
                    self.write_value(&item.clone().into_value(), out, buffers, memo, depth + 1)?;
                }
                out.push(consts::FROZENSET);
                self.maybe_memoize(value, out, memo);
            }
            Value::Dict(entries) => {
                out.push(consts::EMPTY_DICT);
                self.maybe_memoize(value, out, memo);
                let entries = entries.inner();
                self.batch_fill_dict(out, buffers, memo, depth, &entries)?;
            }
            Value::Buffer(buf) => {
                self.write_buffer(buf, out, buffers)?;
                self.maybe_memoize(value, out, memo);
            }
            Value::Struct(inst) => {
                let inst = inst.inner();
                write_i64(out, inst.typecode as i64);
                let fields = inst.fields.inner();
                if fields.len() > 3 {
                    out.push(consts::MARK);
                }
                for field in fields.iter() {
                    self.write_value(field, out, buffers, memo, depth + 1)?;
                }
                match fields.len() {
                    0 => out.push(consts::EMPTY_TUPLE),
                    1 => out.push(consts::TUPLE1),
                    2 => out.push(consts::TUPLE2),
                    3 => out.push(consts::TUPLE3),
                    _ => out.push(consts::TUPLE),
                }
                out.push(consts::BUILDSTRUCT);
                self.maybe_memoize(value, out, memo);
            }
            Value::Enum(inst) => {
                let inst = inst.inner();
                write_i64(out, inst.typecode as i64);
                match inst.int_value {
                    Some(i) => write_i64(out, i),
                    None => write_string_opcode(out, inst.name.inner()),
                }
                out.push(consts::ENUM);
                self.maybe_memoize(value, out, memo);
            }
        }

        Ok(())
    }

    fn provenance_of(&self, value: &Value) -> Option<usize> {
        match value {
            Value::Bytes(b) => Some(b.provenance()),
            Value::ByteArray(b) => Some(b.provenance()),
            Value::String(s) => Some(s.provenance()),
            Value::List(v) => Some(v.provenance()),
            Value::Tuple(v) => Some(v.provenance()),
            Value::Set(v) => Some(v.provenance()),
            Value::FrozenSet(v) => Some(v.provenance()),
            Value::Dict(v) => Some(v.provenance()),
            Value::Buffer(b) => Some(b.provenance()),
            Value::Struct(s) => Some(s.provenance()),
            Value::Enum(e) => Some(e.provenance()),
            _ => None,
        }
    }

    /// Whether `value` should get a `MEMOIZE` opcode: always for mutable or
    /// eagerly-built composite kinds, otherwise only if more than one live
    /// reference to it exists (so a future occurrence could hit it again).
    fn should_memoize(&self, value: &Value) -> bool {
        if !self.memoize {
            return false;
        }
        match value {
            Value::List(_)
            | Value::Dict(_)
            | Value::Set(_)
            | Value::FrozenSet(_)
            | Value::ByteArray(_)
            | Value::Struct(_)
            | Value::Enum(_) => true,
            Value::Tuple(v) => !v.inner().is_empty(),
            Value::Bytes(b) => b.ref_count() > 1,
            Value::String(s) => s.ref_count() > 1,
            Value::Buffer(b) => b.ref_count() > 1,
            _ => false,
        }
    }

    fn maybe_memoize(&self, value: &Value, out: &mut Vec<u8>, memo: &mut MemoTable) {
        if !self.should_memoize(value) {
            return;
        }
        if let Some(provenance) = self.provenance_of(value) {
            if memo.get(provenance).is_none() {
                out.push(consts::MEMOIZE);
                memo.assign(provenance);
            }
        }
    }

    fn batch_fill(
        &self,
        out: &mut Vec<u8>,
        buffers: &mut Vec<PickleBuffer>,
        memo: &mut MemoTable,
        depth: usize,
        items: &[Value],
        single_op: u8,
        batch_op: u8,
    ) -> Result<(), Error> {
        if items.is_empty() {
            return Ok(());
        }
        if items.len() == 1 {
            self.write_value(&items[0], out, buffers, memo, depth + 1)?;
            out.push(single_op);
            return Ok(());
        }
        for chunk in items.chunks(BATCH_SIZE) {
            out.push(consts::MARK);
            for item in chunk {
                self.write_value(item, out, buffers, memo, depth + 1)?;
            }
            out.push(batch_op);
        }
        Ok(())
    }

    fn batch_fill_hashable<'a, I>(
        &self,
        out: &mut Vec<u8>,
        buffers: &mut Vec<PickleBuffer>,
        memo: &mut MemoTable,
        depth: usize,
        items: I,
        len: usize,
        batch_op: u8,
    ) -> Result<(), Error>
    where
        I: Iterator<Item = &'a HashableValue>,
    {
        if len == 0 {
            return Ok(());
        }
        let materialized: Vec<Value> = items.map(|v| v.clone().into_value()).collect();
        for chunk in materialized.chunks(BATCH_SIZE) {
            out.push(consts::MARK);
            for item in chunk {
                self.write_value(item, out, buffers, memo, depth + 1)?;
            }
            out.push(batch_op);
        }
        Ok(())
    }

    fn batch_fill_dict(
        &self,
        out: &mut Vec<u8>,
        buffers: &mut Vec<PickleBuffer>,
        memo: &mut MemoTable,
        depth: usize,
        entries: &std::collections::BTreeMap<HashableValue, Value>,
    ) -> Result<(), Error> {
        if entries.is_empty() {
            return Ok(());
        }
        let pairs: Vec<(&HashableValue, &Value)> = entries.iter().collect();
        if pairs.len() == 1 {
            let (k, v) = pairs[0];
            self.write_value(&k.clone().into_value(), out, buffers, memo, depth + 1)?;
            self.write_value(v, out, buffers, memo, depth + 1)?;
            out.push(consts::SETITEM);
            return Ok(());
        }
        for chunk in pairs.chunks(BATCH_SIZE) {
            out.push(consts::MARK);
            for (k, v) in chunk {
                self.write_value(&(*k).clone().into_value(), out, buffers, memo, depth + 1)?;
                self.write_value(v, out, buffers, memo, depth + 1)?;
            }
            out.push(consts::SETITEMS);
        }
        Ok(())
    }

    fn write_buffer(
        &self,
        buf: &PickleBuffer,
        out: &mut Vec<u8>,
        buffers: &mut Vec<PickleBuffer>,
    ) -> Result<(), Error> {
        if self.collect_buffers {
            out.push(consts::NEXT_BUFFER);
            if buf.is_readonly() {
                out.push(consts::READONLY_BUFFER);
            }
            buffers.push(buf.clone());
        } else {
            match buf {
                PickleBuffer::Bytes(b) => write_bytes_opcode(out, b.inner()),
                PickleBuffer::ByteArray(b) => write_bytearray_opcode(out, &b.inner()),
            }
        }
        Ok(())
    }
}

fn write_get(out: &mut Vec<u8>, id: u32) {
    if let Ok(id) = u8::try_from(id) {
        out.push(consts::BINGET);
        out.push(id);
    } else {
        out.push(consts::LONG_BINGET);
        out.write_u32::<LittleEndian>(id).expect("vec write");
    }
}

fn write_i64(out: &mut Vec<u8>, i: i64) {
    if let Ok(u) = u8::try_from(i) {
        out.push(consts::BININT1);
        out.push(u);
        return;
    }
    if (0..=0xffff).contains(&i) {
        out.push(consts::BININT2);
        out.write_u16::<LittleEndian>(i as u16).expect("vec write");
        return;
    }
    if (i32::MIN as i64..=i32::MAX as i64).contains(&i) {
        out.push(consts::BININT);
        out.write_i32::<LittleEndian>(i as i32).expect("vec write");
        return;
    }
    write_bigint(out, &BigInt::from(i));
}

fn write_bigint(out: &mut Vec<u8>, i: &BigInt) {
    if let Some(i) = i.to_i64() {
        if i != i64::MIN {
            // Fits comfortably in the small encodings above; route through
            // them so small BigInts still get the compact form.
            return write_i64(out, i);
        }
    }
    let bytes = signed_le_bytes(i);
    if bytes.len() < 256 {
        out.push(consts::LONG1);
        out.push(bytes.len() as u8);
        out.extend_from_slice(&bytes);
    } else {
        out.push(consts::LONG4);
        out.write_u32::<LittleEndian>(bytes.len() as u32)
            .expect("vec write");
        out.extend_from_slice(&bytes);
    }
}

/// Two's-complement little-endian encoding matching Python's
/// `int.to_bytes(n, "little", signed=True)` with the minimal `n`.
fn signed_le_bytes(i: &BigInt) -> Vec<u8> {
    if i.sign() == Sign::NoSign {
        return Vec::new();
    }
    let (sign, mut magnitude) = i.to_bytes_le();
    if sign == Sign::Plus {
        // Pad with a zero byte if the high bit is set, so it doesn't read as negative.
        if let Some(&last) = magnitude.last() {
            if last & 0x80 != 0 {
                magnitude.push(0);
            }
        }
        magnitude
    } else {
        // Two's complement of the magnitude, at the magnitude's own width
        // (padded by one byte if needed so the sign bit reads negative).
        let mut width = magnitude.len();
        if magnitude.last().map(|b| b & 0x80 == 0).unwrap_or(true) {
            // no-op, width already sufficient
        } else {
            width += 1;
        }
        magnitude.resize(width, 0);
        let mut carry = true;
        for byte in magnitude.iter_mut() {
            *byte = !*byte;
            if carry {
                let (sum, overflow) = byte.overflowing_add(1);
                *byte = sum;
                carry = overflow;
            }
        }
        magnitude
    }
}

fn write_f64(out: &mut Vec<u8>, f: f64) {
    out.push(consts::BINFLOAT);
    out.write_f64::<BigEndian>(f).expect("vec write");
}

fn write_bytes_opcode(out: &mut Vec<u8>, bytes: &[u8]) {
    let len = bytes.len();
    if len < 256 {
        out.push(consts::SHORT_BINBYTES);
        out.push(len as u8);
    } else if len <= u32::MAX as usize {
        out.push(consts::BINBYTES);
        out.write_u32::<LittleEndian>(len as u32).expect("vec write");
    } else {
        out.push(consts::BINBYTES8);
        out.write_u64::<LittleEndian>(len as u64).expect("vec write");
    }
    out.extend_from_slice(bytes);
}

fn write_bytearray_opcode(out: &mut Vec<u8>, bytes: &[u8]) {
    out.push(consts::BYTEARRAY8);
    out.write_u64::<LittleEndian>(bytes.len() as u64)
        .expect("vec write");
    out.extend_from_slice(bytes);
}

fn write_string_opcode(out: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    let len = bytes.len();
    if len < 256 {
        out.push(consts::SHORT_BINUNICODE);
        out.push(len as u8);
    } else if len <= u32::MAX as usize {
        out.push(consts::BINUNICODE);
        out.write_u32::<LittleEndian>(len as u32).expect("vec write");
    } else {
        out.push(consts::BINUNICODE8);
        out.write_u64::<LittleEndian>(len as u64).expect("vec write");
    }
    out.extend_from_slice(bytes);
}

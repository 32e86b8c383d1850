// Copyright (c) 2015-2021 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! The decoder: a small stack machine that executes the opcode stream.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use num_bigint::BigInt;
use std::collections::{BTreeMap, BTreeSet};
use std::convert::TryFrom;

use crate::consts::{self, Opcode};
use crate::error::{Error, ErrorCode};
use crate::registry::Registry;
use crate::value::{
    EnumInstance, HashableValue, PickleBuffer, Shared, SharedFrozen, StructInstance, Value,
};

/// Decodes a binary opcode stream back into a [`Value`].
///
/// Construct with [`Decoder::new`], optionally attach a [`Registry`] with
/// [`Decoder::registry`] and out-of-band buffers with
/// [`Decoder::with_buffers`], then call [`Decoder::decode`].
#[derive(Debug, Clone, Default)]
pub struct Decoder {
    registry: Registry,
}

impl Decoder {
    pub fn new() -> Self {
        Decoder::default()
    }

    pub fn registry(mut self, registry: Registry) -> Self {
        self.registry = registry;
        self
    }

    pub fn decode(&self, data: &[u8]) -> Result<Value, Error> {
        self.decode_with_buffers(data, &[])
    }

    pub fn decode_with_buffers(&self, data: &[u8], buffers: &[PickleBuffer]) -> Result<Value, Error> {
        let mut machine = Machine {
            registry: &self.registry,
            input: data,
            pos: 0,
            stack: Vec::new(),
            marks: Vec::new(),
            memo: Vec::new(),
            buffers,
            next_buffer: 0,
        };
        machine.run()
    }
}

/// A mark-stack slot: the index into `stack` where the mark was pushed.
struct Machine<'a> {
    registry: &'a Registry,
    input: &'a [u8],
    pos: usize,
    stack: Vec<Value>,
    marks: Vec<usize>,
    memo: Vec<Value>,
    buffers: &'a [PickleBuffer],
    next_buffer: usize,
}

impl<'a> Machine<'a> {
    fn run(&mut self) -> Result<Value, Error> {
        loop {
            let op_byte = self.read_u8()?;
            let opcode = Opcode::try_from(op_byte).map_err(Error::from)?;
            if opcode == Opcode::Stop {
                break;
            }
            self.execute(opcode)?;
        }
        if self.stack.len() != 1 {
            return Err(ErrorCode::NonSingletonStackAtStop(self.stack.len()).into());
        }
        Ok(self.stack.pop().unwrap())
    }

    fn execute(&mut self, opcode: Opcode) -> Result<(), Error> {
        match opcode {
            Opcode::Proto => {
                self.read_u8()?;
            }
            Opcode::Frame => {
                self.read_bytes(8)?;
            }
            Opcode::Mark => self.marks.push(self.stack.len()),
            Opcode::Pop => {
                self.pop()?;
            }
            Opcode::PopMark => {
                let mark = self.pop_mark()?;
                self.stack.truncate(mark);
            }
            Opcode::None => self.stack.push(Value::None),
            Opcode::NewTrue => self.stack.push(Value::Bool(true)),
            Opcode::NewFalse => self.stack.push(Value::Bool(false)),
            Opcode::BinInt1 => {
                let v = self.read_u8()?;
                self.stack.push(Value::I64(v as i64));
            }
            Opcode::BinInt2 => {
                let v = LittleEndian::read_u16(self.read_bytes(2)?);
                self.stack.push(Value::I64(v as i64));
            }
            Opcode::BinInt => {
                let v = LittleEndian::read_i32(self.read_bytes(4)?);
                self.stack.push(Value::I64(v as i64));
            }
            Opcode::Long1 => {
                let len = self.read_u8()? as usize;
                let bytes = self.read_bytes(len)?;
                self.stack.push(decode_signed_int(bytes));
            }
            Opcode::Long4 => {
                let len = LittleEndian::read_u32(self.read_bytes(4)?) as usize;
                let bytes = self.read_bytes(len)?;
                self.stack.push(decode_signed_int(bytes));
            }
            Opcode::BinFloat => {
                let v = BigEndian::read_f64(self.read_bytes(8)?);
                self.stack.push(Value::F64(v));
            }
            Opcode::ShortBinBytes => {
                let len = self.read_u8()? as usize;
                let bytes = self.read_bytes(len)?.to_vec();
                self.stack.push(Value::Bytes(SharedFrozen::new(bytes)));
            }
            Opcode::BinBytes => {
                let len = LittleEndian::read_u32(self.read_bytes(4)?) as usize;
                let bytes = self.read_bytes(len)?.to_vec();
                self.stack.push(Value::Bytes(SharedFrozen::new(bytes)));
            }
            Opcode::BinBytes8 => {
                let len = LittleEndian::read_u64(self.read_bytes(8)?) as usize;
                let bytes = self.read_bytes(len)?.to_vec();
                self.stack.push(Value::Bytes(SharedFrozen::new(bytes)));
            }
            Opcode::ByteArray8 => {
                let len = LittleEndian::read_u64(self.read_bytes(8)?) as usize;
                let bytes = self.read_bytes(len)?.to_vec();
                self.stack.push(Value::ByteArray(Shared::new(bytes)));
            }
            Opcode::ShortBinUnicode => {
                let len = self.read_u8()? as usize;
                let s = self.read_utf8(len)?;
                self.stack.push(Value::String(SharedFrozen::new(s)));
            }
            Opcode::BinUnicode => {
                let len = LittleEndian::read_u32(self.read_bytes(4)?) as usize;
                let s = self.read_utf8(len)?;
                self.stack.push(Value::String(SharedFrozen::new(s)));
            }
            Opcode::BinUnicode8 => {
                let len = LittleEndian::read_u64(self.read_bytes(8)?) as usize;
                let s = self.read_utf8(len)?;
                self.stack.push(Value::String(SharedFrozen::new(s)));
            }
            Opcode::EmptyList => self.stack.push(Value::List(Shared::new(Vec::new()))),
            Opcode::Append => {
                let item = self.pop()?;
                let list = self.top_list()?;
                list.inner_mut().push(item);
            }
            Opcode::Appends => {
                let mark = self.pop_mark()?;
                let items: Vec<Value> = self.stack.split_off(mark);
                let list = self.top_list()?;
                list.inner_mut().extend(items);
            }
            Opcode::EmptyTuple => self.stack.push(Value::Tuple(SharedFrozen::new(Vec::new()))),
            Opcode::Tuple1 => {
                let a = self.pop()?;
                self.stack.push(Value::Tuple(SharedFrozen::new(vec![a])));
            }
            Opcode::Tuple2 => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.stack.push(Value::Tuple(SharedFrozen::new(vec![a, b])));
            }
            Opcode::Tuple3 => {
                let c = self.pop()?;
                let b = self.pop()?;
                let a = self.pop()?;
                self.stack
                    .push(Value::Tuple(SharedFrozen::new(vec![a, b, c])));
            }
            Opcode::Tuple => {
                let mark = self.pop_mark()?;
                let items = self.stack.split_off(mark);
                self.stack.push(Value::Tuple(SharedFrozen::new(items)));
            }
            Opcode::EmptyDict => self.stack.push(Value::Dict(Shared::new(BTreeMap::new()))),
            Opcode::SetItem => {
                let value = self.pop()?;
                let key = self.pop()?.into_hashable()?;
                let dict = self.top_dict()?;
                dict.inner_mut().insert(key, value);
            }
            Opcode::SetItems => {
                let mark = self.pop_mark()?;
                let items = self.stack.split_off(mark);
                let dict = self.top_dict()?;
                let mut dict = dict.inner_mut();
                for pair in items.chunks(2) {
                    let key = pair[0].clone().into_hashable()?;
                    dict.insert(key, pair[1].clone());
                }
            }
            Opcode::EmptySet => self.stack.push(Value::Set(Shared::new(BTreeSet::new()))),
            Opcode::AddItems => {
                let mark = self.pop_mark()?;
                let items = self.stack.split_off(mark);
                let set = self.top_set()?;
                let mut set = set.inner_mut();
                for item in items {
                    set.insert(item.into_hashable()?);
                }
            }
            Opcode::FrozenSet => {
                let mark = self.pop_mark()?;
                let items = self.stack.split_off(mark);
                let mut set = BTreeSet::new();
                for item in items {
                    set.insert(item.into_hashable()?);
                }
                self.stack.push(Value::FrozenSet(SharedFrozen::new(set)));
            }
            Opcode::Memoize => {
                let top = self.peek()?.clone();
                self.memo.push(top);
            }
            Opcode::Put => {
                let idx = self.read_decimal_line()?;
                self.store_memo(idx)?;
            }
            Opcode::BinPut => {
                let idx = self.read_u8()? as usize;
                self.store_memo(idx)?;
            }
            Opcode::LongBinPut => {
                let idx = LittleEndian::read_u32(self.read_bytes(4)?) as usize;
                self.store_memo(idx)?;
            }
            Opcode::BinGet => {
                let idx = self.read_u8()? as usize;
                self.push_memo(idx)?;
            }
            Opcode::LongBinGet => {
                let idx = LittleEndian::read_u32(self.read_bytes(4)?) as usize;
                self.push_memo(idx)?;
            }
            Opcode::NextBuffer => {
                let buf = self
                    .buffers
                    .get(self.next_buffer)
                    .cloned()
                    .ok_or(ErrorCode::BufferUnavailable)?;
                self.next_buffer += 1;
                self.stack.push(Value::Buffer(buf));
            }
            Opcode::ReadonlyBuffer => {
                let top = self.stack.last_mut().ok_or(ErrorCode::StackUnderflow)?;
                if let Value::Buffer(PickleBuffer::ByteArray(bytes)) = top {
                    *top = Value::Buffer(PickleBuffer::from_bytes((*bytes.inner()).clone()));
                }
            }
            Opcode::BuildStruct => {
                let args = self.pop()?;
                let typecode = self.pop_typecode()?;
                self.build_struct(typecode, args)?;
            }
            Opcode::Enum => {
                let selector = self.pop()?;
                let typecode = self.pop_typecode()?;
                self.build_enum(typecode, selector)?;
            }
            Opcode::Stop => unreachable!("handled in run()"),
        }
        Ok(())
    }

    fn build_struct(&mut self, typecode: u32, args: Value) -> Result<(), Error> {
        let descriptor = self.registry.get_struct(typecode)?;
        let Value::Tuple(args) = args else {
            return Err(ErrorCode::RegistryShape("BUILDSTRUCT argument must be a tuple").into());
        };
        let args = (*args.inner()).clone();
        // Extra trailing values (from a newer writer's struct with more
        // fields than this reader's registry knows about) are dropped.
        let mut fields = Vec::with_capacity(descriptor.field_count());
        for (i, name) in descriptor.fields.iter().enumerate() {
            if let Some(value) = args.get(i) {
                fields.push(value.clone());
            } else if let Some(default) = descriptor.materialize_default(i) {
                fields.push(default);
            } else {
                return Err(ErrorCode::MissingRequiredField(name.clone()).into());
            }
        }
        self.stack.push(Value::Struct(SharedFrozen::new(StructInstance {
            typecode,
            fields: SharedFrozen::new(fields),
        })));
        Ok(())
    }

    fn build_enum(&mut self, typecode: u32, selector: Value) -> Result<(), Error> {
        let descriptor = self.registry.get_enum(typecode)?;
        let (name, int_value) = if descriptor.all_int {
            let wanted = match selector {
                Value::I64(i) => i,
                Value::Bool(b) => b as i64,
                _ => {
                    return Err(ErrorCode::RegistryShape("int-enum selector must be an integer")
                        .into())
                }
            };
            let name = descriptor.by_int_value(wanted).ok_or_else(|| {
                ErrorCode::EnumValueNotFound {
                    enum_name: descriptor.name.clone(),
                }
            })?;
            (name.to_owned(), Some(wanted))
        } else {
            let member_name = match selector {
                Value::String(s) => (*s.inner()).clone(),
                _ => {
                    return Err(
                        ErrorCode::RegistryShape("enum selector must be a string").into()
                    )
                }
            };
            if descriptor.by_name(&member_name).is_none() {
                return Err(ErrorCode::EnumNameNotFound { member_name }.into());
            }
            (member_name, None)
        };
        self.stack.push(Value::Enum(SharedFrozen::new(EnumInstance {
            typecode,
            name: SharedFrozen::new(name),
            int_value,
        })));
        Ok(())
    }

    fn pop_typecode(&mut self) -> Result<u32, Error> {
        let value = self.pop()?;
        let code = match value {
            Value::I64(i) => i,
            Value::Int(ref big) => {
                use num_traits::ToPrimitive;
                big.to_i64()
                    .ok_or_else(|| ErrorCode::TypecodeOutOfRange(u64::MAX))?
            }
            _ => return Err(ErrorCode::RegistryShape("typecode must be an integer").into()),
        };
        u32::try_from(code).map_err(|_| ErrorCode::TypecodeOutOfRange(code as u64).into())
    }

    fn store_memo(&mut self, idx: usize) -> Result<(), Error> {
        let value = self.peek()?.clone();
        if idx == self.memo.len() {
            self.memo.push(value);
            Ok(())
        } else if idx < self.memo.len() {
            Err(ErrorCode::DuplicateMemo(idx as u32).into())
        } else {
            Err(ErrorCode::SparseMemoPut(idx as u32).into())
        }
    }

    fn push_memo(&mut self, idx: usize) -> Result<(), Error> {
        let value = self
            .memo
            .get(idx)
            .cloned()
            .ok_or(ErrorCode::UnresolvedMemo(idx as u32))?;
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Result<Value, Error> {
        self.stack.pop().ok_or_else(|| ErrorCode::StackUnderflow.into())
    }

    fn peek(&self) -> Result<&Value, Error> {
        self.stack.last().ok_or_else(|| ErrorCode::StackUnderflow.into())
    }

    fn pop_mark(&mut self) -> Result<usize, Error> {
        self.marks.pop().ok_or_else(|| ErrorCode::MarkStackUnderflow.into())
    }

    fn top_list(&mut self) -> Result<&Shared<Vec<Value>>, Error> {
        match self.stack.last() {
            Some(Value::List(l)) => Ok(l),
            Some(_) => Err(ErrorCode::RegistryShape("expected a list on top of stack").into()),
            None => Err(ErrorCode::StackUnderflow.into()),
        }
    }

    fn top_dict(&mut self) -> Result<&Shared<BTreeMap<HashableValue, Value>>, Error> {
        match self.stack.last() {
            Some(Value::Dict(d)) => Ok(d),
            Some(_) => Err(ErrorCode::RegistryShape("expected a dict on top of stack").into()),
            None => Err(ErrorCode::StackUnderflow.into()),
        }
    }

    fn top_set(&mut self) -> Result<&Shared<BTreeSet<HashableValue>>, Error> {
        match self.stack.last() {
            Some(Value::Set(s)) => Ok(s),
            Some(_) => Err(ErrorCode::RegistryShape("expected a set on top of stack").into()),
            None => Err(ErrorCode::StackUnderflow.into()),
        }
    }

    fn read_u8(&mut self) -> Result<u8, Error> {
        let b = *self
            .input
            .get(self.pos)
            .ok_or(ErrorCode::TruncatedInput)?;
        self.pos += 1;
        Ok(b)
    }

    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], Error> {
        let end = self.pos.checked_add(n).ok_or(ErrorCode::TruncatedInput)?;
        let slice = self.input.get(self.pos..end).ok_or(ErrorCode::TruncatedInput)?;
        self.pos = end;
        Ok(slice)
    }

    /// Decodes a `BINUNICODE`/`SHORT_BINUNICODE`/`BINUNICODE8` payload.
    ///
    /// Known deviation: CPython encodes `str` payloads with `surrogatepass`,
    /// which can legally produce a byte sequence for a lone/unpaired
    /// surrogate codepoint. `String::from_utf8` rejects any such sequence, so
    /// a stream written by CPython with an unpaired surrogate in it fails
    /// here with [`ErrorCode::InvalidUtf8`] instead of decoding losslessly.
    /// See the "surrogatepass" entry under Open Question resolutions in
    /// DESIGN.md.
    fn read_utf8(&mut self, n: usize) -> Result<String, Error> {
        let bytes = self.read_bytes(n)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ErrorCode::InvalidUtf8.into())
    }

    /// Reads a legacy newline-terminated decimal `PUT` argument.
    fn read_decimal_line(&mut self) -> Result<usize, Error> {
        let start = self.pos;
        loop {
            let b = self.read_u8()?;
            if b == b'\n' {
                let line = &self.input[start..self.pos - 1];
                return std::str::from_utf8(line)
                    .ok()
                    .and_then(|s| s.parse::<usize>().ok())
                    .ok_or_else(|| {
                        ErrorCode::RegistryShape("malformed decimal PUT argument").into()
                    });
            }
        }
    }
}

fn decode_signed_int(bytes: &[u8]) -> Value {
    if bytes.is_empty() {
        return Value::I64(0);
    }
    let big = BigInt::from_signed_bytes_le(bytes);
    use num_traits::ToPrimitive;
    match big.to_i64() {
        Some(i) => Value::I64(i),
        None => Value::Int(big),
    }
}

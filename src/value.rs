// Copyright (c) 2015-2021 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! The restricted value domain this codec understands, and the shared/frozen
//! reference wrappers used to give every value a stable identity for the
//! memo table.

use num_bigint::BigInt;
use num_traits::ToPrimitive;
use std::cell::{Ref, RefCell, RefMut};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::rc::Rc;

use crate::error::{Error, ErrorCode};

/// A reference-counted, interior-mutable handle used for the mutable
/// container kinds (`List`, `Dict`, `Set`, `ByteArray`).
#[derive(Debug, Eq, PartialOrd, Ord, Clone)]
pub struct Shared<T>(Rc<RefCell<T>>);

impl<T> Shared<T> {
    pub fn new(value: T) -> Self {
        Shared(Rc::new(RefCell::new(value)))
    }

    pub fn inner<'a>(&'a self) -> Ref<'a, T> {
        self.0.borrow()
    }

    pub fn inner_mut<'a>(&'a self) -> RefMut<'a, T> {
        self.0.borrow_mut()
    }

    /// A stable integer derived from the handle's address, used as the memo
    /// table key. Two `Shared` handles produced by cloning the same `Shared`
    /// always report the same provenance.
    pub fn provenance(&self) -> usize {
        Rc::as_ptr(&self.0).expose_provenance()
    }

    /// Number of live handles pointing at the same underlying value. Used by
    /// the encoder's memoization heuristic.
    pub fn ref_count(&self) -> usize {
        Rc::strong_count(&self.0)
    }
}

impl<T> From<T> for Shared<T> {
    fn from(value: T) -> Self {
        Shared::new(value)
    }
}

impl<T> From<SharedFrozen<T>> for Shared<T>
where
    T: Clone,
{
    fn from(value: SharedFrozen<T>) -> Self {
        Shared::new(value.into_raw_or_cloned())
    }
}

impl<T> Shared<T>
where
    T: Clone,
{
    pub fn into_raw_or_cloned(self) -> T {
        if Rc::strong_count(&self.0) == 1 {
            if let Some(inner) = Rc::into_inner(self.0) {
                RefCell::into_inner(inner)
            } else {
                panic!("TOCTOU while trying to serialize Shared")
            }
        } else {
            self.0.borrow().clone()
        }
    }
}

impl<T> std::cmp::PartialEq for Shared<T>
where
    T: std::cmp::PartialEq,
{
    fn eq(&self, other: &Self) -> bool {
        if Rc::ptr_eq(&self.0, &other.0) {
            return true;
        }

        let this_inner = self.0.borrow();
        let other_inner = other.0.borrow();

        this_inner.eq(&other_inner)
    }
}

/// A reference-counted, immutable handle used for the immutable container
/// and scalar kinds (`Bytes`, `String`, `Tuple`, `FrozenSet`).
#[derive(Debug, Eq, PartialOrd, Ord, Clone)]
pub struct SharedFrozen<T>(Rc<T>);

impl<T> SharedFrozen<T> {
    pub fn new(value: T) -> Self {
        SharedFrozen(Rc::new(value))
    }

    pub fn inner<'a>(&'a self) -> &T {
        self.0.as_ref()
    }

    pub fn provenance(&self) -> usize {
        Rc::as_ptr(&self.0).expose_provenance()
    }

    pub fn ref_count(&self) -> usize {
        Rc::strong_count(&self.0)
    }
}

impl<T> From<T> for SharedFrozen<T> {
    fn from(value: T) -> Self {
        SharedFrozen::new(value)
    }
}

impl<T> From<Shared<T>> for SharedFrozen<T>
where
    T: Clone,
{
    fn from(value: Shared<T>) -> Self {
        SharedFrozen::new(value.into_raw_or_cloned())
    }
}

impl<T> SharedFrozen<T>
where
    T: Clone,
{
    pub fn into_raw_or_cloned(self) -> T {
        if Rc::strong_count(&self.0) == 1 {
            if let Some(inner) = Rc::into_inner(self.0) {
                inner
            } else {
                panic!("TOCTOU while trying to serialize Shared")
            }
        } else {
            (*self.inner()).clone()
        }
    }
}

impl<T> std::cmp::PartialEq for SharedFrozen<T>
where
    T: std::cmp::PartialEq,
{
    fn eq(&self, other: &Self) -> bool {
        if Rc::ptr_eq(&self.0, &other.0) {
            return true;
        }

        let this_inner = self.inner();
        let other_inner = other.inner();

        this_inner.eq(other_inner)
    }
}

/// A lightweight handle over an out-of-band buffer: either an immutable byte
/// string or a mutable byte buffer. Equality compares the underlying bytes,
/// not identity — identity is still tracked separately by the memo table via
/// [`PickleBuffer::provenance`].
#[derive(Debug, Clone)]
pub enum PickleBuffer {
    /// An immutable view, serialized with `READONLY_BUFFER` on the
    /// out-of-band path.
    Bytes(SharedFrozen<Vec<u8>>),
    /// A mutable view.
    ByteArray(Shared<Vec<u8>>),
}

impl PickleBuffer {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        PickleBuffer::Bytes(SharedFrozen::new(bytes))
    }

    pub fn from_byte_array(bytes: Vec<u8>) -> Self {
        PickleBuffer::ByteArray(Shared::new(bytes))
    }

    pub fn is_readonly(&self) -> bool {
        matches!(self, PickleBuffer::Bytes(_))
    }

    pub fn to_vec(&self) -> Vec<u8> {
        match self {
            PickleBuffer::Bytes(b) => (*b.inner()).clone(),
            PickleBuffer::ByteArray(b) => (*b.inner()).clone(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            PickleBuffer::Bytes(b) => b.inner().len(),
            PickleBuffer::ByteArray(b) => b.inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn provenance(&self) -> usize {
        match self {
            PickleBuffer::Bytes(b) => b.provenance(),
            PickleBuffer::ByteArray(b) => b.provenance(),
        }
    }

    pub fn ref_count(&self) -> usize {
        match self {
            PickleBuffer::Bytes(b) => b.ref_count(),
            PickleBuffer::ByteArray(b) => b.ref_count(),
        }
    }
}

impl PartialEq for PickleBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.to_vec() == other.to_vec()
    }
}

/// A struct instance: a typecode naming its descriptor in the bound
/// registry, plus its positional field values in declaration order.
///
/// Structural equality is `(typecode, fields)` — the typecode stands in for
/// the registered type's identity, since the codec itself never sees the
/// descriptor's name.
#[derive(Debug, Clone, PartialEq)]
pub struct StructInstance {
    pub typecode: u32,
    pub fields: SharedFrozen<Vec<Value>>,
}

/// A resolved enumeration member: a typecode naming its descriptor, the
/// member's name, and (for integer enums) its integer value.
#[derive(Debug, Clone, PartialEq)]
pub struct EnumInstance {
    pub typecode: u32,
    pub name: SharedFrozen<String>,
    pub int_value: Option<i64>,
}

/// Represents every value kind this codec can encode or decode.
///
/// Note on integers: the distinction between the two variants is fuzzy, as
/// in Python all integers are conceptually unbounded. Everything that fits
/// into an `i64` is `I64`; the rest uses `BigInt`.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "variantly", derive(variantly::Variantly))]
pub enum Value {
    /// None
    None,
    /// Boolean
    Bool(bool),
    /// Short integer
    I64(i64),
    /// Long integer (unbounded length)
    Int(BigInt),
    /// Float
    F64(f64),
    /// Immutable bytestring
    Bytes(SharedFrozen<Vec<u8>>),
    /// Mutable byte buffer
    ByteArray(Shared<Vec<u8>>),
    /// Unicode string
    String(SharedFrozen<String>),
    /// List
    List(Shared<Vec<Value>>),
    /// Tuple
    Tuple(SharedFrozen<Vec<Value>>),
    /// Set
    Set(Shared<BTreeSet<HashableValue>>),
    /// Frozen (immutable) set
    FrozenSet(SharedFrozen<BTreeSet<HashableValue>>),
    /// Dictionary (map)
    Dict(Shared<BTreeMap<HashableValue, Value>>),
    /// Out-of-band buffer handle
    Buffer(PickleBuffer),
    /// User-registered record struct
    Struct(SharedFrozen<StructInstance>),
    /// User-registered enumeration member
    Enum(SharedFrozen<EnumInstance>),
}

/// The subset of [`Value`] that can be used as a dict key or set member.
///
/// In Rust, the type is *not* hashable in the `std::hash` sense — we use
/// B-tree maps and sets instead of the hash variants, so a consistent total
/// ordering between all possible kinds is defined below instead.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "variantly", derive(variantly::Variantly))]
pub enum HashableValue {
    /// None
    None,
    /// Boolean
    Bool(bool),
    /// Short integer
    I64(i64),
    /// Long integer
    Int(BigInt),
    /// Float
    F64(f64),
    /// Bytestring
    Bytes(SharedFrozen<Vec<u8>>),
    /// Unicode string
    String(SharedFrozen<String>),
    /// Tuple
    Tuple(SharedFrozen<Vec<HashableValue>>),
    /// Frozen (immutable) set
    FrozenSet(SharedFrozen<BTreeSet<HashableValue>>),
}

fn values_to_hashable(
    values: SharedFrozen<Vec<Value>>,
) -> Result<SharedFrozen<Vec<HashableValue>>, Error> {
    Ok(values
        .inner()
        .iter()
        .cloned()
        .map(Value::into_hashable)
        .collect::<Result<Vec<_>, _>>()?
        .into())
}

fn hashable_to_values(values: SharedFrozen<Vec<HashableValue>>) -> SharedFrozen<Vec<Value>> {
    values
        .inner()
        .iter()
        .cloned()
        .map(HashableValue::into_value)
        .collect::<Vec<_>>()
        .into()
}

impl Value {
    /// Convert the value into a hashable version, if possible. If not,
    /// return a `ValueNotHashable` error.
    pub fn into_hashable(self) -> Result<HashableValue, Error> {
        match self {
            Value::None => Ok(HashableValue::None),
            Value::Bool(b) => Ok(HashableValue::Bool(b)),
            Value::I64(i) => Ok(HashableValue::I64(i)),
            Value::Int(i) => Ok(HashableValue::Int(i)),
            Value::F64(f) => Ok(HashableValue::F64(f)),
            Value::Bytes(b) => Ok(HashableValue::Bytes(b)),
            Value::String(s) => Ok(HashableValue::String(s)),
            Value::FrozenSet(v) => Ok(HashableValue::FrozenSet(v)),
            Value::Tuple(v) => values_to_hashable(v).map(HashableValue::Tuple),
            _ => Err(Error::Syntax(ErrorCode::ValueNotHashable)),
        }
    }

    /// Whether this value is one of the kinds that are always memoized
    /// (mutable, or eagerly built from already-checked sub-values).
    pub fn is_container(&self) -> bool {
        matches!(
            self,
            Value::List(_)
                | Value::Dict(_)
                | Value::Set(_)
                | Value::FrozenSet(_)
                | Value::Tuple(_)
                | Value::ByteArray(_)
                | Value::Struct(_)
                | Value::Enum(_)
        )
    }
}

impl HashableValue {
    /// Convert the value into its non-hashable version. This always works.
    pub fn into_value(self) -> Value {
        match self {
            HashableValue::None => Value::None,
            HashableValue::Bool(b) => Value::Bool(b),
            HashableValue::I64(i) => Value::I64(i),
            HashableValue::Int(i) => Value::Int(i),
            HashableValue::F64(f) => Value::F64(f),
            HashableValue::Bytes(b) => Value::Bytes(b),
            HashableValue::String(s) => Value::String(s),
            HashableValue::FrozenSet(v) => Value::FrozenSet(v),
            HashableValue::Tuple(v) => Value::Tuple(hashable_to_values(v)),
        }
    }

    /// A string rendering suitable for use in dict-key error messages.
    pub fn to_string_key(&self) -> Option<String> {
        let result = match *self {
            HashableValue::String(ref s) => s.inner().to_owned(),
            HashableValue::None => "null".to_owned(),
            HashableValue::Bool(b) => b.to_string(),
            HashableValue::I64(i) => i.to_string(),
            HashableValue::Int(ref big_int) => big_int.to_string(),
            HashableValue::F64(f) => {
                let mut as_str = f.to_string();
                if !as_str.contains('.') {
                    as_str += ".0";
                }
                as_str
            }
            _ => return None,
        };

        Some(result)
    }
}

fn write_elements<'a, I, T>(
    f: &mut fmt::Formatter,
    it: I,
    prefix: &'static str,
    suffix: &'static str,
    len: usize,
    always_comma: bool,
) -> fmt::Result
where
    I: Iterator<Item = &'a T>,
    T: fmt::Display + 'a,
{
    f.write_str(prefix)?;
    for (i, item) in it.enumerate() {
        if i < len - 1 || always_comma {
            write!(f, "{item}, ")?;
        } else {
            write!(f, "{item}")?;
        }
    }
    f.write_str(suffix)
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Value::None => write!(f, "None"),
            Value::Bool(b) => write!(f, "{}", if b { "True" } else { "False" }),
            Value::I64(i) => write!(f, "{i}"),
            Value::Int(ref i) => write!(f, "{i}"),
            Value::F64(v) => write!(f, "{v}"),
            Value::Bytes(ref b) => write!(f, "b{:?}", b.inner()),
            Value::ByteArray(ref b) => write!(f, "bytearray({:?})", b.inner()),
            Value::String(ref s) => write!(f, "{:?}", s.inner()),
            Value::List(ref v) => {
                let v = v.inner();
                write_elements(f, v.iter(), "[", "]", v.len(), false)
            }
            Value::Tuple(ref v) => {
                let v = v.inner();
                write_elements(f, v.iter(), "(", ")", v.len(), v.len() == 1)
            }
            Value::FrozenSet(ref v) => {
                let v = v.inner();
                write_elements(f, v.iter(), "frozenset([", "])", v.len(), false)
            }
            Value::Set(ref v) => {
                let v = v.inner();
                if v.is_empty() {
                    write!(f, "set()")
                } else {
                    write_elements(f, v.iter(), "{", "}", v.len(), false)
                }
            }
            Value::Dict(ref v) => {
                write!(f, "{{")?;
                let v = v.inner();
                for (i, (key, value)) in v.iter().enumerate() {
                    if i < v.len() - 1 {
                        write!(f, "{key}: {value}, ")?;
                    } else {
                        write!(f, "{key}: {value}")?;
                    }
                }
                write!(f, "}}")
            }
            Value::Buffer(ref b) => write!(f, "<PickleBuffer of {} bytes>", b.len()),
            Value::Struct(ref s) => write!(f, "<struct typecode={}>", s.inner().typecode),
            Value::Enum(ref e) => write!(f, "{}", e.inner().name.inner()),
        }
    }
}

impl fmt::Display for HashableValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            HashableValue::None => write!(f, "None"),
            HashableValue::Bool(b) => write!(f, "{}", if b { "True" } else { "False" }),
            HashableValue::I64(i) => write!(f, "{i}"),
            HashableValue::Int(ref i) => write!(f, "{i}"),
            HashableValue::F64(v) => write!(f, "{v}"),
            HashableValue::Bytes(ref b) => {
                let b = b.inner();
                write!(f, "b{b:?}")
            }
            HashableValue::String(ref s) => {
                let s = s.inner();
                write!(f, "{s:?}")
            }
            HashableValue::Tuple(ref v) => {
                let v = v.inner();
                write_elements(f, v.iter(), "(", ")", v.len(), v.len() == 1)
            }
            HashableValue::FrozenSet(ref v) => {
                let v = v.inner();
                write_elements(f, v.iter(), "frozenset([", "])", v.len(), false)
            }
        }
    }
}

impl PartialEq for HashableValue {
    fn eq(&self, other: &HashableValue) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HashableValue {}

impl PartialOrd for HashableValue {
    fn partial_cmp(&self, other: &HashableValue) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Implement a (more or less) consistent ordering for `HashableValue`s so
/// that they can be stored in dicts and sets.
///
/// Numeric values with the same value (integral or not) compare equal. For
/// other kinds, an ordering between all kinds A and B is defined so that
/// every object of kind A is always less than every object of kind B,
/// similar to Python 2's cross-type ordering.
impl Ord for HashableValue {
    fn cmp(&self, other: &HashableValue) -> Ordering {
        use self::HashableValue::*;
        match *self {
            None => match *other {
                None => Ordering::Equal,
                _ => Ordering::Less,
            },
            Bool(b) => match *other {
                None => Ordering::Greater,
                Bool(b2) => b.cmp(&b2),
                I64(i2) => (b as i64).cmp(&i2),
                Int(ref bi) => BigInt::from(b as i64).cmp(bi),
                F64(f) => float_ord(b as i64 as f64, f),
                _ => Ordering::Less,
            },
            I64(i) => match *other {
                None => Ordering::Greater,
                Bool(b) => i.cmp(&(b as i64)),
                I64(i2) => i.cmp(&i2),
                Int(ref bi) => BigInt::from(i).cmp(bi),
                F64(f) => float_ord(i as f64, f),
                _ => Ordering::Less,
            },
            Int(ref bi) => match *other {
                None => Ordering::Greater,
                Bool(b) => bi.cmp(&BigInt::from(b as i64)),
                I64(i) => bi.cmp(&BigInt::from(i)),
                Int(ref bi2) => bi.cmp(bi2),
                F64(f) => float_bigint_ord(bi, f),
                _ => Ordering::Less,
            },
            F64(f) => match *other {
                None => Ordering::Greater,
                Bool(b) => float_ord(f, b as i64 as f64),
                I64(i) => float_ord(f, i as f64),
                Int(ref bi) => BigInt::from(f as i64).cmp(bi),
                F64(f2) => float_ord(f, f2),
                _ => Ordering::Less,
            },
            Bytes(ref bs) => match *other {
                String(_) | FrozenSet(_) | Tuple(_) => Ordering::Less,
                Bytes(ref bs2) => bs.cmp(bs2),
                _ => Ordering::Greater,
            },
            String(ref s) => match *other {
                FrozenSet(_) | Tuple(_) => Ordering::Less,
                String(ref s2) => s.cmp(s2),
                _ => Ordering::Greater,
            },
            FrozenSet(ref s) => match *other {
                Tuple(_) => Ordering::Less,
                FrozenSet(ref s2) => s.cmp(s2),
                _ => Ordering::Greater,
            },
            Tuple(ref t) => match *other {
                Tuple(ref t2) => t.cmp(t2),
                _ => Ordering::Greater,
            },
        }
    }
}

/// A "reasonable" total ordering for floats.
fn float_ord(f: f64, g: f64) -> Ordering {
    match f.partial_cmp(&g) {
        Some(o) => o,
        None => Ordering::Less,
    }
}

/// Ordering between floats and big integers.
fn float_bigint_ord(bi: &BigInt, g: f64) -> Ordering {
    match bi.to_f64() {
        Some(f) => float_ord(f, g),
        None => {
            if bi.is_positive() {
                Ordering::Greater
            } else {
                Ordering::Less
            }
        }
    }
}

//! Element types and local typed arrays.
//!
//! Every array crossing the wire is a flat little-endian buffer tagged with a
//! [`ValueType`]. The numeric codes are part of the wire contract:
//!
//! | code | type        | command character |
//! |------|-------------|-------------------|
//! | 0    | unknown     | -                 |
//! | 1    | int32       | `I`               |
//! | 2    | int64       | `L`               |
//! | 3    | int16       | -                 |
//! | 4    | float32     | `F`               |
//! | 5    | float64     | `D`               |
//! | 6    | complex64   | `C`               |
//! | 7    | complex128  | `Z`               |

use crate::error::ProtocolError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;

/// Element type tag of a stream or a workspace object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Unknown,
    Int32,
    Int64,
    Int16,
    Float32,
    Float64,
    Complex64,
    Complex128,
}

impl ValueType {
    /// Wire code of this type.
    pub fn code(self) -> u8 {
        match self {
            ValueType::Unknown => 0,
            ValueType::Int32 => 1,
            ValueType::Int64 => 2,
            ValueType::Int16 => 3,
            ValueType::Float32 => 4,
            ValueType::Float64 => 5,
            ValueType::Complex64 => 6,
            ValueType::Complex128 => 7,
        }
    }

    pub fn from_code(code: u8) -> Result<Self, ProtocolError> {
        Ok(match code {
            0 => ValueType::Unknown,
            1 => ValueType::Int32,
            2 => ValueType::Int64,
            3 => ValueType::Int16,
            4 => ValueType::Float32,
            5 => ValueType::Float64,
            6 => ValueType::Complex64,
            7 => ValueType::Complex128,
            other => return Err(ProtocolError::UnknownValueType(other)),
        })
    }

    /// Width of one element in bytes. Untyped streams are byte streams.
    pub fn width(self) -> usize {
        match self {
            ValueType::Unknown => 1,
            ValueType::Int16 => 2,
            ValueType::Int32 | ValueType::Float32 => 4,
            ValueType::Int64 | ValueType::Float64 | ValueType::Complex64 => 8,
            ValueType::Complex128 => 16,
        }
    }

    pub fn is_known(self) -> bool {
        self != ValueType::Unknown
    }

    pub fn is_complex(self) -> bool {
        matches!(self, ValueType::Complex64 | ValueType::Complex128)
    }

    pub fn is_integer(self) -> bool {
        matches!(self, ValueType::Int16 | ValueType::Int32 | ValueType::Int64)
    }

    /// Type character used in workspace allocation commands.
    ///
    /// `int16` can be streamed but cannot be allocated in a workspace.
    pub fn type_char(self) -> Option<char> {
        match self {
            ValueType::Int32 => Some('I'),
            ValueType::Int64 => Some('L'),
            ValueType::Float32 => Some('F'),
            ValueType::Float64 => Some('D'),
            ValueType::Complex64 => Some('C'),
            ValueType::Complex128 => Some('Z'),
            ValueType::Int16 | ValueType::Unknown => None,
        }
    }

    pub fn from_type_char(c: char) -> Option<Self> {
        match c.to_ascii_uppercase() {
            'I' => Some(ValueType::Int32),
            'L' => Some(ValueType::Int64),
            'F' => Some(ValueType::Float32),
            'D' => Some(ValueType::Float64),
            'C' => Some(ValueType::Complex64),
            'Z' => Some(ValueType::Complex128),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ValueType::Unknown => "unknown",
            ValueType::Int32 => "int32",
            ValueType::Int64 => "int64",
            ValueType::Int16 => "int16",
            ValueType::Float32 => "float32",
            ValueType::Float64 => "float64",
            ValueType::Complex64 => "complex64",
            ValueType::Complex128 => "complex128",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A complex number stored as consecutive real and imaginary parts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Complex<T> {
    pub re: T,
    pub im: T,
}

impl<T> Complex<T> {
    pub const fn new(re: T, im: T) -> Self {
        Self { re, im }
    }
}

/// A scalar that can live in an [`Array`].
pub trait Element: Copy + Send + Sync + 'static {
    const VALUE_TYPE: ValueType;

    /// Appends the little-endian encoding of `self`.
    fn put(self, buf: &mut BytesMut);

    /// Reads one element; the caller guarantees enough bytes remain.
    fn get(buf: &mut &[u8]) -> Self;

    fn into_array(values: Vec<Self>) -> Array;

    fn view(array: &Array) -> Option<&[Self]>;

    fn take(array: Array) -> Result<Vec<Self>, Array>;
}

macro_rules! element {
    ($ty:ty, $variant:ident, $put:ident, $get:ident) => {
        impl Element for $ty {
            const VALUE_TYPE: ValueType = ValueType::$variant;

            fn put(self, buf: &mut BytesMut) {
                buf.$put(self);
            }

            fn get(buf: &mut &[u8]) -> Self {
                buf.$get()
            }

            fn into_array(values: Vec<Self>) -> Array {
                Array::$variant(values)
            }

            fn view(array: &Array) -> Option<&[Self]> {
                match array {
                    Array::$variant(values) => Some(values),
                    _ => None,
                }
            }

            fn take(array: Array) -> Result<Vec<Self>, Array> {
                match array {
                    Array::$variant(values) => Ok(values),
                    other => Err(other),
                }
            }
        }
    };
}

element!(i16, Int16, put_i16_le, get_i16_le);
element!(i32, Int32, put_i32_le, get_i32_le);
element!(i64, Int64, put_i64_le, get_i64_le);
element!(f32, Float32, put_f32_le, get_f32_le);
element!(f64, Float64, put_f64_le, get_f64_le);

macro_rules! complex_element {
    ($ty:ty, $variant:ident, $put:ident, $get:ident) => {
        impl Element for Complex<$ty> {
            const VALUE_TYPE: ValueType = ValueType::$variant;

            fn put(self, buf: &mut BytesMut) {
                buf.$put(self.re);
                buf.$put(self.im);
            }

            fn get(buf: &mut &[u8]) -> Self {
                let re = buf.$get();
                let im = buf.$get();
                Complex::new(re, im)
            }

            fn into_array(values: Vec<Self>) -> Array {
                Array::$variant(values)
            }

            fn view(array: &Array) -> Option<&[Self]> {
                match array {
                    Array::$variant(values) => Some(values),
                    _ => None,
                }
            }

            fn take(array: Array) -> Result<Vec<Self>, Array> {
                match array {
                    Array::$variant(values) => Ok(values),
                    other => Err(other),
                }
            }
        }
    };
}

complex_element!(f32, Complex64, put_f32_le, get_f32_le);
complex_element!(f64, Complex128, put_f64_le, get_f64_le);

/// A local, typed, one-dimensional array.
#[derive(Debug, Clone, PartialEq)]
pub enum Array {
    Int16(Vec<i16>),
    Int32(Vec<i32>),
    Int64(Vec<i64>),
    Float32(Vec<f32>),
    Float64(Vec<f64>),
    Complex64(Vec<Complex<f32>>),
    Complex128(Vec<Complex<f64>>),
}

macro_rules! with_values {
    ($array:expr, $values:ident => $body:expr) => {
        match $array {
            Array::Int16($values) => $body,
            Array::Int32($values) => $body,
            Array::Int64($values) => $body,
            Array::Float32($values) => $body,
            Array::Float64($values) => $body,
            Array::Complex64($values) => $body,
            Array::Complex128($values) => $body,
        }
    };
}

fn encode_values<T: Element>(values: &[T]) -> Bytes {
    let mut buf = BytesMut::with_capacity(values.len() * T::VALUE_TYPE.width());
    for value in values {
        value.put(&mut buf);
    }
    buf.freeze()
}

fn decode_values<T: Element>(mut bytes: &[u8]) -> Array {
    let mut values = Vec::with_capacity(bytes.len() / T::VALUE_TYPE.width());
    while bytes.has_remaining() {
        values.push(T::get(&mut bytes));
    }
    T::into_array(values)
}

impl Array {
    /// Creates a zero-length array of the given type.
    pub fn empty(value_type: ValueType) -> Result<Self, ProtocolError> {
        Self::from_bytes(value_type, &[])
    }

    /// Reinterprets a little-endian buffer as elements of `value_type`.
    pub fn from_bytes(value_type: ValueType, bytes: &[u8]) -> Result<Self, ProtocolError> {
        if !value_type.is_known() {
            return Err(ProtocolError::UnknownType);
        }
        if bytes.len() % value_type.width() != 0 {
            return Err(ProtocolError::TruncatedElement {
                len: bytes.len(),
                value_type,
            });
        }
        Ok(match value_type {
            ValueType::Int16 => decode_values::<i16>(bytes),
            ValueType::Int32 => decode_values::<i32>(bytes),
            ValueType::Int64 => decode_values::<i64>(bytes),
            ValueType::Float32 => decode_values::<f32>(bytes),
            ValueType::Float64 => decode_values::<f64>(bytes),
            ValueType::Complex64 => decode_values::<Complex<f32>>(bytes),
            ValueType::Complex128 => decode_values::<Complex<f64>>(bytes),
            ValueType::Unknown => return Err(ProtocolError::UnknownType),
        })
    }

    /// Converts real values to the given type; integer targets truncate.
    pub fn from_f64(value_type: ValueType, values: &[f64]) -> Result<Self, ProtocolError> {
        Ok(match value_type {
            ValueType::Int16 => Array::Int16(values.iter().map(|&v| v as i16).collect()),
            ValueType::Int32 => Array::Int32(values.iter().map(|&v| v as i32).collect()),
            ValueType::Int64 => Array::Int64(values.iter().map(|&v| v as i64).collect()),
            ValueType::Float32 => Array::Float32(values.iter().map(|&v| v as f32).collect()),
            ValueType::Float64 => Array::Float64(values.to_vec()),
            ValueType::Complex64 => Array::Complex64(
                values
                    .iter()
                    .map(|&v| Complex::new(v as f32, 0.0))
                    .collect(),
            ),
            ValueType::Complex128 => {
                Array::Complex128(values.iter().map(|&v| Complex::new(v, 0.0)).collect())
            }
            ValueType::Unknown => return Err(ProtocolError::UnknownType),
        })
    }

    pub fn value_type(&self) -> ValueType {
        match self {
            Array::Int16(_) => ValueType::Int16,
            Array::Int32(_) => ValueType::Int32,
            Array::Int64(_) => ValueType::Int64,
            Array::Float32(_) => ValueType::Float32,
            Array::Float64(_) => ValueType::Float64,
            Array::Complex64(_) => ValueType::Complex64,
            Array::Complex128(_) => ValueType::Complex128,
        }
    }

    pub fn len(&self) -> usize {
        with_values!(self, values => values.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size of the little-endian encoding in bytes.
    pub fn byte_len(&self) -> usize {
        self.len() * self.value_type().width()
    }

    /// Serializes the elements to little-endian bytes.
    pub fn to_bytes(&self) -> Bytes {
        with_values!(self, values => encode_values(values))
    }

    /// Borrows the elements if the array holds `T`.
    pub fn as_slice<T: Element>(&self) -> Option<&[T]> {
        T::view(self)
    }

    /// Takes the elements if the array holds `T`, returning the array otherwise.
    pub fn into_vec<T: Element>(self) -> Result<Vec<T>, Array> {
        T::take(self)
    }

    /// Copies a sub-range of the elements into a new array of the same type.
    pub fn slice(&self, range: Range<usize>) -> Array {
        with_values!(self, values => Element::into_array(values[range].to_vec()))
    }

    /// Widens real elements to `f64`. Complex arrays yield `None`.
    pub fn to_f64(&self) -> Option<Vec<f64>> {
        match self {
            Array::Int16(v) => Some(v.iter().map(|&x| x as f64).collect()),
            Array::Int32(v) => Some(v.iter().map(|&x| x as f64).collect()),
            Array::Int64(v) => Some(v.iter().map(|&x| x as f64).collect()),
            Array::Float32(v) => Some(v.iter().map(|&x| x as f64).collect()),
            Array::Float64(v) => Some(v.clone()),
            Array::Complex64(_) | Array::Complex128(_) => None,
        }
    }

    /// Widens integer elements to `i64`. Floating arrays yield `None`.
    pub fn to_i64(&self) -> Option<Vec<i64>> {
        match self {
            Array::Int16(v) => Some(v.iter().map(|&x| x as i64).collect()),
            Array::Int32(v) => Some(v.iter().map(|&x| x as i64).collect()),
            Array::Int64(v) => Some(v.clone()),
            _ => None,
        }
    }
}

impl<T: Element> From<Vec<T>> for Array {
    fn from(values: Vec<T>) -> Self {
        T::into_array(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_roundtrip() {
        for code in 0..=7u8 {
            let value_type = ValueType::from_code(code).unwrap();
            assert_eq!(value_type.code(), code);
        }
        assert!(matches!(
            ValueType::from_code(8),
            Err(ProtocolError::UnknownValueType(8))
        ));
    }

    #[test]
    fn test_widths() {
        assert_eq!(ValueType::Int16.width(), 2);
        assert_eq!(ValueType::Int32.width(), 4);
        assert_eq!(ValueType::Int64.width(), 8);
        assert_eq!(ValueType::Float32.width(), 4);
        assert_eq!(ValueType::Float64.width(), 8);
        assert_eq!(ValueType::Complex64.width(), 8);
        assert_eq!(ValueType::Complex128.width(), 16);
    }

    #[test]
    fn test_type_chars() {
        assert_eq!(ValueType::Float64.type_char(), Some('D'));
        assert_eq!(ValueType::Complex128.type_char(), Some('Z'));
        assert_eq!(ValueType::Int16.type_char(), None);
        assert_eq!(ValueType::from_type_char('l'), Some(ValueType::Int64));
        assert_eq!(ValueType::from_type_char('X'), None);
    }

    #[test]
    fn test_little_endian_layout() {
        let array = Array::from(vec![1i32, 2, 3]);
        assert_eq!(
            array.to_bytes().as_ref(),
            &[1, 0, 0, 0, 2, 0, 0, 0, 3, 0, 0, 0]
        );

        let complex = Array::from(vec![Complex::new(1.0f32, -1.0)]);
        let bytes = complex.to_bytes();
        assert_eq!(bytes.len(), 8);
        assert_eq!(&bytes[..4], &1.0f32.to_le_bytes());
        assert_eq!(&bytes[4..], &(-1.0f32).to_le_bytes());
    }

    #[test]
    fn test_from_bytes_rejects_partial_element() {
        let err = Array::from_bytes(ValueType::Float64, &[0u8; 12]).unwrap_err();
        assert!(matches!(err, ProtocolError::TruncatedElement { len: 12, .. }));
    }

    #[test]
    fn test_from_bytes_rejects_unknown() {
        assert!(matches!(
            Array::from_bytes(ValueType::Unknown, &[]),
            Err(ProtocolError::UnknownType)
        ));
    }

    #[test]
    fn test_slice_and_views() {
        let array = Array::from(vec![1.0f64, 2.0, 3.0, 4.0]);
        let middle = array.slice(1..3);
        assert_eq!(middle.as_slice::<f64>(), Some(&[2.0, 3.0][..]));
        assert!(middle.as_slice::<i32>().is_none());

        let back = middle.into_vec::<i32>().unwrap_err();
        assert_eq!(back.value_type(), ValueType::Float64);
    }

    #[test]
    fn test_from_f64_conversions() {
        let ints = Array::from_f64(ValueType::Int32, &[1.9, -2.5]).unwrap();
        assert_eq!(ints, Array::Int32(vec![1, -2]));

        let complex = Array::from_f64(ValueType::Complex128, &[3.0]).unwrap();
        assert_eq!(complex, Array::Complex128(vec![Complex::new(3.0, 0.0)]));
        assert!(complex.to_f64().is_none());
    }
}

//! Record codec contract: every application message is a record serialized
//! field by field, big-endian, at fixed widths for primitives. The canonical
//! type descriptors feed the protocol hash, so they must stay stable across
//! implementations.

use crate::shared::{NetError, NetResult, SizedRead, SizedWrite};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

const MAX_STRING_LEN: usize = u16::max_value() as usize;
const MAX_LIST_LEN: usize = u16::max_value() as usize;

/// Field-level codec. Implemented for the primitive types, strings, byte
/// arrays, lists, optionals and (via the family macros) records and enums.
pub trait Codec: Sized {
    /// Canonical type descriptor, e.g. `I`, `T`, `[B`, `List<I>`, `Lfq;`.
    fn descriptor() -> String;

    fn encode<W: SizedWrite>(&self, out: &mut W) -> NetResult<()>;

    fn decode<R: SizedRead>(stream: &mut R) -> NetResult<Self>;
}

/// A named record within a message family.
pub trait Record: Codec {
    const FQ_NAME: &'static str;

    /// Field (name, descriptor) pairs in declaration order.
    fn fields() -> Vec<(&'static str, String)>;
}

/// Byte-array field: 4-byte length prefix, then raw bytes. A newtype keeps
/// it distinct from `Vec<T>` lists.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Bytes(pub Vec<u8>);

macro_rules! primitive_codec {
    ($type:ty, $tag:expr, $write:ident, $read:ident) => {
        impl Codec for $type {
            #[inline]
            fn descriptor() -> String {
                $tag.to_string()
            }

            #[inline]
            fn encode<W: SizedWrite>(&self, out: &mut W) -> NetResult<()> {
                out.$write::<BigEndian>(*self)?;
                Ok(())
            }

            #[inline]
            fn decode<R: SizedRead>(stream: &mut R) -> NetResult<Self> {
                stream.$read::<BigEndian>().map_err(|_| NetError::Serialization)
            }
        }
    };
}

primitive_codec!(i16, "S", write_i16, read_i16);
primitive_codec!(i32, "I", write_i32, read_i32);
primitive_codec!(i64, "J", write_i64, read_i64);
primitive_codec!(f32, "F", write_f32, read_f32);
primitive_codec!(f64, "D", write_f64, read_f64);

impl Codec for i8 {
    #[inline]
    fn descriptor() -> String {
        "B".to_string()
    }

    #[inline]
    fn encode<W: SizedWrite>(&self, out: &mut W) -> NetResult<()> {
        out.write_i8(*self)?;
        Ok(())
    }

    #[inline]
    fn decode<R: SizedRead>(stream: &mut R) -> NetResult<Self> {
        stream.read_i8().map_err(|_| NetError::Serialization)
    }
}

impl Codec for u8 {
    #[inline]
    fn descriptor() -> String {
        "U".to_string()
    }

    #[inline]
    fn encode<W: SizedWrite>(&self, out: &mut W) -> NetResult<()> {
        out.write_u8(*self)?;
        Ok(())
    }

    #[inline]
    fn decode<R: SizedRead>(stream: &mut R) -> NetResult<Self> {
        stream.read_u8().map_err(|_| NetError::Serialization)
    }
}

impl Codec for bool {
    #[inline]
    fn descriptor() -> String {
        "Z".to_string()
    }

    #[inline]
    fn encode<W: SizedWrite>(&self, out: &mut W) -> NetResult<()> {
        out.write_u8(*self as u8)?;
        Ok(())
    }

    #[inline]
    fn decode<R: SizedRead>(stream: &mut R) -> NetResult<Self> {
        match stream.read_u8().map_err(|_| NetError::Serialization)? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(NetError::Serialization),
        }
    }
}

/// Chars occupy two bytes on the wire, so only basic-plane scalars are
/// representable.
impl Codec for char {
    #[inline]
    fn descriptor() -> String {
        "C".to_string()
    }

    #[inline]
    fn encode<W: SizedWrite>(&self, out: &mut W) -> NetResult<()> {
        let code = *self as u32;

        if code > u32::from(u16::max_value()) {
            return Err(NetError::Serialization);
        }

        out.write_u16::<BigEndian>(code as u16)?;
        Ok(())
    }

    #[inline]
    fn decode<R: SizedRead>(stream: &mut R) -> NetResult<Self> {
        let code = stream.read_u16::<BigEndian>().map_err(|_| NetError::Serialization)?;
        std::char::from_u32(u32::from(code)).ok_or(NetError::Serialization)
    }
}

impl Codec for String {
    #[inline]
    fn descriptor() -> String {
        "T".to_string()
    }

    fn encode<W: SizedWrite>(&self, out: &mut W) -> NetResult<()> {
        if self.len() > MAX_STRING_LEN {
            return Err(NetError::Serialization);
        }

        out.write_u16::<BigEndian>(self.len() as u16)?;
        out.write_all(self.as_bytes())?;
        Ok(())
    }

    fn decode<R: SizedRead>(stream: &mut R) -> NetResult<Self> {
        let length = stream.read_u16::<BigEndian>().map_err(|_| NetError::Serialization)? as usize;

        if stream.remaining_data() < length {
            return Err(NetError::Serialization);
        }

        let mut bytes = vec![0u8; length];
        stream.read_exact(&mut bytes).map_err(|_| NetError::Serialization)?;

        String::from_utf8(bytes).map_err(|_| NetError::Serialization)
    }
}

impl Codec for Bytes {
    #[inline]
    fn descriptor() -> String {
        "[B".to_string()
    }

    fn encode<W: SizedWrite>(&self, out: &mut W) -> NetResult<()> {
        if self.0.len() > u32::max_value() as usize {
            return Err(NetError::Serialization);
        }

        out.write_u32::<BigEndian>(self.0.len() as u32)?;
        out.write_all(&self.0)?;
        Ok(())
    }

    fn decode<R: SizedRead>(stream: &mut R) -> NetResult<Self> {
        let length = stream.read_u32::<BigEndian>().map_err(|_| NetError::Serialization)? as usize;

        if stream.remaining_data() < length {
            return Err(NetError::Serialization);
        }

        let mut bytes = vec![0u8; length];
        stream.read_exact(&mut bytes).map_err(|_| NetError::Serialization)?;

        Ok(Bytes(bytes))
    }
}

impl<T: Codec> Codec for Vec<T> {
    #[inline]
    fn descriptor() -> String {
        format!("List<{}>", T::descriptor())
    }

    fn encode<W: SizedWrite>(&self, out: &mut W) -> NetResult<()> {
        if self.len() > MAX_LIST_LEN {
            return Err(NetError::Serialization);
        }

        out.write_u16::<BigEndian>(self.len() as u16)?;

        for element in self {
            element.encode(out)?;
        }

        Ok(())
    }

    fn decode<R: SizedRead>(stream: &mut R) -> NetResult<Self> {
        let count = stream.read_u16::<BigEndian>().map_err(|_| NetError::Serialization)? as usize;

        let mut elements = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            elements.push(T::decode(stream)?);
        }

        Ok(elements)
    }
}

impl<T: Codec> Codec for Option<T> {
    #[inline]
    fn descriptor() -> String {
        format!("Optional<{}>", T::descriptor())
    }

    fn encode<W: SizedWrite>(&self, out: &mut W) -> NetResult<()> {
        match self {
            Some(value) => {
                out.write_u8(1)?;
                value.encode(out)
            }
            None => {
                out.write_u8(0)?;
                Ok(())
            }
        }
    }

    fn decode<R: SizedRead>(stream: &mut R) -> NetResult<Self> {
        match stream.read_u8().map_err(|_| NetError::Serialization)? {
            0 => Ok(None),
            1 => Ok(Some(T::decode(stream)?)),
            _ => Err(NetError::Serialization),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn roundtrip<T: Codec + PartialEq + std::fmt::Debug>(value: T) {
        let mut buffer = Vec::new();
        value.encode(&mut buffer).unwrap();

        let mut stream = Cursor::new(&buffer[..]);
        let decoded = T::decode(&mut stream).unwrap();

        assert_eq!(decoded, value);
        assert_eq!(stream.remaining_data(), 0);
    }

    #[test]
    fn test_primitive_roundtrips() {
        roundtrip(-5i8);
        roundtrip(200u8);
        roundtrip(-1234i16);
        roundtrip(0x7fff_ffffi32);
        roundtrip(-9_000_000_000i64);
        roundtrip(1.5f32);
        roundtrip(-2.25f64);
        roundtrip(true);
        roundtrip('x');
    }

    #[test]
    fn test_primitive_widths() {
        let mut buffer = Vec::new();
        7i8.encode(&mut buffer).unwrap();
        7u8.encode(&mut buffer).unwrap();
        7i16.encode(&mut buffer).unwrap();
        7i32.encode(&mut buffer).unwrap();
        7i64.encode(&mut buffer).unwrap();
        7.0f32.encode(&mut buffer).unwrap();
        7.0f64.encode(&mut buffer).unwrap();
        true.encode(&mut buffer).unwrap();
        'q'.encode(&mut buffer).unwrap();

        assert_eq!(buffer.len(), 1 + 1 + 2 + 4 + 8 + 4 + 8 + 1 + 2);
    }

    #[test]
    fn test_string_roundtrip_and_layout() {
        roundtrip("hello".to_string());
        roundtrip(String::new());

        let mut buffer = Vec::new();
        "ab".to_string().encode(&mut buffer).unwrap();
        assert_eq!(buffer, vec![0, 2, b'a', b'b']);
    }

    #[test]
    fn test_bytes_roundtrip_and_layout() {
        roundtrip(Bytes(vec![1, 2, 3]));

        let mut buffer = Vec::new();
        Bytes(vec![9]).encode(&mut buffer).unwrap();
        assert_eq!(buffer, vec![0, 0, 0, 1, 9]);
    }

    #[test]
    fn test_list_roundtrip() {
        roundtrip(vec![1i32, 2, 3]);
        roundtrip(Vec::<i32>::new());
        roundtrip(vec![vec!["nested".to_string()]]);
    }

    #[test]
    fn test_optional_roundtrip() {
        roundtrip(Some(42i32));
        roundtrip(None::<i32>);
        roundtrip(Some("present".to_string()));
    }

    #[test]
    fn test_encode_into_bounded_cursor() {
        let mut buffer = [0u8; 6];
        let mut cursor = Cursor::new(&mut buffer[..]);

        "ab".to_string().encode(&mut cursor).unwrap();
        assert_eq!(cursor.free_capacity(), 2);

        // The next field no longer fits in the fixed buffer.
        assert!(7i32.encode(&mut cursor).is_err());
    }

    #[test]
    fn test_truncated_input_fails() {
        let mut buffer = Vec::new();
        "hello".to_string().encode(&mut buffer).unwrap();

        let mut stream = Cursor::new(&buffer[..3]);
        assert_eq!(String::decode(&mut stream), Err(NetError::Serialization));
    }

    #[test]
    fn test_bad_bool_fails() {
        let data = [7u8];
        let mut stream = Cursor::new(&data[..]);

        assert_eq!(bool::decode(&mut stream), Err(NetError::Serialization));
    }

    #[test]
    fn test_bad_optional_presence_fails() {
        let data = [2u8, 0, 0, 0, 1];
        let mut stream = Cursor::new(&data[..]);

        assert_eq!(Option::<i32>::decode(&mut stream), Err(NetError::Serialization));
    }

    #[test]
    fn test_descriptors() {
        assert_eq!(i8::descriptor(), "B");
        assert_eq!(u8::descriptor(), "U");
        assert_eq!(i16::descriptor(), "S");
        assert_eq!(i32::descriptor(), "I");
        assert_eq!(i64::descriptor(), "J");
        assert_eq!(f32::descriptor(), "F");
        assert_eq!(f64::descriptor(), "D");
        assert_eq!(bool::descriptor(), "Z");
        assert_eq!(char::descriptor(), "C");
        assert_eq!(String::descriptor(), "T");
        assert_eq!(Bytes::descriptor(), "[B");
        assert_eq!(Vec::<i32>::descriptor(), "List<I>");
        assert_eq!(Option::<String>::descriptor(), "Optional<T>");
        assert_eq!(Vec::<Option<Bytes>>::descriptor(), "List<Optional<[B>>");
    }
}

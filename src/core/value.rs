use std::fmt;
use std::io::Read;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Replayable in-memory byte source.
///
/// A single-read input stream is buffered fully before first use so that the
/// primary bind, the twin bind and a later journal replay all read the same
/// bytes. Cloning is cheap (shared buffer).
#[derive(Clone, PartialEq, Eq)]
pub struct ByteSource(Arc<[u8]>);

impl ByteSource {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into().into())
    }

    /// Buffer an async reader to exhaustion.
    pub async fn from_reader<R: AsyncRead + Unpin>(mut reader: R) -> std::io::Result<Self> {
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await?;
        Ok(Self(buf.into()))
    }

    /// Buffer at most `limit` bytes of an async reader.
    pub async fn from_reader_limited<R: AsyncRead + Unpin>(
        reader: R,
        limit: u64,
    ) -> std::io::Result<Self> {
        let mut buf = Vec::new();
        reader.take(limit).read_to_end(&mut buf).await?;
        Ok(Self(buf.into()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// A fresh reader over the buffered content; can be opened any number
    /// of times.
    pub fn open(&self) -> impl Read + '_ {
        self.as_bytes()
    }
}

impl fmt::Debug for ByteSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ByteSource({} bytes)", self.0.len())
    }
}

impl Serialize for ByteSource {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

struct ByteSourceVisitor;

impl<'de> Visitor<'de> for ByteSourceVisitor {
    type Value = ByteSource;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a byte buffer")
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<ByteSource, E> {
        Ok(ByteSource::from_bytes(v.to_vec()))
    }

    fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<ByteSource, E> {
        Ok(ByteSource::from_bytes(v))
    }

    fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<ByteSource, A::Error> {
        let mut buf = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(b) = seq.next_element::<u8>()? {
            buf.push(b);
        }
        Ok(ByteSource::from_bytes(buf))
    }
}

impl<'de> Deserialize<'de> for ByteSource {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_byte_buf(ByteSourceVisitor)
    }
}

/// Replayable in-memory character source; the textual sibling of
/// [`ByteSource`].
#[derive(Clone, PartialEq, Eq)]
pub struct CharSource(Arc<str>);

impl CharSource {
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into().into())
    }

    /// Buffer an async reader to exhaustion; the content must be UTF-8.
    pub async fn from_reader<R: AsyncRead + Unpin>(mut reader: R) -> std::io::Result<Self> {
        let mut buf = String::new();
        reader.read_to_string(&mut buf).await?;
        Ok(Self(buf.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for CharSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CharSource({} chars)", self.0.chars().count())
    }
}

impl Serialize for CharSource {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for CharSource {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(CharSource::from_string(s))
    }
}

/// Timestamps travel through the journal as microseconds since the epoch.
mod ts_micros {
    use super::*;

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(ts.timestamp_micros())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let micros = i64::deserialize(deserializer)?;
        DateTime::<Utc>::from_timestamp_micros(micros)
            .ok_or_else(|| de::Error::custom(format!("timestamp out of range: {micros}")))
    }
}

/// One argument of a recorded or dispatched call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParamValue {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    Bytes(ByteSource),
    Chars(CharSource),
    Timestamp(#[serde(with = "ts_micros")] DateTime<Utc>),
}

impl ParamValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "NULL",
            Self::Boolean(_) => "BOOLEAN",
            Self::Integer(_) => "INTEGER",
            Self::Float(_) => "FLOAT",
            Self::Text(_) => "TEXT",
            Self::Bytes(_) => "BYTES",
            Self::Chars(_) => "CHARS",
            Self::Timestamp(_) => "TIMESTAMP",
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            Self::Chars(c) => Some(c.as_str()),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b.as_bytes()),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Boolean(b) => write!(f, "{b}"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Text(s) => write!(f, "'{s}'"),
            Self::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Self::Chars(c) => write!(f, "<{} chars>", c.len()),
            Self::Timestamp(ts) => write!(f, "{}", ts.to_rfc3339()),
        }
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<DateTime<Utc>> for ParamValue {
    fn from(v: DateTime<Utc>) -> Self {
        Self::Timestamp(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_source_is_replayable() {
        let src = ByteSource::from_bytes(vec![1u8, 2, 3]);
        let mut first = Vec::new();
        src.open().read_to_end(&mut first).unwrap();
        let mut second = Vec::new();
        src.open().read_to_end(&mut second).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_byte_source_buffers_async_reader() {
        let data: &[u8] = b"stream me";
        let src = ByteSource::from_reader(data).await.unwrap();
        assert_eq!(src.as_bytes(), b"stream me");
    }

    #[tokio::test]
    async fn test_byte_source_respects_limit() {
        let data: &[u8] = b"0123456789";
        let src = ByteSource::from_reader_limited(data, 4).await.unwrap();
        assert_eq!(src.as_bytes(), b"0123");
    }

    #[test]
    fn test_param_value_round_trip_through_msgpack() {
        let values = vec![
            ParamValue::Null,
            ParamValue::Boolean(true),
            ParamValue::Integer(-42),
            ParamValue::Float(2.5),
            ParamValue::Text("hello".into()),
            ParamValue::Bytes(ByteSource::from_bytes(vec![0u8, 255, 7])),
            ParamValue::Chars(CharSource::from_string("reader content")),
            ParamValue::Timestamp(DateTime::from_timestamp_micros(1_700_000_000_123_456).unwrap()),
        ];
        let encoded = rmp_serde::to_vec(&values).unwrap();
        let decoded: Vec<ParamValue> = rmp_serde::from_slice(&encoded).unwrap();
        assert_eq!(values, decoded);
    }

    #[test]
    fn test_timestamp_codec_is_microsecond_exact() {
        let ts = DateTime::from_timestamp_micros(123_456_789).unwrap();
        let encoded = rmp_serde::to_vec(&ParamValue::Timestamp(ts)).unwrap();
        let decoded: ParamValue = rmp_serde::from_slice(&encoded).unwrap();
        assert_eq!(decoded, ParamValue::Timestamp(ts));
    }
}

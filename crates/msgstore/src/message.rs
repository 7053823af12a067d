//! Message model and the commit log record codec.
//!
//! Record layout (big-endian):
//! `[4B total][4B magic][4B body crc][4B queue id][4B flag][8B queue offset][8B physical offset]`
//! `[4B sys flag][8B born ts][8B born host][8B store ts][8B store host][4B reconsume times]`
//! `[4B body len][body][1B topic len][topic][2B properties len][properties]`

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddrV4};

use crate::error::StoreError;
use crate::storage::file::common::{
    read_i64_at, read_u16_at, read_u32_at, read_u64_at, write_i64_at, write_u64_at,
};

pub const MESSAGE_MAGIC_CODE: u32 = 0xDAA3_20A7;
pub const BLANK_MAGIC_CODE: u32 = 0xCBD4_3194;
/// Space a segment always keeps for the end-of-file blank marker.
pub const END_FILE_MIN_BLANK_LENGTH: usize = 4 + 4;

pub const MAX_TOPIC_LENGTH: usize = 127;
pub const MAX_PROPERTIES_LENGTH: usize = i16::MAX as usize;

pub const PROPERTY_TAGS: &str = "TAGS";
pub const PROPERTY_KEYS: &str = "KEYS";
pub const NAME_VALUE_SEPARATOR: char = '\u{1}';
pub const PROPERTY_SEPARATOR: char = '\u{2}';
pub const KEY_SEPARATOR: char = ' ';

pub const QUEUE_OFFSET_POSITION: usize = 20;
pub const PHYSICAL_OFFSET_POSITION: usize = 28;
pub const STORE_TIMESTAMP_POSITION: usize = 56;
const BODY_CRC_POSITION: usize = 8;
const BODY_LENGTH_POSITION: usize = 76;

/// Fixed part of a record: everything except body, topic and properties bytes.
pub const RECORD_FIXED_LENGTH: usize = BODY_LENGTH_POSITION + 4 + 1 + 2;

/// A message as submitted by a producer.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub topic: String,
    pub queue_id: u32,
    pub flag: u32,
    pub body: Vec<u8>,
    pub properties: BTreeMap<String, String>,
    pub sys_flag: u32,
    pub born_timestamp: i64,
    pub born_host: SocketAddrV4,
    pub reconsume_times: u32,
}

impl Message {
    pub fn new(topic: impl Into<String>, queue_id: u32, body: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            queue_id,
            flag: 0,
            body: body.into(),
            properties: BTreeMap::new(),
            sys_flag: 0,
            born_timestamp: chrono::Utc::now().timestamp_millis(),
            born_host: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
            reconsume_times: 0,
        }
    }

    pub fn with_tags(mut self, tags: impl Into<String>) -> Self {
        self.properties.insert(PROPERTY_TAGS.to_string(), tags.into());
        self
    }

    pub fn with_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let joined = keys
            .into_iter()
            .map(|k| k.as_ref().to_string())
            .collect::<Vec<_>>()
            .join(&KEY_SEPARATOR.to_string());
        self.properties.insert(PROPERTY_KEYS.to_string(), joined);
        self
    }

    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    pub fn tags(&self) -> Option<&str> {
        self.properties.get(PROPERTY_TAGS).map(String::as_str)
    }

    pub fn keys(&self) -> Vec<&str> {
        self.properties
            .get(PROPERTY_KEYS)
            .map(|k| k.split(KEY_SEPARATOR).filter(|s| !s.is_empty()).collect())
            .unwrap_or_default()
    }
}

/// A message read back from the commit log, with the fields the store assigned.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageExt {
    pub message: Message,
    pub store_size: u32,
    pub body_crc: u32,
    pub queue_offset: u64,
    pub commit_log_offset: u64,
    pub store_timestamp: i64,
    pub store_host: SocketAddrV4,
    pub msg_id: String,
}

/// The subset of a record the dispatcher needs to build consume queues and indexes.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchRequest {
    pub topic: String,
    pub queue_id: u32,
    pub commit_log_offset: u64,
    pub msg_size: u32,
    pub tags_code: i64,
    pub store_timestamp: i64,
    pub consume_queue_offset: u64,
    pub keys: String,
    pub sys_flag: u32,
}

/// Outcome of scanning one record position in the commit log.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordScan {
    Record(DispatchRequest),
    /// End-of-segment marker; the rest of the segment is padding.
    Blank { size: usize },
    /// Zero-filled space: nothing was ever written here.
    End,
    Corrupt { details: String },
}

pub fn validate_topic(topic: &str) -> Result<(), StoreError> {
    if topic.is_empty() {
        return Err(StoreError::invalid_message("topic is empty"));
    }
    if topic.len() > MAX_TOPIC_LENGTH {
        return Err(StoreError::invalid_message(format!(
            "topic length {} exceeds {MAX_TOPIC_LENGTH}",
            topic.len()
        )));
    }
    if let Some(c) = topic
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '%' | '|' | '-')))
    {
        return Err(StoreError::invalid_message(format!(
            "topic '{topic}' contains illegal character {c:?}"
        )));
    }
    Ok(())
}

pub fn properties_to_string(properties: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (name, value) in properties {
        out.push_str(name);
        out.push(NAME_VALUE_SEPARATOR);
        out.push_str(value);
        out.push(PROPERTY_SEPARATOR);
    }
    out
}

pub fn string_to_properties(raw: &str) -> BTreeMap<String, String> {
    raw.split(PROPERTY_SEPARATOR)
        .filter_map(|pair| pair.split_once(NAME_VALUE_SEPARATOR))
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect()
}

/// 31-polynomial string hash over UTF-16 code units, wrapping at 32 bits.
pub fn string_hash_code(s: &str) -> i32 {
    s.encode_utf16()
        .fold(0i32, |h, unit| h.wrapping_mul(31).wrapping_add(unit as i32))
}

pub fn tags_string_to_tags_code(tags: Option<&str>) -> i64 {
    match tags {
        Some(tags) if !tags.is_empty() => string_hash_code(tags) as i64,
        _ => 0,
    }
}

fn socket_to_bytes(addr: &SocketAddrV4) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[..4].copy_from_slice(&addr.ip().octets());
    out[4..].copy_from_slice(&(addr.port() as u32).to_be_bytes());
    out
}

fn socket_from_bytes(buf: &[u8], pos: usize) -> SocketAddrV4 {
    let ip = Ipv4Addr::new(buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]);
    SocketAddrV4::new(ip, read_u32_at(buf, pos + 4) as u16)
}

/// Message id: upper-case hex of the store host followed by the physical offset.
pub fn create_message_id(store_host: &SocketAddrV4, commit_log_offset: u64) -> String {
    let mut raw = [0u8; 16];
    raw[..8].copy_from_slice(&socket_to_bytes(store_host));
    raw[8..].copy_from_slice(&commit_log_offset.to_be_bytes());
    raw.iter().map(|b| format!("{b:02X}")).collect()
}

pub fn decode_message_id(msg_id: &str) -> Result<(SocketAddrV4, u64), StoreError> {
    if msg_id.len() != 32 || !msg_id.is_ascii() {
        return Err(StoreError::invalid_message(format!(
            "message id '{msg_id}' is not 32 hex digits"
        )));
    }
    let mut raw = [0u8; 16];
    for (i, byte) in raw.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&msg_id[i * 2..i * 2 + 2], 16).map_err(|e| {
            StoreError::invalid_message(format!("message id '{msg_id}' is not hex: {e}"))
        })?;
    }
    Ok((socket_from_bytes(&raw, 0), read_u64_at(&raw, 8)))
}

/// Encode a message into a complete record.
///
/// Queue offset, physical offset and store timestamp are left zero; the commit log
/// patches them in under its append lock.
pub fn encode_message(
    msg: &Message,
    store_host: &SocketAddrV4,
    max_message_size: usize,
) -> Result<Vec<u8>, StoreError> {
    validate_topic(&msg.topic)?;

    let properties = properties_to_string(&msg.properties);
    if properties.len() > MAX_PROPERTIES_LENGTH {
        return Err(StoreError::PropertiesTooLong {
            size: properties.len(),
            max: MAX_PROPERTIES_LENGTH,
        });
    }
    if msg.body.len() > max_message_size {
        return Err(StoreError::invalid_message(format!(
            "body length {} exceeds {max_message_size}",
            msg.body.len()
        )));
    }

    let total = RECORD_FIXED_LENGTH + msg.body.len() + msg.topic.len() + properties.len();
    let body_crc = crc32fast::hash(&msg.body);
    let mut buf = Vec::with_capacity(total);
    buf.extend_from_slice(&(total as u32).to_be_bytes());
    buf.extend_from_slice(&MESSAGE_MAGIC_CODE.to_be_bytes());
    buf.extend_from_slice(&body_crc.to_be_bytes());
    buf.extend_from_slice(&msg.queue_id.to_be_bytes());
    buf.extend_from_slice(&msg.flag.to_be_bytes());
    buf.extend_from_slice(&0u64.to_be_bytes()); // queue offset
    buf.extend_from_slice(&0u64.to_be_bytes()); // physical offset
    buf.extend_from_slice(&msg.sys_flag.to_be_bytes());
    buf.extend_from_slice(&msg.born_timestamp.to_be_bytes());
    buf.extend_from_slice(&socket_to_bytes(&msg.born_host));
    buf.extend_from_slice(&0i64.to_be_bytes()); // store timestamp
    buf.extend_from_slice(&socket_to_bytes(store_host));
    buf.extend_from_slice(&msg.reconsume_times.to_be_bytes());
    buf.extend_from_slice(&(msg.body.len() as u32).to_be_bytes());
    buf.extend_from_slice(&msg.body);
    buf.push(msg.topic.len() as u8);
    buf.extend_from_slice(msg.topic.as_bytes());
    buf.extend_from_slice(&(properties.len() as u16).to_be_bytes());
    buf.extend_from_slice(properties.as_bytes());
    debug_assert_eq!(buf.len(), total);
    Ok(buf)
}

/// Stamp the fields only known once the record has a place in the log.
pub fn patch_record(record: &mut [u8], queue_offset: u64, physical_offset: u64, store_ts: i64) {
    write_u64_at(record, QUEUE_OFFSET_POSITION, queue_offset);
    write_u64_at(record, PHYSICAL_OFFSET_POSITION, physical_offset);
    write_i64_at(record, STORE_TIMESTAMP_POSITION, store_ts);
}

/// Encode the end-of-segment marker for `remaining` bytes of unused space.
pub fn encode_blank_marker(remaining: usize) -> [u8; END_FILE_MIN_BLANK_LENGTH] {
    let mut marker = [0u8; END_FILE_MIN_BLANK_LENGTH];
    marker[..4].copy_from_slice(&(remaining as u32).to_be_bytes());
    marker[4..].copy_from_slice(&BLANK_MAGIC_CODE.to_be_bytes());
    marker
}

struct RecordLayout<'a> {
    total: usize,
    body: &'a [u8],
    topic: &'a str,
    properties: &'a str,
}

fn parse_layout(buf: &[u8]) -> Result<RecordLayout<'_>, String> {
    let total = read_u32_at(buf, 0) as usize;
    if total < RECORD_FIXED_LENGTH || total > buf.len() {
        return Err(format!(
            "record length {total} outside [{RECORD_FIXED_LENGTH}, {}]",
            buf.len()
        ));
    }
    let record = &buf[..total];

    let body_len = read_u32_at(record, BODY_LENGTH_POSITION) as usize;
    let body_start = BODY_LENGTH_POSITION + 4;
    let topic_len_pos = body_start + body_len;
    if topic_len_pos + 1 > total {
        return Err(format!("body length {body_len} overruns record of {total}"));
    }
    let topic_len = record[topic_len_pos] as usize;
    let topic_start = topic_len_pos + 1;
    let props_len_pos = topic_start + topic_len;
    if props_len_pos + 2 > total {
        return Err(format!("topic length {topic_len} overruns record of {total}"));
    }
    let props_len = read_u16_at(record, props_len_pos) as usize;
    let props_start = props_len_pos + 2;
    if props_start + props_len != total {
        return Err(format!(
            "declared length {total} does not match content length {}",
            props_start + props_len
        ));
    }

    let topic = std::str::from_utf8(&record[topic_start..props_len_pos])
        .map_err(|e| format!("topic is not utf-8: {e}"))?;
    let properties = std::str::from_utf8(&record[props_start..total])
        .map_err(|e| format!("properties are not utf-8: {e}"))?;

    Ok(RecordLayout {
        total,
        body: &record[body_start..topic_len_pos],
        topic,
        properties,
    })
}

/// Inspect the record starting at `buf[0]`.
///
/// `buf` must extend at least to the end of written data. A zero length field means
/// the position was never written.
pub fn check_message_and_return_size(buf: &[u8], check_crc: bool) -> RecordScan {
    if buf.len() < END_FILE_MIN_BLANK_LENGTH {
        return RecordScan::End;
    }
    let total = read_u32_at(buf, 0) as usize;
    let magic = read_u32_at(buf, 4);

    match magic {
        MESSAGE_MAGIC_CODE => {}
        BLANK_MAGIC_CODE => return RecordScan::Blank { size: total },
        0 if total == 0 => return RecordScan::End,
        other => {
            return RecordScan::Corrupt {
                details: format!("illegal magic code {other:#010x}"),
            };
        }
    }

    let layout = match parse_layout(buf) {
        Ok(layout) => layout,
        Err(details) => return RecordScan::Corrupt { details },
    };

    if check_crc {
        let stored = read_u32_at(buf, BODY_CRC_POSITION);
        let actual = crc32fast::hash(layout.body);
        if stored != actual {
            return RecordScan::Corrupt {
                details: format!("body crc mismatch: stored {stored:#010x}, actual {actual:#010x}"),
            };
        }
    }

    let properties = string_to_properties(layout.properties);
    let tags_code = tags_string_to_tags_code(properties.get(PROPERTY_TAGS).map(String::as_str));

    RecordScan::Record(DispatchRequest {
        topic: layout.topic.to_string(),
        queue_id: read_u32_at(buf, 12),
        commit_log_offset: read_u64_at(buf, PHYSICAL_OFFSET_POSITION),
        msg_size: layout.total as u32,
        tags_code,
        store_timestamp: read_i64_at(buf, STORE_TIMESTAMP_POSITION),
        consume_queue_offset: read_u64_at(buf, QUEUE_OFFSET_POSITION),
        keys: properties.get(PROPERTY_KEYS).cloned().unwrap_or_default(),
        sys_flag: read_u32_at(buf, 36),
    })
}

/// Fully decode a record read back from the commit log.
pub fn decode_message(buf: &[u8]) -> Result<MessageExt, StoreError> {
    if buf.len() < RECORD_FIXED_LENGTH {
        return Err(StoreError::corruption(
            "message decode",
            format!("buffer of {} bytes is shorter than a record header", buf.len()),
        ));
    }
    let magic = read_u32_at(buf, 4);
    if magic != MESSAGE_MAGIC_CODE {
        return Err(StoreError::corruption(
            "message decode",
            format!("illegal magic code {magic:#010x}"),
        ));
    }
    let layout = parse_layout(buf).map_err(|d| StoreError::corruption("message decode", d))?;
    let store_host = socket_from_bytes(buf, 64);
    let commit_log_offset = read_u64_at(buf, PHYSICAL_OFFSET_POSITION);

    Ok(MessageExt {
        message: Message {
            topic: layout.topic.to_string(),
            queue_id: read_u32_at(buf, 12),
            flag: read_u32_at(buf, 16),
            body: layout.body.to_vec(),
            properties: string_to_properties(layout.properties),
            sys_flag: read_u32_at(buf, 36),
            born_timestamp: read_i64_at(buf, 40),
            born_host: socket_from_bytes(buf, 48),
            reconsume_times: read_u32_at(buf, 72),
        },
        store_size: layout.total as u32,
        body_crc: read_u32_at(buf, BODY_CRC_POSITION),
        queue_offset: read_u64_at(buf, QUEUE_OFFSET_POSITION),
        commit_log_offset,
        store_timestamp: read_i64_at(buf, STORE_TIMESTAMP_POSITION),
        msg_id: create_message_id(&store_host, commit_log_offset),
        store_host,
    })
}

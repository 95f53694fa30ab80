//! Control wire protocol
//!
//! Every message is a little-endian frame:
//!
//! ```text
//! request:  [cmd: u32][len: u32][payload; len]
//! reply:    [status: u32][len: u32][body; len]
//! ```
//!
//! Payloads are built from fixed-size records with NUL-terminated string
//! fields, and a payload must be exactly as long as its command requires.

use super::Status;
use crate::error::{Error, Result};
use crate::module::ModuleInfo;
use crate::names::{MODULE_NAME_FIELD_LEN, NAME_FIELD_LEN, PATH_FIELD_LEN};
use crate::slot::SlotId;
use crate::table::{MappingEntry, TargetKind};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Command codes
pub const LIST_MAPPINGS: u32 = 1024;
pub const ATTACH_MAPPING: u32 = 1025;
pub const DETACH_MAPPING: u32 = 1026;
pub const LIST_PLUGINS: u32 = 1027;
pub const LOAD_PLUGIN: u32 = 1028;
pub const UNLOAD_PLUGIN: u32 = 1029;

/// Largest payload accepted in either direction. A full `LIST_MAPPINGS`
/// reply at [`MAX_CAPACITY`](crate::slot::MAX_CAPACITY) must fit.
pub const MAX_PAYLOAD_SIZE: u32 = 64 * 1024 * 1024; // 64 MB

/// Command or status word followed by the payload length
pub const FRAME_HEADER_LEN: usize = 8;

/// Mapping entry record: name, backing path, flags
pub const ENTRY_RECORD_LEN: usize = NAME_FIELD_LEN + PATH_FIELD_LEN + 8;

/// Module record: name, refcount, revision
pub const MODULE_RECORD_LEN: usize = MODULE_NAME_FIELD_LEN + 4 + 4;

/// Control command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    ListMappings,
    AttachMapping,
    DetachMapping,
    ListPlugins,
    LoadPlugin,
    UnloadPlugin,
}

impl Command {
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            LIST_MAPPINGS => Some(Command::ListMappings),
            ATTACH_MAPPING => Some(Command::AttachMapping),
            DETACH_MAPPING => Some(Command::DetachMapping),
            LIST_PLUGINS => Some(Command::ListPlugins),
            LOAD_PLUGIN => Some(Command::LoadPlugin),
            UNLOAD_PLUGIN => Some(Command::UnloadPlugin),
            _ => None,
        }
    }

    pub fn code(self) -> u32 {
        match self {
            Command::ListMappings => LIST_MAPPINGS,
            Command::AttachMapping => ATTACH_MAPPING,
            Command::DetachMapping => DETACH_MAPPING,
            Command::ListPlugins => LIST_PLUGINS,
            Command::LoadPlugin => LOAD_PLUGIN,
            Command::UnloadPlugin => UNLOAD_PLUGIN,
        }
    }

    /// Label used in logs and metrics
    pub fn as_str(self) -> &'static str {
        match self {
            Command::ListMappings => "list_mappings",
            Command::AttachMapping => "attach_mapping",
            Command::DetachMapping => "detach_mapping",
            Command::ListPlugins => "list_plugins",
            Command::LoadPlugin => "load_plugin",
            Command::UnloadPlugin => "unload_plugin",
        }
    }

    /// Exact payload length a request for this command carries
    fn payload_len(self) -> usize {
        match self {
            Command::ListMappings | Command::ListPlugins => 0,
            Command::AttachMapping | Command::DetachMapping => ENTRY_RECORD_LEN,
            Command::LoadPlugin | Command::UnloadPlugin => MODULE_RECORD_LEN,
        }
    }
}

fn put_field(buf: &mut BytesMut, value: &str, len: usize) -> Result<()> {
    if value.len() >= len || value.contains('\0') {
        return Err(Error::InvalidName(format!(
            "'{}' does not fit a {}-byte field",
            value, len
        )));
    }
    buf.put_slice(value.as_bytes());
    buf.put_bytes(0, len - value.len());
    Ok(())
}

fn get_field<B: Buf>(buf: &mut B, len: usize, what: &str) -> Result<String> {
    if buf.remaining() < len {
        return Err(Error::Decode(format!("{} field truncated", what)));
    }
    let mut raw = vec![0u8; len];
    buf.copy_to_slice(&mut raw);

    let end = raw
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| Error::Decode(format!("{} is not NUL-terminated", what)))?;
    raw.truncate(end);
    String::from_utf8(raw).map_err(|_| Error::Decode(format!("{} is not valid UTF-8", what)))
}

/// Mapping entry as it travels on the wire
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryRecord {
    pub name: String,
    pub dev: String,
    pub flags: u64,
}

impl EntryRecord {
    pub fn new(name: &str, dev: &str) -> Self {
        Self {
            name: name.to_string(),
            dev: dev.to_string(),
            flags: 0,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        put_field(buf, &self.name, NAME_FIELD_LEN)?;
        put_field(buf, &self.dev, PATH_FIELD_LEN)?;
        buf.put_u64_le(self.flags);
        Ok(())
    }

    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        let name = get_field(buf, NAME_FIELD_LEN, "name")?;
        let dev = get_field(buf, PATH_FIELD_LEN, "device path")?;
        if buf.remaining() < 8 {
            return Err(Error::Decode("flags field truncated".to_string()));
        }
        let flags = buf.get_u64_le();
        Ok(Self { name, dev, flags })
    }

    /// Table entry for the record found at position `slot` of a listing
    pub fn to_entry(&self, slot: SlotId) -> Result<MappingEntry> {
        let target = TargetKind::from_code(self.flags)
            .ok_or_else(|| Error::Decode(format!("unknown target kind {}", self.flags)))?;
        Ok(MappingEntry {
            slot,
            name: self.name.clone(),
            backing_path: self.dev.clone(),
            target,
        })
    }
}

impl From<&MappingEntry> for EntryRecord {
    fn from(entry: &MappingEntry) -> Self {
        Self {
            name: entry.name.clone(),
            dev: entry.backing_path.clone(),
            flags: if entry.is_empty() { 0 } else { entry.target.code() },
        }
    }
}

/// Loaded module as it travels on the wire
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ModuleRecord {
    pub name: String,
    pub refcount: u32,
    pub revision: u32,
}

impl ModuleRecord {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        put_field(buf, &self.name, MODULE_NAME_FIELD_LEN)?;
        buf.put_u32_le(self.refcount);
        buf.put_u32_le(self.revision);
        Ok(())
    }

    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        let name = get_field(buf, MODULE_NAME_FIELD_LEN, "module name")?;
        if buf.remaining() < 8 {
            return Err(Error::Decode("module counters truncated".to_string()));
        }
        let refcount = buf.get_u32_le();
        let revision = buf.get_u32_le();
        Ok(Self {
            name,
            refcount,
            revision,
        })
    }
}

impl From<&ModuleInfo> for ModuleRecord {
    fn from(info: &ModuleInfo) -> Self {
        Self {
            name: info.name.clone(),
            refcount: u32::try_from(info.refcount).unwrap_or(u32::MAX),
            revision: info.revision,
        }
    }
}

/// Decoded control request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRequest {
    ListMappings,
    Attach { name: String, backing_path: String },
    Detach { name: String },
    ListPlugins,
    LoadPlugin { name: String },
    UnloadPlugin { name: String },
}

impl ControlRequest {
    pub fn command(&self) -> Command {
        match self {
            ControlRequest::ListMappings => Command::ListMappings,
            ControlRequest::Attach { .. } => Command::AttachMapping,
            ControlRequest::Detach { .. } => Command::DetachMapping,
            ControlRequest::ListPlugins => Command::ListPlugins,
            ControlRequest::LoadPlugin { .. } => Command::LoadPlugin,
            ControlRequest::UnloadPlugin { .. } => Command::UnloadPlugin,
        }
    }

    /// Encode the request payload
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.command().payload_len());
        match self {
            ControlRequest::ListMappings | ControlRequest::ListPlugins => {}
            ControlRequest::Attach { name, backing_path } => {
                EntryRecord::new(name, backing_path).encode(&mut buf)?;
            }
            ControlRequest::Detach { name } => {
                EntryRecord::new(name, "").encode(&mut buf)?;
            }
            ControlRequest::LoadPlugin { name } | ControlRequest::UnloadPlugin { name } => {
                ModuleRecord::new(name).encode(&mut buf)?;
            }
        }
        Ok(buf.freeze())
    }

    /// Decode a request from its command code and payload
    pub fn decode(code: u32, payload: &[u8]) -> Result<Self> {
        let command = Command::from_code(code).ok_or(Error::InvalidCommand(code))?;

        if payload.len() != command.payload_len() {
            return Err(Error::Decode(format!(
                "{} payload is {} bytes (expected {})",
                command.as_str(),
                payload.len(),
                command.payload_len()
            )));
        }

        let mut buf = payload;
        Ok(match command {
            Command::ListMappings => ControlRequest::ListMappings,
            Command::ListPlugins => ControlRequest::ListPlugins,
            Command::AttachMapping => {
                let record = EntryRecord::decode(&mut buf)?;
                ControlRequest::Attach {
                    name: record.name,
                    backing_path: record.dev,
                }
            }
            Command::DetachMapping => ControlRequest::Detach {
                name: EntryRecord::decode(&mut buf)?.name,
            },
            Command::LoadPlugin => ControlRequest::LoadPlugin {
                name: ModuleRecord::decode(&mut buf)?.name,
            },
            Command::UnloadPlugin => ControlRequest::UnloadPlugin {
                name: ModuleRecord::decode(&mut buf)?.name,
            },
        })
    }
}

/// Reply to a control request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlReply {
    pub status: Status,
    pub body: Bytes,
}

impl ControlReply {
    pub fn status(status: Status) -> Self {
        Self {
            status,
            body: Bytes::new(),
        }
    }

    pub fn ok() -> Self {
        Self::status(Status::Ok)
    }

    pub fn error(err: &Error) -> Self {
        Self::status(Status::from(err))
    }

    /// `LIST_MAPPINGS` reply: every slot of the table in order
    pub fn mappings(entries: &[MappingEntry]) -> Result<Self> {
        let mut buf = BytesMut::with_capacity(4 + entries.len() * ENTRY_RECORD_LEN);
        buf.put_u32_le(entries.len() as u32);
        for entry in entries {
            EntryRecord::from(entry).encode(&mut buf)?;
        }
        Ok(Self {
            status: Status::Ok,
            body: buf.freeze(),
        })
    }

    /// `LIST_PLUGINS` reply
    pub fn plugins(modules: &[ModuleInfo]) -> Result<Self> {
        let mut buf = BytesMut::with_capacity(4 + modules.len() * MODULE_RECORD_LEN);
        buf.put_u32_le(modules.len() as u32);
        for module in modules {
            ModuleRecord::from(module).encode(&mut buf)?;
        }
        Ok(Self {
            status: Status::Ok,
            body: buf.freeze(),
        })
    }

    /// Decode a `LIST_MAPPINGS` body; position in the list is the slot
    pub fn decode_mappings(&self) -> Result<Vec<MappingEntry>> {
        let mut buf = self.body.clone();
        let count = list_count(&mut buf, ENTRY_RECORD_LEN)?;
        (0..count)
            .map(|slot| EntryRecord::decode(&mut buf)?.to_entry(SlotId::new(slot as u32)))
            .collect()
    }

    /// Decode a `LIST_PLUGINS` body
    pub fn decode_plugins(&self) -> Result<Vec<ModuleRecord>> {
        let mut buf = self.body.clone();
        let count = list_count(&mut buf, MODULE_RECORD_LEN)?;
        (0..count).map(|_| ModuleRecord::decode(&mut buf)).collect()
    }
}

/// Read the record count of a list body and check the body holds exactly
/// that many records
fn list_count(buf: &mut Bytes, record_len: usize) -> Result<usize> {
    if buf.remaining() < 4 {
        return Err(Error::Decode("list reply is missing its count".to_string()));
    }
    let count = buf.get_u32_le() as usize;
    let expected = count
        .checked_mul(record_len)
        .ok_or_else(|| Error::Decode(format!("list count {} overflows", count)))?;
    if buf.remaining() != expected {
        return Err(Error::Decode(format!(
            "list of {} records carries {} bytes (expected {})",
            count,
            buf.remaining(),
            expected
        )));
    }
    Ok(count)
}

/// A raw frame: command code (request) or status code (reply) plus payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: u32,
    pub payload: Bytes,
}

/// Read one frame. Returns `None` when the peer closed the stream cleanly
/// before a new frame started.
pub async fn read_frame<T>(stream: &mut T) -> Result<Option<Frame>>
where
    T: AsyncRead + Unpin,
{
    let mut head = [0u8; FRAME_HEADER_LEN];
    let mut filled = 0;
    while filled < FRAME_HEADER_LEN {
        let n = stream.read(&mut head[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(Error::Decode(format!(
                "Truncated frame header: {} of {} bytes",
                filled, FRAME_HEADER_LEN
            )));
        }
        filled += n;
    }

    let mut head = &head[..];
    let header = head.get_u32_le();
    let size = head.get_u32_le();
    if size > MAX_PAYLOAD_SIZE {
        return Err(Error::Decode(format!(
            "Frame too large: {} bytes (max: {})",
            size, MAX_PAYLOAD_SIZE
        )));
    }

    let mut payload = vec![0u8; size as usize];
    stream.read_exact(&mut payload).await?;

    Ok(Some(Frame {
        header,
        payload: Bytes::from(payload),
    }))
}

/// Write one frame
pub async fn write_frame<T>(stream: &mut T, header: u32, payload: &[u8]) -> Result<()>
where
    T: AsyncWrite + Unpin,
{
    if payload.len() > MAX_PAYLOAD_SIZE as usize {
        return Err(Error::Decode(format!(
            "Frame too large: {} bytes (max: {})",
            payload.len(),
            MAX_PAYLOAD_SIZE
        )));
    }

    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.put_u32_le(header);
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(payload);

    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}

/// Write a request (client side)
pub async fn write_request<T>(stream: &mut T, request: &ControlRequest) -> Result<()>
where
    T: AsyncWrite + Unpin,
{
    let payload = request.encode()?;
    write_frame(stream, request.command().code(), &payload).await
}

/// Read a reply (client side)
pub async fn read_reply<T>(stream: &mut T) -> Result<ControlReply>
where
    T: AsyncRead + Unpin,
{
    let frame = read_frame(stream).await?.ok_or_else(|| {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "control server closed the connection",
        ))
    })?;

    let status = Status::from_code(frame.header)
        .ok_or_else(|| Error::Decode(format!("unknown reply status {}", frame.header)))?;

    Ok(ControlReply {
        status,
        body: frame.payload,
    })
}

/// Write a reply (server side)
pub async fn write_reply<T>(stream: &mut T, reply: &ControlReply) -> Result<()>
where
    T: AsyncWrite + Unpin,
{
    write_frame(stream, reply.status.code(), &reply.body).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_record_sizes() {
        assert_eq!(ENTRY_RECORD_LEN, 1288);
        assert_eq!(MODULE_RECORD_LEN, 88);
    }

    #[test]
    fn test_attach_payload_layout() -> Result<()> {
        let payload = ControlRequest::Attach {
            name: "data1".to_string(),
            backing_path: "/dev/dsk/c0t0d0s0".to_string(),
        }
        .encode()?;

        assert_eq!(payload.len(), ENTRY_RECORD_LEN);
        assert_eq!(&payload[..6], b"data1\0");
        assert_eq!(&payload[NAME_FIELD_LEN..NAME_FIELD_LEN + 17], b"/dev/dsk/c0t0d0s0");
        assert!(payload[ENTRY_RECORD_LEN - 8..].iter().all(|&b| b == 0));
        Ok(())
    }

    #[test]
    fn test_decode_attach() -> Result<()> {
        let mut buf = BytesMut::new();
        EntryRecord::new("data1", "/dev/backing0").encode(&mut buf)?;

        assert_eq!(
            ControlRequest::decode(ATTACH_MAPPING, &buf)?,
            ControlRequest::Attach {
                name: "data1".to_string(),
                backing_path: "/dev/backing0".to_string(),
            }
        );

        // Detach ignores the device path
        assert_eq!(
            ControlRequest::decode(DETACH_MAPPING, &buf)?,
            ControlRequest::Detach {
                name: "data1".to_string()
            }
        );
        Ok(())
    }

    #[test]
    fn test_unknown_command() {
        assert!(matches!(
            ControlRequest::decode(4242, &[]),
            Err(Error::InvalidCommand(4242))
        ));
    }

    #[test]
    fn test_malformed_payloads() {
        // Short payload
        assert!(matches!(
            ControlRequest::decode(ATTACH_MAPPING, &[0u8; 12]),
            Err(Error::Decode(_))
        ));

        // Stray payload on a list request
        assert!(matches!(
            ControlRequest::decode(LIST_MAPPINGS, &[0u8; 4]),
            Err(Error::Decode(_))
        ));

        // Name field without a terminator
        let payload = vec![b'a'; ENTRY_RECORD_LEN];
        assert!(matches!(
            ControlRequest::decode(ATTACH_MAPPING, &payload),
            Err(Error::Decode(msg)) if msg.contains("NUL")
        ));

        let mut payload = vec![0u8; MODULE_RECORD_LEN];
        payload[0] = 0xff;
        assert!(matches!(
            ControlRequest::decode(LOAD_PLUGIN, &payload),
            Err(Error::Decode(msg)) if msg.contains("UTF-8")
        ));
    }

    #[test]
    fn test_oversized_field_rejected() {
        let request = ControlRequest::LoadPlugin {
            name: "m".repeat(MODULE_NAME_FIELD_LEN),
        };
        assert!(matches!(request.encode(), Err(Error::InvalidName(_))));
    }

    #[test]
    fn test_mapping_list_reply() -> Result<()> {
        let mut entries: Vec<MappingEntry> = (0..4).map(|i| MappingEntry::empty(SlotId::new(i))).collect();
        entries[2].name = "data1".to_string();
        entries[2].backing_path = "/dev/backing0".to_string();

        let reply = ControlReply::mappings(&entries)?;
        assert_eq!(reply.body.len(), 4 + 4 * ENTRY_RECORD_LEN);
        assert_eq!(reply.decode_mappings()?, entries);
        Ok(())
    }

    #[test]
    fn test_list_reply_length_must_match() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(2);
        buf.put_bytes(0, ENTRY_RECORD_LEN);
        let reply = ControlReply {
            status: Status::Ok,
            body: buf.freeze(),
        };
        assert!(matches!(reply.decode_mappings(), Err(Error::Decode(_))));

        let reply = ControlReply::ok();
        assert!(matches!(reply.decode_plugins(), Err(Error::Decode(_))));
    }

    #[test]
    fn test_plugin_list_reply() -> Result<()> {
        let modules = vec![ModuleInfo {
            name: "debug".to_string(),
            refcount: 3,
            revision: 0,
            builtin: true,
        }];
        let records = ControlReply::plugins(&modules)?.decode_plugins()?;
        assert_eq!(
            records,
            vec![ModuleRecord {
                name: "debug".to_string(),
                refcount: 3,
                revision: 0,
            }]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_frames_over_a_stream() -> Result<()> {
        let mut buffer = Vec::new();
        write_request(
            &mut buffer,
            &ControlRequest::UnloadPlugin {
                name: "debug".to_string(),
            },
        )
        .await?;
        write_reply(&mut buffer, &ControlReply::status(Status::Busy)).await?;

        let mut cursor = Cursor::new(buffer);
        let frame = read_frame(&mut cursor).await?.unwrap();
        assert_eq!(frame.header, UNLOAD_PLUGIN);
        assert_eq!(frame.payload.len(), MODULE_RECORD_LEN);

        let reply = read_reply(&mut cursor).await?;
        assert_eq!(reply.status, Status::Busy);
        assert!(reply.body.is_empty());

        // Clean end of stream
        assert!(read_frame(&mut cursor).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&LIST_MAPPINGS.to_le_bytes());
        buffer.extend_from_slice(&(MAX_PAYLOAD_SIZE + 1).to_le_bytes());

        let mut cursor = Cursor::new(buffer);
        assert!(matches!(read_frame(&mut cursor).await, Err(Error::Decode(_))));
    }

    #[tokio::test]
    async fn test_truncated_header_is_not_a_clean_close() {
        for cut in 1..FRAME_HEADER_LEN {
            let mut buffer = Vec::new();
            buffer.extend_from_slice(&LIST_MAPPINGS.to_le_bytes());
            buffer.extend_from_slice(&0u32.to_le_bytes());
            buffer.truncate(cut);

            let mut cursor = Cursor::new(buffer);
            assert!(
                matches!(read_frame(&mut cursor).await, Err(Error::Decode(_))),
                "header cut at {} bytes",
                cut
            );
        }

        let mut cursor = Cursor::new(Vec::new());
        assert!(matches!(read_frame(&mut cursor).await, Ok(None)));
    }

    #[tokio::test]
    async fn test_full_listing_at_max_capacity_frames() -> Result<()> {
        let entries: Vec<MappingEntry> = (0..crate::slot::MAX_CAPACITY as u32)
            .map(|i| MappingEntry::empty(SlotId::new(i)))
            .collect();
        let reply = ControlReply::mappings(&entries)?;

        let mut buffer = Vec::new();
        write_reply(&mut buffer, &reply).await?;

        let mut cursor = Cursor::new(buffer);
        let echoed = read_reply(&mut cursor).await?;
        assert_eq!(echoed.decode_mappings()?.len(), crate::slot::MAX_CAPACITY);
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_reply_status() {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&99u32.to_le_bytes());
        buffer.extend_from_slice(&0u32.to_le_bytes());

        let mut cursor = Cursor::new(buffer);
        assert!(matches!(read_reply(&mut cursor).await, Err(Error::Decode(_))));
    }
}

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

pub const TAG_MESSAGE: u8 = 0x00;
pub const TAG_FILE: u8 = 0x01;
pub const TAG_ASK_PROFILE_INFO: u8 = 0x02;
pub const TAG_NAME: u8 = 0x03;
pub const TAG_AVATAR: u8 = 0x04;
pub const TAG_REMOVE_AVATAR: u8 = 0x05;
pub const TAG_ASK_LARGE_FILES: u8 = 0x06;
pub const TAG_ACCEPT_LARGE_FILES: u8 = 0x07;
pub const TAG_LARGE_FILE_CHUNK: u8 = 0x08;
pub const TAG_ACK_CHUNK: u8 = 0x09;
pub const TAG_ABORT_FILES_TRANSFER: u8 = 0x0a;

/// A file announced in a large-file request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
}

/// All application messages carried inside records
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Plain UTF-8 chat text
    Text(String),

    /// A small file sent in one record
    File { name: String, content: Vec<u8> },

    /// Ask the peer for its name and avatar
    AskProfileInfo,

    Name(String),

    /// Raw avatar image bytes
    Avatar(Vec<u8>),

    RemoveAvatar,

    /// Offer a batch of files for chunked transfer
    AskLargeFiles(Vec<FileInfo>),

    AcceptLargeFiles,

    LargeFileChunk(Vec<u8>),

    AckChunk,

    AbortFilesTransfer,
}

impl Message {
    pub fn tag(&self) -> u8 {
        match self {
            Message::Text(_) => TAG_MESSAGE,
            Message::File { .. } => TAG_FILE,
            Message::AskProfileInfo => TAG_ASK_PROFILE_INFO,
            Message::Name(_) => TAG_NAME,
            Message::Avatar(_) => TAG_AVATAR,
            Message::RemoveAvatar => TAG_REMOVE_AVATAR,
            Message::AskLargeFiles(_) => TAG_ASK_LARGE_FILES,
            Message::AcceptLargeFiles => TAG_ACCEPT_LARGE_FILES,
            Message::LargeFileChunk(_) => TAG_LARGE_FILE_CHUNK,
            Message::AckChunk => TAG_ACK_CHUNK,
            Message::AbortFilesTransfer => TAG_ABORT_FILES_TRANSFER,
        }
    }

    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Text(_) => "message",
            Message::File { .. } => "file",
            Message::AskProfileInfo => "ask_profile_info",
            Message::Name(_) => "name",
            Message::Avatar(_) => "avatar",
            Message::RemoveAvatar => "remove_avatar",
            Message::AskLargeFiles(_) => "ask_large_files",
            Message::AcceptLargeFiles => "accept_large_files",
            Message::LargeFileChunk(_) => "large_file_chunk",
            Message::AckChunk => "ack_chunk",
            Message::AbortFilesTransfer => "abort_files_transfer",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut buf: Vec<u8> = Vec::with_capacity(1 + self.payload_len());
        buf.put_u8(self.tag());

        match self {
            Message::Text(text) | Message::Name(text) => buf.put_slice(text.as_bytes()),
            Message::File { name, content } => {
                put_name(&mut buf, name)?;
                buf.put_slice(content);
            }
            Message::Avatar(data) | Message::LargeFileChunk(data) => buf.put_slice(data),
            Message::AskLargeFiles(files) => {
                for file in files {
                    buf.put_u64(file.size);
                    put_name(&mut buf, &file.name)?;
                }
            }
            Message::AskProfileInfo
            | Message::RemoveAvatar
            | Message::AcceptLargeFiles
            | Message::AckChunk
            | Message::AbortFilesTransfer => {}
        }

        Ok(buf)
    }

    pub fn decode(data: &[u8]) -> Result<Message, ProtocolError> {
        let (&tag, mut payload) = data.split_first().ok_or(ProtocolError::Empty)?;

        let message = match tag {
            TAG_MESSAGE => Message::Text(utf8(payload, "message")?),
            TAG_FILE => {
                let name = get_name(&mut payload, "file")?;
                Message::File {
                    name,
                    content: payload.to_vec(),
                }
            }
            TAG_ASK_PROFILE_INFO => Message::AskProfileInfo,
            TAG_NAME => Message::Name(utf8(payload, "name")?),
            TAG_AVATAR => Message::Avatar(payload.to_vec()),
            TAG_REMOVE_AVATAR => Message::RemoveAvatar,
            TAG_ASK_LARGE_FILES => {
                let mut files = Vec::new();
                while payload.has_remaining() {
                    if payload.remaining() < 8 {
                        return Err(ProtocolError::Truncated("ask_large_files"));
                    }
                    let size = payload.get_u64();
                    let name = get_name(&mut payload, "ask_large_files")?;
                    files.push(FileInfo { name, size });
                }
                Message::AskLargeFiles(files)
            }
            TAG_ACCEPT_LARGE_FILES => Message::AcceptLargeFiles,
            TAG_LARGE_FILE_CHUNK => Message::LargeFileChunk(payload.to_vec()),
            TAG_ACK_CHUNK => Message::AckChunk,
            TAG_ABORT_FILES_TRANSFER => Message::AbortFilesTransfer,
            other => return Err(ProtocolError::UnknownTag(other)),
        };

        Ok(message)
    }

    fn payload_len(&self) -> usize {
        match self {
            Message::Text(s) | Message::Name(s) => s.len(),
            Message::File { name, content } => 2 + name.len() + content.len(),
            Message::Avatar(d) | Message::LargeFileChunk(d) => d.len(),
            Message::AskLargeFiles(files) => files.iter().map(|f| 10 + f.name.len()).sum(),
            _ => 0,
        }
    }
}

fn put_name(buf: &mut Vec<u8>, name: &str) -> Result<(), ProtocolError> {
    let len = u16::try_from(name.len()).map_err(|_| ProtocolError::NameTooLong(name.len()))?;
    buf.put_u16(len);
    buf.put_slice(name.as_bytes());
    Ok(())
}

fn get_name(payload: &mut &[u8], kind: &'static str) -> Result<String, ProtocolError> {
    if payload.remaining() < 2 {
        return Err(ProtocolError::Truncated(kind));
    }
    let len = payload.get_u16() as usize;
    if payload.remaining() < len {
        return Err(ProtocolError::Truncated(kind));
    }
    let name = utf8(&payload[..len], kind)?;
    payload.advance(len);
    Ok(name)
}

fn utf8(bytes: &[u8], kind: &'static str) -> Result<String, ProtocolError> {
    String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidUtf8(kind))
}

/// Names announced by peers are shown on a single line
pub fn sanitize_name(name: &str) -> String {
    name.replace('\n', " ")
}

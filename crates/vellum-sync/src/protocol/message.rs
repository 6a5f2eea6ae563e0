//! Sync wire messages.
//!
//! Every message is a single WebSocket binary frame: an ASCII header line
//! of space separated fields terminated by `\n`, followed by a body whose
//! size the header announces.
//!
//! ```text
//! client                                   server
//!   bind <s> <path_size> <token_size> <need_ident> <is_subserver>\n<path><token>
//!   ident <s> <file_ident> <salt> <scan_sv> <scan_cv> <latest_sv> <latest_salt>\n
//!   upload <s> <compressed> <size> <compressed_size> <cv> <sv> <locked_sv>\n<body>
//!   mark <s> <request_ident>\n
//!   unbind <s>\n
//!                                          ident <s> <file_ident> <salt>\n
//!                                          download <s> <progress...> <downloadable> <compressed> <size> <compressed_size>\n<body>
//!                                          mark <s> <request_ident>\n
//!                                          unbound <s>\n
//!                                          json_error <code> <json_size> <s>\n<json>
//! ```
//!
//! Changeset bodies are sequences of `<numbers...> <changeset_size> <bytes>`
//! entries. Compressed bodies are rejected.

use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use vellum_replication::cursor::{DownloadCursor, SaltedVersion, SyncProgress, UploadCursor};

use crate::error::{SyncError, SyncResult};
use crate::resumption::ResumptionDelayInfo;

use super::error::{Action, CompensatingWriteInfo, ProtocolError, ProtocolErrorInfo};

/// Longest header line accepted.
pub const MAX_HEADER_SIZE: usize = 512;

/// Client file identifier assigned by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SaltedFileIdent {
    /// Identifier.
    pub ident: u64,
    /// Salt binding the identifier to one server history.
    pub salt: u64,
}

/// A local changeset sent to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadChangeset {
    /// Local version the changeset produced.
    pub client_version: u64,
    /// Last server version integrated locally when it was produced.
    pub last_integrated_server_version: u64,
    /// Milliseconds since the Unix epoch.
    pub origin_timestamp: u64,
    /// Zero for changes made on this client.
    pub origin_file_ident: u64,
    /// Encoded instructions.
    pub data: Bytes,
}

/// A server changeset received in a download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteChangeset {
    /// Server version the changeset produced.
    pub remote_version: u64,
    /// Last client version the server had integrated from this client.
    pub last_integrated_local_version: u64,
    /// Milliseconds since the Unix epoch.
    pub origin_timestamp: u64,
    /// Client file the changes originate from.
    pub origin_file_ident: u64,
    /// Size before server-side transformation.
    pub original_changeset_size: u64,
    /// Encoded instructions.
    pub data: Bytes,
}

/// Messages sent by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// Opens a session for a server path.
    Bind {
        /// Session identifier, unique per connection.
        session: u64,
        /// Server path (partition or flexible file).
        path: String,
        /// Access token.
        signed_user_token: String,
        /// Ask the server to assign a client file identifier.
        need_client_file_ident: bool,
    },
    /// Announces the client file and where download resumes.
    Ident {
        /// Session identifier.
        session: u64,
        /// Client file identifier.
        file_ident: SaltedFileIdent,
        /// Download resumption point.
        progress: SyncProgress,
    },
    /// Local changesets.
    Upload {
        /// Session identifier.
        session: u64,
        /// Upload cursor after these changesets.
        progress: UploadCursor,
        /// Oldest server version the client still needs.
        locked_server_version: u64,
        /// Changesets in version order.
        changesets: Vec<UploadChangeset>,
    },
    /// Requests a download completion marker.
    Mark {
        /// Session identifier.
        session: u64,
        /// Echoed back by the server.
        request_ident: u64,
    },
    /// Ends the session.
    Unbind {
        /// Session identifier.
        session: u64,
    },
}

/// Messages sent by the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// Assigns the client file identifier.
    Ident {
        /// Session identifier.
        session: u64,
        /// Assigned identifier.
        file_ident: SaltedFileIdent,
    },
    /// Server changesets plus progress.
    Download {
        /// Session identifier.
        session: u64,
        /// Progress after integrating the changesets.
        progress: SyncProgress,
        /// Bytes the server still has to send.
        downloadable_bytes: u64,
        /// Changesets in version order.
        changesets: Vec<RemoteChangeset>,
    },
    /// Answers a `mark` once everything before it was downloaded.
    Mark {
        /// Session identifier.
        session: u64,
        /// Echo of the request.
        request_ident: u64,
    },
    /// Confirms an `unbind`.
    Unbound {
        /// Session identifier.
        session: u64,
    },
    /// Error; session zero means the whole connection.
    Error {
        /// Session identifier or zero.
        session: u64,
        /// Error details.
        info: ProtocolErrorInfo,
    },
}

impl ServerMessage {
    /// Session the message is addressed to; zero for connection errors.
    #[must_use]
    pub fn session(&self) -> u64 {
        match self {
            Self::Ident { session, .. }
            | Self::Download { session, .. }
            | Self::Mark { session, .. }
            | Self::Unbound { session }
            | Self::Error { session, .. } => *session,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JsonErrorBody {
    message: String,
    try_again: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    should_client_reset: Option<bool>,
    #[serde(default)]
    is_recovery_mode_disabled: bool,
    #[serde(rename = "logURL", default, skip_serializing_if = "Option::is_none")]
    log_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    backoff_interval_sec: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    backoff_max_delay_sec: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    backoff_multiplier: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    compensating_writes: Vec<CompensatingWriteInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    migration_query_string: Option<String>,
}

fn bad_syntax(reason: impl Into<String>) -> SyncError {
    SyncError::protocol(ProtocolError::BadSyntax, reason)
}

/// Splits a frame into its header line and body.
fn split_frame(data: &[u8]) -> SyncResult<(&str, &[u8])> {
    let end = data
        .iter()
        .take(MAX_HEADER_SIZE)
        .position(|&b| b == b'\n')
        .ok_or_else(|| bad_syntax("missing or oversized header line"))?;
    let header = std::str::from_utf8(&data[..end])
        .map_err(|_| bad_syntax("header is not valid text"))?;
    Ok((header, &data[end + 1..]))
}

struct Header<'a> {
    kind: &'a str,
    fields: std::str::SplitAsciiWhitespace<'a>,
}

impl<'a> Header<'a> {
    fn parse(line: &'a str) -> SyncResult<Self> {
        let mut fields = line.split_ascii_whitespace();
        let kind = fields.next().ok_or_else(|| bad_syntax("empty header"))?;
        Ok(Self { kind, fields })
    }

    fn u64(&mut self, name: &str) -> SyncResult<u64> {
        self.fields
            .next()
            .and_then(|f| f.parse().ok())
            .ok_or_else(|| bad_syntax(format!("{} header: bad or missing {name}", self.kind)))
    }

    fn i32(&mut self, name: &str) -> SyncResult<i32> {
        self.fields
            .next()
            .and_then(|f| f.parse().ok())
            .ok_or_else(|| bad_syntax(format!("{} header: bad or missing {name}", self.kind)))
    }

    fn size(&mut self, name: &str) -> SyncResult<usize> {
        let v = self.u64(name)?;
        usize::try_from(v).map_err(|_| {
            SyncError::protocol(ProtocolError::LimitsExceeded, format!("{name} too large"))
        })
    }

    fn flag(&mut self, name: &str) -> SyncResult<bool> {
        match self.u64(name)? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(bad_syntax(format!("{} header: {name} must be 0 or 1", self.kind))),
        }
    }

    fn finish(mut self) -> SyncResult<()> {
        match self.fields.next() {
            None => Ok(()),
            Some(extra) => Err(bad_syntax(format!(
                "{} header: unexpected field '{extra}'",
                self.kind
            ))),
        }
    }
}

/// Cursor over a changeset body.
struct Body<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Body<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn number(&mut self) -> SyncResult<u64> {
        let rest = &self.data[self.pos..];
        let len = rest
            .iter()
            .position(|&b| b == b' ')
            .ok_or_else(|| SyncError::protocol(ProtocolError::BadChangesetHeaderSyntax, "truncated changeset header"))?;
        let value = std::str::from_utf8(&rest[..len])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| {
                SyncError::protocol(
                    ProtocolError::BadChangesetHeaderSyntax,
                    "bad number in changeset header",
                )
            })?;
        self.pos += len + 1;
        Ok(value)
    }

    fn bytes(&mut self, size: u64) -> SyncResult<Bytes> {
        let size = usize::try_from(size).ok().filter(|&s| s <= self.data.len() - self.pos);
        let size = size.ok_or_else(|| {
            SyncError::protocol(ProtocolError::BadChangesetSize, "changeset exceeds body")
        })?;
        let out = Bytes::copy_from_slice(&self.data[self.pos..self.pos + size]);
        self.pos += size;
        Ok(out)
    }
}

fn take_body<'a>(body: &'a [u8], size: usize, kind: &str) -> SyncResult<&'a [u8]> {
    if body.len() != size {
        return Err(bad_syntax(format!(
            "{kind} body is {} bytes, header says {size}",
            body.len()
        )));
    }
    Ok(body)
}

fn reject_compressed(compressed: bool) -> SyncResult<()> {
    if compressed {
        return Err(SyncError::protocol(
            ProtocolError::BadDecompression,
            "compressed message bodies are not supported",
        ));
    }
    Ok(())
}

fn frame(header: String, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(header.len() + 1 + body.len());
    buf.put_slice(header.as_bytes());
    buf.put_u8(b'\n');
    buf.put_slice(body);
    buf.freeze()
}

fn put_entry(body: &mut BytesMut, numbers: &[u64], data: &[u8]) {
    for n in numbers {
        body.put_slice(format!("{n} ").as_bytes());
    }
    body.put_slice(format!("{} ", data.len()).as_bytes());
    body.put_slice(data);
}

impl ClientMessage {
    /// Encodes the message into one frame.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        match self {
            Self::Bind {
                session,
                path,
                signed_user_token,
                need_client_file_ident,
            } => {
                let header = format!(
                    "bind {session} {} {} {} 0",
                    path.len(),
                    signed_user_token.len(),
                    u8::from(*need_client_file_ident)
                );
                let mut body = Vec::with_capacity(path.len() + signed_user_token.len());
                body.extend_from_slice(path.as_bytes());
                body.extend_from_slice(signed_user_token.as_bytes());
                frame(header, &body)
            }
            Self::Ident {
                session,
                file_ident,
                progress,
            } => frame(
                format!(
                    "ident {session} {} {} {} {} {} {}",
                    file_ident.ident,
                    file_ident.salt,
                    progress.download.server_version,
                    progress.download.last_integrated_client_version,
                    progress.latest_server_version.version,
                    progress.latest_server_version.salt
                ),
                &[],
            ),
            Self::Upload {
                session,
                progress,
                locked_server_version,
                changesets,
            } => {
                let mut body = BytesMut::new();
                for c in changesets {
                    put_entry(
                        &mut body,
                        &[
                            c.client_version,
                            c.last_integrated_server_version,
                            c.origin_timestamp,
                            c.origin_file_ident,
                        ],
                        &c.data,
                    );
                }
                let header = format!(
                    "upload {session} 0 {} 0 {} {} {locked_server_version}",
                    body.len(),
                    progress.client_version,
                    progress.last_integrated_server_version
                );
                frame(header, &body)
            }
            Self::Mark {
                session,
                request_ident,
            } => frame(format!("mark {session} {request_ident}"), &[]),
            Self::Unbind { session } => frame(format!("unbind {session}"), &[]),
        }
    }

    /// Decodes a frame sent by a client.
    pub fn decode(data: &[u8]) -> SyncResult<Self> {
        let (line, body) = split_frame(data)?;
        let mut h = Header::parse(line)?;
        let session = h.u64("session")?;
        let msg = match h.kind {
            "bind" => {
                let path_size = h.size("path size")?;
                let token_size = h.size("token size")?;
                let need_client_file_ident = h.flag("need ident")?;
                let _is_subserver = h.flag("is subserver")?;
                h.finish()?;
                let body = take_body(body, path_size.saturating_add(token_size), "bind")?;
                let text = |b: &[u8]| {
                    String::from_utf8(b.to_vec()).map_err(|_| bad_syntax("bind body is not valid text"))
                };
                Self::Bind {
                    session,
                    path: text(&body[..path_size])?,
                    signed_user_token: text(&body[path_size..])?,
                    need_client_file_ident,
                }
            }
            "ident" => {
                let file_ident = SaltedFileIdent {
                    ident: h.u64("file ident")?,
                    salt: h.u64("salt")?,
                };
                let download = DownloadCursor::new(h.u64("server version")?, h.u64("client version")?);
                let latest_server_version = SaltedVersion {
                    version: h.u64("latest server version")?,
                    salt: h.u64("latest server version salt")?,
                };
                h.finish()?;
                take_body(body, 0, "ident")?;
                Self::Ident {
                    session,
                    file_ident,
                    progress: SyncProgress {
                        latest_server_version,
                        download,
                        upload: UploadCursor::default(),
                    },
                }
            }
            "upload" => {
                reject_compressed(h.flag("is compressed")?)?;
                let size = h.size("body size")?;
                let _compressed_size = h.u64("compressed size")?;
                let progress = UploadCursor::new(h.u64("client version")?, h.u64("server version")?);
                let locked_server_version = h.u64("locked server version")?;
                h.finish()?;
                let mut reader = Body::new(take_body(body, size, "upload")?);
                let mut changesets = Vec::new();
                while !reader.is_empty() {
                    let client_version = reader.number()?;
                    let last_integrated_server_version = reader.number()?;
                    let origin_timestamp = reader.number()?;
                    let origin_file_ident = reader.number()?;
                    let size = reader.number()?;
                    changesets.push(UploadChangeset {
                        client_version,
                        last_integrated_server_version,
                        origin_timestamp,
                        origin_file_ident,
                        data: reader.bytes(size)?,
                    });
                }
                Self::Upload {
                    session,
                    progress,
                    locked_server_version,
                    changesets,
                }
            }
            "mark" => {
                let request_ident = h.u64("request ident")?;
                h.finish()?;
                Self::Mark {
                    session,
                    request_ident,
                }
            }
            "unbind" => {
                h.finish()?;
                Self::Unbind { session }
            }
            other => {
                return Err(SyncError::protocol(
                    ProtocolError::UnknownMessage,
                    format!("unknown client message '{other}'"),
                ))
            }
        };
        Ok(msg)
    }
}

impl ServerMessage {
    /// Encodes the message into one frame.
    pub fn encode(&self) -> SyncResult<Bytes> {
        Ok(match self {
            Self::Ident {
                session,
                file_ident,
            } => frame(
                format!("ident {session} {} {}", file_ident.ident, file_ident.salt),
                &[],
            ),
            Self::Download {
                session,
                progress,
                downloadable_bytes,
                changesets,
            } => {
                let mut body = BytesMut::new();
                for c in changesets {
                    put_entry(
                        &mut body,
                        &[
                            c.remote_version,
                            c.last_integrated_local_version,
                            c.origin_timestamp,
                            c.origin_file_ident,
                            c.original_changeset_size,
                        ],
                        &c.data,
                    );
                }
                let header = format!(
                    "download {session} {} {} {} {} {} {} {downloadable_bytes} 0 {} 0",
                    progress.download.server_version,
                    progress.download.last_integrated_client_version,
                    progress.latest_server_version.version,
                    progress.latest_server_version.salt,
                    progress.upload.client_version,
                    progress.upload.last_integrated_server_version,
                    body.len()
                );
                frame(header, &body)
            }
            Self::Mark {
                session,
                request_ident,
            } => frame(format!("mark {session} {request_ident}"), &[]),
            Self::Unbound { session } => frame(format!("unbound {session}"), &[]),
            Self::Error { session, info } => {
                let resumption = info.resumption_delay_interval;
                let json = serde_json::to_vec(&JsonErrorBody {
                    message: info.message.clone(),
                    try_again: info.try_again,
                    should_client_reset: info.should_client_reset,
                    is_recovery_mode_disabled: info.client_reset_recovery_is_disabled,
                    log_url: info.log_url.clone(),
                    action: serde_json::to_value(info.server_requests_action)?
                        .as_str()
                        .map(str::to_string),
                    backoff_interval_sec: resumption.map(|r| r.resumption_delay_interval.as_secs()),
                    backoff_max_delay_sec: resumption
                        .map(|r| r.max_resumption_delay_interval.as_secs()),
                    backoff_multiplier: resumption.map(|r| r.resumption_delay_backoff_multiplier),
                    compensating_writes: info.compensating_writes.clone(),
                    migration_query_string: info.migration_query_string.clone(),
                })?;
                frame(
                    format!("json_error {} {} {session}", info.raw_error_code, json.len()),
                    &json,
                )
            }
        })
    }

    /// Decodes a frame sent by the server.
    pub fn decode(data: &[u8]) -> SyncResult<Self> {
        let (line, body) = split_frame(data)?;
        let mut h = Header::parse(line)?;
        let msg = match h.kind {
            "ident" => {
                let session = h.u64("session")?;
                let file_ident = SaltedFileIdent {
                    ident: h.u64("file ident")?,
                    salt: h.u64("salt")?,
                };
                h.finish()?;
                take_body(body, 0, "ident")?;
                Self::Ident {
                    session,
                    file_ident,
                }
            }
            "download" => {
                let session = h.u64("session")?;
                let download = DownloadCursor::new(h.u64("server version")?, h.u64("client version")?);
                let latest_server_version = SaltedVersion {
                    version: h.u64("latest server version")?,
                    salt: h.u64("latest server version salt")?,
                };
                let upload = UploadCursor::new(
                    h.u64("upload client version")?,
                    h.u64("upload server version")?,
                );
                let downloadable_bytes = h.u64("downloadable bytes")?;
                reject_compressed(h.flag("is compressed")?)?;
                let size = h.size("body size")?;
                let _compressed_size = h.u64("compressed size")?;
                h.finish()?;

                let mut reader = Body::new(take_body(body, size, "download")?);
                let mut changesets = Vec::new();
                while !reader.is_empty() {
                    let remote_version = reader.number()?;
                    let last_integrated_local_version = reader.number()?;
                    let origin_timestamp = reader.number()?;
                    let origin_file_ident = reader.number()?;
                    let original_changeset_size = reader.number()?;
                    let size = reader.number()?;
                    changesets.push(RemoteChangeset {
                        remote_version,
                        last_integrated_local_version,
                        origin_timestamp,
                        origin_file_ident,
                        original_changeset_size,
                        data: reader.bytes(size)?,
                    });
                }
                Self::Download {
                    session,
                    progress: SyncProgress {
                        latest_server_version,
                        download,
                        upload,
                    },
                    downloadable_bytes,
                    changesets,
                }
            }
            "mark" => {
                let session = h.u64("session")?;
                let request_ident = h.u64("request ident")?;
                h.finish()?;
                Self::Mark {
                    session,
                    request_ident,
                }
            }
            "unbound" => {
                let session = h.u64("session")?;
                h.finish()?;
                Self::Unbound { session }
            }
            "json_error" => {
                let code = h.i32("error code")?;
                let size = h.size("json size")?;
                let session = h.u64("session")?;
                h.finish()?;
                let parsed: JsonErrorBody = serde_json::from_slice(take_body(body, size, "error")?)?;
                Self::Error {
                    session,
                    info: error_info_from_json(code, parsed),
                }
            }
            "error" => {
                let code = h.i32("error code")?;
                let size = h.size("message size")?;
                let try_again = h.flag("try again")?;
                let session = h.u64("session")?;
                h.finish()?;
                let message = String::from_utf8_lossy(take_body(body, size, "error")?).into_owned();
                Self::Error {
                    session,
                    info: ProtocolErrorInfo::new(code, message, try_again),
                }
            }
            other => {
                return Err(SyncError::protocol(
                    ProtocolError::UnknownMessage,
                    format!("unknown server message '{other}'"),
                ))
            }
        };
        Ok(msg)
    }
}

fn error_info_from_json(code: i32, body: JsonErrorBody) -> ProtocolErrorInfo {
    let mut info = ProtocolErrorInfo::new(code, body.message, body.try_again);
    if let Some(action) = body.action {
        info.server_requests_action =
            serde_json::from_value(serde_json::Value::String(action)).unwrap_or(Action::ApplicationBug);
        info.is_fatal = !body.try_again && info.server_requests_action != Action::Warning;
    }
    info.should_client_reset = body.should_client_reset;
    info.client_reset_recovery_is_disabled = body.is_recovery_mode_disabled;
    info.log_url = body.log_url;
    info.compensating_writes = body.compensating_writes;
    info.migration_query_string = body.migration_query_string;
    if let Some(secs) = body.backoff_interval_sec {
        let defaults = ResumptionDelayInfo::default();
        info.resumption_delay_interval = Some(ResumptionDelayInfo {
            resumption_delay_interval: Duration::from_secs(secs),
            max_resumption_delay_interval: body
                .backoff_max_delay_sec
                .map_or(defaults.max_resumption_delay_interval, Duration::from_secs),
            resumption_delay_backoff_multiplier: body
                .backoff_multiplier
                .unwrap_or(defaults.resumption_delay_backoff_multiplier),
            ..defaults
        });
    }
    info
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress() -> SyncProgress {
        SyncProgress {
            latest_server_version: SaltedVersion {
                version: 9,
                salt: 77,
            },
            download: DownloadCursor::new(9, 3),
            upload: UploadCursor::new(3, 8),
        }
    }

    #[test]
    fn test_bind_layout() {
        let msg = ClientMessage::Bind {
            session: 1,
            path: "/tasks".into(),
            signed_user_token: "tok".into(),
            need_client_file_ident: true,
        };
        let bytes = msg.encode();
        assert_eq!(&bytes[..], b"bind 1 6 3 1 0\n/taskstok");
        assert_eq!(ClientMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_download_with_changesets() {
        let msg = ServerMessage::Download {
            session: 4,
            progress: progress(),
            downloadable_bytes: 120,
            changesets: vec![
                RemoteChangeset {
                    remote_version: 8,
                    last_integrated_local_version: 3,
                    origin_timestamp: 1_700_000_000_000,
                    origin_file_ident: 12,
                    original_changeset_size: 5,
                    data: Bytes::from_static(b"ab cd"),
                },
                RemoteChangeset {
                    remote_version: 9,
                    last_integrated_local_version: 3,
                    origin_timestamp: 1_700_000_000_001,
                    origin_file_ident: 13,
                    original_changeset_size: 0,
                    data: Bytes::new(),
                },
            ],
        };
        let bytes = msg.encode().unwrap();
        assert!(bytes.starts_with(b"download 4 9 3 9 77 3 8 120 0 "));
        assert_eq!(ServerMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_upload_body_size_is_checked() {
        let msg = ClientMessage::Upload {
            session: 2,
            progress: UploadCursor::new(5, 4),
            locked_server_version: 4,
            changesets: vec![UploadChangeset {
                client_version: 5,
                last_integrated_server_version: 4,
                origin_timestamp: 10,
                origin_file_ident: 0,
                data: Bytes::from_static(&[1, 2, 3]),
            }],
        };
        let mut bytes = msg.encode().to_vec();
        assert_eq!(ClientMessage::decode(&bytes).unwrap(), msg);
        bytes.push(0);
        assert!(ClientMessage::decode(&bytes).is_err());
    }

    #[test]
    fn test_truncated_changeset_is_rejected() {
        let frame = b"download 1 1 0 1 0 0 0 0 0 15 0\n1 0 0 0 0 9 abc";
        let err = ServerMessage::decode(frame).unwrap_err();
        assert_eq!(
            err.protocol_info().and_then(|i| i.protocol_error()),
            Some(ProtocolError::BadChangesetSize)
        );
    }

    #[test]
    fn test_compressed_body_is_rejected() {
        let frame = b"download 1 1 0 1 0 0 0 0 1 0 0\n";
        let err = ServerMessage::decode(frame).unwrap_err();
        assert_eq!(
            err.protocol_info().and_then(|i| i.protocol_error()),
            Some(ProtocolError::BadDecompression)
        );
    }

    #[test]
    fn test_json_error() {
        let json = br#"{"message":"reset please","tryAgain":false,"isRecoveryModeDisabled":true,"logURL":"https://logs/1","action":"ClientReset","backoffIntervalSec":3}"#;
        let mut frame = format!("json_error 211 {} 5\n", json.len()).into_bytes();
        frame.extend_from_slice(json);
        let ServerMessage::Error { session, info } = ServerMessage::decode(&frame).unwrap() else {
            panic!("expected an error message");
        };
        assert_eq!(session, 5);
        assert_eq!(info.protocol_error(), Some(ProtocolError::DivergingHistories));
        assert_eq!(info.action(), Action::ClientResetNoRecovery);
        assert_eq!(info.log_url.as_deref(), Some("https://logs/1"));
        assert_eq!(
            info.resumption_delay_interval.map(|r| r.resumption_delay_interval.as_secs()),
            Some(3)
        );

        let again = ServerMessage::Error { session, info: info.clone() }.encode().unwrap();
        let ServerMessage::Error { info: back, .. } = ServerMessage::decode(&again).unwrap() else {
            panic!("expected an error message");
        };
        assert_eq!(back.server_requests_action, Action::ClientReset);
        assert!(back.client_reset_recovery_is_disabled);
    }

    #[test]
    fn test_legacy_error_and_unknown_kind() {
        let frame = b"error 203 8 0 0\nbad auth";
        let ServerMessage::Error { session, info } = ServerMessage::decode(frame).unwrap() else {
            panic!("expected an error message");
        };
        assert_eq!(session, 0);
        assert_eq!(info.action(), Action::RefreshUser);
        assert_eq!(info.message, "bad auth");

        let err = ServerMessage::decode(b"hello 1\n").unwrap_err();
        assert_eq!(
            err.protocol_info().and_then(|i| i.protocol_error()),
            Some(ProtocolError::UnknownMessage)
        );
    }
}

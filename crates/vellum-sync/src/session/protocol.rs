//! Per-connection protocol state of one session.
//!
//! Knows which messages were sent and which server messages are legal
//! next; does no I/O. The connection task feeds it server messages and
//! sends whatever it returns.

use bytes::Bytes;
use tracing::trace;
use vellum_replication::cursor::{SyncProgress, UploadCursor};

use crate::error::{SyncError, SyncResult};
use crate::protocol::{
    ClientMessage, ProtocolError, ProtocolErrorInfo, RemoteChangeset, SaltedFileIdent,
    ServerMessage, UploadChangeset,
};

/// What a server message means for the session.
#[derive(Debug)]
pub(crate) enum ProtocolEvent {
    /// The server assigned a file identifier; ident and mark must follow.
    FileIdentAssigned(SaltedFileIdent),
    /// Server changesets to integrate.
    Download {
        progress: SyncProgress,
        downloadable_bytes: u64,
        changesets: Vec<RemoteChangeset>,
    },
    /// Everything up to mark `request` has been downloaded.
    DownloadCompleted { request: u64 },
    /// The server confirmed the unbind.
    Unbound,
    /// Error addressed to this session or the connection.
    Error(ProtocolErrorInfo),
}

#[derive(Debug)]
pub(crate) struct ProtocolSession {
    ident: u64,
    file_ident: Option<SaltedFileIdent>,
    progress: SyncProgress,
    last_uploaded: u64,
    upload_enabled: bool,
    ident_sent: bool,
    unbind_sent: bool,
    next_mark: u64,
    last_mark_sent: u64,
}

fn order_error(what: &str) -> SyncError {
    SyncError::protocol(
        ProtocolError::BadMessageOrder,
        format!("unexpected {what} message"),
    )
}

impl ProtocolSession {
    pub fn new(
        ident: u64,
        file_ident: Option<SaltedFileIdent>,
        progress: SyncProgress,
        fast_reconnect: bool,
    ) -> Self {
        Self {
            ident,
            file_ident,
            progress,
            last_uploaded: progress.upload.client_version,
            upload_enabled: fast_reconnect,
            ident_sent: false,
            unbind_sent: false,
            next_mark: 1,
            last_mark_sent: 0,
        }
    }

    pub fn progress(&self) -> &SyncProgress {
        &self.progress
    }

    pub fn file_ident(&self) -> Option<SaltedFileIdent> {
        self.file_ident
    }

    pub fn last_uploaded(&self) -> u64 {
        self.last_uploaded
    }

    pub fn can_upload(&self) -> bool {
        self.upload_enabled && self.ident_sent && !self.unbind_sent
    }

    pub fn ident_sent(&self) -> bool {
        self.ident_sent
    }

    /// Messages that open the session.
    pub fn bind(&mut self, server_path: &str, token: &str) -> Vec<ClientMessage> {
        let mut out = vec![ClientMessage::Bind {
            session: self.ident,
            path: server_path.to_string(),
            signed_user_token: token.to_string(),
            need_client_file_ident: self.file_ident.is_none(),
        }];
        if self.file_ident.is_some() {
            out.extend(self.ident_and_mark());
        }
        out
    }

    /// The ident message followed by a download completion request.
    pub fn ident_and_mark(&mut self) -> Vec<ClientMessage> {
        let Some(file_ident) = self.file_ident else {
            return Vec::new();
        };
        self.ident_sent = true;
        let mut out = vec![ClientMessage::Ident {
            session: self.ident,
            file_ident,
            progress: self.progress,
        }];
        out.extend(self.request_mark());
        out
    }

    /// Requests a download completion marker.
    pub fn request_mark(&mut self) -> Option<ClientMessage> {
        if !self.ident_sent || self.unbind_sent {
            return None;
        }
        let request_ident = self.next_mark;
        self.next_mark += 1;
        self.last_mark_sent = request_ident;
        Some(ClientMessage::Mark {
            session: self.ident,
            request_ident,
        })
    }

    /// Ident of the last mark sent, zero if none.
    pub fn last_mark_sent(&self) -> u64 {
        self.last_mark_sent
    }

    /// Builds an upload of the local changesets in `(version, changeset)`
    /// form. `scanned_through` is the newest local version examined; it is
    /// reported even when no changeset needs uploading so the server can
    /// acknowledge versions produced by integrating downloads.
    pub fn upload(
        &mut self,
        scanned_through: u64,
        changesets: Vec<(u64, Bytes)>,
        now_ms: u64,
    ) -> Option<ClientMessage> {
        if !self.can_upload() || scanned_through <= self.last_uploaded {
            return None;
        }
        let server_version = self.progress.download.server_version;
        let changesets: Vec<UploadChangeset> = changesets
            .into_iter()
            .filter(|(v, _)| *v > self.last_uploaded && *v <= scanned_through)
            .map(|(client_version, data)| UploadChangeset {
                client_version,
                last_integrated_server_version: server_version,
                origin_timestamp: now_ms,
                origin_file_ident: 0,
                data,
            })
            .collect();
        self.last_uploaded = scanned_through;
        trace!(
            session = self.ident,
            changesets = changesets.len(),
            through = scanned_through,
            "upload"
        );
        Some(ClientMessage::Upload {
            session: self.ident,
            progress: UploadCursor::new(scanned_through, server_version),
            locked_server_version: server_version,
            changesets,
        })
    }

    pub fn unbind(&mut self) -> ClientMessage {
        self.unbind_sent = true;
        ClientMessage::Unbind { session: self.ident }
    }

    /// Validates a server message against the session state.
    pub fn receive(&mut self, msg: ServerMessage) -> SyncResult<ProtocolEvent> {
        let session = msg.session();
        let connection_error = matches!(msg, ServerMessage::Error { session: 0, .. });
        if session != self.ident && !connection_error {
            return Err(SyncError::protocol(
                ProtocolError::BadSessionIdent,
                format!("message for session {session}, expected {}", self.ident),
            ));
        }
        match msg {
            ServerMessage::Ident { file_ident, .. } => {
                if self.file_ident.is_some() || self.unbind_sent {
                    return Err(order_error("ident"));
                }
                if file_ident.ident == 0 {
                    return Err(SyncError::protocol(
                        ProtocolError::BadClientFileIdent,
                        "server assigned file identifier zero",
                    ));
                }
                self.file_ident = Some(file_ident);
                Ok(ProtocolEvent::FileIdentAssigned(file_ident))
            }
            ServerMessage::Download {
                progress,
                downloadable_bytes,
                changesets,
                ..
            } => {
                if !self.ident_sent {
                    return Err(order_error("download"));
                }
                if !self.progress.can_advance_to(&progress) {
                    return Err(SyncError::protocol(
                        ProtocolError::BadProgress,
                        format!("progress cannot move from {:?} to {progress:?}", self.progress),
                    ));
                }
                let mut previous = self.progress.download.server_version;
                for c in &changesets {
                    if c.remote_version <= previous
                        || c.remote_version > progress.download.server_version
                    {
                        return Err(SyncError::protocol(
                            ProtocolError::BadServerVersion,
                            format!("changeset for server version {}", c.remote_version),
                        ));
                    }
                    previous = c.remote_version;
                }
                self.progress = progress;
                Ok(ProtocolEvent::Download {
                    progress,
                    downloadable_bytes,
                    changesets,
                })
            }
            ServerMessage::Mark { request_ident, .. } => {
                if request_ident == 0 || request_ident > self.last_mark_sent {
                    return Err(order_error("mark"));
                }
                self.upload_enabled = true;
                Ok(ProtocolEvent::DownloadCompleted {
                    request: request_ident,
                })
            }
            ServerMessage::Unbound { .. } => {
                if !self.unbind_sent {
                    return Err(order_error("unbound"));
                }
                Ok(ProtocolEvent::Unbound)
            }
            ServerMessage::Error { info, .. } => Ok(ProtocolEvent::Error(info)),
        }
    }
}

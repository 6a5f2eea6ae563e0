//! Upload and download progress callbacks.
//!
//! A streaming callback sees every change of the transferred and
//! transferrable byte counts. A snapshot callback captures the
//! transferrable count when it first sees progress and is dropped once the
//! transferred count reaches it.

use std::collections::BTreeMap;

use vellum_common::lock_tag;
use vellum_common::sync::Guarded;

lock_tag!(ProgressLock, "sync.progress", 110);

/// Which byte counts a callback follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressDirection {
    /// Local changes sent to the server.
    Upload,
    /// Server changes received.
    Download,
}

/// Byte counts of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProgressValues {
    /// Bytes acknowledged by the server.
    pub uploaded: u64,
    /// Bytes acknowledged plus bytes waiting to be uploaded.
    pub uploadable: u64,
    /// Bytes integrated locally.
    pub downloaded: u64,
    /// Bytes integrated plus bytes the server still has.
    pub downloadable: u64,
    /// Local version the counts were taken at.
    pub snapshot_version: u64,
}

impl ProgressValues {
    fn pair(&self, direction: ProgressDirection) -> (u64, u64) {
        match direction {
            ProgressDirection::Upload => (self.uploaded, self.uploadable),
            ProgressDirection::Download => (self.downloaded, self.downloadable),
        }
    }
}

/// Receives `(transferred, transferrable)`.
pub type ProgressCallback = Box<dyn FnMut(u64, u64) + Send>;

struct Registration {
    direction: ProgressDirection,
    streaming: bool,
    callback: Option<ProgressCallback>,
    captured: Option<u64>,
    last: Option<(u64, u64)>,
}

#[derive(Default)]
struct ProgressState {
    current: Option<ProgressValues>,
    registrations: BTreeMap<u64, Registration>,
    next_token: u64,
}

/// Progress callback registry of one session.
pub struct SyncProgressNotifier {
    state: Guarded<ProgressState, ProgressLock>,
}

impl Default for SyncProgressNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncProgressNotifier {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Guarded::new(ProgressState {
                next_token: 1,
                ..Default::default()
            }),
        }
    }

    /// Registers a callback and returns its token. The callback fires at
    /// once if progress is already known.
    pub fn register(
        &self,
        direction: ProgressDirection,
        streaming: bool,
        callback: ProgressCallback,
    ) -> u64 {
        let token = {
            let mut state = self.state.lock();
            let token = state.next_token;
            state.next_token += 1;
            state.registrations.insert(
                token,
                Registration {
                    direction,
                    streaming,
                    callback: Some(callback),
                    captured: None,
                    last: None,
                },
            );
            token
        };
        self.deliver(Some(token));
        token
    }

    /// Removes a callback.
    pub fn unregister(&self, token: u64) {
        self.state.lock().registrations.remove(&token);
    }

    /// Number of live registrations.
    pub fn registration_count(&self) -> usize {
        self.state.lock().registrations.len()
    }

    /// Latest byte counts.
    pub fn current(&self) -> Option<ProgressValues> {
        self.state.lock().current
    }

    /// Publishes new byte counts.
    pub fn update(&self, values: ProgressValues) {
        self.state.lock().current = Some(values);
        self.deliver(None);
    }

    fn deliver(&self, only: Option<u64>) {
        let mut calls = Vec::new();
        {
            let mut state = self.state.lock();
            let Some(values) = state.current else {
                return;
            };
            for (&token, reg) in state.registrations.iter_mut() {
                if only.map_or(false, |t| t != token) {
                    continue;
                }
                let (mut transferred, mut transferrable) = values.pair(reg.direction);
                if !reg.streaming {
                    transferrable = *reg.captured.get_or_insert(transferrable);
                    transferred = transferred.min(transferrable);
                }
                let expire = !reg.streaming && transferred >= transferrable;
                if reg.last == Some((transferred, transferrable)) && !expire {
                    continue;
                }
                let Some(callback) = reg.callback.take() else {
                    continue;
                };
                reg.last = Some((transferred, transferrable));
                calls.push((token, callback, transferred, transferrable, expire));
            }
        }

        let mut done = Vec::with_capacity(calls.len());
        for (token, mut callback, transferred, transferrable, expire) in calls {
            callback(transferred, transferrable);
            done.push((token, callback, expire));
        }

        let mut state = self.state.lock();
        for (token, callback, expire) in done {
            if expire {
                state.registrations.remove(&token);
            } else if let Some(reg) = state.registrations.get_mut(&token) {
                reg.callback = Some(callback);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    type Seen = Arc<Mutex<Vec<(u64, u64)>>>;

    fn recorder() -> (Seen, ProgressCallback) {
        let seen: Seen = Arc::default();
        let sink = Arc::clone(&seen);
        (seen, Box::new(move |a, b| sink.lock().push((a, b))))
    }

    fn upload(uploaded: u64, uploadable: u64) -> ProgressValues {
        ProgressValues {
            uploaded,
            uploadable,
            ..Default::default()
        }
    }

    #[test]
    fn test_streaming_sees_every_change() {
        let notifier = SyncProgressNotifier::new();
        let (seen, cb) = recorder();
        notifier.register(ProgressDirection::Upload, true, cb);
        assert!(seen.lock().is_empty());

        notifier.update(upload(0, 100));
        notifier.update(upload(0, 100));
        notifier.update(upload(100, 100));
        notifier.update(upload(100, 250));
        assert_eq!(*seen.lock(), vec![(0, 100), (100, 100), (100, 250)]);
        assert_eq!(notifier.registration_count(), 1);
    }

    #[test]
    fn test_snapshot_expires_at_captured_target() {
        let notifier = SyncProgressNotifier::new();
        notifier.update(upload(10, 100));
        let (seen, cb) = recorder();
        notifier.register(ProgressDirection::Upload, false, cb);

        // later growth of the uploadable count is not followed
        notifier.update(upload(60, 300));
        notifier.update(upload(150, 300));
        notifier.update(upload(300, 300));
        assert_eq!(*seen.lock(), vec![(10, 100), (60, 100), (100, 100)]);
        assert_eq!(notifier.registration_count(), 0);
    }

    #[test]
    fn test_directions_are_independent() {
        let notifier = SyncProgressNotifier::new();
        let (down, cb) = recorder();
        let token = notifier.register(ProgressDirection::Download, true, cb);
        notifier.update(ProgressValues {
            downloaded: 5,
            downloadable: 9,
            ..upload(1, 2)
        });
        assert_eq!(*down.lock(), vec![(5, 9)]);

        notifier.unregister(token);
        notifier.update(ProgressValues {
            downloaded: 9,
            downloadable: 9,
            ..Default::default()
        });
        assert_eq!(down.lock().len(), 1);
    }
}

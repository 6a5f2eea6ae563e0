//! Sync progress cursors.
//!
//! A cursor pairs a version on one side of the connection with the last
//! version of the other side that had been integrated at that point. Both
//! components only ever grow together.

use serde::{Deserialize, Serialize};

/// Version produced by the server together with a salt that identifies
/// the server history it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SaltedVersion {
    /// Server version.
    pub version: u64,
    /// Salt of the server history.
    pub salt: u64,
}

/// Download progress: how far the client has integrated server history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DownloadCursor {
    /// Last server version downloaded and integrated.
    pub server_version: u64,
    /// Last client version the server had integrated when producing
    /// `server_version`.
    pub last_integrated_client_version: u64,
}

/// Upload progress: how far the server has acknowledged client history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UploadCursor {
    /// Last client version uploaded.
    pub client_version: u64,
    /// Last server version the client had integrated when producing
    /// `client_version`.
    pub last_integrated_server_version: u64,
}

/// Persisted sync bookkeeping of a client file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SyncProgress {
    /// Latest server version the client has heard of.
    pub latest_server_version: SaltedVersion,
    /// Download side.
    pub download: DownloadCursor,
    /// Upload side.
    pub upload: UploadCursor,
}

fn pairs_agree(a: (u64, u64), b: (u64, u64)) -> bool {
    match a.0.cmp(&b.0) {
        std::cmp::Ordering::Less => a.1 <= b.1,
        std::cmp::Ordering::Greater => a.1 >= b.1,
        std::cmp::Ordering::Equal => a.1 == b.1,
    }
}

impl DownloadCursor {
    /// Creates a cursor.
    pub const fn new(server_version: u64, last_integrated_client_version: u64) -> Self {
        Self {
            server_version,
            last_integrated_client_version,
        }
    }

    fn pair(&self) -> (u64, u64) {
        (self.server_version, self.last_integrated_client_version)
    }

    /// A client version can only have been integrated once some server
    /// version exists.
    pub fn is_consistent(&self) -> bool {
        self.server_version != 0 || self.last_integrated_client_version == 0
    }

    /// Returns true if both cursors can belong to one history: ordering by
    /// server version agrees with ordering by integrated client version.
    pub fn are_mutually_consistent(a: &Self, b: &Self) -> bool {
        pairs_agree(a.pair(), b.pair())
    }
}

impl UploadCursor {
    /// Creates a cursor.
    pub const fn new(client_version: u64, last_integrated_server_version: u64) -> Self {
        Self {
            client_version,
            last_integrated_server_version,
        }
    }

    fn pair(&self) -> (u64, u64) {
        (self.client_version, self.last_integrated_server_version)
    }

    /// A server version can only have been integrated once some client
    /// version exists.
    pub fn is_consistent(&self) -> bool {
        self.client_version != 0 || self.last_integrated_server_version == 0
    }

    /// Returns true if both cursors can belong to one history.
    pub fn are_mutually_consistent(a: &Self, b: &Self) -> bool {
        pairs_agree(a.pair(), b.pair())
    }
}

impl SyncProgress {
    /// Returns true if `next` is a legal successor of `self`: no cursor
    /// moves backwards and the cursors stay mutually consistent.
    pub fn can_advance_to(&self, next: &SyncProgress) -> bool {
        next.download.is_consistent()
            && next.upload.is_consistent()
            && next.download.server_version >= self.download.server_version
            && next.upload.client_version >= self.upload.client_version
            && next.latest_server_version.version >= self.latest_server_version.version
            && DownloadCursor::are_mutually_consistent(&self.download, &next.download)
            && UploadCursor::are_mutually_consistent(&self.upload, &next.upload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_mutual_consistency() {
        let a = DownloadCursor::new(5, 2);
        assert!(DownloadCursor::are_mutually_consistent(&a, &DownloadCursor::new(6, 2)));
        assert!(DownloadCursor::are_mutually_consistent(&a, &DownloadCursor::new(6, 3)));
        assert!(!DownloadCursor::are_mutually_consistent(&a, &DownloadCursor::new(6, 1)));
        assert!(!DownloadCursor::are_mutually_consistent(&a, &DownloadCursor::new(5, 3)));
        assert!(DownloadCursor::are_mutually_consistent(&a, &a));

        assert!(UploadCursor::new(0, 0).is_consistent());
        assert!(!UploadCursor::new(0, 4).is_consistent());
    }

    // For x <= y <= z by primary field, a violated outer pair implies a
    // violated adjacent pair.
    #[test]
    fn test_consistency_is_transitive() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..5000 {
            let mut cursors: Vec<UploadCursor> = (0..3)
                .map(|_| UploadCursor::new(rng.gen_range(0..6), rng.gen_range(0..6)))
                .collect();
            cursors.sort_by_key(|c| c.client_version);
            let (x, y, z) = (&cursors[0], &cursors[1], &cursors[2]);
            if !UploadCursor::are_mutually_consistent(x, z) {
                assert!(
                    !UploadCursor::are_mutually_consistent(x, y)
                        || !UploadCursor::are_mutually_consistent(y, z),
                    "{x:?} {y:?} {z:?}"
                );
            }
            // Symmetric
            assert_eq!(
                UploadCursor::are_mutually_consistent(x, y),
                UploadCursor::are_mutually_consistent(y, x)
            );
        }
    }

    #[test]
    fn test_progress_advance_and_serde() {
        let p0 = SyncProgress::default();
        let p1 = SyncProgress {
            latest_server_version: SaltedVersion { version: 4, salt: 99 },
            download: DownloadCursor::new(4, 1),
            upload: UploadCursor::new(2, 3),
        };
        assert!(p0.can_advance_to(&p1));
        assert!(!p1.can_advance_to(&p0));

        let json = serde_json::to_string(&p1).unwrap();
        let back: SyncProgress = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p1);
    }
}

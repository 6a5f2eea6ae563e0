//! Codec benchmarks.
//!
//! - Changeset encoding and parsing
//! - Sync message framing for uploads and downloads

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use vellum_bench::utils::object_changeset;
use vellum_replication::cursor::{DownloadCursor, SaltedVersion, SyncProgress, UploadCursor};
use vellum_replication::{parse_changeset, NullInstructionObserver, RecordingHandler};
use vellum_sync::protocol::{ClientMessage, RemoteChangeset, ServerMessage, UploadChangeset};

const OBJECTS: [usize; 3] = [10, 100, 1_000];

fn bench_encode_changeset(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec/changeset_encode");

    for objects in OBJECTS {
        group.throughput(Throughput::Elements(objects as u64));
        group.bench_with_input(BenchmarkId::from_parameter(objects), &objects, |b, &n| {
            b.iter(|| black_box(object_changeset(n).len()));
        });
    }

    group.finish();
}

fn bench_parse_changeset(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec/changeset_parse");

    for objects in OBJECTS {
        let changeset = object_changeset(objects);
        group.throughput(Throughput::Bytes(changeset.len() as u64));
        group.bench_with_input(
            BenchmarkId::new("null_observer", objects),
            &changeset,
            |b, data| {
                b.iter(|| {
                    parse_changeset(data, &mut NullInstructionObserver).unwrap();
                });
            },
        );
        group.bench_with_input(BenchmarkId::new("recording", objects), &changeset, |b, data| {
            b.iter(|| {
                let mut handler = RecordingHandler::new();
                parse_changeset(data, &mut handler).unwrap();
                black_box(handler.instructions.len())
            });
        });
    }

    group.finish();
}

fn progress(version: u64) -> SyncProgress {
    SyncProgress {
        latest_server_version: SaltedVersion { version, salt: 99 },
        download: DownloadCursor::new(version, 4),
        upload: UploadCursor::new(4, version),
    }
}

fn bench_upload_message(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec/upload_message");
    let data = object_changeset(100);

    for count in [1, 16, 128] {
        let msg = ClientMessage::Upload {
            session: 1,
            progress: UploadCursor::new(count, 10),
            locked_server_version: 10,
            changesets: (1..=count)
                .map(|v| UploadChangeset {
                    client_version: v,
                    last_integrated_server_version: 10,
                    origin_timestamp: 1_700_000_000_000,
                    origin_file_ident: 0,
                    data: data.clone(),
                })
                .collect(),
        };
        let frame = msg.encode();
        group.throughput(Throughput::Bytes(frame.len() as u64));
        group.bench_with_input(BenchmarkId::new("encode", count), &msg, |b, msg| {
            b.iter(|| black_box(msg.encode().len()));
        });
        group.bench_with_input(BenchmarkId::new("decode", count), &frame, |b, frame| {
            b.iter(|| black_box(ClientMessage::decode(frame).unwrap()));
        });
    }

    group.finish();
}

fn bench_download_message(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec/download_message");
    let data: Bytes = object_changeset(100);

    for count in [1, 16, 128] {
        let msg = ServerMessage::Download {
            session: 1,
            progress: progress(count),
            downloadable_bytes: 0,
            changesets: (1..=count)
                .map(|v| RemoteChangeset {
                    remote_version: v,
                    last_integrated_local_version: 4,
                    origin_timestamp: 1_700_000_000_000,
                    origin_file_ident: 2,
                    original_changeset_size: data.len() as u64,
                    data: data.clone(),
                })
                .collect(),
        };
        let frame = msg.encode().unwrap();
        group.throughput(Throughput::Bytes(frame.len() as u64));
        group.bench_with_input(BenchmarkId::new("encode", count), &msg, |b, msg| {
            b.iter(|| black_box(msg.encode().unwrap().len()));
        });
        group.bench_with_input(BenchmarkId::new("decode", count), &frame, |b, frame| {
            b.iter(|| black_box(ServerMessage::decode(frame).unwrap()));
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_encode_changeset,
    bench_parse_changeset,
    bench_upload_message,
    bench_download_message,
);
criterion_main!(benches);

//! End-to-end capture / write / open / apply scenarios.

use std::collections::BTreeMap;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use wim::{
    ApplyOptions, CaptureConfig, CaptureOptions, CaptureSource, CompressionKind, DirectorySource,
    DirectoryTarget, ErrorKind, Sha1Hash, SourceStat, StreamInfo, Wim, WriteOptions,
};

fn capture_dir_to_wim(dir: &Path, wim_path: &Path, codec: CompressionKind) -> Wim {
    let mut wim = Wim::create(codec);
    wim.capture_image(
        Arc::new(DirectorySource::new()),
        dir,
        &CaptureConfig::new(),
        &CaptureOptions::default(),
        Some("image1"),
    )
    .unwrap();
    wim.write(wim_path, &WriteOptions::default()).unwrap();
    wim
}

fn apply_to_dir(wim: &Wim, out: &Path) {
    let mut target = DirectoryTarget::new(out);
    wim.apply_image(1, &mut target, &ApplyOptions::default())
        .unwrap();
}

fn prng_bytes(len: usize, mut state: u64) -> Vec<u8> {
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state as u8
        })
        .collect()
}

/// Scenario: a single tiny file.
#[test]
fn single_tiny_file() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src");
    std::fs::create_dir(&src).unwrap();
    std::fs::write(src.join("hello.txt"), b"hello").unwrap();
    let wim_path = tmp.path().join("out.wim");

    let wim = capture_dir_to_wim(&src, &wim_path, CompressionKind::Lzx);
    assert_eq!(wim.image_count(), 1);
    assert_eq!(wim.blob_count(), 1);

    let hash = Sha1Hash::of(b"hello");
    let blob = wim.blob(&hash).expect("the file's content blob");
    assert_eq!(blob.size, 5);
    assert_eq!(blob.refcnt, 1);

    // Reopen from disk and apply.
    let reopened = Wim::open(&wim_path).unwrap();
    assert_eq!(reopened.image_count(), 1);
    assert_eq!(reopened.read_blob(&hash).unwrap(), b"hello");

    let out = tmp.path().join("applied");
    apply_to_dir(&reopened, &out);
    assert_eq!(std::fs::read(out.join("hello.txt")).unwrap(), b"hello");
}

/// Scenario: 1000 identical files produce one blob with refcount 1000,
/// and the archive stays near the size of a single compressed copy.
#[test]
fn deduplication() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src");
    std::fs::create_dir(&src).unwrap();
    let content: Vec<u8> = b"ten kibibytes of duplicated content "
        .iter()
        .copied()
        .cycle()
        .take(10 * 1024)
        .collect();
    for i in 0..1000 {
        std::fs::write(src.join(format!("copy{:04}", i)), &content).unwrap();
    }
    let wim_path = tmp.path().join("out.wim");

    let wim = capture_dir_to_wim(&src, &wim_path, CompressionKind::Lzx);
    assert_eq!(wim.blob_count(), 1);
    assert_eq!(wim.blob(&Sha1Hash::of(&content)).unwrap().refcnt, 1000);

    // One compressed 10 KiB stream plus (very compressible) metadata.
    let archive_size = std::fs::metadata(&wim_path).unwrap().len();
    assert!(
        archive_size < 64 * 1024,
        "archive unexpectedly large: {} bytes",
        archive_size
    );

    let reopened = Wim::open(&wim_path).unwrap();
    assert_eq!(reopened.blob_count(), 1);
    assert_eq!(
        reopened.blob(&Sha1Hash::of(&content)).unwrap().refcnt,
        1000
    );
}

/// Scenario: hard links survive the round trip as one inode.
#[cfg(unix)]
#[test]
fn hard_links() {
    use std::os::unix::fs::MetadataExt;

    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src");
    std::fs::create_dir_all(src.join("a")).unwrap();
    std::fs::write(src.join("a/x"), b"linked content").unwrap();
    std::fs::hard_link(src.join("a/x"), src.join("a/y")).unwrap();
    let wim_path = tmp.path().join("out.wim");

    let wim = capture_dir_to_wim(&src, &wim_path, CompressionKind::Xpress);
    assert_eq!(wim.blob_count(), 1);

    let reopened = Wim::open(&wim_path).unwrap();
    let image = reopened.image(1).unwrap();
    let x = image.lookup("a/x").unwrap();
    let y = image.lookup("a/y").unwrap();
    assert_eq!(image.dentry(x).inode, image.dentry(y).inode);

    let out = tmp.path().join("applied");
    apply_to_dir(&reopened, &out);
    let md_x = std::fs::metadata(out.join("a/x")).unwrap();
    let md_y = std::fs::metadata(out.join("a/y")).unwrap();
    assert_eq!(md_x.ino(), md_y.ino());
    assert_eq!(std::fs::read(out.join("a/y")).unwrap(), b"linked content");
}

/// An in-memory source with named alternate streams, which no plain
/// directory can provide.
struct AdsSource {
    // name -> [(stream name, contents)]
    files: BTreeMap<String, Vec<(Option<String>, Vec<u8>)>>,
}

impl CaptureSource for AdsSource {
    fn stat(&self, path: &Path) -> wim::Result<SourceStat> {
        let name = path_name(path);
        let (attributes, streams, inode_id) = if name.is_empty() {
            (wim::FileAttributes::DIRECTORY, Vec::new(), 0)
        } else {
            let streams = self.files[&name]
                .iter()
                .map(|(stream, data)| StreamInfo {
                    name: stream.clone(),
                    size: data.len() as u64,
                })
                .collect();
            let index = self.files.keys().position(|k| *k == name).unwrap() as u64;
            (wim::FileAttributes::NORMAL, streams, index + 1)
        };
        Ok(SourceStat {
            attributes,
            creation_time: 130_000_000_000_000_000,
            last_access_time: 130_000_000_000_000_000,
            last_write_time: 130_000_000_000_000_000,
            inode_id,
            streams,
        })
    }

    fn open_stream(&self, path: &Path, stream: Option<&str>) -> wim::Result<Box<dyn Read + '_>> {
        let name = path_name(path);
        let data = self.files[&name]
            .iter()
            .find(|(s, _)| s.as_deref() == stream)
            .map(|(_, data)| data.clone())
            .expect("stream exists");
        Ok(Box::new(Cursor::new(data)))
    }

    fn list_dir(&self, path: &Path) -> wim::Result<Vec<String>> {
        assert!(path_name(path).is_empty(), "flat test source");
        Ok(self.files.keys().cloned().collect())
    }

    fn read_reparse(&self, _path: &Path) -> wim::Result<(u32, Vec<u8>)> {
        unreachable!("no reparse points in this source")
    }

    fn security_descriptor(&self, _path: &Path) -> wim::Result<Option<Vec<u8>>> {
        Ok(None)
    }
}

fn path_name(path: &Path) -> String {
    path.strip_prefix("/")
        .unwrap_or(path)
        .to_string_lossy()
        .into_owned()
}

/// Scenario: named alternate data streams capture as separate blobs, and
/// a target without stream support drops them (or fails in strict mode).
#[test]
fn named_alternate_streams() {
    let mut files = BTreeMap::new();
    files.insert(
        "f".to_string(),
        vec![
            (None, b"U".to_vec()),
            (Some("meta".to_string()), b"M".to_vec()),
        ],
    );
    let source = Arc::new(AdsSource { files });

    let tmp = tempfile::tempdir().unwrap();
    let wim_path = tmp.path().join("out.wim");
    let mut wim = Wim::create(CompressionKind::Lzx);
    wim.capture_image(
        source,
        Path::new("/"),
        &CaptureConfig::new(),
        &CaptureOptions::default(),
        None,
    )
    .unwrap();
    assert_eq!(wim.blob_count(), 2);
    wim.write(&wim_path, &WriteOptions::default()).unwrap();

    let reopened = Wim::open(&wim_path).unwrap();
    assert_eq!(reopened.blob_count(), 2);

    // Strict: the directory target cannot represent named streams.
    let strict_out = tmp.path().join("strict");
    let mut target = DirectoryTarget::new(&strict_out);
    let err = reopened
        .apply_image(
            1,
            &mut target,
            &ApplyOptions {
                strict: true,
                cancel: None,
            },
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unsupported);

    // Lenient: the unnamed stream lands, the named one is dropped.
    let lenient_out = tmp.path().join("lenient");
    let mut target = DirectoryTarget::new(&lenient_out);
    reopened
        .apply_image(1, &mut target, &ApplyOptions::default())
        .unwrap();
    assert_eq!(std::fs::read(lenient_out.join("f")).unwrap(), b"U");
}

/// Scenario: random read into a large incompressible blob touches only
/// the covering chunks and returns the exact slice.
#[test]
fn large_blob_random_read() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src");
    std::fs::create_dir(&src).unwrap();
    let data = prng_bytes(8 * 1024 * 1024, 0x00c0_ffee);
    std::fs::write(src.join("big.bin"), &data).unwrap();
    let wim_path = tmp.path().join("out.wim");

    capture_dir_to_wim(&src, &wim_path, CompressionKind::Xpress);

    let reopened = Wim::open(&wim_path).unwrap();
    let hash = Sha1Hash::of(&data);
    let offset = 5 * 1024 * 1024 + 123;
    let mut out = vec![0u8; 1024];
    reopened.read_blob_range(&hash, offset as u64, &mut out).unwrap();
    assert_eq!(out, &data[offset..offset + 1024]);

    // Reads straddling a chunk boundary also line up.
    let offset = 3 * 32768 - 100;
    let mut out = vec![0u8; 200];
    reopened.read_blob_range(&hash, offset as u64, &mut out).unwrap();
    assert_eq!(out, &data[offset..offset + 200]);
}

/// Chunk-boundary file sizes round-trip bit-exact.
#[test]
fn chunk_boundary_sizes() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src");
    std::fs::create_dir(&src).unwrap();

    let exactly: Vec<u8> = (0u32..32768).map(|i| (i % 200) as u8).collect();
    let one_more: Vec<u8> = (0u32..32769).map(|i| (i % 200) as u8).collect();
    std::fs::write(src.join("exact"), &exactly).unwrap();
    std::fs::write(src.join("plus1"), &one_more).unwrap();
    std::fs::write(src.join("empty"), b"").unwrap();
    let wim_path = tmp.path().join("out.wim");

    let wim = capture_dir_to_wim(&src, &wim_path, CompressionKind::Lzx);
    // The empty file contributes no blob at all.
    assert_eq!(wim.blob_count(), 2);

    let reopened = Wim::open(&wim_path).unwrap();
    let out = tmp.path().join("applied");
    apply_to_dir(&reopened, &out);
    assert_eq!(std::fs::read(out.join("exact")).unwrap(), exactly);
    assert_eq!(std::fs::read(out.join("plus1")).unwrap(), one_more);
    assert_eq!(std::fs::read(out.join("empty")).unwrap(), b"");
}

#[cfg(unix)]
#[test]
fn symlinks_round_trip() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src");
    std::fs::create_dir(&src).unwrap();
    std::fs::write(src.join("real.txt"), b"pointed at").unwrap();
    std::os::unix::fs::symlink("real.txt", src.join("link")).unwrap();
    let wim_path = tmp.path().join("out.wim");

    capture_dir_to_wim(&src, &wim_path, CompressionKind::Xpress);
    let reopened = Wim::open(&wim_path).unwrap();

    let out = tmp.path().join("applied");
    apply_to_dir(&reopened, &out);
    let target = std::fs::read_link(out.join("link")).unwrap();
    assert_eq!(target, PathBuf::from("real.txt"));
    assert_eq!(std::fs::read(out.join("link")).unwrap(), b"pointed at");
}

/// Exporting an image into another archive reuses blobs byte-for-byte.
#[test]
fn export_between_archives() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src");
    std::fs::create_dir(&src).unwrap();
    std::fs::write(src.join("data.bin"), b"exported content").unwrap();
    let first_path = tmp.path().join("first.wim");
    capture_dir_to_wim(&src, &first_path, CompressionKind::Lzx);

    let first = Wim::open(&first_path).unwrap();
    let mut second = Wim::create(CompressionKind::Lzx);
    let index = second.export_image(&first, 1).unwrap();
    assert_eq!(index, 1);
    assert_eq!(second.blob_count(), first.blob_count());

    let second_path = tmp.path().join("second.wim");
    second.write(&second_path, &WriteOptions::default()).unwrap();

    let reopened = Wim::open(&second_path).unwrap();
    assert_eq!(reopened.image_count(), 1);
    let hash = Sha1Hash::of(b"exported content");
    assert_eq!(reopened.read_blob(&hash).unwrap(), b"exported content");
}

/// Refcounts track stream references across add and delete.
#[test]
fn refcounts_across_image_delete() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src");
    std::fs::create_dir(&src).unwrap();
    std::fs::write(src.join("shared.bin"), b"shared between images").unwrap();

    let mut wim = Wim::create(CompressionKind::Lzx);
    let source: Arc<dyn CaptureSource> = Arc::new(DirectorySource::new());
    for name in ["one", "two"] {
        wim.capture_image(
            Arc::clone(&source),
            &src,
            &CaptureConfig::new(),
            &CaptureOptions::default(),
            Some(name),
        )
        .unwrap();
    }

    let hash = Sha1Hash::of(b"shared between images");
    assert_eq!(wim.blob(&hash).unwrap().refcnt, 2);

    wim.delete_image(2).unwrap();
    assert_eq!(wim.image_count(), 1);
    assert_eq!(wim.blob(&hash).unwrap().refcnt, 1);

    wim.delete_image(1).unwrap();
    // Orphaned: pruned by the next write.
    let wim_path = tmp.path().join("empty.wim");
    wim.write(&wim_path, &WriteOptions::default()).unwrap();
    assert_eq!(wim.blob_count(), 0);

    let reopened = Wim::open(&wim_path).unwrap();
    assert_eq!(reopened.image_count(), 0);
    assert_eq!(reopened.blob_count(), 0);
}

#[test]
fn image_name_collision_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src");
    std::fs::create_dir(&src).unwrap();
    std::fs::write(src.join("f"), b"x").unwrap();

    let mut wim = Wim::create(CompressionKind::None);
    let source: Arc<dyn CaptureSource> = Arc::new(DirectorySource::new());
    wim.capture_image(
        Arc::clone(&source),
        &src,
        &CaptureConfig::new(),
        &CaptureOptions::default(),
        Some("winpe"),
    )
    .unwrap();
    let err = wim
        .capture_image(
            Arc::clone(&source),
            &src,
            &CaptureConfig::new(),
            &CaptureOptions::default(),
            Some("winpe"),
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ImageNameCollision);
}

#[test]
fn integrity_table_round_trip() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src");
    std::fs::create_dir(&src).unwrap();
    std::fs::write(src.join("f.txt"), b"integrity covered contents").unwrap();
    let wim_path = tmp.path().join("out.wim");

    let mut wim = Wim::create(CompressionKind::Xpress);
    wim.capture_image(
        Arc::new(DirectorySource::new()),
        &src,
        &CaptureConfig::new(),
        &CaptureOptions::default(),
        None,
    )
    .unwrap();
    wim.write(
        &wim_path,
        &WriteOptions {
            check_integrity: true,
            keep_orphans: false,
        },
    )
    .unwrap();

    let reopened = Wim::open(&wim_path).unwrap();
    assert!(reopened.verify_integrity().unwrap());

    // Without the table there is nothing to verify.
    let plain_path = tmp.path().join("plain.wim");
    wim.write(&plain_path, &WriteOptions::default()).unwrap();
    let plain = Wim::open(&plain_path).unwrap();
    assert!(!plain.verify_integrity().unwrap());

    // Corrupt a covered byte: verification must fail.
    let mut bytes = std::fs::read(&wim_path).unwrap();
    bytes[300] ^= 0x01;
    std::fs::write(&wim_path, &bytes).unwrap();
    let tampered = Wim::open(&wim_path);
    match tampered {
        Ok(tampered) => {
            let err = tampered.verify_integrity().unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidResourceHash);
        }
        // The flipped byte may already break resource loading, which is
        // just as much a detection.
        Err(_) => {}
    }
}

#[test]
fn cancelled_apply_reports_cancellation() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src");
    std::fs::create_dir(&src).unwrap();
    std::fs::write(src.join("f.bin"), vec![7u8; 100_000]).unwrap();
    let wim_path = tmp.path().join("out.wim");

    capture_dir_to_wim(&src, &wim_path, CompressionKind::Lzx);
    let reopened = Wim::open(&wim_path).unwrap();

    let cancel = wim::CancelFlag::new();
    cancel.cancel();
    let out = tmp.path().join("applied");
    let mut target = DirectoryTarget::new(&out);
    let err = reopened
        .apply_image(
            1,
            &mut target,
            &ApplyOptions {
                strict: false,
                cancel: Some(cancel),
            },
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
}

/// Appending an image rewrites only the tail: the original blob resource
/// stays put and keeps serving reads.
#[test]
fn overwrite_appends_an_image() {
    let tmp = tempfile::tempdir().unwrap();
    let first_src = tmp.path().join("first");
    std::fs::create_dir(&first_src).unwrap();
    std::fs::write(first_src.join("old.txt"), b"original contents").unwrap();
    let wim_path = tmp.path().join("out.wim");
    capture_dir_to_wim(&first_src, &wim_path, CompressionKind::Lzx);

    let second_src = tmp.path().join("second");
    std::fs::create_dir(&second_src).unwrap();
    std::fs::write(second_src.join("new.txt"), b"appended contents").unwrap();

    let mut wim = Wim::open(&wim_path).unwrap();
    let old_blob = wim.blob(&Sha1Hash::of(b"original contents")).unwrap();
    wim.capture_image(
        Arc::new(DirectorySource::new()),
        &second_src,
        &CaptureConfig::new(),
        &CaptureOptions::default(),
        Some("appended"),
    )
    .unwrap();
    wim.overwrite(&WriteOptions::default()).unwrap();

    let reopened = Wim::open(&wim_path).unwrap();
    assert_eq!(reopened.image_count(), 2);
    assert_eq!(reopened.blob_count(), 2);
    assert_eq!(
        reopened.read_blob(&Sha1Hash::of(b"original contents")).unwrap(),
        b"original contents"
    );
    assert_eq!(
        reopened.read_blob(&Sha1Hash::of(b"appended contents")).unwrap(),
        b"appended contents"
    );

    // Append-only: the original blob did not move.
    let blob = reopened.blob(&Sha1Hash::of(b"original contents")).unwrap();
    assert_eq!(blob.archive_offset(), old_blob.archive_offset());

    let out = tmp.path().join("applied2");
    let mut target = DirectoryTarget::new(&out);
    reopened
        .apply_image(2, &mut target, &ApplyOptions::default())
        .unwrap();
    assert_eq!(
        std::fs::read(out.join("new.txt")).unwrap(),
        b"appended contents"
    );
}

/// A wider tree through the other codec, compared file by file.
#[test]
fn mixed_tree_xpress_round_trip() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src");
    std::fs::create_dir_all(src.join("nested/deeper")).unwrap();
    std::fs::write(src.join("a.txt"), b"alpha").unwrap();
    std::fs::write(src.join("nested/b.txt"), prng_bytes(50_000, 42)).unwrap();
    std::fs::write(
        src.join("nested/deeper/c.txt"),
        b"gamma".repeat(20_000),
    )
    .unwrap();
    let wim_path = tmp.path().join("out.wim");

    capture_dir_to_wim(&src, &wim_path, CompressionKind::Xpress);
    let reopened = Wim::open(&wim_path).unwrap();
    let out = tmp.path().join("applied");
    apply_to_dir(&reopened, &out);

    for rel in ["a.txt", "nested/b.txt", "nested/deeper/c.txt"] {
        assert_eq!(
            std::fs::read(out.join(rel)).unwrap(),
            std::fs::read(src.join(rel)).unwrap(),
            "{} differs",
            rel
        );
    }
}

//! Origin lifecycle tests against an in-memory filesystem provider.

use origin_format::{mount_key_for, staging, OriginKind, OriginMetadata};
use origin_fs::{
    AttachedFilesystem, Error, FilesystemProvider, ProviderError, Settings, StorageManager,
};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::{tempdir, TempDir};

/// Records attaches. Files written under the mount point are handed to the
/// source directory when the session ends, the way a passthrough would
/// have written them there directly.
#[derive(Default)]
struct FakeProvider {
    attaches: Mutex<Vec<(PathBuf, OriginKind, PathBuf)>>,
    fail: AtomicBool,
}

impl FakeProvider {
    fn attach_count(&self) -> usize {
        self.attaches.lock().unwrap().len()
    }

    fn last_attach(&self) -> (PathBuf, OriginKind, PathBuf) {
        self.attaches.lock().unwrap().last().cloned().unwrap()
    }
}

impl FilesystemProvider for FakeProvider {
    fn attach(
        &self,
        source: &Path,
        kind: OriginKind,
        mount_point: &Path,
    ) -> Result<Box<dyn AttachedFilesystem>, ProviderError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(ProviderError::AttachFailed {
                source_path: source.to_path_buf(),
                mount_point: mount_point.to_path_buf(),
                reason: "fake failure".to_string(),
            });
        }
        self.attaches.lock().unwrap().push((
            source.to_path_buf(),
            kind,
            mount_point.to_path_buf(),
        ));
        Ok(Box::new(FakeSession {
            source: source.to_path_buf(),
            mount_point: mount_point.to_path_buf(),
            writable: kind != OriginKind::Archive,
            attached: true,
        }))
    }
}

struct FakeSession {
    source: PathBuf,
    mount_point: PathBuf,
    writable: bool,
    attached: bool,
}

impl FakeSession {
    fn flush(&mut self) -> io::Result<()> {
        if !self.attached {
            return Ok(());
        }
        self.attached = false;
        if !self.writable || !self.mount_point.is_dir() {
            return Ok(());
        }
        for entry in fs::read_dir(&self.mount_point)? {
            let entry = entry?;
            fs::rename(entry.path(), self.source.join(entry.file_name()))?;
        }
        Ok(())
    }
}

impl AttachedFilesystem for FakeSession {
    fn is_attached(&self) -> bool {
        self.attached
    }

    fn detach(mut self: Box<Self>) -> io::Result<()> {
        self.flush()
    }
}

impl Drop for FakeSession {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

struct Env {
    dir: TempDir,
    provider: Arc<FakeProvider>,
    manager: StorageManager,
}

impl Env {
    fn new() -> Self {
        let dir = tempdir().unwrap();
        let provider = Arc::new(FakeProvider::default());
        let manager = open(dir.path(), provider.clone());
        Self {
            dir,
            provider,
            manager,
        }
    }

    fn settings(&self) -> &Settings {
        self.manager.settings()
    }

    fn mount_path(&self, name: &str) -> PathBuf {
        self.settings().mount_root.join(mount_key_for(name))
    }

    fn staging_path(&self, name: &str) -> PathBuf {
        self.settings().staging_root().join(mount_key_for(name))
    }
}

fn open(root: &Path, provider: Arc<FakeProvider>) -> StorageManager {
    StorageManager::open(Settings::rooted_at(root.join("state")), provider).unwrap()
}

fn archive_contents(archive: &Path) -> BTreeMap<String, Vec<u8>> {
    let out = tempdir().unwrap();
    staging::unpack(archive, out.path()).unwrap();
    walk(out.path(), out.path())
}

fn walk(root: &Path, dir: &Path) -> BTreeMap<String, Vec<u8>> {
    let mut files = BTreeMap::new();
    for entry in fs::read_dir(dir).unwrap() {
        let path = entry.unwrap().path();
        if path.is_dir() {
            files.extend(walk(root, &path));
        } else {
            let rel = path.strip_prefix(root).unwrap().to_string_lossy().to_string();
            files.insert(rel, fs::read(&path).unwrap());
        }
    }
    files
}

#[test]
fn test_create_mount_put_unmount_delete_scenario() {
    let env = Env::new();
    let manager = &env.manager;

    // Create
    let bucket = manager.create("A").unwrap();
    let backing = bucket.backing_path().to_path_buf();
    assert!(backing.is_dir());
    let listed = manager.list().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name, "A");
    assert!(!listed[0].mounted);
    assert!(manager.registry().origin("A").unwrap().mount_key.is_none());

    // Mount
    let mount = manager.mount("A").unwrap();
    assert_eq!(mount.mount_path(), env.mount_path("A"));
    let doc = manager.registry().snapshot().unwrap();
    assert_eq!(doc.mounts["_mountA"].origin_name, "A");
    assert!(manager.bucket("A").unwrap().snapshot().unwrap().mounted);

    // Put, then put again
    let report = env.dir.path().join("report.txt");
    fs::write(&report, b"numbers").unwrap();
    let bucket = manager.bucket("A").unwrap();
    let dest = bucket.put_file(&report, None).unwrap();
    assert_eq!(dest, env.mount_path("A").join("report.txt"));
    assert!(matches!(
        bucket.put_file(&report, None),
        Err(Error::DestExists(_))
    ));

    // Unmount
    mount.unmount().unwrap();
    assert!(manager.registry().snapshot().unwrap().mounts.is_empty());
    assert!(!env.mount_path("A").exists());
    assert_eq!(fs::read(backing.join("report.txt")).unwrap(), b"numbers");

    // Delete
    manager.delete("A").unwrap();
    assert!(manager.list().unwrap().is_empty());
    assert!(!backing.exists());
    assert!(matches!(manager.bucket("A"), Err(Error::NotFound(_))));
}

#[test]
fn test_unmount_from_another_manager() {
    let env = Env::new();
    env.manager.create("A").unwrap();
    let mount = env.manager.mount("A").unwrap();
    // The serving worker loses its session once the mount point is detached.
    drop(mount);

    let other = open(env.dir.path(), env.provider.clone());
    other.unmount("A").unwrap();
    assert!(!env.mount_path("A").exists());
    assert!(!env.manager.registry().origin("A").unwrap().is_mounted());
    assert!(matches!(other.unmount("A"), Err(Error::NotMounted(_))));
}

#[test]
fn test_duplicate_create_changes_nothing() {
    let env = Env::new();
    let bucket = env.manager.create("A").unwrap();
    fs::write(bucket.backing_path().join("keep.txt"), b"keep").unwrap();
    let before = env.manager.registry().snapshot().unwrap();

    assert!(matches!(
        env.manager.create("A"),
        Err(Error::AlreadyExists(_))
    ));
    assert_eq!(env.manager.registry().snapshot().unwrap(), before);
    assert_eq!(
        fs::read(bucket.backing_path().join("keep.txt")).unwrap(),
        b"keep"
    );
}

#[test]
fn test_create_over_unregistered_path_is_rejected() {
    let env = Env::new();
    fs::create_dir_all(env.settings().storage_root.join("B")).unwrap();
    assert!(matches!(
        env.manager.create("B"),
        Err(Error::AlreadyExists(_))
    ));
    assert!(env.manager.list().unwrap().is_empty());
}

#[test]
fn test_names_sharing_a_mount_key_cannot_coexist() {
    let env = Env::new();
    env.manager.create("A.zip").unwrap();
    let before = env.manager.registry().snapshot().unwrap();

    assert!(matches!(
        env.manager.create("A_zip"),
        Err(Error::AlreadyExists(name)) if name == "A_zip"
    ));
    assert!(!env.settings().storage_root.join("A_zip").exists());
    assert_eq!(env.manager.registry().snapshot().unwrap(), before);

    let _mount = env.manager.mount("A.zip").unwrap();
    assert!(matches!(env.manager.mount("A_zip"), Err(Error::NotFound(_))));
    assert!(matches!(env.manager.delete("A_zip"), Err(Error::NotFound(_))));
    assert_eq!(env.provider.attach_count(), 1);
    assert!(env.mount_path("A.zip").is_dir());
}

#[test]
fn test_second_mount_is_rejected_without_side_effects() {
    let env = Env::new();
    env.manager.create("A").unwrap();
    let _mount = env.manager.mount("A").unwrap();
    let before = env.manager.registry().snapshot().unwrap();

    assert!(matches!(
        env.manager.mount("A"),
        Err(Error::AlreadyMounted(_))
    ));
    assert_eq!(env.provider.attach_count(), 1);
    assert_eq!(env.manager.registry().snapshot().unwrap(), before);
    assert_eq!(before.mounts.len(), 1);
}

#[test]
fn test_delete_requires_unmounted() {
    let env = Env::new();
    let bucket = env.manager.create("A").unwrap();
    let mount = env.manager.mount("A").unwrap();

    let err = env.manager.delete("A").unwrap_err();
    assert!(matches!(err, Error::StillMounted(_)));
    assert_eq!(err.exit_code(), 4);
    assert!(env.manager.registry().contains("A").unwrap());
    assert!(bucket.backing_path().is_dir());

    mount.unmount().unwrap();
    env.manager.delete("A").unwrap();
}

#[test]
fn test_file_operations_require_mounted() {
    let env = Env::new();
    let bucket = env.manager.create("A").unwrap();
    let source = env.dir.path().join("report.txt");
    fs::write(&source, b"x").unwrap();
    fs::write(bucket.backing_path().join("inside.txt"), b"inside").unwrap();

    assert!(matches!(
        bucket.put_file(&source, None),
        Err(Error::NotMounted(_))
    ));
    assert!(matches!(
        bucket.get_file("inside.txt", None, true),
        Err(Error::NotMounted(_))
    ));
    assert!(matches!(
        bucket.remove_file("inside.txt"),
        Err(Error::NotMounted(_))
    ));
    assert!(bucket.backing_path().join("inside.txt").exists());
    assert!(!env.mount_path("A").exists());
}

#[test]
fn test_lazy_archive_is_staged_and_repacked() {
    let env = Env::new();
    let bucket = env.manager.create("photos.zip").unwrap();
    assert!(bucket.backing_path().is_file());
    assert!(archive_contents(bucket.backing_path()).is_empty());

    let mount = env.manager.mount("photos.zip").unwrap();
    let (source, kind, mount_point) = env.provider.last_attach();
    assert_eq!(kind, OriginKind::LazyArchive);
    assert_eq!(source, env.staging_path("photos.zip"));
    assert_eq!(mount_point, env.mount_path("photos.zip"));
    assert!(mount_point.ends_with("_mountphotos_zip"));

    fs::create_dir(source.join("2024")).unwrap();
    fs::write(source.join("2024/beach.jpg"), b"sand").unwrap();
    env.manager
        .bucket("photos.zip")
        .unwrap()
        .put_file(Path::new("caption.txt"), Some(b"summer"))
        .unwrap();

    mount.unmount().unwrap();
    assert!(!env.staging_path("photos.zip").exists());
    assert!(!env.mount_path("photos.zip").exists());

    let contents = archive_contents(bucket.backing_path());
    assert_eq!(contents["2024/beach.jpg"], b"sand");
    assert_eq!(contents["caption.txt"], b"summer");

    // A second mount starts from the repacked archive.
    let mount = env.manager.mount("photos.zip").unwrap();
    assert!(env.staging_path("photos.zip").join("caption.txt").is_file());
    mount.unmount().unwrap();
}

#[test]
fn test_failed_repack_preserves_staged_data() {
    let env = Env::new();
    let bucket = env.manager.create("broken.tar").unwrap();
    let mount = env.manager.mount("broken.tar").unwrap();
    fs::write(env.staging_path("broken.tar").join("precious.txt"), b"unsaved").unwrap();

    // Something replaced the archive with a directory, so it cannot be rewritten.
    let backing = bucket.backing_path().to_path_buf();
    fs::remove_file(&backing).unwrap();
    fs::create_dir(&backing).unwrap();
    fs::write(backing.join("blocker"), b"").unwrap();

    let err = mount.unmount().unwrap_err();
    assert_eq!(err.exit_code(), 6);
    let preserved = match err {
        Error::RepackFailed { preserved, .. } => preserved,
        other => panic!("unexpected error: {other}"),
    };
    assert_eq!(
        fs::read(preserved.join("precious.txt")).unwrap(),
        b"unsaved"
    );
    assert!(preserved
        .file_name()
        .unwrap()
        .to_string_lossy()
        .starts_with("_mountbroken_tar.recovered-"));

    // The mount itself is gone and the staging slot is free again.
    assert!(!env.staging_path("broken.tar").exists());
    assert!(!env.manager.registry().origin("broken.tar").unwrap().is_mounted());
    assert!(!env.mount_path("broken.tar").exists());
}

#[test]
fn test_attach_failure_records_nothing() {
    let env = Env::new();
    env.manager.create("photos.tar.gz").unwrap();
    env.provider.fail.store(true, Ordering::SeqCst);

    let err = env.manager.mount("photos.tar.gz").unwrap_err();
    assert!(matches!(err, Error::Attach { .. }));
    assert_eq!(err.exit_code(), 8);
    assert!(env.manager.registry().snapshot().unwrap().mounts.is_empty());
    assert!(!env.staging_path("photos.tar.gz").exists());
    assert!(!env.mount_path("photos.tar.gz").exists());
}

#[test]
fn test_existing_mount_point_is_reused() {
    let env = Env::new();
    env.manager.create("A").unwrap();
    fs::create_dir_all(env.mount_path("A")).unwrap();

    let mount = env.manager.mount("A").unwrap();
    assert!(env.manager.registry().origin("A").unwrap().is_mounted());
    mount.unmount().unwrap();
}

#[test]
fn test_stale_staging_directory_blocks_mount() {
    let env = Env::new();
    env.manager.create("photos.zip").unwrap();
    let stale = env.staging_path("photos.zip");
    fs::create_dir_all(&stale).unwrap();
    fs::write(stale.join("left.txt"), b"over").unwrap();

    let err = env.manager.mount("photos.zip").unwrap_err();
    assert!(matches!(err, Error::StagingFailed { .. }));
    assert_eq!(env.provider.attach_count(), 0);
    assert_eq!(fs::read(stale.join("left.txt")).unwrap(), b"over");
}

#[test]
fn test_read_only_archive_is_imported() {
    let env = Env::new();
    assert!(matches!(
        env.manager.create("ro_maps.zip"),
        Err(Error::UnsupportedType { .. })
    ));

    let archive = env.settings().storage_root.join("ro_maps.zip");
    let tree = tempdir().unwrap();
    fs::write(tree.path().join("city.map"), b"streets").unwrap();
    staging::pack(tree.path(), &archive).unwrap();

    env.manager.create("ro_maps.zip").unwrap();
    let mount = env.manager.mount("ro_maps.zip").unwrap();
    let (source, kind, _) = env.provider.last_attach();
    assert_eq!(kind, OriginKind::Archive);
    assert_eq!(source, archive);
    assert!(!env.staging_path("ro_maps.zip").exists());
    mount.unmount().unwrap();

    assert_eq!(archive_contents(&archive)["city.map"], b"streets");
}

#[test]
fn test_create_rejects_bad_names_and_types() {
    let env = Env::new();
    for name in ["", "..", ".hidden", "a/b"] {
        let err = env.manager.create(name).unwrap_err();
        assert!(matches!(err, Error::InvalidName(_)), "{name:?}");
        assert_eq!(err.exit_code(), 2);
    }
    assert!(matches!(
        env.manager.create("notes.txt"),
        Err(Error::UnsupportedType { .. })
    ));
    assert!(matches!(env.manager.mount("ghost"), Err(Error::NotFound(_))));
    assert_eq!(env.manager.unmount("ghost").unwrap_err().exit_code(), 3);
}

#[test]
fn test_metadata_is_owner_only_and_removed_on_delete() {
    let env = Env::new();
    let bucket = env.manager.create("A").unwrap();
    let path = OriginMetadata::path_for(bucket.backing_path());

    let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
    assert_eq!(mode, 0o600);
    let metadata = OriginMetadata::read(bucket.backing_path()).unwrap();
    assert_eq!(metadata.origin_name, "A");
    assert_eq!(metadata.creator_tag, "originfs");
    assert_eq!(metadata.kind, OriginKind::Directory);

    env.manager.delete("A").unwrap();
    assert!(!path.exists());
}

#[test]
fn test_state_survives_reopen() {
    let env = Env::new();
    env.manager.create("A").unwrap();
    env.manager.create("photos.zip").unwrap();
    let _mount = env.manager.mount("A").unwrap();

    let reopened = open(env.dir.path(), env.provider.clone());
    let listed = reopened.list().unwrap();
    let names: Vec<_> = listed.iter().map(|o| o.name.as_str()).collect();
    assert_eq!(names, vec!["A", "photos.zip"]);
    assert!(listed[0].mounted);
    assert_eq!(listed[0].mount_path.as_deref(), Some(env.mount_path("A").as_path()));
    assert!(!listed[1].mounted);
    assert!(reopened.bucket("A").unwrap().snapshot().unwrap().mounted);
}

use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::SystemTime,
};

use filetime::FileTime;
use rstest::rstest;
use uuid::Uuid;

use remote_channel::{FileStat, LocalChannel};
use remote_shell::{
    Channel, DeletePolicy, GetOptions, MkdirOptions, PutOptions,
    RemoteError, Result, Shell, SyncOptions, SyncOutcome, WriteOptions,
};

/// Shared fault switches, visible across channel incarnations so an
/// injected failure persists through a reconnect.
#[derive(Default)]
struct Faults {
    /// Next N `write_file` calls leave a partial file and disconnect
    broken_writes: AtomicUsize,
    /// Next N operations disconnect before doing anything
    broken_ops: AtomicUsize,
    /// Next N `mkdir` calls fail with a permission error
    denied_mkdirs: AtomicUsize,
    /// How many times the opener has produced a channel
    opens: AtomicUsize,
}

fn take(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
            n.checked_sub(1)
        })
        .is_ok()
}

/// A local channel with injectable connection faults.
struct FlakyChannel {
    inner: LocalChannel,
    faults: Arc<Faults>,
}

impl FlakyChannel {
    fn gate(&self) -> Result<()> {
        if take(&self.faults.broken_ops) {
            Err(RemoteError::Disconnected(
                "injected connection loss".into(),
            ))
        } else {
            Ok(())
        }
    }
}

impl Channel for FlakyChannel {
    fn stat(&mut self, path: &Path) -> Result<FileStat> {
        self.gate()?;
        self.inner.stat(path)
    }

    fn lstat(&mut self, path: &Path) -> Result<FileStat> {
        self.gate()?;
        self.inner.lstat(path)
    }

    fn list(&mut self, path: &Path) -> Result<Vec<(PathBuf, FileStat)>> {
        self.gate()?;
        self.inner.list(path)
    }

    fn mkdir(&mut self, path: &Path, mode: u32) -> Result<()> {
        self.gate()?;
        if take(&self.faults.denied_mkdirs) {
            return Err(RemoteError::PermissionDenied(path.to_path_buf()));
        }
        self.inner.mkdir(path, mode)
    }

    fn rmdir(&mut self, path: &Path) -> Result<()> {
        self.gate()?;
        self.inner.rmdir(path)
    }

    fn remove(&mut self, path: &Path) -> Result<()> {
        self.gate()?;
        self.inner.remove(path)
    }

    fn rename(&mut self, from: &Path, to: &Path) -> Result<()> {
        self.gate()?;
        self.inner.rename(from, to)
    }

    fn readlink(&mut self, path: &Path) -> Result<PathBuf> {
        self.gate()?;
        self.inner.readlink(path)
    }

    fn symlink(&mut self, target: &Path, link: &Path) -> Result<()> {
        self.gate()?;
        self.inner.symlink(target, link)
    }

    fn chmod(&mut self, path: &Path, mode: u32) -> Result<()> {
        self.gate()?;
        self.inner.chmod(path, mode)
    }

    fn chown(&mut self, path: &Path, uid: u32, gid: u32) -> Result<()> {
        self.gate()?;
        self.inner.chown(path, uid, gid)
    }

    fn set_mtime(&mut self, path: &Path, mtime: SystemTime) -> Result<()> {
        self.gate()?;
        self.inner.set_mtime(path, mtime)
    }

    fn read_file(&mut self, path: &Path) -> Result<Vec<u8>> {
        self.gate()?;
        self.inner.read_file(path)
    }

    fn write_file(&mut self, path: &Path, data: &[u8]) -> Result<()> {
        self.gate()?;
        if take(&self.faults.broken_writes) {
            // A connection loss mid-transfer leaves a truncated file.
            self.inner.write_file(path, &data[..data.len() / 2])?;
            return Err(RemoteError::Disconnected(
                "injected connection loss mid-write".into(),
            ));
        }
        self.inner.write_file(path, data)
    }
}

fn flaky_shell(faults: &Arc<Faults>) -> Shell {
    let faults = Arc::clone(faults);
    Shell::over(Box::new(move || {
        faults.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FlakyChannel {
            inner: LocalChannel::new(),
            faults: Arc::clone(&faults),
        }) as Box<dyn Channel + Send>)
    }))
}

fn get_temp_dir() -> PathBuf {
    let mut dir_path = std::env::temp_dir();
    dir_path.push(Uuid::new_v4().to_string());
    fs::create_dir(&dir_path).expect("Could not create temp dir");
    dir_path
}

fn run_test_and_clean_up(
    test: impl FnOnce(PathBuf, PathBuf) + std::panic::UnwindSafe,
) {
    let local = get_temp_dir();
    let remote = get_temp_dir();
    let result = std::panic::catch_unwind(|| {
        test(local.clone(), remote.clone())
    });
    fs::remove_dir_all(&local).expect("Could not clean up after test");
    fs::remove_dir_all(&remote).expect("Could not clean up after test");
    if let Err(err) = result {
        std::panic::resume_unwind(err);
    }
}

fn write_file(root: &Path, relative: &str, content: &[u8]) {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("Could not create parent dirs");
    }
    fs::write(&path, content).expect("Could not write file");
}

fn set_mtime(root: &Path, relative: &str, unix_seconds: i64) {
    filetime::set_file_mtime(
        root.join(relative),
        FileTime::from_unix_time(unix_seconds, 0),
    )
    .expect("Could not set mtime");
}

fn leftover_tmp_files(dir: &Path) -> Vec<PathBuf> {
    fs::read_dir(dir)
        .expect("Could not read dir")
        .map(|entry| entry.expect("Could not read dir entry").path())
        .filter(|path| {
            path.extension().map(|ext| ext == "tmp").unwrap_or(false)
        })
        .collect()
}

#[test]
fn put_survives_one_connection_loss() {
    run_test_and_clean_up(|local, remote| {
        write_file(&local, "payload.bin", b"all twelve bytes");
        let faults = Arc::new(Faults::default());
        faults.broken_writes.store(1, Ordering::SeqCst);
        let mut shell = flaky_shell(&faults);

        shell
            .put(
                &local.join("payload.bin"),
                &remote.join("payload.bin"),
                &PutOptions::default(),
            )
            .expect("put should succeed after one reconnect");

        assert_eq!(
            fs::read(remote.join("payload.bin")).expect("dest missing"),
            b"all twelve bytes"
        );
        assert!(leftover_tmp_files(&remote).is_empty());
        assert_eq!(faults.opens.load(Ordering::SeqCst), 2);
    })
}

#[test]
fn put_gives_up_after_a_second_connection_loss() {
    run_test_and_clean_up(|local, remote| {
        write_file(&local, "payload.bin", b"never arrives");
        let faults = Arc::new(Faults::default());
        faults.broken_writes.store(2, Ordering::SeqCst);
        let mut shell = flaky_shell(&faults);

        let err = shell
            .put(
                &local.join("payload.bin"),
                &remote.join("payload.bin"),
                &PutOptions::default(),
            )
            .expect_err("put should fail after two losses");

        assert!(matches!(err, RemoteError::Connection(_)));
        // The destination itself was never touched.
        assert!(!remote.join("payload.bin").exists());
        assert_eq!(faults.opens.load(Ordering::SeqCst), 2);
    })
}

#[test]
fn stat_retries_transparently_after_a_connection_loss() {
    run_test_and_clean_up(|_local, remote| {
        write_file(&remote, "here.txt", b"x");
        let faults = Arc::new(Faults::default());
        faults.broken_ops.store(1, Ordering::SeqCst);
        let mut shell = flaky_shell(&faults);

        let stat = shell
            .stat(&remote.join("here.txt"))
            .expect("stat should succeed after a reconnect")
            .expect("file should exist");
        assert!(stat.is_file());
        assert_eq!(faults.opens.load(Ordering::SeqCst), 2);
    })
}

#[test]
fn missing_file_is_not_retried() {
    run_test_and_clean_up(|_local, remote| {
        let faults = Arc::new(Faults::default());
        let mut shell = flaky_shell(&faults);

        let err = shell
            .read_bytes(&remote.join("absent.txt"))
            .expect_err("reading a missing file should fail");
        assert!(matches!(err, RemoteError::NotFound(_)));
        // A semantic failure must not cost a reconnect.
        assert_eq!(faults.opens.load(Ordering::SeqCst), 1);
    })
}

#[test]
fn write_and_read_text_round_trip() {
    run_test_and_clean_up(|_local, remote| {
        let faults = Arc::new(Faults::default());
        let mut shell = flaky_shell(&faults);
        let path = remote.join("notes").join("today.txt");

        shell
            .write_text(&path, "rendezvous at noon", &WriteOptions::default())
            .expect("write should succeed");
        assert_eq!(
            shell.read_text(&path).expect("read should succeed"),
            "rendezvous at noon"
        );
        // Parent directories were created on demand.
        assert!(remote.join("notes").is_dir());
        assert!(leftover_tmp_files(&remote.join("notes")).is_empty());
    })
}

#[test]
fn put_replaces_an_existing_file() {
    run_test_and_clean_up(|local, remote| {
        write_file(&local, "f.txt", b"new content");
        write_file(&remote, "f.txt", b"old content");
        let faults = Arc::new(Faults::default());
        let mut shell = flaky_shell(&faults);

        shell
            .put(
                &local.join("f.txt"),
                &remote.join("f.txt"),
                &PutOptions::default(),
            )
            .expect("put should overwrite");
        assert_eq!(
            fs::read(remote.join("f.txt")).expect("dest missing"),
            b"new content"
        );
    })
}

#[test]
fn get_fetches_atomically_into_a_fresh_directory() {
    run_test_and_clean_up(|local, remote| {
        write_file(&remote, "report.csv", b"a,b\n1,2\n");
        let faults = Arc::new(Faults::default());
        let mut shell = flaky_shell(&faults);
        let dest = local.join("fetched").join("report.csv");

        shell
            .get(&remote.join("report.csv"), &dest, &GetOptions::default())
            .expect("get should succeed");
        assert_eq!(fs::read(&dest).expect("dest missing"), b"a,b\n1,2\n");
        assert!(leftover_tmp_files(&local.join("fetched")).is_empty());
    })
}

#[test]
fn mkdir_honors_exist_ok_parents_and_conflicts() {
    run_test_and_clean_up(|_local, remote| {
        let faults = Arc::new(Faults::default());
        let mut shell = flaky_shell(&faults);

        let chain = remote.join("a").join("b").join("c");
        shell
            .mkdir(
                &chain,
                &MkdirOptions {
                    parents: true,
                    ..Default::default()
                },
            )
            .expect("mkdir -p should succeed");
        assert!(chain.is_dir());

        let err = shell
            .mkdir(&chain, &MkdirOptions::default())
            .expect_err("mkdir over an existing dir should fail");
        assert!(matches!(err, RemoteError::AlreadyExists(_)));

        shell
            .mkdir(
                &chain,
                &MkdirOptions {
                    exist_ok: true,
                    ..Default::default()
                },
            )
            .expect("exist_ok should tolerate an existing dir");

        write_file(&remote, "occupied", b"");
        let err = shell
            .mkdir(
                &remote.join("occupied"),
                &MkdirOptions {
                    exist_ok: true,
                    ..Default::default()
                },
            )
            .expect_err("mkdir over a file should fail even with exist_ok");
        assert!(matches!(err, RemoteError::Conflict(_)));
    })
}

#[test]
fn exists_distinguishes_present_and_absent() {
    run_test_and_clean_up(|_local, remote| {
        write_file(&remote, "present", b"");
        let faults = Arc::new(Faults::default());
        let mut shell = flaky_shell(&faults);

        assert!(shell.exists(&remote.join("present")).expect("exists"));
        assert!(!shell.exists(&remote.join("absent")).expect("exists"));
    })
}

#[test]
fn md5_matches_known_digest_and_tolerates_missing_files() {
    run_test_and_clean_up(|_local, remote| {
        write_file(&remote, "greeting", b"hello world");
        let faults = Arc::new(Faults::default());
        let mut shell = flaky_shell(&faults);

        assert_eq!(
            shell.md5(&remote.join("greeting")).expect("md5"),
            "5eb63bbbe01eeed093cb22bb8f5acdc3"
        );

        let digests = shell
            .md5_many(&[remote.join("greeting"), remote.join("absent")])
            .expect("md5_many");
        assert_eq!(
            digests
                .get(&remote.join("greeting"))
                .expect("entry missing")
                .as_deref(),
            Some("5eb63bbbe01eeed093cb22bb8f5acdc3")
        );
        assert_eq!(
            digests.get(&remote.join("absent")).expect("entry missing"),
            &None
        );
    })
}

#[test]
fn sync_applies_creates_updates_and_deletes_in_order() {
    run_test_and_clean_up(|local, remote| {
        write_file(&local, "a.txt", b"fresh");
        set_mtime(&local, "a.txt", 2_000_000);
        write_file(&local, "b/c.txt", b"nested");
        write_file(&remote, "a.txt", b"stale");
        set_mtime(&remote, "a.txt", 1_000_000);
        write_file(&remote, "d.txt", b"extraneous");

        let faults = Arc::new(Faults::default());
        let mut shell = flaky_shell(&faults);
        let report = shell
            .sync_to_remote(
                &local,
                &remote,
                &SyncOptions {
                    delete: DeletePolicy::Before,
                    ..Default::default()
                },
            )
            .expect("sync should succeed");

        for path in ["a.txt", "b", "b/c.txt", "d.txt"] {
            assert_eq!(
                report.outcome(path),
                Some(&SyncOutcome::Applied),
                "unexpected outcome for {path}"
            );
        }
        assert_eq!(
            fs::read(remote.join("a.txt")).expect("a.txt missing"),
            b"fresh"
        );
        assert_eq!(
            fs::read(remote.join("b/c.txt")).expect("c.txt missing"),
            b"nested"
        );
        assert!(!remote.join("d.txt").exists());
    })
}

#[test]
fn sync_is_idempotent() {
    run_test_and_clean_up(|local, remote| {
        write_file(&local, "a.txt", b"content");
        write_file(&local, "sub/b.txt", b"more");
        let options = SyncOptions {
            delete: DeletePolicy::Before,
            ..Default::default()
        };

        let faults = Arc::new(Faults::default());
        let mut shell = flaky_shell(&faults);
        shell
            .sync_to_remote(&local, &remote, &options)
            .expect("first sync should succeed");

        let report = shell
            .sync_to_remote(&local, &remote, &options)
            .expect("second sync should succeed");
        assert!(
            report.all_unchanged(),
            "second sync should find nothing to do: {:?}",
            report
        );
        assert_eq!(report.len(), 3);
    })
}

#[test]
fn sync_without_delete_policy_keeps_extraneous_entries() {
    run_test_and_clean_up(|local, remote| {
        write_file(&local, "kept.txt", b"x");
        write_file(&remote, "extraneous.txt", b"y");

        let faults = Arc::new(Faults::default());
        let mut shell = flaky_shell(&faults);
        let report = shell
            .sync_to_remote(&local, &remote, &SyncOptions::default())
            .expect("sync should succeed");

        assert!(remote.join("extraneous.txt").exists());
        assert_eq!(report.outcome("extraneous.txt"), None);
    })
}

#[rstest]
#[case(DeletePolicy::Before)]
#[case(DeletePolicy::After)]
fn sync_delete_policies_converge_on_the_same_tree(
    #[case] delete: DeletePolicy,
) {
    run_test_and_clean_up(move |local, remote| {
        write_file(&local, "kept.txt", b"x");
        write_file(&remote, "extraneous.txt", b"y");
        write_file(&remote, "old_dir/leftover.txt", b"z");

        let faults = Arc::new(Faults::default());
        let mut shell = flaky_shell(&faults);
        let report = shell
            .sync_to_remote(
                &local,
                &remote,
                &SyncOptions {
                    delete,
                    ..Default::default()
                },
            )
            .expect("sync should succeed");

        assert!(remote.join("kept.txt").exists());
        assert!(!remote.join("extraneous.txt").exists());
        assert!(!remote.join("old_dir").exists());
        assert_eq!(report.failed().count(), 0);
    })
}

#[test]
fn sync_report_serializes_per_path_outcomes() {
    run_test_and_clean_up(|local, remote| {
        write_file(&local, "new.txt", b"x");
        write_file(&remote, "same.txt", b"y");
        write_file(&local, "same.txt", b"y");
        let mtime = fs::metadata(remote.join("same.txt"))
            .expect("Could not stat")
            .modified()
            .expect("Could not read mtime");
        filetime::set_file_mtime(
            local.join("same.txt"),
            FileTime::from_system_time(mtime),
        )
        .expect("Could not set mtime");

        let faults = Arc::new(Faults::default());
        let mut shell = flaky_shell(&faults);
        let report = shell
            .sync_to_remote(&local, &remote, &SyncOptions::default())
            .expect("sync should succeed");

        let json = serde_json::to_value(&report)
            .expect("report should serialize");
        assert_eq!(json["entries"]["new.txt"], "Applied");
        assert_eq!(json["entries"]["same.txt"], "Unchanged");
    })
}

#[test]
fn sync_replaces_an_entry_whose_kind_changed() {
    run_test_and_clean_up(|local, remote| {
        write_file(&local, "x", b"now a file");
        write_file(&remote, "x/child.txt", b"was a dir");

        let faults = Arc::new(Faults::default());
        let mut shell = flaky_shell(&faults);
        let report = shell
            .sync_to_remote(&local, &remote, &SyncOptions::default())
            .expect("sync should succeed");

        assert_eq!(report.outcome("x"), Some(&SyncOutcome::Applied));
        assert_eq!(
            report.outcome("x/child.txt"),
            Some(&SyncOutcome::Applied)
        );
        assert!(remote.join("x").is_file());
        assert_eq!(
            fs::read(remote.join("x")).expect("x missing"),
            b"now a file"
        );
    })
}

#[test]
fn sync_skips_everything_under_a_failed_directory() {
    run_test_and_clean_up(|local, remote| {
        write_file(&local, "ok.txt", b"fine");
        write_file(&local, "denied/inner.txt", b"unreachable");

        let faults = Arc::new(Faults::default());
        faults.denied_mkdirs.store(1, Ordering::SeqCst);
        let mut shell = flaky_shell(&faults);
        let report = shell
            .sync_to_remote(&local, &remote, &SyncOptions::default())
            .expect("sync itself should not abort");

        assert_eq!(report.outcome("ok.txt"), Some(&SyncOutcome::Applied));
        assert!(matches!(
            report.outcome("denied"),
            Some(SyncOutcome::Failed(_))
        ));
        match report.outcome("denied/inner.txt") {
            Some(SyncOutcome::Failed(reason)) => {
                assert!(
                    reason.contains("parent missing"),
                    "unexpected reason: {reason}"
                );
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(!remote.join("denied").exists());
        assert_eq!(report.failed().count(), 2);
    })
}

#[test]
fn sync_aborts_on_a_terminal_connection_failure() {
    run_test_and_clean_up(|local, remote| {
        write_file(&local, "a.txt", b"x");

        let faults = Arc::new(Faults::default());
        faults.broken_ops.store(100, Ordering::SeqCst);
        let mut shell = flaky_shell(&faults);
        let err = shell
            .sync_to_remote(&local, &remote, &SyncOptions::default())
            .expect_err("sync should abort");
        assert!(matches!(err, RemoteError::Connection(_)));
    })
}

#[cfg(unix)]
mod unix {
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    fn mode_of(path: &Path) -> u32 {
        fs::metadata(path)
            .expect("Could not stat")
            .permissions()
            .mode()
            & 0o777
    }

    fn set_mode(path: &Path, mode: u32) {
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
            .expect("Could not chmod");
    }

    #[test]
    fn put_and_get_can_preserve_permission_bits() {
        run_test_and_clean_up(|local, remote| {
            write_file(&local, "tool.sh", b"#!/bin/sh\n");
            set_mode(&local.join("tool.sh"), 0o750);
            let faults = Arc::new(Faults::default());
            let mut shell = flaky_shell(&faults);

            shell
                .put(
                    &local.join("tool.sh"),
                    &remote.join("tool.sh"),
                    &PutOptions {
                        preserve_permissions: true,
                        ..Default::default()
                    },
                )
                .expect("put should succeed");
            assert_eq!(mode_of(&remote.join("tool.sh")), 0o750);

            set_mode(&remote.join("tool.sh"), 0o604);
            shell
                .get(
                    &remote.join("tool.sh"),
                    &local.join("back.sh"),
                    &GetOptions {
                        preserve_permissions: true,
                        ..Default::default()
                    },
                )
                .expect("get should succeed");
            assert_eq!(mode_of(&local.join("back.sh")), 0o604);
        })
    }

    #[test]
    fn sync_mirrors_permission_drift_when_asked() {
        run_test_and_clean_up(|local, remote| {
            write_file(&local, "f.txt", b"same");
            let options = SyncOptions {
                preserve_permissions: true,
                ..Default::default()
            };

            let faults = Arc::new(Faults::default());
            let mut shell = flaky_shell(&faults);
            shell
                .sync_to_remote(&local, &remote, &options)
                .expect("first sync should succeed");

            set_mode(&local.join("f.txt"), 0o640);
            let report = shell
                .sync_to_remote(&local, &remote, &options)
                .expect("second sync should succeed");
            assert_eq!(
                report.outcome("f.txt"),
                Some(&SyncOutcome::Applied)
            );
            assert_eq!(mode_of(&remote.join("f.txt")), 0o640);
        })
    }

    #[test]
    fn sync_recreates_symlinks_by_target() {
        run_test_and_clean_up(|local, remote| {
            write_file(&local, "target.txt", b"t");
            std::os::unix::fs::symlink("target.txt", local.join("alias"))
                .expect("Could not create symlink");

            let faults = Arc::new(Faults::default());
            let mut shell = flaky_shell(&faults);
            shell
                .sync_to_remote(&local, &remote, &SyncOptions::default())
                .expect("sync should succeed");

            let link = fs::read_link(remote.join("alias"))
                .expect("alias should be a symlink");
            assert_eq!(link, PathBuf::from("target.txt"));

            let report = shell
                .sync_to_remote(&local, &remote, &SyncOptions::default())
                .expect("second sync should succeed");
            assert!(report.all_unchanged());
        })
    }
}

//! Integration tests for the mailbox store: incremental parsing, flags,
//! expunge, append and locking between handles.

use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, TimeZone};
use tempfile::TempDir;

use mtxbox::error::LockError;
use mtxbox::model::{FlagSet, SequenceSet, SystemFlags};
use mtxbox::store::lock::WriterLock;
use mtxbox::store::FLAG_FIELD_WIDTH;
use mtxbox::{MailboxDriver, MailboxStore, OpenOptions, StoreError, StreamState};

fn date(day: u32) -> DateTime<FixedOffset> {
    FixedOffset::east_opt(0)
        .unwrap()
        .with_ymd_and_hms(2024, 1, day, 12, 0, 0)
        .unwrap()
}

fn message(subject: &str, body: &str) -> Vec<u8> {
    format!(
        "From: Alice <alice@example.com>\r\nTo: bob@example.org\r\nSubject: {subject}\r\n\r\n{body}"
    )
    .into_bytes()
}

/// A fresh, empty mailbox with its lock files kept in the temp dir.
fn mailbox() -> (TempDir, PathBuf, OpenOptions) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("INBOX");
    MailboxStore::create(&path).unwrap();
    let opts = OpenOptions::default().with_lock_dir(dir.path());
    (dir, path, opts)
}

fn append(path: &Path, opts: &OpenOptions, text: &[u8], day: u32) {
    MailboxStore::append_to(path, text, &FlagSet::default(), Some(date(day)), opts).unwrap();
}

fn open(path: &Path, opts: &OpenOptions) -> MailboxStore {
    let mut store = MailboxStore::open(path, opts.clone()).unwrap();
    store.ping().unwrap();
    store
}

fn flag_field(path: &Path, store: &MailboxStore, msgno: u32) -> Vec<u8> {
    let data = std::fs::read(path).unwrap();
    let pos = store.entry(msgno).unwrap().flags_position() as usize;
    data[pos..pos + FLAG_FIELD_WIDTH].to_vec()
}

// ─── Incremental parsing ────────────────────────────────────────────

#[test]
fn test_ping_is_idempotent() {
    let (_dir, path, opts) = mailbox();
    append(&path, &opts, &message("one", "first\r\n"), 3);
    append(&path, &opts, &message("two", "second\r\n"), 4);

    let mut store = MailboxStore::open(&path, opts.clone()).unwrap();
    assert_eq!(store.ping().unwrap(), 2);
    let watermark = store.watermark();
    let envelope = store.fetch_envelope(2).unwrap();

    assert_eq!(store.ping().unwrap(), 0);
    assert_eq!(store.ping().unwrap(), 0);
    assert_eq!(store.exists_count(), 2);
    assert_eq!(store.watermark(), watermark);
    assert_eq!(store.fetch_envelope(2).unwrap(), envelope);

    // A message appended by another writer shows up on the next ping.
    append(&path, &opts, &message("three", "third\r\n"), 5);
    assert_eq!(store.ping().unwrap(), 1);
    assert_eq!(store.exists_count(), 3);
    assert_eq!(
        store.fetch_envelope(3).unwrap().subject.as_deref(),
        Some("three")
    );
    assert_eq!(store.watermark(), std::fs::metadata(&path).unwrap().len());
}

#[test]
fn test_recent_is_per_session() {
    let (_dir, path, opts) = mailbox();
    append(&path, &opts, &message("one", "x\r\n"), 3);

    let store = open(&path, &opts);
    assert_eq!(store.recent_count(), 1);
    drop(store);

    append(&path, &opts, &message("two", "y\r\n"), 4);
    let store = open(&path, &opts);
    assert_eq!(store.exists_count(), 2);
    assert_eq!(store.recent_count(), 1);
    assert!(!store.entry(1).unwrap().recent);
    assert!(store.entry(2).unwrap().recent);
}

// ─── Flags ──────────────────────────────────────────────────────────

#[test]
fn test_set_then_clear_restores_flag_field() {
    let (_dir, path, opts) = mailbox();
    append(&path, &opts, &message("one", "x\r\n"), 3);
    append(&path, &opts, &message("two", "y\r\n"), 4);
    // First open marks both OLD on disk.
    drop(open(&path, &opts));

    let before = std::fs::read(&path).unwrap();
    let mut store = open(&path, &opts);
    let original = flag_field(&path, &store, 2);

    let flags = FlagSet::new(SystemFlags::FLAGGED | SystemFlags::ANSWERED).with_keyword("Work");
    store.set_flags(&SequenceSet::single(2), &flags).unwrap();
    assert_ne!(flag_field(&path, &store, 2), original);
    assert_eq!(store.flags(2).unwrap(), flags);

    store.clear_flags(&SequenceSet::single(2), &flags).unwrap();
    assert_eq!(flag_field(&path, &store, 2), original);
    assert_eq!(std::fs::read(&path).unwrap(), before);
}

#[test]
fn test_flags_survive_reopen() {
    let (_dir, path, opts) = mailbox();
    for day in 3..6 {
        append(&path, &opts, &message("m", "x\r\n"), day);
    }
    let mut store = open(&path, &opts);
    store
        .set_flags(
            &SequenceSet::parse("1:2").unwrap(),
            &FlagSet::parse("(\\Seen $Forwarded)").unwrap(),
        )
        .unwrap();
    drop(store);

    let keyed = OpenOptions {
        keywords: vec!["$Forwarded".to_string()],
        ..opts.clone()
    };
    let store = open(&path, &keyed);
    assert!(store.entry(1).unwrap().has(SystemFlags::SEEN));
    assert!(store.entry(2).unwrap().has(SystemFlags::SEEN));
    assert!(!store.entry(3).unwrap().has(SystemFlags::SEEN));
    assert_eq!(store.flags(2).unwrap().keywords, vec!["$Forwarded"]);
    assert!(store.flags(3).unwrap().keywords.is_empty());
}

#[test]
fn test_fetch_text_sets_seen() {
    let (_dir, path, opts) = mailbox();
    let body = "b".repeat(98) + "\r\n";
    assert_eq!(body.len(), 100);
    append(&path, &opts, format!("Subject: x\r\n\r\n{body}").as_bytes(), 3);

    let mut store = open(&path, &opts);
    assert!(!store.entry(1).unwrap().has(SystemFlags::SEEN));
    // Header and envelope fetches leave the message unseen.
    store.fetch_header(1).unwrap();
    store.fetch_envelope(1).unwrap();
    assert_eq!(store.search("UNSEEN").unwrap(), vec![1]);

    let text = store.fetch_text(1).unwrap();
    assert_eq!(text, body.as_bytes());
    assert!(store.entry(1).unwrap().has(SystemFlags::SEEN));
    assert_eq!(store.search("UNSEEN").unwrap(), Vec::<u32>::new());
    assert_eq!(store.search("SEEN").unwrap(), vec![1]);
}

#[test]
fn test_flags_are_shared_between_handles() {
    let (_dir, path, opts) = mailbox();
    append(&path, &opts, &message("shared", "text\r\n"), 3);
    let mut a = open(&path, &opts);
    let mut b = open(&path, &opts);

    a.set_flags(&SequenceSet::single(1), &FlagSet::new(SystemFlags::FLAGGED))
        .unwrap();
    assert_eq!(b.ping().unwrap(), 0);
    assert!(b.entry(1).unwrap().has(SystemFlags::FLAGGED));
    assert_eq!(b.search("FLAGGED").unwrap(), vec![1]);

    // Neither handle has seen the other's latest change before writing.
    a.set_flags(&SequenceSet::single(1), &FlagSet::new(SystemFlags::ANSWERED))
        .unwrap();
    b.fetch_text(1).unwrap();
    a.clear_flags(&SequenceSet::single(1), &FlagSet::new(SystemFlags::FLAGGED))
        .unwrap();
    drop((a, b));

    let fresh = open(&path, &opts);
    assert_eq!(
        fresh.flags(1).unwrap().system,
        SystemFlags::ANSWERED | SystemFlags::SEEN
    );
}

// ─── Expunge ────────────────────────────────────────────────────────

#[test]
fn test_expunge_keeps_survivors_byte_identical() {
    let (_dir, path, opts) = mailbox();
    for (i, day) in (3..8).enumerate() {
        let body = format!("body {i} {}\r\n", "z".repeat(i * 40));
        append(&path, &opts, &message(&format!("m{}", i + 1), &body), day);
    }
    let opts = OpenOptions {
        copy_chunk_size: 16,
        ..opts
    };
    let mut store = open(&path, &opts);
    store
        .set_flags(
            &SequenceSet::parse("2,4").unwrap(),
            &FlagSet::new(SystemFlags::DELETED),
        )
        .unwrap();

    let data = std::fs::read(&path).unwrap();
    let survivors: Vec<Vec<u8>> = [1, 3, 5]
        .iter()
        .map(|&n| {
            let e = store.entry(n).unwrap();
            let start = e.record_offset as usize;
            data[start..start + e.record_len() as usize].to_vec()
        })
        .collect();
    let texts: Vec<Vec<u8>> = [1, 3, 5]
        .iter()
        .map(|&n| store.raw_message(n).unwrap().to_bytes())
        .collect();

    assert_eq!(store.expunge().unwrap(), vec![2, 4]);
    assert_eq!(store.exists_count(), 3);
    assert_eq!(store.state(), StreamState::ReadWrite);

    let after = std::fs::read(&path).unwrap();
    assert_eq!(after, survivors.concat());
    assert_eq!(after.len() as u64, store.watermark());
    for (i, text) in texts.iter().enumerate() {
        assert_eq!(&store.raw_message(i as u32 + 1).unwrap().to_bytes(), text);
    }
    assert_eq!(
        store.fetch_envelope(2).unwrap().subject.as_deref(),
        Some("m3")
    );

    // The compacted file reads back the same way from a new handle.
    drop(store);
    let store = open(&path, &opts);
    assert_eq!(store.exists_count(), 3);
    assert!(!store.entry(3).unwrap().has(SystemFlags::DELETED));
}

#[test]
fn test_append_then_expunge_is_a_noop() {
    let (_dir, path, opts) = mailbox();
    append(&path, &opts, &message("one", "x\r\n"), 3);
    let mut store = open(&path, &opts);
    store
        .append(&message("two", "y\r\n"), &FlagSet::default(), Some(date(4)))
        .unwrap();
    assert_eq!(store.exists_count(), 2);

    let before = std::fs::read(&path).unwrap();
    assert!(store.expunge().unwrap().is_empty());
    assert_eq!(store.exists_count(), 2);
    assert_eq!(std::fs::read(&path).unwrap(), before);
}

#[test]
fn test_expunge_everything() {
    let (_dir, path, opts) = mailbox();
    append(&path, &opts, &message("one", "x\r\n"), 3);
    append(&path, &opts, &message("two", "y\r\n"), 4);
    let mut store = open(&path, &opts);
    store
        .set_flags(&SequenceSet::all(), &FlagSet::new(SystemFlags::DELETED))
        .unwrap();
    assert_eq!(store.expunge().unwrap(), vec![1, 2]);
    assert_eq!(store.exists_count(), 0);
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);

    // Still usable afterwards.
    store
        .append(&message("three", "z\r\n"), &FlagSet::default(), None)
        .unwrap();
    assert_eq!(store.exists_count(), 1);
}

// ─── Locking between handles ────────────────────────────────────────

#[test]
fn test_concurrent_readers() {
    let (_dir, path, opts) = mailbox();
    for i in 0..10 {
        append(&path, &opts, &message(&format!("s{i}"), &format!("text {i}\r\n")), 3);
    }
    // Mark everything OLD so both readers see the same file.
    drop(open(&path, &opts));

    let handles: Vec<_> = (0..2)
        .map(|reader| {
            let path = path.clone();
            let opts = opts.clone();
            thread::spawn(move || {
                let mut store = open(&path, &opts);
                for round in 0..5 {
                    for msgno in 1..=10u32 {
                        let env = store.fetch_envelope(msgno).unwrap();
                        assert_eq!(env.subject, Some(format!("s{}", msgno - 1)));
                        if (msgno + reader) % 2 == 0 && round == 0 {
                            let text = store.fetch_text(msgno).unwrap();
                            assert_eq!(text, format!("text {}\r\n", msgno - 1).into_bytes());
                        }
                    }
                }
                store.exists_count()
            })
        })
        .collect();
    for h in handles {
        assert_eq!(h.join().unwrap(), 10);
    }

    let store = open(&path, &opts);
    for msgno in 1..=10 {
        assert!(store.entry(msgno).unwrap().has(SystemFlags::SEEN));
    }
}

#[test]
fn test_expunge_refused_while_another_handle_is_open() {
    let (_dir, path, opts) = mailbox();
    append(&path, &opts, &message("one", "x\r\n"), 3);
    let mut writer = open(&path, &opts);
    let reader = open(
        &path,
        &OpenOptions {
            readonly: true,
            ..opts.clone()
        },
    );
    writer
        .set_flags(&SequenceSet::single(1), &FlagSet::new(SystemFlags::DELETED))
        .unwrap();

    assert!(matches!(
        writer.expunge(),
        Err(StoreError::Lock(LockError::InUse(_)))
    ));
    // The failed attempt leaves the writer usable.
    assert_eq!(writer.state(), StreamState::ReadWrite);
    assert_eq!(writer.exists_count(), 1);

    drop(reader);
    assert_eq!(writer.expunge().unwrap(), vec![1]);
}

#[test]
fn test_writer_lock_is_exclusive() {
    let (_dir, path, opts) = mailbox();
    append(&path, &opts, &message("one", "x\r\n"), 3);
    let mut store = open(&path, &opts);
    store
        .set_flags(&SequenceSet::single(1), &FlagSet::new(SystemFlags::DELETED))
        .unwrap();

    let held = WriterLock::acquire(store.lock_path()).unwrap();
    assert!(WriterLock::try_acquire(store.lock_path()).unwrap().is_none());
    assert!(matches!(
        store.expunge(),
        Err(StoreError::Lock(LockError::Busy(_)))
    ));

    // An append waits for the lock rather than failing.
    let len = std::fs::metadata(&path).unwrap().len();
    let appender = {
        let path = path.clone();
        let opts = opts.clone();
        thread::spawn(move || append(&path, &opts, &message("two", "y\r\n"), 4))
    };
    thread::sleep(Duration::from_millis(100));
    assert_eq!(std::fs::metadata(&path).unwrap().len(), len);

    drop(held);
    appender.join().unwrap();
    assert_eq!(store.ping().unwrap(), 1);
    assert_eq!(store.expunge().unwrap(), vec![1]);
    assert_eq!(store.exists_count(), 1);
}

// ─── Copy, append and the driver interface ─────────────────────────

#[test]
fn test_copy_preserves_flags_and_dates() {
    let (dir, path, opts) = mailbox();
    append(&path, &opts, &message("one", "x\r\n"), 3);
    append(&path, &opts, &message("two", "y\r\n"), 4);
    let dest = dir.path().join("Archive");
    MailboxStore::create(&dest).unwrap();

    let mut store = open(&path, &opts);
    store
        .set_flags(
            &SequenceSet::single(2),
            &FlagSet::new(SystemFlags::FLAGGED).with_keyword("Work"),
        )
        .unwrap();
    assert_eq!(store.copy(&SequenceSet::parse("2").unwrap(), &dest).unwrap(), 1);

    // Keyword names live in configuration, not in the file.
    let keyed = OpenOptions {
        keywords: vec!["Work".to_string()],
        ..opts.clone()
    };
    let mut archive = open(&dest, &keyed);
    assert_eq!(archive.exists_count(), 1);
    let entry = archive.entry(1).unwrap();
    assert_eq!(entry.internal_date, date(4));
    assert!(entry.has(SystemFlags::FLAGGED));
    assert_eq!(archive.flags(1).unwrap().keywords, vec!["Work"]);
    assert_eq!(
        archive.raw_message(1).unwrap().to_bytes(),
        store.raw_message(2).unwrap().to_bytes()
    );

    // A bad sequence copies nothing.
    let len = std::fs::metadata(&dest).unwrap().len();
    assert!(matches!(
        store.copy(&SequenceSet::parse("1:9").unwrap(), &dest),
        Err(StoreError::NoSuchMessage(9))
    ));
    assert_eq!(std::fs::metadata(&dest).unwrap().len(), len);
}

#[test]
fn test_driver_interface() {
    fn exercise<D: MailboxDriver>(path: &Path, opts: OpenOptions) {
        let mut driver = D::open(path, opts).unwrap();
        assert_eq!(driver.exists_count(), 0);
        assert_eq!(driver.ping().unwrap(), 1);
        driver
            .append(&message("two", "y\r\n"), &FlagSet::default(), Some(date(5)))
            .unwrap();
        assert_eq!(driver.exists_count(), 2);
        assert_eq!(driver.recent_count(), 2);
        assert_eq!(driver.fetch_body(2).unwrap().mime_type(), "text/plain");
        assert_eq!(driver.fetch_body_part(2, "1").unwrap(), b"y\r\n");
        assert_eq!(driver.search("SEEN").unwrap(), vec![2]);
        driver
            .set_flags(&SequenceSet::single(1), &FlagSet::new(SystemFlags::DELETED))
            .unwrap();
        assert_eq!(driver.expunge().unwrap(), vec![1]);
        driver.close();
        assert!(matches!(driver.ping(), Err(StoreError::Closed)));
    }

    let (_dir, path, opts) = mailbox();
    append(&path, &opts, &message("one", "x\r\n"), 3);
    exercise::<MailboxStore>(&path, opts);
}

#[test]
fn test_tenex_mailbox() {
    let (_dir, path, opts) = mailbox();
    let opts = OpenOptions {
        create_format: mtxbox::store::RecordFormat::Tenex,
        ..opts
    };
    append(&path, &opts, b"Subject: unix\n\nline\n", 3);
    let data = std::fs::read(&path).unwrap();
    assert!(data.starts_with(b" 3-Jan-2024 12:00:00 +0000,20;000000000000\n"));

    let mut store = open(&path, &opts);
    assert_eq!(store.format(), Some(mtxbox::store::RecordFormat::Tenex));
    assert_eq!(store.fetch_text(1).unwrap(), b"line\n");
    assert_eq!(store.fetch_header(1).unwrap(), b"Subject: unix\n\n");
}

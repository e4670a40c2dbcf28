use capturefile::{CaptureFile, CaptureFileError};
use tempfile::tempdir;

#[test]
fn only_one_write_handle_per_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("exclusive.capture");

    let mut writer = CaptureFile::create(&path, None).unwrap();
    let second = CaptureFile::open_for_write(&path);
    assert!(matches!(second, Err(CaptureFileError::AlreadyOpen(_))));

    // Closing the first handle frees the file for the next writer.
    writer.close();
    let mut writer = CaptureFile::open_for_write(&path).unwrap();
    writer.add_record(b"after handover").unwrap();
    writer.commit().unwrap();
}

#[test]
fn opening_an_open_handle_is_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("double_open.capture");

    let mut cf = CaptureFile::create(&path, None).unwrap();
    assert!(matches!(cf.open(true), Err(CaptureFileError::AlreadyOpen(_))));
    assert!(matches!(cf.open(false), Err(CaptureFileError::AlreadyOpen(_))));
}

#[test]
fn readers_run_alongside_a_writer_and_refresh_to_its_commits() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("shared.capture");

    let mut writer = CaptureFile::create(&path, None).unwrap();
    let mut reader_one = CaptureFile::open_for_read(&path).unwrap();
    let mut reader_two = CaptureFile::open_for_read(&path).unwrap();
    assert_eq!(reader_one.record_count(), 0);

    for n in 0..10 {
        writer.add_record(format!("record {n}").as_bytes()).unwrap();
    }
    writer.commit().unwrap();

    // Nothing moves on a reader until it refreshes.
    assert_eq!(reader_one.record_count(), 0);
    reader_one.refresh().unwrap();
    assert_eq!(reader_one.record_count(), 10);
    assert_eq!(reader_one.record_at(10).unwrap(), b"record 9");

    reader_two.refresh().unwrap();
    assert_eq!(reader_two.record_count(), 10);
}

#[test]
fn read_handles_cannot_mutate() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("readonly.capture");

    CaptureFile::create(&path, None).unwrap().close();
    let mut reader = CaptureFile::open_for_read(&path).unwrap();
    assert!(matches!(reader.add_record(b"r"), Err(CaptureFileError::NotOpenForWrite(_))));
    assert!(matches!(reader.set_metadata(Some(b"m".as_slice())), Err(CaptureFileError::NotOpenForWrite(_))));
    assert!(matches!(reader.commit(), Err(CaptureFileError::NotOpenForWrite(_))));
}

#[test]
fn uncommitted_appends_are_invisible_to_readers() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("invisible.capture");

    let mut writer = CaptureFile::create(&path, None).unwrap();
    writer.add_record(b"pending").unwrap();

    let mut reader = CaptureFile::open_for_read(&path).unwrap();
    assert_eq!(reader.record_count(), 0);
    reader.refresh().unwrap();
    assert_eq!(reader.record_count(), 0);

    writer.commit().unwrap();
    reader.refresh().unwrap();
    assert_eq!(reader.record_count(), 1);
}

#[test]
fn dropping_a_writer_releases_the_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("dropped.capture");

    {
        let _writer = CaptureFile::create(&path, None).unwrap();
        assert!(matches!(
            CaptureFile::open_for_write(&path),
            Err(CaptureFileError::AlreadyOpen(_))
        ));
    }
    // Drop released the registry entry and the OS lock.
    CaptureFile::open_for_write(&path).unwrap();
}

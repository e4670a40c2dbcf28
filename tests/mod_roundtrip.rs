use capturefile::CaptureFile;
use proptest::collection::vec;
use proptest::prelude::*;
use tempfile::tempdir;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Whatever mix of record sizes and commit cadence is thrown at a
    /// capture file, a reopen returns every record byte-for-byte, in order,
    /// through both access paths.
    #[test]
    fn committed_records_round_trip(
        records in vec(vec(any::<u8>(), 0..96), 1..120),
        commit_every in 1usize..20,
    ) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("roundtrip.capture");

        let mut cf = CaptureFile::create(&path, None).unwrap();
        for (index, record) in records.iter().enumerate() {
            let count = cf.add_record(record).unwrap();
            prop_assert_eq!(count, index as u64 + 1);
            if (index + 1) % commit_every == 0 {
                cf.commit().unwrap();
            }
        }
        cf.commit().unwrap();
        cf.close();

        let cf = CaptureFile::open_for_read(&path).unwrap();
        prop_assert_eq!(cf.record_count(), records.len() as u64);
        for (index, expected) in records.iter().enumerate() {
            prop_assert_eq!(&cf.record_at(index as u64 + 1).unwrap(), expected);
        }
        let streamed: Vec<_> = cf.iter().unwrap().map(Result::unwrap).collect();
        prop_assert_eq!(streamed, records);
    }
}

use std::{
    fs::{self, OpenOptions},
    path::Path,
};
use trigq::{
    cursor::put_u32,
    format::{GlobalHeader, BLOCK_HEADER_SIZE, EVENT_HEADER_SIZE, GLOBAL_HEADER_SIZE},
    BlockCompressor, BlockType, EventReader, EventWriter, RawEvent, StorageError, WriterSettings,
};

fn settings(dir: &Path, max_events_per_file: u32) -> WriterSettings {
    WriterSettings {
        output_dir: dir.to_path_buf(),
        base_name: "run".to_string(),
        run_id: 7,
        max_file_size: 1 << 30,
        max_events_per_file,
        compression_level: 6,
        write_config_snapshot: false,
    }
}

fn make_event(id: u32) -> RawEvent {
    let mut event = RawEvent::with_identity(id, 1000 + id, 7);
    let index = event.add_block(BlockType::Digitizer, 100 + id as usize * 10);
    for (i, byte) in event.get_block_mut(index).unwrap().bytes_mut().iter_mut().enumerate() {
        *byte = (i as u32 * (id + 1) % 251) as u8;
    }
    if id % 2 == 0 {
        let index = event.add_block(BlockType::Simulated, 32);
        event.get_block_mut(index).unwrap().bytes_mut().fill(id as u8);
    }
    event
}

fn write_series(dir: &Path, ids: impl IntoIterator<Item = u32>, max_events_per_file: u32) {
    let mut writer = EventWriter::new(settings(dir, max_events_per_file));
    writer.initialize().unwrap();
    for id in ids {
        writer.process(&make_event(id)).unwrap();
    }
    writer.finalize(None).unwrap();
}

fn assert_same(read: &RawEvent, written: &RawEvent) {
    assert_eq!(read.event_id(), written.event_id());
    assert_eq!(read.timestamp(), written.timestamp());
    assert_eq!(read.run_id(), written.run_id());
    assert_eq!(read.block_count(), written.block_count());
    for (a, b) in read.blocks().iter().zip(written.blocks()) {
        assert_eq!(a.block_type(), b.block_type());
        assert_eq!(a.bytes(), b.bytes());
    }
}

fn file_header(path: &Path) -> GlobalHeader {
    GlobalHeader::decode(&fs::read(path).unwrap()).unwrap()
}

#[test]
fn events_survive_the_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    write_series(dir.path(), 1..=20, 0);

    let mut reader = EventReader::open(dir.path().join("run.000.out")).unwrap();
    assert_eq!(reader.global_header().unwrap().run_id, 7);
    for id in 1..=20 {
        let event = reader.get_next_event().unwrap().unwrap();
        assert_same(&event, &make_event(id));
    }
    assert!(reader.get_next_event().unwrap().is_none());
    assert!(reader.eof());
    assert!(reader.is_ok());
}

#[test]
fn index_and_id_lookups_agree() {
    let dir = tempfile::tempdir().unwrap();
    write_series(dir.path(), 100..110, 4);

    let mut by_index = EventReader::open(dir.path().join("run")).unwrap();
    let mut by_id = EventReader::open(dir.path().join("run")).unwrap();
    for index in [5u64, 2, 9, 0, 6] {
        let a = by_index.get_event_with_index(index).unwrap().unwrap();
        let b = by_id.get_event_with_id(a.event_id()).unwrap().unwrap();
        assert_eq!(a.event_id(), 100 + index as u32);
        assert_same(&a, &b);
    }
    assert!(by_index.get_event_with_index(10).unwrap().is_none());
    assert!(by_id.get_event_with_id(500).unwrap().is_none());

    // id 0 rewinds to the first event of the series
    let first = by_id.get_event_with_id(0).unwrap().unwrap();
    assert_eq!(first.event_id(), 100);
}

#[test]
fn series_splits_on_event_limit() {
    let dir = tempfile::tempdir().unwrap();
    write_series(dir.path(), 1..=10, 3);

    let mut next_min = 1;
    for index in 0..4u32 {
        let path = dir.path().join(format!("run.{:03}.out", index));
        let header = file_header(&path);
        assert_eq!(header.file_index, index);
        assert_eq!(header.file_size as u64, fs::metadata(&path).unwrap().len());
        assert_eq!(header.event_id_min, next_min);
        assert_eq!(header.nevents, if index < 3 { 3 } else { 1 });
        assert_eq!(header.event_id_max, header.event_id_min + header.nevents - 1);
        assert!(header.end_time >= header.start_time);
        next_min = header.event_id_max + 1;
    }
    assert!(!dir.path().join("run.004.out").exists());

    let mut reader = EventReader::open(dir.path()).unwrap();
    let mut ids = Vec::new();
    while let Some(event) = reader.get_next_event().unwrap() {
        ids.push(event.event_id());
    }
    assert_eq!(ids, (1..=10).collect::<Vec<_>>());
    assert_eq!(reader.file_index(), 4);
}

#[test]
fn id_lookup_skips_files_by_header() {
    let dir = tempfile::tempdir().unwrap();
    write_series(dir.path(), 0..4, 2);
    let first = dir.path().join("run.000.out");
    let second = dir.path().join("run.001.out");
    assert_eq!(
        (file_header(&first).event_id_min, file_header(&first).event_id_max),
        (0, 1)
    );
    assert_eq!(
        (file_header(&second).event_id_min, file_header(&second).event_id_max),
        (2, 3)
    );

    // break the compressed stream of the first record in file 0
    let mut bytes = fs::read(&first).unwrap();
    let payload = (GLOBAL_HEADER_SIZE + EVENT_HEADER_SIZE + BLOCK_HEADER_SIZE) as usize;
    bytes[payload..payload + 4].fill(0xff);
    fs::write(&first, &bytes).unwrap();

    let mut reader = EventReader::open(dir.path().join("run")).unwrap();
    let event = reader.get_event_with_id(3).unwrap().unwrap();
    assert_same(&event, &make_event(3));
    assert_eq!(reader.file_index(), 1);
    assert_eq!(reader.position(), 4);

    // reading sequentially does hit the damage, and the reader stays failed
    let mut reader = EventReader::open(dir.path().join("run")).unwrap();
    assert!(reader.get_next_event().is_err());
    assert!(!reader.is_ok());
    assert!(matches!(
        reader.get_next_event(),
        Err(StorageError::InvalidState(_))
    ));
}

#[test]
fn last_event_of_a_series() {
    let dir = tempfile::tempdir().unwrap();
    write_series(dir.path(), 0..4, 2);

    let mut reader = EventReader::open(dir.path().join("run")).unwrap();
    assert_eq!(reader.get_next_event().unwrap().unwrap().event_id(), 0);
    let last = reader.get_last_event().unwrap().unwrap();
    assert_same(&last, &make_event(3));
    assert!(reader.get_next_event().unwrap().is_none());

    // going backwards after the end rewinds
    let event = reader.get_event_with_index(1).unwrap().unwrap();
    assert_eq!(event.event_id(), 1);
}

#[test]
fn legacy_files_without_global_header() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("old.dat");
    let mut compressor = BlockCompressor::new(6);
    let mut bytes = Vec::new();
    for id in [7u32, 8] {
        let data: Vec<u8> = (0..200u32).map(|i| (i * id) as u8).collect();
        let packed = compressor.compress(&data).unwrap().to_vec();
        put_u32(&mut bytes, 12 + packed.len() as u32);
        put_u32(&mut bytes, id);
        put_u32(&mut bytes, 5000 + id);
        bytes.extend_from_slice(&packed);
    }
    fs::write(&path, &bytes).unwrap();

    let mut reader = EventReader::open(&path).unwrap();
    assert!(reader.global_header().unwrap().is_legacy());
    let event = reader.get_event_with_id(8).unwrap().unwrap();
    assert_eq!(event.timestamp(), 5008);
    assert_eq!(event.block_count(), 1);
    let block = event.get_block(0).unwrap();
    assert_eq!(block.block_type(), BlockType::Digitizer);
    assert_eq!(block.bytes(), (0..200u32).map(|i| (i * 8) as u8).collect::<Vec<_>>());

    let first = reader.get_event_with_index(0).unwrap().unwrap();
    assert_eq!(first.event_id(), 7);
}

#[test]
fn newer_header_versions_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    write_series(dir.path(), 1..3, 0);
    let path = dir.path().join("run.000.out");
    let mut bytes = fs::read(&path).unwrap();
    bytes[8..12].copy_from_slice(&2u32.to_le_bytes());
    fs::write(&path, &bytes).unwrap();

    assert!(matches!(
        EventReader::open(&path),
        Err(StorageError::UnsupportedHeader { version: 2, .. })
    ));
}

#[test]
fn truncated_record_is_a_short_read() {
    let dir = tempfile::tempdir().unwrap();
    write_series(dir.path(), 1..=3, 0);
    let path = dir.path().join("run.000.out");
    let len = fs::metadata(&path).unwrap().len();
    OpenOptions::new()
        .write(true)
        .open(&path)
        .unwrap()
        .set_len(len - 5)
        .unwrap();

    let mut reader = EventReader::open(&path).unwrap();
    assert!(reader.get_next_event().unwrap().is_some());
    assert!(reader.get_next_event().unwrap().is_some());
    assert!(matches!(
        reader.get_next_event(),
        Err(StorageError::ShortRead { .. })
    ));
    assert!(!reader.is_ok());

    // skipping over the damaged record without decoding it
    let mut reader = EventReader::open(&path).unwrap();
    assert!(matches!(
        reader.get_event_with_index(3),
        Err(StorageError::ShortRead { got, .. }) if got > 0
    ));
    assert!(!reader.is_ok());
}

#[test]
fn series_is_found_from_partial_paths() {
    let dir = tempfile::tempdir().unwrap();
    write_series(dir.path(), 1..=4, 2);

    for path in [
        dir.path().to_path_buf(),
        dir.path().join("run"),
        dir.path().join("run.out"),
        dir.path().join("run.000.out"),
    ] {
        let mut reader = EventReader::open(&path).unwrap();
        assert_eq!(reader.get_next_event().unwrap().unwrap().event_id(), 1);
        assert_eq!(reader.current_file(), Some(dir.path().join("run.000.out").as_path()));
    }

    // naming a later file starts the series there
    let mut reader = EventReader::open(dir.path().join("run.001.out")).unwrap();
    assert_eq!(reader.get_next_event().unwrap().unwrap().event_id(), 3);
    assert_eq!(reader.get_event_with_index(0).unwrap().unwrap().event_id(), 3);
}

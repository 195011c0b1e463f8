use crate::compression::BlockCompressor;
use crate::config::RunSettings;
use crate::event::now_seconds;
use crate::format::{BlockHeader, EventHeader, GlobalHeader, BLOCK_HEADER_SIZE, EVENT_HEADER_SIZE};
use crate::{RawEvent, StorageError};
use log::{error, info};
use std::{
    ffi::OsString,
    fs::{self, File},
    io::{BufWriter, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

#[derive(Clone, Debug)]
pub struct WriterSettings {
    pub output_dir: PathBuf,
    /// File name stem; a trailing `.out` is dropped.
    pub base_name: String,
    pub run_id: u32,
    /// Bytes per file before rolling over.
    pub max_file_size: u64,
    /// Events per file before rolling over, 0 for no limit.
    pub max_events_per_file: u32,
    pub compression_level: u32,
    pub write_config_snapshot: bool,
}

impl WriterSettings {
    pub fn from_run(run: &RunSettings) -> Self {
        Self {
            output_dir: PathBuf::from(&run.output_dir),
            base_name: run.base_name.clone(),
            run_id: run.run_id,
            max_file_size: run.max_file_size,
            max_events_per_file: run.max_events_per_file,
            compression_level: run.compression_level,
            write_config_snapshot: run.write_config_snapshot,
        }
    }
}

/// Path of file `index` of the series rooted at `base`.
pub fn series_file(base: &Path, index: u32) -> PathBuf {
    let mut name = OsString::from(base.as_os_str());
    name.push(format!(".{:03}.out", index));
    PathBuf::from(name)
}

struct OpenFile {
    out: BufWriter<File>,
    path: PathBuf,
    header: GlobalHeader,
}

/// Appends events to a rotating series of compressed container files.
///
/// Each file starts with a placeholder global header that is rewritten with
/// the final statistics when the file is closed. After the first error the
/// writer refuses further work.
pub struct EventWriter {
    settings: WriterSettings,
    base: PathBuf,
    file: Option<OpenFile>,
    file_index: u32,
    compressor: BlockCompressor,
    record: Vec<u8>,
    bytes_written: u64,
    events_written: u64,
    ok: bool,
}

impl EventWriter {
    pub fn new(settings: WriterSettings) -> Self {
        let base_name = settings
            .base_name
            .strip_suffix(".out")
            .unwrap_or(&settings.base_name)
            .to_string();
        Self {
            base: settings.output_dir.join(base_name),
            compressor: BlockCompressor::new(settings.compression_level),
            settings,
            file: None,
            file_index: 0,
            record: Vec::new(),
            bytes_written: 0,
            events_written: 0,
            ok: true,
        }
    }

    /// Create the output directory and open file 0.
    pub fn initialize(&mut self) -> Result<(), StorageError> {
        let result = self.reopen_series();
        self.check(result)
    }

    fn reopen_series(&mut self) -> Result<(), StorageError> {
        self.close_file()?;
        fs::create_dir_all(&self.settings.output_dir)?;
        self.file_index = 0;
        self.bytes_written = 0;
        self.events_written = 0;
        self.open_file()
    }

    /// Compress and append one event, rolling over to the next file first
    /// when the record would push the current one past its limits.
    pub fn process(&mut self, event: &RawEvent) -> Result<(), StorageError> {
        if !self.ok {
            return Err(StorageError::InvalidState("writer failed earlier"));
        }
        if self.file.is_none() {
            return Err(StorageError::InvalidState("writer not initialized"));
        }
        let result = self.append(event);
        self.check(result)
    }

    fn append(&mut self, event: &RawEvent) -> Result<(), StorageError> {
        self.encode_record(event)?;
        let size = self.record.len() as u64;

        let rotate = match &self.file {
            Some(file) => {
                let header = &file.header;
                let too_big = header.file_size as u64 + size > self.settings.max_file_size;
                let too_many = self.settings.max_events_per_file > 0
                    && header.nevents >= self.settings.max_events_per_file;
                header.nevents > 0 && (too_big || too_many)
            }
            None => false,
        };
        if rotate {
            self.close_file()?;
            self.file_index += 1;
            self.open_file()?;
        }

        let file = self
            .file
            .as_mut()
            .ok_or(StorageError::InvalidState("no open file"))?;
        file.out.write_all(&self.record)?;
        file.header.record_event(event.event_id(), size as u32);
        self.bytes_written += size;
        self.events_written += 1;
        Ok(())
    }

    fn encode_record(&mut self, event: &RawEvent) -> Result<(), StorageError> {
        self.record.clear();
        EventHeader {
            event_size: 0,
            event_id: event.event_id(),
            timestamp: event.timestamp(),
            nblocks: event.block_count() as u32,
        }
        .encode(&mut self.record);

        for block in event.blocks() {
            let packed = self.compressor.compress(block.bytes())?;
            BlockHeader {
                total_blocksize_disk: packed.len() as u32 + BLOCK_HEADER_SIZE,
                datasize: block.size(),
                block_type: block.block_type() as u32,
            }
            .encode(&mut self.record);
            self.record.extend_from_slice(packed);
        }

        let size = self.record.len() as u32;
        self.record[..4].copy_from_slice(&size.to_le_bytes());
        debug_assert!(self.record.len() >= EVENT_HEADER_SIZE as usize);
        Ok(())
    }

    /// Close the current file and, when enabled, write `snapshot` as
    /// `<base>.cfg` next to the data.
    pub fn finalize(&mut self, snapshot: Option<&str>) -> Result<(), StorageError> {
        let result = self.close_file();
        self.check(result)?;
        if let (true, Some(text)) = (self.settings.write_config_snapshot, snapshot) {
            let mut name = OsString::from(self.base.as_os_str());
            name.push(".cfg");
            let result = fs::write(PathBuf::from(name), text).map_err(StorageError::from);
            self.check(result)?;
        }
        Ok(())
    }

    fn open_file(&mut self) -> Result<(), StorageError> {
        let path = series_file(&self.base, self.file_index);
        let header = GlobalHeader::blank(self.settings.run_id, self.file_index, now_seconds());
        let mut out = BufWriter::new(File::create(&path)?);
        out.write_all(&header.encode())?;
        info!("Writing events to {}", path.display());
        self.file = Some(OpenFile { out, path, header });
        Ok(())
    }

    fn close_file(&mut self) -> Result<(), StorageError> {
        let Some(mut file) = self.file.take() else {
            return Ok(());
        };
        file.header.end_time = now_seconds();
        file.out.seek(SeekFrom::Start(0))?;
        file.out.write_all(&file.header.encode())?;
        file.out.flush()?;
        info!(
            "Closed {}: {} events, ids {}..={}, {} bytes",
            file.path.display(),
            file.header.nevents,
            file.header.event_id_min,
            file.header.event_id_max,
            file.header.file_size
        );
        Ok(())
    }

    fn check<T>(&mut self, result: Result<T, StorageError>) -> Result<T, StorageError> {
        if let Err(e) = &result {
            error!("Event writer failed: {}", e);
            self.ok = false;
        }
        result
    }

    pub fn current_filename(&self) -> Option<&Path> {
        self.file.as_ref().map(|f| f.path.as_path())
    }

    pub fn file_index(&self) -> u32 {
        self.file_index
    }

    /// Bytes of event records written in this series, headers excluded.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn events_written(&self) -> u64 {
        self.events_written
    }

    pub fn is_ok(&self) -> bool {
        self.ok
    }
}

impl Drop for EventWriter {
    fn drop(&mut self) {
        if let Err(e) = self.close_file() {
            error!("Could not close event file: {}", e);
        }
    }
}

//! Reading event container files back.
//!
//! A reader follows a whole series (`<base>.000.out`, `<base>.001.out`, ...)
//! and also accepts single files, including files written before the
//! global header existed.

use crate::compression::decompress;
use crate::event::{BlockType, DataBlock};
use crate::format::{BlockHeader, EventHeader, GlobalHeader, BLOCK_HEADER_SIZE, GLOBAL_HEADER_SIZE, MAGIC};
use crate::writer::series_file;
use crate::{RawEvent, StorageError};
use log::{debug, error, info};
use std::{
    ffi::OsString,
    fs::{self, File},
    io::{self, BufReader, Read, Seek, SeekFrom},
    path::{Path, PathBuf},
};

#[derive(Clone, Debug, PartialEq)]
enum Series {
    /// A lone file outside any indexed series.
    Single(PathBuf),
    /// `<base>.NNN.out` files starting at `first`.
    Indexed { base: PathBuf, first: u32 },
}

struct OpenFile {
    input: BufReader<File>,
    path: PathBuf,
    header: GlobalHeader,
    /// Records consumed from this file so far.
    events_read: u32,
}

/// Sequential and keyed access to a series of event files.
///
/// Compressed records cannot be seeked backwards, so requests for an
/// earlier event reopen the series from its first file. After the first
/// read error the reader refuses further work.
pub struct EventReader {
    series: Series,
    file: Option<OpenFile>,
    file_index: u32,
    /// Overall index of the next record.
    position: u64,
    last_id: Option<u32>,
    eof: bool,
    ok: bool,
}

impl EventReader {
    /// Open `path` as a file, a series prefix, or a directory holding a series.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let series = find_series(path)?;
        let mut reader = Self {
            file_index: series_start(&series),
            series,
            file: None,
            position: 0,
            last_id: None,
            eof: false,
            ok: true,
        };
        match reader.open_current() {
            Ok(true) => Ok(reader),
            Ok(false) => Err(StorageError::NotFound(path.display().to_string())),
            Err(e) => {
                error!("Could not open {}: {}", path.display(), e);
                Err(e)
            }
        }
    }

    /// Read the next event of the series, or `None` at its end.
    pub fn get_next_event(&mut self) -> Result<Option<RawEvent>, StorageError> {
        self.ready()?;
        let result = self.next_record(|_| true);
        self.check(result)
            .map(|record| record.and_then(|(_, event)| event))
    }

    /// The `index`-th event of the series, counting from 0.
    pub fn get_event_with_index(&mut self, index: u64) -> Result<Option<RawEvent>, StorageError> {
        self.ready()?;
        if index < self.position {
            let result = self.reset();
            self.check(result)?;
        }
        while self.position < index {
            let result = self.next_record(|_| false);
            if self.check(result)?.is_none() {
                return Ok(None);
            }
        }
        self.get_next_event()
    }

    /// The event with `event_id`. An id of 0 rewinds and returns the first
    /// event. Files whose id range cannot hold the id are skipped unread.
    pub fn get_event_with_id(&mut self, event_id: u32) -> Result<Option<RawEvent>, StorageError> {
        self.ready()?;
        if event_id == 0 {
            let result = self.reset();
            self.check(result)?;
            return self.get_next_event();
        }
        if self.last_id.is_some_and(|last| event_id <= last) {
            let result = self.reset();
            self.check(result)?;
        }
        let result = self.seek_id(event_id);
        self.check(result)
    }

    fn seek_id(&mut self, event_id: u32) -> Result<Option<RawEvent>, StorageError> {
        loop {
            let skip_file = match &self.file {
                Some(file) => !file.header.may_contain(event_id),
                None => return Ok(None),
            };
            if skip_file {
                self.skip_file()?;
                continue;
            }
            match self.next_record(|header| header.event_id == event_id)? {
                Some((_, Some(event))) => return Ok(Some(event)),
                Some((_, None)) => {}
                None => return Ok(None),
            }
        }
    }

    /// The last event of the series.
    ///
    /// Scans every record header first, then fetches the last id found, so
    /// only one event body is ever held.
    pub fn get_last_event(&mut self) -> Result<Option<RawEvent>, StorageError> {
        self.ready()?;
        let result = self.reset();
        self.check(result)?;
        let mut last = None;
        loop {
            let result = self.next_record(|_| false);
            match self.check(result)? {
                Some((header, _)) => last = Some(header.event_id),
                None => break,
            }
        }
        match last {
            Some(event_id) => {
                let result = self.reset();
                self.check(result)?;
                let result = self.seek_id(event_id);
                self.check(result)
            }
            None => Ok(None),
        }
    }

    /// True once the last file of the series is exhausted.
    pub fn eof(&self) -> bool {
        self.eof
    }

    pub fn is_ok(&self) -> bool {
        self.ok
    }

    /// Header of the file currently being read.
    pub fn global_header(&self) -> Option<&GlobalHeader> {
        self.file.as_ref().map(|f| &f.header)
    }

    pub fn current_file(&self) -> Option<&Path> {
        self.file.as_ref().map(|f| f.path.as_path())
    }

    pub fn file_index(&self) -> u32 {
        self.file_index
    }

    /// Overall index of the next event.
    pub fn position(&self) -> u64 {
        self.position
    }

    fn ready(&self) -> Result<(), StorageError> {
        if self.ok {
            Ok(())
        } else {
            Err(StorageError::InvalidState("reader failed earlier"))
        }
    }

    fn check<T>(&mut self, result: Result<T, StorageError>) -> Result<T, StorageError> {
        if let Err(e) = &result {
            error!("Event reader failed: {}", e);
            self.ok = false;
            self.file = None;
        }
        result
    }

    fn reset(&mut self) -> Result<(), StorageError> {
        debug!("Rewinding to the first file");
        self.file_index = series_start(&self.series);
        self.position = 0;
        self.last_id = None;
        self.eof = false;
        if self.open_current()? {
            Ok(())
        } else {
            Err(StorageError::NotFound(
                self.path_for(self.file_index).display().to_string(),
            ))
        }
    }

    fn path_for(&self, index: u32) -> PathBuf {
        match &self.series {
            Series::Single(path) => path.clone(),
            Series::Indexed { base, .. } => series_file(base, index),
        }
    }

    /// Open file `file_index`. Returns false when it does not exist.
    fn open_current(&mut self) -> Result<bool, StorageError> {
        self.file = None;
        let path = self.path_for(self.file_index);
        let handle = match File::open(&path) {
            Ok(handle) => handle,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let mut input = BufReader::new(handle);
        let mut raw = [0u8; GLOBAL_HEADER_SIZE as usize];
        let got = read_up_to(&mut input, &mut raw)?;

        let header = if got >= 4 && raw[..4] == MAGIC.to_le_bytes() {
            let header = GlobalHeader::decode(&raw[..got]).ok_or(StorageError::ShortRead {
                expected: raw.len(),
                got,
            })?;
            header.validate()?;
            header
        } else {
            input.seek(SeekFrom::Start(0))?;
            debug!("{} has no global header, reading legacy layout", path.display());
            GlobalHeader::legacy()
        };
        info!(
            "Reading {} (run {}, {} events)",
            path.display(),
            header.run_id,
            header.nevents
        );
        self.file = Some(OpenFile {
            input,
            path,
            header,
            events_read: 0,
        });
        Ok(true)
    }

    /// Move past the rest of the current file without reading it.
    fn skip_file(&mut self) -> Result<(), StorageError> {
        if let Some(file) = &self.file {
            let remaining = file.header.nevents.saturating_sub(file.events_read);
            debug!("Skipping {} ({} events)", file.path.display(), remaining);
            self.position += remaining as u64;
        }
        self.advance_file()
    }

    fn advance_file(&mut self) -> Result<(), StorageError> {
        let opened = match self.series {
            Series::Single(_) => {
                self.file = None;
                false
            }
            Series::Indexed { .. } => {
                self.file_index += 1;
                self.open_current()?
            }
        };
        if !opened {
            self.eof = true;
        }
        Ok(())
    }

    /// Read the next record header, and its body when `want` accepts the
    /// header. Crosses into the next file as needed.
    fn next_record(
        &mut self,
        want: impl Fn(&EventHeader) -> bool,
    ) -> Result<Option<(EventHeader, Option<RawEvent>)>, StorageError> {
        loop {
            let Some(file) = self.file.as_mut() else {
                self.eof = true;
                return Ok(None);
            };
            match read_record(file, &want)? {
                Some(record) => {
                    file.events_read += 1;
                    self.position += 1;
                    self.last_id = Some(record.0.event_id);
                    return Ok(Some(record));
                }
                None => self.advance_file()?,
            }
        }
    }
}

fn series_start(series: &Series) -> u32 {
    match series {
        Series::Single(_) => 0,
        Series::Indexed { first, .. } => *first,
    }
}

fn read_record(
    file: &mut OpenFile,
    want: &impl Fn(&EventHeader) -> bool,
) -> Result<Option<(EventHeader, Option<RawEvent>)>, StorageError> {
    let header_size = file.header.event_header_size as usize;
    let mut raw = vec![0u8; header_size];
    let got = read_up_to(&mut file.input, &mut raw)?;
    if got == 0 {
        return Ok(None);
    }
    let header = EventHeader::decode(&raw[..got], header_size as u32).ok_or(
        StorageError::ShortRead {
            expected: header_size,
            got,
        },
    )?;
    let body_len = (header.event_size as usize)
        .checked_sub(header_size)
        .ok_or_else(|| {
            StorageError::Corrupted(format!(
                "event {} claims {} bytes, less than its header",
                header.event_id, header.event_size
            ))
        })?;

    if !want(&header) {
        // seeking does not notice the end of the file, a truncated record
        // has to be caught here
        let here = file.input.stream_position()?;
        let left = file.input.get_ref().metadata()?.len().saturating_sub(here);
        if left < body_len as u64 {
            return Err(StorageError::ShortRead {
                expected: body_len,
                got: left as usize,
            });
        }
        file.input.seek_relative(body_len as i64)?;
        return Ok(Some((header, None)));
    }

    let mut body = vec![0u8; body_len];
    let got = read_up_to(&mut file.input, &mut body)?;
    if got != body_len {
        return Err(StorageError::ShortRead {
            expected: body_len,
            got,
        });
    }
    let mut event = RawEvent::with_identity(header.event_id, header.timestamp, file.header.run_id);

    if file.header.is_legacy() {
        let data = decompress(&body, None)?;
        event.push_block(DataBlock::from_bytes(BlockType::Digitizer, data));
        return Ok(Some((header, Some(event))));
    }

    let mut offset = 0usize;
    for n in 0..header.nblocks {
        let block = body
            .get(offset..)
            .and_then(BlockHeader::decode)
            .ok_or_else(|| {
                StorageError::Corrupted(format!(
                    "event {} ends before block {} of {}",
                    header.event_id, n, header.nblocks
                ))
            })?;
        let start = offset + BLOCK_HEADER_SIZE as usize;
        let payload = body.get(start..start + block.payload_size()).ok_or_else(|| {
            StorageError::Corrupted(format!(
                "block {} of event {} overruns the record",
                n, header.event_id
            ))
        })?;
        let block_type = BlockType::from_u32(block.block_type).ok_or_else(|| {
            StorageError::Corrupted(format!("unknown block type {}", block.block_type))
        })?;
        let data = decompress(payload, Some(block.datasize as usize))?;
        event.push_block(DataBlock::from_bytes(block_type, data));
        offset = start + block.payload_size();
    }
    if offset != body_len || event.block_count() != header.nblocks as usize {
        return Err(StorageError::Corrupted(format!(
            "event {} has {} trailing bytes after {} blocks",
            header.event_id,
            body_len - offset.min(body_len),
            event.block_count()
        )));
    }
    Ok(Some((header, Some(event))))
}

/// Fill `buf` as far as the input allows.
fn read_up_to(input: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match input.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Split `<base>.NNN.out` into its base and index.
fn split_indexed(path: &Path) -> Option<(PathBuf, u32)> {
    let name = path.file_name()?.to_str()?;
    let stem = name.strip_suffix(".out")?;
    let (base, digits) = stem.rsplit_once('.')?;
    if base.is_empty() || digits.len() < 3 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((path.with_file_name(base), digits.parse().ok()?))
}

/// Work out which files `path` refers to.
///
/// In order: the literal file; `<prefix>.000.out` for the path and for each
/// shorter prefix left after stripping trailing dot-suffixes; finally, when
/// `path` is a directory, the first `*.000.out` series inside it.
fn find_series(path: &Path) -> Result<Series, StorageError> {
    if path.is_file() {
        return Ok(match split_indexed(path) {
            Some((base, first)) => Series::Indexed { base, first },
            None => Series::Single(path.to_path_buf()),
        });
    }

    let mut prefix = path.to_path_buf();
    loop {
        if prefix.file_name().is_some() && series_file(&prefix, 0).is_file() {
            return Ok(Series::Indexed {
                base: prefix,
                first: 0,
            });
        }
        let Some(name) = prefix.file_name().and_then(|n| n.to_str()) else {
            break;
        };
        match name.rsplit_once('.') {
            Some((shorter, _)) if !shorter.is_empty() => {
                let shorter = OsString::from(shorter);
                prefix.set_file_name(shorter);
            }
            _ => break,
        }
    }

    if path.is_dir() {
        let mut starts: Vec<PathBuf> = fs::read_dir(path)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.ends_with(".000.out"))
            })
            .collect();
        starts.sort();
        if let Some((base, first)) = starts.first().and_then(|p| split_indexed(p)) {
            return Ok(Series::Indexed { base, first });
        }
    }
    Err(StorageError::NotFound(path.display().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indexed_names_split_into_base_and_index() {
        assert_eq!(
            split_indexed(Path::new("/d/run.012.out")),
            Some((PathBuf::from("/d/run"), 12))
        );
        assert_eq!(
            split_indexed(Path::new("a.b.1000.out")),
            Some((PathBuf::from("a.b"), 1000))
        );
        assert_eq!(split_indexed(Path::new("run.out")), None);
        assert_eq!(split_indexed(Path::new("run.12.out")), None);
        assert_eq!(split_indexed(Path::new("run.abc.out")), None);
    }

    #[test]
    fn missing_paths_are_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nothing.here");
        assert!(matches!(
            EventReader::open(&missing),
            Err(StorageError::NotFound(_))
        ));
        assert!(matches!(
            EventReader::open(dir.path()),
            Err(StorageError::NotFound(_))
        ));
    }
}

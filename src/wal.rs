//! Per-venue write-ahead log.
//!
//! Every committed mutation is one frame, `[u32 len][bincode Event][u32 crc32]`,
//! integers little-endian. Opening a log replays it and cuts the file back to
//! its last intact frame, so a torn append never sits in front of new ones.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

const FRAME_OVERHEAD: u64 = 8;

/// Frames in a log, by event kind.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecordCounts {
    pub users_registered: usize,
    pub users_deleted: usize,
    pub reservations_created: usize,
    pub reservations_cancelled: usize,
    pub watermarks: usize,
}

impl RecordCounts {
    fn tally(&mut self, event: &Event) {
        match event {
            Event::UserRegistered { .. } => self.users_registered += 1,
            Event::UserDeleted { .. } => self.users_deleted += 1,
            Event::ReservationCreated { .. } => self.reservations_created += 1,
            Event::ReservationCancelled { .. } => self.reservations_cancelled += 1,
            Event::IdWatermark { .. } => self.watermarks += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.users_registered
            + self.users_deleted
            + self.reservations_created
            + self.reservations_cancelled
            + self.watermarks
    }
}

/// The intact prefix of a log file.
#[derive(Debug, Default)]
pub struct Replay {
    pub events: Vec<Event>,
    pub counts: RecordCounts,
    /// Bytes covered by intact frames.
    pub intact_len: u64,
    /// Bytes after the intact prefix: a torn append or a damaged frame.
    pub discarded: u64,
}

enum Frame {
    Event(Event, u64),
    End,
    Torn,
    Damaged(&'static str),
}

pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    /// Replay `path`, truncate it to the intact prefix and open it for appending.
    pub fn recover(path: &Path) -> io::Result<(Self, Replay)> {
        let replay = Self::replay(path)?;
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        if replay.discarded > 0 {
            tracing::warn!(
                "{}: dropping {} bytes after the last intact record",
                path.display(),
                replay.discarded
            );
            file.set_len(replay.intact_len)?;
            file.sync_all()?;
        }
        let wal = Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        };
        Ok((wal, replay))
    }

    /// Read the intact frames of `path` without touching it. A missing file is empty.
    pub fn replay(path: &Path) -> io::Result<Replay> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Replay::default()),
            Err(e) => return Err(e),
        };
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let mut replay = Replay::default();

        loop {
            match read_frame(&mut reader, file_len - replay.intact_len)? {
                Frame::Event(event, len) => {
                    replay.counts.tally(&event);
                    replay.events.push(event);
                    replay.intact_len += len;
                }
                Frame::End | Frame::Torn => break,
                Frame::Damaged(why) => {
                    tracing::warn!(
                        "{}: {why} at byte {}, ignoring the rest",
                        path.display(),
                        replay.intact_len
                    );
                    break;
                }
            }
        }
        replay.discarded = file_len - replay.intact_len;
        Ok(replay)
    }

    /// Buffer one frame. Nothing is durable until `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        write_frame(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    /// Replace the whole log with `events`: write a side file, fsync it, then
    /// rename it over the log.
    pub fn rewrite(&mut self, events: &[Event]) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        {
            let mut tmp = BufWriter::new(File::create(&tmp_path)?);
            for event in events {
                write_frame(&mut tmp, event)?;
            }
            tmp.flush()?;
            tmp.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }
}

fn write_frame(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())
}

/// Next frame, given how many bytes of the file are left. A length that runs
/// past the end of the file is a torn append, not an allocation request.
fn read_frame(reader: &mut impl Read, remaining: u64) -> io::Result<Frame> {
    let mut header = [0u8; 4];
    match fill(reader, &mut header)? {
        0 => return Ok(Frame::End),
        4 => {}
        _ => return Ok(Frame::Torn),
    }
    let len = u32::from_le_bytes(header) as u64;
    if len + FRAME_OVERHEAD > remaining {
        return Ok(Frame::Torn);
    }

    let mut payload = vec![0u8; len as usize];
    let mut trailer = [0u8; 4];
    if fill(reader, &mut payload)? < payload.len() || fill(reader, &mut trailer)? < trailer.len() {
        return Ok(Frame::Torn);
    }
    if u32::from_le_bytes(trailer) != crc32fast::hash(&payload) {
        return Ok(Frame::Damaged("checksum mismatch"));
    }
    match bincode::deserialize::<Event>(&payload) {
        Ok(event) => Ok(Frame::Event(event, len + FRAME_OVERHEAD)),
        Err(_) => Ok(Frame::Damaged("undecodable event")),
    }
}

/// Read until `buf` is full or the file ends; returns the bytes read.
fn fill(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut read = 0;
    while read < buf.len() {
        match reader.read(&mut buf[read..]) {
            Ok(0) => break,
            Ok(n) => read += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(read)
}

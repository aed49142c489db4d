use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Encode one event as `[len][bincode][crc32]`.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Read one framed record and its size on disk. `Ok(None)` means a clean end
/// of log, a torn tail, or a record whose checksum does not match; replay
/// stops there either way.
fn decode_event(reader: &mut impl Read) -> io::Result<Option<(Event, u64)>> {
    let mut len_buf = [0u8; 4];
    if !read_full(reader, &mut len_buf)? {
        return Ok(None);
    }
    let mut payload = vec![0u8; u32::from_le_bytes(len_buf) as usize];
    if !read_full(reader, &mut payload)? {
        return Ok(None);
    }
    let mut crc_buf = [0u8; 4];
    if !read_full(reader, &mut crc_buf)? {
        return Ok(None);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    let size = 8 + payload.len() as u64;
    Ok(bincode::deserialize::<Event>(&payload)
        .ok()
        .map(|event| (event, size)))
}

/// `read_exact`, but a short read is reported as `false` instead of an error.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Events recovered from a log, plus the length of its valid prefix.
#[derive(Debug)]
pub struct Replay {
    pub events: Vec<Event>,
    pub valid_len: u64,
}

/// Append-only write-ahead log of booking events.
///
/// A crash can leave a partial last record; replay drops it and `truncate`
/// cuts it off before new records are appended.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
    /// Appends buffered since the last successful flush.
    pending: u64,
    /// File length after the last successful flush.
    durable_len: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let durable_len = file.metadata()?.len();
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
            pending: 0,
            durable_len,
        })
    }

    /// Cut the file at `path` down to `len` bytes. Used after replay so new
    /// records never land behind a torn or corrupt one.
    pub fn truncate(path: &Path, len: u64) -> io::Result<()> {
        let file = match OpenOptions::new().write(true).open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        if file.metadata()?.len() > len {
            file.set_len(len)?;
            file.sync_all()?;
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer an event. Not durable until `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        self.pending += 1;
        encode_event(&mut self.writer, event)
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.durable_len = self.writer.get_ref().metadata()?.len();
        self.appends_since_compact += self.pending;
        self.pending = 0;
        Ok(())
    }

    /// Throw away everything since the last successful flush: buffered bytes
    /// and any partial write that already reached the file.
    pub fn rollback(&mut self) -> io::Result<()> {
        let file = OpenOptions::new().append(true).open(&self.path)?;
        file.set_len(self.durable_len)?;
        file.sync_all()?;
        // into_parts hands back the buffer instead of flushing it on drop.
        let stale = std::mem::replace(&mut self.writer, BufWriter::new(file));
        let (_, _discarded) = stale.into_parts();
        self.pending = 0;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the compacted log next to the live one and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(path.with_extension("wal.tmp"))?);
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the compacted file over the live log and reopen it for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(self.path.with_extension("wal.tmp"), &self.path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.durable_len = file.metadata()?.len();
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        self.pending = 0;
        Ok(())
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// All valid events in the log, in order. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Replay> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(Replay {
                    events: Vec::new(),
                    valid_len: 0,
                });
            }
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        let mut valid_len = 0;
        while let Some((event, size)) = decode_event(&mut reader)? {
            events.push(event);
            valid_len += size;
        }
        Ok(Replay { events, valid_len })
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;
    use crate::model::*;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("bookings_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn room_created(id: RoomId) -> Event {
        Event::RoomCreated {
            room: Room {
                id,
                name: format!("Room {id}"),
            },
        }
    }

    fn booking(id: i64) -> Event {
        let start = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        let range = DateRange::new(start, start).unwrap();
        Event::BookingCommitted {
            reservation: Reservation {
                id,
                guest: Guest {
                    first_name: "Ada".into(),
                    last_name: "Lovelace".into(),
                    phone: "555".into(),
                    email: "ada@example.com".into(),
                },
                range,
                room_id: 1,
            },
            restriction: RoomRestriction {
                id,
                room_id: 1,
                range,
                kind: RestrictionKind::Reservation(id),
            },
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let events = vec![room_created(1), booking(1), Event::ReservationDeleted { id: 1 }];
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }
        assert_eq!(Wal::replay(&path).unwrap().events, events);
    }

    #[test]
    fn replay_drops_torn_tail() {
        let path = tmp_path("torn_tail.wal");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&room_created(1)).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[9u8, 0, 0, 0, 1, 2]).unwrap();
        }
        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.events, vec![room_created(1)]);
        assert_eq!(replay.valid_len, fs::metadata(&path).unwrap().len() - 6);
    }

    #[test]
    fn truncate_then_append_is_replayable() {
        let path = tmp_path("truncate_then_append.wal");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&room_created(1)).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[9u8, 0, 0, 0, 1, 2]).unwrap();
        }
        let replay = Wal::replay(&path).unwrap();
        Wal::truncate(&path, replay.valid_len).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), replay.valid_len);

        let mut wal = Wal::open(&path).unwrap();
        wal.append(&room_created(2)).unwrap();
        assert_eq!(
            Wal::replay(&path).unwrap().events,
            vec![room_created(1), room_created(2)]
        );
    }

    #[test]
    fn truncate_missing_file_is_noop() {
        let path = tmp_path("truncate_missing.wal");
        Wal::truncate(&path, 0).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn rollback_discards_unflushed_batch() {
        let path = tmp_path("rollback.wal");
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&room_created(1)).unwrap();
        let durable = fs::metadata(&path).unwrap().len();

        wal.append_buffered(&room_created(2)).unwrap();
        wal.append_buffered(&room_created(3)).unwrap();
        // part of the batch already reached the file
        wal.writer.flush().unwrap();
        assert!(fs::metadata(&path).unwrap().len() > durable);

        wal.rollback().unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), durable);
        assert_eq!(wal.appends_since_compact(), 1);

        wal.append(&room_created(4)).unwrap();
        assert_eq!(
            Wal::replay(&path).unwrap().events,
            vec![room_created(1), room_created(4)]
        );
    }

    #[test]
    fn replay_missing_file_is_empty() {
        let path = tmp_path("missing.wal");
        let replay = Wal::replay(&path).unwrap();
        assert!(replay.events.is_empty());
        assert_eq!(replay.valid_len, 0);
    }

    #[test]
    fn replay_stops_at_bad_checksum() {
        let path = tmp_path("bad_crc.wal");
        let payload = bincode::serialize(&room_created(1)).unwrap();
        {
            let mut f = File::create(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEADBEEFu32.to_le_bytes()).unwrap();
        }
        let replay = Wal::replay(&path).unwrap();
        assert!(replay.events.is_empty());
        assert_eq!(replay.valid_len, 0);
    }

    #[test]
    fn compact_replaces_history_and_accepts_appends() {
        let path = tmp_path("compact.wal");
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&room_created(1)).unwrap();
        for id in 1..=10 {
            wal.append(&booking(id)).unwrap();
            wal.append(&Event::ReservationDeleted { id }).unwrap();
        }
        assert_eq!(wal.appends_since_compact(), 21);
        let before = fs::metadata(&path).unwrap().len();

        let snapshot = vec![
            Event::SequencesAdvanced {
                next_reservation_id: 11,
                next_restriction_id: 11,
            },
            room_created(1),
        ];
        Wal::write_compact_file(wal.path(), &snapshot).unwrap();
        wal.swap_compact_file().unwrap();
        assert_eq!(wal.appends_since_compact(), 0);
        assert!(fs::metadata(&path).unwrap().len() < before);

        wal.append(&booking(11)).unwrap();
        let mut expected = snapshot;
        expected.push(booking(11));
        assert_eq!(Wal::replay(&path).unwrap().events, expected);
    }

    #[test]
    fn buffered_appends_need_flush() {
        let path = tmp_path("buffered.wal");
        let events: Vec<Event> = (1..=5).map(room_created).collect();
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append_buffered(e).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 0);
            wal.flush_sync().unwrap();
            assert_eq!(wal.appends_since_compact(), 5);
        }
        assert_eq!(Wal::replay(&path).unwrap().events, events);
    }
}

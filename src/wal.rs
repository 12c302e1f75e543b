use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Append-only write-ahead log. Every engine mutation is a single `Event`
/// record here, fsynced before it is applied in memory — which is what makes
/// the approval transaction all-or-nothing across restarts.
///
/// Record layout: `[u32: len][bincode: Event][u32: crc32]`, little-endian.
/// `len` covers the bincode payload only. A truncated or corrupt tail
/// (crash mid-write) is detected by the length prefix + CRC and discarded.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    records_since_compact: u64,
}

fn write_record(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

impl Wal {
    /// Open (or create) the WAL file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            records_since_compact: 0,
        })
    }

    /// Buffer a record without flushing or syncing. The group-commit writer
    /// calls `flush_sync` once per batch.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        write_record(&mut self.writer, event)?;
        self.records_since_compact += 1;
        Ok(())
    }

    /// Flush buffered records and fsync the file.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    /// Append one record and fsync. Test convenience — production appends go
    /// through the group-commit writer.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records_since_compact(&self) -> u64 {
        self.records_since_compact
    }

    /// Write a compacted event stream to a sibling temp file and fsync it.
    /// Slow I/O phase — runs without blocking appends.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let mut writer = BufWriter::new(File::create(&tmp_path)?);
        for event in events {
            write_record(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Atomically rename the temp file over the WAL and reopen for append.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.records_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    /// Read back all intact records. Stops silently at the first truncated
    /// or corrupt entry; everything before it is valid committed state.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();

        loop {
            let mut len_buf = [0u8; 4];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
            let len = u32::from_le_bytes(len_buf) as usize;

            let mut payload = vec![0u8; len];
            match reader.read_exact(&mut payload) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }

            let mut crc_buf = [0u8; 4];
            match reader.read_exact(&mut crc_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
            if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
                break;
            }

            match bincode::deserialize::<Event>(&payload) {
                Ok(event) => events.push(event),
                Err(_) => break,
            }
        }

        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RateCard, Span, VehicleAttrs};
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("hyra_test_wal");
        fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    fn vehicle_added(id: Ulid) -> Event {
        Event::VehicleAdded {
            id,
            org_id: "556000-0000".into(),
            rates: RateCard::daily(10_000),
            attrs: VehicleAttrs {
                model: "Saab 900".into(),
                location: "Malmö".into(),
                category: None,
                image_url: None,
            },
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let _ = fs::remove_file(&path);

        let vehicle_id = Ulid::new();
        let events = vec![
            vehicle_added(vehicle_id),
            Event::RentalSubmitted {
                id: Ulid::new(),
                vehicle_id,
                renter_id: Ulid::new(),
                span: Span::new(1000, 2000),
                total_price_cents: 10_000,
                submitted_at: 1_700_000_000_000,
            },
        ];

        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, events);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_discards_truncated_tail() {
        let path = tmp_path("truncated.wal");
        let _ = fs::remove_file(&path);

        let event = vehicle_added(Ulid::new());
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }

        // Partial second record: a few bytes of garbage.
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[0u8; 6]).unwrap();
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, vec![event]);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_nonexistent_file() {
        let path = tmp_path("nonexistent.wal");
        let _ = fs::remove_file(&path);
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn replay_stops_at_bad_crc() {
        let path = tmp_path("bad_crc.wal");
        let _ = fs::remove_file(&path);

        let event = Event::VehicleRemoved { id: Ulid::new() };
        {
            let payload = bincode::serialize(&event).unwrap();
            let mut f = File::create(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEAD_BEEFu32.to_le_bytes()).unwrap();
        }

        assert!(Wal::replay(&path).unwrap().is_empty());

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compact_shrinks_and_replays() {
        let path = tmp_path("compact.wal");
        let _ = fs::remove_file(&path);

        let vehicle_id = Ulid::new();
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&vehicle_added(vehicle_id)).unwrap();
            // Churn: submit + delete the same request over and over.
            for _ in 0..10 {
                let rid = Ulid::new();
                wal.append(&Event::RentalSubmitted {
                    id: rid,
                    vehicle_id,
                    renter_id: Ulid::new(),
                    span: Span::new(0, 1000),
                    total_price_cents: 100,
                    submitted_at: 0,
                })
                .unwrap();
                wal.append(&Event::RentalDeleted { id: rid, decided_at: 1 }).unwrap();
            }
        }

        let before = fs::metadata(&path).unwrap().len();
        let compacted = vec![vehicle_added(vehicle_id)];
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.compact(&compacted).unwrap();
        }

        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted WAL should shrink: {after} < {before}");
        assert_eq!(Wal::replay(&path).unwrap(), compacted);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn append_after_compact() {
        let path = tmp_path("compact_append.wal");
        let _ = fs::remove_file(&path);

        let vehicle_id = Ulid::new();
        let base = vehicle_added(vehicle_id);
        let tail = Event::RentalSubmitted {
            id: Ulid::new(),
            vehicle_id,
            renter_id: Ulid::new(),
            span: Span::new(1000, 2000),
            total_price_cents: 100,
            submitted_at: 5,
        };

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&base).unwrap();
            wal.compact(std::slice::from_ref(&base)).unwrap();
            assert_eq!(wal.records_since_compact(), 0);
            wal.append(&tail).unwrap();
            assert_eq!(wal.records_since_compact(), 1);
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, vec![base, tail]);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn buffered_appends_flush_together() {
        let path = tmp_path("buffered.wal");
        let _ = fs::remove_file(&path);

        let events: Vec<Event> = (0..5).map(|_| vehicle_added(Ulid::new())).collect();
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append_buffered(e).unwrap();
            }
            assert_eq!(wal.records_since_compact(), 5);
            wal.flush_sync().unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), events);

        let _ = fs::remove_file(&path);
    }
}

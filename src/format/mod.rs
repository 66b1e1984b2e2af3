// Every dataset file, whatever the stage, has the same shape:
//
//   magic    "LKF1"
//   frames   u32 length (non-zero, little-endian) followed by that many
//            payload bytes, one frame per record
//   trailer  u32 zero, u64 record count, u32 CRC32 of all payload bytes
//
// Frames carry opaque payloads so compaction can move records between files
// without decoding them. The trailer makes a truncated or damaged file
// detectable: a reader only reports success once it has seen a trailer that
// matches what it read, followed by end of file.

use std::{
    io::{self, BufReader, Read, Write},
    path::{Path, PathBuf},
};

use crate::{
    error::{Error, Result},
    fs::Dir,
    record::Record,
};

pub const MAGIC: [u8; 4] = *b"LKF1";

// Used when inspecting files outside of a merge, where no chunk budget
// applies.
const INSPECT_MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

pub struct FrameWriter<W: Write> {
    w: W,
    count: u64,
    hasher: crc32fast::Hasher,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(mut w: W) -> io::Result<Self> {
        w.write_all(&MAGIC)?;
        Ok(FrameWriter {
            w,
            count: 0,
            hasher: crc32fast::Hasher::new(),
        })
    }

    pub fn write_frame(&mut self, payload: &[u8]) -> io::Result<()> {
        if payload.is_empty() || payload.len() > u32::MAX as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("cannot frame a {} byte payload", payload.len()),
            ));
        }
        self.w.write_all(&(payload.len() as u32).to_le_bytes())?;
        self.w.write_all(payload)?;
        self.hasher.update(payload);
        self.count += 1;
        Ok(())
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn finish(mut self) -> io::Result<W> {
        self.w.write_all(&0_u32.to_le_bytes())?;
        self.w.write_all(&self.count.to_le_bytes())?;
        self.w.write_all(&self.hasher.finalize().to_le_bytes())?;
        self.w.flush()?;
        Ok(self.w)
    }
}

pub struct FrameReader<R: Read> {
    r: R,
    path: PathBuf,
    max_frame_len: usize,
    count: u64,
    hasher: crc32fast::Hasher,
    done: bool,
    oversize_is_damage: bool,
}

impl<R: Read> FrameReader<R> {
    pub fn open<P: Into<PathBuf>>(mut r: R, path: P, max_frame_len: usize) -> Result<Self> {
        let path = path.into();
        let mut magic = [0_u8; 4];
        r.read_exact(&mut magic)
            .map_err(|e| read_error(&path, e))?;
        if magic != MAGIC {
            return Err(Error::corrupt(path, "bad magic"));
        }
        Ok(FrameReader {
            r,
            path,
            max_frame_len,
            count: 0,
            hasher: crc32fast::Hasher::new(),
            done: false,
            oversize_is_damage: false,
        })
    }

    /// For files whose writer already held every frame to `max_frame_len`.
    /// A longer frame in such a file can only be a damaged length field, so
    /// it is reported as corruption instead of a resource bound.
    pub fn written_within_limit(mut self) -> Self {
        self.oversize_is_damage = true;
        self
    }

    // Frames read so far.
    pub fn count(&self) -> u64 {
        self.count
    }

    // Reads the next payload into `buf`. Returns false once the trailer has
    // been read and verified.
    pub fn next_frame(&mut self, buf: &mut Vec<u8>) -> Result<bool> {
        if self.done {
            return Ok(false);
        }
        let len = self.read_u32()? as usize;
        if len == 0 {
            self.read_trailer()?;
            self.done = true;
            return Ok(false);
        }
        if len > self.max_frame_len && self.oversize_is_damage {
            return Err(Error::corrupt(
                &self.path,
                format!("frame length {} over the {} byte limit", len, self.max_frame_len),
            ));
        }
        if len > self.max_frame_len {
            return Err(Error::ResourceBound(format!(
                "{}: record frame of {} bytes exceeds the {} byte limit",
                self.path.display(),
                len,
                self.max_frame_len
            )));
        }
        buf.clear();
        buf.resize(len, 0);
        self.r
            .read_exact(buf)
            .map_err(|e| read_error(&self.path, e))?;
        self.hasher.update(buf);
        self.count += 1;
        Ok(true)
    }

    fn read_trailer(&mut self) -> Result<()> {
        let mut count = [0_u8; 8];
        self.r
            .read_exact(&mut count)
            .map_err(|e| read_error(&self.path, e))?;
        let count = u64::from_le_bytes(count);
        let crc = self.read_u32()?;

        if count != self.count {
            return Err(Error::corrupt(
                &self.path,
                format!("trailer claims {} records, read {}", count, self.count),
            ));
        }
        if crc != self.hasher.clone().finalize() {
            return Err(Error::corrupt(&self.path, "checksum mismatch"));
        }
        let mut extra = [0_u8; 1];
        match self.r.read(&mut extra) {
            Ok(0) => Ok(()),
            Ok(_) => Err(Error::corrupt(&self.path, "data after trailer")),
            Err(e) => Err(read_error(&self.path, e)),
        }
    }

    fn read_u32(&mut self) -> Result<u32> {
        let mut buf = [0_u8; 4];
        self.r
            .read_exact(&mut buf)
            .map_err(|e| read_error(&self.path, e))?;
        Ok(u32::from_le_bytes(buf))
    }
}

// A short read means the file ends early, which no retry will fix.
fn read_error(path: &Path, e: io::Error) -> Error {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        Error::corrupt(path, "truncated")
    } else {
        e.into()
    }
}

/// Buffers writes up to a fixed capacity and hands them to the inner writer
/// in chunks of at most that size.
pub struct ChunkedWriter<W: Write> {
    inner: W,
    buf: Vec<u8>,
    capacity: usize,
    high_water: usize,
}

impl<W: Write> ChunkedWriter<W> {
    pub fn new(inner: W, capacity: usize) -> Self {
        ChunkedWriter {
            inner,
            buf: Vec::with_capacity(capacity),
            capacity,
            high_water: 0,
        }
    }

    // The most bytes ever held in the buffer at once.
    pub fn high_water(&self) -> usize {
        self.high_water
    }

    fn flush_buf(&mut self) -> io::Result<()> {
        if !self.buf.is_empty() {
            self.inner.write_all(&self.buf)?;
            self.buf.clear();
        }
        Ok(())
    }
}

impl<W: Write> Write for ChunkedWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.buf.len() + data.len() > self.capacity {
            self.flush_buf()?;
        }
        if data.len() > self.capacity {
            self.inner.write_all(data)?;
        } else {
            self.buf.extend_from_slice(data);
            self.high_water = std::cmp::max(self.high_water, self.buf.len());
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_buf()?;
        self.inner.flush()
    }
}

/// Reads a dataset file end to end and returns its verified record count.
pub fn count_records<D: Dir>(dir: &D, name: &str) -> Result<u64> {
    let mut count = 0;
    for_each_frame(dir, name, |_| {
        count += 1;
        Ok(())
    })?;
    Ok(count)
}

/// Reads and decodes every record of a dataset file, in file order.
pub fn read_records<D: Dir>(dir: &D, name: &str) -> Result<Vec<Record>> {
    let path = dir.path().join(name);
    let mut records = Vec::new();
    for_each_frame(dir, name, |payload| {
        let record = Record::decode_from(payload).map_err(|e| Error::MalformedRecord {
            file: path.clone(),
            index: records.len() as u64,
            reason: format!("{:#}", e),
        })?;
        records.push(record);
        Ok(())
    })?;
    Ok(records)
}

fn for_each_frame<D, F>(dir: &D, name: &str, mut f: F) -> Result<()>
where
    D: Dir,
    F: FnMut(&[u8]) -> Result<()>,
{
    let path = dir.path().join(name);
    let file = dir
        .open(&name)?
        .ok_or_else(|| Error::MissingInput(path.clone()))?;
    let mut reader = FrameReader::open(BufReader::new(file), path, INSPECT_MAX_FRAME_LEN)?;
    let mut buf = Vec::new();
    while reader.next_frame(&mut buf)? {
        f(&buf)?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use std::io::{Cursor, Write};

    use super::{ChunkedWriter, FrameReader, FrameWriter};
    use crate::error::Error;

    fn encode(frames: &[&[u8]]) -> Vec<u8> {
        let mut w = FrameWriter::new(Vec::new()).unwrap();
        for f in frames {
            w.write_frame(f).unwrap();
        }
        w.finish().unwrap()
    }

    fn decode(data: &[u8], max_frame_len: usize) -> Result<Vec<Vec<u8>>, Error> {
        let mut r = FrameReader::open(Cursor::new(data), "test", max_frame_len)?;
        let mut frames = Vec::new();
        let mut buf = Vec::new();
        while r.next_frame(&mut buf)? {
            frames.push(buf.clone());
        }
        Ok(frames)
    }

    #[test]
    fn test_frames() {
        let data = encode(&[b"a", b"\x00\x00", b"ccc"]);
        assert_eq!(
            vec![b"a".to_vec(), vec![0, 0], b"ccc".to_vec()],
            decode(&data, 16).unwrap()
        );
        assert!(decode(&encode(&[]), 16).unwrap().is_empty());

        let mut w = FrameWriter::new(Vec::new()).unwrap();
        assert!(w.write_frame(b"").is_err());
    }

    #[test]
    fn test_detects_damage() {
        let data = encode(&[b"hello", b"world"]);

        for cut in 0..data.len() {
            match decode(&data[..cut], 16) {
                Err(Error::Corrupt { .. }) => {}
                other => panic!("cut at {}: {:?}", cut, other),
            }
        }

        let mut flipped = data.clone();
        flipped[9] ^= 0x20;
        assert!(matches!(decode(&flipped, 16), Err(Error::Corrupt { .. })));

        let mut extended = data.clone();
        extended.push(0);
        assert!(matches!(decode(&extended, 16), Err(Error::Corrupt { .. })));

        assert!(matches!(decode(b"PAR1....", 16), Err(Error::Corrupt { .. })));
    }

    #[test]
    fn test_frame_limit() {
        let data = encode(&[b"0123456789"]);
        assert!(matches!(decode(&data, 9), Err(Error::ResourceBound(_))));
        assert_eq!(1, decode(&data, 10).unwrap().len());

        let mut damaged = data.clone();
        damaged[4..8].copy_from_slice(&0x00ff_ffff_u32.to_le_bytes());
        let mut r = FrameReader::open(Cursor::new(&damaged), "test", 10)
            .unwrap()
            .written_within_limit();
        match r.next_frame(&mut Vec::new()) {
            Err(Error::Corrupt { reason, .. }) => {
                assert!(reason.contains("16777215"), "{}", reason)
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_chunked_writer() {
        let mut out = Vec::new();
        let mut w = ChunkedWriter::new(&mut out, 8);
        w.write_all(b"abcde").unwrap();
        w.write_all(b"fgh").unwrap();
        w.write_all(b"ij").unwrap();
        w.write_all(b"a longer write").unwrap();
        w.write_all(b"z").unwrap();
        w.flush().unwrap();
        assert_eq!(8, w.high_water());
        drop(w);
        assert_eq!(b"abcdefghija longer writez".to_vec(), out);
    }
}

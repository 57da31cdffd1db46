use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Commit;

/// Larger length prefixes are treated as corruption.
const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Encode one committed transaction as `[len][bincode][crc32]`.
fn encode_frame(writer: &mut impl Write, commit: &Commit) -> io::Result<()> {
    let payload =
        bincode::serialize(commit).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Outcome of reading one frame.
enum Frame {
    Commit(Commit, u64),
    End,
    /// The last frame was cut short by a crash mid-write.
    Torn,
    Corrupt(&'static str),
}

/// Decode the next frame out of `remaining` unread bytes.
fn decode_frame(reader: &mut impl Read, remaining: u64) -> io::Result<Frame> {
    if remaining == 0 {
        return Ok(Frame::End);
    }
    if remaining < 4 {
        return Ok(Frame::Torn);
    }
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_le_bytes(len_buf) as usize;
    let size = 8 + len as u64;
    if size > remaining {
        return Ok(Frame::Torn);
    }
    let last = size == remaining;
    if len > MAX_FRAME_BYTES {
        return Ok(if last { Frame::Torn } else { Frame::Corrupt("oversized frame") });
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    let mut crc_buf = [0u8; 4];
    reader.read_exact(&mut crc_buf)?;
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(if last { Frame::Torn } else { Frame::Corrupt("checksum mismatch") });
    }
    // A checksummed payload that won't decode is never a torn write.
    match bincode::deserialize::<Commit>(&payload) {
        Ok(commit) => Ok(Frame::Commit(commit, size)),
        Err(_) => Ok(Frame::Corrupt("undecodable payload")),
    }
}

/// Append-only write-ahead log of committed transactions.
///
/// One frame per transaction, so replay is all-or-nothing per commit: a torn
/// final frame (crash mid-write) fails its length or CRC check and is cut
/// off. A bad frame with intact bytes after it refuses to replay.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    #[cfg(test)]
    pub fn append(&mut self, commit: &Commit) -> io::Result<()> {
        self.append_buffered(commit)?;
        self.flush_sync()
    }

    /// Buffer a frame. Durable only after `flush_sync`.
    pub fn append_buffered(&mut self, commit: &Commit) -> io::Result<()> {
        encode_frame(&mut self.writer, commit)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Rewrite the log as `snapshot`: temp file, fsync, rename, reopen.
    pub fn compact(&mut self, snapshot: &[Commit]) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp_path)?);
            for commit in snapshot {
                encode_frame(&mut writer, commit)?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    /// Replay all intact commits. A missing file is an empty log. A torn
    /// final frame is truncated away; corruption anywhere else is an
    /// `InvalidData` error and the file is left untouched.
    pub fn replay(path: &Path) -> io::Result<Vec<Commit>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let total = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let mut commits = Vec::new();
        let mut consumed: u64 = 0;
        loop {
            match decode_frame(&mut reader, total - consumed)? {
                Frame::Commit(commit, size) => {
                    consumed += size;
                    commits.push(commit);
                }
                Frame::End => break,
                Frame::Torn => {
                    tracing::warn!(
                        "wal {}: discarded torn tail of {} bytes after {} commits",
                        path.display(),
                        total - consumed,
                        commits.len()
                    );
                    // New appends must not land behind the garbage.
                    OpenOptions::new().write(true).open(path)?.set_len(consumed)?;
                    break;
                }
                Frame::Corrupt(reason) => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!(
                            "wal {}: {reason} in frame {} at byte {consumed}",
                            path.display(),
                            commits.len()
                        ),
                    ));
                }
            }
        }
        Ok(commits)
    }
}

//! Container assembly: header lines, textual segment, blocks, index, footer
//!
//! ```text
//! #TESSERA 1.0.0
//! #TESSERA_STANDARD 1.0.0
//! --- !core/tessera-1.0.0
//! ...textual segment...
//! ...
//! <block>*
//! <index entry: offset u64, size u64, checksum u32>*
//! <index offset u64><entry count u64>TSRINDEX
//! ```

use crate::block::{stream_write, Backing, BlockHeader, BlockLocation, BlockReader, IndexEntry, PreparedBlock};
use crate::compression::CodecRegistry;
use crate::error::{Error, Result};
use crate::tag::Version;
use memmap2::{Mmap, MmapMut};
use parking_lot::{Mutex, RwLock};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Version of the container layout written by this library
pub const FORMAT_VERSION: Version = Version::new(1, 0, 0);
/// Version of the standard schemas written by this library
pub const STANDARD_VERSION: Version = Version::new(1, 0, 0);

const MAGIC_PREFIX: &str = "#TESSERA ";
const STANDARD_PREFIX: &str = "#TESSERA_STANDARD ";
const SENTINEL: &[u8] = b"...\n";
/// Footer trailer
pub const FOOTER_MAGIC: &[u8; 8] = b"TSRINDEX";
pub const FOOTER_LEN: u64 = 24;
/// Longest header line accepted
const MAX_HEADER_LINE: usize = 128;
/// Chunk size used when searching unmapped files for the end of the text
const SCAN_CHUNK: usize = 64 * 1024;

/// Both header lines as written
pub fn header_lines() -> String {
    format!("{}{}\n{}{}\n", MAGIC_PREFIX, FORMAT_VERSION, STANDARD_PREFIX, STANDARD_VERSION)
}

/// Where the parts of a file live
#[derive(Debug, Clone)]
pub struct Layout {
    pub format_version: Version,
    pub standard_version: Version,
    /// Offset of the `---` line
    pub text_start: u64,
    /// End of the text region, including the `...` sentinel and any padding
    pub text_end: u64,
    pub blocks: Vec<BlockLocation>,
    /// Offset of the block index, when a valid one was found
    pub index_offset: Option<u64>,
}

impl Layout {
    /// Bytes available to the textual segment when patching in place
    pub fn text_capacity(&self) -> u64 {
        self.text_end - self.text_start
    }
}

/// Open `path` as a byte source
///
/// `writable` maps the file read-write so arrays can be modified in place.
pub fn open_backing(path: &Path, mmap: bool, writable: bool) -> Result<Backing> {
    let file = OpenOptions::new().read(true).write(writable).open(path)?;
    let len = file.metadata()?.len();
    if !mmap || len == 0 {
        return Ok(Backing::File {
            file: Mutex::new(file),
            len,
        });
    }
    // SAFETY: the map is only read through bounds-checked accessors; a
    // concurrent truncation by another process is outside our control.
    if writable {
        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(Backing::MappedMut(RwLock::new(map)))
    } else {
        let map = unsafe { Mmap::map(&file)? };
        Ok(Backing::Mapped(map))
    }
}

fn read_line(backing: &Backing, offset: u64) -> Result<String> {
    let available = (backing.len().saturating_sub(offset) as usize).min(MAX_HEADER_LINE);
    let bytes = backing.read_at(offset, available)?;
    let end = bytes.iter().position(|b| *b == b'\n').ok_or_else(|| Error::MalformedHeader {
        offset,
        reason: "header line is not terminated".into(),
    })?;
    String::from_utf8(bytes[..end].to_vec()).map_err(|_| Error::MalformedHeader {
        offset,
        reason: "header line is not valid UTF-8".into(),
    })
}

fn parse_header_line(line: &str, prefix: &str, offset: u64) -> Result<Version> {
    let version = line.strip_prefix(prefix).ok_or_else(|| Error::MalformedHeader {
        offset,
        reason: format!("expected '{}<version>', found '{}'", prefix, line.escape_default()),
    })?;
    version.trim_end_matches('\r').parse().map_err(|reason| Error::MalformedHeader {
        offset: offset + prefix.len() as u64,
        reason,
    })
}

/// Locate the header, text region and blocks of a file
pub fn read_layout(backing: &Backing) -> Result<Layout> {
    let first = read_line(backing, 0)?;
    let format_version = parse_header_line(&first, MAGIC_PREFIX, 0)?;
    if format_version.major != FORMAT_VERSION.major {
        return Err(Error::MalformedHeader {
            offset: MAGIC_PREFIX.len() as u64,
            reason: format!("unsupported format version {}", format_version),
        });
    }
    let second_offset = first.len() as u64 + 1;
    let second = read_line(backing, second_offset)?;
    let standard_version = parse_header_line(&second, STANDARD_PREFIX, second_offset)?;
    let text_start = second_offset + second.len() as u64 + 1;

    match read_index(backing, text_start) {
        Some((index_offset, entries)) => {
            let text_end = entries.first().map_or(index_offset, |e| e.offset);
            let blocks = entries
                .iter()
                .map(|e| BlockLocation {
                    offset: e.offset,
                    size: Some(e.size),
                    checksum: Some(e.checksum),
                })
                .collect();
            Ok(Layout {
                format_version,
                standard_version,
                text_start,
                text_end,
                blocks,
                index_offset: Some(index_offset),
            })
        }
        None => {
            let text_end = match find_sentinel(backing, text_start)? {
                Some(end) => end,
                None => backing.len(),
            };
            let blocks = BlockReader::scan(backing, text_end, backing.len());
            tracing::debug!(blocks = blocks.len(), "located blocks by scanning");
            Ok(Layout {
                format_version,
                standard_version,
                text_start,
                text_end,
                blocks,
                index_offset: None,
            })
        }
    }
}

/// Parse and sanity-check the trailing index; `None` if absent or invalid
fn read_index(backing: &Backing, text_start: u64) -> Option<(u64, Vec<IndexEntry>)> {
    let len = backing.len();
    if len < text_start + FOOTER_LEN {
        return None;
    }
    let footer = backing.read_at(len - FOOTER_LEN, FOOTER_LEN as usize).ok()?;
    if &footer[16..24] != FOOTER_MAGIC {
        return None;
    }
    let invalid = |reason: &str| {
        tracing::warn!(reason, "block index is invalid, scanning for blocks instead");
        None
    };
    let index_offset = u64::from_le_bytes(footer[0..8].try_into().ok()?);
    let count = u64::from_le_bytes(footer[8..16].try_into().ok()?);
    let expected_end = count
        .checked_mul(IndexEntry::ENCODED_LEN as u64)
        .and_then(|n| n.checked_add(index_offset))
        .and_then(|n| n.checked_add(FOOTER_LEN));
    if expected_end != Some(len) || index_offset < text_start {
        return invalid("footer does not describe the end of the file");
    }
    let raw = backing
        .read_at(index_offset, (count as usize) * IndexEntry::ENCODED_LEN)
        .ok()?;
    let entries: Vec<IndexEntry> = raw
        .chunks_exact(IndexEntry::ENCODED_LEN)
        .filter_map(|chunk| chunk.try_into().ok().map(IndexEntry::from_bytes))
        .collect();

    let mut expected = match entries.first() {
        Some(first) => first.offset,
        None => index_offset,
    };
    if expected < text_start + SENTINEL.len() as u64 {
        return invalid("first block overlaps the header");
    }
    match backing.read_at(expected - SENTINEL.len() as u64, SENTINEL.len()) {
        Ok(bytes) if bytes == SENTINEL || entries.is_empty() => {}
        _ => return invalid("first block does not follow the text sentinel"),
    }
    for entry in &entries {
        if entry.offset != expected || entry.size < BlockHeader::ENCODED_LEN as u64 {
            return invalid("index entries are not contiguous");
        }
        expected = entry.offset.saturating_add(entry.size);
    }
    if expected != index_offset {
        return invalid("last block does not end at the index");
    }
    Some((index_offset, entries))
}

/// Offset just past the `...` line that ends the text, if there is one
fn find_sentinel(backing: &Backing, text_start: u64) -> Result<Option<u64>> {
    let len = backing.len();
    let mut pos = text_start;
    // Bytes from the start of the current line, at absolute offset `line_offset`
    let mut pending: Vec<u8> = Vec::new();
    let mut line_offset = text_start;
    while pos < len {
        let take = ((len - pos) as usize).min(SCAN_CHUNK);
        pending.extend_from_slice(&backing.read_at(pos, take)?);
        pos += take as u64;

        let mut line_start = 0;
        while let Some(newline) = pending[line_start..].iter().position(|b| *b == b'\n') {
            let end = line_start + newline;
            if &pending[line_start..end] == b"..." {
                return Ok(Some(line_offset + end as u64 + 1));
            }
            line_start = end + 1;
        }
        pending.drain(..line_start);
        line_offset += line_start as u64;
    }
    Ok((pending == b"...").then_some(len))
}

/// Text region of a file as a string
pub fn read_text(backing: &Backing, layout: &Layout) -> Result<String> {
    let bytes = backing.read_at(layout.text_start, layout.text_capacity() as usize)?;
    String::from_utf8(bytes).map_err(|e| {
        let valid = e.utf8_error().valid_up_to();
        let before = &e.as_bytes()[..valid];
        let line = before.iter().filter(|b| **b == b'\n').count();
        let column = valid - before.iter().rposition(|b| *b == b'\n').map_or(0, |p| p + 1);
        Error::TextSegmentParse {
            line: line + 3,
            column: column + 1,
            offset: layout.text_start + valid as u64,
            message: "textual segment is not valid UTF-8".into(),
        }
    })
}

/// Open a file's blocks for reading
pub fn open_reader(backing: Backing, layout: &Layout, codecs: Arc<CodecRegistry>) -> BlockReader {
    BlockReader::new(backing, codecs, layout.blocks.clone(), layout.index_offset)
}

/// Counts bytes passed through to the inner writer
struct CountingWriter<W> {
    inner: W,
    written: u64,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Stream a complete container to `sink`
///
/// `text` is the emitted document, ending with the `...` sentinel. Files
/// without blocks get no index. Returns the number of bytes written.
pub fn write_container<W: Write>(
    sink: W,
    text: &str,
    blocks: &[PreparedBlock],
    with_index: bool,
    abort: Option<&AtomicBool>,
) -> Result<u64> {
    let mut sink = CountingWriter { inner: sink, written: 0 };
    sink.write_all(header_lines().as_bytes())?;
    sink.write_all(text.as_bytes())?;
    let start = sink.written;
    let entries = stream_write(blocks, &mut sink, start, abort)?;
    if with_index && !entries.is_empty() {
        let index_offset = sink.written;
        for entry in &entries {
            sink.write_all(&entry.to_bytes())?;
        }
        sink.write_all(&index_offset.to_le_bytes())?;
        sink.write_all(&(entries.len() as u64).to_le_bytes())?;
        sink.write_all(FOOTER_MAGIC)?;
    }
    sink.flush()?;
    tracing::debug!(bytes = sink.written, blocks = entries.len(), with_index, "wrote container");
    Ok(sink.written)
}

/// Write to `path` through a temporary file in the same directory
///
/// The target is replaced only once `write` succeeds; on failure the
/// temporary file is removed and the target is left untouched.
pub fn write_atomic<F>(path: &Path, write: F) -> Result<()>
where
    F: FnOnce(&mut BufWriter<&File>) -> Result<()>,
{
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let temp = tempfile::Builder::new()
        .prefix(".tessera-")
        .suffix(".tmp")
        .tempfile_in(dir)?;
    {
        let mut writer = BufWriter::new(temp.as_file());
        write(&mut writer)?;
        writer.flush()?;
    }
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| Error::Io(e.error))?;
    tracing::debug!(path = %path.display(), "replaced file atomically");
    Ok(())
}

/// Fit `text` into a region of exactly `capacity` bytes
///
/// Slack is filled with a `#` comment line placed before the sentinel.
/// Returns `None` if the text does not fit.
pub fn pad_text(text: &str, capacity: usize) -> Option<Vec<u8>> {
    let body = text.strip_suffix("...\n")?;
    let slack = capacity.checked_sub(text.len())?;
    let mut out = Vec::with_capacity(capacity);
    out.extend_from_slice(body.as_bytes());
    match slack {
        0 => {}
        1 => return None,
        n => {
            out.push(b'#');
            out.extend(std::iter::repeat(b' ').take(n - 2));
            out.push(b'\n');
        }
    }
    out.extend_from_slice(SENTINEL);
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockStore;
    use crate::compression::Compression;
    use bytes::Bytes;

    fn container(with_index: bool) -> Result<Vec<u8>> {
        let mut store = BlockStore::new(Arc::new(CodecRegistry::new()));
        store.allocate(Bytes::from(vec![1u8; 100]), Compression::None)?;
        store.allocate(Bytes::from(vec![2u8; 300]), Compression::Zlib)?;
        let blocks = store.prepare()?;
        let mut out = Vec::new();
        write_container(&mut out, "--- !core/tessera-1.0.0\na: 1\n...\n", &blocks, with_index, None)?;
        Ok(out)
    }

    #[test]
    fn test_layout_from_index() -> Result<()> {
        let bytes = container(true)?;
        let backing = Backing::Memory(Bytes::from(bytes));
        let layout = read_layout(&backing)?;
        assert_eq!(layout.format_version, FORMAT_VERSION);
        assert_eq!(layout.blocks.len(), 2);
        assert!(layout.index_offset.is_some());
        let text = read_text(&backing, &layout)?;
        assert_eq!(text, "--- !core/tessera-1.0.0\na: 1\n...\n");
        let reader = open_reader(backing, &layout, Arc::new(CodecRegistry::new()));
        assert_eq!(reader.read_all(1)?, Bytes::from(vec![2u8; 300]));
        Ok(())
    }

    #[test]
    fn test_layout_falls_back_to_scan() -> Result<()> {
        let indexed = container(true)?;
        let plain = container(false)?;
        let scanned = read_layout(&Backing::Memory(Bytes::from(plain)))?;
        assert!(scanned.index_offset.is_none());
        assert_eq!(scanned.blocks.len(), 2);

        // A damaged footer is ignored rather than trusted
        let mut damaged = indexed.clone();
        let len = damaged.len();
        damaged[len - 20] ^= 0x40;
        let layout = read_layout(&Backing::Memory(Bytes::from(damaged)))?;
        assert!(layout.index_offset.is_none());
        assert_eq!(layout.blocks.len(), 2);
        Ok(())
    }

    #[test]
    fn test_text_only_file_without_sentinel() -> Result<()> {
        let bytes = format!("{}--- {{}}\n", header_lines());
        let backing = Backing::Memory(Bytes::from(bytes.into_bytes()));
        let layout = read_layout(&backing)?;
        assert!(layout.blocks.is_empty());
        assert_eq!(read_text(&backing, &layout)?, "--- {}\n");
        Ok(())
    }

    #[test]
    fn test_malformed_header() {
        let backing = Backing::Memory(Bytes::from_static(b"#ASDF 1.0.0\n---\n"));
        assert!(matches!(read_layout(&backing), Err(Error::MalformedHeader { offset: 0, .. })));

        let backing = Backing::Memory(Bytes::from_static(b"#TESSERA 1.0.0\n#OTHER\n"));
        assert!(matches!(read_layout(&backing), Err(Error::MalformedHeader { offset: 15, .. })));

        let backing = Backing::Memory(Bytes::from_static(b"#TESSERA 9.0.0\n"));
        assert!(matches!(read_layout(&backing), Err(Error::MalformedHeader { .. })));
    }

    #[test]
    fn test_pad_text() {
        let text = "---\na: 1\n...\n";
        assert_eq!(pad_text(text, text.len()).unwrap(), text.as_bytes());
        let padded = pad_text(text, text.len() + 6).unwrap();
        assert_eq!(padded, b"---\na: 1\n#    \n...\n");
        assert!(pad_text(text, text.len() + 1).is_none());
        assert!(pad_text(text, text.len() - 1).is_none());
    }

    #[test]
    fn test_write_atomic_leaves_target_on_failure() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("f.tsr");
        std::fs::write(&path, b"original")?;
        let result = write_atomic(&path, |w| {
            w.write_all(b"partial")?;
            Err(Error::Aborted { blocks_written: 0 })
        });
        assert!(result.is_err());
        assert_eq!(std::fs::read(&path)?, b"original");
        assert_eq!(std::fs::read_dir(dir.path())?.count(), 1);

        write_atomic(&path, |w| Ok(w.write_all(b"replaced")?))?;
        assert_eq!(std::fs::read(&path)?, b"replaced");
        Ok(())
    }
}

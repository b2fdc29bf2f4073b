use crate::codec::{LineDecoder, DEFAULT_MAX_LINE_LENGTH};
use crate::LoadResult;
use async_compression::tokio::bufread::{GzipDecoder, ZstdDecoder};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncRead, BufReader};
use tokio_util::codec::FramedRead;

/// Prefix given to a file's base name once it has been loaded.
pub const COMPLETION_MARKER: char = '.';

/// Lazy stream of decoded lines (`Stream<Item = io::Result<Line>>`).
///
/// The outer `Err` is a read or decompression failure; an inner `Err` is one
/// line that could not be framed or decoded.
pub type LineStream = FramedRead<Box<dyn AsyncRead + Unpin + Send>, LineDecoder>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Gzip,
    Zstd,
    Plain,
}

impl Compression {
    /// Guess from the file extension (`.gz`, `.zst`).
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|s| s.to_str()) {
            Some("gz") => Compression::Gzip,
            Some("zst") => Compression::Zstd,
            _ => Compression::Plain,
        }
    }
}

/// How input files are decoded into lines.
#[derive(Debug, Clone)]
pub struct SourceOptions {
    /// Which character encoding to expect (defaults to UTF-8)
    pub charset: &'static encoding_rs::Encoding,
    pub max_line_length: usize,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            charset: encoding_rs::UTF_8,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
        }
    }
}

/// Wrap a raw reader with the chosen decompression and line framing.
pub fn build_line_reader<R>(raw: R, compression: Compression, opts: &SourceOptions) -> LineStream
where
    R: AsyncRead + Unpin + Send + 'static,
{
    // Use a larger buffer for fewer syscalls (1 MiB)
    let buf = BufReader::with_capacity(1 << 20, raw);
    let decompressed: Box<dyn AsyncRead + Unpin + Send> = match compression {
        Compression::Gzip => {
            let mut dec = GzipDecoder::new(buf);
            // `cat a.gz b.gz` files are valid gzip
            dec.multiple_members(true);
            Box::new(dec)
        }
        Compression::Zstd => Box::new(ZstdDecoder::new(buf)),
        Compression::Plain => Box::new(buf),
    };

    FramedRead::with_capacity(
        decompressed,
        LineDecoder::new(opts.charset, opts.max_line_length),
        64 * 1024,
    )
}

/// Open a local file as a line stream, picking decompression from its extension.
///
/// Only the open itself can fail here; read and decompression errors show up
/// as `Err` items of the stream.
pub async fn open_lines(path: &Path, opts: &SourceOptions) -> LoadResult<LineStream> {
    let file = File::open(path).await?;
    Ok(build_line_reader(file, Compression::from_path(path), opts))
}

/// Path a file will have after [`mark_complete`].
pub fn marked_path(path: &Path) -> std::io::Result<PathBuf> {
    let name = path.file_name().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("no file name in {}", path.display()),
        )
    })?;
    let mut marked = std::ffi::OsString::from(COMPLETION_MARKER.to_string());
    marked.push(name);
    Ok(path.with_file_name(marked))
}

/// Rename `dir/name` to `dir/.name` so later runs skip it.
pub async fn mark_complete(path: &Path) -> std::io::Result<PathBuf> {
    let target = marked_path(path)?;
    tokio::fs::rename(path, &target).await?;
    Ok(target)
}

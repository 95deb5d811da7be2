use std::{
    fmt,
    fs::File,
    io::{Error as IoError, ErrorKind as IoErrorKind},
    path::{Path, PathBuf},
};

use glob::glob;
use rustix::{
    fd::AsFd,
    fs::{FileType, SeekFrom, fstat, seek},
    io::pread,
};

use crate::FsStatError;

const DEFAULT_SECTOR_SIZE: u64 = 512;

/// Image formats understood by [`Image`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ImageType {
    Raw,
}

impl ImageType {
    pub const ALL: &'static [ImageType] = &[ImageType::Raw];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Raw => "raw",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Raw => "Single or split raw file (dd)",
        }
    }
}

impl fmt::Display for ImageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Lists every supported image format, one `\t<name> (<description>)` line each.
pub fn type_print() -> String {
    let mut out = String::from("Supported image format types:\n");
    for itype in ImageType::ALL {
        out.push_str(&format!("\t{} ({})\n", itype.name(), itype.description()));
    }
    return out;
}

#[derive(Debug)]
struct Segment {
    path: PathBuf,
    file: File,
    start: u64,
    size: u64,
}

/// A raw disk image, backed by one file or by several ordered segments.
///
/// Segments are joined, in the order given, into one contiguous address
/// space. Reads are positional (`pread`), so an [`Image`] carries no cursor
/// and can be shared between any number of readers.
#[derive(Debug)]
pub struct Image {
    segments: Vec<Segment>,
    size: u64,
    sector_size: u64,
    itype: ImageType,
}

impl Image {
    /// Open an image from its ordered segment paths.
    ///
    /// # Errors
    /// - [`FsStatError::NoSegments`] if `paths` is empty.
    /// - [`FsStatError::SegmentOpen`] if a segment cannot be opened or stat'ed.
    pub fn open<I>(paths: I) -> Result<Image, FsStatError>
    where
        I: IntoIterator,
        I::Item: AsRef<Path>,
    {
        let mut segments = Vec::new();
        let mut start = 0u64;

        for path in paths {
            let path = path.as_ref();
            let (file, size) = open_segment(path).map_err(|source| FsStatError::SegmentOpen {
                path: path.to_path_buf(),
                source,
            })?;

            log::debug!("Image::open - SEGMENT: {path:?}, START: {start}, SIZE: {size}");

            segments.push(Segment {
                path: path.to_path_buf(),
                file,
                start,
                size,
            });
            start += size;
        }

        if segments.is_empty() {
            return Err(FsStatError::NoSegments);
        }

        return Ok(Image {
            segments,
            size: start,
            sector_size: DEFAULT_SECTOR_SIZE,
            itype: ImageType::Raw,
        });
    }

    /// Open a split image whose segments match a glob pattern.
    ///
    /// Matches are sorted by path before being joined, so the usual
    /// `image.001`, `image.002`, ... naming keeps its order.
    ///
    /// # Errors
    /// Returns [`FsStatError::Pattern`] for a malformed pattern,
    /// [`FsStatError::Glob`] if a match cannot be read, and the errors of
    /// [`Image::open`] otherwise.
    pub fn open_glob(pattern: &str) -> Result<Image, FsStatError> {
        let mut paths = Vec::new();
        for entry in glob(pattern)? {
            paths.push(entry?);
        }
        paths.sort();

        return Image::open(paths);
    }

    /// Read exactly `buf.len()` bytes at `offset`, crossing segment
    /// boundaries as needed.
    ///
    /// # Errors
    /// Returns [`IoErrorKind::UnexpectedEof`] if the range ends past the
    /// image, or the underlying read error.
    pub fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), IoError> {
        if offset
            .checked_add(buf.len() as u64)
            .is_none_or(|end| end > self.size)
        {
            return Err(IoErrorKind::UnexpectedEof.into());
        }

        let mut done = 0usize;

        while done < buf.len() {
            let pos = offset + done as u64;
            let idx = self.segments.partition_point(|s| s.start + s.size <= pos);
            let segment = self
                .segments
                .get(idx)
                .ok_or(IoError::from(IoErrorKind::UnexpectedEof))?;

            let seg_off = pos - segment.start;
            let want = (buf.len() - done).min((segment.size - seg_off) as usize);

            let n = pread(segment.file.as_fd(), &mut buf[done..done + want], seg_off)?;
            if n == 0 {
                return Err(IoErrorKind::UnexpectedEof.into());
            }
            done += n;
        }

        return Ok(());
    }

    pub fn read_vec_at(&self, offset: u64, len: usize) -> Result<Vec<u8>, IoError> {
        let mut buffer = vec![0u8; len];
        self.read_exact_at(offset, &mut buffer)?;
        return Ok(buffer);
    }

    /// Total addressable size in bytes.
    #[inline]
    pub fn size(&self) -> u64 {
        return self.size;
    }

    /// Sector size in bytes.
    #[inline]
    pub fn sector_size(&self) -> u64 {
        return self.sector_size;
    }

    #[inline]
    pub fn image_type(&self) -> ImageType {
        return self.itype;
    }

    /// Segment paths, in address order.
    pub fn segments(&self) -> impl Iterator<Item = &Path> {
        return self.segments.iter().map(|s| s.path.as_path());
    }

    pub fn segment_count(&self) -> usize {
        return self.segments.len();
    }

    #[inline]
    pub fn is_split(&self) -> bool {
        return self.segments.len() > 1;
    }
}

fn open_segment(path: &Path) -> Result<(File, u64), IoError> {
    let file = File::open(path)?;
    let stat = fstat(file.as_fd())?;

    let size = if FileType::from_raw_mode(stat.st_mode).is_block_device() {
        seek(file.as_fd(), SeekFrom::End(0))?
    } else {
        stat.st_size as u64
    };

    return Ok((file, size));
}

use std::io::{Error as IoError, ErrorKind as IoErrorKind};

use zerocopy::FromBytes;

use crate::image::Image;

/// A magic signature and where to find it, relative to the probed window.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct Magic {
    /// The magic value as a byte slice.
    pub magic: &'static [u8],
    /// Number of bytes of `magic` to compare.
    pub len: usize,
    /// Offset of the magic from the start of the window.
    pub b_offset: u64,
}

impl Magic {
    /// Used for probes that have no signature to check.
    pub const EMPTY_MAGIC: Magic = Magic {
        magic: &[0],
        len: 0,
        b_offset: 0,
    };
}

/// A read-only byte window `[offset, offset + size)` over an [`Image`].
///
/// Every partition table and filesystem probe reads through a [`Probe`],
/// with offsets relative to the start of the window.
#[derive(Debug, Copy, Clone)]
pub(crate) struct Probe<'a> {
    image: &'a Image,
    offset: u64,
    size: u64,
}

impl<'a> Probe<'a> {
    pub(crate) fn new(image: &'a Image, offset: u64, size: u64) -> Probe<'a> {
        return Probe {
            image,
            offset,
            size,
        };
    }

    pub(crate) fn whole(image: &'a Image) -> Probe<'a> {
        return Probe::new(image, 0, image.size());
    }

    pub(crate) fn image(&self) -> &'a Image {
        return self.image;
    }

    #[inline]
    pub(crate) fn offset(&self) -> u64 {
        return self.offset;
    }

    #[inline]
    pub(crate) fn size(&self) -> u64 {
        return self.size;
    }

    /// Sector size of the underlying image.
    #[inline]
    pub(crate) fn ssz(&self) -> u64 {
        return self.image.sector_size();
    }

    fn check_range(&self, offset: u64, len: usize) -> Result<(), IoError> {
        match offset.checked_add(len as u64) {
            Some(end) if end <= self.size => return Ok(()),
            _ => return Err(IoErrorKind::UnexpectedEof.into()),
        }
    }

    pub(crate) fn read_into(&self, offset: u64, buf: &mut [u8]) -> Result<(), IoError> {
        self.check_range(offset, buf.len())?;
        return self.image.read_exact_at(self.offset + offset, buf);
    }

    pub(crate) fn read_exact_at<const S: usize>(&self, offset: u64) -> Result<[u8; S], IoError> {
        let mut buffer = [0u8; S];
        self.read_into(offset, &mut buffer)?;

        return Ok(buffer);
    }

    pub(crate) fn read_vec_at(&self, offset: u64, buf_size: usize) -> Result<Vec<u8>, IoError> {
        let mut buffer = vec![0u8; buf_size];
        self.read_into(offset, &mut buffer)?;

        return Ok(buffer);
    }

    pub(crate) fn map_from<T: FromBytes>(&self, offset: u64) -> Result<T, IoError> {
        let buffer = self.read_vec_at(offset, core::mem::size_of::<T>())?;

        let data = T::read_from_bytes(&buffer).map_err(|_| IoErrorKind::UnexpectedEof)?;

        return Ok(data);
    }

    /// Look up the first matching magic of `magics`.
    ///
    /// # Returns
    /// - `Ok(Some(Magic))` if a match is found.
    /// - `Ok(None)` if no magics are defined.
    /// - `Err(IoError)` with [`IoErrorKind::NotFound`] if none matches, or
    ///   the read error. Magics lying past the end of the window never match.
    pub(crate) fn get_magic(
        &self,
        magics: Option<&'static [Magic]>,
    ) -> Result<Option<Magic>, IoError> {
        let mut buffer = [0u8; 16];
        match magics {
            Some(magics) => {
                for magic in magics {
                    let len = magic.len.min(buffer.len());

                    match self.read_into(magic.b_offset, &mut buffer[..len]) {
                        Ok(()) => (),
                        Err(e) if e.kind() == IoErrorKind::UnexpectedEof => continue,
                        Err(e) => return Err(e),
                    }

                    if buffer[..len] == magic.magic[..len] {
                        return Ok(Some(*magic));
                    }
                }
            }
            None => return Ok(None),
        }

        return Err(IoErrorKind::NotFound.into());
    }

    /// A sub-window starting `offset` bytes into this one.
    pub(crate) fn sub(&self, offset: u64) -> Option<Probe<'a>> {
        if offset > self.size {
            return None;
        }
        return Some(Probe::new(self.image, self.offset + offset, self.size - offset));
    }
}

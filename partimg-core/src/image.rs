//! On-disk image container: header, filesystem descriptor, options, bitmap.
//!
//! All integers are little-endian and every field has a fixed width:
//!
//! ```text
//! Header      magic[15] writer_version[4] format_version[4] endianness(u16)
//! Descriptor  fs_tag[15] device_size(u64) total_blocks(u64) used_blocks(u64)
//!             used_blocks_verified(u64) block_size(u32)
//! Options     struct_size(u32) format_version(u16) cpu_width(u16)
//!             checksum_algo(u16) checksum_size(u16) blocks_per_checksum(u32)
//!             reseed(u8) bitmap_encoding(u8)
//! crc32(u32)  over the 94 bytes above
//! bitmap      ceil(total_blocks / 8) bytes, then crc32(u32)
//! ```
use std::io::{Read, Write};

use crate::bitmap::{BlockBitmap, bitmap_len};
use crate::checksum::{ChecksumAlgorithm, crc32};
use crate::error::{Error, ImageSection, Result};

pub const IMAGE_MAGIC: &[u8; 15] = b"partclone-image";
pub const WRITER_VERSION: &[u8; 4] = b"0100";
pub const FORMAT_VERSION: &[u8; 4] = b"0002";
pub const FORMAT_VERSION_NUM: u16 = 2;
/// Written as little-endian; a big-endian writer would produce `0xDEC0` here.
pub const ENDIANNESS_TAG: u16 = 0xC0DE;

pub const HEADER_SIZE: usize = 15 + 4 + 4 + 2;
pub const DESCRIPTOR_SIZE: usize = 15 + 8 * 4 + 4;
pub const OPTIONS_SIZE: usize = 4 + 2 + 2 + 2 + 2 + 4 + 1 + 1;
/// Header, descriptor and options, without the trailing CRC.
pub const IMAGE_HEAD_SIZE: usize = HEADER_SIZE + DESCRIPTOR_SIZE + OPTIONS_SIZE;
pub const CRC_SIZE: usize = 4;

const FS_TAG_LEN: usize = 15;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageHeader {
    pub magic: [u8; 15],
    pub writer_version: [u8; 4],
    pub format_version: [u8; 4],
    pub endianness: u16,
}

impl Default for ImageHeader {
    fn default() -> Self {
        Self {
            magic: *IMAGE_MAGIC,
            writer_version: *WRITER_VERSION,
            format_version: *FORMAT_VERSION,
            endianness: ENDIANNESS_TAG,
        }
    }
}

/// Geometry of the imaged filesystem, as reported by its probe.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FilesystemDescriptor {
    pub fs_tag: [u8; 15],
    pub device_size: u64,
    pub total_blocks: u64,
    pub used_blocks: u64,
    pub used_blocks_verified: u64,
    pub block_size: u32,
}

impl FilesystemDescriptor {
    pub fn new(fs_name: &str, block_size: u32, total_blocks: u64, used_blocks: u64) -> Self {
        let mut fs_tag = [0u8; FS_TAG_LEN];
        let name = fs_name.as_bytes();
        let n = name.len().min(FS_TAG_LEN);
        fs_tag[..n].copy_from_slice(&name[..n]);
        Self {
            fs_tag,
            device_size: total_blocks * u64::from(block_size),
            total_blocks,
            used_blocks,
            used_blocks_verified: used_blocks,
            block_size,
        }
    }

    /// The filesystem tag with trailing NULs removed.
    pub fn fs_name(&self) -> String {
        let end = self
            .fs_tag
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(FS_TAG_LEN);
        String::from_utf8_lossy(&self.fs_tag[..end]).into_owned()
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(Error::Format("block size is zero".into()));
        }
        let expected = self
            .total_blocks
            .checked_mul(u64::from(self.block_size))
            .ok_or_else(|| Error::Format("device size overflows".into()))?;
        if expected != self.device_size {
            return Err(Error::Format(format!(
                "device size {} does not match {} blocks of {} bytes",
                self.device_size, self.total_blocks, self.block_size
            )));
        }
        if self.used_blocks_verified > self.total_blocks {
            return Err(Error::Format(format!(
                "{} used blocks exceed {} total blocks",
                self.used_blocks_verified, self.total_blocks
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum BitmapEncoding {
    /// One bit per block.
    #[default]
    Bit = 0x01,
    /// One byte per block, found in images from older writers.
    Byte = 0x08,
}

impl BitmapEncoding {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(BitmapEncoding::Bit),
            0x08 => Some(BitmapEncoding::Byte),
            _ => None,
        }
    }

    /// Stored bitmap length in bytes, excluding the CRC.
    pub fn stored_len(self, total_blocks: u64) -> usize {
        match self {
            BitmapEncoding::Bit => bitmap_len(total_blocks),
            BitmapEncoding::Byte => total_blocks as usize,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageOptions {
    pub struct_size: u32,
    pub format_version: u16,
    pub cpu_width: u16,
    pub checksum: ChecksumAlgorithm,
    pub checksum_size: u16,
    pub blocks_per_checksum: u32,
    pub reseed: bool,
    pub bitmap_encoding: BitmapEncoding,
}

impl ImageOptions {
    pub fn new(checksum: ChecksumAlgorithm, blocks_per_checksum: u32, reseed: bool) -> Self {
        Self {
            struct_size: OPTIONS_SIZE as u32,
            format_version: FORMAT_VERSION_NUM,
            cpu_width: usize::BITS as u16,
            checksum,
            checksum_size: checksum.size() as u16,
            blocks_per_checksum,
            reseed,
            bitmap_encoding: BitmapEncoding::Bit,
        }
    }
}

/// Everything stored in front of the bitmap.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageHead {
    pub header: ImageHeader,
    pub descriptor: FilesystemDescriptor,
    pub options: ImageOptions,
}

/// Little-endian field writer over a fixed buffer.
struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    fn bytes(&mut self, b: &[u8]) {
        self.buf.extend_from_slice(b);
    }
    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }
    fn u16(&mut self, v: u16) {
        self.bytes(&v.to_le_bytes());
    }
    fn u32(&mut self, v: u32) {
        self.bytes(&v.to_le_bytes());
    }
    fn u64(&mut self, v: u64) {
        self.bytes(&v.to_le_bytes());
    }
}

struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        out
    }
    fn u8(&mut self) -> u8 {
        self.take::<1>()[0]
    }
    fn u16(&mut self) -> u16 {
        u16::from_le_bytes(self.take())
    }
    fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.take())
    }
    fn u64(&mut self) -> u64 {
        u64::from_le_bytes(self.take())
    }
}

/// Serializes the image head plus its CRC.
pub fn encode_head(descriptor: &FilesystemDescriptor, options: &ImageOptions) -> Vec<u8> {
    let header = ImageHeader::default();
    let mut enc = Encoder {
        buf: Vec::with_capacity(IMAGE_HEAD_SIZE + CRC_SIZE),
    };
    enc.bytes(&header.magic);
    enc.bytes(&header.writer_version);
    enc.bytes(&header.format_version);
    enc.u16(header.endianness);

    enc.bytes(&descriptor.fs_tag);
    enc.u64(descriptor.device_size);
    enc.u64(descriptor.total_blocks);
    enc.u64(descriptor.used_blocks);
    enc.u64(descriptor.used_blocks_verified);
    enc.u32(descriptor.block_size);

    enc.u32(options.struct_size);
    enc.u16(options.format_version);
    enc.u16(options.cpu_width);
    enc.u16(options.checksum.code());
    enc.u16(options.checksum_size);
    enc.u32(options.blocks_per_checksum);
    enc.u8(u8::from(options.reseed));
    enc.u8(options.bitmap_encoding as u8);

    let crc = crc32(&enc.buf);
    enc.u32(crc);
    enc.buf
}

/// Writes header, descriptor and options followed by their CRC in a single write.
pub fn write_header<W: Write + ?Sized>(
    stream: &mut W,
    descriptor: &FilesystemDescriptor,
    options: &ImageOptions,
) -> Result<()> {
    let buf = encode_head(descriptor, options);
    stream.write_all(&buf).map_err(|e| Error::write(0, e))
}

/// Parses an image head from exactly `IMAGE_HEAD_SIZE + CRC_SIZE` bytes.
pub fn decode_head(buf: &[u8]) -> Result<ImageHead> {
    if buf.len() < IMAGE_HEAD_SIZE + CRC_SIZE {
        return Err(Error::Format(format!(
            "image head is {} bytes, expected {}",
            buf.len(),
            IMAGE_HEAD_SIZE + CRC_SIZE
        )));
    }
    let mut dec = Decoder { buf, pos: 0 };
    let header = ImageHeader {
        magic: dec.take(),
        writer_version: dec.take(),
        format_version: dec.take(),
        endianness: dec.u16(),
    };
    if &header.magic != IMAGE_MAGIC {
        return Err(Error::Format("bad image magic".into()));
    }
    if header.endianness != ENDIANNESS_TAG {
        return Err(Error::Endianness {
            found: header.endianness,
        });
    }
    if &header.format_version != FORMAT_VERSION {
        return Err(Error::Format(format!(
            "unsupported image format version {:?}",
            String::from_utf8_lossy(&header.format_version)
        )));
    }

    let descriptor = FilesystemDescriptor {
        fs_tag: dec.take(),
        device_size: dec.u64(),
        total_blocks: dec.u64(),
        used_blocks: dec.u64(),
        used_blocks_verified: dec.u64(),
        block_size: dec.u32(),
    };

    let struct_size = dec.u32();
    let format_version = dec.u16();
    let cpu_width = dec.u16();
    let checksum_code = dec.u16();
    let checksum_size = dec.u16();
    let blocks_per_checksum = dec.u32();
    let reseed = dec.u8() != 0;
    let encoding_code = dec.u8();

    let stored = dec.u32();
    let computed = crc32(&buf[..IMAGE_HEAD_SIZE]);
    if stored != computed {
        return Err(Error::Corrupt {
            section: ImageSection::Header,
            stored,
            computed,
        });
    }

    if struct_size as usize != OPTIONS_SIZE {
        return Err(Error::Format(format!(
            "options structure is {struct_size} bytes, expected {OPTIONS_SIZE}"
        )));
    }
    let checksum = ChecksumAlgorithm::from_code(checksum_code).ok_or_else(|| {
        Error::Format(format!("unknown checksum algorithm {checksum_code:#06x}"))
    })?;
    if checksum_size as usize != checksum.size() {
        return Err(Error::Format(format!(
            "checksum size {checksum_size} does not match {checksum}"
        )));
    }
    let bitmap_encoding = BitmapEncoding::from_code(encoding_code)
        .ok_or_else(|| Error::Format(format!("unknown bitmap encoding {encoding_code:#04x}")))?;
    descriptor.validate()?;

    Ok(ImageHead {
        header,
        descriptor,
        options: ImageOptions {
            struct_size,
            format_version,
            cpu_width,
            checksum,
            checksum_size,
            blocks_per_checksum,
            reseed,
            bitmap_encoding,
        },
    })
}

/// Reads and validates the image head from the start of `stream`.
pub fn read_header<R: Read + ?Sized>(stream: &mut R) -> Result<ImageHead> {
    let mut buf = [0u8; IMAGE_HEAD_SIZE + CRC_SIZE];
    stream.read_exact(&mut buf).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::Format("image is shorter than its header".into())
        } else {
            Error::read(0, e)
        }
    })?;
    decode_head(&buf)
}

/// Writes the bitmap bytes followed by their CRC.
pub fn write_bitmap<W: Write + ?Sized>(stream: &mut W, bitmap: &BlockBitmap) -> Result<()> {
    let bytes = bitmap.as_bytes();
    let offset = (IMAGE_HEAD_SIZE + CRC_SIZE) as u64;
    stream.write_all(bytes).map_err(|e| Error::write(offset, e))?;
    stream
        .write_all(&crc32(bytes).to_le_bytes())
        .map_err(|e| Error::write(offset + bytes.len() as u64, e))
}

/// Result of a bitmap read that tolerates a CRC mismatch.
#[derive(Debug)]
pub struct LenientBitmap {
    pub bitmap: BlockBitmap,
    /// `Some` when the stored CRC did not match; holds the mismatch.
    pub corruption: Option<Error>,
}

/// Reads the bitmap and checks its CRC.
pub fn read_bitmap<R: Read + ?Sized>(
    stream: &mut R,
    total_blocks: u64,
    encoding: BitmapEncoding,
) -> Result<BlockBitmap> {
    let lenient = read_bitmap_lenient(stream, total_blocks, encoding)?;
    match lenient.corruption {
        Some(err) => Err(err),
        None => Ok(lenient.bitmap),
    }
}

/// Reads the bitmap, reporting a CRC mismatch instead of failing on it.
/// Only meant for informational queries.
pub fn read_bitmap_lenient<R: Read + ?Sized>(
    stream: &mut R,
    total_blocks: u64,
    encoding: BitmapEncoding,
) -> Result<LenientBitmap> {
    let offset = (IMAGE_HEAD_SIZE + CRC_SIZE) as u64;
    let len = encoding.stored_len(total_blocks);
    let mut raw = Vec::new();
    raw.try_reserve_exact(len)
        .map_err(|_| Error::InsufficientMemory {
            needed: len as u64,
            available: 0,
        })?;
    raw.resize(len, 0);
    stream.read_exact(&mut raw).map_err(|e| Error::read(offset, e))?;
    let mut crc_buf = [0u8; CRC_SIZE];
    stream
        .read_exact(&mut crc_buf)
        .map_err(|e| Error::read(offset + len as u64, e))?;
    let stored = u32::from_le_bytes(crc_buf);
    let computed = crc32(&raw);
    let corruption = (stored != computed).then_some(Error::Corrupt {
        section: ImageSection::Bitmap,
        stored,
        computed,
    });

    let bitmap = match encoding {
        BitmapEncoding::Bit => BlockBitmap::from_bytes(total_blocks, raw)?,
        BitmapEncoding::Byte => {
            let mut bitmap = BlockBitmap::create(total_blocks)?;
            for (index, &byte) in raw.iter().enumerate() {
                if byte != 0 {
                    bitmap.set(index as u64)?;
                }
            }
            bitmap
        }
    };
    Ok(LenientBitmap { bitmap, corruption })
}

/// Size of everything in front of the data stream.
pub fn data_offset(total_blocks: u64, encoding: BitmapEncoding) -> u64 {
    (IMAGE_HEAD_SIZE + CRC_SIZE + encoding.stored_len(total_blocks) + CRC_SIZE) as u64
}

/// Number of checksum tags interleaved with `blocks` data blocks.
pub fn tag_count(blocks: u64, blocks_per_checksum: u32) -> u64 {
    if blocks_per_checksum == 0 {
        return 0;
    }
    blocks.div_ceil(u64::from(blocks_per_checksum))
}

/// Total image size for a descriptor and options.
pub fn image_size(descriptor: &FilesystemDescriptor, options: &ImageOptions) -> u64 {
    let blocks = descriptor.used_blocks_verified;
    data_offset(descriptor.total_blocks, options.bitmap_encoding)
        + blocks * u64::from(descriptor.block_size)
        + tag_count(blocks, options.blocks_per_checksum) * u64::from(options.checksum_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample() -> (FilesystemDescriptor, ImageOptions) {
        let mut desc = FilesystemDescriptor::new("EXTFS", 4096, 1000, 250);
        desc.used_blocks_verified = 248;
        (desc, ImageOptions::new(ChecksumAlgorithm::Crc32, 64, true))
    }

    #[test]
    fn layout_sizes() {
        assert_eq!(HEADER_SIZE, 25);
        assert_eq!(DESCRIPTOR_SIZE, 51);
        assert_eq!(OPTIONS_SIZE, 18);
        let (desc, opts) = sample();
        assert_eq!(encode_head(&desc, &opts).len(), 98);
    }

    #[test]
    fn head_round_trip() {
        let (desc, opts) = sample();
        let mut buf = Vec::new();
        write_header(&mut buf, &desc, &opts).unwrap();
        let head = read_header(&mut Cursor::new(&buf)).unwrap();
        assert_eq!(head.descriptor, desc);
        assert_eq!(head.options, opts);
        assert_eq!(head.header, ImageHeader::default());
        assert_eq!(head.descriptor.fs_name(), "EXTFS");
    }

    #[test]
    fn endianness_tag_is_little_endian_on_disk() {
        let (desc, opts) = sample();
        let buf = encode_head(&desc, &opts);
        assert_eq!(&buf[23..25], &[0xDE, 0xC0]);
    }

    #[test]
    fn bad_magic_is_format_error() {
        let (desc, opts) = sample();
        let mut buf = encode_head(&desc, &opts);
        buf[0] = b'X';
        assert!(matches!(decode_head(&buf), Err(Error::Format(_))));
    }

    #[test]
    fn swapped_endianness_is_rejected() {
        let (desc, opts) = sample();
        let mut buf = encode_head(&desc, &opts);
        buf.swap(23, 24);
        assert!(matches!(
            decode_head(&buf),
            Err(Error::Endianness { found: 0xDEC0 })
        ));
    }

    #[test]
    fn flipped_descriptor_byte_is_corrupt() {
        let (desc, opts) = sample();
        let mut buf = encode_head(&desc, &opts);
        buf[30] ^= 0x01;
        assert!(matches!(
            decode_head(&buf),
            Err(Error::Corrupt {
                section: ImageSection::Header,
                ..
            })
        ));
    }

    #[test]
    fn mismatched_checksum_size_is_format_error() {
        let (desc, mut opts) = sample();
        opts.checksum_size = 2;
        let buf = encode_head(&desc, &opts);
        assert!(matches!(decode_head(&buf), Err(Error::Format(_))));
    }

    #[test]
    fn truncated_header_is_format_error() {
        let (desc, opts) = sample();
        let buf = encode_head(&desc, &opts);
        assert!(matches!(
            read_header(&mut Cursor::new(&buf[..50])),
            Err(Error::Format(_))
        ));
    }

    #[test]
    fn bitmap_round_trip_and_corruption() {
        let mut bm = BlockBitmap::create(101).unwrap();
        for i in (0..101).step_by(3) {
            bm.set(i).unwrap();
        }
        let mut buf = Vec::new();
        write_bitmap(&mut buf, &bm).unwrap();
        assert_eq!(buf.len(), 13 + 4);
        let back = read_bitmap(&mut Cursor::new(&buf), 101, BitmapEncoding::Bit).unwrap();
        assert_eq!(back, bm);

        buf[5] ^= 0x40;
        assert!(matches!(
            read_bitmap(&mut Cursor::new(&buf), 101, BitmapEncoding::Bit),
            Err(Error::Corrupt {
                section: ImageSection::Bitmap,
                ..
            })
        ));
        let lenient =
            read_bitmap_lenient(&mut Cursor::new(&buf), 101, BitmapEncoding::Bit).unwrap();
        assert!(lenient.corruption.is_some());
    }

    #[test]
    fn byte_encoded_bitmap_is_decoded() {
        let raw = vec![1u8, 0, 0, 1, 1, 0, 0, 0, 0, 1];
        let mut buf = raw.clone();
        buf.extend_from_slice(&crc32(&raw).to_le_bytes());
        let bm = read_bitmap(&mut Cursor::new(&buf), 10, BitmapEncoding::Byte).unwrap();
        assert_eq!(bm.count_set(), 4);
        assert!(bm.get(9).unwrap());
        assert!(!bm.get(1).unwrap());
    }

    #[test]
    fn tag_counts() {
        assert_eq!(tag_count(10, 4), 3);
        assert_eq!(tag_count(8, 4), 2);
        assert_eq!(tag_count(10, 0), 0);
        assert_eq!(tag_count(0, 4), 0);
    }
}

//! Tile payload codecs and the tile stream format.
//!
//! A version 2 stream starts with a text header and carries one record per
//! tile:
//!
//! ```text
//! VERSION 2
//! TILEWIDTH 64
//! TILEHEIGHT 64
//! PIXELSIZE <n>
//! DATA <count>
//! <x>,<y>,LZF,<len>
//! <len payload bytes: flag byte + raw or LZF-packed planar pixels>
//! ...
//! ```
//!
//! Version 1 (legacy) streams start with the tile count on its own line and
//! carry `<x>,<y>,<w>,<h>` records followed by raw interleaved pixels.

mod compressor2;
mod legacy;
pub mod lzf;

use std::io::{BufRead, Read, Write};

use tracing::warn;

use crate::error::{TileError, TileResult};
use crate::geometry::Rect;
use crate::{TILE_HEIGHT, TILE_WIDTH};

pub use compressor2::TileCompressor2;
pub(crate) use compressor2::FLAG_RAW;
pub use legacy::LegacyTileCompressor;

pub const LEGACY_VERSION: u32 = 1;
pub const CURRENT_VERSION: u32 = 2;

/// Longest header line accepted before the stream is considered garbage.
const MAX_HEADER_LINE: usize = 80;

/// One decoded tile record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileRecord {
    /// Canvas area covered by `data`; a whole tile for version 2 streams.
    pub rect: Rect,
    /// Interleaved pixels, `rect.width * rect.height * pixel_size` bytes.
    pub data: Vec<u8>,
}

/// Encodes and decodes single tiles of a tile stream.
pub trait TileCompressor: Send + Sync {
    fn version(&self) -> u32;

    /// Writes the record header and payload for the tile at `(col, row)`.
    fn write_tile(&self, col: i32, row: i32, data: &[u8], out: &mut dyn Write) -> TileResult<()>;

    /// Reads the next record.
    fn read_tile(&self, input: &mut dyn BufRead, pixel_size: usize) -> TileResult<TileRecord>;

    /// Encodes one tile buffer, appending to `out`.
    fn compress_tile_data(&self, input: &[u8], pixel_size: usize, out: &mut Vec<u8>)
        -> TileResult<()>;

    /// Decodes one payload into `out`, which must be exactly one tile long.
    fn decompress_tile_data(&self, input: &[u8], pixel_size: usize, out: &mut [u8])
        -> TileResult<()>;

    /// Upper bound of an encoded payload for one tile.
    fn tile_data_buffer_size(&self, pixel_size: usize) -> usize;
}

/// Returns the codec for a stream `version`.
pub fn compressor_for_version(version: u32) -> TileResult<Box<dyn TileCompressor>> {
    match version {
        LEGACY_VERSION => Ok(Box::new(LegacyTileCompressor)),
        CURRENT_VERSION => Ok(Box::new(TileCompressor2::new())),
        other => Err(TileError::format(format!("unsupported tile stream version {other}"))),
    }
}

/// Bytes of one tile with `pixel_size` bytes per pixel.
#[inline]
pub const fn tile_data_size(pixel_size: usize) -> usize {
    TILE_WIDTH * TILE_HEIGHT * pixel_size
}

/// Regroups interleaved pixels into byte planes: byte `i` of pixel `p` moves
/// to `output[i * pixels + p]`.
pub fn linearize(input: &[u8], output: &mut [u8], pixel_size: usize) {
    debug_assert_eq!(input.len(), output.len());
    let pixels = input.len() / pixel_size;
    for (p, pixel) in input.chunks_exact(pixel_size).enumerate() {
        for (i, &byte) in pixel.iter().enumerate() {
            output[i * pixels + p] = byte;
        }
    }
}

/// Inverse of [`linearize`].
pub fn delinearize(input: &[u8], output: &mut [u8], pixel_size: usize) {
    debug_assert_eq!(input.len(), output.len());
    let pixels = input.len() / pixel_size;
    for (p, pixel) in output.chunks_exact_mut(pixel_size).enumerate() {
        for (i, byte) in pixel.iter_mut().enumerate() {
            *byte = input[i * pixels + p];
        }
    }
}

/// Parsed stream header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHeader {
    pub version: u32,
    pub tile_count: u32,
}

/// Writes the version 2 header, or the bare tile count for version 1.
pub fn write_header(
    out: &mut dyn Write,
    version: u32,
    pixel_size: usize,
    tile_count: usize,
) -> TileResult<()> {
    if version == LEGACY_VERSION {
        writeln!(out, "{tile_count}")?;
    } else {
        write!(
            out,
            "VERSION {version}\nTILEWIDTH {TILE_WIDTH}\nTILEHEIGHT {TILE_HEIGHT}\nPIXELSIZE {pixel_size}\nDATA {tile_count}\n"
        )?;
    }
    Ok(())
}

/// Reads and validates a stream header against the grid's `pixel_size`.
///
/// Version 2 headers must carry `TILEWIDTH`, `TILEHEIGHT` and `PIXELSIZE`
/// matching this grid before the closing `DATA` line.
pub fn read_header(input: &mut dyn BufRead, pixel_size: usize) -> TileResult<StreamHeader> {
    let first = read_line(input)?;
    if !first.starts_with('V') {
        let tile_count = first
            .parse::<u32>()
            .map_err(|_| TileError::format(format!("bad legacy tile count {first:?}")))?;
        return Ok(StreamHeader {
            version: LEGACY_VERSION,
            tile_count,
        });
    }

    let (keyword, version) = split_field(&first)?;
    if keyword != "VERSION" {
        return Err(TileError::format(format!("expected VERSION, found {keyword:?}")));
    }
    let version = u32::try_from(version)
        .map_err(|_| TileError::format(format!("bad stream version {version}")))?;

    let mut seen_width = false;
    let mut seen_height = false;
    let mut seen_pixel_size = false;
    let tile_count = loop {
        let line = read_line(input)?;
        let (keyword, value) = split_field(&line)?;
        match keyword {
            "TILEWIDTH" => {
                if value != TILE_WIDTH as i64 {
                    return Err(TileError::format(format!("tile width {value} != {TILE_WIDTH}")));
                }
                seen_width = true;
            }
            "TILEHEIGHT" => {
                if value != TILE_HEIGHT as i64 {
                    return Err(TileError::format(format!("tile height {value} != {TILE_HEIGHT}")));
                }
                seen_height = true;
            }
            "PIXELSIZE" => {
                if value != pixel_size as i64 {
                    return Err(TileError::PixelSizeMismatch {
                        expected: pixel_size,
                        found: value.max(0) as usize,
                    });
                }
                seen_pixel_size = true;
            }
            "DATA" => {
                break u32::try_from(value)
                    .map_err(|_| TileError::format(format!("bad tile count {value}")))?;
            }
            other => {
                warn!(keyword = other, value, "unexpected tile stream header field");
                return Err(TileError::format(format!("unexpected header field {other:?}")));
            }
        }
    };
    if !(seen_width && seen_height && seen_pixel_size) {
        return Err(TileError::format("not enough fields in tile stream header"));
    }
    Ok(StreamHeader {
        version,
        tile_count,
    })
}

fn split_field(line: &str) -> TileResult<(&str, i64)> {
    let mut parts = line.split(' ');
    let keyword = parts.next().unwrap_or_default();
    let value = parts
        .next()
        .and_then(|v| v.parse::<i64>().ok())
        .ok_or_else(|| TileError::format(format!("malformed header line {line:?}")))?;
    Ok((keyword, value))
}

/// Reads one `\n`-terminated line without the terminator.
pub(crate) fn read_line(input: &mut dyn BufRead) -> TileResult<String> {
    let mut raw = Vec::new();
    let read = Read::take(&mut *input, MAX_HEADER_LINE as u64).read_until(b'\n', &mut raw)?;
    if read == 0 {
        return Err(TileError::format("unexpected end of tile stream"));
    }
    if raw.last() != Some(&b'\n') {
        return Err(TileError::format("tile stream line too long or truncated"));
    }
    let text = std::str::from_utf8(&raw)
        .map_err(|_| TileError::format("tile stream line is not text"))?;
    Ok(text.trim().to_owned())
}

/// Parses a comma separated record header into exactly `N` fields.
pub(crate) fn split_record<const N: usize>(line: &str) -> TileResult<[&str; N]> {
    let mut fields = [""; N];
    let mut parts = line.split(',');
    for field in fields.iter_mut() {
        *field = parts
            .next()
            .ok_or_else(|| TileError::format(format!("short tile record header {line:?}")))?;
    }
    if parts.next().is_some() {
        return Err(TileError::format(format!("long tile record header {line:?}")));
    }
    Ok(fields)
}

pub(crate) fn parse_i32(field: &str) -> TileResult<i32> {
    field
        .trim()
        .parse()
        .map_err(|_| TileError::format(format!("bad integer {field:?} in tile record")))
}

pub(crate) fn read_exact_payload(input: &mut dyn BufRead, len: usize) -> TileResult<Vec<u8>> {
    let mut payload = vec![0u8; len];
    input.read_exact(&mut payload).map_err(|err| {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            TileError::format("tile stream truncated inside a payload")
        } else {
            TileError::Io(err)
        }
    })?;
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn linearize_groups_channels() {
        let interleaved = [1, 2, 3, 11, 12, 13];
        let mut planar = [0u8; 6];
        linearize(&interleaved, &mut planar, 3);
        assert_eq!(planar, [1, 11, 2, 12, 3, 13]);
        let mut back = [0u8; 6];
        delinearize(&planar, &mut back, 3);
        assert_eq!(back, interleaved);
    }

    #[test]
    fn header_round_trip() {
        let mut out = Vec::new();
        write_header(&mut out, CURRENT_VERSION, 4, 17).unwrap();
        assert_eq!(
            String::from_utf8(out.clone()).unwrap(),
            "VERSION 2\nTILEWIDTH 64\nTILEHEIGHT 64\nPIXELSIZE 4\nDATA 17\n"
        );
        let header = read_header(&mut Cursor::new(out), 4).unwrap();
        assert_eq!(header, StreamHeader { version: 2, tile_count: 17 });
    }

    #[test]
    fn header_mismatches_are_rejected() {
        let wrong_pixel = b"VERSION 2\nTILEWIDTH 64\nTILEHEIGHT 64\nPIXELSIZE 3\nDATA 1\n";
        assert!(matches!(
            read_header(&mut Cursor::new(&wrong_pixel[..]), 4),
            Err(TileError::PixelSizeMismatch { expected: 4, found: 3 })
        ));
        let wrong_width = b"VERSION 2\nTILEWIDTH 32\nTILEHEIGHT 64\nPIXELSIZE 4\nDATA 1\n";
        assert!(read_header(&mut Cursor::new(&wrong_width[..]), 4).is_err());
        let missing = b"VERSION 2\nTILEWIDTH 64\nDATA 1\n";
        assert!(read_header(&mut Cursor::new(&missing[..]), 4).is_err());
        let unknown = b"VERSION 2\nCOLOR 1\n";
        assert!(read_header(&mut Cursor::new(&unknown[..]), 4).is_err());
    }

    #[test]
    fn legacy_header_is_a_count() {
        let header = read_header(&mut Cursor::new(&b"12\n"[..]), 1).unwrap();
        assert_eq!(header, StreamHeader { version: LEGACY_VERSION, tile_count: 12 });
    }
}

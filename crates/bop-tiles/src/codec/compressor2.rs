use std::io::{BufRead, Write};

use super::{
    delinearize, linearize, lzf, parse_i32, read_exact_payload, read_line, split_record,
    tile_data_size, TileCompressor, TileRecord, CURRENT_VERSION,
};
use crate::error::{TileError, TileResult};
use crate::geometry::Rect;
use crate::{TILE_HEIGHT, TILE_WIDTH};

const CODEC_NAME: &str = "LZF";

/// Payload flag: the rest is the raw interleaved tile.
pub(crate) const FLAG_RAW: u8 = 0;
/// Payload flag: the rest is LZF over the byte planes of the tile.
pub(crate) const FLAG_COMPRESSED: u8 = 1;

/// Version 2 codec: `x,y,LZF,len` followed by a flagged payload.
#[derive(Debug, Default, Clone, Copy)]
pub struct TileCompressor2;

impl TileCompressor2 {
    pub fn new() -> Self {
        Self
    }

    /// Packs `input` into `out` (appending): the LZF form when it is smaller
    /// than the tile, the raw form otherwise.
    pub(crate) fn pack(input: &[u8], pixel_size: usize, out: &mut Vec<u8>) {
        let mut planar = vec![0u8; input.len()];
        linearize(input, &mut planar, pixel_size);
        let mut packed = Vec::with_capacity(input.len());
        let packed_len = lzf::compress(&planar, &mut packed);
        if packed_len > 0 && packed_len < input.len() {
            out.push(FLAG_COMPRESSED);
            out.extend_from_slice(&packed);
        } else {
            out.push(FLAG_RAW);
            out.extend_from_slice(input);
        }
    }

    pub(crate) fn unpack(input: &[u8], pixel_size: usize, out: &mut [u8]) -> TileResult<()> {
        let (&flag, body) = input
            .split_first()
            .ok_or_else(|| TileError::corruption("empty tile payload"))?;
        match flag {
            FLAG_RAW => {
                if body.len() != out.len() {
                    return Err(TileError::corruption(format!(
                        "raw payload of {} bytes for a {} byte tile",
                        body.len(),
                        out.len()
                    )));
                }
                out.copy_from_slice(body);
            }
            FLAG_COMPRESSED => {
                let mut planar = vec![0u8; out.len()];
                let written = lzf::decompress(body, &mut planar)?;
                if written != out.len() {
                    return Err(TileError::corruption(format!(
                        "lzf payload expanded to {written} bytes, expected {}",
                        out.len()
                    )));
                }
                delinearize(&planar, out, pixel_size);
            }
            other => {
                return Err(TileError::corruption(format!("unknown payload flag {other}")));
            }
        }
        Ok(())
    }
}

impl TileCompressor for TileCompressor2 {
    fn version(&self) -> u32 {
        CURRENT_VERSION
    }

    fn write_tile(&self, col: i32, row: i32, data: &[u8], out: &mut dyn Write) -> TileResult<()> {
        let mut payload = Vec::with_capacity(data.len() + 1);
        Self::pack(data, data.len() / (TILE_WIDTH * TILE_HEIGHT), &mut payload);
        let rect = Rect::of_tile(col, row);
        writeln!(out, "{},{},{},{}", rect.x, rect.y, CODEC_NAME, payload.len())?;
        out.write_all(&payload)?;
        Ok(())
    }

    fn read_tile(&self, input: &mut dyn BufRead, pixel_size: usize) -> TileResult<TileRecord> {
        let line = read_line(input)?;
        let [x, y, codec, len] = split_record::<4>(&line)?;
        if codec != CODEC_NAME {
            return Err(TileError::format(format!("unknown tile codec {codec:?}")));
        }
        let x = parse_i32(x)?;
        let y = parse_i32(y)?;
        if x.rem_euclid(TILE_WIDTH as i32) != 0 || y.rem_euclid(TILE_HEIGHT as i32) != 0 {
            return Err(TileError::format(format!("tile record at unaligned {x},{y}")));
        }
        let len = usize::try_from(parse_i32(len)?)
            .map_err(|_| TileError::format("negative tile payload length"))?;
        if len > self.tile_data_buffer_size(pixel_size) {
            return Err(TileError::format(format!("tile payload of {len} bytes is too large")));
        }
        let payload = read_exact_payload(input, len)?;
        let mut data = vec![0u8; tile_data_size(pixel_size)];
        Self::unpack(&payload, pixel_size, &mut data)?;
        Ok(TileRecord {
            rect: Rect::new(x, y, TILE_WIDTH as i32, TILE_HEIGHT as i32),
            data,
        })
    }

    fn compress_tile_data(
        &self,
        input: &[u8],
        pixel_size: usize,
        out: &mut Vec<u8>,
    ) -> TileResult<()> {
        Self::pack(input, pixel_size, out);
        Ok(())
    }

    fn decompress_tile_data(
        &self,
        input: &[u8],
        pixel_size: usize,
        out: &mut [u8],
    ) -> TileResult<()> {
        Self::unpack(input, pixel_size, out)
    }

    fn tile_data_buffer_size(&self, pixel_size: usize) -> usize {
        tile_data_size(pixel_size) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn flat_tiles_are_compressed() {
        let data = vec![0x42u8; tile_data_size(4)];
        let mut payload = Vec::new();
        TileCompressor2.compress_tile_data(&data, 4, &mut payload).unwrap();
        assert_eq!(payload[0], FLAG_COMPRESSED);
        assert!(payload.len() < data.len() / 10);

        let mut out = vec![0u8; data.len()];
        TileCompressor2.decompress_tile_data(&payload, 4, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn incompressible_tiles_are_stored_raw() {
        // xorshift noise does not compress.
        let mut state = 0x2545_f491_4f6c_dd1du64;
        let data: Vec<u8> = (0..tile_data_size(1))
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                state as u8
            })
            .collect();
        let mut payload = Vec::new();
        TileCompressor2.compress_tile_data(&data, 1, &mut payload).unwrap();
        assert_eq!(payload[0], FLAG_RAW);
        assert_eq!(&payload[1..], &data[..]);
    }

    #[test]
    fn record_header_names_codec() {
        let data = vec![1u8; tile_data_size(2)];
        let mut out = Vec::new();
        TileCompressor2.write_tile(3, -2, &data, &mut out).unwrap();
        let header_end = out.iter().position(|&b| b == b'\n').unwrap();
        let header = std::str::from_utf8(&out[..header_end]).unwrap();
        assert!(header.starts_with("192,-128,LZF,"), "{header}");

        let record = TileCompressor2.read_tile(&mut Cursor::new(out), 2).unwrap();
        assert_eq!(record.rect, Rect::of_tile(3, -2));
        assert_eq!(record.data, data);
    }

    #[test]
    fn rejects_unknown_flag() {
        let mut out = vec![0u8; tile_data_size(1)];
        let err = TileCompressor2.decompress_tile_data(&[7, 1, 2], 1, &mut out).unwrap_err();
        assert!(matches!(err, TileError::Corruption(_)));
    }
}

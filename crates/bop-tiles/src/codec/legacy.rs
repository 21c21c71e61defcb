use std::io::{BufRead, Write};

use super::{
    parse_i32, read_exact_payload, read_line, split_record, tile_data_size, TileCompressor,
    TileRecord, LEGACY_VERSION,
};
use crate::error::{TileError, TileResult};
use crate::geometry::Rect;
use crate::{TILE_HEIGHT, TILE_WIDTH};

/// Version 1 codec: `x,y,w,h` followed by the raw interleaved pixels.
#[derive(Debug, Default, Clone, Copy)]
pub struct LegacyTileCompressor;

impl TileCompressor for LegacyTileCompressor {
    fn version(&self) -> u32 {
        LEGACY_VERSION
    }

    fn write_tile(&self, col: i32, row: i32, data: &[u8], out: &mut dyn Write) -> TileResult<()> {
        let rect = Rect::of_tile(col, row);
        writeln!(out, "{},{},{},{}", rect.x, rect.y, rect.width, rect.height)?;
        out.write_all(data)?;
        Ok(())
    }

    fn read_tile(&self, input: &mut dyn BufRead, pixel_size: usize) -> TileResult<TileRecord> {
        let line = read_line(input)?;
        let [x, y, w, h] = split_record::<4>(&line)?;
        let rect = Rect::new(parse_i32(x)?, parse_i32(y)?, parse_i32(w)?, parse_i32(h)?);
        if rect.width < 0
            || rect.height < 0
            || rect.width as usize > TILE_WIDTH * 16
            || rect.height as usize > TILE_HEIGHT * 16
        {
            return Err(TileError::format(format!("implausible legacy tile rect {rect:?}")));
        }
        let len = rect.width as usize * rect.height as usize * pixel_size;
        let data = read_exact_payload(input, len)?;
        Ok(TileRecord { rect, data })
    }

    fn compress_tile_data(
        &self,
        input: &[u8],
        _pixel_size: usize,
        out: &mut Vec<u8>,
    ) -> TileResult<()> {
        out.extend_from_slice(input);
        Ok(())
    }

    fn decompress_tile_data(
        &self,
        input: &[u8],
        pixel_size: usize,
        out: &mut [u8],
    ) -> TileResult<()> {
        if input.len() != tile_data_size(pixel_size) || out.len() != input.len() {
            return Err(TileError::corruption(format!(
                "legacy payload of {} bytes for a {} byte tile",
                input.len(),
                out.len()
            )));
        }
        out.copy_from_slice(input);
        Ok(())
    }

    fn tile_data_buffer_size(&self, pixel_size: usize) -> usize {
        tile_data_size(pixel_size)
    }
}

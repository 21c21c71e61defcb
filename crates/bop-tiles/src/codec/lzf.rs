//! LZF block compression.
//!
//! Block layout, one control byte per run:
//!
//! ```text
//!  000LLLLL <L+1 literal bytes>            literal run, 1..=32 bytes
//!  LLLooooo oooooooo                       back reference, L in 1..=6
//!  111ooooo LLLLLLLL oooooooo              back reference, L = 7 + next byte
//! ```
//!
//! A back reference copies `L + 2` bytes starting `o + 1` bytes behind the
//! output cursor.

use crate::error::{TileError, TileResult};

const HASH_LOG: u32 = 14;
const HASH_SIZE: usize = 1 << HASH_LOG;
const MAX_LITERAL: usize = 32;
const MAX_OFFSET: usize = 1 << 13;
const MAX_REFERENCE: usize = (1 << 8) + (1 << 3); // 264

#[inline]
fn hash3(input: &[u8], at: usize) -> usize {
    let v = (input[at] as u32) << 16 | (input[at + 1] as u32) << 8 | input[at + 2] as u32;
    (v.wrapping_mul(2_654_435_761) >> (32 - HASH_LOG)) as usize
}

fn flush_literals(literals: &[u8], output: &mut Vec<u8>) {
    for run in literals.chunks(MAX_LITERAL) {
        output.push((run.len() - 1) as u8);
        output.extend_from_slice(run);
    }
}

/// Compresses `input` into `output` (cleared first). Returns the compressed
/// length.
pub fn compress(input: &[u8], output: &mut Vec<u8>) -> usize {
    output.clear();
    let len = input.len();
    if len == 0 {
        return 0;
    }
    // Positions are stored plus one so zero means "empty".
    let mut table = vec![0usize; HASH_SIZE];
    let mut literal_start = 0;
    let mut pos = 0;

    while pos + 2 < len {
        let slot = hash3(input, pos);
        let candidate = std::mem::replace(&mut table[slot], pos + 1);
        if candidate != 0 {
            let reference = candidate - 1;
            let distance = pos - reference;
            if distance <= MAX_OFFSET && input[reference..reference + 3] == input[pos..pos + 3] {
                let max_len = (len - pos).min(MAX_REFERENCE);
                let mut matched = 3;
                while matched < max_len && input[reference + matched] == input[pos + matched] {
                    matched += 1;
                }

                flush_literals(&input[literal_start..pos], output);
                let offset = distance - 1;
                let encoded = matched - 2;
                if encoded < 7 {
                    output.push(((encoded << 5) | (offset >> 8)) as u8);
                } else {
                    output.push(((7 << 5) | (offset >> 8)) as u8);
                    output.push((encoded - 7) as u8);
                }
                output.push((offset & 0xff) as u8);

                let end = pos + matched;
                pos += 1;
                while pos < end && pos + 2 < len {
                    table[hash3(input, pos)] = pos + 1;
                    pos += 1;
                }
                pos = end;
                literal_start = end;
                continue;
            }
        }
        pos += 1;
    }
    flush_literals(&input[literal_start..], output);
    output.len()
}

/// Decompresses `input` into `output`. Returns the number of bytes written.
pub fn decompress(input: &[u8], output: &mut [u8]) -> TileResult<usize> {
    let mut ip = 0;
    let mut op = 0;
    while ip < input.len() {
        let ctrl = input[ip] as usize;
        ip += 1;
        if ctrl < MAX_LITERAL {
            let run = ctrl + 1;
            if ip + run > input.len() {
                return Err(TileError::corruption("lzf literal run past end of input"));
            }
            if op + run > output.len() {
                return Err(TileError::corruption("lzf literal run overflows output"));
            }
            output[op..op + run].copy_from_slice(&input[ip..ip + run]);
            ip += run;
            op += run;
        } else {
            let mut run = ctrl >> 5;
            if run == 7 {
                let extra = *input
                    .get(ip)
                    .ok_or_else(|| TileError::corruption("lzf reference length truncated"))?;
                run += extra as usize;
                ip += 1;
            }
            let low = *input
                .get(ip)
                .ok_or_else(|| TileError::corruption("lzf reference offset truncated"))?;
            ip += 1;
            let distance = ((ctrl & 0x1f) << 8) + low as usize + 1;
            run += 2;
            if distance > op {
                return Err(TileError::corruption("lzf reference before start of output"));
            }
            if op + run > output.len() {
                return Err(TileError::corruption("lzf reference overflows output"));
            }
            // Overlapping copies repeat the pattern, so copy forwards bytewise.
            let from = op - distance;
            for i in 0..run {
                output[op + i] = output[from + i];
            }
            op += run;
        }
    }
    Ok(op)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(input: &[u8]) -> Vec<u8> {
        let mut packed = Vec::new();
        compress(input, &mut packed);
        let mut out = vec![0u8; input.len()];
        let written = decompress(&packed, &mut out).expect("valid stream");
        assert_eq!(written, input.len());
        out
    }

    #[test]
    fn repetitive_data_shrinks() {
        let input = vec![7u8; 16384];
        let mut packed = Vec::new();
        compress(&input, &mut packed);
        assert!(packed.len() < input.len() / 20, "packed {} bytes", packed.len());
        assert_eq!(roundtrip(&input), input);
    }

    #[test]
    fn mixed_content_survives() {
        let mut input = Vec::new();
        for i in 0..5000u32 {
            input.extend_from_slice(&(i % 97).to_le_bytes());
            if i % 13 == 0 {
                input.extend_from_slice(b"tile");
            }
        }
        assert_eq!(roundtrip(&input), input);
        assert_eq!(roundtrip(b"ab"), b"ab");
        assert_eq!(roundtrip(&[]), Vec::<u8>::new());
    }

    #[test]
    fn decodes_handwritten_block() {
        // "abc" literal, then a reference of 6 bytes at distance 3.
        let block = [2, b'a', b'b', b'c', (4 << 5) as u8, 2];
        let mut out = [0u8; 9];
        assert_eq!(decompress(&block, &mut out).unwrap(), 9);
        assert_eq!(&out, b"abcabcabc");
    }

    #[test]
    fn rejects_truncated_and_out_of_range_input() {
        let mut out = [0u8; 8];
        assert!(decompress(&[5, 1, 2], &mut out).is_err());
        assert!(decompress(&[(1 << 5) as u8, 0], &mut out).is_err());
        let mut tiny = [0u8; 2];
        assert!(decompress(&[3, 1, 2, 3, 4], &mut tiny).is_err());
    }
}

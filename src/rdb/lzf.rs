//! LZF decompression for compressed RDB strings.
//!
//! Each control byte either starts a literal run or a back-reference:
//!
//! ```text
//! 000LLLLL <L+1 literal bytes>
//! LLLooooo oooooooo              length L+2, offset o+1 back
//! 111ooooo LLLLLLLL oooooooo     length L+9, offset o+1 back
//! ```
//!
//! The longest back-reference turns 3 input bytes into 264 output bytes, so
//! a declared length above `88 * input.len()` cannot be honest and is
//! rejected before anything is allocated.

use super::{RdbError, RdbResult};

const MAX_EXPANSION: usize = 88;

/// Decompresses `input`, which must expand to exactly `out_len` bytes.
pub fn decompress(input: &[u8], out_len: usize) -> RdbResult<Vec<u8>> {
    if out_len > input.len().saturating_mul(MAX_EXPANSION) {
        return Err(RdbError::Lzf(format!(
            "{} compressed bytes cannot expand to {}",
            input.len(),
            out_len
        )));
    }
    if out_len == 0 {
        return if input.is_empty() {
            Ok(Vec::new())
        } else {
            Err(RdbError::Lzf("output exceeds declared length".into()))
        };
    }

    let out = ::lzf::decompress(input, out_len).map_err(|e| RdbError::Lzf(format!("{:?}", e)))?;
    if out.len() != out_len {
        return Err(RdbError::Lzf(format!(
            "expected {} bytes, got {}",
            out_len,
            out.len()
        )));
    }
    Ok(out)
}

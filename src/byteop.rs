//! Small byte-slice helpers shared by the codec modules.

use crate::error::{Error, Result};

/// Splits `src` at `n`, returning `(head, tail)`. Fails if `n` is past the end of `src`.
pub fn split(src: &[u8], n: usize) -> Result<(&[u8], &[u8])> {
    if n > src.len() {
        return Err(Error::invalid_encoding(
            0,
            format!(
                "cannot split at index {n} larger than the slice length {}",
                src.len()
            ),
        ));
    }
    Ok((&src[..n], &src[n..]))
}

//! Backing-store failures.
//!
//! The engine has exactly one failure mode: the page source cannot supply a
//! block. That condition is fatal. Sub-allocators surface it as a
//! [`PageError`] and the front-end hands it to an [`ExhaustionHandler`],
//! which never returns.

use thiserror::Error;

/// Failure to obtain a block from the page source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PageError {
    /// Header plus payload does not form a valid allocation layout.
    #[error("page layout overflows for a {payload} byte payload")]
    LayoutOverflow {
        /// Payload bytes that were requested.
        payload: usize,
    },
    /// The page source returned no memory.
    #[error("backing store exhausted while acquiring {bytes} bytes")]
    Exhausted {
        /// Total bytes (header included) of the failed request.
        bytes: usize,
    },
}

/// Terminal handler for backing-store exhaustion.
pub type ExhaustionHandler = fn(&PageError) -> !;

/// Default [`ExhaustionHandler`]: report on stderr and abort the process.
pub fn abort_on_exhaustion(err: &PageError) -> ! {
    eprintln!("memmgr: fatal: {err}");
    std::process::abort()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_request() {
        let err = PageError::Exhausted { bytes: 65_568 };
        assert_eq!(
            err.to_string(),
            "backing store exhausted while acquiring 65568 bytes"
        );
        let err = PageError::LayoutOverflow { payload: usize::MAX };
        assert!(err.to_string().contains(&usize::MAX.to_string()));
    }
}

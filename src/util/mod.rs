//! Utility module
//!
//! Logging setup and byte formatting helpers used throughout the library.

use std::fmt::Write;

/// Installs a `tracing` subscriber printing debug level and above.
///
/// Safe to call more than once; later calls leave the first subscriber in place.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_target(true)
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Formats bytes as lowercase hex for log fields
pub fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{:02x}", b);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex() {
        assert_eq!(hex(&[0x01, 0xab, 0xff]), "01abff");
        assert_eq!(hex(&[]), "");
    }

    #[test]
    fn test_init_logging_twice() {
        init_logging();
        init_logging();
        tracing::debug!("logging initialised");
    }
}

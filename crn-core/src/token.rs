//! Replication progress tokens.
//!
//! A token is an opaque cursor into a remote replica's log. The remote mints
//! it, the worker echoes it back on the next metadata request, and advances
//! its stored copy only once every key the remote reported at that position
//! has been durably written or confirmed unnecessary. The worker never
//! inspects or compares tokens: monotonicity falls out of the advance rule.

use crate::{CairnError, Result};
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;

/// Opaque position marker in a remote replica's log.
pub trait FindToken: fmt::Debug + Send + Sync {
    /// Wire form of the token, echoed verbatim in metadata requests.
    fn to_bytes(&self) -> Bytes;
}

/// Decodes token wire bytes received from a remote replica. Injected so the
/// worker stays agnostic of the store's log addressing scheme.
pub trait FindTokenFactory: Send + Sync {
    fn decode(&self, data: &[u8]) -> Result<Arc<dyn FindToken>>;

    /// The position before any log entry; where a brand-new pair starts.
    fn initial(&self) -> Arc<dyn FindToken>;
}

/// Default token: a byte offset into an append-only log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct OffsetToken {
    offset: u64,
}

impl OffsetToken {
    #[must_use]
    pub const fn new(offset: u64) -> Self {
        Self { offset }
    }

    #[inline]
    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }
}

impl FindToken for OffsetToken {
    fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.offset.to_le_bytes())
    }
}

/// Factory for [`OffsetToken`]s (8-byte LE wire form).
#[derive(Debug, Clone, Copy, Default)]
pub struct OffsetTokenFactory;

impl FindTokenFactory for OffsetTokenFactory {
    fn decode(&self, data: &[u8]) -> Result<Arc<dyn FindToken>> {
        let raw: [u8; 8] = data.try_into().map_err(|_| {
            CairnError::TokenDecode(format!("expected 8 token bytes, got {}", data.len()))
        })?;
        Ok(Arc::new(OffsetToken::new(u64::from_le_bytes(raw))))
    }

    fn initial(&self) -> Arc<dyn FindToken> {
        Arc::new(OffsetToken::new(0))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_token_roundtrip() {
        let factory = OffsetTokenFactory;
        let token = OffsetToken::new(4096);
        let decoded = factory.decode(&token.to_bytes()).unwrap();
        assert_eq!(decoded.to_bytes(), token.to_bytes());
    }

    #[test]
    fn test_factory_rejects_wrong_length() {
        let factory = OffsetTokenFactory;
        assert!(factory.decode(&[1, 2, 3]).is_err());
        assert!(factory.decode(&[]).is_err());
    }

    #[test]
    fn test_initial_token_is_zero_offset() {
        let factory = OffsetTokenFactory;
        assert_eq!(
            factory.initial().to_bytes(),
            OffsetToken::new(0).to_bytes()
        );
    }
}

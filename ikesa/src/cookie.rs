//! Stateless cookies (RFC 7296 2.6)
//!
//! Under half-open flood the responder refuses to allocate state and
//! instead challenges initiators with a cookie computed from their SPI,
//! their nonce and a rotating local secret. An initiator that echoes the
//! cookie proves it can receive at its claimed address, and only then is
//! a responder SA allocated.

use std::time::{Duration, Instant};

use rand::RngCore;

use crate::crypto::CryptoBackend;

/// How long one secret stays current before rotating
const ROTATION_PERIOD: Duration = Duration::from_secs(120);

/// The rotating cookie secrets
///
/// The previous secret stays valid for one period so initiators that
/// received their challenge just before a rotation still pass.
#[derive(Debug)]
pub struct CookieJar {
    secret: [u8; 32],
    previous: [u8; 32],
    rotated_at: Instant,
}

impl Default for CookieJar {
    fn default() -> Self {
        Self::new()
    }
}

impl CookieJar {
    /// Create a jar with fresh random secrets
    pub fn new() -> Self {
        let mut secret = [0u8; 32];
        let mut previous = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        rand::thread_rng().fill_bytes(&mut previous);
        Self {
            secret,
            previous,
            rotated_at: Instant::now(),
        }
    }

    fn rotate_if_due(&mut self) {
        if self.rotated_at.elapsed() >= ROTATION_PERIOD {
            self.previous = self.secret;
            rand::thread_rng().fill_bytes(&mut self.secret);
            self.rotated_at = Instant::now();
        }
    }

    /// Compute the cookie an initiator must echo
    pub fn compute(&mut self, crypto: &dyn CryptoBackend, spi_i: u64, nonce: &[u8]) -> Vec<u8> {
        self.rotate_if_due();
        crypto.cookie_mac(&self.secret, spi_i, nonce)
    }

    /// Check an echoed cookie against the current and previous secret
    pub fn check(
        &mut self,
        crypto: &dyn CryptoBackend,
        spi_i: u64,
        nonce: &[u8],
        cookie: &[u8],
    ) -> bool {
        self.rotate_if_due();
        cookie == crypto.cookie_mac(&self.secret, spi_i, nonce)
            || cookie == crypto.cookie_mac(&self.previous, spi_i, nonce)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::NullCrypto;

    #[test]
    fn computed_cookie_verifies() {
        let crypto = NullCrypto;
        let mut jar = CookieJar::new();
        let cookie = jar.compute(&crypto, 0xaa01, b"nonce-i");
        assert!(jar.check(&crypto, 0xaa01, b"nonce-i", &cookie));
        assert!(!jar.check(&crypto, 0xaa02, b"nonce-i", &cookie));
        assert!(!jar.check(&crypto, 0xaa01, b"nonce-x", &cookie));
    }
}

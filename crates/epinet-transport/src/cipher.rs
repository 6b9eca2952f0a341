//! Stream cipher wrappers for a live connection.
//!
//! Both directions of a connection run AES-128 in counter mode keyed by the
//! pre-shared secret and the IV the listener generated for that connection.
//! The wrappers are transparent: callers write plaintext into
//! [`EncryptingWriter`] and read plaintext out of [`DecryptingReader`].

use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use ctr::cipher::{KeyIvInit, StreamCipher};
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Length of the pre-shared secret (AES-128 key).
pub const SECRET_LEN: usize = 16;

/// Length of the counter-mode initialization vector.
pub const IV_LEN: usize = 16;

/// Per-connection initialization vector.
pub type Iv = [u8; IV_LEN];

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;

/// Generate a fresh random IV.
pub fn random_iv() -> Iv {
    let mut iv = [0u8; IV_LEN];
    rand::rng().fill_bytes(&mut iv);
    iv
}

/// Key material for one connection.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SessionKeys {
    key: [u8; SECRET_LEN],
    iv: Iv,
}

impl SessionKeys {
    pub fn new(key: [u8; SECRET_LEN], iv: Iv) -> Self {
        Self { key, iv }
    }

    /// The symmetric cipher key.
    pub fn key(&self) -> &[u8; SECRET_LEN] {
        &self.key
    }

    /// The connection IV.
    pub fn iv(&self) -> &Iv {
        &self.iv
    }

    fn keystream(&self) -> Aes128Ctr {
        Aes128Ctr::new(&self.key.into(), &self.iv.into())
    }
}

impl fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKeys")
            .field("key", &"<redacted>")
            .field("iv", &hex::encode(self.iv))
            .finish()
    }
}

// ── Writer ───────────────────────────────────────────────────────────────

/// Encrypts everything written through it.
///
/// Accepted plaintext is encrypted immediately and parked in `pending` until
/// the inner sink takes it, so the keystream only ever advances by bytes the
/// caller was told were written.
pub struct EncryptingWriter<W> {
    inner: W,
    cipher: Aes128Ctr,
    pending: Vec<u8>,
    written: usize,
}

impl<W> EncryptingWriter<W> {
    pub fn new(inner: W, keys: &SessionKeys) -> Self {
        Self {
            inner,
            cipher: keys.keystream(),
            pending: Vec::new(),
            written: 0,
        }
    }

    #[cfg(test)]
    pub(crate) fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: AsyncWrite + Unpin> EncryptingWriter<W> {
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.written < self.pending.len() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.pending[self.written..]))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.written += n;
        }
        self.pending.clear();
        self.written = 0;
        Poll::Ready(Ok(()))
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for EncryptingWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;

        this.pending.extend_from_slice(buf);
        this.cipher.apply_keystream(&mut this.pending);

        // Bytes are accepted at this point; a pending drain is finished by the next write or flush.
        if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

// ── Reader ───────────────────────────────────────────────────────────────

/// Decrypts everything read through it.
pub struct DecryptingReader<R> {
    inner: R,
    cipher: Aes128Ctr,
}

impl<R> DecryptingReader<R> {
    pub fn new(inner: R, keys: &SessionKeys) -> Self {
        Self {
            inner,
            cipher: keys.keystream(),
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for DecryptingReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let start = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;

        // Only the bytes this read produced; a short read before EOF included.
        this.cipher.apply_keystream(&mut buf.filled_mut()[start..]);
        Poll::Ready(Ok(()))
    }
}

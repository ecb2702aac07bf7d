use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use aes::Aes128;
use cfb_mode::cipher::KeyIvInit;
use cfb_mode::{BufDecryptor, BufEncryptor};
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// PBKDF2 salt shared by both peers; part of the wire format.
pub const DEFAULT_SALT: &[u8] = b"pushprox";

const KEY_ROUNDS: u32 = 64;
const BLOCK_SIZE: usize = 16;

type Encryptor = BufEncryptor<Aes128>;
type Decryptor = BufDecryptor<Aes128>;

/// Any duplex byte transport the tunnel can run over.
pub trait Conn: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Conn for T {}

impl std::fmt::Debug for dyn Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BoxConn")
    }
}

/// Owned duplex transport: a TCP connection, a multiplexed stream, or an
/// already-wrapped stream (wrapping composes, it is not idempotent).
pub type BoxConn = Box<dyn Conn>;

/// Derives the AES-128 key for a shared token.
pub fn derive_key(token: &[u8]) -> [u8; BLOCK_SIZE] {
    let mut key = [0u8; BLOCK_SIZE];
    pbkdf2::pbkdf2_hmac::<sha1::Sha1>(token, DEFAULT_SALT, KEY_ROUNDS, &mut key);
    key
}

/// A failed direction stays failed; CFB state cannot recover from a torn
/// stream, so the first error is replayed to every later call.
#[derive(Debug, Clone)]
struct Sticky {
    kind: io::ErrorKind,
    message: String,
}

impl Sticky {
    fn record(err: &io::Error) -> Self {
        Sticky {
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    fn replay(&self) -> io::Error {
        io::Error::new(self.kind, self.message.clone())
    }
}

struct ReadState {
    key: [u8; BLOCK_SIZE],
    iv: [u8; BLOCK_SIZE],
    filled: usize,
    dec: Option<Decryptor>,
    err: Option<Sticky>,
}

struct WriteState {
    enc: Encryptor,
    iv: [u8; BLOCK_SIZE],
    iv_queued: bool,
    buf: Vec<u8>,
    err: Option<Sticky>,
}

/// AES-128-CFB wrapping of a duplex stream, one cipher state per
/// direction. The write IV is generated at construction but only hits the
/// wire ahead of the first written byte; the read side blocks the first
/// read until the peer's IV has fully arrived.
pub struct CryptoStream<S> {
    inner: S,
    read: ReadState,
    write: WriteState,
}

impl<S> CryptoStream<S> {
    pub fn new(inner: S, token: &[u8]) -> Self {
        let key = derive_key(token);
        let mut iv = [0u8; BLOCK_SIZE];
        OsRng.fill_bytes(&mut iv);
        let enc = Encryptor::new(&key.into(), &iv.into());
        CryptoStream {
            inner,
            read: ReadState {
                key,
                iv: [0u8; BLOCK_SIZE],
                filled: 0,
                dec: None,
                err: None,
            },
            write: WriteState {
                enc,
                iv,
                iv_queued: false,
                buf: Vec::new(),
                err: None,
            },
        }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

fn drain<S>(inner: &mut S, buf: &mut Vec<u8>, cx: &mut Context<'_>) -> Poll<io::Result<()>>
where
    S: AsyncWrite + Unpin,
{
    while !buf.is_empty() {
        let n = ready!(Pin::new(&mut *inner).poll_write(cx, buf))?;
        if n == 0 {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "inner stream refused encrypted bytes",
            )));
        }
        buf.drain(..n);
    }
    Poll::Ready(Ok(()))
}

impl<S: AsyncRead + Unpin> AsyncRead for CryptoStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some(err) = &this.read.err {
            return Poll::Ready(Err(err.replay()));
        }

        if this.read.dec.is_none() {
            while this.read.filled < BLOCK_SIZE {
                let read = &mut this.read;
                let mut iv_buf = ReadBuf::new(&mut read.iv[read.filled..]);
                if let Err(err) = ready!(Pin::new(&mut this.inner).poll_read(cx, &mut iv_buf)) {
                    this.read.err = Some(Sticky::record(&err));
                    return Poll::Ready(Err(err));
                }
                let n = iv_buf.filled().len();
                if n == 0 {
                    if this.read.filled == 0 {
                        // the peer never wrote anything; clean end of stream
                        return Poll::Ready(Ok(()));
                    }
                    let err = io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "stream ended inside the cipher iv",
                    );
                    this.read.err = Some(Sticky::record(&err));
                    return Poll::Ready(Err(err));
                }
                this.read.filled += n;
            }
            let (key, iv) = (this.read.key, this.read.iv);
            this.read.dec = Some(Decryptor::new(&key.into(), &iv.into()));
        }

        let before = buf.filled().len();
        if let Err(err) = ready!(Pin::new(&mut this.inner).poll_read(cx, buf)) {
            this.read.err = Some(Sticky::record(&err));
            return Poll::Ready(Err(err));
        }
        let after = buf.filled().len();
        if after > before {
            if let Some(dec) = this.read.dec.as_mut() {
                dec.decrypt(&mut buf.filled_mut()[before..after]);
            }
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for CryptoStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if let Some(err) = &this.write.err {
            return Poll::Ready(Err(err.replay()));
        }

        if !this.write.iv_queued {
            // the iv goes out in the clear, ahead of any ciphertext
            let iv = this.write.iv;
            this.write.buf.extend_from_slice(&iv);
            this.write.iv_queued = true;
        }

        match drain(&mut this.inner, &mut this.write.buf, cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(err)) => {
                this.write.err = Some(Sticky::record(&err));
                return Poll::Ready(Err(err));
            }
            Poll::Pending => return Poll::Pending,
        }

        let mut chunk = data.to_vec();
        this.write.enc.encrypt(&mut chunk);
        this.write.buf.extend_from_slice(&chunk);

        // opportunistic; leftovers are pushed out by the next write or flush
        if let Poll::Ready(Err(err)) = drain(&mut this.inner, &mut this.write.buf, cx) {
            this.write.err = Some(Sticky::record(&err));
            return Poll::Ready(Err(err));
        }
        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some(err) = &this.write.err {
            return Poll::Ready(Err(err.replay()));
        }
        match ready!(drain(&mut this.inner, &mut this.write.buf, cx)) {
            Ok(()) => {}
            Err(err) => {
                this.write.err = Some(Sticky::record(&err));
                return Poll::Ready(Err(err));
            }
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.write.err.is_none() {
            if let Err(err) = ready!(drain(&mut this.inner, &mut this.write.buf, cx)) {
                this.write.err = Some(Sticky::record(&err));
                return Poll::Ready(Err(err));
            }
        }
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

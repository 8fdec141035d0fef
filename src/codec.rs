//! `Content-Length` framing for the JSON-RPC channel to fortls.
//!
//! LSP traffic over stdio is framed as `Content-Length: N\r\n\r\n{json}`.
//! [`FrameReader`] and [`FrameWriter`] handle the framing; message semantics
//! live in the transport layer.

use anyhow::{Context, Result, bail};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Frames above this size are rejected rather than buffered.
const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Reads framed JSON-RPC messages from the server's stdout.
pub struct FrameReader<R> {
    inner: BufReader<R>,
    line: String,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            inner: BufReader::new(reader),
            line: String::new(),
        }
    }

    /// Read one frame. `Ok(None)` means clean EOF before any header byte.
    pub async fn read_frame(&mut self) -> Result<Option<serde_json::Value>> {
        let Some(len) = self.read_content_length().await? else {
            return Ok(None);
        };

        if len > MAX_FRAME_BYTES {
            bail!("frame of {len} bytes exceeds the {MAX_FRAME_BYTES} byte limit");
        }

        let mut body = vec![0u8; len];
        self.inner
            .read_exact(&mut body)
            .await
            .context("reading frame body")?;

        serde_json::from_slice(&body)
            .context("parsing frame body as JSON")
            .map(Some)
    }

    /// Consume header lines up to the blank separator and return the
    /// announced body length. `Ok(None)` only on EOF at a frame boundary.
    async fn read_content_length(&mut self) -> Result<Option<usize>> {
        let mut content_length = None;
        let mut at_frame_start = true;

        loop {
            self.line.clear();
            let n = self
                .inner
                .read_line(&mut self.line)
                .await
                .context("reading frame header")?;

            if n == 0 {
                if at_frame_start {
                    return Ok(None);
                }
                bail!("connection closed mid-headers");
            }
            at_frame_start = false;

            let header = self.line.trim_end_matches(['\r', '\n']);
            if header.is_empty() {
                break;
            }

            // Headers other than Content-Length (Content-Type in practice)
            // are skipped. Key comparison is case-insensitive.
            if let Some((key, value)) = header.split_once(':')
                && key.trim().eq_ignore_ascii_case("content-length")
            {
                content_length = Some(
                    value
                        .trim()
                        .parse::<usize>()
                        .with_context(|| format!("bad Content-Length value {value:?}"))?,
                );
            }
        }

        content_length
            .map(Some)
            .context("frame headers lacked Content-Length")
    }
}

/// Writes framed JSON-RPC messages to the server's stdin.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { inner: writer }
    }

    pub async fn write_frame(&mut self, message: &serde_json::Value) -> Result<()> {
        let body = serde_json::to_vec(message).context("serializing frame body")?;
        let header = format!("Content-Length: {}\r\n\r\n", body.len());

        self.inner
            .write_all(header.as_bytes())
            .await
            .context("writing frame header")?;
        self.inner
            .write_all(&body)
            .await
            .context("writing frame body")?;
        self.inner.flush().await.context("flushing frame")
    }

    /// Flush and close the underlying stream, propagating EOF to the peer.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await.context("closing frame writer")
    }
}

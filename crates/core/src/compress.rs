//! Transparent gzip compression
//!
//! Writes flow caller bytes -> gzip -> backend writer. Reads are decompressed
//! only when the stored bytes start with the gzip magic, so a compressing
//! bucket can still read objects that were written without compression.

use async_compression::tokio::bufread::GzipDecoder;
use async_compression::tokio::write::GzipEncoder;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::error::Result;
use crate::traits::{ObjectReader, ObjectWriter};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Gzip-compressing decorator over another [`ObjectWriter`]
pub struct CompressingWriter {
    encoder: GzipEncoder<Vec<u8>>,
    inner: Box<dyn ObjectWriter>,
}

impl CompressingWriter {
    pub fn new(inner: Box<dyn ObjectWriter>) -> Self {
        Self {
            encoder: GzipEncoder::new(Vec::new()),
            inner,
        }
    }

    /// Forward whatever the encoder produced so far
    async fn forward(&mut self) -> Result<()> {
        let chunk = std::mem::take(self.encoder.get_mut());
        if !chunk.is_empty() {
            self.inner.write(&chunk).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectWriter for CompressingWriter {
    async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.encoder.write_all(buf).await?;
        self.forward().await?;
        Ok(buf.len())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let mut this = *self;
        this.encoder.shutdown().await?;
        this.forward().await?;
        this.inner.close().await
    }
}

/// Wrap a writer in gzip compression when `compress` is set
pub fn maybe_compress(writer: Box<dyn ObjectWriter>, compress: bool) -> Box<dyn ObjectWriter> {
    if compress {
        Box::new(CompressingWriter::new(writer))
    } else {
        writer
    }
}

/// Decompress `reader` if it carries gzip data, pass it through otherwise
pub async fn maybe_decompress(reader: ObjectReader) -> Result<ObjectReader> {
    let mut buffered = BufReader::new(reader);
    let is_gzip = {
        let head = buffered.fill_buf().await?;
        head.len() >= GZIP_MAGIC.len() && head[..GZIP_MAGIC.len()] == GZIP_MAGIC
    };

    if is_gzip {
        let mut decoder = GzipDecoder::new(buffered);
        decoder.multiple_members(true);
        Ok(Box::pin(decoder))
    } else {
        Ok(Box::pin(buffered))
    }
}

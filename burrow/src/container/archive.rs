//! Tar plumbing between async chunk channels and the blocking tar crate.

use std::io::{Read, Write};

use tokio::sync::mpsc;

use burrow_shared::BurrowResult;

/// Blocking reader over an async chunk channel; used to feed `tar::Archive`
/// from a client byte stream inside `spawn_blocking`.
pub(super) struct ChunkReader {
    rx: mpsc::Receiver<Vec<u8>>,
    buf: Vec<u8>,
    pos: usize,
}

impl ChunkReader {
    pub(super) fn new(rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            rx,
            buf: Vec::new(),
            pos: 0,
        }
    }
}

impl Read for ChunkReader {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        if self.pos >= self.buf.len() {
            match self.rx.blocking_recv() {
                Some(chunk) => {
                    self.buf = chunk;
                    self.pos = 0;
                }
                None => return Ok(0),
            }
        }
        let n = out.len().min(self.buf.len() - self.pos);
        out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Blocking writer pushing tar output into an async chunk channel; the
/// receiving side lazily forwards chunks to the client and may be dropped to
/// cancel the stream.
pub(super) struct ChunkWriter {
    tx: mpsc::Sender<BurrowResult<Vec<u8>>>,
}

impl ChunkWriter {
    pub(super) fn new(tx: mpsc::Sender<BurrowResult<Vec<u8>>>) -> Self {
        Self { tx }
    }
}

impl Write for ChunkWriter {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.tx
            .blocking_send(Ok(data.to_vec()))
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "stream closed"))?;
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn chunk_reader_concatenates_chunks() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(b"hello ".to_vec()).await.unwrap();
        tx.send(b"world".to_vec()).await.unwrap();
        drop(tx);

        let collected = tokio::task::spawn_blocking(move || {
            let mut reader = ChunkReader::new(rx);
            let mut out = Vec::new();
            reader.read_to_end(&mut out).unwrap();
            out
        })
        .await
        .unwrap();
        assert_eq!(collected, b"hello world");
    }

    #[tokio::test]
    async fn chunk_writer_fails_once_receiver_drops() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let result = tokio::task::spawn_blocking(move || {
            let mut writer = ChunkWriter::new(tx);
            writer.write_all(b"data")
        })
        .await
        .unwrap();
        assert!(result.is_err());
    }
}

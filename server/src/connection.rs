//! Framed socket I/O
//!
//! A connection is split into a reading half that decodes one client packet
//! at a time and a writing half that pushes pre-encoded frames. Reads give up
//! after the idle timeout so a silent peer is eventually dropped; writes give
//! up after the write timeout so a stalled peer cannot pin its output task.

use crate::error::SessionError;
use shared::opcode::lookup;
use shared::Packet;
use std::time::Duration;
use tokio::io::{split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::time::timeout;

pub struct PacketReader<R> {
    inner: R,
    idle_timeout: Duration,
    payload: Vec<u8>,
}

impl<R: AsyncRead + Unpin> PacketReader<R> {
    pub fn new(inner: R, idle_timeout: Duration) -> Self {
        Self {
            inner,
            idle_timeout,
            payload: Vec::with_capacity(256),
        }
    }

    /// Reads exactly one packet. Unknown opcodes fail before any payload is
    /// consumed.
    pub async fn read_packet<P: Packet>(&mut self) -> Result<P, SessionError> {
        let mut opcode = [0u8; 1];
        timeout(self.idle_timeout, self.inner.read_exact(&mut opcode))
            .await
            .map_err(|_| SessionError::IdleTimeout)??;

        let (_, len) = lookup(opcode[0], P::DIRECTION)?;
        self.payload.resize(len, 0);
        timeout(self.idle_timeout, self.inner.read_exact(&mut self.payload))
            .await
            .map_err(|_| SessionError::IdleTimeout)??;

        Ok(P::decode(opcode[0], &self.payload)?)
    }
}

pub struct PacketWriter<W> {
    inner: W,
    write_timeout: Duration,
}

impl<W: AsyncWrite + Unpin> PacketWriter<W> {
    pub fn new(inner: W, write_timeout: Duration) -> Self {
        Self {
            inner,
            write_timeout,
        }
    }

    pub async fn write_frame(&mut self, frame: &[u8]) -> Result<(), SessionError> {
        let write = async {
            self.inner.write_all(frame).await?;
            self.inner.flush().await
        };
        timeout(self.write_timeout, write)
            .await
            .map_err(|_| SessionError::IdleTimeout)??;
        Ok(())
    }

    /// Closes the write side; errors are irrelevant at this point.
    pub async fn close(&mut self) {
        let _ = timeout(self.write_timeout, self.inner.shutdown()).await;
    }
}

/// Splits a stream into its packet reader and writer.
pub fn split_stream<S>(
    stream: S,
    idle_timeout: Duration,
    write_timeout: Duration,
) -> (PacketReader<ReadHalf<S>>, PacketWriter<WriteHalf<S>>)
where
    S: AsyncRead + AsyncWrite,
{
    let (read, write) = split(stream);
    (
        PacketReader::new(read, idle_timeout),
        PacketWriter::new(write, write_timeout),
    )
}

//! Link over any async byte stream

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::driver::{Endpoints, LinkDriver, LinkHandle, Outgoing};
use super::Link;
use crate::core::{LinkConfig, Result};

const READ_CHUNK: usize = 256;

/// Runs a link over `io`
///
/// Spawns the driver plus one reader and one writer task. Must be called
/// from inside a tokio runtime.
pub fn spawn<T>(io: T, config: LinkConfig) -> Result<Link>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let (driver, Endpoints { handle, notices, outgoing }) = LinkDriver::new(config)?;
    let (reader, writer) = tokio::io::split(io);

    let reader_task = tokio::spawn(read_loop(reader, handle.clone()));
    tokio::spawn(write_loop(writer, outgoing, handle.clone()));

    let task = tokio::spawn(async move {
        let result = driver.run().await;
        reader_task.abort();
        result
    });

    Ok(Link { handle, notices, task })
}

async fn read_loop<T: AsyncRead>(mut reader: ReadHalf<T>, handle: LinkHandle) {
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                debug!("stream closed by peer");
                break;
            }
            Ok(n) => {
                if handle.received(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!("stream read failed: {}", e);
                break;
            }
        }
    }
}

async fn write_loop<T: AsyncWrite>(
    mut writer: WriteHalf<T>,
    mut outgoing: mpsc::Receiver<Outgoing>,
    handle: LinkHandle,
) -> Result<()> {
    while let Some(out) = outgoing.recv().await {
        if let Err(e) = write_frame(&mut writer, &out.bytes).await {
            warn!(slot = out.slot, "stream write failed: {}", e);
            return Err(e);
        }
        if handle.sent(out.slot).await.is_err() {
            break;
        }
    }
    Ok(())
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> Result<()> {
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

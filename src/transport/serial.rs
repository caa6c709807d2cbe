//! Link over a serial port
//!
//! `serialport` only offers blocking I/O, so the line is served by two
//! named threads that talk to the driver task through its command queue.

use std::io::{ErrorKind, Read, Write};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::driver::{Endpoints, LinkDriver, LinkHandle, Outgoing};
use super::Link;
use crate::core::{LinkConfig, Result, SerialConfig};

const READ_TIMEOUT: Duration = Duration::from_millis(100);
const READ_CHUNK: usize = 256;

/// Opens the configured serial device and runs a link over it
pub fn open(serial: &SerialConfig, config: LinkConfig) -> Result<Link> {
    let port = serialport::new(serial.device.as_str(), serial.baud_rate)
        .timeout(READ_TIMEOUT)
        .open()?;
    let writer = port.try_clone()?;
    info!(device = %serial.device, baud = serial.baud_rate, "serial port open");
    bridge(port, writer, config)
}

/// Runs a link over a blocking reader/writer pair
///
/// The reader should time out periodically so its thread notices when the
/// driver has stopped.
pub fn bridge<R, W>(reader: R, writer: W, config: LinkConfig) -> Result<Link>
where
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    let (driver, Endpoints { handle, notices, outgoing }) = LinkDriver::new(config)?;

    let rx_handle = handle.clone();
    thread::Builder::new()
        .name("pktlink-rx".into())
        .spawn(move || read_thread(reader, rx_handle))?;
    let tx_handle = handle.clone();
    thread::Builder::new()
        .name("pktlink-tx".into())
        .spawn(move || write_thread(writer, outgoing, tx_handle))?;

    let task = tokio::spawn(driver.run());
    Ok(Link { handle, notices, task })
}

fn read_thread<R: Read>(mut reader: R, handle: LinkHandle) {
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if handle.blocking_received(Bytes::copy_from_slice(&buf[..n])).is_err() {
                    break;
                }
            }
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::Interrupted) => {
                if handle.is_closed() {
                    break;
                }
            }
            Err(e) => {
                warn!("serial read failed: {}", e);
                break;
            }
        }
    }
    debug!("serial reader stopped");
}

fn write_thread<W: Write>(mut writer: W, mut outgoing: mpsc::Receiver<Outgoing>, handle: LinkHandle) {
    while let Some(out) = outgoing.blocking_recv() {
        if let Err(e) = writer.write_all(&out.bytes).and_then(|_| writer.flush()) {
            warn!(slot = out.slot, "serial write failed: {}", e);
            break;
        }
        if handle.blocking_sent(out.slot).is_err() {
            break;
        }
    }
    debug!("serial writer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ChannelId, Error};
    use crate::protocol::{Assembled, ControlType, FrameCodec};
    use bytes::BytesMut;
    use std::io;
    use std::sync::{Arc, Mutex};
    use tokio_util::codec::Decoder;

    /// A line that never says anything
    struct Silent;

    impl Read for Silent {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            thread::sleep(Duration::from_millis(5));
            Err(io::Error::new(ErrorKind::TimedOut, "quiet line"))
        }
    }

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_bridge_writes_restart_to_line() {
        let capture = Capture::default();
        let config = LinkConfig {
            coarse_tick: Duration::from_millis(20),
            ..LinkConfig::default()
        };
        let link = bridge(Silent, capture.clone(), config).unwrap();

        let mut frame = None;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let mut buf = BytesMut::from(&capture.0.lock().unwrap()[..]);
            if let Ok(Some(Assembled::Frame(f))) = FrameCodec::new().decode(&mut buf) {
                frame = Some(f);
                break;
            }
        }
        let frame = frame.expect("no frame written");
        assert_eq!(frame.control_type(), Some(ControlType::Restart));
        assert_eq!(frame.header.channel, ChannelId::CONTROL);

        link.handle.shutdown().await.unwrap();
        link.task.await.unwrap().unwrap();
    }

    #[test]
    fn test_open_missing_device_fails() {
        let serial = SerialConfig {
            device: "/dev/pktlink-no-such-port".into(),
            baud_rate: 9600,
        };
        let result = open(&serial, LinkConfig::default());
        assert!(matches!(result, Err(Error::Serial(_))));
    }
}

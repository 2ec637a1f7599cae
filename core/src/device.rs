//! Abstract seams to the privileged tunnel process.
//!
//! The core never touches a TUN device or the raw IPC transport directly; it
//! reads and writes through these traits. The channel-backed implementations
//! below are what the daemon wires in (the privileged process sits on the
//! other end of the queues) and what the tests drive directly.

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device closed")]
    Closed,

    #[error("device error: {0}")]
    Io(String),
}

/// Byte-oriented handle to the tunnel network device.
#[async_trait]
pub trait TunnelDevice: Send + Sync {
    /// Read the next frame, truncated to `max_len`. Blocks until a frame is
    /// available; `Err(Closed)` once the device is gone.
    async fn read_frame(&self, max_len: usize) -> Result<Vec<u8>, DeviceError>;

    /// Write one frame to the device.
    async fn write_frame(&self, frame: &[u8]) -> Result<(), DeviceError>;
}

/// Bounded, closable byte-message queue.
#[async_trait]
pub trait FrameQueue: Send + Sync {
    async fn push(&self, frame: Vec<u8>) -> Result<(), DeviceError>;

    /// Blocking pop; `None` once closed and drained.
    async fn pop(&self) -> Option<Vec<u8>>;

    /// Non-blocking pop; `Ok(None)` when currently empty.
    fn try_pop(&self) -> Result<Option<Vec<u8>>, DeviceError>;

    /// Close the queue. Pending frames remain poppable.
    fn close(&self);
}

/// In-process bounded queue over a tokio channel.
pub struct ChannelQueue {
    tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
}

impl ChannelQueue {
    pub fn new(depth: usize) -> Self {
        let (tx, rx) = mpsc::channel(depth);
        Self {
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
        }
    }
}

#[async_trait]
impl FrameQueue for ChannelQueue {
    async fn push(&self, frame: Vec<u8>) -> Result<(), DeviceError> {
        let tx = self.tx.lock().clone().ok_or(DeviceError::Closed)?;
        tx.send(frame).await.map_err(|_| DeviceError::Closed)
    }

    async fn pop(&self) -> Option<Vec<u8>> {
        self.rx.lock().await.recv().await
    }

    fn try_pop(&self) -> Result<Option<Vec<u8>>, DeviceError> {
        let mut rx = self
            .rx
            .try_lock()
            .map_err(|_| DeviceError::Io("queue busy".to_string()))?;
        match rx.try_recv() {
            Ok(frame) => Ok(Some(frame)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => Err(DeviceError::Closed),
        }
    }

    fn close(&self) {
        self.tx.lock().take();
    }
}

/// Tunnel device backed by a pair of queues: frames arriving from the
/// privileged process on `inbound`, frames we deliver on `outbound`.
pub struct ChannelDevice {
    inbound: ChannelQueue,
    outbound: ChannelQueue,
}

impl ChannelDevice {
    pub fn new(depth: usize) -> Self {
        Self {
            inbound: ChannelQueue::new(depth),
            outbound: ChannelQueue::new(depth),
        }
    }

    /// The side the privileged process (or a test) talks to.
    pub fn inbound(&self) -> &ChannelQueue {
        &self.inbound
    }

    pub fn outbound(&self) -> &ChannelQueue {
        &self.outbound
    }

    pub fn close(&self) {
        self.inbound.close();
        self.outbound.close();
    }
}

#[async_trait]
impl TunnelDevice for ChannelDevice {
    async fn read_frame(&self, max_len: usize) -> Result<Vec<u8>, DeviceError> {
        let mut frame = self.inbound.pop().await.ok_or(DeviceError::Closed)?;
        frame.truncate(max_len);
        Ok(frame)
    }

    async fn write_frame(&self, frame: &[u8]) -> Result<(), DeviceError> {
        self.outbound.push(frame.to_vec()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_queue_fifo() {
        let queue = ChannelQueue::new(4);
        queue.push(vec![1]).await.unwrap();
        queue.push(vec![2]).await.unwrap();
        assert_eq!(queue.pop().await, Some(vec![1]));
        assert_eq!(queue.pop().await, Some(vec![2]));
        assert_eq!(queue.try_pop().unwrap(), None);
    }

    #[tokio::test]
    async fn test_queue_close_drains_then_ends() {
        let queue = ChannelQueue::new(4);
        queue.push(vec![1]).await.unwrap();
        queue.close();
        assert!(queue.push(vec![2]).await.is_err());
        assert_eq!(queue.pop().await, Some(vec![1]));
        assert_eq!(queue.pop().await, None);
    }

    #[tokio::test]
    async fn test_device_read_truncates() {
        let device = ChannelDevice::new(4);
        device.inbound().push(vec![1, 2, 3, 4, 5]).await.unwrap();
        let frame = device.read_frame(3).await.unwrap();
        assert_eq!(frame, vec![1, 2, 3]);
    }
}

use econet_core::EconetPacket;
use std::io;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// Abstraction for Econet packet transport.
///
/// The gateway loop runs on this trait, so it can sit on the AUN UDP
/// transport or on an in-memory channel.
pub trait PacketIo: Send + 'static {
    /// Poll for the next decoded inbound packet.
    fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<EconetPacket>>;

    /// Send a packet to the station named in its destination address.
    fn send(&mut self, packet: &EconetPacket) -> io::Result<()>;
}

/// In-memory [`PacketIo`] backed by mpsc channels.
pub struct ChannelIo {
    rx: mpsc::Receiver<EconetPacket>,
    tx: mpsc::Sender<EconetPacket>,
}

/// The far end of a [`ChannelIo`]: injects inbound packets and collects
/// whatever the gateway sends.
pub struct ChannelPeer {
    pub tx: mpsc::Sender<EconetPacket>,
    pub rx: mpsc::Receiver<EconetPacket>,
}

impl ChannelIo {
    /// Create a connected pair with `capacity` packets buffered per direction.
    pub fn pair(capacity: usize) -> (ChannelIo, ChannelPeer) {
        let (to_io_tx, to_io_rx) = mpsc::channel(capacity);
        let (from_io_tx, from_io_rx) = mpsc::channel(capacity);
        (
            ChannelIo {
                rx: to_io_rx,
                tx: from_io_tx,
            },
            ChannelPeer {
                tx: to_io_tx,
                rx: from_io_rx,
            },
        )
    }
}

impl PacketIo for ChannelIo {
    fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<EconetPacket>> {
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(packet)) => Poll::Ready(Ok(packet)),
            Poll::Ready(None) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "packet channel closed",
            ))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn send(&mut self, packet: &EconetPacket) -> io::Result<()> {
        self.tx
            .try_send(packet.clone())
            .map_err(|e| io::Error::new(io::ErrorKind::WouldBlock, e.to_string()))
    }
}

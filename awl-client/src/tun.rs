//! TUN device backends
//!
//! `Os` wraps a kernel TUN interface; `Loopback` is an in-process device
//! whose "kernel" side is a pair of channels, used by tests and by nodes
//! started without a VPN interface.

use std::io;
use std::net::Ipv4Addr;
#[cfg(feature = "vpn")]
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

enum Backend {
    #[cfg(feature = "vpn")]
    Os(Arc<tun_rs::AsyncDevice>),
    Loopback(LoopbackTun),
}

struct LoopbackTun {
    from_kernel: Mutex<mpsc::Receiver<Vec<u8>>>,
    to_kernel: mpsc::UnboundedSender<Vec<u8>>,
}

/// Kernel side of a loopback device
pub struct LoopbackHandle {
    /// Packets the local stack "sends" into the VPN
    pub inject: mpsc::Sender<Vec<u8>>,
    /// Packets the VPN delivered to the local stack
    pub written: mpsc::UnboundedReceiver<Vec<u8>>,
}

pub struct TunDevice {
    backend: Backend,
    name: String,
    mtu: u16,
}

impl TunDevice {
    /// Create and configure the OS interface
    #[cfg(feature = "vpn")]
    pub fn create(name: &str, ip: Ipv4Addr, prefix: u8, mtu: u16) -> io::Result<Self> {
        let device = tun_rs::DeviceBuilder::new()
            .name(name)
            .ipv4(ip, prefix, None)
            .mtu(mtu)
            .build_async()?;
        info!("🧱 TUN {} up with {}/{} mtu {}", name, ip, prefix, mtu);
        Ok(Self {
            backend: Backend::Os(Arc::new(device)),
            name: name.to_string(),
            mtu,
        })
    }

    #[cfg(not(feature = "vpn"))]
    pub fn create(name: &str, _ip: Ipv4Addr, _prefix: u8, _mtu: u16) -> io::Result<Self> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("cannot create {}: built without the vpn feature", name),
        ))
    }

    pub fn loopback(name: &str, mtu: u16) -> (Self, LoopbackHandle) {
        let (inject, from_kernel) = mpsc::channel(256);
        let (to_kernel, written) = mpsc::unbounded_channel();
        info!("🧱 loopback TUN {} mtu {}", name, mtu);
        let device = Self {
            backend: Backend::Loopback(LoopbackTun {
                from_kernel: Mutex::new(from_kernel),
                to_kernel,
            }),
            name: name.to_string(),
            mtu,
        };
        (device, LoopbackHandle { inject, written })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    /// Read one packet from the local stack
    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        match &self.backend {
            #[cfg(feature = "vpn")]
            Backend::Os(dev) => dev.recv(buf).await,
            Backend::Loopback(lo) => {
                let mut rx = lo.from_kernel.lock().await;
                loop {
                    let packet = rx.recv().await.ok_or_else(|| {
                        io::Error::new(io::ErrorKind::BrokenPipe, "loopback tun closed")
                    })?;
                    // the kernel never hands out more than the mtu
                    if packet.len() > buf.len() || packet.len() > usize::from(self.mtu) {
                        warn!(
                            "⚠️ loopback TUN {} dropped {} byte packet (mtu {})",
                            self.name,
                            packet.len(),
                            self.mtu
                        );
                        continue;
                    }
                    buf[..packet.len()].copy_from_slice(&packet);
                    return Ok(packet.len());
                }
            }
        }
    }

    /// Deliver one packet to the local stack
    pub async fn send(&self, packet: &[u8]) -> io::Result<()> {
        match &self.backend {
            #[cfg(feature = "vpn")]
            Backend::Os(dev) => dev.send(packet).await.map(|_| ()),
            Backend::Loopback(lo) => lo
                .to_kernel
                .send(packet.to_vec())
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "loopback tun closed")),
        }
    }
}

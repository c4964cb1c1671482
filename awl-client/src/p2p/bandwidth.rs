//! Per-protocol and per-peer byte accounting for overlay streams

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::{AsyncRead, AsyncWrite};
use libp2p::{PeerId, StreamProtocol};
use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct BandwidthStats {
    pub total_in: u64,
    pub total_out: u64,
    /// Bytes per second over the last sample window
    pub rate_in: f64,
    pub rate_out: f64,
}

#[derive(Default)]
struct Meter {
    stats: BandwidthStats,
    sampled_in: u64,
    sampled_out: u64,
}

impl Meter {
    fn add(&mut self, inbound: u64, outbound: u64) {
        self.stats.total_in += inbound;
        self.stats.total_out += outbound;
    }

    fn sample(&mut self, secs: f64) {
        self.stats.rate_in = (self.stats.total_in - self.sampled_in) as f64 / secs;
        self.stats.rate_out = (self.stats.total_out - self.sampled_out) as f64 / secs;
        self.sampled_in = self.stats.total_in;
        self.sampled_out = self.stats.total_out;
    }
}

#[derive(Default)]
struct Meters {
    total: Meter,
    by_protocol: HashMap<StreamProtocol, Meter>,
    by_peer: HashMap<PeerId, Meter>,
    streams_by_peer: HashMap<PeerId, usize>,
}

#[derive(Default)]
pub struct BandwidthCounter {
    meters: Mutex<Meters>,
    open_streams: AtomicUsize,
}

impl BandwidthCounter {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, peer: &PeerId, protocol: &StreamProtocol, inbound: u64, outbound: u64) {
        let mut m = self.meters.lock();
        m.total.add(inbound, outbound);
        m.by_protocol
            .entry(protocol.clone())
            .or_default()
            .add(inbound, outbound);
        m.by_peer.entry(*peer).or_default().add(inbound, outbound);
    }

    /// Update rates from the bytes counted since the previous sample
    pub fn sample(&self, elapsed: Duration) {
        let secs = elapsed.as_secs_f64().max(f64::EPSILON);
        let mut m = self.meters.lock();
        m.total.sample(secs);
        m.by_protocol.values_mut().for_each(|meter| meter.sample(secs));
        m.by_peer.values_mut().for_each(|meter| meter.sample(secs));
    }

    pub fn totals(&self) -> BandwidthStats {
        self.meters.lock().total.stats
    }

    pub fn by_protocol(&self) -> HashMap<String, BandwidthStats> {
        self.meters
            .lock()
            .by_protocol
            .iter()
            .map(|(proto, meter)| (proto.to_string(), meter.stats))
            .collect()
    }

    pub fn by_peer(&self) -> HashMap<PeerId, BandwidthStats> {
        self.meters
            .lock()
            .by_peer
            .iter()
            .map(|(peer, meter)| (*peer, meter.stats))
            .collect()
    }

    pub fn for_peer(&self, peer: &PeerId) -> BandwidthStats {
        self.meters
            .lock()
            .by_peer
            .get(peer)
            .map(|m| m.stats)
            .unwrap_or_default()
    }

    pub fn open_streams(&self) -> usize {
        self.open_streams.load(Ordering::Relaxed)
    }

    /// Open streams to `peer` across all its connections
    pub fn streams_to_peer(&self, peer: &PeerId) -> usize {
        self.meters
            .lock()
            .streams_by_peer
            .get(peer)
            .copied()
            .unwrap_or(0)
    }

    fn stream_opened(&self, peer: PeerId) {
        self.open_streams.fetch_add(1, Ordering::Relaxed);
        *self.meters.lock().streams_by_peer.entry(peer).or_default() += 1;
    }

    fn stream_closed(&self, peer: &PeerId) {
        self.open_streams.fetch_sub(1, Ordering::Relaxed);
        let mut m = self.meters.lock();
        if let Some(count) = m.streams_by_peer.get_mut(peer) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                m.streams_by_peer.remove(peer);
            }
        }
    }
}

/// Stream wrapper feeding a [`BandwidthCounter`]
pub struct MeteredStream<S> {
    inner: S,
    peer: PeerId,
    protocol: StreamProtocol,
    counter: Arc<BandwidthCounter>,
}

impl<S> MeteredStream<S> {
    pub fn new(inner: S, peer: PeerId, protocol: StreamProtocol, counter: Arc<BandwidthCounter>) -> Self {
        counter.stream_opened(peer);
        Self {
            inner,
            peer,
            protocol,
            counter,
        }
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn protocol(&self) -> &StreamProtocol {
        &self.protocol
    }
}

impl<S> Drop for MeteredStream<S> {
    fn drop(&mut self) {
        self.counter.stream_closed(&self.peer);
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for MeteredStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(n)) = &poll {
            this.counter.record(&this.peer, &this.protocol, *n as u64, 0);
        }
        poll
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for MeteredStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        let poll = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &poll {
            this.counter.record(&this.peer, &this.protocol, 0, *n as u64);
        }
        poll
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_close(cx)
    }
}

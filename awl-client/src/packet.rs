//! Pooled IP packet buffers
//!
//! A [`Packet`] owns a fixed buffer with [`TUN_PACKET_OFFSET`] bytes reserved
//! in front for the TUN adapter header. The packet, source and destination
//! views are index ranges into that buffer, so copying a packet rebases them
//! onto the destination buffer.

use std::net::Ipv4Addr;
use std::ops::Range;
use std::sync::Arc;

use futures::{AsyncRead, AsyncReadExt};
use parking_lot::Mutex;
use pnet_packet::ip::IpNextHeaderProtocols;
use pnet_packet::ipv4::{self, Ipv4Flags, Ipv4Packet, MutableIpv4Packet};
use pnet_packet::tcp::{self, MutableTcpPacket};
use pnet_packet::udp::{self, MutableUdpPacket};

/// Prefix reserved for the TUN adapter's own header
pub const TUN_PACKET_OFFSET: usize = 4;
/// Largest IP packet a [`Packet`] can carry
pub const MAX_CONTENT_SIZE: usize = 4096;
/// Packets kept in the free list; extra returns are dropped
const MAX_POOLED_PACKETS: usize = 1024;

const BUFFER_SIZE: usize = TUN_PACKET_OFFSET + MAX_CONTENT_SIZE;
const TCP_CHECKSUM_OFFSET: usize = 16;
const UDP_CHECKSUM_OFFSET: usize = 6;

pub struct Packet {
    buffer: Box<[u8; BUFFER_SIZE]>,
    packet: Option<Range<usize>>,
    src: Option<Range<usize>>,
    dst: Option<Range<usize>>,
    is_ipv6: bool,
    ip_protocol: u8,
}

impl Default for Packet {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("len", &self.len())
            .field("is_ipv6", &self.is_ipv6)
            .field("ip_protocol", &self.ip_protocol)
            .finish()
    }
}

impl Packet {
    pub fn new() -> Self {
        Self {
            buffer: Box::new([0u8; BUFFER_SIZE]),
            packet: None,
            src: None,
            dst: None,
            is_ipv6: false,
            ip_protocol: 0,
        }
    }

    /// Reset the views, keeping the buffer
    pub fn clear(&mut self) {
        self.packet = None;
        self.src = None;
        self.dst = None;
        self.is_ipv6 = false;
        self.ip_protocol = 0;
    }

    pub fn packet(&self) -> Option<&[u8]> {
        self.packet.clone().map(|r| &self.buffer[r])
    }

    pub fn len(&self) -> usize {
        self.packet.as_ref().map_or(0, |r| r.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn src(&self) -> Option<&[u8]> {
        self.src.clone().map(|r| &self.buffer[r])
    }

    pub fn dst(&self) -> Option<&[u8]> {
        self.dst.clone().map(|r| &self.buffer[r])
    }

    pub fn dst_ipv4(&self) -> Option<Ipv4Addr> {
        match (self.is_ipv6, self.dst()) {
            (false, Some(dst)) => <[u8; 4]>::try_from(dst).ok().map(Ipv4Addr::from),
            _ => None,
        }
    }

    pub fn src_ipv4(&self) -> Option<Ipv4Addr> {
        match (self.is_ipv6, self.src()) {
            (false, Some(src)) => <[u8; 4]>::try_from(src).ok().map(Ipv4Addr::from),
            _ => None,
        }
    }

    pub fn is_ipv6(&self) -> bool {
        self.is_ipv6
    }

    pub fn ip_protocol(&self) -> u8 {
        self.ip_protocol
    }

    /// Writable region after the TUN prefix; follow with [`Packet::set_len`]
    pub fn content_mut(&mut self) -> &mut [u8] {
        &mut self.buffer[TUN_PACKET_OFFSET..]
    }

    /// Mark the first `len` content bytes as the packet
    pub fn set_len(&mut self, len: usize) {
        let len = len.min(MAX_CONTENT_SIZE);
        self.packet = Some(TUN_PACKET_OFFSET..TUN_PACKET_OFFSET + len);
        self.src = None;
        self.dst = None;
    }

    /// Copy `data` in as the packet body; fails if it does not fit
    pub fn set_packet(&mut self, data: &[u8]) -> std::io::Result<()> {
        if data.len() > MAX_CONTENT_SIZE {
            return Err(too_large());
        }
        self.buffer[TUN_PACKET_OFFSET..TUN_PACKET_OFFSET + data.len()].copy_from_slice(data);
        self.set_len(data.len());
        Ok(())
    }

    /// Fill the buffer from `reader` until EOF
    ///
    /// More than [`MAX_CONTENT_SIZE`] bytes of input is an error.
    pub async fn read_from<R>(&mut self, reader: &mut R) -> std::io::Result<usize>
    where
        R: AsyncRead + Unpin,
    {
        self.clear();
        let mut filled = 0;
        loop {
            if filled == MAX_CONTENT_SIZE {
                let mut extra = [0u8; 1];
                if reader.read(&mut extra).await? != 0 {
                    return Err(too_large());
                }
                break;
            }
            let n = reader
                .read(&mut self.buffer[TUN_PACKET_OFFSET + filled..])
                .await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        self.set_len(filled);
        Ok(filled)
    }

    /// Fill in the address views from the IP header
    pub fn parse(&mut self) -> bool {
        let Some(range) = self.packet.clone() else {
            return false;
        };
        let start = range.start;
        match self.buffer[range.clone()].first().map(|b| b >> 4) {
            Some(4) if range.len() >= 20 => {
                self.is_ipv6 = false;
                self.ip_protocol = self.buffer[start + 9];
                self.src = Some(start + 12..start + 16);
                self.dst = Some(start + 16..start + 20);
                true
            }
            Some(6) if range.len() >= 40 => {
                self.is_ipv6 = true;
                self.ip_protocol = self.buffer[start + 6];
                self.src = Some(start + 8..start + 24);
                self.dst = Some(start + 24..start + 40);
                true
            }
            _ => false,
        }
    }

    /// Overwrite IPv4 source and destination; requires a parsed IPv4 packet
    pub fn rewrite_ipv4_addrs(&mut self, src: Ipv4Addr, dst: Ipv4Addr) -> bool {
        match (self.is_ipv6, self.src.clone(), self.dst.clone()) {
            (false, Some(s), Some(d)) => {
                self.buffer[s].copy_from_slice(&src.octets());
                self.buffer[d].copy_from_slice(&dst.octets());
                true
            }
            _ => false,
        }
    }

    /// Recompute the IPv4 header checksum and, for unfragmented TCP and UDP,
    /// the transport checksum over the pseudo-header
    pub fn recalculate_checksum(&mut self) {
        if self.is_ipv6 {
            return;
        }
        let Some(range) = self.packet.clone() else {
            return;
        };
        let buf = &mut self.buffer[range];

        let (header_len, total_len, src, dst, protocol, whole) = {
            let Some(mut ip) = MutableIpv4Packet::new(buf) else {
                return;
            };
            ip.set_checksum(0);
            let sum = ipv4::checksum(&ip.to_immutable());
            ip.set_checksum(sum);
            let more_fragments = ip.get_flags() & Ipv4Flags::MoreFragments != 0;
            (
                usize::from(ip.get_header_length()) * 4,
                usize::from(ip.get_total_length()),
                ip.get_source(),
                ip.get_destination(),
                ip.get_next_level_protocol(),
                ip.get_fragment_offset() == 0 && !more_fragments,
            )
        };

        // a fragment carries only part of the segment the checksum covers
        if !whole {
            return;
        }
        let end = total_len.min(buf.len());
        if header_len >= end {
            return;
        }
        let transport = &mut buf[header_len..end];
        if protocol == IpNextHeaderProtocols::Tcp {
            if let Some(mut tcp) = MutableTcpPacket::new(transport) {
                tcp.set_checksum(0);
                let sum = tcp::ipv4_checksum(&tcp.to_immutable(), &src, &dst);
                tcp.set_checksum(sum);
            }
        } else if protocol == IpNextHeaderProtocols::Udp {
            if let Some(mut udp) = MutableUdpPacket::new(transport) {
                udp.set_checksum(0);
                let sum = udp::ipv4_checksum(&udp.to_immutable(), &src, &dst);
                udp.set_checksum(sum);
            }
        }
    }

    /// Move a parsed IPv4 packet to new addresses, keeping its checksums valid
    ///
    /// The header checksum is recomputed. The TCP or UDP checksum is adjusted
    /// incrementally (RFC 1624) for the address change on the fragment that
    /// carries the transport header, so it stays valid for the reassembled
    /// datagram; later fragments are left untouched.
    pub fn translate_ipv4_addrs(&mut self, src: Ipv4Addr, dst: Ipv4Addr) -> bool {
        let (Some(old_src), Some(old_dst)) = (self.src_ipv4(), self.dst_ipv4()) else {
            return false;
        };
        if !self.rewrite_ipv4_addrs(src, dst) {
            return false;
        }
        let Some(range) = self.packet.clone() else {
            return false;
        };
        let buf = &mut self.buffer[range];

        let (header_len, total_len, protocol, first_fragment) = {
            let Some(mut ip) = MutableIpv4Packet::new(buf) else {
                return false;
            };
            ip.set_checksum(0);
            let sum = ipv4::checksum(&ip.to_immutable());
            ip.set_checksum(sum);
            (
                usize::from(ip.get_header_length()) * 4,
                usize::from(ip.get_total_length()),
                ip.get_next_level_protocol(),
                ip.get_fragment_offset() == 0,
            )
        };
        if !first_fragment {
            return true;
        }

        let field = if protocol == IpNextHeaderProtocols::Tcp {
            TCP_CHECKSUM_OFFSET
        } else if protocol == IpNextHeaderProtocols::Udp {
            UDP_CHECKSUM_OFFSET
        } else {
            return true;
        };
        let at = header_len + field;
        if at + 2 > total_len.min(buf.len()) {
            return true;
        }
        let checksum = u16::from_be_bytes([buf[at], buf[at + 1]]);
        // zero means the sender skipped the UDP checksum
        if protocol == IpNextHeaderProtocols::Udp && checksum == 0 {
            return true;
        }

        let mut old = [0u8; 8];
        old[..4].copy_from_slice(&old_src.octets());
        old[4..].copy_from_slice(&old_dst.octets());
        let mut new = [0u8; 8];
        new[..4].copy_from_slice(&src.octets());
        new[4..].copy_from_slice(&dst.octets());
        let mut updated = adjust_checksum(checksum, &old, &new);
        if protocol == IpNextHeaderProtocols::Udp && updated == 0 {
            updated = 0xffff;
        }
        buf[at..at + 2].copy_from_slice(&updated.to_be_bytes());
        true
    }

    /// Duplicate into `dst`, rebasing every view onto its buffer
    pub fn copy_to(&self, dst: &mut Packet) {
        dst.clear();
        if let Some(range) = self.packet.clone() {
            dst.buffer[range.clone()].copy_from_slice(&self.buffer[range.clone()]);
            dst.packet = Some(range);
        }
        dst.src = self.src.clone();
        dst.dst = self.dst.clone();
        dst.is_ipv6 = self.is_ipv6;
        dst.ip_protocol = self.ip_protocol;
    }

    /// The IPv4 header view, if the packet is one
    pub fn ipv4(&self) -> Option<Ipv4Packet<'_>> {
        if self.is_ipv6 {
            return None;
        }
        self.packet().and_then(Ipv4Packet::new)
    }
}

/// RFC 1624 eqn. 3: `HC' = ~(~HC + ~m + m')` over each changed 16-bit word
fn adjust_checksum(checksum: u16, old: &[u8], new: &[u8]) -> u16 {
    let mut sum = u32::from(!checksum);
    for (o, n) in old.chunks(2).zip(new.chunks(2)) {
        sum += u32::from(!u16::from_be_bytes([o[0], o[1]]));
        sum += u32::from(u16::from_be_bytes([n[0], n[1]]));
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

fn too_large() -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        format!("packet exceeds {} bytes", MAX_CONTENT_SIZE),
    )
}

/// Shared free list of packets
#[derive(Clone, Default)]
pub struct PacketPool {
    free: Arc<Mutex<Vec<Box<Packet>>>>,
}

impl PacketPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_temp_packet(&self) -> Box<Packet> {
        self.free.lock().pop().unwrap_or_default()
    }

    pub fn put_temp_packet(&self, mut packet: Box<Packet>) {
        packet.clear();
        let mut free = self.free.lock();
        if free.len() < MAX_POOLED_PACKETS {
            free.push(packet);
        }
    }

    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use futures::io::Cursor;

    fn udp_packet(total_len: usize, src: Ipv4Addr, dst: Ipv4Addr) -> Vec<u8> {
        let mut raw = vec![0u8; total_len];
        {
            let mut ip = MutableIpv4Packet::new(&mut raw).unwrap();
            ip.set_version(4);
            ip.set_header_length(5);
            ip.set_total_length(total_len as u16);
            ip.set_ttl(64);
            ip.set_next_level_protocol(IpNextHeaderProtocols::Udp);
            ip.set_source(src);
            ip.set_destination(dst);
        }
        {
            let mut udp = MutableUdpPacket::new(&mut raw[20..]).unwrap();
            udp.set_source(5353);
            udp.set_destination(9999);
            udp.set_length((total_len - 20) as u16);
        }
        for (i, b) in raw[28..].iter_mut().enumerate() {
            *b = i as u8;
        }
        raw
    }

    fn tcp_packet(src: Ipv4Addr, dst: Ipv4Addr) -> Vec<u8> {
        let mut raw = vec![0u8; 60];
        {
            let mut ip = MutableIpv4Packet::new(&mut raw).unwrap();
            ip.set_version(4);
            ip.set_header_length(5);
            ip.set_total_length(60);
            ip.set_ttl(64);
            ip.set_next_level_protocol(IpNextHeaderProtocols::Tcp);
            ip.set_source(src);
            ip.set_destination(dst);
        }
        {
            let mut tcp = MutableTcpPacket::new(&mut raw[20..]).unwrap();
            tcp.set_source(40000);
            tcp.set_destination(80);
            tcp.set_data_offset(5);
            tcp.set_window(1024);
        }
        raw[40..].copy_from_slice(b"GET /index HTTP/1.0\n");
        raw
    }

    fn fold(mut sum: u32) -> u16 {
        while sum >> 16 != 0 {
            sum = (sum & 0xffff) + (sum >> 16);
        }
        !(sum as u16)
    }

    fn sum_words(data: &[u8]) -> u32 {
        data.chunks(2)
            .map(|c| u32::from(u16::from_be_bytes([c[0], *c.get(1).unwrap_or(&0)])))
            .sum()
    }

    /// Zero when the header checksum verifies
    fn verify_header(raw: &[u8]) -> u16 {
        fold(sum_words(&raw[..20]))
    }

    /// Zero when the transport checksum verifies over the pseudo-header
    fn verify_transport(raw: &[u8]) -> u16 {
        let segment = &raw[20..];
        let mut pseudo = Vec::new();
        pseudo.extend_from_slice(&raw[12..20]);
        pseudo.extend_from_slice(&[0, raw[9]]);
        pseudo.extend_from_slice(&(segment.len() as u16).to_be_bytes());
        fold(sum_words(&pseudo) + sum_words(segment))
    }

    #[test]
    fn parse_ipv4() {
        let raw = udp_packet(64, Ipv4Addr::new(10, 66, 0, 1), Ipv4Addr::new(10, 66, 0, 2));
        let mut p = Packet::new();
        p.set_packet(&raw).unwrap();
        assert!(p.parse());
        assert!(!p.is_ipv6());
        assert_eq!(p.ip_protocol(), 17);
        assert_eq!(p.src(), Some(&[10, 66, 0, 1][..]));
        assert_eq!(p.dst_ipv4(), Some(Ipv4Addr::new(10, 66, 0, 2)));
    }

    #[test]
    fn parse_ipv6() {
        let mut raw = vec![0u8; 48];
        raw[0] = 0x60;
        raw[6] = 58;
        raw[8..24].copy_from_slice(&[0xfe, 0x80, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]);
        raw[24] = 0xff;
        let mut p = Packet::new();
        p.set_packet(&raw).unwrap();
        assert!(p.parse());
        assert!(p.is_ipv6());
        assert_eq!(p.src().unwrap().len(), 16);
        assert_eq!(p.dst().unwrap()[0], 0xff);
        assert_eq!(p.dst_ipv4(), None);
    }

    #[test]
    fn parse_rejects_short_and_unknown() {
        let mut p = Packet::new();
        p.set_packet(&[0x45; 19]).unwrap();
        assert!(!p.parse());
        p.set_packet(&[0x60; 39]).unwrap();
        assert!(!p.parse());
        p.set_packet(&[0x10; 64]).unwrap();
        assert!(!p.parse());
        p.clear();
        assert!(!p.parse());
    }

    #[test]
    fn checksums_verify_after_rewrite() {
        for raw in [
            udp_packet(1500, Ipv4Addr::new(192, 168, 1, 5), Ipv4Addr::new(10, 66, 0, 9)),
            tcp_packet(Ipv4Addr::new(172, 16, 0, 1), Ipv4Addr::new(10, 66, 0, 3)),
        ] {
            let mut p = Packet::new();
            p.set_packet(&raw).unwrap();
            assert!(p.parse());
            assert!(p.rewrite_ipv4_addrs(Ipv4Addr::new(10, 66, 0, 2), Ipv4Addr::new(10, 66, 0, 1)));
            p.recalculate_checksum();

            let out = p.packet().unwrap();
            assert_eq!(verify_header(out), 0);
            assert_eq!(verify_transport(out), 0);
            assert_eq!(&out[12..16], &[10, 66, 0, 2]);
        }
    }

    /// A UDP datagram with a valid checksum
    fn checksummed_udp(total_len: usize, src: Ipv4Addr, dst: Ipv4Addr) -> Vec<u8> {
        let mut p = Packet::new();
        p.set_packet(&udp_packet(total_len, src, dst)).unwrap();
        p.recalculate_checksum();
        p.packet().unwrap().to_vec()
    }

    fn set_fragment(raw: &mut [u8], offset: u16, more: bool) {
        let mut ip = MutableIpv4Packet::new(raw).unwrap();
        ip.set_fragment_offset(offset);
        ip.set_flags(if more { Ipv4Flags::MoreFragments } else { 0 });
    }

    #[test]
    fn translate_keeps_whole_datagram_valid() {
        for raw in [
            checksummed_udp(1500, Ipv4Addr::new(192, 168, 1, 5), Ipv4Addr::new(10, 66, 0, 9)),
            {
                let mut p = Packet::new();
                p.set_packet(&tcp_packet(Ipv4Addr::new(172, 16, 0, 1), Ipv4Addr::new(10, 66, 0, 3)))
                    .unwrap();
                p.recalculate_checksum();
                p.packet().unwrap().to_vec()
            },
        ] {
            let mut p = Packet::new();
            p.set_packet(&raw).unwrap();
            assert!(p.parse());
            assert!(p.translate_ipv4_addrs(Ipv4Addr::new(10, 66, 0, 2), Ipv4Addr::new(10, 66, 0, 1)));

            let out = p.packet().unwrap();
            assert_eq!(&out[12..20], &[10, 66, 0, 2, 10, 66, 0, 1]);
            assert_eq!(verify_header(out), 0);
            assert_eq!(verify_transport(out), 0);
        }
    }

    #[test]
    fn translate_leaves_later_fragment_payload_alone() {
        let mut raw = udp_packet(200, Ipv4Addr::new(192, 168, 1, 5), Ipv4Addr::new(10, 66, 0, 9));
        set_fragment(&mut raw, 185, false);
        for (i, b) in raw[20..].iter_mut().enumerate() {
            *b = 0xa0 ^ i as u8;
        }
        let payload = raw[20..].to_vec();

        let mut p = Packet::new();
        p.set_packet(&raw).unwrap();
        assert!(p.parse());
        assert!(p.translate_ipv4_addrs(Ipv4Addr::new(10, 66, 0, 2), Ipv4Addr::new(10, 66, 0, 1)));

        let out = p.packet().unwrap();
        assert_eq!(&out[20..], &payload[..]);
        assert_eq!(verify_header(out), 0);
    }

    #[test]
    fn translate_first_fragment_valid_after_reassembly() {
        let src = Ipv4Addr::new(192, 168, 1, 5);
        let dst = Ipv4Addr::new(10, 66, 0, 9);
        let whole = checksummed_udp(1500, src, dst);

        // first fragment: header plus 8 * 100 bytes of the UDP segment
        let split = 20 + 800;
        let mut first = whole[..split].to_vec();
        {
            let mut ip = MutableIpv4Packet::new(&mut first).unwrap();
            ip.set_total_length(split as u16);
        }
        set_fragment(&mut first, 0, true);

        let mut p = Packet::new();
        p.set_packet(&first).unwrap();
        assert!(p.parse());
        assert!(p.translate_ipv4_addrs(Ipv4Addr::new(10, 66, 0, 2), Ipv4Addr::new(10, 66, 0, 1)));
        let out = p.packet().unwrap();
        assert_eq!(verify_header(out), 0);

        let mut reassembled = out.to_vec();
        reassembled.extend_from_slice(&whole[split..]);
        assert_eq!(verify_transport(&reassembled), 0);
    }

    #[test]
    fn translate_keeps_absent_udp_checksum() {
        let raw = udp_packet(100, Ipv4Addr::new(192, 168, 1, 5), Ipv4Addr::new(10, 66, 0, 9));
        let mut p = Packet::new();
        p.set_packet(&raw).unwrap();
        assert!(p.parse());
        assert!(p.translate_ipv4_addrs(Ipv4Addr::new(10, 66, 0, 2), Ipv4Addr::new(10, 66, 0, 1)));
        let out = p.packet().unwrap();
        assert_eq!(&out[26..28], &[0, 0]);
        assert_eq!(verify_header(out), 0);
    }

    #[test]
    fn recalculate_skips_transport_of_fragments() {
        let mut raw = udp_packet(200, Ipv4Addr::new(192, 168, 1, 5), Ipv4Addr::new(10, 66, 0, 9));
        set_fragment(&mut raw, 185, false);
        let payload = raw[20..].to_vec();
        let mut p = Packet::new();
        p.set_packet(&raw).unwrap();
        p.recalculate_checksum();
        let out = p.packet().unwrap();
        assert_eq!(&out[20..], &payload[..]);
        assert_eq!(verify_header(out), 0);
    }

    #[test]
    fn read_from_preserves_bytes() {
        let raw = udp_packet(1500, Ipv4Addr::new(10, 66, 0, 1), Ipv4Addr::new(10, 66, 0, 2));
        let mut p = Packet::new();
        let n = block_on(p.read_from(&mut Cursor::new(raw.clone()))).unwrap();
        assert_eq!(n, 1500);

        let mut copy = Packet::new();
        copy.set_packet(p.packet().unwrap()).unwrap();
        assert_eq!(copy.packet().unwrap(), &raw[..]);
    }

    #[test]
    fn read_from_rejects_oversized() {
        let mut p = Packet::new();
        let err = block_on(p.read_from(&mut Cursor::new(vec![0x45; MAX_CONTENT_SIZE + 1])))
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);

        let n = block_on(p.read_from(&mut Cursor::new(vec![0x45; MAX_CONTENT_SIZE]))).unwrap();
        assert_eq!(n, MAX_CONTENT_SIZE);
    }

    #[test]
    fn copy_to_rebases_views() {
        let raw = udp_packet(100, Ipv4Addr::new(10, 66, 0, 7), Ipv4Addr::new(10, 66, 0, 8));
        let mut p = Packet::new();
        p.set_packet(&raw).unwrap();
        p.parse();

        let mut dst = Packet::new();
        p.copy_to(&mut dst);
        p.rewrite_ipv4_addrs(Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(2, 2, 2, 2));

        assert_eq!(dst.src_ipv4(), Some(Ipv4Addr::new(10, 66, 0, 7)));
        assert_eq!(dst.packet().unwrap(), &raw[..]);
    }

    #[test]
    fn pool_returns_cleared_packets() {
        let pool = PacketPool::new();
        let mut p = pool.get_temp_packet();
        p.set_packet(&udp_packet(64, Ipv4Addr::LOCALHOST, Ipv4Addr::LOCALHOST))
            .unwrap();
        p.parse();
        pool.put_temp_packet(p);
        assert_eq!(pool.idle(), 1);

        let p = pool.get_temp_packet();
        assert!(p.packet().is_none());
        assert!(p.src().is_none());
        assert!(p.dst().is_none());
        assert!(!p.is_ipv6());
        assert_eq!(pool.idle(), 0);
    }
}

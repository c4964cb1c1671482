//! RFC 1928 SOCKS5 server side (no authentication, CONNECT only)

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

pub const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_NONE_ACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplyCode {
    Succeeded = 0x00,
    ServerFailure = 0x01,
    NotAllowedByRuleset = 0x02,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

#[derive(Debug, thiserror::Error)]
pub enum Socks5Error {
    #[error("socks5 i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported socks version {0:#04x}")]
    Version(u8),

    #[error("client offers no acceptable auth method")]
    NoAcceptableMethod,

    #[error("unsupported command {0:#04x}")]
    Command(u8),

    #[error("unsupported address type {0:#04x}")]
    AddressType(u8),

    #[error("domain name is not valid utf-8")]
    InvalidDomain,

    #[error("proxy request refused with code {0:?}")]
    ProxyDenied(ReplyCode),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl std::fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetAddr::Ip(addr) => write!(f, "{}", addr),
            TargetAddr::Domain(host, port) => write!(f, "{}:{}", host, port),
        }
    }
}

/// Which targets the server may dial
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RuleSet {
    #[default]
    DenyLocalhost,
    PermitAll,
    DenyAll,
}

impl RuleSet {
    pub fn allows(&self, target: &TargetAddr) -> bool {
        match self {
            RuleSet::PermitAll => true,
            RuleSet::DenyAll => false,
            RuleSet::DenyLocalhost => match target {
                TargetAddr::Ip(addr) => !(addr.ip().is_loopback() || addr.ip().is_unspecified()),
                TargetAddr::Domain(host, _) => {
                    let host = host.trim_end_matches('.').to_ascii_lowercase();
                    host != "localhost" && !host.ends_with(".localhost")
                }
            },
        }
    }
}

/// Read the greeting and select no-auth
pub async fn accept_greeting<S>(stream: &mut S) -> Result<(), Socks5Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let version = stream.read_u8().await?;
    if version != SOCKS_VERSION {
        return Err(Socks5Error::Version(version));
    }
    let count = stream.read_u8().await?;
    let mut methods = vec![0u8; usize::from(count)];
    stream.read_exact(&mut methods).await?;

    if !methods.contains(&METHOD_NO_AUTH) {
        stream
            .write_all(&[SOCKS_VERSION, METHOD_NONE_ACCEPTABLE])
            .await?;
        return Err(Socks5Error::NoAcceptableMethod);
    }
    stream.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;
    Ok(())
}

/// Read a CONNECT request; unsupported requests are answered before
/// the error is returned
pub async fn read_request<S>(stream: &mut S) -> Result<TargetAddr, Socks5Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    let [version, cmd, _reserved, atyp] = head;
    if version != SOCKS_VERSION {
        return Err(Socks5Error::Version(version));
    }

    let target = match atyp {
        ATYP_IPV4 => {
            let mut ip = [0u8; 4];
            stream.read_exact(&mut ip).await?;
            let port = stream.read_u16().await?;
            TargetAddr::Ip(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(ip)), port))
        }
        ATYP_IPV6 => {
            let mut ip = [0u8; 16];
            stream.read_exact(&mut ip).await?;
            let port = stream.read_u16().await?;
            TargetAddr::Ip(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(ip)), port))
        }
        ATYP_DOMAIN => {
            let len = stream.read_u8().await?;
            let mut name = vec![0u8; usize::from(len)];
            stream.read_exact(&mut name).await?;
            let port = stream.read_u16().await?;
            let name = String::from_utf8(name).map_err(|_| Socks5Error::InvalidDomain)?;
            TargetAddr::Domain(name, port)
        }
        other => {
            write_reply(stream, ReplyCode::AddressTypeNotSupported, None).await?;
            return Err(Socks5Error::AddressType(other));
        }
    };

    if cmd != CMD_CONNECT {
        write_reply(stream, ReplyCode::CommandNotSupported, None).await?;
        return Err(Socks5Error::Command(cmd));
    }
    Ok(target)
}

pub async fn write_reply<S>(
    stream: &mut S,
    code: ReplyCode,
    bound: Option<SocketAddr>,
) -> Result<(), Socks5Error>
where
    S: AsyncWrite + Unpin,
{
    let bound = bound.unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));
    let mut reply = vec![SOCKS_VERSION, code as u8, 0x00];
    match bound.ip() {
        IpAddr::V4(ip) => {
            reply.push(ATYP_IPV4);
            reply.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            reply.push(ATYP_IPV6);
            reply.extend_from_slice(&ip.octets());
        }
    }
    reply.extend_from_slice(&bound.port().to_be_bytes());
    stream.write_all(&reply).await?;
    stream.flush().await?;
    Ok(())
}

/// Complete the handshake, then answer `code` and stop
pub async fn refuse<S>(stream: &mut S, code: ReplyCode) -> Result<(), Socks5Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    accept_greeting(stream).await?;
    read_request(stream).await?;
    write_reply(stream, code, None).await?;
    let _ = stream.shutdown().await;
    Ok(())
}

/// Serve one SOCKS5 session: handshake, rule check, dial, splice
pub async fn serve<S>(mut stream: S, rules: RuleSet) -> Result<(), Socks5Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    accept_greeting(&mut stream).await?;
    let target = read_request(&mut stream).await?;

    if !rules.allows(&target) {
        info!("🚫 socks5 target {} denied by {:?}", target, rules);
        write_reply(&mut stream, ReplyCode::NotAllowedByRuleset, None).await?;
        return Err(Socks5Error::ProxyDenied(ReplyCode::NotAllowedByRuleset));
    }

    let dialed = match &target {
        TargetAddr::Ip(addr) => TcpStream::connect(addr).await,
        TargetAddr::Domain(host, port) => TcpStream::connect((host.as_str(), *port)).await,
    };
    let mut upstream = match dialed {
        Ok(upstream) => upstream,
        Err(e) => {
            let code = match e.kind() {
                std::io::ErrorKind::ConnectionRefused => ReplyCode::ConnectionRefused,
                _ => ReplyCode::HostUnreachable,
            };
            debug!("socks5 dial {}: {}", target, e);
            write_reply(&mut stream, code, None).await?;
            return Err(Socks5Error::ProxyDenied(code));
        }
    };

    write_reply(&mut stream, ReplyCode::Succeeded, upstream.local_addr().ok()).await?;
    let (sent, received) = tokio::io::copy_bidirectional(&mut stream, &mut upstream).await?;
    debug!("socks5 {} closed: {} bytes out, {} bytes in", target, sent, received);
    Ok(())
}

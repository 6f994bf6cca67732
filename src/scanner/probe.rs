//! The protocol probes, one per kind of service.
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use hickory_resolver::proto::{
    error::ProtoError,
    op::{Message, MessageType, OpCode, Query},
    rr::{DNSClass, Name, RData, RecordType},
};
use log::trace;
use reqwest::header::SERVER;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{timeout, timeout_at, Instant};

use super::snmp::{self, SnmpError};
use super::telnet;

/// Negotiation rounds a Telnet server gets before we give up on it.
const TELNET_ROUNDS: usize = 16;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("timed out")]
    Timeout,
    #[error("no answer: {0}")]
    NoAnswer(&'static str),
    #[error("malformed DNS message: {0}")]
    Dns(#[from] ProtoError),
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("snmp: {0}")]
    Snmp(#[from] SnmpError),
}

/// How a port is probed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    /// Read the first line the server sends.
    Banner,
    /// Ask for root.
    Finger,
    /// version.bind in the CHAOS class.
    DnsVersion,
    /// HEAD /, reporting the Server header.
    Http,
    /// sysDescr.0 with community "public".
    Snmp,
    Telnet,
    /// Connect and take whatever the server volunteers.
    Connect,
}

impl Probe {
    pub const fn for_port(port: u16) -> Self {
        match port {
            21 | 22 | 25 | 110 | 143 | 2525 => Self::Banner,
            79 => Self::Finger,
            53 | 5353 => Self::DnsVersion,
            80 | 443 | 8000 | 8080 => Self::Http,
            161 => Self::Snmp,
            23 | 3270 | 9023 => Self::Telnet,
            _ => Self::Connect,
        }
    }
}

async fn within<T, E>(
    limit: Duration,
    fut: impl std::future::Future<Output = Result<T, E>>,
) -> Result<T, ProbeError>
where
    ProbeError: From<E>,
{
    match timeout(limit, fut).await {
        Ok(res) => Ok(res?),
        Err(_) => Err(ProbeError::Timeout),
    }
}

/// Like [`within`], for loops that must finish by one `deadline` however
/// many reads they take.
async fn before<T, E>(
    deadline: Instant,
    fut: impl std::future::Future<Output = Result<T, E>>,
) -> Result<T, ProbeError>
where
    ProbeError: From<E>,
{
    match timeout_at(deadline, fut).await {
        Ok(res) => Ok(res?),
        Err(_) => Err(ProbeError::Timeout),
    }
}

fn strip_newlines(s: &str) -> String {
    s.replace(['\r', '\n'], "")
}

/// Runs probes with a shared HTTP client and deadline.
#[derive(Debug, Clone)]
pub struct Prober {
    http: reqwest::Client,
    timeout: Duration,
}

impl Prober {
    pub fn new(timeout: Duration) -> Result<Self, ProbeError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .no_proxy()
            .danger_accept_invalid_certs(true)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { http, timeout })
    }

    pub async fn probe(&self, kind: Probe, target: SocketAddr) -> Result<String, ProbeError> {
        trace!("Probing {target} with {kind:?}");
        match kind {
            Probe::Banner => self.banner(target).await,
            Probe::Finger => self.finger(target).await,
            Probe::DnsVersion => self.dns_version(target).await,
            Probe::Http => self.http(target).await,
            Probe::Snmp => self.snmp(target).await,
            Probe::Telnet => self.telnet(target).await,
            Probe::Connect => self.connect_only(target).await,
        }
    }

    async fn connect(&self, target: SocketAddr) -> Result<TcpStream, ProbeError> {
        within(self.timeout, TcpStream::connect(target)).await
    }

    async fn banner(&self, target: SocketAddr) -> Result<String, ProbeError> {
        let mut reader = BufReader::new(self.connect(target).await?);
        let mut line = String::new();
        if within(self.timeout, reader.read_line(&mut line)).await? == 0 {
            return Err(ProbeError::NoAnswer("connection closed"));
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_owned())
    }

    async fn finger(&self, target: SocketAddr) -> Result<String, ProbeError> {
        let mut stream = self.connect(target).await?;
        within(self.timeout, stream.write_all(b"root\r\n")).await?;

        let mut buf = vec![0u8; 4096];
        let n = within(self.timeout, stream.read(&mut buf)).await?;
        if n == 0 {
            return Err(ProbeError::NoAnswer("connection closed"));
        }
        Ok(String::from_utf8_lossy(&buf[..n]).into_owned())
    }

    async fn dns_version(&self, target: SocketAddr) -> Result<String, ProbeError> {
        let local: SocketAddr = match target {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(target).await?;

        let id = rand::random::<u16>();
        let mut query = Query::query(Name::from_ascii("version.bind.")?, RecordType::TXT);
        query.set_query_class(DNSClass::CH);
        let mut message = Message::new();
        message
            .set_id(id)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .add_query(query);
        socket.send(&message.to_vec()?).await?;

        let deadline = Instant::now() + self.timeout;
        let mut buf = vec![0u8; 4096];
        loop {
            let n = before(deadline, socket.recv(&mut buf)).await?;
            let answer = Message::from_vec(&buf[..n])?;
            if answer.id() != id {
                continue;
            }

            return match answer.answers().first().and_then(|r| r.data()) {
                Some(RData::TXT(txt)) => {
                    let text: String = txt
                        .txt_data()
                        .iter()
                        .map(|part| String::from_utf8_lossy(part))
                        .collect();
                    Ok(text.trim_matches('"').to_owned())
                }
                Some(_) => Err(ProbeError::NoAnswer("answer is not TXT")),
                None => Err(ProbeError::NoAnswer("empty answer")),
            };
        }
    }

    async fn http(&self, target: SocketAddr) -> Result<String, ProbeError> {
        let scheme = if target.port() == 443 { "https" } else { "http" };
        let response = self.http.head(format!("{scheme}://{target}/")).send().await?;

        let server = response
            .headers()
            .get(SERVER)
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
            .unwrap_or_default();
        Ok(strip_newlines(&server))
    }

    async fn snmp(&self, target: SocketAddr) -> Result<String, ProbeError> {
        let local: SocketAddr = match target {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(target).await?;

        let request_id = rand::random::<i32>() & 0x7fff_ffff;
        socket
            .send(&snmp::get_request("public", request_id, snmp::SYS_DESCR))
            .await?;

        let deadline = Instant::now() + self.timeout;
        let mut buf = vec![0u8; 65_535];
        loop {
            let n = before(deadline, socket.recv(&mut buf)).await?;
            match snmp::parse_get_response(&buf[..n], request_id) {
                Err(SnmpError::RequestId(_)) => continue,
                Ok(Some(descr)) => return Ok(descr),
                Ok(None) => return Err(ProbeError::NoAnswer("sysDescr is not a string")),
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn telnet(&self, target: SocketAddr) -> Result<String, ProbeError> {
        let mut stream = self.connect(target).await?;
        let mut buf = vec![0u8; 4096];
        let mut pending = Vec::new();

        let n = within(self.timeout, stream.read(&mut buf)).await?;
        if n == 0 {
            return Err(ProbeError::NoAnswer("connection closed"));
        }
        pending.extend_from_slice(&buf[..n]);
        within(self.timeout, stream.write_all(&telnet::PROBE)).await?;

        for _ in 0..TELNET_ROUNDS {
            let negotiation = telnet::negotiate(&pending);
            if let Some(start) = negotiation.text {
                let banner = telnet::banner(&pending[start..]);
                if !banner.is_empty() {
                    return Ok(banner);
                }
                // Nothing but line noise so far, wait for the real text.
                pending.clear();
            } else {
                pending.drain(..negotiation.consumed);
            }
            if !negotiation.reply.is_empty() {
                within(self.timeout, stream.write_all(&negotiation.reply)).await?;
            }

            let n = within(self.timeout, stream.read(&mut buf)).await?;
            if n == 0 {
                return Err(ProbeError::NoAnswer("connection closed during negotiation"));
            }
            pending.extend_from_slice(&buf[..n]);
        }

        Err(ProbeError::NoAnswer("negotiation never ended"))
    }

    async fn connect_only(&self, target: SocketAddr) -> Result<String, ProbeError> {
        let mut stream = self.connect(target).await?;
        let mut buf = vec![0u8; 1024];
        let greeting = match timeout(self.timeout, stream.read(&mut buf)).await {
            Ok(Ok(n)) => String::from_utf8_lossy(&buf[..n]).trim().to_owned(),
            Ok(Err(_)) | Err(_) => String::new(),
        };
        Ok(greeting)
    }
}

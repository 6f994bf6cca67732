//! AXFR over TCP.
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::time::Duration;

use hickory_resolver::proto::{
    error::ProtoError,
    op::{Message, MessageType, OpCode, Query, ResponseCode},
    rr::{Name, Record, RecordType},
};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

#[derive(Debug, Error)]
pub enum XfrError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("timed out")]
    Timeout,
    #[error("malformed DNS message: {0}")]
    Proto(#[from] ProtoError),
    #[error("server answered {0}")]
    Refused(ResponseCode),
    #[error("{0}")]
    Malformed(String),
    #[error("cancelled")]
    Cancelled,
}

/// Encodes an AXFR query for `zone`.
pub fn axfr_query(zone: &str, id: u16) -> Result<Vec<u8>, XfrError> {
    let name = Name::from_ascii(format!("{}.", zone.trim_end_matches('.')))?;
    let mut message = Message::new();
    message
        .set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(false)
        .add_query(Query::query(name, RecordType::AXFR));

    Ok(message.to_vec()?)
}

/// The answer stream of a single zone transfer.
///
/// A transfer is over after the closing SOA record, when the server closes
/// the connection or sends an empty answer. Every read is bounded by the
/// read timeout.
#[derive(Debug)]
pub struct AxfrStream<S> {
    stream: S,
    id: u16,
    soa_seen: usize,
    done: bool,
    read_timeout: Duration,
}

impl AxfrStream<TcpStream> {
    /// Connects to `server` and requests a transfer of `zone`.
    pub async fn connect(
        server: SocketAddr,
        zone: &str,
        read_timeout: Duration,
    ) -> Result<Self, XfrError> {
        let stream = timeout(read_timeout, TcpStream::connect(server))
            .await
            .map_err(|_| XfrError::Timeout)??;
        Self::start(stream, zone, read_timeout).await
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AxfrStream<S> {
    /// Sends the AXFR query for `zone` over an established stream.
    pub async fn start(mut stream: S, zone: &str, read_timeout: Duration) -> Result<Self, XfrError> {
        let id = rand::random::<u16>();
        let query = axfr_query(zone, id)?;
        let len = u16::try_from(query.len())
            .map_err(|_| XfrError::Malformed(format!("query for {zone} too long")))?;

        let mut frame = Vec::with_capacity(query.len() + 2);
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(&query);
        timeout(read_timeout, stream.write_all(&frame))
            .await
            .map_err(|_| XfrError::Timeout)??;
        stream.flush().await?;

        Ok(Self {
            stream,
            id,
            soa_seen: 0,
            done: false,
            read_timeout,
        })
    }

    /// Reads the next answer envelope. `None` once the transfer is over.
    pub async fn next_batch(&mut self) -> Result<Option<Vec<Record>>, XfrError> {
        if self.done {
            return Ok(None);
        }

        let mut len = [0u8; 2];
        match timeout(self.read_timeout, self.stream.read_exact(&mut len)).await {
            Err(_) => return Err(XfrError::Timeout),
            Ok(Err(e)) if e.kind() == ErrorKind::UnexpectedEof => {
                self.done = true;
                return Ok(None);
            }
            Ok(Err(e)) => return Err(e.into()),
            Ok(Ok(_)) => {}
        }

        let mut buf = vec![0u8; usize::from(u16::from_be_bytes(len))];
        timeout(self.read_timeout, self.stream.read_exact(&mut buf))
            .await
            .map_err(|_| XfrError::Timeout)??;

        let message = Message::from_vec(&buf)?;
        if message.id() != self.id {
            self.done = true;
            return Err(XfrError::Malformed(format!(
                "answer id {} does not match query id {}",
                message.id(),
                self.id
            )));
        }
        if message.response_code() != ResponseCode::NoError {
            self.done = true;
            return Err(XfrError::Refused(message.response_code()));
        }

        let records = message.answers().to_vec();
        if records.is_empty() {
            self.done = true;
            return Ok(None);
        }

        self.soa_seen += records
            .iter()
            .filter(|r| r.record_type() == RecordType::SOA)
            .count();
        if self.soa_seen >= 2 {
            self.done = true;
        }
        Ok(Some(records))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use hickory_resolver::proto::rr::rdata::{A, SOA};
    use hickory_resolver::proto::rr::RData;
    use std::net::Ipv4Addr;

    pub(crate) fn name(s: &str) -> Name {
        Name::from_ascii(s).unwrap()
    }

    pub(crate) fn a(owner: &str, addr: Ipv4Addr) -> Record {
        Record::from_rdata(name(owner), 3600, RData::A(A(addr)))
    }

    pub(crate) fn soa(zone: &str) -> Record {
        let soa = SOA::new(
            name(&format!("ns1.{zone}")),
            name(&format!("hostmaster.{zone}")),
            1,
            3600,
            600,
            86400,
            300,
        );
        Record::from_rdata(name(zone), 3600, RData::SOA(soa))
    }

    /// Reads one framed query off `server` and answers it with `batches`.
    pub(crate) async fn serve<S: AsyncRead + AsyncWrite + Unpin>(
        mut server: S,
        batches: Vec<Vec<Record>>,
        code: ResponseCode,
    ) -> S {
        let len = server.read_u16().await.unwrap();
        let mut query = vec![0u8; usize::from(len)];
        server.read_exact(&mut query).await.unwrap();
        let query = Message::from_vec(&query).unwrap();
        assert_eq!(query.queries()[0].query_type(), RecordType::AXFR);

        for batch in batches {
            let mut answer = Message::new();
            answer
                .set_id(query.id())
                .set_message_type(MessageType::Response)
                .set_response_code(code);
            for record in batch {
                answer.add_answer(record);
            }
            let bytes = answer.to_vec().unwrap();
            server.write_u16(u16::try_from(bytes.len()).unwrap()).await.unwrap();
            server.write_all(&bytes).await.unwrap();
        }
        server
    }

    #[test]
    fn query_asks_for_axfr() {
        let bytes = axfr_query("example.com", 4711).unwrap();
        let message = Message::from_vec(&bytes).unwrap();

        assert_eq!(message.id(), 4711);
        assert!(!message.recursion_desired());
        assert_eq!(message.queries()[0].name().to_utf8(), "example.com.");
        assert_eq!(message.queries()[0].query_type(), RecordType::AXFR);
    }

    #[tokio::test]
    async fn transfer_ends_at_second_soa() {
        let (client, server) = tokio::io::duplex(4096);
        let batches = vec![
            vec![soa("example.com."), a("host.example.com.", Ipv4Addr::new(10, 0, 0, 5))],
            vec![soa("example.com.")],
        ];
        // The server keeps the connection open, only the SOA can end this.
        let server = tokio::spawn(async move {
            let _open = serve(server, batches, ResponseCode::NoError).await;
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let mut stream = AxfrStream::start(client, "example.com", Duration::from_secs(5))
            .await
            .unwrap();
        let mut total = 0;
        while let Some(records) = stream.next_batch().await.unwrap() {
            total += records.len();
        }
        assert_eq!(total, 3);
        server.abort();
    }

    #[tokio::test]
    async fn transfer_ends_at_eof() {
        let (client, server) = tokio::io::duplex(4096);
        let batches = vec![vec![a("www.example.org.", Ipv4Addr::new(192, 0, 2, 80))]];
        tokio::spawn(async move {
            serve(server, batches, ResponseCode::NoError).await;
        });

        let mut stream = AxfrStream::start(client, "example.org.", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(stream.next_batch().await.unwrap().map(|r| r.len()), Some(1));
        assert!(stream.next_batch().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn refusal_is_an_error() {
        let (client, server) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            serve(server, vec![Vec::new()], ResponseCode::Refused).await;
        });

        let mut stream = AxfrStream::start(client, "example.net", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(matches!(
            stream.next_batch().await,
            Err(XfrError::Refused(ResponseCode::Refused))
        ));
        assert!(stream.next_batch().await.unwrap().is_none());
    }
}

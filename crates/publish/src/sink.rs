//! Transport to the external durable log.
//!
//! Records go over TCP as a 4-byte big-endian length followed by a
//! protobuf [`LogRecord`].

use bytes::{BufMut, BytesMut};
use prost::Message;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tracing::{debug, info};
use wire::proto::LogRecord;

use crate::PublishError;

#[async_trait::async_trait]
pub trait LogSink: Send {
    /// Appends one record. An `Err` means the record was not written and
    /// may be retried.
    async fn append(&mut self, record: &LogRecord) -> Result<(), PublishError>;
}

pub struct TcpLogSink {
    endpoint: String,
    io_timeout: Duration,
    stream: Option<TcpStream>,
    buf: BytesMut,
}

impl TcpLogSink {
    pub fn new(endpoint: impl Into<String>, io_timeout: Duration) -> Self {
        Self { endpoint: endpoint.into(), io_timeout, stream: None, buf: BytesMut::with_capacity(4096) }
    }

    async fn connected(&mut self) -> Result<&mut TcpStream, PublishError> {
        if self.stream.is_none() {
            let stream = timeout(self.io_timeout, TcpStream::connect(&self.endpoint))
                .await
                .map_err(|_| PublishError::Timeout)??;
            stream.set_nodelay(true)?;
            info!(endpoint = %self.endpoint, "connected to durable log");
            self.stream = Some(stream);
        }
        self.stream.as_mut().ok_or(PublishError::Closed)
    }
}

/// Length-prefixes `record` into `buf`.
pub fn frame_record(record: &LogRecord, buf: &mut BytesMut) {
    let len = record.encoded_len();
    buf.clear();
    buf.reserve(4 + len);
    buf.put_u32(len as u32);
    // Cannot fail: capacity was reserved above.
    let _ = record.encode(buf);
}

#[async_trait::async_trait]
impl LogSink for TcpLogSink {
    async fn append(&mut self, record: &LogRecord) -> Result<(), PublishError> {
        let mut buf = std::mem::take(&mut self.buf);
        frame_record(record, &mut buf);
        let io_timeout = self.io_timeout;
        let result = match self.connected().await {
            Ok(stream) => match timeout(io_timeout, stream.write_all(&buf)).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(PublishError::Sink(e)),
                Err(_) => Err(PublishError::Timeout),
            },
            Err(e) => Err(e),
        };
        self.buf = buf;
        if let Err(e) = &result {
            debug!(error = %e, endpoint = %self.endpoint, "durable log write failed, reconnecting on next attempt");
            self.stream = None;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use wire::proto::RecordKind;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn record() -> LogRecord {
        LogRecord { topic: "telemetry-user-local".into(), key: "s".into(), kind: RecordKind::Frame as i32, payload: vec![1, 2, 3] }
    }

    #[test]
    fn frames_with_big_endian_length() -> TestResult {
        let mut buf = BytesMut::new();
        frame_record(&record(), &mut buf);
        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        assert_eq!(len, buf.len() - 4);
        assert_eq!(LogRecord::decode(&buf[4..])?, record());
        Ok(())
    }

    #[tokio::test]
    async fn writes_records_to_tcp_endpoint() -> TestResult {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let mut sink = TcpLogSink::new(listener.local_addr()?.to_string(), Duration::from_secs(2));
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await?;
            let len = sock.read_u32().await? as usize;
            let mut body = vec![0u8; len];
            sock.read_exact(&mut body).await?;
            Ok::<_, std::io::Error>(body)
        });
        sink.append(&record()).await?;
        let body = server.await??;
        assert_eq!(LogRecord::decode(body.as_slice())?, record());
        Ok(())
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_an_error() -> TestResult {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        drop(listener);
        let mut sink = TcpLogSink::new(addr.to_string(), Duration::from_millis(500));
        assert!(sink.append(&record()).await.is_err());
        Ok(())
    }
}

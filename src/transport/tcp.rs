//! Modbus TCP framing: MBAP header + unit id + PDU over a byte stream.

use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

use super::{log_packet, Connector, ModbusTransport, TcpConnector, TransportStats, MAX_TCP_FRAME_SIZE};
use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{MessageRegistry, ModbusMessage, ModbusRequest, ModbusResponse, MAX_MBAP_LENGTH, MBAP_HEADER_SIZE};
use crate::stream::TimedStream;

/// Modbus TCP transport implementation
pub struct TcpTransport<C: Connector = TcpConnector> {
    connector: C,
    stream: Option<TimedStream<C::Link>>,
    read_timeout: Duration,
    registry: MessageRegistry,
    stats: TransportStats,
    /// Enable packet logging for debugging
    packet_logging: bool,
    /// Set while a frame has been started but not fully read
    mid_frame: bool,
}

impl<C> TcpTransport<C>
where
    C: Connector,
    C::Link: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Create a disconnected transport; call [`ModbusTransport::connect`] before use
    pub fn new(connector: C, read_timeout: Duration) -> Self {
        Self {
            connector,
            stream: None,
            read_timeout,
            registry: MessageRegistry::default(),
            stats: TransportStats::default(),
            packet_logging: false,
            mid_frame: false,
        }
    }

    /// Replace the function code table used to decode responses
    pub fn with_registry(mut self, registry: MessageRegistry) -> Self {
        self.registry = registry;
        self
    }

    fn stream_mut(&mut self) -> ModbusResult<&mut TimedStream<C::Link>> {
        self.stream
            .as_mut()
            .ok_or_else(|| ModbusError::connection("TCP transport not connected"))
    }

    async fn send(&mut self, request: &mut ModbusRequest) -> ModbusResult<()> {
        request.set_headless(false);
        let mut frame = BytesMut::with_capacity(MAX_TCP_FRAME_SIZE);
        request.write_to(&mut frame);

        if self.packet_logging {
            log_packet("send", &frame, "TCP", Some(request.slave_id));
        }

        self.stream_mut()?.write_all(&frame).await?;
        self.stats.record_sent(frame.len());
        Ok(())
    }

    async fn receive(&mut self) -> ModbusResult<ModbusResponse> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| ModbusError::connection("TCP transport not connected"))?;

        stream.wait_readable().await?;
        self.mid_frame = true;

        let mut frame = BytesMut::with_capacity(MAX_TCP_FRAME_SIZE);
        stream.read_exact_into(&mut frame, MBAP_HEADER_SIZE).await?;

        let length = u16::from_be_bytes([frame[4], frame[5]]) as usize;
        if !(2..=MAX_MBAP_LENGTH).contains(&length) {
            return Err(ModbusError::frame(format!("Invalid MBAP length: {}", length)));
        }
        stream.read_exact_into(&mut frame, length).await?;
        self.mid_frame = false;

        if self.packet_logging {
            log_packet("recv", &frame, "TCP", Some(frame[MBAP_HEADER_SIZE]));
        }

        let function_code = frame[MBAP_HEADER_SIZE + 1];
        let mut response = self.registry.create_response(function_code)?;
        response.set_headless(false);
        response.read_from(&mut &frame[..])?;

        self.stats.record_received(frame.len());
        Ok(response)
    }
}

#[async_trait]
impl<C> ModbusTransport for TcpTransport<C>
where
    C: Connector,
    C::Link: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn protocol(&self) -> &'static str {
        "TCP"
    }

    async fn connect(&mut self) -> ModbusResult<()> {
        self.stream = None;
        self.mid_frame = false;
        let link = self.connector.connect().await?;
        self.stream = Some(TimedStream::new(link, self.read_timeout));
        info!("Modbus TCP connected to {}", self.connector.endpoint());
        Ok(())
    }

    async fn close(&mut self) -> ModbusResult<()> {
        self.mid_frame = false;
        if let Some(mut stream) = self.stream.take() {
            stream.shutdown().await?;
            info!("Modbus TCP disconnected from {}", self.connector.endpoint());
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn write_request(&mut self, request: &mut ModbusRequest) -> ModbusResult<()> {
        let result = self.send(request).await;
        if let Err(error) = &result {
            self.stats.record_error(error);
            if !error.is_timeout() {
                self.stream = None;
            }
        }
        result
    }

    async fn read_response(&mut self) -> ModbusResult<ModbusResponse> {
        let result = self.receive().await;
        if let Err(error) = &result {
            self.stats.record_error(error);
            if error.is_transport_error() && !error.is_timeout() {
                self.stream = None;
            }
        }
        result
    }

    fn correlates_transactions(&self) -> bool {
        true
    }

    async fn recover(&mut self) -> ModbusResult<()> {
        // The rest of a half-read frame would desynchronise every later read.
        // An idle link is reused; late replies are skipped by transaction id.
        if std::mem::take(&mut self.mid_frame) && self.stream.is_some() {
            debug!("Dropping TCP link to {} after a partial frame", self.connector.endpoint());
            self.stream = None;
        }
        Ok(())
    }

    fn set_packet_logging(&mut self, enabled: bool) {
        self.packet_logging = enabled;
    }

    fn get_stats(&self) -> TransportStats {
        self.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

    struct PipeConnector {
        links: Vec<DuplexStream>,
    }

    #[async_trait]
    impl Connector for PipeConnector {
        type Link = DuplexStream;

        async fn connect(&mut self) -> ModbusResult<DuplexStream> {
            self.links
                .pop()
                .ok_or_else(|| ModbusError::connection("no more pipes"))
        }

        fn endpoint(&self) -> String {
            "pipe".to_string()
        }
    }

    async fn connected_pair() -> (TcpTransport<PipeConnector>, DuplexStream) {
        let (slave, master) = duplex(1024);
        let mut transport = TcpTransport::new(
            PipeConnector { links: vec![master] },
            Duration::from_millis(200),
        );
        transport.connect().await.unwrap();
        (transport, slave)
    }

    #[tokio::test]
    async fn test_write_request_frame() {
        let (mut transport, mut slave) = connected_pair().await;

        let mut request = ModbusRequest::new_read(1, crate::protocol::ModbusFunction::ReadHoldingRegisters, 0, 2);
        request.set_transaction_id(0x0005);
        transport.write_request(&mut request).await.unwrap();

        let mut buf = [0u8; 12];
        slave.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0x00, 0x05, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x02]);
        assert_eq!(transport.get_stats().bytes_sent, 12);
    }

    #[tokio::test]
    async fn test_read_response_and_exception() {
        let (mut transport, mut slave) = connected_pair().await;

        slave
            .write_all(&[0x00, 0x05, 0x00, 0x00, 0x00, 0x07, 0x01, 0x03, 0x04, 0x00, 0x0A, 0x00, 0x0B])
            .await
            .unwrap();
        slave
            .write_all(&[0x00, 0x06, 0x00, 0x00, 0x00, 0x03, 0x01, 0x83, 0x02])
            .await
            .unwrap();

        let response = transport.read_response().await.unwrap();
        assert_eq!(response.transaction_id, 5);
        assert_eq!(response.parse_registers().unwrap(), vec![10, 11]);

        let response = transport.read_response().await.unwrap();
        assert_eq!(response.transaction_id, 6);
        assert_eq!(response.exception_code(), Some(0x02));
        assert_eq!(transport.get_stats().responses_received, 2);
    }

    #[tokio::test]
    async fn test_rejects_oversized_length() {
        let (mut transport, mut slave) = connected_pair().await;

        slave.write_all(&[0x00, 0x01, 0x00, 0x00, 0x01, 0x00]).await.unwrap();
        assert!(matches!(
            transport.read_response().await,
            Err(ModbusError::Frame { .. })
        ));
        assert_eq!(transport.get_stats().errors, 1);
    }

    #[tokio::test]
    async fn test_closed_peer_disconnects() {
        let (mut transport, slave) = connected_pair().await;
        drop(slave);

        assert!(matches!(
            transport.read_response().await,
            Err(ModbusError::Connection { .. })
        ));
        assert!(!transport.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_recover_keeps_idle_link() {
        let (mut transport, mut slave) = connected_pair().await;

        assert!(transport.read_response().await.unwrap_err().is_timeout());
        transport.recover().await.unwrap();
        assert!(transport.is_connected());

        slave
            .write_all(&[0x00, 0x02, 0x00, 0x00, 0x00, 0x05, 0x01, 0x03, 0x02, 0x00, 0x07])
            .await
            .unwrap();
        let response = transport.read_response().await.unwrap();
        assert_eq!(response.transaction_id, 2);
        assert_eq!(response.parse_registers().unwrap(), vec![7]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recover_drops_link_after_partial_frame() {
        let (mut transport, mut slave) = connected_pair().await;

        slave.write_all(&[0x00, 0x01, 0x00]).await.unwrap();
        assert!(transport.read_response().await.unwrap_err().is_timeout());
        assert!(transport.is_connected());

        transport.recover().await.unwrap();
        assert!(!transport.is_connected());
        assert!(transport.connect().await.is_err());
    }

    #[tokio::test]
    async fn test_recover_drops_link_after_bad_header() {
        let (mut transport, mut slave) = connected_pair().await;

        slave.write_all(&[0x00, 0x01, 0x00, 0x00, 0x01, 0x00, 0xAA]).await.unwrap();
        assert!(transport.read_response().await.is_err());
        transport.recover().await.unwrap();
        assert!(!transport.is_connected());
    }
}

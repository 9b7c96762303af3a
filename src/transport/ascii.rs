//! Modbus ASCII framing: `:` + hex(unit, function, body, LRC) + `CR LF`.
//!
//! Frames that fail the LRC check, contain a non-hex character or belong to
//! another unit are dropped and the reader scans for the next `:`. Only the
//! per-character timeout (or the caller's deadline) ends the scan.

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use super::{check_serial_unit, log_packet, Connector, ModbusTransport, SerialConnector, TransportStats, MAX_ASCII_PAYLOAD_SIZE};
use crate::checksum::lrc8;
use crate::config::SerialConfig;
use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{MessageRegistry, ModbusMessage, ModbusRequest, ModbusResponse};
use crate::stream::{AsciiStream, AsciiToken};

/// Modbus ASCII transport implementation
pub struct AsciiTransport<C: Connector = SerialConnector> {
    connector: C,
    stream: Option<AsciiStream<C::Link>>,
    config: SerialConfig,
    registry: MessageRegistry,
    stats: TransportStats,
    packet_logging: bool,
    expected_unit: Option<u8>,
}

/// Outcome of scanning for one delimited frame
enum Scan {
    Payload(BytesMut),
    Garbage,
}

impl<C> AsciiTransport<C>
where
    C: Connector,
    C::Link: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(connector: C, config: SerialConfig) -> Self {
        Self {
            connector,
            stream: None,
            config,
            registry: MessageRegistry::default(),
            stats: TransportStats::default(),
            packet_logging: false,
            expected_unit: None,
        }
    }

    pub fn with_registry(mut self, registry: MessageRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn config(&self) -> &SerialConfig {
        &self.config
    }

    fn stream_mut(&mut self) -> ModbusResult<&mut AsciiStream<C::Link>> {
        self.stream
            .as_mut()
            .ok_or_else(|| ModbusError::connection("ASCII transport not connected"))
    }

    async fn send(&mut self, request: &mut ModbusRequest) -> ModbusResult<()> {
        request.set_headless(true);
        let mut payload = BytesMut::with_capacity(MAX_ASCII_PAYLOAD_SIZE);
        request.write_to(&mut payload);
        let lrc = lrc8(&payload);
        payload.extend_from_slice(&[lrc]);

        let flush_max = self.config.flush_max_bytes;
        let flush_window = self.config.flush_window();
        let echo = self.config.echo;
        let echo_timeout = self.config.echo_timeout();
        let packet_logging = self.packet_logging;

        let stream = self.stream_mut()?;
        let stale = stream.raw().clear_input(flush_max, flush_window).await?;
        if stale > 0 {
            debug!("Discarded {} stale characters before ASCII request", stale);
        }

        if packet_logging {
            log_packet("send", &payload, "ASCII", Some(request.slave_id));
        }
        let written = stream.write_frame(&payload).await?;

        if echo {
            let echoed = stream.raw().clear_input(written, echo_timeout).await?;
            if echoed < written {
                warn!(
                    "Incomplete ASCII echo: expected {} characters, got {}",
                    written, echoed
                );
            }
        }

        self.stats.record_sent(written);
        self.expected_unit = Some(request.slave_id);
        Ok(())
    }

    /// Scan to the next `:` and collect bytes up to `CR LF`
    async fn scan_frame(stream: &mut AsciiStream<C::Link>) -> ModbusResult<Scan> {
        // Skip anything before a frame start
        loop {
            match stream.read_token().await {
                Ok(AsciiToken::FrameStart) => break,
                Ok(_) => {}
                Err(ModbusError::Frame { .. }) => {}
                Err(error) => return Err(error),
            }
        }

        let mut payload = BytesMut::with_capacity(MAX_ASCII_PAYLOAD_SIZE);
        loop {
            match stream.read_token().await {
                Ok(AsciiToken::Byte(byte)) => {
                    if payload.len() >= MAX_ASCII_PAYLOAD_SIZE {
                        debug!("ASCII frame exceeds {} bytes", MAX_ASCII_PAYLOAD_SIZE);
                        return Ok(Scan::Garbage);
                    }
                    payload.extend_from_slice(&[byte]);
                }
                Ok(AsciiToken::FrameEnd) => return Ok(Scan::Payload(payload)),
                Ok(AsciiToken::FrameStart) => {
                    debug!("ASCII frame restarted after {} bytes", payload.len());
                    payload.clear();
                }
                Err(ModbusError::Frame { message }) => {
                    debug!("Malformed ASCII frame: {}", message);
                    return Ok(Scan::Garbage);
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn receive(&mut self) -> ModbusResult<ModbusResponse> {
        loop {
            let stream = self
                .stream
                .as_mut()
                .ok_or_else(|| ModbusError::connection("ASCII transport not connected"))?;

            let mut payload = match Self::scan_frame(stream).await? {
                Scan::Payload(payload) => payload,
                Scan::Garbage => {
                    self.stats.discarded_frames += 1;
                    continue;
                }
            };

            if payload.len() < 3 {
                debug!("ASCII frame too short: {} bytes", payload.len());
                self.stats.discarded_frames += 1;
                continue;
            }

            let received_lrc = payload[payload.len() - 1];
            payload.truncate(payload.len() - 1);
            let calculated_lrc = lrc8(&payload);
            if received_lrc != calculated_lrc {
                debug!(
                    "ASCII LRC mismatch: calculated 0x{:02X}, received 0x{:02X}",
                    calculated_lrc, received_lrc
                );
                self.stats.discarded_frames += 1;
                continue;
            }

            if self.packet_logging {
                log_packet("recv", &payload, "ASCII", Some(payload[0]));
            }

            let unit_id = payload[0];
            if let Some(expected) = self.expected_unit {
                if unit_id != expected {
                    debug!(
                        "Dropping ASCII frame from unit {} while waiting for unit {}",
                        unit_id, expected
                    );
                    self.stats.discarded_frames += 1;
                    continue;
                }
            }

            let mut response = self.registry.create_response(payload[1])?;
            response.set_headless(true);
            response.read_from(&mut &payload[..])?;

            // 2 hex chars per byte plus ':' and CR LF
            self.stats.record_received((payload.len() + 1) * 2 + 3);
            return Ok(response);
        }
    }
}

#[async_trait]
impl<C> ModbusTransport for AsciiTransport<C>
where
    C: Connector,
    C::Link: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn protocol(&self) -> &'static str {
        "ASCII"
    }

    async fn connect(&mut self) -> ModbusResult<()> {
        self.stream = None;
        let link = self.connector.connect().await?;
        self.stream = Some(AsciiStream::new(link, self.config.read_timeout()));
        info!("Modbus ASCII opened {}", self.connector.endpoint());
        Ok(())
    }

    async fn close(&mut self) -> ModbusResult<()> {
        if self.stream.take().is_some() {
            info!("Modbus ASCII closed {}", self.connector.endpoint());
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
        }
        result
    }

    async fn read_response(&mut self) -> ModbusResult<ModbusResponse> {
        let result = self.receive().await;
        if let Err(error) = &result {
            self.stats.record_error(error);
        }
        result
    }

    fn check_unit_id(&self, unit_id: u8) -> ModbusResult<()> {
        check_serial_unit(unit_id)
    }

    fn set_echo(&mut self, echo: bool) {
        self.config.echo = echo;
    }

    fn is_echo(&self) -> bool {
        self.config.echo
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
    use crate::protocol::ModbusFunction;
    use crate::stream::encode_frame;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

    struct PipeConnector {
        link: Option<DuplexStream>,
    }

    #[async_trait]
    impl Connector for PipeConnector {
        type Link = DuplexStream;

        async fn connect(&mut self) -> ModbusResult<DuplexStream> {
            self.link
                .take()
                .ok_or_else(|| ModbusError::connection("pipe already used"))
        }

        fn endpoint(&self) -> String {
            "pipe".to_string()
        }
    }

    fn ascii_frame(payload: &[u8]) -> Vec<u8> {
        let mut with_lrc = payload.to_vec();
        with_lrc.push(lrc8(payload));
        let mut out = BytesMut::new();
        encode_frame(&with_lrc, &mut out);
        out.to_vec()
    }

    async fn connected(config: SerialConfig) -> (AsciiTransport<PipeConnector>, DuplexStream) {
        let (slave, master) = duplex(1024);
        let mut transport = AsciiTransport::new(PipeConnector { link: Some(master) }, config);
        transport.connect().await.unwrap();
        (transport, slave)
    }

    fn test_config() -> SerialConfig {
        SerialConfig {
            read_timeout_ms: 100,
            ..SerialConfig::new("pipe")
        }
    }

    #[test]
    fn test_serial_unit_range() {
        let transport = AsciiTransport::new(PipeConnector { link: None }, test_config());
        assert!(transport.check_unit_id(0).is_err());
        assert!(transport.check_unit_id(1).is_ok());
        assert!(transport.check_unit_id(247).is_ok());
        assert!(transport.check_unit_id(248).is_err());
    }

    #[tokio::test]
    async fn test_write_request_frame() {
        let (mut transport, mut slave) = connected(test_config()).await;

        let mut request = ModbusRequest::new_read(1, ModbusFunction::ReadHoldingRegisters, 0, 2);
        transport.write_request(&mut request).await.unwrap();

        let mut buf = [0u8; 17];
        slave.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b":010300000002FA\r\n");
        assert_eq!(transport.get_stats().bytes_sent, 17);
    }

    #[tokio::test]
    async fn test_request_round_trip() {
        let (mut transport, mut slave) = connected(test_config()).await;

        let mut request = ModbusRequest::write_multiple_registers(0x11, 0x0001, &[0x000A, 0x0102]);
        transport.write_request(&mut request).await.unwrap();

        let mut wire = vec![0u8; 1 + 2 * (2 + 9 + 1) + 2];
        slave.read_exact(&mut wire).await.unwrap();

        // Decode the characters back through the adapter and the registry
        let (mut feed, sink) = duplex(256);
        feed.write_all(&wire).await.unwrap();
        let mut reader = AsciiStream::new(sink, Duration::from_millis(100));
        assert_eq!(reader.read_token().await.unwrap(), AsciiToken::FrameStart);
        let mut payload = Vec::new();
        while let AsciiToken::Byte(byte) = reader.read_token().await.unwrap() {
            payload.push(byte);
        }
        let lrc = payload.pop().unwrap();
        assert_eq!(lrc, lrc8(&payload));

        let mut decoded = MessageRegistry::default().create_request(payload[1]).unwrap();
        decoded.set_headless(true);
        decoded.read_from(&mut &payload[..]).unwrap();
        assert_eq!(decoded.slave_id, request.slave_id);
        assert_eq!(decoded.function_code, request.function_code);
        assert_eq!(decoded.data, request.data);
    }

    #[tokio::test]
    async fn test_corrupted_lrc_then_valid_frame() {
        let (mut transport, mut slave) = connected(test_config()).await;

        let mut corrupted = ascii_frame(&[0x01, 0x03, 0x02, 0x00, 0x07]);
        let lrc_pos = corrupted.len() - 3;
        corrupted[lrc_pos] = if corrupted[lrc_pos] == b'0' { b'1' } else { b'0' };
        slave.write_all(&corrupted).await.unwrap();
        slave
            .write_all(&ascii_frame(&[0x01, 0x03, 0x02, 0x00, 0x2A]))
            .await
            .unwrap();

        let response = transport.read_response().await.unwrap();
        assert_eq!(response.parse_registers().unwrap(), vec![0x2A]);
        assert_eq!(transport.get_stats().discarded_frames, 1);
    }

    #[tokio::test]
    async fn test_resync_after_noise_and_foreign_unit() {
        let (mut transport, mut slave) = connected(test_config()).await;

        let mut request = ModbusRequest::write_single_register(0x11, 0x0001, 0x0003);
        transport.write_request(&mut request).await.unwrap();
        let mut sent = vec![0u8; 1 + 2 * 7 + 2];
        slave.read_exact(&mut sent).await.unwrap();

        slave.write_all(b"xx:01Q3\r\n").await.unwrap();
        slave
            .write_all(&ascii_frame(&[0x12, 0x06, 0x00, 0x01, 0x00, 0x03]))
            .await
            .unwrap();
        slave
            .write_all(&ascii_frame(&[0x11, 0x06, 0x00, 0x01, 0x00, 0x03]))
            .await
            .unwrap();

        let response = transport.read_response().await.unwrap();
        assert_eq!(response.slave_id, 0x11);
        assert_eq!(response.data, vec![0x00, 0x01, 0x00, 0x03]);
        assert_eq!(transport.get_stats().discarded_frames, 2);
    }

    #[tokio::test]
    async fn test_exception_frame() {
        let (mut transport, mut slave) = connected(test_config()).await;
        slave.write_all(&ascii_frame(&[0x01, 0x81, 0x01])).await.unwrap();

        let response = transport.read_response().await.unwrap();
        assert_eq!(response.exception_code(), Some(0x01));
        assert_eq!(response.function_code, 0x01);
    }

    #[tokio::test]
    async fn test_echo_is_removed() {
        let config = SerialConfig {
            echo: true,
            ..test_config()
        };
        let (mut transport, mut slave) = connected(config).await;

        let slave_task = tokio::spawn(async move {
            let mut request = [0u8; 17];
            slave.read_exact(&mut request).await.unwrap();
            slave.write_all(&request).await.unwrap();
            slave
                .write_all(&ascii_frame(&[0x01, 0x03, 0x04, 0x00, 0x01, 0x00, 0x02]))
                .await
                .unwrap();
            slave
        });

        let mut request = ModbusRequest::new_read(1, ModbusFunction::ReadHoldingRegisters, 0, 2);
        transport.write_request(&mut request).await.unwrap();
        let response = transport.read_response().await.unwrap();
        assert_eq!(response.parse_registers().unwrap(), vec![1, 2]);
        assert_eq!(transport.get_stats().discarded_frames, 0);

        let _slave = slave_task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_times_out() {
        let (mut transport, _slave) = connected(test_config()).await;
        assert!(matches!(
            transport.read_response().await,
            Err(ModbusError::Timeout { .. })
        ));
    }
}

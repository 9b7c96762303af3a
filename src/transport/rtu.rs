//! Modbus RTU framing: `unit | function | body | CRC lo | CRC hi`.
//!
//! RTU has no delimiters. The reader takes the unit id and function code,
//! asks the message registry what shape the body has, and reads exactly that
//! many bytes plus the CRC. A CRC mismatch cannot be resynchronised and is
//! returned as an error.

use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use super::{check_serial_unit, log_packet, Connector, ModbusTransport, SerialConnector, TransportStats, MAX_RTU_FRAME_SIZE};
use crate::checksum::{crc16, crc16_value};
use crate::config::SerialConfig;
use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{MessageRegistry, ModbusMessage, ModbusRequest, ModbusResponse};
use crate::stream::TimedStream;

const CRC_SIZE: usize = 2;

/// Modbus RTU transport implementation
pub struct RtuTransport<C: Connector = SerialConnector> {
    connector: C,
    stream: Option<TimedStream<C::Link>>,
    config: SerialConfig,
    /// Minimum silent interval before a frame (3.5 character times)
    frame_gap: Duration,
    registry: MessageRegistry,
    stats: TransportStats,
    packet_logging: bool,
    /// Unit addressed by the last request; replies from others are dropped
    expected_unit: Option<u8>,
}

impl<C> RtuTransport<C>
where
    C: Connector,
    C::Link: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(connector: C, config: SerialConfig) -> Self {
        let frame_gap = frame_gap_for(config.baud_rate);
        Self {
            connector,
            stream: None,
            config,
            frame_gap,
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

    async fn send(&mut self, request: &mut ModbusRequest) -> ModbusResult<()> {
        request.set_headless(true);
        let mut frame = BytesMut::with_capacity(MAX_RTU_FRAME_SIZE);
        request.write_to(&mut frame);
        let (lo, hi) = crc16(&frame);
        frame.extend_from_slice(&[lo, hi]);

        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| ModbusError::connection("RTU transport not connected"))?;

        let stale = stream
            .clear_input(self.config.flush_max_bytes, self.config.flush_window())
            .await?;
        if stale > 0 {
            debug!("Discarded {} stale bytes before RTU request", stale);
        }

        tokio::time::sleep(self.frame_gap).await;

        if self.packet_logging {
            log_packet("send", &frame, "RTU", Some(request.slave_id));
        }
        stream.write_all(&frame).await?;
        self.stats.record_sent(frame.len());
        self.expected_unit = Some(request.slave_id);

        if self.config.echo {
            let echoed = stream
                .clear_input(frame.len(), self.config.echo_timeout())
                .await?;
            if echoed < frame.len() {
                warn!(
                    "Incomplete RTU echo: expected {} bytes, got {}",
                    frame.len(),
                    echoed
                );
            }
        }
        Ok(())
    }

    /// Read one CRC-checked frame, whichever unit it is addressed to
    async fn read_frame(&mut self) -> ModbusResult<ModbusResponse> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| ModbusError::connection("RTU transport not connected"))?;

        let mut frame = BytesMut::with_capacity(MAX_RTU_FRAME_SIZE);
        stream.read_exact_into(&mut frame, 2).await?;

        let function_code = frame[1];
        let mut response = self.registry.create_response(function_code)?;
        let shape = response.body_shape();

        stream.read_exact_into(&mut frame, shape.prefix_len()).await?;
        let body_len = shape.body_len(&frame[2..])?;
        let frame_len = 2 + body_len + CRC_SIZE;
        if frame_len > MAX_RTU_FRAME_SIZE {
            return Err(ModbusError::frame(format!(
                "RTU frame of {} bytes exceeds maximum {}",
                frame_len, MAX_RTU_FRAME_SIZE
            )));
        }
        let remaining = frame_len - frame.len();
        stream.read_exact_into(&mut frame, remaining).await?;

        if self.packet_logging {
            log_packet("recv", &frame, "RTU", Some(frame[0]));
        }

        let payload_len = frame_len - CRC_SIZE;
        let expected = crc16_value(&frame[..payload_len]);
        let actual = u16::from_le_bytes([frame[payload_len], frame[payload_len + 1]]);
        if expected != actual {
            return Err(ModbusError::crc_mismatch(expected, actual));
        }

        response.set_headless(true);
        response.read_from(&mut &frame[..payload_len])?;
        self.stats.bytes_received += frame_len as u64;
        Ok(response)
    }

    async fn receive(&mut self) -> ModbusResult<ModbusResponse> {
        loop {
            let response = self.read_frame().await?;
            match self.expected_unit {
                Some(unit) if unit != response.slave_id => {
                    debug!(
                        "Dropping RTU frame from unit {} while waiting for unit {}",
                        response.slave_id, unit
                    );
                    self.stats.discarded_frames += 1;
                }
                _ => {
                    self.stats.responses_received += 1;
                    return Ok(response);
                }
            }
        }
    }
}

/// 3.5 character times at `baud_rate`, 11 bits per character
fn frame_gap_for(baud_rate: u32) -> Duration {
    if baud_rate == 0 {
        return Duration::ZERO;
    }
    // Fixed 1.75 ms above 19200 baud
    if baud_rate > 19_200 {
        return Duration::from_micros(1750);
    }
    let char_time_us = 11_000_000 / baud_rate as u64;
    Duration::from_micros(char_time_us * 35 / 10)
}

#[async_trait]
impl<C> ModbusTransport for RtuTransport<C>
where
    C: Connector,
    C::Link: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn protocol(&self) -> &'static str {
        "RTU"
    }

    async fn connect(&mut self) -> ModbusResult<()> {
        self.stream = None;
        let link = self.connector.connect().await?;
        self.stream = Some(TimedStream::new(link, self.config.read_timeout()));
        info!("Modbus RTU opened {}", self.connector.endpoint());
        Ok(())
    }

    async fn close(&mut self) -> ModbusResult<()> {
        if self.stream.take().is_some() {
            info!("Modbus RTU closed {}", self.connector.endpoint());
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

    fn with_crc(payload: &[u8]) -> Vec<u8> {
        let (lo, hi) = crc16(payload);
        let mut frame = payload.to_vec();
        frame.extend_from_slice(&[lo, hi]);
        frame
    }

    async fn connected(config: SerialConfig) -> (RtuTransport<PipeConnector>, DuplexStream) {
        let (slave, master) = duplex(1024);
        let mut transport = RtuTransport::new(PipeConnector { link: Some(master) }, config);
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
    fn test_frame_gap() {
        assert_eq!(frame_gap_for(9600), Duration::from_micros(1145 * 35 / 10));
        assert_eq!(frame_gap_for(115_200), Duration::from_micros(1750));
    }

    #[tokio::test]
    async fn test_write_appends_crc() {
        let (mut transport, mut slave) = connected(test_config()).await;

        let mut request = ModbusRequest::new_read(1, ModbusFunction::ReadHoldingRegisters, 0, 10);
        transport.write_request(&mut request).await.unwrap();
        assert!(request.headless);

        let mut buf = [0u8; 8];
        slave.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0x01, 0x03, 0x00, 0x00, 0x00, 0x0A, 0xC5, 0xCD]);
    }

    #[tokio::test]
    async fn test_infers_length_for_every_known_function() {
        let frames: Vec<Vec<u8>> = vec![
            vec![0x01, 0x01, 0x01, 0x05],
            vec![0x01, 0x02, 0x02, 0xAC, 0xDB],
            vec![0x01, 0x03, 0x04, 0x00, 0x0A, 0x00, 0x0B],
            vec![0x01, 0x04, 0x02, 0x00, 0x0A],
            vec![0x01, 0x05, 0x00, 0xAC, 0xFF, 0x00],
            vec![0x01, 0x06, 0x00, 0x01, 0x00, 0x03],
            vec![0x01, 0x07, 0x6D],
            vec![0x01, 0x08, 0x00, 0x00, 0xA5, 0x37],
            vec![0x01, 0x0B, 0x00, 0x00, 0x01, 0x08],
            vec![0x01, 0x0C, 0x08, 0x00, 0x00, 0x01, 0x08, 0x01, 0x21, 0x20, 0x00],
            vec![0x01, 0x0F, 0x00, 0x13, 0x00, 0x0A],
            vec![0x01, 0x10, 0x00, 0x01, 0x00, 0x02],
            vec![0x01, 0x11, 0x03, 0x42, 0xFF, 0x00],
            vec![0x01, 0x14, 0x04, 0x03, 0x06, 0x0D, 0xFE],
            vec![0x01, 0x15, 0x02, 0x00, 0x00],
            vec![0x01, 0x16, 0x00, 0x04, 0x00, 0xF2, 0x00, 0x25],
            vec![0x01, 0x17, 0x02, 0x00, 0xFE],
            vec![0x01, 0x18, 0x00, 0x06, 0x00, 0x02, 0x01, 0xB8, 0x12, 0x84],
            vec![0x01, 0x83, 0x02],
        ];

        let (mut transport, mut slave) = connected(test_config()).await;
        for payload in &frames {
            slave.write_all(&with_crc(payload)).await.unwrap();
        }

        for payload in &frames {
            let response = transport.read_response().await.unwrap();
            assert_eq!(ModbusMessage::function_code(&response), payload[1]);
            if response.is_exception() {
                assert_eq!(response.exception_code(), Some(payload[2]));
            } else {
                assert_eq!(response.data, payload[2..].to_vec());
            }
        }
        assert_eq!(transport.get_stats().responses_received, frames.len() as u64);
    }

    #[tokio::test]
    async fn test_unknown_function_is_rejected() {
        let (mut transport, mut slave) = connected(test_config()).await;
        slave.write_all(&with_crc(&[0x01, 0x42, 0x00])).await.unwrap();

        assert!(matches!(
            transport.read_response().await,
            Err(ModbusError::InvalidFunction { code: 0x42 })
        ));
    }

    #[tokio::test]
    async fn test_crc_mismatch_on_either_byte() {
        for corrupt_index in [5usize, 6] {
            let (mut transport, mut slave) = connected(test_config()).await;
            let mut frame = with_crc(&[0x01, 0x03, 0x02, 0x00, 0x2A]);
            frame[corrupt_index] ^= 0xFF;
            slave.write_all(&frame).await.unwrap();

            assert!(matches!(
                transport.read_response().await,
                Err(ModbusError::CrcMismatch { .. })
            ));
        }
    }

    #[tokio::test]
    async fn test_frames_from_other_units_are_dropped() {
        let (mut transport, mut slave) = connected(test_config()).await;

        let mut request = ModbusRequest::new_read(2, ModbusFunction::ReadHoldingRegisters, 0, 1);
        transport.write_request(&mut request).await.unwrap();
        let mut sent = [0u8; 8];
        slave.read_exact(&mut sent).await.unwrap();

        slave.write_all(&with_crc(&[0x05, 0x03, 0x02, 0x00, 0x01])).await.unwrap();
        slave.write_all(&with_crc(&[0x02, 0x03, 0x02, 0x00, 0x02])).await.unwrap();

        let response = transport.read_response().await.unwrap();
        assert_eq!(response.slave_id, 2);
        assert_eq!(response.parse_registers().unwrap(), vec![2]);
        assert_eq!(transport.get_stats().discarded_frames, 1);
    }

    #[tokio::test]
    async fn test_stale_input_is_flushed_before_write() {
        let (mut transport, mut slave) = connected(test_config()).await;

        slave.write_all(&[0xDE, 0xAD, 0xBE, 0xEF]).await.unwrap();
        tokio::task::yield_now().await;

        let mut request = ModbusRequest::new_read(1, ModbusFunction::ReadInputRegisters, 0, 1);
        transport.write_request(&mut request).await.unwrap();
        let mut sent = [0u8; 8];
        slave.read_exact(&mut sent).await.unwrap();

        slave.write_all(&with_crc(&[0x01, 0x04, 0x02, 0x00, 0x0A])).await.unwrap();
        let response = transport.read_response().await.unwrap();
        assert_eq!(response.parse_registers().unwrap(), vec![10]);
    }

    #[tokio::test]
    async fn test_echo_is_removed() {
        let config = SerialConfig {
            echo: true,
            ..test_config()
        };
        let (mut transport, mut slave) = connected(config).await;
        assert!(transport.is_echo());

        let slave_task = tokio::spawn(async move {
            let mut request = [0u8; 8];
            slave.read_exact(&mut request).await.unwrap();
            // Half-duplex line: the master hears its own frame first
            slave.write_all(&request).await.unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
            slave.write_all(&with_crc(&[0x01, 0x03, 0x02, 0x12, 0x34])).await.unwrap();
            slave
        });

        let mut request = ModbusRequest::new_read(1, ModbusFunction::ReadHoldingRegisters, 0, 1);
        transport.write_request(&mut request).await.unwrap();
        let response = transport.read_response().await.unwrap();
        assert_eq!(response.parse_registers().unwrap(), vec![0x1234]);

        let _slave = slave_task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_times_out() {
        let (mut transport, _slave) = connected(test_config()).await;

        let started = tokio::time::Instant::now();
        let result = transport.read_response().await;
        assert!(matches!(result, Err(ModbusError::Timeout { .. })));
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert!(started.elapsed() < Duration::from_millis(150));
        assert_eq!(transport.get_stats().timeouts, 1);
    }
}

//! Modbus UDP framing: the TCP frame layout, one frame per datagram.

use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::time::timeout;
use tracing::info;

use super::{log_packet, Connector, DatagramLink, ModbusTransport, TransportStats, UdpConnector, MAX_TCP_FRAME_SIZE};
use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{MessageRegistry, ModbusMessage, ModbusRequest, ModbusResponse, MBAP_HEADER_SIZE};

/// Modbus UDP transport implementation
pub struct UdpTransport<C: Connector = UdpConnector> {
    connector: C,
    link: Option<C::Link>,
    read_timeout: Duration,
    registry: MessageRegistry,
    stats: TransportStats,
    packet_logging: bool,
}

impl<C> UdpTransport<C>
where
    C: Connector,
    C::Link: DatagramLink,
{
    pub fn new(connector: C, read_timeout: Duration) -> Self {
        Self {
            connector,
            link: None,
            read_timeout,
            registry: MessageRegistry::default(),
            stats: TransportStats::default(),
            packet_logging: false,
        }
    }

    pub fn with_registry(mut self, registry: MessageRegistry) -> Self {
        self.registry = registry;
        self
    }

    async fn send(&mut self, request: &mut ModbusRequest) -> ModbusResult<()> {
        request.set_headless(false);
        let mut frame = BytesMut::with_capacity(MAX_TCP_FRAME_SIZE);
        request.write_to(&mut frame);

        if self.packet_logging {
            log_packet("send", &frame, "UDP", Some(request.slave_id));
        }

        let link = self
            .link
            .as_mut()
            .ok_or_else(|| ModbusError::connection("UDP transport not connected"))?;
        link.send_frame(&frame).await?;
        self.stats.record_sent(frame.len());
        Ok(())
    }

    async fn receive(&mut self) -> ModbusResult<ModbusResponse> {
        let link = self
            .link
            .as_mut()
            .ok_or_else(|| ModbusError::connection("UDP transport not connected"))?;

        let datagram = timeout(self.read_timeout, link.recv_frame())
            .await
            .map_err(|_| {
                ModbusError::timeout("Receive datagram", self.read_timeout.as_millis() as u64)
            })??;

        if datagram.len() < MBAP_HEADER_SIZE + 2 {
            return Err(ModbusError::frame(format!(
                "Datagram too short: {} bytes",
                datagram.len()
            )));
        }

        if self.packet_logging {
            log_packet("recv", &datagram, "UDP", Some(datagram[MBAP_HEADER_SIZE]));
        }

        let mut response = self.registry.create_response(datagram[MBAP_HEADER_SIZE + 1])?;
        response.set_headless(false);
        response.read_from(&mut &datagram[..])?;

        self.stats.record_received(datagram.len());
        Ok(response)
    }
}

#[async_trait]
impl<C> ModbusTransport for UdpTransport<C>
where
    C: Connector,
    C::Link: DatagramLink,
{
    fn protocol(&self) -> &'static str {
        "UDP"
    }

    async fn connect(&mut self) -> ModbusResult<()> {
        self.link = Some(self.connector.connect().await?);
        info!("Modbus UDP bound for {}", self.connector.endpoint());
        Ok(())
    }

    async fn close(&mut self) -> ModbusResult<()> {
        self.link = None;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.link.is_some()
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

    fn correlates_transactions(&self) -> bool {
        true
    }

    fn set_packet_logging(&mut self, enabled: bool) {
        self.packet_logging = enabled;
    }

    fn get_stats(&self) -> TransportStats {
        self.stats.clone()
    }
}

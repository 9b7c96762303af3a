//! # Transaction Executor
//!
//! Runs one logical request/response exchange on top of a
//! [`ModbusTransport`]:
//!
//! ```text
//! IDLE -> SENDING -> AWAITING_RESPONSE -> VALIDATING -> DONE
//!                          |
//!                          +-> RETRY -> SENDING      (transient error, attempts left)
//!                          +-> FAILED                (terminal error)
//! ```
//!
//! - Transient errors (see [`ModbusError::is_transient`]) are retried until
//!   the configured number of attempts is used up, then reported as
//!   [`ModbusError::RetriesExhausted`].
//! - With `reconnecting` enabled the link is closed and reopened before every
//!   retry.
//! - On TCP and UDP a fresh transaction id is assigned to every attempt and
//!   responses carrying another id are dropped as stale.
//! - A slave exception is a successful exchange: the response is returned
//!   with its exception code set.
//!
//! The executor takes `&mut self` for the whole exchange, so a connection
//! never has more than one transaction in flight. Share one between tasks by
//! wrapping it in a `tokio::sync::Mutex`.

use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::TransactionConfig;
use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{ModbusMessage, ModbusRequest, ModbusResponse};
use crate::transport::ModbusTransport;
use crate::utils::{OperationTimer, PerformanceMetrics};

/// Retrying request/response executor owning one transport
pub struct ModbusTransaction<T: ModbusTransport> {
    transport: T,
    config: TransactionConfig,
    transaction_id: u16,
    metrics: PerformanceMetrics,
}

impl<T: ModbusTransport> ModbusTransaction<T> {
    /// Executor with the default policy (3 attempts, no reconnect)
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            config: TransactionConfig::default(),
            transaction_id: 0,
            metrics: PerformanceMetrics::new(),
        }
    }

    /// Executor with a custom policy
    pub fn with_config(transport: T, config: TransactionConfig) -> ModbusResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            ..Self::new(transport)
        })
    }

    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    /// Set the total number of attempts per transaction
    pub fn set_retries(&mut self, retries: u32) -> ModbusResult<()> {
        if retries == 0 {
            return Err(ModbusError::configuration("retries must be at least 1"));
        }
        self.config.retries = retries;
        Ok(())
    }

    pub fn set_reconnecting(&mut self, reconnecting: bool) {
        self.config.reconnecting = reconnecting;
    }

    pub fn is_reconnecting(&self) -> bool {
        self.config.reconnecting
    }

    pub fn set_response_timeout(&mut self, response_timeout: Duration) {
        self.config.response_timeout_ms = response_timeout.as_millis().max(1) as u64;
    }

    /// Enable local echo removal on transports that support it
    pub fn set_echo(&mut self, echo: bool) {
        self.transport.set_echo(echo);
    }

    pub fn is_echo(&self) -> bool {
        self.transport.is_echo()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    pub fn metrics(&self) -> &PerformanceMetrics {
        &self.metrics
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub async fn connect(&mut self) -> ModbusResult<()> {
        self.transport.connect().await
    }

    pub async fn disconnect(&mut self) -> ModbusResult<()> {
        self.transport.close().await
    }

    /// Get next transaction ID
    fn next_transaction_id(&mut self) -> u16 {
        self.transaction_id = self.transaction_id.wrapping_add(1);
        if self.transaction_id == 0 {
            self.transaction_id = 1;
        }
        self.transaction_id
    }

    /// Execute one request and return its response
    ///
    /// # Returns
    ///
    /// * `Ok(response)` - A decoded response; check
    ///   [`ModbusResponse::exception_code`] for a slave rejection
    /// * `Err(RetriesExhausted)` - Every attempt failed with a transient error
    /// * `Err(other)` - A non-transient error, returned without retrying
    pub async fn execute(&mut self, request: ModbusRequest) -> ModbusResult<ModbusResponse> {
        let timer = OperationTimer::start(format!(
            "{} unit {} function 0x{:02X}",
            self.transport.protocol(),
            request.slave_id,
            request.function_code
        ));

        let result = self.run(request).await;
        let duration = timer.stop_and_log(result.is_ok());

        match &result {
            Ok(response) => {
                self.metrics.record_success(duration);
                if response.is_exception() {
                    self.metrics.exception_responses += 1;
                }
            }
            Err(_) => self.metrics.record_failure(duration),
        }
        result
    }

    async fn run(&mut self, mut request: ModbusRequest) -> ModbusResult<ModbusResponse> {
        let attempts = self.config.retries.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let error = match self.attempt(&mut request).await {
                Ok(response) => return Ok(response),
                Err(error) => error,
            };

            if !error.is_transient() {
                return Err(error);
            }
            if attempt >= attempts {
                warn!(
                    "{} transaction to unit {} failed after {} attempts: {}",
                    self.transport.protocol(),
                    request.slave_id,
                    attempt,
                    error
                );
                return Err(ModbusError::retries_exhausted(attempt, &error));
            }

            warn!(
                "{} attempt {}/{} to unit {} failed: {}",
                self.transport.protocol(),
                attempt,
                attempts,
                request.slave_id,
                error
            );
            self.metrics.retries += 1;
            self.prepare_retry().await;

            let delay = self.config.retry_delay();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }

    async fn prepare_retry(&mut self) {
        if self.config.reconnecting {
            info!("Reconnecting {} transport before retry", self.transport.protocol());
            if let Err(error) = self.transport.close().await {
                debug!("Error while closing transport: {}", error);
            }
            self.metrics.reconnects += 1;
            // The next attempt reopens the link
        } else if let Err(error) = self.transport.recover().await {
            debug!("Error while recovering transport: {}", error);
        }
    }

    async fn attempt(&mut self, request: &mut ModbusRequest) -> ModbusResult<ModbusResponse> {
        if !self.transport.is_connected() {
            self.transport.connect().await?;
        }

        let correlate = self.transport.correlates_transactions();
        if correlate {
            let transaction_id = self.next_transaction_id();
            request.set_transaction_id(transaction_id);
        }

        self.transport.write_request(request).await?;

        let expected_id = correlate.then_some(request.transaction_id);
        let response_timeout = self.config.response_timeout();
        let response = timeout(
            response_timeout,
            Self::await_response(&mut self.transport, expected_id),
        )
        .await
        .map_err(|_| {
            ModbusError::timeout(
                format!("Awaiting response from unit {}", request.slave_id),
                response_timeout.as_millis() as u64,
            )
        })??;

        if response.function_code != request.function_code {
            return Err(ModbusError::frame(format!(
                "Response function 0x{:02X} does not match request 0x{:02X}",
                response.function_code, request.function_code
            )));
        }
        Ok(response)
    }

    /// Read frames until one carries `expected_id` (or any frame without correlation)
    async fn await_response(transport: &mut T, expected_id: Option<u16>) -> ModbusResult<ModbusResponse> {
        loop {
            let response = transport.read_response().await?;
            match expected_id {
                Some(id) if response.transaction_id() != id => {
                    debug!(
                        "Discarding stale response with transaction id {} (expected {})",
                        response.transaction_id(),
                        id
                    );
                }
                _ => return Ok(response),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ModbusFunction;
    use crate::transport::TransportStats;
    use async_trait::async_trait;
    use std::collections::VecDeque;

    enum Reply {
        Ok(ModbusResponse),
        Stale(ModbusResponse),
        Fail(ModbusError),
    }

    #[derive(Default)]
    struct ScriptedTransport {
        replies: VecDeque<Reply>,
        correlate: bool,
        connected: bool,
        connects: usize,
        closes: usize,
        writes: usize,
        last_transaction_id: u16,
        echo: bool,
    }

    impl ScriptedTransport {
        fn new(replies: Vec<Reply>) -> Self {
            Self {
                replies: replies.into(),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl ModbusTransport for ScriptedTransport {
        fn protocol(&self) -> &'static str {
            "MOCK"
        }

        async fn connect(&mut self) -> ModbusResult<()> {
            self.connects += 1;
            self.connected = true;
            Ok(())
        }

        async fn close(&mut self) -> ModbusResult<()> {
            self.closes += 1;
            self.connected = false;
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected
        }

        async fn write_request(&mut self, request: &mut ModbusRequest) -> ModbusResult<()> {
            self.writes += 1;
            self.last_transaction_id = request.transaction_id;
            Ok(())
        }

        async fn read_response(&mut self) -> ModbusResult<ModbusResponse> {
            match self.replies.pop_front() {
                Some(Reply::Ok(mut response)) => {
                    response.transaction_id = self.last_transaction_id;
                    Ok(response)
                }
                Some(Reply::Stale(mut response)) => {
                    response.transaction_id = self.last_transaction_id.wrapping_sub(1);
                    Ok(response)
                }
                Some(Reply::Fail(error)) => Err(error),
                None => std::future::pending().await,
            }
        }

        fn correlates_transactions(&self) -> bool {
            self.correlate
        }

        fn set_echo(&mut self, echo: bool) {
            self.echo = echo;
        }

        fn is_echo(&self) -> bool {
            self.echo
        }

        fn set_packet_logging(&mut self, _enabled: bool) {}

        fn get_stats(&self) -> TransportStats {
            TransportStats::default()
        }
    }

    fn registers_reply(values: &[u8]) -> ModbusResponse {
        let mut data = vec![values.len() as u8];
        data.extend_from_slice(values);
        ModbusResponse::new_success(1, ModbusFunction::ReadHoldingRegisters, data)
    }

    fn read_request() -> ModbusRequest {
        ModbusRequest::new_read(1, ModbusFunction::ReadHoldingRegisters, 0, 1)
    }

    fn config(retries: u32) -> TransactionConfig {
        TransactionConfig {
            retries,
            response_timeout_ms: 100,
            ..TransactionConfig::default()
        }
    }

    #[tokio::test]
    async fn test_succeeds_on_last_allowed_attempt() {
        let transport = ScriptedTransport::new(vec![
            Reply::Fail(ModbusError::timeout("read byte", 100)),
            Reply::Fail(ModbusError::crc_mismatch(0x1234, 0x4321)),
            Reply::Ok(registers_reply(&[0x00, 0x2A])),
        ]);
        let mut transaction = ModbusTransaction::with_config(transport, config(3)).unwrap();

        let response = transaction.execute(read_request()).await.unwrap();
        assert_eq!(response.parse_registers().unwrap(), vec![42]);
        assert_eq!(transaction.transport().writes, 3);
        assert_eq!(transaction.metrics().retries, 2);
        assert_eq!(transaction.metrics().successful_requests, 1);
    }

    #[tokio::test]
    async fn test_exhausts_after_exact_attempts() {
        let replies = (0..10)
            .map(|_| Reply::Fail(ModbusError::connection("reset by peer")))
            .collect();
        let mut transaction =
            ModbusTransaction::with_config(ScriptedTransport::new(replies), config(4)).unwrap();

        let error = transaction.execute(read_request()).await.unwrap_err();
        assert!(matches!(error, ModbusError::RetriesExhausted { attempts: 4, .. }));
        assert_eq!(transaction.transport().writes, 4);
        assert_eq!(transaction.metrics().failed_requests, 1);
    }

    #[tokio::test]
    async fn test_non_transient_error_is_not_retried() {
        let transport = ScriptedTransport::new(vec![
            Reply::Fail(ModbusError::invalid_data("bad body")),
            Reply::Ok(registers_reply(&[0x00, 0x01])),
        ]);
        let mut transaction = ModbusTransaction::with_config(transport, config(3)).unwrap();

        let error = transaction.execute(read_request()).await.unwrap_err();
        assert!(matches!(error, ModbusError::InvalidData { .. }));
        assert_eq!(transaction.transport().writes, 1);
    }

    #[tokio::test]
    async fn test_exception_is_a_successful_exchange() {
        let transport = ScriptedTransport::new(vec![Reply::Ok(ModbusResponse::new_exception(
            1, 0x03, 0x02,
        ))]);
        let mut transaction = ModbusTransaction::new(transport);

        let response = transaction.execute(read_request()).await.unwrap();
        assert_eq!(response.exception_code(), Some(0x02));
        assert_eq!(transaction.transport().writes, 1);
        assert_eq!(transaction.metrics().exception_responses, 1);
    }

    #[tokio::test]
    async fn test_reconnects_before_each_retry() {
        let transport = ScriptedTransport::new(vec![
            Reply::Fail(ModbusError::io("broken pipe")),
            Reply::Fail(ModbusError::io("broken pipe")),
            Reply::Ok(registers_reply(&[0x00, 0x07])),
        ]);
        let mut transaction = ModbusTransaction::with_config(transport, config(3)).unwrap();
        transaction.set_reconnecting(true);
        assert!(transaction.is_reconnecting());

        transaction.execute(read_request()).await.unwrap();
        assert_eq!(transaction.transport().connects, 3);
        assert_eq!(transaction.transport().closes, 2);
        assert_eq!(transaction.metrics().reconnects, 2);
    }

    #[tokio::test]
    async fn test_stale_transaction_ids_are_skipped() {
        let mut transport = ScriptedTransport::new(vec![
            Reply::Stale(registers_reply(&[0x00, 0x01])),
            Reply::Ok(registers_reply(&[0x00, 0x02])),
        ]);
        transport.correlate = true;
        let mut transaction = ModbusTransaction::new(transport);

        let response = transaction.execute(read_request()).await.unwrap();
        assert_eq!(response.parse_registers().unwrap(), vec![2]);
        assert_eq!(response.transaction_id, 1);
        assert_eq!(transaction.transport().writes, 1);
    }

    #[tokio::test]
    async fn test_mismatched_function_is_retried() {
        let transport = ScriptedTransport::new(vec![
            Reply::Ok(ModbusResponse::new_success(1, ModbusFunction::ReadInputRegisters, vec![2, 0, 1])),
            Reply::Ok(registers_reply(&[0x00, 0x03])),
        ]);
        let mut transaction = ModbusTransaction::new(transport);

        let response = transaction.execute(read_request()).await.unwrap();
        assert_eq!(response.parse_registers().unwrap(), vec![3]);
        assert_eq!(transaction.transport().writes, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_slave_times_out() {
        let mut transaction =
            ModbusTransaction::with_config(ScriptedTransport::new(Vec::new()), config(2)).unwrap();

        let started = tokio::time::Instant::now();
        let error = transaction.execute(read_request()).await.unwrap_err();
        assert!(matches!(error, ModbusError::RetriesExhausted { attempts: 2, .. }));
        assert!(error.to_string().contains("Awaiting response"));
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert!(started.elapsed() < Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_transaction_ids_skip_zero() {
        let mut transaction = ModbusTransaction::new(ScriptedTransport::default());
        transaction.transaction_id = u16::MAX - 1;
        assert_eq!(transaction.next_transaction_id(), u16::MAX);
        assert_eq!(transaction.next_transaction_id(), 1);
        assert_eq!(transaction.next_transaction_id(), 2);
    }

    #[test]
    fn test_policy_setters() {
        let mut transaction = ModbusTransaction::new(ScriptedTransport::default());
        assert!(transaction.set_retries(0).is_err());
        transaction.set_retries(5).unwrap();
        assert_eq!(transaction.config().retries, 5);

        transaction.set_echo(true);
        assert!(transaction.is_echo());

        assert!(ModbusTransaction::with_config(ScriptedTransport::default(), config(0)).is_err());
    }
}

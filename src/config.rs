use std::net::SocketAddr;
use std::time::Duration;

use anyhow::bail;

use crate::endpoint::TransportVariant;
use crate::report::header::WireVariant;

#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Ingestion endpoints that are always known, seeded before anything else and re-seeded
    ///  after every network change
    pub hardcoded_endpoints: Vec<SocketAddr>,
    pub dns_hostnames: Vec<String>,
    /// port for addresses resolved via DNS - DNS yields IP addresses only
    pub dns_port: u16,

    pub transport_variant: TransportVariant,
    pub wire_variant: WireVariant,
    pub vendor_id: u32,

    /// hard cap for the number of reports awaiting acknowledgment. Reports in excess of this are
    ///  sent once without retry
    pub max_in_flight: usize,
    pub retry_tick_interval: Duration,
    /// minimum spacing between two send attempts of the same in-flight report
    pub retry_resend_interval: Duration,
    pub max_in_flight_age: Duration,

    pub cache_capacity: usize,
    pub cache_expiry: Duration,
    pub cache_drain_interval: Duration,
    pub cache_drain_batch: usize,
    /// cache resends whose sequence number falls further behind the sequence counter than this
    ///  are not expected to be acknowledged any more
    pub cache_sent_window: u32,

    pub flush_min_interval: Duration,
    pub flush_first_threshold: u64,
    pub flush_every: u64,

    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    /// an endpoint that was handed out for this long without an acknowledgment is recycled
    pub endpoint_response_timeout: Duration,

    pub dns_max_retries: u32,
    pub dns_retry_interval: Duration,

    pub command_channel_size: usize,
}

impl DeliveryConfig {
    pub fn new(hardcoded_endpoints: Vec<SocketAddr>) -> DeliveryConfig {
        DeliveryConfig {
            hardcoded_endpoints,
            dns_hostnames: Vec::new(),
            dns_port: 9700,
            transport_variant: TransportVariant::Plain,
            wire_variant: WireVariant::Plain,
            vendor_id: 0,
            max_in_flight: 400,
            retry_tick_interval: Duration::from_secs(5),
            retry_resend_interval: Duration::from_secs(4),
            max_in_flight_age: Duration::from_secs(3600),
            cache_capacity: 10_000,
            cache_expiry: Duration::from_secs(7 * 24 * 3600),
            cache_drain_interval: Duration::from_secs(10),
            cache_drain_batch: 10,
            cache_sent_window: 110,
            flush_min_interval: Duration::from_secs(10),
            flush_first_threshold: 20,
            flush_every: 300,
            backoff_initial: Duration::from_millis(4000),
            backoff_max: Duration::from_millis(30_000),
            endpoint_response_timeout: Duration::from_secs(10),
            dns_max_retries: 3,
            dns_retry_interval: Duration::from_secs(15),
            command_channel_size: 256,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.retry_tick_interval.is_zero() || self.cache_drain_interval.is_zero() {
            bail!("timer intervals must be non-zero");
        }
        if self.backoff_initial > self.backoff_max {
            bail!("initial backoff {:?} exceeds maximum backoff {:?}", self.backoff_initial, self.backoff_max);
        }
        if self.cache_drain_batch == 0 {
            bail!("cache drain batch size must be positive");
        }
        if self.flush_every == 0 {
            bail!("flush_every must be positive");
        }
        if self.command_channel_size == 0 {
            bail!("command channel size must be positive");
        }
        if self.hardcoded_endpoints.is_empty() && self.dns_hostnames.is_empty() {
            bail!("neither hardcoded endpoints nor DNS host names are configured");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn valid() -> DeliveryConfig {
        DeliveryConfig::new(vec![SocketAddr::from(([1, 2, 3, 4], 9700))])
    }

    #[test]
    fn test_defaults_are_valid() {
        assert!(valid().validate().is_ok());
    }

    #[rstest]
    #[case::zero_retry_tick(|c: &mut DeliveryConfig| c.retry_tick_interval = Duration::ZERO)]
    #[case::zero_drain_tick(|c: &mut DeliveryConfig| c.cache_drain_interval = Duration::ZERO)]
    #[case::inverted_backoff(|c: &mut DeliveryConfig| c.backoff_initial = Duration::from_secs(60))]
    #[case::zero_batch(|c: &mut DeliveryConfig| c.cache_drain_batch = 0)]
    #[case::zero_flush_every(|c: &mut DeliveryConfig| c.flush_every = 0)]
    #[case::no_endpoints(|c: &mut DeliveryConfig| c.hardcoded_endpoints.clear())]
    fn test_invalid(#[case] modify: fn(&mut DeliveryConfig)) {
        let mut config = valid();
        modify(&mut config);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_dns_only_is_valid() {
        let mut config = DeliveryConfig::new(vec![]);
        config.dns_hostnames.push("report.example.com".to_string());
        assert!(config.validate().is_ok());
    }
}

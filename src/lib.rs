//! Reliable delivery of telemetry reports (quality samples, events, counters) over UDP to a
//!  population of geographically distributed ingestion endpoints.
//!
//! The crate has two tightly coupled parts:
//! * the [endpoint::selector::EndpointSelector] keeps track of known ingestion endpoints and their
//!   health, handing out an eligible endpoint per send and backing off endpoints after failures
//! * the [delivery::engine::DeliveryEngine] assigns sequence numbers, keeps unacknowledged reports
//!   for bounded retry, spills reports that exhausted their retries into a disk backed overflow
//!   cache, and refreshes the endpoint population from hardcoded defaults, DNS and discovery
//!
//! Everything runs on a single worker task (see [delivery::driver::run_delivery]); application code
//!  talks to it through a cloneable [delivery::driver::DeliveryHandle].
//!
//! Delivery is best effort: reports may be dropped when the cache is full or entries expire, and
//!  there is no ordering guarantee.

pub mod collab;
pub mod config;
pub mod delivery;
pub mod endpoint;
pub mod report;
pub mod test_util;

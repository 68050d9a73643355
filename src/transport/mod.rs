//! MQTT transport state machine: an explicit state-machine object wrapped
//! around a `rumqttc` `AsyncClient`/`EventLoop` pair, with a
//! `tick`-free design — state transitions come from the eventloop's own
//! events. Publisher and Subscriber talk to it over `tokio::sync::mpsc`
//! channels rather than sharing the client directly, so neither holds a
//! reference back into the transport.

mod mqtt;

pub use mqtt::{PublishRequest, Transport, TransportEvent, TransportHandle};

use std::time::Duration;

/// Full-jitter exponential backoff (base 1s, cap 60s).
pub fn backoff_duration(attempt: u32, rng: &mut impl rand::Rng) -> Duration {
    let base_ms = 1_000u64;
    let cap_ms = 60_000u64;
    let exp_ms = base_ms.saturating_mul(1u64 << attempt.min(20)).min(cap_ms);
    let jittered = rng.gen_range(0..=exp_ms.max(1));
    Duration::from_millis(jittered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn backoff_grows_but_stays_capped() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        for attempt in 0..10 {
            let d = backoff_duration(attempt, &mut rng);
            assert!(d.as_millis() <= 60_000);
        }
    }

    #[test]
    fn backoff_zero_attempt_is_bounded_by_base() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let d = backoff_duration(0, &mut rng);
        assert!(d.as_millis() <= 1_000);
    }
}

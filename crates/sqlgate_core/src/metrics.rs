use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use log::warn;

/// Metrics tuning knobs.
#[derive(Debug, Clone)]
pub struct MetricsOptions {
    /// Leases held longer than this are logged as suspicious.
    pub long_connection_threshold: Duration,
    /// Size of the lease-duration sample window. Must be a power of two so
    /// the ring index reduces to a mask.
    pub percentile_window: usize,
}

impl Default for MetricsOptions {
    fn default() -> Self {
        Self {
            long_connection_threshold: Duration::from_secs(30),
            percentile_window: 128,
        }
    }
}

impl MetricsOptions {
    pub fn validate(&self) -> Result<(), String> {
        if !self.percentile_window.is_power_of_two() {
            return Err(format!(
                "percentile_window must be a power of two, got {}",
                self.percentile_window
            ));
        }
        Ok(())
    }
}

/// Connection lifecycle counters for one context.
///
/// Always counts opens/closes (the strategies and tests rely on them);
/// duration sampling only runs when metrics are enabled.
pub struct ConnectionMetrics {
    enabled: bool,
    options: MetricsOptions,
    opens: AtomicU64,
    closes: AtomicU64,
    current_open: AtomicUsize,
    high_water: AtomicUsize,
    samples: Mutex<DurationRing>,
}

impl ConnectionMetrics {
    pub fn new(enabled: bool, options: MetricsOptions) -> Self {
        let window = options.percentile_window;
        Self {
            enabled,
            options,
            opens: AtomicU64::new(0),
            closes: AtomicU64::new(0),
            current_open: AtomicUsize::new(0),
            high_water: AtomicUsize::new(0),
            samples: Mutex::new(DurationRing::new(window)),
        }
    }

    pub fn disabled() -> Self {
        Self::new(false, MetricsOptions::default())
    }

    /// Record a physical open, updating the high-water mark via CAS.
    pub fn record_open(&self) {
        self.opens.fetch_add(1, Ordering::Relaxed);
        let now_open = self.current_open.fetch_add(1, Ordering::SeqCst) + 1;

        let mut seen = self.high_water.load(Ordering::SeqCst);
        while now_open > seen {
            match self.high_water.compare_exchange(
                seen,
                now_open,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => seen = actual,
            }
        }
    }

    pub fn record_close(&self) {
        self.closes.fetch_add(1, Ordering::Relaxed);
        self.current_open.fetch_sub(1, Ordering::SeqCst);
    }

    /// Record how long a lease was held.
    pub fn record_lease(&self, held_for: Duration) {
        if !self.enabled {
            return;
        }
        if held_for > self.options.long_connection_threshold {
            warn!(
                "connection lease held for {:?} (threshold {:?})",
                held_for, self.options.long_connection_threshold
            );
        }
        self.samples
            .lock()
            .expect("metrics ring poisoned")
            .push(held_for);
    }

    pub fn total_opens(&self) -> u64 {
        self.opens.load(Ordering::Relaxed)
    }

    pub fn total_closes(&self) -> u64 {
        self.closes.load(Ordering::Relaxed)
    }

    pub fn currently_open(&self) -> usize {
        self.current_open.load(Ordering::SeqCst)
    }

    pub fn high_water_mark(&self) -> usize {
        self.high_water.load(Ordering::SeqCst)
    }

    /// Lease-duration percentile over the sample window, `None` until a
    /// sample exists or when metrics are disabled.
    pub fn lease_percentile(&self, percentile: f64) -> Option<Duration> {
        if !self.enabled {
            return None;
        }
        self.samples
            .lock()
            .expect("metrics ring poisoned")
            .percentile(percentile)
    }
}

/// Fixed-size power-of-two ring of duration samples.
struct DurationRing {
    samples: Vec<Duration>,
    mask: usize,
    next: usize,
    filled: usize,
}

impl DurationRing {
    fn new(window: usize) -> Self {
        let window = window.max(1).next_power_of_two();
        Self {
            samples: vec![Duration::ZERO; window],
            mask: window - 1,
            next: 0,
            filled: 0,
        }
    }

    fn push(&mut self, sample: Duration) {
        self.samples[self.next & self.mask] = sample;
        self.next = self.next.wrapping_add(1);
        self.filled = (self.filled + 1).min(self.samples.len());
    }

    fn percentile(&self, percentile: f64) -> Option<Duration> {
        if self.filled == 0 {
            return None;
        }
        let mut live: Vec<Duration> = self.samples[..self.filled].to_vec();
        live.sort_unstable();
        let rank = ((percentile / 100.0) * (live.len() - 1) as f64).round() as usize;
        live.get(rank.min(live.len() - 1)).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn high_water_tracks_peak() {
        let m = ConnectionMetrics::disabled();
        m.record_open();
        m.record_open();
        m.record_open();
        m.record_close();
        m.record_close();
        assert_eq!(m.currently_open(), 1);
        assert_eq!(m.high_water_mark(), 3);
        assert_eq!(m.total_opens(), 3);
        assert_eq!(m.total_closes(), 2);
    }

    #[test]
    fn percentiles_over_window() {
        let m = ConnectionMetrics::new(true, MetricsOptions::default());
        for ms in 1..=100u64 {
            m.record_lease(Duration::from_millis(ms));
        }
        let p50 = m.lease_percentile(50.0).unwrap();
        assert!(p50 >= Duration::from_millis(40) && p50 <= Duration::from_millis(60));
        let p100 = m.lease_percentile(100.0).unwrap();
        assert_eq!(p100, Duration::from_millis(100));
    }

    #[test]
    fn window_must_be_power_of_two() {
        let options = MetricsOptions {
            percentile_window: 100,
            ..MetricsOptions::default()
        };
        assert!(options.validate().is_err());
        assert!(MetricsOptions::default().validate().is_ok());
    }

    #[test]
    fn disabled_metrics_skip_sampling() {
        let m = ConnectionMetrics::disabled();
        m.record_lease(Duration::from_secs(5));
        assert!(m.lease_percentile(50.0).is_none());
    }
}

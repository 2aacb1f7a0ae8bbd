//! Prometheus metric definitions.
//!
//! Push-based: there is no HTTP listener. The heartbeat task samples the
//! registry and ships the values to the control plane as `recentMetrics`.

use prometheus::core::{AtomicF64, GenericGauge};
use prometheus::{Counter, CounterVec, Gauge, Opts, Registry};
use std::collections::HashMap;
use std::sync::Arc;

/// All executor metrics, registered on one private registry.
#[derive(Clone)]
pub struct ExecutorMetrics {
    registry: Arc<Registry>,
    /// Commands by kind and terminal state
    pub commands_total: CounterVec,
    /// Pre-trade validator rejections by rule
    pub safety_rejections_total: CounterVec,
    /// Link reconnect attempts by link
    pub reconnects_total: CounterVec,
    /// RPC failures on the bridge socket
    pub rpc_failures_total: Counter,
    /// Heartbeats dropped from the outbound queue
    pub reports_dropped_total: Counter,
    /// Currently open positions
    pub open_positions: GenericGauge<AtomicF64>,
    /// Latest account equity
    pub account_equity: GenericGauge<AtomicF64>,
    /// Kill switch state (0 = inactive, 1 = active)
    pub kill_switch_active: GenericGauge<AtomicF64>,
}

impl ExecutorMetrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let commands_total = CounterVec::new(
            Opts::new("fxexec_commands_total", "Commands by kind and terminal state"),
            &["kind", "state"],
        )?;
        registry.register(Box::new(commands_total.clone()))?;

        let safety_rejections_total = CounterVec::new(
            Opts::new(
                "fxexec_safety_rejections_total",
                "Pre-trade validator rejections by rule",
            ),
            &["rule"],
        )?;
        registry.register(Box::new(safety_rejections_total.clone()))?;

        let reconnects_total = CounterVec::new(
            Opts::new("fxexec_reconnects_total", "Link reconnect attempts"),
            &["link"],
        )?;
        registry.register(Box::new(reconnects_total.clone()))?;

        let rpc_failures_total = Counter::with_opts(Opts::new(
            "fxexec_rpc_failures_total",
            "Failed bridge RPC requests",
        ))?;
        registry.register(Box::new(rpc_failures_total.clone()))?;

        let reports_dropped_total = Counter::with_opts(Opts::new(
            "fxexec_reports_dropped_total",
            "Outbound reports dropped on queue overflow",
        ))?;
        registry.register(Box::new(reports_dropped_total.clone()))?;

        let open_positions = Gauge::with_opts(Opts::new(
            "fxexec_open_positions",
            "Currently open positions",
        ))?;
        registry.register(Box::new(open_positions.clone()))?;

        let account_equity =
            Gauge::with_opts(Opts::new("fxexec_account_equity", "Latest account equity"))?;
        registry.register(Box::new(account_equity.clone()))?;

        let kill_switch_active = Gauge::with_opts(Opts::new(
            "fxexec_kill_switch_active",
            "Kill switch state (0/1)",
        ))?;
        registry.register(Box::new(kill_switch_active.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            commands_total,
            safety_rejections_total,
            reconnects_total,
            rpc_failures_total,
            reports_dropped_total,
            open_positions,
            account_equity,
            kill_switch_active,
        })
    }

    /// Flatten the registry into `name → summed value` for the heartbeat.
    pub fn sample(&self) -> HashMap<String, f64> {
        let mut out = HashMap::new();
        for family in self.registry.gather() {
            let total: f64 = family
                .get_metric()
                .iter()
                .map(|m| {
                    if m.counter.is_some() {
                        m.counter.value()
                    } else if m.gauge.is_some() {
                        m.gauge.value()
                    } else {
                        0.0
                    }
                })
                .sum();
            out.insert(family.get_name().to_string(), total);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_contains_registered_metrics() {
        let metrics = ExecutorMetrics::new().unwrap();
        metrics
            .commands_total
            .with_label_values(&["OpenPosition", "completed"])
            .inc();
        metrics.open_positions.set(3.0);

        let sample = metrics.sample();
        assert_eq!(sample.get("fxexec_commands_total"), Some(&1.0));
        assert_eq!(sample.get("fxexec_open_positions"), Some(&3.0));
    }

    #[test]
    fn test_counter_vec_sums_across_labels() {
        let metrics = ExecutorMetrics::new().unwrap();
        metrics
            .commands_total
            .with_label_values(&["OpenPosition", "completed"])
            .inc();
        metrics
            .commands_total
            .with_label_values(&["ClosePosition", "failed"])
            .inc();
        assert_eq!(metrics.sample().get("fxexec_commands_total"), Some(&2.0));
    }
}

mod metrics;

pub use metrics::ExecutorMetrics;

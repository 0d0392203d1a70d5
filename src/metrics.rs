use anyhow::Result;
use prometheus::{IntCounter, IntGauge, IntGaugeVec, Opts, Registry};

/// Prometheus metrics for ingestion, aggregation and generation.
pub struct MetricsCollector {
    registry: Registry,

    // 上报指标
    pub reports_total: IntCounter,
    pub rejected_reports_total: IntCounter,
    pub stale_reports_total: IntCounter,

    // 生成指标
    pub regenerations_total: IntCounter,
    pub degraded_pools: IntGauge,

    // 区块高度
    pub group_height: IntGaugeVec,
    pub provider_height: IntGaugeVec,
}

impl MetricsCollector {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let reports_total = IntCounter::new(
            "head_router_reports_total",
            "Total provider height observations accepted",
        )?;
        registry.register(Box::new(reports_total.clone()))?;

        let rejected_reports_total = IntCounter::new(
            "head_router_rejected_reports_total",
            "Total height report bodies rejected as malformed",
        )?;
        registry.register(Box::new(rejected_reports_total.clone()))?;

        let stale_reports_total = IntCounter::new(
            "head_router_stale_reports_total",
            "Total group height reports discarded as stale",
        )?;
        registry.register(Box::new(stale_reports_total.clone()))?;

        let regenerations_total = IntCounter::new(
            "head_router_regenerations_total",
            "Total routing configuration regenerations",
        )?;
        registry.register(Box::new(regenerations_total.clone()))?;

        let degraded_pools = IntGauge::new(
            "head_router_degraded_pools",
            "Backend pools served by the fallback list in the last generation",
        )?;
        registry.register(Box::new(degraded_pools.clone()))?;

        let group_height = IntGaugeVec::new(
            Opts::new("head_router_group_height", "Highest block seen per service"),
            &["group"],
        )?;
        registry.register(Box::new(group_height.clone()))?;

        let provider_height = IntGaugeVec::new(
            Opts::new(
                "head_router_provider_height",
                "Latest block recorded per provider index",
            ),
            &["provider"],
        )?;
        registry.register(Box::new(provider_height.clone()))?;

        Ok(Self {
            registry,
            reports_total,
            rejected_reports_total,
            stale_reports_total,
            regenerations_total,
            degraded_pools,
            group_height,
            provider_height,
        })
    }

    /// 获取Prometheus注册表
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// `provider` is the registry index used as the report key.
    pub fn record_report(&self, provider: usize, height: u64) {
        self.reports_total.inc();
        self.provider_height
            .with_label_values(&[provider.to_string().as_str()])
            .set(clamp(height));
    }

    pub fn record_rejected_report(&self) {
        self.rejected_reports_total.inc();
    }

    pub fn record_stale_report(&self) {
        self.stale_reports_total.inc();
    }

    pub fn update_group_height(&self, group: &str, height: u64) {
        self.group_height
            .with_label_values(&[group])
            .set(clamp(height));
    }

    pub fn record_regeneration(&self, degraded: usize) {
        self.regenerations_total.inc();
        self.degraded_pools.set(degraded as i64);
    }

    /// 导出指标为Prometheus格式
    pub fn export_metrics(&self) -> Result<String> {
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder
            .encode_to_string(&metric_families)
            .map_err(|e| anyhow::anyhow!("Failed to encode metrics: {}", e))
    }
}

fn clamp(height: u64) -> i64 {
    i64::try_from(height).unwrap_or(i64::MAX)
}

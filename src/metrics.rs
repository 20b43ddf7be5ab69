use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Outcome {
    Admitted,
    Denied,
    Invalid,
    Error,
}

#[derive(Debug, Clone, Hash, PartialEq, Eq, EncodeLabelSet)]
struct OutcomeLabels {
    outcome: Outcome,
}

#[derive(Debug, Clone, Hash, PartialEq, Eq, EncodeLabelSet)]
struct OperationLabels {
    operation: String,
}

#[derive(Debug)]
pub struct Metrics {
    registry: Registry,
    purchases: Family<OutcomeLabels, Counter>,
    history_queries: Counter,
    storage_failures: Family<OperationLabels, Counter>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let purchases = Family::<OutcomeLabels, Counter>::default();
        let history_queries = Counter::default();
        let storage_failures = Family::<OperationLabels, Counter>::default();

        let mut registry = Registry::default();
        registry.register(
            // prometheus-client appends "_total" to Counter names, so avoid duplicating it here.
            "corn_purchase_requests",
            "Purchase requests by admission outcome",
            purchases.clone(),
        );
        registry.register(
            "corn_history_queries",
            "Purchase history lookups served",
            history_queries.clone(),
        );
        registry.register(
            "corn_storage_failures",
            "Ledger operations that failed",
            storage_failures.clone(),
        );

        Self {
            registry,
            purchases,
            history_queries,
            storage_failures,
        }
    }

    pub fn purchase(&self, outcome: Outcome) {
        self.purchases.get_or_create(&OutcomeLabels { outcome }).inc();
    }

    pub fn history_query(&self) {
        self.history_queries.inc();
    }

    pub fn storage_failure(&self, operation: &str) {
        self.storage_failures
            .get_or_create(&OperationLabels {
                operation: operation.to_string(),
            })
            .inc();
    }

    pub fn purchase_count(&self, outcome: Outcome) -> u64 {
        self.purchases.get_or_create(&OutcomeLabels { outcome }).get()
    }

    pub fn render(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_track_outcomes() {
        let metrics = Metrics::new();
        metrics.purchase(Outcome::Admitted);
        metrics.purchase(Outcome::Denied);
        metrics.purchase(Outcome::Denied);

        assert_eq!(metrics.purchase_count(Outcome::Admitted), 1);
        assert_eq!(metrics.purchase_count(Outcome::Denied), 2);
        assert_eq!(metrics.purchase_count(Outcome::Error), 0);
    }

    #[test]
    fn render_exposes_registered_families() {
        let metrics = Metrics::new();
        metrics.purchase(Outcome::Admitted);
        metrics.history_query();
        metrics.storage_failure("buy_corn");

        let text = metrics.render().unwrap();
        assert!(text.contains("corn_purchase_requests_total{outcome=\"Admitted\"} 1"));
        assert!(text.contains("corn_history_queries_total 1"));
        assert!(text.contains("corn_storage_failures_total{operation=\"buy_corn\"} 1"));
    }
}

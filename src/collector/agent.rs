//! Agent self-monitoring collector.
//!
//! Reports the delivery queue's depth, capacity and drop count so a
//! saturated queue is visible on the receiving side.

use crate::collector::{Collector, CollectorContext, CollectorError};
use crate::metric::MetricLine;
use crate::queue::MetricSink;

/// Emits `ferry.queue.*` gauges each pass.
#[derive(Debug)]
pub struct AgentCollector {
    name: String,
    sink: MetricSink,
}

impl AgentCollector {
    pub fn new(name: impl Into<String>, sink: MetricSink) -> Self {
        Self {
            name: name.into(),
            sink,
        }
    }

    /// Registry constructor.
    pub fn from_context(ctx: CollectorContext) -> Result<Box<dyn Collector>, CollectorError> {
        let name = ctx.name().to_string();
        Ok(Box::new(Self::new(name, ctx.sink)))
    }
}

#[async_trait::async_trait]
impl Collector for AgentCollector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn collect(&mut self) -> Result<(), CollectorError> {
        let timestamp = chrono::Utc::now().timestamp();
        // Sample before emitting so the size excludes this pass's own lines.
        let size = self.sink.len() as f64;
        let capacity = self.sink.capacity() as f64;
        let dropped = self.sink.dropped() as f64;

        self.sink
            .emit(&MetricLine::new("ferry.queue.size", timestamp, size));
        self.sink
            .emit(&MetricLine::new("ferry.queue.capacity", timestamp, capacity));
        self.sink
            .emit(&MetricLine::new("ferry.queue.dropped", timestamp, dropped));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::DeliveryQueue;

    #[tokio::test]
    async fn test_reports_queue_stats() {
        let (sink, mut rx) = DeliveryQueue::bounded(5);
        sink.put("pending 1 1");
        sink.put("pending 1 2");

        let mut collector = AgentCollector::new("agent", sink);
        collector.collect().await.unwrap();

        let lines: Vec<String> = std::iter::from_fn(|| rx.try_get()).collect();
        let value = |metric: &str| {
            lines
                .iter()
                .find(|l| l.starts_with(metric))
                .and_then(|l| l.split_whitespace().nth(2))
                .map(str::to_string)
        };
        assert_eq!(value("ferry.queue.size").as_deref(), Some("2"));
        assert_eq!(value("ferry.queue.capacity").as_deref(), Some("5"));
        assert_eq!(value("ferry.queue.dropped").as_deref(), Some("0"));
    }

    #[test]
    fn test_from_context_keeps_definition_name() {
        let (sink, _rx) = DeliveryQueue::bounded(5);
        let def = crate::config::CollectorDefinition::new("self").with_class("agent");
        let collector = AgentCollector::from_context(CollectorContext::new(def, sink)).unwrap();
        assert_eq!(collector.name(), "self");
    }

    #[tokio::test]
    async fn test_reports_drops() {
        let (sink, mut rx) = DeliveryQueue::bounded(3);
        for i in 0..4 {
            sink.put(format!("fill 1 {i}"));
        }
        let mut collector = AgentCollector::new("agent", sink);
        collector.collect().await.unwrap();

        // Queue is full, so every stats line is dropped too.
        assert_eq!(rx.len(), 3);
        assert_eq!(rx.dropped(), 4);
    }
}

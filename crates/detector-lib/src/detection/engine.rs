//! Detection engine: evaluate a sample, then advance its counter

use tracing::warn;

use super::{AbuseEvaluation, ThresholdEvaluator};
use crate::error::DetectionError;
use crate::models::MetricSample;
use crate::observability::DetectorMetrics;
use crate::store::{CounterKey, CounterStore};

#[derive(Clone)]
pub struct AbuseDetector {
    evaluator: ThresholdEvaluator,
    counters: CounterStore,
    metrics: DetectorMetrics,
}

impl AbuseDetector {
    pub fn new(evaluator: ThresholdEvaluator, counters: CounterStore) -> Self {
        Self {
            evaluator,
            counters,
            metrics: DetectorMetrics::new(),
        }
    }

    pub fn evaluator(&self) -> &ThresholdEvaluator {
        &self.evaluator
    }

    pub fn counters(&self) -> &CounterStore {
        &self.counters
    }

    /// Evaluate one sample and apply the result to its counter
    ///
    /// Returns the evaluation and the counter value after the update. A
    /// malformed sample is rejected before the counter is read or written.
    pub async fn process(
        &self,
        sample: &MetricSample,
    ) -> Result<(AbuseEvaluation, u64), DetectionError> {
        let evaluation = match self.evaluator.evaluate(
            sample.metric,
            sample.current_value,
            sample.baseline_value,
        ) {
            Ok(evaluation) => evaluation,
            Err(e) => {
                warn!(
                    entity = %sample.entity,
                    metric = %sample.metric,
                    error = %e,
                    "Rejected malformed sample"
                );
                self.metrics.inc_invalid_samples(sample.metric);
                return Err(e);
            }
        };
        self.metrics.inc_samples_evaluated(sample.metric);
        if evaluation.is_abuse {
            self.metrics
                .inc_abuse_detections(sample.metric, evaluation.severity);
        }

        let key = CounterKey::new(sample.entity.clone(), sample.metric);
        let count = self.counters.update(&key, evaluation.is_abuse).await;
        Ok((evaluation, count))
    }
}

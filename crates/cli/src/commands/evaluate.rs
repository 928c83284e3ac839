//! Offline threshold evaluation

use anyhow::Result;
use colored::Colorize;
use detector_lib::config::ThresholdConfig;
use detector_lib::detection::{AbuseEvaluation, ThresholdEvaluator};
use detector_lib::MetricKind;
use serde::Serialize;
use std::sync::Arc;
use tabled::Tabled;

use crate::output::{color_flag, color_severity, print_json, print_rows, OutputFormat};

#[derive(Serialize)]
struct EvaluationReport<'a> {
    metric: MetricKind,
    current: f64,
    baseline: f64,
    #[serde(flatten)]
    evaluation: &'a AbuseEvaluation,
}

#[derive(Tabled)]
struct FieldRow {
    #[tabled(rename = "Field")]
    field: &'static str,
    #[tabled(rename = "Value")]
    value: String,
}

/// Evaluate one sample and print the classification
pub fn evaluate(
    thresholds: ThresholdConfig,
    metric: MetricKind,
    current: f64,
    baseline: f64,
    format: OutputFormat,
) -> Result<()> {
    let evaluator = ThresholdEvaluator::new(Arc::new(thresholds));
    let evaluation = evaluator.evaluate(metric, current, baseline)?;

    if format == OutputFormat::Json {
        return print_json(&EvaluationReport {
            metric,
            current,
            baseline,
            evaluation: &evaluation,
        });
    }

    let rows = vec![
        FieldRow {
            field: "Metric",
            value: metric.to_string(),
        },
        FieldRow {
            field: "Abuse",
            value: color_flag(evaluation.is_abuse),
        },
        FieldRow {
            field: "Severity",
            value: color_severity(evaluation.severity),
        },
        FieldRow {
            field: "Absolute tier",
            value: color_severity(evaluation.absolute_tier),
        },
        FieldRow {
            field: "Change",
            value: format!("{:+.1}%", evaluation.percentage_change),
        },
        FieldRow {
            field: "Multiplier",
            value: format!("{}x", evaluation.multiplier_level),
        },
    ];
    print_rows(&rows, &evaluation, format)?;
    println!("{}", evaluation.reason.dimmed());
    Ok(())
}

//! Classifier & Filter (spec §4.2). Maps each inbound sample to the Cost or
//! Observability stream and masks labels down to the configured allow-list.

use crate::config::FilterConfig;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StreamClass {
    Cost,
    Observability,
}

impl StreamClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamClass::Cost => "cost",
            StreamClass::Observability => "observability",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Sample {
    pub cluster: String,
    pub cloud_account: String,
    pub metric_name: String,
    pub node: String,
    pub timestamp_ms: i64,
    pub labels: BTreeMap<String, String>,
    pub value: String,
}

pub struct Classifier {
    filters: FilterConfig,
    dropped: std::sync::atomic::AtomicU64,
}

impl Classifier {
    pub fn new(filters: FilterConfig) -> Self {
        Self {
            filters,
            dropped: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Classify and mask one sample. `None` means the metric name matched neither
    /// allow-list and the sample was dropped (drop counter incremented).
    pub fn classify(&self, mut sample: Sample) -> Option<(StreamClass, Sample)> {
        // cost is evaluated before observability: a fixed, documented tie-break.
        let class = if self.filters.cost.iter().any(|re| re.is_match(&sample.metric_name)) {
            StreamClass::Cost
        } else if self
            .filters
            .observability
            .iter()
            .any(|re| re.is_match(&sample.metric_name))
        {
            StreamClass::Observability
        } else {
            self.dropped.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            return None;
        };

        let label_patterns = match class {
            StreamClass::Cost => &self.filters.cost_labels,
            StreamClass::Observability => &self.filters.observability_labels,
        };
        if !label_patterns.is_empty() {
            sample
                .labels
                .retain(|name, _| label_patterns.iter().any(|re| re.is_match(name)));
        }

        Some((class, sample))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;

    fn filters() -> FilterConfig {
        FilterConfig {
            cost: vec![Regex::new("^node_cpu").unwrap()],
            observability: vec![Regex::new("^kube_").unwrap()],
            cost_labels: vec![Regex::new("^cpu$").unwrap()],
            observability_labels: vec![],
        }
    }

    fn sample(name: &str) -> Sample {
        let mut labels = BTreeMap::new();
        labels.insert("cpu".to_string(), "0".to_string());
        labels.insert("extra".to_string(), "ignored".to_string());
        Sample {
            cluster: "c".to_string(),
            cloud_account: "acct".to_string(),
            metric_name: name.to_string(),
            node: "n".to_string(),
            timestamp_ms: 0,
            labels,
            value: "1.0".to_string(),
        }
    }

    #[test]
    fn cost_wins_tiebreak_against_observability() {
        let classifier = Classifier::new(FilterConfig {
            cost: vec![Regex::new("^node_cpu").unwrap()],
            observability: vec![Regex::new("^node_cpu").unwrap()],
            cost_labels: vec![],
            observability_labels: vec![],
        });
        let (class, _) = classifier.classify(sample("node_cpu_seconds_total")).unwrap();
        assert_eq!(class, StreamClass::Cost);
    }

    #[test]
    fn unmatched_metric_is_dropped_and_counted() {
        let classifier = Classifier::new(filters());
        assert!(classifier.classify(sample("unrelated_metric")).is_none());
        assert_eq!(classifier.dropped_count(), 1);
    }

    #[test]
    fn labels_are_masked_to_allow_list() {
        let classifier = Classifier::new(filters());
        let (class, sample) = classifier.classify(sample("node_cpu_seconds_total")).unwrap();
        assert_eq!(class, StreamClass::Cost);
        assert_eq!(sample.labels.len(), 1);
        assert!(sample.labels.contains_key("cpu"));
    }

    #[test]
    fn no_label_patterns_retains_all_labels() {
        let classifier = Classifier::new(filters());
        let (_, sample) = classifier.classify(sample("kube_pod_info")).unwrap();
        assert_eq!(sample.labels.len(), 2);
    }
}

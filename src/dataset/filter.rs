use crate::dataset::prepare::PreparedExample;

/// Drops examples longer than `max_duration_secs` (inclusive boundary:
/// an example exactly at the threshold is retained). `None` disables
/// filtering; a threshold of 0 validly removes everything.
pub fn filter_by_max_duration(
    examples: Vec<PreparedExample>,
    max_duration_secs: Option<f64>,
    split_name: &str,
) -> Vec<PreparedExample> {
    let Some(max) = max_duration_secs else {
        return examples;
    };
    let before = examples.len();
    let kept: Vec<PreparedExample> = examples
        .into_iter()
        .filter(|e| e.duration_secs <= max)
        .collect();
    let removed = before - kept.len();
    if removed > 0 {
        tracing::warn!(
            removed,
            split = split_name,
            max_duration_secs = max,
            "filtered out example(s) longer than the duration threshold"
        );
    }
    kept
}

use itertools::Itertools;

use super::PowerForecast;

/// Time-weighted average of `forecast` over `slots` slots of `slot_length`
/// starting at `from`. Time not covered by the forecast counts as 0 W.
pub fn resample(forecast: &PowerForecast, from: i64, slot_length: i64, slots: usize) -> Vec<f64> {
    if forecast.slot_length == slot_length && forecast.starting_time == from {
        return (0..slots)
            .map(|i| forecast.values.get(i).copied().unwrap_or(0.0))
            .collect();
    }

    (0..slots as i64)
        .map(|i| {
            let begin = from + i * slot_length;
            let end = begin + slot_length;
            let weighted: f64 = forecast
                .values
                .iter()
                .enumerate()
                .map(|(j, value)| {
                    let source_begin = forecast.starting_time + j as i64 * forecast.slot_length;
                    let overlap = end.min(source_begin + forecast.slot_length) - begin.max(source_begin);
                    overlap.max(0) as f64 * value
                })
                .sum();
            weighted / slot_length as f64
        })
        .collect_vec()
}

//! Helpers for cyclic (wrap-around) axes and nearest-value lookups.

/// Relative move from `current` to `target` on an axis of period `cycle`,
/// taking the shorter direction. The result lies in `(-cycle/2, cycle/2]`.
pub fn shortest_cyclic_move(current: f64, target: f64, cycle: f64) -> f64 {
    let delta = target - current;
    let forward = delta.rem_euclid(cycle);
    let backward = (-delta).rem_euclid(cycle);
    if forward < backward {
        forward
    } else {
        -backward
    }
}

/// Distance between two positions on an axis of period `cycle`.
pub fn cyclic_distance(a: f64, b: f64, cycle: f64) -> f64 {
    let d = (a - b).rem_euclid(cycle);
    d.min((b - a).rem_euclid(cycle))
}

/// Distance between two positions, cyclic if `cycle` is given.
pub fn distance(a: f64, b: f64, cycle: Option<f64>) -> f64 {
    match cycle {
        Some(c) => cyclic_distance(a, b, c),
        None => (a - b).abs(),
    }
}

/// The candidate closest to `value`, with its distance.
pub fn find_closest<I>(value: f64, candidates: I, cycle: Option<f64>) -> Option<(f64, f64)>
where
    I: IntoIterator<Item = f64>,
{
    candidates
        .into_iter()
        .map(|c| (c, distance(value, c, cycle)))
        .min_by(|a, b| a.1.total_cmp(&b.1))
}

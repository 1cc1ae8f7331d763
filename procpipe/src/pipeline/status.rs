//! Aggregate exit status of a pipeline.

/// Combine per-stage exit codes the way `set -o pipefail` does.
///
/// Returns `None` while the last stage has not been observed. Otherwise the
/// last stage's code if nonzero, else the rightmost nonzero code among the
/// earlier stages. Unobserved earlier stages are skipped, not counted as 0.
pub fn aggregate_returncode(codes: &[Option<i32>]) -> Option<i32> {
    let (last, earlier) = codes.split_last()?;
    let last = (*last)?;
    if last != 0 {
        return Some(last);
    }
    Some(
        earlier
            .iter()
            .rev()
            .flatten()
            .copied()
            .find(|&code| code != 0)
            .unwrap_or(0),
    )
}

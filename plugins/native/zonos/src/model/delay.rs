// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Codebook delay pattern.
//!
//! Codebook `k` is shifted right by `k + 1` frames so that, at any step,
//! coarser codebooks are always ahead of finer ones. Rows are codebooks,
//! columns are frames.

/// Marks a slot the model has yet to fill.
pub const UNKNOWN_TOKEN: i64 = -1;

/// Delayed grid for `len` frames: unknown slots inside each codebook's
/// shifted window, `masked` everywhere else. Width is `len + n_q`.
pub fn delay_template(n_q: usize, len: usize, masked: i64) -> Vec<Vec<i64>> {
    (0..n_q)
        .map(|k| {
            (0..len + n_q)
                .map(|t| if t > k && t < len + k + 1 { UNKNOWN_TOKEN } else { masked })
                .collect()
        })
        .collect()
}

/// Shifts `codes` into delayed layout, filling the gaps with `masked`.
pub fn apply_delay(codes: &[Vec<i64>], masked: i64) -> Vec<Vec<i64>> {
    let n_q = codes.len();
    codes
        .iter()
        .enumerate()
        .map(|(k, row)| {
            let mut delayed = vec![masked; row.len() + n_q];
            delayed[k + 1..k + 1 + row.len()].copy_from_slice(row);
            delayed
        })
        .collect()
}

/// Undoes [`apply_delay`]; output width is the delayed width minus `n_q`.
pub fn revert_delay(delayed: &[Vec<i64>]) -> Vec<Vec<i64>> {
    let n_q = delayed.len();
    delayed
        .iter()
        .enumerate()
        .map(|(k, row)| {
            let len = row.len().saturating_sub(n_q);
            row.get(k + 1..k + 1 + len).map_or_else(Vec::new, <[i64]>::to_vec)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const M: i64 = 1025;
    const U: i64 = UNKNOWN_TOKEN;

    #[test]
    fn test_template_layout() {
        let grid = delay_template(3, 2, M);
        assert_eq!(
            grid,
            vec![
                vec![M, U, U, M, M],
                vec![M, M, U, U, M],
                vec![M, M, M, U, U],
            ]
        );
    }

    #[test]
    fn test_revert_recovers_codes() {
        let codes = vec![vec![1, 2, 3], vec![4, 5, 6]];
        let delayed = apply_delay(&codes, M);
        assert_eq!(delayed, vec![vec![M, 1, 2, 3, M], vec![M, M, 4, 5, 6]]);
        assert_eq!(revert_delay(&delayed), codes);
    }

    #[test]
    fn test_revert_truncated_grid() {
        // Generation may stop before filling every column.
        let delayed = vec![vec![M, 7, M], vec![M, M, 8]];
        assert_eq!(revert_delay(&delayed), vec![vec![7], vec![8]]);
        assert_eq!(revert_delay(&[vec![M]]), vec![Vec::<i64>::new()]);
    }
}

// file: src/utils.rs
// description: Host-side reference math and deterministic data helpers for checking layer outputs.
// author: cipher-rc5
// created: 2026-02-21
// modified: 2026-10-19

use anyhow::Result;

/// Computes A(m x k) * B^T, where B is stored as (n x k).
/// This matches the checkpoint layout for linear weights: (out_features, in_features).
pub fn matmul(a: &[f32], b: &[f32], m: usize, k: usize, n: usize) -> Result<Vec<f32>> {
    anyhow::ensure!(
        a.len() == m * k,
        "matmul: matrix A has length {} but expected {} ({}x{})",
        a.len(),
        m * k,
        m,
        k
    );
    anyhow::ensure!(
        b.len() == n * k,
        "matmul: matrix B has length {} but expected {} ({}x{})",
        b.len(),
        n * k,
        n,
        k
    );

    let mut output = vec![0.0f32; m * n];
    for row in 0..m {
        let a_row = &a[row * k..(row + 1) * k];
        for col in 0..n {
            output[row * n + col] = dot(a_row, &b[col * k..(col + 1) * k]);
        }
    }
    Ok(output)
}

pub fn apply_bias(matrix: &mut [f32], rows: usize, cols: usize, bias: &[f32]) -> Result<()> {
    anyhow::ensure!(
        bias.len() == cols,
        "Bias length {} does not match columns {}",
        bias.len(),
        cols
    );
    anyhow::ensure!(
        matrix.len() == rows * cols,
        "Matrix length {} does not match expected {} (rows={}, cols={})",
        matrix.len(),
        rows * cols,
        rows,
        cols
    );

    for row in matrix.chunks_exact_mut(cols) {
        for (v, b) in row.iter_mut().zip(bias) {
            *v += b;
        }
    }
    Ok(())
}

pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

pub fn max_abs_diff(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f32::max)
}

/// Deterministic values in `[-scale, scale)` from a xorshift64 stream.
pub fn pseudo_random(len: usize, seed: u64, scale: f32) -> Vec<f32> {
    let mut state = seed.max(1);
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            let unit = (state >> 40) as f32 / (1u64 << 24) as f32;
            (unit * 2.0 - 1.0) * scale
        })
        .collect()
}

/// Order-sensitive checksum for printing layer outputs.
pub fn checksum(values: &[f32]) -> f64 {
    values
        .iter()
        .enumerate()
        .map(|(i, &v)| v as f64 * ((i % 7) as f64 + 1.0))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matmul_uses_transposed_weight_layout() {
        // A = [[1, 2]], B rows = [[3, 4], [5, 6]]
        let out = matmul(&[1.0, 2.0], &[3.0, 4.0, 5.0, 6.0], 1, 2, 2).unwrap();
        assert_eq!(out, vec![11.0, 17.0]);
        assert!(matmul(&[1.0], &[1.0, 2.0], 1, 2, 1).is_err());
    }

    #[test]
    fn bias_is_added_per_column() {
        let mut m = vec![0.0, 1.0, 2.0, 3.0];
        apply_bias(&mut m, 2, 2, &[10.0, 20.0]).unwrap();
        assert_eq!(m, vec![10.0, 21.0, 12.0, 23.0]);
        assert!(apply_bias(&mut m, 2, 2, &[1.0]).is_err());
    }

    #[test]
    fn pseudo_random_is_deterministic_and_bounded() {
        let a = pseudo_random(256, 42, 3.0);
        assert_eq!(a, pseudo_random(256, 42, 3.0));
        assert_ne!(a, pseudo_random(256, 43, 3.0));
        assert!(a.iter().all(|v| (-3.0..3.0).contains(v)));
        assert_eq!(max_abs_diff(&a, &a), 0.0);
    }
}

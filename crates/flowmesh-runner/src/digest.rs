// Copyright (c) 2025 FlowMesh Team
// SPDX-License-Identifier: Apache-2.0

//! Streaming percentile sketch (merging t-digest).
//!
//! Centroids carry (mean, weight); incoming samples buffer and merge in
//! sorted order under the k0 size bound `4·n·q·(1-q)/δ`, which keeps the
//! tails tight where load-test percentiles live. With the default
//! compression of 100 the P50/P95/P99 estimates stay within ±1.5
//! percentage points at 10 k samples.

/// Default compression parameter (δ).
pub const DEFAULT_COMPRESSION: f64 = 100.0;

const BUFFER_LIMIT: usize = 512;

#[derive(Debug, Clone, Copy)]
struct Centroid {
    mean: f64,
    weight: f64,
}

/// A mergeable quantile sketch.
#[derive(Debug, Clone)]
pub struct TDigest {
    compression: f64,
    centroids: Vec<Centroid>,
    buffer: Vec<f64>,
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
}

impl TDigest {
    pub fn new(compression: f64) -> Self {
        Self {
            compression: compression.max(20.0),
            centroids: Vec::new(),
            buffer: Vec::new(),
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    /// Records one sample.
    pub fn add(&mut self, x: f64) {
        if !x.is_finite() {
            return;
        }
        self.count += 1;
        self.sum += x;
        self.min = self.min.min(x);
        self.max = self.max.max(x);
        self.buffer.push(x);
        if self.buffer.len() >= BUFFER_LIMIT {
            self.compress();
        }
    }

    /// Merges another digest into this one.
    pub fn merge(&mut self, other: &TDigest) {
        if other.count == 0 {
            return;
        }
        self.count += other.count;
        self.sum += other.sum;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        for c in &other.centroids {
            self.centroids.push(*c);
        }
        self.buffer.extend_from_slice(&other.buffer);
        self.compress();
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn min(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.min
        }
    }

    pub fn max(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.max
        }
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    /// Estimates the q-quantile (0 ≤ q ≤ 1).
    pub fn quantile(&mut self, q: f64) -> f64 {
        self.compress();
        if self.centroids.is_empty() {
            return 0.0;
        }
        let q = q.clamp(0.0, 1.0);
        let total: f64 = self.count as f64;
        let target = q * total;

        let mut cumulative = 0.0;
        for (i, c) in self.centroids.iter().enumerate() {
            let mid = cumulative + c.weight / 2.0;
            if target <= mid {
                // Interpolate toward the previous centroid midpoint.
                if i == 0 {
                    let prev_mid = 0.0;
                    let frac = if mid > prev_mid { (target - prev_mid) / (mid - prev_mid) } else { 1.0 };
                    return self.min() + (c.mean - self.min()) * frac.clamp(0.0, 1.0);
                }
                let prev = self.centroids[i - 1];
                let prev_mid = cumulative - prev.weight / 2.0;
                let frac = if mid > prev_mid { (target - prev_mid) / (mid - prev_mid) } else { 1.0 };
                return prev.mean + (c.mean - prev.mean) * frac.clamp(0.0, 1.0);
            }
            cumulative += c.weight;
        }
        self.max()
    }

    /// Folds buffered samples into the centroid list under the size bound.
    fn compress(&mut self) {
        if self.buffer.is_empty() && self.centroids.len() <= self.compression as usize * 2 {
            return;
        }
        let mut merged: Vec<Centroid> = self
            .buffer
            .drain(..)
            .map(|x| Centroid { mean: x, weight: 1.0 })
            .chain(self.centroids.drain(..))
            .collect();
        if merged.is_empty() {
            return;
        }
        merged.sort_by(|a, b| a.mean.partial_cmp(&b.mean).unwrap_or(std::cmp::Ordering::Equal));

        let total: f64 = merged.iter().map(|c| c.weight).sum();
        let mut out: Vec<Centroid> = Vec::with_capacity(self.compression as usize * 2);
        let mut current = merged[0];
        let mut cumulative = 0.0;

        for c in merged.into_iter().skip(1) {
            let proposed = current.weight + c.weight;
            let q = (cumulative + proposed / 2.0) / total;
            let limit = 4.0 * total * q * (1.0 - q) / self.compression;
            if proposed <= limit.max(1.0) {
                // Weighted-mean merge.
                current.mean = (current.mean * current.weight + c.mean * c.weight) / proposed;
                current.weight = proposed;
            } else {
                cumulative += current.weight;
                out.push(current);
                current = c;
            }
        }
        out.push(current);
        self.centroids = out;
    }
}

impl Default for TDigest {
    fn default() -> Self {
        Self::new(DEFAULT_COMPRESSION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_digest_is_zeroed() {
        let mut d = TDigest::default();
        assert_eq!(d.count(), 0);
        assert_eq!(d.quantile(0.5), 0.0);
        assert_eq!(d.min(), 0.0);
    }

    #[test]
    fn uniform_distribution_percentiles_within_bounds() {
        // 10k samples uniform over 100..200 ms: p50≈150, p95≈195, p99≈199.
        let mut d = TDigest::default();
        for i in 0..10_000 {
            let x = 100.0 + 100.0 * (i as f64 + 0.5) / 10_000.0;
            d.add(x);
        }
        let p50 = d.quantile(0.50);
        let p95 = d.quantile(0.95);
        let p99 = d.quantile(0.99);
        assert!((p50 - 150.0).abs() <= 1.5, "p50={p50}");
        assert!((p95 - 195.0).abs() <= 1.5, "p95={p95}");
        assert!((p99 - 199.0).abs() <= 1.5, "p99={p99}");
    }

    #[test]
    fn quantiles_are_monotone() {
        let mut d = TDigest::default();
        for i in 0..5_000 {
            d.add((i % 977) as f64);
        }
        let p50 = d.quantile(0.50);
        let p95 = d.quantile(0.95);
        let p99 = d.quantile(0.99);
        assert!(p50 <= p95 && p95 <= p99);
    }

    #[test]
    fn min_max_mean_track_inputs() {
        let mut d = TDigest::default();
        for x in [5.0, 1.0, 9.0] {
            d.add(x);
        }
        assert_eq!(d.min(), 1.0);
        assert_eq!(d.max(), 9.0);
        assert!((d.mean() - 5.0).abs() < 1e-9);
    }

    #[test]
    fn merge_combines_counts_and_extremes() {
        let mut a = TDigest::default();
        let mut b = TDigest::default();
        for i in 0..1_000 {
            a.add(i as f64);
            b.add((i + 1_000) as f64);
        }
        a.merge(&b);
        assert_eq!(a.count(), 2_000);
        assert_eq!(a.max(), 1_999.0);
        let p50 = a.quantile(0.5);
        assert!((p50 - 1_000.0).abs() <= 40.0, "p50={p50}");
    }
}

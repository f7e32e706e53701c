// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Samples of one profile, one sample type: parallel arrays of stack trace
/// ids and values.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Samples {
    pub stacktrace_ids: Vec<u32>,
    pub values: Vec<i64>,
}

impl Samples {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            stacktrace_ids: Vec::with_capacity(capacity),
            values: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.stacktrace_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stacktrace_ids.is_empty()
    }

    pub fn push(&mut self, stacktrace_id: u32, value: i64) {
        self.stacktrace_ids.push(stacktrace_id);
        self.values.push(value);
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, i64)> + '_ {
        self.stacktrace_ids
            .iter()
            .copied()
            .zip(self.values.iter().copied())
    }

    pub fn sum(&self) -> i64 {
        self.values.iter().sum()
    }

    /// Sorts the samples by stack trace id, merges the values of duplicate
    /// ids and drops the samples whose value is zero.
    pub fn compact(&mut self) {
        let mut pairs: Vec<(u32, i64)> = self.iter().collect();
        pairs.sort_unstable_by_key(|&(id, _)| id);
        pairs.dedup_by(|next, prev| {
            if next.0 == prev.0 {
                prev.1 += next.1;
                true
            } else {
                false
            }
        });
        pairs.retain(|&(_, value)| value != 0);
        self.stacktrace_ids = pairs.iter().map(|&(id, _)| id).collect();
        self.values = pairs.iter().map(|&(_, value)| value).collect();
    }
}

impl FromIterator<(u32, i64)> for Samples {
    fn from_iter<I: IntoIterator<Item = (u32, i64)>>(iter: I) -> Self {
        let mut samples = Samples::default();
        for (id, value) in iter {
            samples.push(id, value);
        }
        samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn compact_merges_and_drops_zeroes() {
        let mut samples: Samples = [(5, 1), (3, 2), (5, 4), (7, 0), (1, 3), (1, -3)]
            .into_iter()
            .collect();
        samples.compact();
        assert_eq!(samples.stacktrace_ids, vec![3, 5]);
        assert_eq!(samples.values, vec![2, 5]);
        assert_eq!(samples.sum(), 7);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: if cfg!(miri) { 4 } else { 64 },
            .. ProptestConfig::default()
        })]

        #[test]
        fn proptest_compact_preserves_total(
            pairs in proptest::collection::vec((0u32..32, 0i64..100), 0..128),
        ) {
            let mut samples: Samples = pairs.iter().copied().collect();
            let total = samples.sum();
            samples.compact();
            prop_assert_eq!(samples.sum(), total);
            prop_assert!(samples.stacktrace_ids.windows(2).all(|w| w[0] < w[1]));
            prop_assert!(samples.values.iter().all(|&v| v != 0));
        }
    }
}

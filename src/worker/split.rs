//! Exact greedy split finding over one worker's feature columns.
//!
//! For each requested feature, the worker scans the examples of the open
//! node and proposes the condition with the highest gain, or nothing when
//! no condition improves on the parent. Scans are deterministic: examples
//! are ordered by value then index, and on a gain tie the first candidate
//! wins.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::coordinator::protocol::Split;
use crate::dataset::cache::ColumnData;
use crate::loss::GradientStatistics;
use crate::model::tree::{CategoryMask, SplitCondition};

#[derive(Debug, Clone, Copy)]
pub struct SplitSearchConfig {
    pub min_examples: u64,
    pub use_hessian_gain: bool,
}

fn partial_score(statistics: &GradientStatistics, use_hessian_gain: bool) -> f64 {
    let denominator = if use_hessian_gain {
        statistics.sum_hessian
    } else {
        statistics.weight_sum
    };
    if denominator <= f64::EPSILON {
        return 0.0;
    }
    statistics.sum_gradient * statistics.sum_gradient / denominator
}

/// Gain of splitting `parent` into `negative` and `positive`.
fn gain(
    negative: &GradientStatistics,
    positive: &GradientStatistics,
    parent: &GradientStatistics,
    use_hessian_gain: bool,
) -> f64 {
    partial_score(negative, use_hessian_gain) + partial_score(positive, use_hessian_gain)
        - partial_score(parent, use_hessian_gain)
}

fn admissible(
    negative: &GradientStatistics,
    positive: &GradientStatistics,
    config: &SplitSearchConfig,
) -> bool {
    negative.count >= config.min_examples && positive.count >= config.min_examples
}

struct ExampleAccess<'a> {
    gradients: &'a [(f64, f64)],
    weights: Option<&'a [f32]>,
}

impl ExampleAccess<'_> {
    fn add_to(&self, statistics: &mut GradientStatistics, example: usize) {
        let (gradient, hessian) = self.gradients[example];
        let weight = self.weights.map(|w| w[example] as f64).unwrap_or(1.0);
        statistics.add_example(gradient, hessian, weight);
    }
}

fn split_on_ordered_values(
    attribute: usize,
    values: impl Fn(usize) -> f32,
    examples: &[usize],
    access: &ExampleAccess<'_>,
    parent: &GradientStatistics,
    config: &SplitSearchConfig,
) -> Option<Split> {
    let mut ordered: Vec<(f32, usize)> = examples.iter().map(|&ex| (values(ex), ex)).collect();
    ordered.sort_by(|a, b| {
        a.0.partial_cmp(&b.0)
            .unwrap_or(Ordering::Equal)
            .then(a.1.cmp(&b.1))
    });

    let mut negative = GradientStatistics::default();
    let mut best: Option<Split> = None;
    for idx in 0..ordered.len() {
        if idx > 0 && ordered[idx].0 > ordered[idx - 1].0 {
            let positive = parent.subtract(&negative);
            if admissible(&negative, &positive, config) {
                let score = gain(&negative, &positive, parent, config.use_hessian_gain);
                if score > 0.0
                    && best
                        .as_ref()
                        .map(|b| score as f32 > b.score)
                        .unwrap_or(true)
                {
                    let previous = ordered[idx - 1].0;
                    let current = ordered[idx].0;
                    let mut threshold = previous + (current - previous) / 2.0;
                    // Keep the prefix strictly below the threshold even when
                    // the midpoint rounds down to the previous value.
                    if threshold <= previous {
                        threshold = current;
                    }
                    best = Some(Split {
                        condition: SplitCondition::NumericalThreshold {
                            attribute,
                            threshold,
                        },
                        score: score as f32,
                        negative,
                        positive,
                    });
                }
            }
        }
        access.add_to(&mut negative, ordered[idx].1);
    }
    best
}

fn split_discretized(
    attribute: usize,
    buckets: &[u32],
    examples: &[usize],
    access: &ExampleAccess<'_>,
    parent: &GradientStatistics,
    config: &SplitSearchConfig,
) -> Option<Split> {
    let mut per_bucket: BTreeMap<u32, GradientStatistics> = BTreeMap::new();
    for &example in examples {
        access.add_to(per_bucket.entry(buckets[example]).or_default(), example);
    }
    let keys: Vec<u32> = per_bucket.keys().copied().collect();
    if keys.len() < 2 {
        return None;
    }

    let mut negative = GradientStatistics::default();
    let mut best: Option<Split> = None;
    for window in keys.windows(2) {
        negative.merge(&per_bucket[&window[0]]);
        let positive = parent.subtract(&negative);
        if !admissible(&negative, &positive, config) {
            continue;
        }
        let score = gain(&negative, &positive, parent, config.use_hessian_gain);
        if score > 0.0
            && best
                .as_ref()
                .map(|b| score as f32 > b.score)
                .unwrap_or(true)
        {
            best = Some(Split {
                condition: SplitCondition::DiscretizedBucket {
                    attribute,
                    bucket: window[1],
                },
                score: score as f32,
                negative,
                positive,
            });
        }
    }
    best
}

fn split_categorical(
    attribute: usize,
    categories: &[u32],
    examples: &[usize],
    access: &ExampleAccess<'_>,
    parent: &GradientStatistics,
    config: &SplitSearchConfig,
) -> Option<Split> {
    let mut per_category: BTreeMap<u32, GradientStatistics> = BTreeMap::new();
    for &example in examples {
        access.add_to(per_category.entry(categories[example]).or_default(), example);
    }
    if per_category.len() < 2 {
        return None;
    }

    // Order categories by mean gradient; the best mask split over a convex
    // loss is then a prefix/suffix cut of this ordering.
    let mut ordered: Vec<(u32, GradientStatistics)> = per_category.into_iter().collect();
    ordered.sort_by(|a, b| {
        let mean_a = a.1.sum_gradient / a.1.weight_sum.max(f64::EPSILON);
        let mean_b = b.1.sum_gradient / b.1.weight_sum.max(f64::EPSILON);
        mean_a
            .partial_cmp(&mean_b)
            .unwrap_or(Ordering::Equal)
            .then(a.0.cmp(&b.0))
    });

    let mut negative = GradientStatistics::default();
    let mut best: Option<(usize, f32, GradientStatistics, GradientStatistics)> = None;
    for cut in 0..ordered.len() - 1 {
        negative.merge(&ordered[cut].1);
        let positive = parent.subtract(&negative);
        if !admissible(&negative, &positive, config) {
            continue;
        }
        let score = gain(&negative, &positive, parent, config.use_hessian_gain) as f32;
        if score > 0.0 && best.as_ref().map(|b| score > b.1).unwrap_or(true) {
            best = Some((cut, score, negative, positive));
        }
    }

    best.map(|(cut, score, negative, positive)| {
        let max_category = ordered.iter().map(|(c, _)| *c).max().unwrap_or(0);
        let mut mask = CategoryMask::with_capacity(max_category as usize + 1);
        for (category, _) in &ordered[cut + 1..] {
            mask.insert(*category);
        }
        Split {
            condition: SplitCondition::CategoricalMask { attribute, mask },
            score,
            negative,
            positive,
        }
    })
}

/// Best split of one feature for the examples of one open node, or `None`
/// when no condition improves on the parent.
pub fn find_best_split(
    attribute: usize,
    column: &ColumnData,
    examples: &[usize],
    gradients: &[(f64, f64)],
    weights: Option<&[f32]>,
    parent: &GradientStatistics,
    config: &SplitSearchConfig,
) -> Option<Split> {
    if (examples.len() as u64) < 2 * config.min_examples {
        return None;
    }
    let access = ExampleAccess { gradients, weights };
    match column {
        ColumnData::Numerical(values) => split_on_ordered_values(
            attribute,
            |example| values[example],
            examples,
            &access,
            parent,
            config,
        ),
        ColumnData::Boolean(values) => split_on_ordered_values(
            attribute,
            |example| if values[example] { 1.0 } else { 0.0 },
            examples,
            &access,
            parent,
            config,
        ),
        ColumnData::DiscretizedNumerical { buckets, .. } => {
            split_discretized(attribute, buckets, examples, &access, parent, config)
        }
        ColumnData::Categorical(values) => {
            split_categorical(attribute, values, examples, &access, parent, config)
        }
    }
}

#![forbid(unsafe_code)]

//! Candidate sampling and the two valid-input search strategies.
//!
//! Both strategies walk the same [`CandidateSequence`] in order. Blind search
//! only forward-evaluates; gradient search asks the graph to refine each
//! candidate and falls back to the blind outcome when the graph cannot
//! propagate gradients.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::debug;
use vi_core::{DenseTensor, Device};
use vi_graph::{ExecutableGraph, GradientSearch, GraphError};

/// One concrete tensor per declared input slot.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateAssignment {
    center: f64,
    tensors: Vec<DenseTensor>,
}

impl CandidateAssignment {
    #[must_use]
    pub fn center(&self) -> f64 {
        self.center
    }

    #[must_use]
    pub fn tensors(&self) -> &[DenseTensor] {
        &self.tensors
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CandidateSequence {
    step_interval: f64,
    assignments: Vec<CandidateAssignment>,
}

impl CandidateSequence {
    #[must_use]
    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    #[must_use]
    pub fn step_interval(&self) -> f64 {
        self.step_interval
    }

    pub fn iter(&self) -> impl Iterator<Item = &CandidateAssignment> {
        self.assignments.iter()
    }

    #[must_use]
    pub fn get(&self, idx: usize) -> Option<&CandidateAssignment> {
        self.assignments.get(idx)
    }
}

/// Evenly spaced centers over `[-1, 1]`; a single sample sits at `-1`.
#[must_use]
pub fn sample_centers(n_samples: NonZeroUsize) -> Vec<f64> {
    let n = n_samples.get();
    if n == 1 {
        return vec![-1.0];
    }
    let last = (n - 1) as f64;
    (0..n)
        .map(|idx| {
            if idx == n - 1 {
                1.0
            } else {
                -1.0 + 2.0 * idx as f64 / last
            }
        })
        .collect()
}

/// Builds `n_samples` assignments. Every element of assignment `i` lies in
/// `[center_i, center_i + 2 / n_samples)`.
pub fn generate_candidates<R: Rng>(
    input_shapes: &[Vec<usize>],
    n_samples: NonZeroUsize,
    rng: &mut R,
) -> CandidateSequence {
    let step_interval = 2.0 / n_samples.get() as f64;
    let assignments = sample_centers(n_samples)
        .into_iter()
        .map(|center| {
            let tensors = input_shapes
                .iter()
                .map(|shape| {
                    let mut tensor = DenseTensor::zeros(shape.clone());
                    for value in tensor.values_mut() {
                        *value = center + rng.random::<f64>() * step_interval;
                    }
                    tensor
                })
                .collect();
            CandidateAssignment { center, tensors }
        })
        .collect();

    CandidateSequence {
        step_interval,
        assignments,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    pub success: bool,
    pub attempts: usize,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GradientOutcome {
    pub outcome: Outcome,
    /// Attempt at which the graph reported it cannot differentiate and the
    /// blind outcome was adopted.
    pub fallback_at: Option<usize>,
}

impl GradientOutcome {
    #[must_use]
    pub fn fell_back(&self) -> bool {
        self.fallback_at.is_some()
    }
}

/// Forward-evaluates candidates in order until one has no invalid
/// intermediate. Intermediate checking is forced on for the search and the
/// graph's previous mode is restored before returning.
pub fn blind_search<G: ExecutableGraph + ?Sized>(
    graph: &mut G,
    candidates: &CandidateSequence,
) -> Result<Outcome, GraphError> {
    let previous = graph.check_intermediate();
    graph.set_check_intermediate(true);
    let result = blind_search_checked(graph, candidates);
    graph.set_check_intermediate(previous);
    result
}

fn blind_search_checked<G: ExecutableGraph + ?Sized>(
    graph: &mut G,
    candidates: &CandidateSequence,
) -> Result<Outcome, GraphError> {
    let started = Instant::now();
    let mut attempts = 0;
    let mut success = false;

    for candidate in candidates.iter() {
        attempts += 1;
        let evaluation = graph.forward(candidate.tensors())?;
        if !evaluation.had_invalid_intermediate {
            success = true;
            break;
        }
        debug!(
            attempt = attempts,
            center = candidate.center(),
            first_invalid = ?evaluation.first_invalid,
            "blind candidate rejected"
        );
    }

    Ok(Outcome {
        success,
        attempts,
        elapsed: started.elapsed(),
    })
}

/// Asks the graph to refine each candidate in order. An `Unsupported` answer
/// abandons the search and adopts `blind`'s success and attempt count; the
/// elapsed time stays this search's own.
pub fn gradient_search<G: ExecutableGraph + ?Sized>(
    graph: &mut G,
    candidates: &CandidateSequence,
    device: Device,
    blind: &Outcome,
) -> Result<GradientOutcome, GraphError> {
    let started = Instant::now();
    let mut attempts = 0;

    for candidate in candidates.iter() {
        attempts += 1;
        match graph.gradient_search(candidate.tensors(), device)? {
            GradientSearch::Converged(_) => {
                return Ok(GradientOutcome {
                    outcome: Outcome {
                        success: true,
                        attempts,
                        elapsed: started.elapsed(),
                    },
                    fallback_at: None,
                });
            }
            GradientSearch::NotFound => {
                debug!(
                    attempt = attempts,
                    center = candidate.center(),
                    "gradient search found nothing"
                );
            }
            GradientSearch::Unsupported => {
                debug!(
                    attempt = attempts,
                    blind_attempts = blind.attempts,
                    "graph is not differentiable; adopting blind outcome"
                );
                return Ok(GradientOutcome {
                    outcome: Outcome {
                        success: blind.success,
                        attempts: blind.attempts,
                        elapsed: started.elapsed(),
                    },
                    fallback_at: Some(attempts),
                });
            }
        }
    }

    Ok(GradientOutcome {
        outcome: Outcome {
            success: false,
            attempts,
            elapsed: started.elapsed(),
        },
        fallback_at: None,
    })
}

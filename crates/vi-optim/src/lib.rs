#![forbid(unsafe_code)]

use std::fmt;

use vi_core::DenseTensor;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptimError {
    HyperParameter(&'static str),
    ParamCountMismatch {
        expected: usize,
        actual: usize,
    },
    GradientShapeMismatch {
        param: usize,
        expected: usize,
        actual: usize,
    },
    StepCounterOverflow,
}

impl fmt::Display for OptimError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HyperParameter(reason) => write!(f, "invalid hyperparameter: {reason}"),
            Self::ParamCountMismatch { expected, actual } => write!(
                f,
                "optimizer tracks {expected} params but step received {actual}"
            ),
            Self::GradientShapeMismatch {
                param,
                expected,
                actual,
            } => write!(
                f,
                "gradient length mismatch for param {param}: expected={expected} actual={actual}"
            ),
            Self::StepCounterOverflow => write!(f, "optimizer step counter overflow"),
        }
    }
}

impl std::error::Error for OptimError {}

fn adam_bias_correction(beta: f64, step: u64) -> f64 {
    1.0 - beta.powf(step as f64)
}

fn ensure_param_count(expected: usize, actual: usize) -> Result<(), OptimError> {
    if expected != actual {
        return Err(OptimError::ParamCountMismatch { expected, actual });
    }
    Ok(())
}

fn ensure_grad_len_matches_param(
    param: usize,
    expected: usize,
    actual: usize,
) -> Result<(), OptimError> {
    if expected != actual {
        return Err(OptimError::GradientShapeMismatch {
            param,
            expected,
            actual,
        });
    }
    Ok(())
}

/// Parameter optimizer over dense tensors updated in place.
///
/// `grads[i]` is the gradient of parameter `i`, or `None` when no gradient
/// reached it; such parameters are left untouched.
pub trait Optimizer {
    fn step(
        &mut self,
        params: &mut [DenseTensor],
        grads: &[Option<&[f64]>],
    ) -> Result<(), OptimError>;
}

/// Adam optimizer with bias correction.
pub struct Adam {
    lr: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    step_count: u64,
    m: Vec<Option<Vec<f64>>>,
    v: Vec<Option<Vec<f64>>>,
}

impl Adam {
    /// Create a new Adam optimizer with default hyperparameters.
    ///
    /// Defaults: beta1=0.9, beta2=0.999, eps=1e-8
    #[must_use]
    pub fn new(param_count: usize, lr: f64) -> Self {
        Self {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            step_count: 0,
            m: vec![None; param_count],
            v: vec![None; param_count],
        }
    }

    /// Set beta coefficients for computing running averages.
    #[must_use]
    pub fn betas(mut self, beta1: f64, beta2: f64) -> Self {
        self.beta1 = beta1;
        self.beta2 = beta2;
        self
    }

    /// Set epsilon for numerical stability (default: 1e-8).
    #[must_use]
    pub fn eps(mut self, eps: f64) -> Self {
        self.eps = eps;
        self
    }

    #[must_use]
    pub fn step_count(&self) -> u64 {
        self.step_count
    }

    fn validate_hyperparams(&self) -> Result<(), OptimError> {
        if !self.lr.is_finite() || self.lr < 0.0 {
            return Err(OptimError::HyperParameter(
                "adam requires a finite non-negative learning rate",
            ));
        }
        if !(0.0..1.0).contains(&self.beta1) || !(0.0..1.0).contains(&self.beta2) {
            return Err(OptimError::HyperParameter("adam betas must be in [0, 1)"));
        }
        if !self.eps.is_finite() || self.eps <= 0.0 {
            return Err(OptimError::HyperParameter("adam requires finite eps > 0"));
        }
        Ok(())
    }
}

impl Optimizer for Adam {
    fn step(
        &mut self,
        params: &mut [DenseTensor],
        grads: &[Option<&[f64]>],
    ) -> Result<(), OptimError> {
        self.validate_hyperparams()?;
        ensure_param_count(self.m.len(), params.len())?;
        ensure_param_count(self.m.len(), grads.len())?;
        let t = self
            .step_count
            .checked_add(1)
            .ok_or(OptimError::StepCounterOverflow)?;
        self.step_count = t;

        let bias_correction1 = adam_bias_correction(self.beta1, t);
        let bias_correction2 = adam_bias_correction(self.beta2, t);

        for (i, (param, grad)) in params.iter_mut().zip(grads.iter()).enumerate() {
            let Some(grad) = grad else {
                continue;
            };
            ensure_grad_len_matches_param(i, param.numel(), grad.len())?;

            let m = self.m[i].get_or_insert_with(|| vec![0.0; grad.len()]);
            let v = self.v[i].get_or_insert_with(|| vec![0.0; grad.len()]);
            for (((p, m_val), v_val), g) in param
                .values_mut()
                .iter_mut()
                .zip(m.iter_mut())
                .zip(v.iter_mut())
                .zip(grad.iter())
            {
                *m_val = self.beta1 * *m_val + (1.0 - self.beta1) * g;
                *v_val = self.beta2 * *v_val + (1.0 - self.beta2) * g * g;
                let m_hat = *m_val / bias_correction1;
                let v_hat = *v_val / bias_correction2;
                *p -= self.lr * m_hat / (v_hat.sqrt() + self.eps);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use vi_autograd::TensorTape;
    use vi_core::DenseTensor;
    use vi_kernel_cpu::BinaryOp;

    use super::{Adam, OptimError, Optimizer};

    /// Gradient of sum(x * x) through the tape.
    fn square_grad(param: &DenseTensor) -> Vec<f64> {
        let mut tape = TensorTape::new();
        let x = tape.leaf(param.clone(), true);
        let sq = tape.binary(BinaryOp::Mul, x, x).expect("mul should succeed");
        let loss = tape.sum(sq).expect("sum should succeed");
        let report = tape.backward(loss).expect("backward should succeed");
        report.gradient(x).expect("x grad").to_vec()
    }

    fn param(value: f64) -> DenseTensor {
        DenseTensor::from_vec(vec![1], vec![value]).expect("param should build")
    }

    #[test]
    fn adam_basic_step_reduces_loss() {
        let mut params = vec![param(4.0)];
        let mut optimizer = Adam::new(1, 0.1);
        let grad = square_grad(&params[0]);
        optimizer
            .step(&mut params, &[Some(grad.as_slice())])
            .expect("step should succeed");

        // The first bias-corrected Adam step moves by ~lr regardless of scale.
        assert!((params[0].values()[0] - 3.9).abs() <= 1e-6);
        assert_eq!(optimizer.step_count(), 1);
    }

    #[test]
    fn adam_steps_by_lr_under_constant_gradient() {
        let mut params = vec![param(-1.0)];
        let mut optimizer = Adam::new(1, 0.5);
        for _ in 0..3 {
            optimizer
                .step(&mut params, &[Some(&[-1.0][..])])
                .expect("step should succeed");
        }
        assert!((params[0].values()[0] - 0.5).abs() <= 1e-6);
        assert_eq!(optimizer.step_count(), 3);
    }

    #[test]
    fn adam_skips_params_without_gradient() {
        let mut params = vec![param(4.0), param(-2.0)];
        let mut optimizer = Adam::new(2, 0.5);
        let grad = square_grad(&params[0]);
        optimizer
            .step(&mut params, &[Some(grad.as_slice()), None])
            .expect("step should succeed");
        assert_eq!(params[1].values(), &[-2.0]);
        assert!(params[0].values()[0] < 4.0);
    }

    #[test]
    fn adam_rejects_invalid_betas() {
        let mut params = vec![param(1.0)];
        let mut optimizer = Adam::new(1, 0.1).betas(1.0, 0.999);
        let err = optimizer
            .step(&mut params, &[Some(&[1.0][..])])
            .expect_err("beta1=1 must be rejected");
        assert!(matches!(err, OptimError::HyperParameter(_)));
    }

    #[test]
    fn step_rejects_gradient_length_mismatch() {
        let mut params = vec![param(1.0)];
        let mut optimizer = Adam::new(1, 0.1);
        let err = optimizer
            .step(&mut params, &[Some(&[1.0, 2.0][..])])
            .expect_err("two grads cannot update one element");
        assert_eq!(
            err,
            OptimError::GradientShapeMismatch {
                param: 0,
                expected: 1,
                actual: 2
            }
        );
    }

    #[test]
    fn step_rejects_param_count_mismatch() {
        let mut params = vec![param(1.0), param(2.0)];
        let mut optimizer = Adam::new(1, 0.1).eps(1e-6);
        let err = optimizer
            .step(&mut params, &[None, None])
            .expect_err("optimizer was built for one param");
        assert!(matches!(err, OptimError::ParamCountMismatch { .. }));
    }

    proptest! {
        #[test]
        fn prop_adam_moves_quadratic_toward_zero(start in 0.5f64..50.0) {
            let mut params = vec![param(start)];
            let mut optimizer = Adam::new(1, 0.05);
            for _ in 0..5 {
                let grad = square_grad(&params[0]);
                optimizer.step(&mut params, &[Some(grad.as_slice())]).expect("step");
            }
            prop_assert!(params[0].values()[0].abs() < start);
        }
    }
}

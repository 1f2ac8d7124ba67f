#![forbid(unsafe_code)]

use std::fmt;

use vi_core::{DenseTensor, DenseTensorError, TensorMeta};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    #[must_use]
    pub fn apply(self, lhs: f64, rhs: f64) -> f64 {
        match self {
            Self::Add => lhs + rhs,
            Self::Sub => lhs - rhs,
            Self::Mul => lhs * rhs,
            Self::Div => lhs / rhs,
        }
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Div => "div",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UnaryOp {
    Neg,
    Abs,
    Relu,
    Exp,
    Log,
    Sqrt,
    Sin,
    Tanh,
    Asin,
    Floor,
    AddScalar(f64),
    MulScalar(f64),
}

impl UnaryOp {
    #[must_use]
    pub fn apply(self, value: f64) -> f64 {
        match self {
            Self::Neg => -value,
            Self::Abs => value.abs(),
            Self::Relu => {
                if value > 0.0 || value.is_nan() {
                    value
                } else {
                    0.0
                }
            }
            Self::Exp => value.exp(),
            Self::Log => value.ln(),
            Self::Sqrt => value.sqrt(),
            Self::Sin => value.sin(),
            Self::Tanh => value.tanh(),
            Self::Asin => value.asin(),
            Self::Floor => value.floor(),
            Self::AddScalar(scalar) => value + scalar,
            Self::MulScalar(scalar) => value * scalar,
        }
    }

    /// Floor is piecewise constant; it never propagates a gradient.
    #[must_use]
    pub fn is_differentiable(self) -> bool {
        !matches!(self, Self::Floor)
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Neg => "neg",
            Self::Abs => "abs",
            Self::Relu => "relu",
            Self::Exp => "exp",
            Self::Log => "log",
            Self::Sqrt => "sqrt",
            Self::Sin => "sin",
            Self::Tanh => "tanh",
            Self::Asin => "asin",
            Self::Floor => "floor",
            Self::AddScalar(_) => "add_scalar",
            Self::MulScalar(_) => "mul_scalar",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum KernelError {
    ShapeMismatch { lhs: Vec<usize>, rhs: Vec<usize> },
    DeviceMismatch { lhs: String, rhs: String },
    Storage(DenseTensorError),
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShapeMismatch { lhs, rhs } => {
                write!(f, "shape mismatch: lhs={lhs:?}, rhs={rhs:?}")
            }
            Self::DeviceMismatch { lhs, rhs } => {
                write!(f, "device mismatch: lhs={lhs}, rhs={rhs}")
            }
            Self::Storage(error) => write!(f, "kernel output storage: {error}"),
        }
    }
}

impl std::error::Error for KernelError {}

impl From<DenseTensorError> for KernelError {
    fn from(value: DenseTensorError) -> Self {
        Self::Storage(value)
    }
}

fn ensure_meta_compatible(lhs: &TensorMeta, rhs: &TensorMeta) -> Result<(), KernelError> {
    if lhs.device() != rhs.device() {
        return Err(KernelError::DeviceMismatch {
            lhs: format!("{:?}", lhs.device()),
            rhs: format!("{:?}", rhs.device()),
        });
    }

    if lhs.shape() != rhs.shape() {
        return Err(KernelError::ShapeMismatch {
            lhs: lhs.shape().to_vec(),
            rhs: rhs.shape().to_vec(),
        });
    }

    Ok(())
}

fn elementwise_contiguous_f64<F>(lhs: &[f64], rhs: &[f64], op: F) -> Vec<f64>
where
    F: Fn(f64, f64) -> f64,
{
    lhs.iter()
        .zip(rhs.iter())
        .map(|(left, right)| op(*left, *right))
        .collect()
}

pub fn binary_tensor(
    op: BinaryOp,
    lhs: &DenseTensor,
    rhs: &DenseTensor,
) -> Result<DenseTensor, KernelError> {
    ensure_meta_compatible(lhs.meta(), rhs.meta())?;
    let values = elementwise_contiguous_f64(lhs.values(), rhs.values(), |left, right| {
        op.apply(left, right)
    });
    Ok(lhs.with_values(values)?)
}

#[must_use]
pub fn unary_tensor(op: UnaryOp, input: &DenseTensor) -> DenseTensor {
    input.map(|value| op.apply(value))
}

#[must_use]
pub fn sum_tensor(input: &DenseTensor) -> DenseTensor {
    DenseTensor::scalar(input.values().iter().sum())
}

#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;

use vi_core::DenseTensor;
use vi_kernel_cpu::{BinaryOp, KernelError, UnaryOp, binary_tensor, sum_tensor, unary_tensor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorNodeId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq)]
enum NodeOp {
    Leaf,
    Unary { op: UnaryOp, input: TensorNodeId },
    Binary {
        op: BinaryOp,
        lhs: TensorNodeId,
        rhs: TensorNodeId,
    },
    Sum { input: TensorNodeId },
}

impl NodeOp {
    fn inputs(self) -> [Option<TensorNodeId>; 2] {
        match self {
            Self::Leaf => [None, None],
            Self::Unary { input, .. } | Self::Sum { input } => [Some(input), None],
            Self::Binary { lhs, rhs, .. } => [Some(lhs), Some(rhs)],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Node {
    tensor: DenseTensor,
    requires_grad: bool,
    op: NodeOp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerTelemetry {
    pub execution_order: Vec<TensorNodeId>,
    pub max_queue_len: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ReadyTask {
    node: TensorNodeId,
}

impl Ord for ReadyTask {
    fn cmp(&self, other: &Self) -> Ordering {
        self.node.0.cmp(&other.node.0)
    }
}

impl PartialOrd for ReadyTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct ReadyQueue {
    heap: BinaryHeap<ReadyTask>,
    max_len: usize,
}

impl ReadyQueue {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(capacity),
            max_len: 0,
        }
    }

    fn push(&mut self, node: TensorNodeId) {
        self.heap.push(ReadyTask { node });
        self.max_len = self.max_len.max(self.heap.len());
    }

    fn pop(&mut self) -> Option<TensorNodeId> {
        self.heap.pop().map(|task| task.node)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TensorBackwardReport {
    gradients: Vec<Option<Vec<f64>>>,
    pub telemetry: SchedulerTelemetry,
}

impl TensorBackwardReport {
    #[must_use]
    pub fn gradient(&self, node: TensorNodeId) -> Option<&[f64]> {
        self.gradients.get(node.0).and_then(|grad| grad.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AutogradError {
    UnknownNode(TensorNodeId),
    Kernel(KernelError),
    /// The backward root has no gradient path to any leaf.
    RootDoesNotRequireGrad { node: TensorNodeId },
    DependencyUnderflow { node: TensorNodeId },
    GradientShapeMismatch {
        node: TensorNodeId,
        expected: usize,
        actual: usize,
    },
}

impl fmt::Display for AutogradError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownNode(node) => write!(f, "unknown tensor node id {}", node.0),
            Self::Kernel(error) => write!(f, "kernel failure: {error}"),
            Self::RootDoesNotRequireGrad { node } => write!(
                f,
                "backward root {} does not require grad and has no grad_fn",
                node.0
            ),
            Self::DependencyUnderflow { node } => {
                write!(f, "dependency scheduler underflow at node {}", node.0)
            }
            Self::GradientShapeMismatch {
                node,
                expected,
                actual,
            } => write!(
                f,
                "gradient length mismatch at node {}: expected={expected} actual={actual}",
                node.0
            ),
        }
    }
}

impl std::error::Error for AutogradError {}

impl From<KernelError> for AutogradError {
    fn from(value: KernelError) -> Self {
        Self::Kernel(value)
    }
}

/// Reverse-mode tape over dense tensors. Node ids are assigned in creation
/// order, so every op's inputs have smaller ids than the op itself.
#[derive(Debug, Clone, Default)]
pub struct TensorTape {
    nodes: Vec<Node>,
}

impl TensorTape {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn leaf(&mut self, tensor: DenseTensor, requires_grad: bool) -> TensorNodeId {
        self.push(Node {
            tensor,
            requires_grad,
            op: NodeOp::Leaf,
        })
    }

    pub fn tensor(&self, node: TensorNodeId) -> Result<&DenseTensor, AutogradError> {
        Ok(&self.node(node)?.tensor)
    }

    pub fn requires_grad(&self, node: TensorNodeId) -> Result<bool, AutogradError> {
        Ok(self.node(node)?.requires_grad)
    }

    pub fn unary(
        &mut self,
        op: UnaryOp,
        input: TensorNodeId,
    ) -> Result<TensorNodeId, AutogradError> {
        let input_node = self.node(input)?;
        let tensor = unary_tensor(op, &input_node.tensor);
        let requires_grad = input_node.requires_grad && op.is_differentiable();
        Ok(self.push(Node {
            tensor,
            requires_grad,
            op: NodeOp::Unary { op, input },
        }))
    }

    pub fn binary(
        &mut self,
        op: BinaryOp,
        lhs: TensorNodeId,
        rhs: TensorNodeId,
    ) -> Result<TensorNodeId, AutogradError> {
        let (tensor, requires_grad) = {
            let lhs_node = self.node(lhs)?;
            let rhs_node = self.node(rhs)?;
            let tensor = binary_tensor(op, &lhs_node.tensor, &rhs_node.tensor)?;
            (tensor, lhs_node.requires_grad || rhs_node.requires_grad)
        };
        Ok(self.push(Node {
            tensor,
            requires_grad,
            op: NodeOp::Binary { op, lhs, rhs },
        }))
    }

    pub fn add(
        &mut self,
        lhs: TensorNodeId,
        rhs: TensorNodeId,
    ) -> Result<TensorNodeId, AutogradError> {
        self.binary(BinaryOp::Add, lhs, rhs)
    }

    pub fn sum(&mut self, input: TensorNodeId) -> Result<TensorNodeId, AutogradError> {
        let input_node = self.node(input)?;
        let tensor = sum_tensor(&input_node.tensor);
        let requires_grad = input_node.requires_grad;
        Ok(self.push(Node {
            tensor,
            requires_grad,
            op: NodeOp::Sum { input },
        }))
    }

    /// Backpropagates from `root`, seeding its gradient with ones.
    pub fn backward(&self, root: TensorNodeId) -> Result<TensorBackwardReport, AutogradError> {
        let root_node = self.node(root)?;
        if !root_node.requires_grad {
            return Err(AutogradError::RootDoesNotRequireGrad { node: root });
        }

        let reachable = self.compute_reachable(root)?;
        let mut pending = self.compute_dependencies(&reachable);

        let mut grads: Vec<Option<Vec<f64>>> = vec![None; self.nodes.len()];
        grads[root.0] = Some(vec![1.0; root_node.tensor.numel()]);

        let mut queue = ReadyQueue::with_capacity(self.nodes.len().max(1));
        queue.push(root);
        let mut execution_order = Vec::with_capacity(self.nodes.len());

        while let Some(node_id) = queue.pop() {
            execution_order.push(node_id);
            let node = &self.nodes[node_id.0];
            let incoming = grads[node_id.0]
                .clone()
                .unwrap_or_else(|| vec![0.0; node.tensor.numel()]);

            match node.op {
                NodeOp::Leaf => {}
                NodeOp::Unary { op, input } => {
                    let x = self.nodes[input.0].tensor.values();
                    let y = node.tensor.values();
                    let local: Vec<f64> = incoming
                        .iter()
                        .zip(x.iter().zip(y.iter()))
                        .map(|(g, (x, y))| g * unary_derivative(op, *x, *y))
                        .collect();
                    self.propagate(input, local, &mut grads, &mut pending, &mut queue)?;
                }
                NodeOp::Binary { op, lhs, rhs } => {
                    let a = self.nodes[lhs.0].tensor.values();
                    let b = self.nodes[rhs.0].tensor.values();
                    let mut lhs_grad = Vec::with_capacity(incoming.len());
                    let mut rhs_grad = Vec::with_capacity(incoming.len());
                    for ((g, a), b) in incoming.iter().zip(a.iter()).zip(b.iter()) {
                        let (da, db) = binary_derivative(op, *a, *b);
                        lhs_grad.push(g * da);
                        rhs_grad.push(g * db);
                    }
                    self.propagate(lhs, lhs_grad, &mut grads, &mut pending, &mut queue)?;
                    self.propagate(rhs, rhs_grad, &mut grads, &mut pending, &mut queue)?;
                }
                NodeOp::Sum { input } => {
                    let upstream = incoming.first().copied().unwrap_or(0.0);
                    let local = vec![upstream; self.nodes[input.0].tensor.numel()];
                    self.propagate(input, local, &mut grads, &mut pending, &mut queue)?;
                }
            }
        }

        let gradients = grads
            .into_iter()
            .enumerate()
            .map(|(idx, grad)| {
                let node = &self.nodes[idx];
                if node.requires_grad && matches!(node.op, NodeOp::Leaf) {
                    grad
                } else {
                    None
                }
            })
            .collect();

        Ok(TensorBackwardReport {
            gradients,
            telemetry: SchedulerTelemetry {
                execution_order,
                max_queue_len: queue.max_len,
            },
        })
    }

    fn propagate(
        &self,
        target: TensorNodeId,
        local: Vec<f64>,
        grads: &mut [Option<Vec<f64>>],
        pending: &mut [usize],
        queue: &mut ReadyQueue,
    ) -> Result<(), AutogradError> {
        if !self.nodes[target.0].requires_grad {
            return Ok(());
        }

        let expected = self.nodes[target.0].tensor.numel();
        if local.len() != expected {
            return Err(AutogradError::GradientShapeMismatch {
                node: target,
                expected,
                actual: local.len(),
            });
        }

        match grads[target.0].as_mut() {
            Some(existing) => {
                for (acc, value) in existing.iter_mut().zip(local) {
                    *acc += value;
                }
            }
            None => grads[target.0] = Some(local),
        }

        Self::complete_dependency(pending, target, queue)
    }

    fn compute_reachable(&self, root: TensorNodeId) -> Result<Vec<bool>, AutogradError> {
        let mut reachable = vec![false; self.nodes.len()];
        let mut stack = vec![root];

        while let Some(node) = stack.pop() {
            if node.0 >= self.nodes.len() {
                return Err(AutogradError::UnknownNode(node));
            }
            if reachable[node.0] {
                continue;
            }
            reachable[node.0] = true;

            for input in self.nodes[node.0].op.inputs().into_iter().flatten() {
                if self.nodes[input.0].requires_grad {
                    stack.push(input);
                }
            }
        }

        Ok(reachable)
    }

    fn compute_dependencies(&self, reachable: &[bool]) -> Vec<usize> {
        let mut pending = vec![0usize; self.nodes.len()];

        for (idx, node) in self.nodes.iter().enumerate() {
            if !reachable[idx] {
                continue;
            }
            for input in node.op.inputs().into_iter().flatten() {
                if self.nodes[input.0].requires_grad {
                    pending[input.0] = pending[input.0].saturating_add(1);
                }
            }
        }

        pending
    }

    fn complete_dependency(
        pending: &mut [usize],
        node: TensorNodeId,
        queue: &mut ReadyQueue,
    ) -> Result<(), AutogradError> {
        if pending[node.0] == 0 {
            return Err(AutogradError::DependencyUnderflow { node });
        }
        pending[node.0] -= 1;
        if pending[node.0] == 0 {
            queue.push(node);
        }
        Ok(())
    }

    fn push(&mut self, node: Node) -> TensorNodeId {
        let id = TensorNodeId(self.nodes.len());
        self.nodes.push(node);
        id
    }

    fn node(&self, id: TensorNodeId) -> Result<&Node, AutogradError> {
        self.nodes.get(id.0).ok_or(AutogradError::UnknownNode(id))
    }
}

fn unary_derivative(op: UnaryOp, x: f64, y: f64) -> f64 {
    match op {
        UnaryOp::Neg => -1.0,
        UnaryOp::Abs => {
            if x > 0.0 {
                1.0
            } else if x < 0.0 {
                -1.0
            } else {
                0.0
            }
        }
        UnaryOp::Relu => {
            if x > 0.0 {
                1.0
            } else {
                0.0
            }
        }
        UnaryOp::Exp => y,
        UnaryOp::Log => 1.0 / x,
        UnaryOp::Sqrt => 0.5 / y,
        UnaryOp::Sin => x.cos(),
        UnaryOp::Tanh => 1.0 - y * y,
        UnaryOp::Asin => 1.0 / (1.0 - x * x).sqrt(),
        UnaryOp::Floor => 0.0,
        UnaryOp::AddScalar(_) => 1.0,
        UnaryOp::MulScalar(scalar) => scalar,
    }
}

fn binary_derivative(op: BinaryOp, a: f64, b: f64) -> (f64, f64) {
    match op {
        BinaryOp::Add => (1.0, 1.0),
        BinaryOp::Sub => (1.0, -1.0),
        BinaryOp::Mul => (b, a),
        BinaryOp::Div => (1.0 / b, -a / (b * b)),
    }
}

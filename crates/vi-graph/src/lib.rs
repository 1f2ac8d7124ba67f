#![forbid(unsafe_code)]

//! Executable-graph contracts used by the input-search strategies, plus a
//! small reference backend: random elementwise operator DAGs evaluated on the
//! autograd tape.
//!
//! The reference backend keeps every tensor at the generator's `min_dims`
//! shape, so there is no shape solving or broadcasting anywhere in it.

use std::fmt;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, trace, warn};
use vi_autograd::{AutogradError, TensorNodeId, TensorTape};
use vi_core::{DenseTensor, Device};
use vi_kernel_cpu::{BinaryOp, UnaryOp};
use vi_optim::{Adam, OptimError, Optimizer};

/// Result of one forward evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub outputs: Vec<DenseTensor>,
    /// Only meaningful while intermediate checking is enabled; always `false`
    /// otherwise.
    pub had_invalid_intermediate: bool,
    pub first_invalid: Option<usize>,
}

impl Evaluation {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.had_invalid_intermediate
    }
}

/// Outcome of a gradient-guided refinement starting from one candidate.
#[derive(Debug, Clone, PartialEq)]
pub enum GradientSearch {
    /// A nearby assignment that evaluates without invalid intermediates.
    Converged(Vec<DenseTensor>),
    NotFound,
    /// Some operator on the offending path does not propagate gradients.
    Unsupported,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GraphError {
    InputArity {
        expected: usize,
        actual: usize,
    },
    InputShape {
        slot: usize,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    UnknownValue {
        value: usize,
        available: usize,
    },
    Autograd(AutogradError),
    Optim(OptimError),
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InputArity { expected, actual } => {
                write!(f, "graph expects {expected} inputs, got {actual}")
            }
            Self::InputShape {
                slot,
                expected,
                actual,
            } => write!(
                f,
                "input slot {slot} expects shape {expected:?}, got {actual:?}"
            ),
            Self::UnknownValue { value, available } => write!(
                f,
                "operand refers to value {value} but only {available} values exist"
            ),
            Self::Autograd(error) => write!(f, "autograd failure: {error}"),
            Self::Optim(error) => write!(f, "optimizer failure: {error}"),
        }
    }
}

impl std::error::Error for GraphError {}

impl From<AutogradError> for GraphError {
    fn from(value: AutogradError) -> Self {
        Self::Autograd(value)
    }
}

impl From<OptimError> for GraphError {
    fn from(value: OptimError) -> Self {
        Self::Optim(value)
    }
}

/// A graph the search strategies can evaluate.
pub trait ExecutableGraph {
    fn input_shapes(&self) -> Vec<Vec<usize>>;

    /// Total node count, input placeholders included.
    fn node_count(&self) -> usize;

    fn check_intermediate(&self) -> bool;

    fn set_check_intermediate(&mut self, enabled: bool);

    /// Plain evaluation without gradient tracking.
    fn forward(&mut self, inputs: &[DenseTensor]) -> Result<Evaluation, GraphError>;

    fn gradient_search(
        &mut self,
        initial: &[DenseTensor],
        device: Device,
    ) -> Result<GradientSearch, GraphError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub seed: u32,
    pub max_nodes: usize,
    pub min_dims: Vec<usize>,
    pub use_bitvec: bool,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GeneratorError {
    InvalidRequest(String),
    Timeout { seed: u32, budget: Duration },
    Graph(GraphError),
}

impl fmt::Display for GeneratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidRequest(reason) => write!(f, "invalid generation request: {reason}"),
            Self::Timeout { seed, budget } => write!(
                f,
                "graph generation for seed {seed} exceeded its {}ms budget",
                budget.as_millis()
            ),
            Self::Graph(error) => write!(f, "generated graph is malformed: {error}"),
        }
    }
}

impl std::error::Error for GeneratorError {}

impl From<GraphError> for GeneratorError {
    fn from(value: GraphError) -> Self {
        Self::Graph(value)
    }
}

/// Source of executable graphs. Must be deterministic for a fixed seed.
pub trait GraphGenerator {
    type Graph: ExecutableGraph;

    fn generate(&mut self, request: &GenerationRequest) -> Result<Self::Graph, GeneratorError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpKind {
    Unary(UnaryOp, ValueId),
    Binary(BinaryOp, ValueId, ValueId),
}

impl OpKind {
    fn operands(self) -> [Option<ValueId>; 2] {
        match self {
            Self::Unary(_, input) => [Some(input), None],
            Self::Binary(_, lhs, rhs) => [Some(lhs), Some(rhs)],
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Unary(op, _) => op.name(),
            Self::Binary(op, _, _) => op.name(),
        }
    }
}

/// Elementwise operator DAG. Values `0..inputs` are the input slots, value
/// `inputs + k` is the output of op `k`; ops only refer to earlier values.
#[derive(Debug, Clone, PartialEq)]
pub struct OpGraph {
    input_shapes: Vec<Vec<usize>>,
    ops: Vec<OpKind>,
}

impl OpGraph {
    #[must_use]
    pub fn new(input_shapes: Vec<Vec<usize>>) -> Self {
        Self {
            input_shapes,
            ops: Vec::new(),
        }
    }

    pub fn push(&mut self, op: OpKind) -> Result<ValueId, GraphError> {
        let available = self.value_count();
        for operand in op.operands().into_iter().flatten() {
            if operand.0 >= available {
                return Err(GraphError::UnknownValue {
                    value: operand.0,
                    available,
                });
            }
        }
        self.ops.push(op);
        Ok(ValueId(available))
    }

    pub fn unary(&mut self, op: UnaryOp, input: ValueId) -> Result<ValueId, GraphError> {
        self.push(OpKind::Unary(op, input))
    }

    pub fn binary(
        &mut self,
        op: BinaryOp,
        lhs: ValueId,
        rhs: ValueId,
    ) -> Result<ValueId, GraphError> {
        self.push(OpKind::Binary(op, lhs, rhs))
    }

    #[must_use]
    pub fn input(&self, slot: usize) -> ValueId {
        ValueId(slot)
    }

    #[must_use]
    pub fn input_shapes(&self) -> &[Vec<usize>] {
        &self.input_shapes
    }

    #[must_use]
    pub fn ops(&self) -> &[OpKind] {
        &self.ops
    }

    #[must_use]
    pub fn value_count(&self) -> usize {
        self.input_shapes.len() + self.ops.len()
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.value_count()
    }

    /// Values no op consumes. Inputs count only when the graph has no ops.
    #[must_use]
    pub fn outputs(&self) -> Vec<ValueId> {
        if self.ops.is_empty() {
            return (0..self.input_shapes.len()).map(ValueId).collect();
        }
        let mut consumed = vec![false; self.value_count()];
        for op in &self.ops {
            for operand in op.operands().into_iter().flatten() {
                consumed[operand.0] = true;
            }
        }
        (self.input_shapes.len()..self.value_count())
            .filter(|idx| !consumed[*idx])
            .map(ValueId)
            .collect()
    }
}

impl fmt::Display for OpGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (slot, shape) in self.input_shapes.iter().enumerate() {
            writeln!(f, "%{slot} = input{shape:?}")?;
        }
        let base = self.input_shapes.len();
        for (idx, op) in self.ops.iter().enumerate() {
            let operands = op
                .operands()
                .into_iter()
                .flatten()
                .map(|value| format!("%{}", value.0))
                .collect::<Vec<_>>()
                .join(", ");
            writeln!(f, "%{} = {}({operands})", base + idx, op.name())?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GradientSearchConfig {
    pub max_steps: usize,
    pub lr: f64,
    /// Distance kept from an open domain boundary (log, division).
    pub domain_margin: f64,
    /// Inputs to `exp` above this overflow f64.
    pub exp_limit: f64,
    /// Operand magnitude considered on the way to overflow.
    pub magnitude_limit: f64,
}

impl Default for GradientSearchConfig {
    fn default() -> Self {
        Self {
            max_steps: 64,
            lr: 0.5,
            domain_margin: 1e-3,
            exp_limit: 700.0,
            magnitude_limit: 1e100,
        }
    }
}

struct Recording {
    tape: TensorTape,
    leaves: Vec<TensorNodeId>,
    values: Vec<TensorNodeId>,
    first_invalid: Option<usize>,
    any_invalid: bool,
}

/// Tape-backed interpreter for an [`OpGraph`].
#[derive(Debug, Clone)]
pub struct GraphInterpreter {
    graph: OpGraph,
    check_intermediate: bool,
    search: GradientSearchConfig,
}

impl GraphInterpreter {
    #[must_use]
    pub fn new(graph: OpGraph, search: GradientSearchConfig) -> Self {
        Self {
            graph,
            check_intermediate: false,
            search,
        }
    }

    #[must_use]
    pub fn graph(&self) -> &OpGraph {
        &self.graph
    }

    fn validate_inputs(&self, inputs: &[DenseTensor]) -> Result<(), GraphError> {
        let expected = self.graph.input_shapes();
        if inputs.len() != expected.len() {
            return Err(GraphError::InputArity {
                expected: expected.len(),
                actual: inputs.len(),
            });
        }
        for (slot, (tensor, shape)) in inputs.iter().zip(expected.iter()).enumerate() {
            if tensor.shape() != shape.as_slice() {
                return Err(GraphError::InputShape {
                    slot,
                    expected: shape.clone(),
                    actual: tensor.shape().to_vec(),
                });
            }
        }
        Ok(())
    }

    fn record(&self, inputs: &[DenseTensor], requires_grad: bool) -> Result<Recording, GraphError> {
        self.validate_inputs(inputs)?;
        let mut tape = TensorTape::new();
        let leaves: Vec<TensorNodeId> = inputs
            .iter()
            .map(|tensor| tape.leaf(tensor.to_device(Device::Cpu), requires_grad))
            .collect();
        let mut values = leaves.clone();
        let mut first_invalid = None;
        let mut any_invalid = false;

        for (idx, op) in self.graph.ops().iter().enumerate() {
            let out = match *op {
                OpKind::Unary(op, input) => tape.unary(op, values[input.0])?,
                OpKind::Binary(op, lhs, rhs) => tape.binary(op, values[lhs.0], values[rhs.0])?,
            };
            if tape.tensor(out)?.has_invalid() {
                any_invalid = true;
                first_invalid.get_or_insert(idx);
            }
            values.push(out);
        }

        Ok(Recording {
            tape,
            leaves,
            values,
            first_invalid,
            any_invalid,
        })
    }

    /// Builds a scalar loss that is positive while op `idx` is out of its
    /// valid domain and zero once it is back inside.
    fn domain_loss(
        &self,
        run: &mut Recording,
        idx: usize,
    ) -> Result<TensorNodeId, GraphError> {
        let cfg = &self.search;
        let tape = &mut run.tape;
        let operand = |value: ValueId| run.values[value.0];

        let violation = match self.graph.ops()[idx] {
            // relu(margin - x)
            OpKind::Unary(UnaryOp::Log | UnaryOp::Sqrt, input) => {
                let neg = tape.unary(UnaryOp::Neg, operand(input))?;
                let shifted = tape.unary(UnaryOp::AddScalar(cfg.domain_margin), neg)?;
                tape.unary(UnaryOp::Relu, shifted)?
            }
            // relu(|x| - (1 - margin))
            OpKind::Unary(UnaryOp::Asin, input) => {
                let abs = tape.unary(UnaryOp::Abs, operand(input))?;
                let shifted = tape.unary(UnaryOp::AddScalar(cfg.domain_margin - 1.0), abs)?;
                tape.unary(UnaryOp::Relu, shifted)?
            }
            // relu(x - exp_limit)
            OpKind::Unary(UnaryOp::Exp, input) => {
                let shifted = tape.unary(UnaryOp::AddScalar(-cfg.exp_limit), operand(input))?;
                tape.unary(UnaryOp::Relu, shifted)?
            }
            // relu(margin - rhs); one-sided so a zero divisor still has a slope
            OpKind::Binary(BinaryOp::Div, _, rhs) => {
                let neg = tape.unary(UnaryOp::Neg, operand(rhs))?;
                let shifted = tape.unary(UnaryOp::AddScalar(cfg.domain_margin), neg)?;
                tape.unary(UnaryOp::Relu, shifted)?
            }
            op => {
                let mut total: Option<TensorNodeId> = None;
                for value in op.operands().into_iter().flatten() {
                    let abs = tape.unary(UnaryOp::Abs, operand(value))?;
                    let shifted = tape.unary(UnaryOp::AddScalar(-cfg.magnitude_limit), abs)?;
                    let excess = tape.unary(UnaryOp::Relu, shifted)?;
                    total = Some(match total {
                        Some(acc) => tape.add(acc, excess)?,
                        None => excess,
                    });
                }
                let Some(total) = total else {
                    return Err(GraphError::UnknownValue {
                        value: idx,
                        available: self.graph.value_count(),
                    });
                };
                total
            }
        };

        Ok(tape.sum(violation)?)
    }
}

impl ExecutableGraph for GraphInterpreter {
    fn input_shapes(&self) -> Vec<Vec<usize>> {
        self.graph.input_shapes().to_vec()
    }

    fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    fn check_intermediate(&self) -> bool {
        self.check_intermediate
    }

    fn set_check_intermediate(&mut self, enabled: bool) {
        self.check_intermediate = enabled;
    }

    fn forward(&mut self, inputs: &[DenseTensor]) -> Result<Evaluation, GraphError> {
        let run = self.record(inputs, false)?;
        let outputs = self
            .graph
            .outputs()
            .into_iter()
            .map(|value| run.tape.tensor(run.values[value.0]).cloned())
            .collect::<Result<Vec<_>, _>>()?;

        let (had_invalid_intermediate, first_invalid) = if self.check_intermediate {
            (run.any_invalid, run.first_invalid)
        } else {
            (false, None)
        };
        Ok(Evaluation {
            outputs,
            had_invalid_intermediate,
            first_invalid,
        })
    }

    fn gradient_search(
        &mut self,
        initial: &[DenseTensor],
        device: Device,
    ) -> Result<GradientSearch, GraphError> {
        if device == Device::Cuda {
            warn!("cuda requested; the reference interpreter runs on cpu");
        }
        self.validate_inputs(initial)?;

        let mut params: Vec<DenseTensor> = initial
            .iter()
            .map(|tensor| tensor.to_device(Device::Cpu))
            .collect();
        let mut optimizer = Adam::new(params.len(), self.search.lr);

        for step in 0..self.search.max_steps {
            let mut run = self.record(&params, true)?;
            let Some(idx) = run.first_invalid else {
                debug!(step, "gradient search converged");
                return Ok(GradientSearch::Converged(params));
            };

            let loss = self.domain_loss(&mut run, idx)?;
            let report = match run.tape.backward(loss) {
                Ok(report) => report,
                Err(AutogradError::RootDoesNotRequireGrad { .. }) => {
                    debug!(step, op = idx, "offending op has no gradient path");
                    return Ok(GradientSearch::Unsupported);
                }
                Err(error) => return Err(error.into()),
            };
            trace!(
                step,
                op = idx,
                loss = run.tape.tensor(loss)?.values()[0],
                backward_nodes = report.telemetry.execution_order.len(),
                max_ready = report.telemetry.max_queue_len,
                "gradient search step"
            );

            // Non-finite gradient entries are dropped rather than fed to Adam.
            let grads: Vec<Option<Vec<f64>>> = run
                .leaves
                .iter()
                .map(|leaf| {
                    report.gradient(*leaf).map(|grad| {
                        grad.iter()
                            .map(|g| if g.is_finite() { *g } else { 0.0 })
                            .collect()
                    })
                })
                .collect();
            let stalled = grads
                .iter()
                .flatten()
                .all(|grad| grad.iter().all(|g| *g == 0.0));
            if stalled {
                debug!(step, op = idx, "gradient vanished");
                return Ok(GradientSearch::NotFound);
            }

            let views: Vec<Option<&[f64]>> = grads.iter().map(Option::as_deref).collect();
            optimizer.step(&mut params, &views)?;
        }

        if self.record(&params, false)?.first_invalid.is_none() {
            return Ok(GradientSearch::Converged(params));
        }
        Ok(GradientSearch::NotFound)
    }
}

/// Probability that a generated op is the non-differentiable `floor`.
const NON_DIFFERENTIABLE_RATE: f64 = 0.03;
const MAX_INPUTS: usize = 3;

/// Seeded generator of random elementwise graphs over `min_dims`-shaped
/// inputs. `use_bitvec` has no meaning here and is ignored.
#[derive(Debug, Clone, Default)]
pub struct RandomGraphGenerator {
    search: GradientSearchConfig,
}

impl RandomGraphGenerator {
    #[must_use]
    pub fn new(search: GradientSearchConfig) -> Self {
        Self { search }
    }

    pub fn generate_graph(&self, request: &GenerationRequest) -> Result<OpGraph, GeneratorError> {
        if request.max_nodes < 2 {
            return Err(GeneratorError::InvalidRequest(format!(
                "max_nodes must be at least 2, got {}",
                request.max_nodes
            )));
        }
        if request.min_dims.is_empty() || request.min_dims.contains(&0) {
            return Err(GeneratorError::InvalidRequest(format!(
                "min_dims must be non-empty with positive extents, got {:?}",
                request.min_dims
            )));
        }

        let started = Instant::now();
        let mut rng = StdRng::seed_from_u64(u64::from(request.seed));
        let n_inputs = rng.random_range(1..=MAX_INPUTS.min(request.max_nodes - 1));
        let mut graph = OpGraph::new(vec![request.min_dims.clone(); n_inputs]);

        while graph.node_count() < request.max_nodes {
            if started.elapsed() >= request.timeout {
                return Err(GeneratorError::Timeout {
                    seed: request.seed,
                    budget: request.timeout,
                });
            }
            let op = random_op(&mut rng, graph.value_count());
            graph.push(op)?;
        }

        if request.use_bitvec {
            debug!(seed = request.seed, "use_bitvec ignored by the reference generator");
        }
        Ok(graph)
    }
}

impl GraphGenerator for RandomGraphGenerator {
    type Graph = GraphInterpreter;

    fn generate(&mut self, request: &GenerationRequest) -> Result<Self::Graph, GeneratorError> {
        let graph = self.generate_graph(request)?;
        trace!(seed = request.seed, "generated graph\n{graph}");
        Ok(GraphInterpreter::new(graph, self.search.clone()))
    }
}

fn random_op(rng: &mut StdRng, value_count: usize) -> OpKind {
    let mut operand = || ValueId(rng.random_range(0..value_count));
    let lhs = operand();
    let rhs = operand();

    if rng.random_bool(NON_DIFFERENTIABLE_RATE) {
        return OpKind::Unary(UnaryOp::Floor, lhs);
    }

    let scalar = rng.random_range(0.5..4.0) * if rng.random_bool(0.5) { 1.0 } else { -1.0 };
    match rng.random_range(0..15) {
        0 => OpKind::Binary(BinaryOp::Add, lhs, rhs),
        1 => OpKind::Binary(BinaryOp::Sub, lhs, rhs),
        2 => OpKind::Binary(BinaryOp::Mul, lhs, rhs),
        3 => OpKind::Binary(BinaryOp::Div, lhs, rhs),
        4 => OpKind::Unary(UnaryOp::Neg, lhs),
        5 => OpKind::Unary(UnaryOp::Abs, lhs),
        6 => OpKind::Unary(UnaryOp::Relu, lhs),
        7 => OpKind::Unary(UnaryOp::Exp, lhs),
        8 => OpKind::Unary(UnaryOp::Log, lhs),
        9 => OpKind::Unary(UnaryOp::Sqrt, lhs),
        10 => OpKind::Unary(UnaryOp::Sin, lhs),
        11 => OpKind::Unary(UnaryOp::Tanh, lhs),
        12 => OpKind::Unary(UnaryOp::Asin, lhs),
        13 => OpKind::Unary(UnaryOp::AddScalar(scalar), lhs),
        _ => OpKind::Unary(UnaryOp::MulScalar(scalar), lhs),
    }
}

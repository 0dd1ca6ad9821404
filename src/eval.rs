use std::fmt;
use std::time::{Duration, Instant};

use itertools::Itertools;
use log::{debug, warn};

use crate::bucket::in_rollout;
use crate::expr::Expr;
use crate::flag::FlagKey;
use crate::store::Store;

const DEFAULT_MAX_DEPTH: usize = 64;
const PREALLOCATED_FLAG_CHAIN_SIZE: usize = 20;

/// Error is returned when a flag could not be evaluated.
///
/// Every error aborts the whole evaluation: there is no partial result, and a failed evaluation is
/// never reported as `false`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// NotFound indicates that the store holds no flag with this namespace and name.
    NotFound(FlagKey),
    /// StorageUnavailable indicates that the store could not be reached or failed internally.
    StorageUnavailable(String),
    /// MalformedExpression indicates that a stored or supplied expression could not be decoded.
    MalformedExpression(String),
    /// UnrecognizedVariant indicates that evaluation reached an expression node whose type this
    /// evaluator does not know.
    UnrecognizedVariant(String),
    /// CycleDetected indicates that following `ref` nodes led back to a flag that was already
    /// being evaluated. The chain starts at the outermost flag and ends with the repeated one.
    CycleDetected(Vec<FlagKey>),
    /// DepthExceeded indicates that `ref` nodes nested deeper than the configured limit.
    DepthExceeded(usize),
    /// DeadlineExceeded indicates that the evaluation ran past its configured timeout.
    DeadlineExceeded,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotFound(key) => write!(f, "flag {} not found", key),
            Error::StorageUnavailable(reason) => write!(f, "flag storage unavailable: {}", reason),
            Error::MalformedExpression(reason) => write!(f, "malformed flag expression: {}", reason),
            Error::UnrecognizedVariant(kind) if kind.is_empty() => {
                write!(f, "unrecognized expression kind: missing type")
            }
            Error::UnrecognizedVariant(kind) => {
                write!(f, "unrecognized expression kind {:?}", kind)
            }
            Error::CycleDetected(chain) => {
                write!(f, "flag reference cycle: {}", chain.iter().join(" -> "))
            }
            Error::DepthExceeded(limit) => {
                write!(f, "flag references nested deeper than {} levels", limit)
            }
            Error::DeadlineExceeded => write!(f, "flag evaluation deadline exceeded"),
        }
    }
}

impl std::error::Error for Error {}

/// RefResolution decides which flag a `ref` node points at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefResolution {
    /// The referenced string names a flag in the namespace of the flag being evaluated, and that
    /// flag is evaluated for the same identity value.
    SameNamespace,
    /// The referenced string names a namespace; the identity value is used as the flag name, and
    /// the referenced flag is evaluated for an empty identity value. This is how the first
    /// generation of the evaluator behaved, and flags written against it may depend on it.
    Legacy,
}

impl Default for RefResolution {
    #[cfg(not(feature = "legacy_ref_resolution"))]
    fn default() -> Self {
        RefResolution::SameNamespace
    }

    #[cfg(feature = "legacy_ref_resolution")]
    fn default() -> Self {
        RefResolution::Legacy
    }
}

/// Configuration for an [Evaluator].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EvaluatorOptions {
    ref_resolution: RefResolution,
    max_depth: usize,
    timeout: Option<Duration>,
}

impl Default for EvaluatorOptions {
    fn default() -> Self {
        EvaluatorOptions {
            ref_resolution: RefResolution::default(),
            max_depth: DEFAULT_MAX_DEPTH,
            timeout: None,
        }
    }
}

impl EvaluatorOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ref_resolution(mut self, ref_resolution: RefResolution) -> Self {
        self.ref_resolution = ref_resolution;
        self
    }

    /// The longest chain of flags, counting the flag being evaluated, that `ref` nodes may build
    /// before evaluation fails with [Error::DepthExceeded].
    pub fn max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Bounds the wall-clock time of a single evaluation. The deadline is checked before every
    /// store lookup, so a lookup already in flight is not interrupted.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn get_ref_resolution(&self) -> RefResolution {
        self.ref_resolution
    }

    pub fn get_max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn get_timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

// Per-call state threaded through the recursive walk.
pub(crate) struct EvaluationStack {
    pub(crate) flag_chain: Vec<FlagKey>,
    deadline: Option<Instant>,
}

impl EvaluationStack {
    fn new(timeout: Option<Duration>) -> Self {
        Self {
            flag_chain: Vec::with_capacity(PREALLOCATED_FLAG_CHAIN_SIZE),
            deadline: timeout.and_then(|timeout| Instant::now().checked_add(timeout)),
        }
    }

    fn check_deadline(&self) -> Result<(), Error> {
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(Error::DeadlineExceeded),
            _ => Ok(()),
        }
    }
}

/// Evaluator walks flag expressions for identity values, resolving `ref` nodes through a [Store].
///
/// An evaluator holds no mutable state; each call is independent, and calls may run concurrently
/// as long as the store supports concurrent reads.
pub struct Evaluator<'a> {
    store: &'a dyn Store,
    options: EvaluatorOptions,
}

impl<'a> Evaluator<'a> {
    pub fn new(store: &'a dyn Store) -> Self {
        Self::with_options(store, EvaluatorOptions::default())
    }

    pub fn with_options(store: &'a dyn Store, options: EvaluatorOptions) -> Self {
        Evaluator { store, options }
    }

    pub fn options(&self) -> &EvaluatorOptions {
        &self.options
    }

    /// Looks up the flag `flag_name` in `namespace` and evaluates it for `value`.
    pub fn evaluate(&self, namespace: &str, flag_name: &str, value: &str) -> Result<bool, Error> {
        let mut stack = EvaluationStack::new(self.options.timeout);
        self.evaluate_flag(namespace, flag_name, value, &mut stack)
    }

    /// Evaluates `expr` for `value` as though it were the expression of flag `flag_name` in
    /// `namespace`, without reading that flag from the store. `ref` nodes are still resolved
    /// through the store, and a reference back to `flag_name` is treated as a cycle.
    pub fn evaluate_expr(
        &self,
        expr: &Expr,
        namespace: &str,
        flag_name: &str,
        value: &str,
    ) -> Result<bool, Error> {
        let mut stack = EvaluationStack::new(self.options.timeout);
        stack.flag_chain.push(FlagKey::new(namespace, flag_name));
        self.evaluate_internal(expr, namespace, value, &mut stack)
    }

    fn evaluate_flag(
        &self,
        namespace: &str,
        flag_name: &str,
        value: &str,
        stack: &mut EvaluationStack,
    ) -> Result<bool, Error> {
        stack.check_deadline().map_err(|e| {
            warn!("gave up evaluating {}/{}: {}", namespace, flag_name, e);
            e
        })?;

        let key = FlagKey::new(namespace, flag_name);
        if stack.flag_chain.contains(&key) {
            let mut chain = stack.flag_chain.clone();
            chain.push(key);
            let e = Error::CycleDetected(chain);
            warn!("{}; check recent flag updates", e);
            return Err(e);
        }
        if stack.flag_chain.len() >= self.options.max_depth {
            let e = Error::DepthExceeded(self.options.max_depth);
            warn!("{} while resolving {}", e, key);
            return Err(e);
        }

        debug!("looking up flag {}", key);
        let flag = self.store.flag(namespace, flag_name)?;

        stack.flag_chain.push(key);
        let result = self.evaluate_internal(&flag.expr, namespace, value, stack);
        stack.flag_chain.pop();

        debug!("flag {}/{} evaluated to {:?}", namespace, flag_name, result);
        result
    }

    fn evaluate_internal(
        &self,
        expr: &Expr,
        namespace: &str,
        value: &str,
        stack: &mut EvaluationStack,
    ) -> Result<bool, Error> {
        match expr {
            Expr::Constant(b) => Ok(*b),
            Expr::Percent(fraction) => Ok(in_rollout(value, *fraction)),
            Expr::ValueIn(values) => Ok(values.contains(value)),
            Expr::Not(inner) => self
                .evaluate_internal(inner, namespace, value, stack)
                .map(|b| !b),
            Expr::AllOf(exprs) => {
                for e in exprs {
                    if !self.evaluate_internal(e, namespace, value, stack)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Expr::AnyOf(exprs) => {
                for e in exprs {
                    if self.evaluate_internal(e, namespace, value, stack)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Expr::Ref(target) => match self.options.ref_resolution {
                RefResolution::SameNamespace => self.evaluate_flag(namespace, target, value, stack),
                RefResolution::Legacy => self.evaluate_flag(target, value, "", stack),
            },
            Expr::Unrecognized { kind } => {
                let e = Error::UnrecognizedVariant(kind.clone());
                warn!(
                    "{} in flag {}",
                    e,
                    stack
                        .flag_chain
                        .last()
                        .map(ToString::to_string)
                        .unwrap_or_default()
                );
                Err(e)
            }
        }
    }
}

/// Evaluates the flag `flag_name` in `namespace` for the identity `value` with default options.
///
/// Returns `Ok(true)` or `Ok(false)` for a decision, and an [Error] if any lookup or node along
/// the way failed.
pub fn evaluate(
    store: &dyn Store,
    namespace: &str,
    flag_name: &str,
    value: &str,
) -> Result<bool, Error> {
    Evaluator::new(store).evaluate(namespace, flag_name, value)
}

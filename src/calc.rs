//! The execution contract shared by every engine: jobs in, per-layer
//! results out, plus the error taxonomy engines report through.
//!
//! A [`CalculatorFactory`] turns a layer stack, a fractal kind, and an
//! optional formula into a [`Calculator`].  Callers then drive the
//! calculator through a strict rhythm: `init` once per frame, `submit`
//! for every point, `flush` to force evaluation, `take` until empty,
//! and `end_batch` to mark batch (and finally frame) boundaries.  Every
//! engine honors the same rhythm, whether it computes inline, on a
//! thread pool, on a GPU, or on the far side of a TCP connection.

use std::io;
use std::sync::Arc;

use failure::Fail;
use num::Complex;

use compiled::CompiledFactory;
use kernel::KernelFactory;
use layer::ProcessLayer;
use naive::NaiveFactory;
use remote::RemoteFactory;
use threaded::ThreadedFactory;

/// The iteration rule a run applies to produce each orbit value.
/// Discriminants are the values carried by the network protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FractalKind {
    /// Classic quadratic map, `x^2 + c`.
    Mandel = 1,
    /// Power map `x^p + c`, with the exponent taken from the run
    /// parameter.
    MandelN = 2,
    /// Quadratic map over component magnitudes.
    BurningShip = 4,
    /// Power map over component magnitudes.
    BurningShipN = 8,
    /// User formula, watched for divergence.
    Divergent = 32768,
    /// User formula, watched for convergence; bailout comparisons flip.
    Convergent = 65536,
}

impl FractalKind {
    /// True for every kind whose orbits are expected to escape; the
    /// convergent kind inverts all bailout comparisons instead.
    pub fn is_divergent(self) -> bool {
        self != FractalKind::Convergent
    }

    /// True for the kinds that evaluate a user-supplied formula.
    pub fn uses_formula(self) -> bool {
        self == FractalKind::Divergent || self == FractalKind::Convergent
    }

    /// Maps a protocol discriminant back to a kind.
    pub fn from_code(code: i32) -> Option<FractalKind> {
        match code {
            1 => Some(FractalKind::Mandel),
            2 => Some(FractalKind::MandelN),
            4 => Some(FractalKind::BurningShip),
            8 => Some(FractalKind::BurningShipN),
            32768 => Some(FractalKind::Divergent),
            65536 => Some(FractalKind::Convergent),
            _ => None,
        }
    }
}

/// One step of the classic quadratic map, `x^2 + c`.
pub(crate) fn step_mandel(x: Complex<f64>, c: Complex<f64>) -> Complex<f64> {
    let sx = x.re;
    let sy = x.im;
    Complex::new(sx * sx - sy * sy + c.re, 2.0 * sx * sy + c.im)
}

/// One step of the power map `x^p + c`.
pub(crate) fn step_mandel_n(x: Complex<f64>, c: Complex<f64>, p: f64) -> Complex<f64> {
    x.powf(p) + c
}

/// One step of the burning-ship map: the quadratic map with the mixed
/// term folded to its magnitude.
pub(crate) fn step_burning_ship(x: Complex<f64>, c: Complex<f64>) -> Complex<f64> {
    let sx = x.re;
    let sy = x.im;
    Complex::new(sx * sx - sy * sy + c.re, 2.0 * (sx * sy).abs() + c.im)
}

/// One step of the burning-ship power map, `(|re x| + i |im x|)^p + c`.
pub(crate) fn step_burning_ship_n(x: Complex<f64>, c: Complex<f64>, p: f64) -> Complex<f64> {
    Complex::new(x.re.abs(), x.im.abs()).powf(p) + c
}

/// One point waiting to be evaluated: its pixel address, the orbit's
/// starting value, and the constant fed to the iteration rule.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PointJob {
    /// Pixel column, echoed back untouched in the result.
    pub px: i32,
    /// Pixel row, echoed back untouched in the result.
    pub py: i32,
    /// Starting orbit value.
    pub start: Complex<f64>,
    /// Constant term of the iteration rule.
    pub constant: Complex<f64>,
}

/// The evaluated state of every layer for one point, tagged with the
/// pixel address the caller submitted it under.
#[derive(Clone, Debug, PartialEq)]
pub struct PointResult {
    /// Pixel column from the originating job.
    pub px: i32,
    /// Pixel row from the originating job.
    pub py: i32,
    /// Layer states after the orbit ended, in configuration order.
    pub layers: Vec<ProcessLayer>,
}

/// A configured evaluator for a stream of points.
///
/// Results are self-describing (they carry their pixel address) and may
/// come back in any order, so callers must not assume submission order
/// survives.
pub trait Calculator: Send {
    /// Starts a frame.  `layers` must match the configured templates,
    /// `param` is the free parameter of the iteration rule, and
    /// `expected` hints how many points each batch will carry.
    fn init(&mut self, layers: &[ProcessLayer], param: f64, expected: usize) -> CalcResult<()>;

    /// Queues one point for evaluation.
    fn submit(&mut self, px: i32, py: i32, start: Complex<f64>, constant: Complex<f64>) -> CalcResult<()>;

    /// Forces evaluation of everything submitted since the last flush.
    /// After a successful flush the results are ready for [`Calculator::take`].
    fn flush(&mut self) -> CalcResult<()>;

    /// Hands back one finished result, or `None` when none are ready.
    fn take(&mut self) -> Option<PointResult>;

    /// Marks the end of a batch; `is_final` marks the end of the frame
    /// and releases whatever the engine holds for it.
    fn end_batch(&mut self, is_final: bool) -> CalcResult<()>;
}

/// Builder for [`Calculator`]s.  A factory is stateless and may be
/// shared freely between threads; each call yields an independent
/// calculator.
pub trait CalculatorFactory: Send + Sync {
    /// Validates the layer stack and builds a calculator for it.
    ///
    /// `formula` is only consulted for the formula kinds; `default_layer`
    /// names the layer whose bailout ends each point's evaluation and is
    /// fixed for the calculator's lifetime.
    fn configure(
        &self,
        layers: &[ProcessLayer],
        kind: FractalKind,
        formula: &str,
        default_layer: usize,
    ) -> CalcResult<Box<dyn Calculator>>;
}

/// The closed set of execution engines this crate ships, named by the
/// one-letter codes the binaries accept.
#[derive(Clone, Debug, PartialEq)]
pub enum Engine {
    /// In-process evaluation that consults the layer configuration as
    /// it iterates.
    Naive,
    /// In-process evaluation specialized into per-layer programs when
    /// the engine is configured.
    Compiled,
    /// A generated compute kernel on whatever adapter the host offers.
    Kernel,
    /// A pool of worker threads, each owning a compiled inner engine.
    Threaded(usize),
    /// Remote workers reached over TCP, with points sharded round-robin.
    Remote(Vec<String>),
}

impl Engine {
    /// Looks up an engine by code: `s` naive, `c` compiled, `g` kernel,
    /// `t` threaded, `d` distributed.  `workers` sizes the thread pool
    /// and `peers` lists the distributed workers' addresses; each is
    /// consulted only by the engine that needs it.
    pub fn from_code(code: &str, workers: usize, peers: &[String]) -> CalcResult<Engine> {
        match code {
            "s" => Ok(Engine::Naive),
            "c" => Ok(Engine::Compiled),
            "g" => Ok(Engine::Kernel),
            "t" => {
                if workers < 1 {
                    return Err(CalcError::config("thread engine needs at least one worker"));
                }
                Ok(Engine::Threaded(workers))
            }
            "d" => {
                if peers.is_empty() {
                    return Err(CalcError::config("distributed engine needs at least one peer"));
                }
                Ok(Engine::Remote(peers.to_vec()))
            }
            other => Err(CalcError::config(format!("unknown engine code {:?}", other))),
        }
    }

    /// Builds the factory for this engine.  The thread pool wraps the
    /// compiled engine, one instance per worker.
    pub fn factory(&self) -> Box<dyn CalculatorFactory> {
        match *self {
            Engine::Naive => Box::new(NaiveFactory),
            Engine::Compiled => Box::new(CompiledFactory),
            Engine::Kernel => Box::new(KernelFactory),
            Engine::Threaded(workers) => {
                Box::new(ThreadedFactory::new(workers, Arc::new(CompiledFactory)))
            }
            Engine::Remote(ref peers) => Box::new(RemoteFactory::new(peers.clone())),
        }
    }
}

/// Everything that can go wrong while configuring or running an engine.
#[derive(Debug, Fail)]
pub enum CalcError {
    /// The layer stack or engine arguments are unusable.
    #[fail(display = "configuration rejected: {}", _0)]
    Config(String),
    /// The iteration formula failed to parse.
    #[fail(display = "formula error at byte {}: {}", pos, msg)]
    Formula {
        /// Byte offset of the offending input.
        pos: usize,
        /// What the parser expected or found.
        msg: String,
    },
    /// A specialized program could not be generated.
    #[fail(display = "program generation failed: {}", _0)]
    CodeGen(String),
    /// The requested configuration is valid but this engine cannot run it.
    #[fail(display = "not supported by this engine: {}", _0)]
    NotImplemented(String),
    /// The compute device rejected a kernel or failed mid-run.
    #[fail(display = "device failure: {}", _0)]
    Device(String),
    /// A remote peer became unreachable.
    #[fail(display = "connection to {} failed: {}", peer, cause)]
    Connection {
        /// Address of the peer that failed.
        peer: String,
        /// The underlying transport error.
        #[fail(cause)]
        cause: io::Error,
    },
    /// The remote side sent something the protocol does not allow.
    #[fail(display = "protocol violation: {}", _0)]
    Protocol(String),
    /// A local read or write failed.
    #[fail(display = "i/o failure: {}", _0)]
    Io(#[fail(cause)] io::Error),
}

impl CalcError {
    /// Builds a [`CalcError::Config`].
    pub fn config<S: Into<String>>(msg: S) -> CalcError {
        CalcError::Config(msg.into())
    }

    /// Builds a [`CalcError::Formula`].
    pub fn formula<S: Into<String>>(pos: usize, msg: S) -> CalcError {
        CalcError::Formula { pos, msg: msg.into() }
    }

    /// Builds a [`CalcError::CodeGen`].
    pub fn codegen<S: Into<String>>(msg: S) -> CalcError {
        CalcError::CodeGen(msg.into())
    }

    /// Builds a [`CalcError::NotImplemented`].
    pub fn not_implemented<S: Into<String>>(msg: S) -> CalcError {
        CalcError::NotImplemented(msg.into())
    }

    /// Builds a [`CalcError::Device`].
    pub fn device<S: Into<String>>(msg: S) -> CalcError {
        CalcError::Device(msg.into())
    }

    /// Builds a [`CalcError::Connection`].
    pub fn connection<S: Into<String>>(peer: S, cause: io::Error) -> CalcError {
        CalcError::Connection { peer: peer.into(), cause }
    }

    /// Builds a [`CalcError::Protocol`].
    pub fn protocol<S: Into<String>>(msg: S) -> CalcError {
        CalcError::Protocol(msg.into())
    }
}

impl From<io::Error> for CalcError {
    fn from(e: io::Error) -> CalcError {
        CalcError::Io(e)
    }
}

/// Convenient alias for results carrying a [`CalcError`].
pub type CalcResult<T> = Result<T, CalcError>;

/// Index of the single layer flagged as default, or a configuration
/// error when there is none or more than one.
pub fn default_index(layers: &[ProcessLayer]) -> CalcResult<usize> {
    let mut found = None;
    for (i, pl) in layers.iter().enumerate() {
        if pl.default {
            if found.is_some() {
                return Err(CalcError::config("more than one layer is marked default"));
            }
            found = Some(i);
        }
    }
    found.ok_or_else(|| CalcError::config("no layer is marked default"))
}

/// Shared `configure` validation: a non-empty stack, an in-range default
/// index naming the one layer actually flagged default, and sane
/// thresholds.
pub(crate) fn check_configure(layers: &[ProcessLayer], default_layer: usize) -> CalcResult<()> {
    if layers.is_empty() {
        return Err(CalcError::config("no layers configured"));
    }
    if default_layer >= layers.len() {
        return Err(CalcError::config(format!(
            "default layer index {} out of range for {} layers",
            default_layer,
            layers.len()
        )));
    }
    let flagged = default_index(layers)?;
    if flagged != default_layer {
        return Err(CalcError::config(format!(
            "default layer index {} does not name the flagged layer {}",
            default_layer, flagged
        )));
    }
    for (i, pl) in layers.iter().enumerate() {
        if !pl.bailout.is_finite() {
            return Err(CalcError::config(format!("layer {} has a non-finite bailout", i)));
        }
        if pl.nlimit < 1 {
            return Err(CalcError::config(format!(
                "layer {} has iteration limit {}, expected at least 1",
                i, pl.nlimit
            )));
        }
    }
    Ok(())
}

/// Shared `init` validation: the frame's layers must match the
/// configured templates one for one.
pub(crate) fn check_init(templates: &[ProcessLayer], layers: &[ProcessLayer]) -> CalcResult<()> {
    if templates.len() != layers.len() {
        return Err(CalcError::config(format!(
            "init supplied {} layers but the engine was configured with {}",
            layers.len(),
            templates.len()
        )));
    }
    for (i, (t, l)) in templates.iter().zip(layers.iter()).enumerate() {
        if !t.similar(l) {
            return Err(CalcError::config(format!(
                "init layer {} differs from its configured template",
                i
            )));
        }
    }
    Ok(())
}

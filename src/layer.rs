// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Layer descriptions and the per-layer statistics carried through an
//! iterated sequence evaluation.
//!
//! A [`ProcessLayer`] bundles the configuration of one measurement taken
//! along a point's orbit (which sequence it follows, what it measures,
//! how the measurements are folded together, and when the layer stops)
//! with the running state produced while the orbit is iterated.  Engines
//! clone a set of layer templates for every point they evaluate and hand
//! the filled-in clones back as the point's result.

use num::Complex;

/// How a layer decides that its sequence value has crossed the bailout
/// threshold.  Discriminants are the values carried by the network
/// protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConvCheck {
    /// Squared magnitude of the sequence value.
    Normal = 1,
    /// Squared real part only.
    Real = 2,
    /// Squared imaginary part only.
    Imag = 4,
    /// Either squared component crosses the threshold.
    Or = 8,
    /// Both squared components cross the threshold.
    And = 16,
    /// Squared Manhattan length, `(|re| + |im|)^2`.
    Manh = 32,
    /// Squared component sum, `(re + im)^2`.
    ManR = 64,
}

/// Which aggregate of the orbit a layer follows as its sequence value,
/// and also which folding rule combines per-iteration measurements.
/// Discriminants are the values carried by the network protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeqType {
    /// The raw orbit value itself (or plain assignment when folding).
    Normal = 0,
    /// Running sum of orbit values.
    Sum = 1,
    /// Running mean of orbit values.
    Mean = 2,
    /// Sum of squared deviations from the running mean.
    VarSx = 4,
    /// Sample variance of the orbit so far.
    Variance = 8,
    /// Sample standard deviation of the orbit so far.
    StdDev = 16,
    /// Orbit value of smallest magnitude seen so far.
    Min = 32,
    /// Orbit value of largest magnitude seen so far.
    Max = 64,
    /// Difference between the two most recent orbit values.
    Delta = 128,
}

/// Per-iteration measurement taken from a layer's sequence value.
/// Discriminants are the values carried by the network protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeqCheck {
    /// No measurement; the layer only classifies inside/outside.
    Normal = 1,
    /// Smoothed escape weight, `exp(-|x|)` (or `exp(-|x - oldx|)` for
    /// convergent kinds).
    Smooth = 2,
    /// Triangle-inequality average term.
    Triangle = 4,
    /// Triangle-inequality term with a fractional final correction.
    TriangleSmooth = 8,
    /// Distance to a configured trap region.
    OrbitTrap = 16,
    /// Real part of the sequence value.
    Real = 32,
    /// Imaginary part of the sequence value.
    Imag = 64,
    /// Argument (phase) of the sequence value.
    Arg = 128,
    /// Magnitude of the sequence value.
    Abs = 256,
    /// Magnitude of the arctangent of successive finite differences.
    Curvature = 512,
}

/// Shape of the region an orbit-trap layer measures distance to.
/// Discriminants are the values carried by the network protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OrbitTrap {
    /// Distance to a fixed point.
    Point = 1,
    /// Distance to the real or imaginary axis.
    Line = 2,
    /// Distance to the nearest Gaussian integer.
    Gauss = 4,
}

/// One evaluation layer: the configuration of a statistic tracked along
/// an orbit together with the state accumulated while iterating.
///
/// The configuration fields are set up once and shared by every point;
/// the state fields are rewritten per point, starting from
/// [`ProcessLayer::begin_point`].
#[derive(Clone, Debug, PartialEq)]
pub struct ProcessLayer {
    /// Bailout threshold the convergence check compares against.
    pub bailout: f64,
    /// Iteration limit after which a still-active layer counts as inside.
    pub nlimit: i32,
    /// Convergence test applied to the sequence value each iteration.
    pub convcheck: ConvCheck,
    /// Aggregate of the orbit this layer follows as its sequence.
    pub seqtype: SeqType,
    /// Measurement taken from the sequence value each iteration.
    pub checktype: SeqCheck,
    /// Folding rule combining the per-iteration measurements.
    pub checkseqtype: SeqType,
    /// Trap shape used when `checktype` is [`SeqCheck::OrbitTrap`].
    pub traptype: OrbitTrap,
    /// First trap parameter (trap point, or axis selector for lines).
    pub point_a: Complex<f64>,
    /// Second trap parameter, carried for forward compatibility.
    pub point_b: Complex<f64>,
    /// Whether this layer's bailout ends the whole point evaluation.
    pub default: bool,

    /// Whether the layer is still iterating.
    pub active: bool,
    /// Whether the layer reached its iteration limit without bailing out.
    pub isin: bool,
    /// Current sequence value.
    pub x: Complex<f64>,
    /// Sequence value one iteration ago.
    pub oldx: Complex<f64>,
    /// Sequence value two iterations ago.
    pub old2x: Complex<f64>,
    /// Folded measurement value.
    pub calc: f64,
    /// Running mean of measurements (Welford fold state).
    pub cmean: f64,
    /// Running sum of squared deviations (Welford fold state).
    pub cvarsx: f64,
    /// Sample variance of measurements.
    pub cvariance: f64,
    /// Iteration count when the layer stopped (or the current count).
    pub n: i32,
    /// Sequence value at which a min/max fold last improved.
    pub resx: Complex<f64>,
    /// Iteration at which a min/max fold last improved.
    pub resn: i32,
}

impl ProcessLayer {
    /// Creates a layer with the given bailout and iteration limit and
    /// every other setting at its plainest: raw sequence, no measurement
    /// folding, squared-magnitude convergence check.
    pub fn new(bailout: f64, nlimit: i32) -> ProcessLayer {
        let zero = Complex::new(0.0, 0.0);
        ProcessLayer {
            bailout,
            nlimit,
            convcheck: ConvCheck::Normal,
            seqtype: SeqType::Normal,
            checktype: SeqCheck::Normal,
            checkseqtype: SeqType::Normal,
            traptype: OrbitTrap::Point,
            point_a: zero,
            point_b: zero,
            default: false,
            active: false,
            isin: false,
            x: zero,
            oldx: zero,
            old2x: zero,
            calc: 0.0,
            cmean: 0.0,
            cvarsx: 0.0,
            cvariance: 0.0,
            n: 0,
            resx: zero,
            resn: 0,
        }
    }

    /// Resets the running state for a fresh point whose orbit starts at
    /// `start`.  Configuration fields are untouched.
    pub fn begin_point(&mut self, start: Complex<f64>) {
        let zero = Complex::new(0.0, 0.0);
        self.active = true;
        self.isin = false;
        self.x = start;
        self.oldx = start;
        self.old2x = start;
        self.calc = 0.0;
        self.cmean = 0.0;
        self.cvarsx = 0.0;
        self.cvariance = 0.0;
        self.n = 0;
        self.resx = zero;
        self.resn = 0;
    }

    /// True when `other` has the same configuration, ignoring any
    /// accumulated state.
    pub fn similar(&self, other: &ProcessLayer) -> bool {
        self.bailout == other.bailout
            && self.nlimit == other.nlimit
            && self.convcheck == other.convcheck
            && self.seqtype == other.seqtype
            && self.checktype == other.checktype
            && self.checkseqtype == other.checkseqtype
            && self.traptype == other.traptype
            && self.point_a == other.point_a
            && self.point_b == other.point_b
            && self.default == other.default
    }
}

/// Set of orbit aggregates at least one layer in a run asks for.  The
/// statistical aggregates depend on each other, so requesting one pulls
/// in everything beneath it.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub(crate) struct SeqModes {
    pub(crate) sum: bool,
    pub(crate) mean: bool,
    pub(crate) varsx: bool,
    pub(crate) variance: bool,
    pub(crate) stddev: bool,
    pub(crate) min: bool,
    pub(crate) max: bool,
    pub(crate) delta: bool,
}

impl SeqModes {
    pub(crate) fn note(&mut self, seq: SeqType) {
        match seq {
            SeqType::Normal => {}
            SeqType::Sum => self.sum = true,
            SeqType::Mean => self.mean = true,
            SeqType::VarSx => self.varsx = true,
            SeqType::Variance => self.variance = true,
            SeqType::StdDev => self.stddev = true,
            SeqType::Min => self.min = true,
            SeqType::Max => self.max = true,
            SeqType::Delta => self.delta = true,
        }
    }

    pub(crate) fn close(&mut self) {
        if self.stddev {
            self.variance = true;
        }
        if self.variance {
            self.varsx = true;
        }
        if self.varsx {
            self.mean = true;
        }
    }

    pub(crate) fn for_layers(layers: &[ProcessLayer]) -> SeqModes {
        let mut modes = SeqModes::default();
        for pl in layers {
            modes.note(pl.seqtype);
        }
        modes.close();
        modes
    }
}

/// Orbit aggregates shared by every layer of one point evaluation,
/// updated once per iteration from the newest orbit value.
#[derive(Clone, Copy, Debug)]
pub(crate) struct AggregatePool {
    pub(crate) sumx: Complex<f64>,
    pub(crate) meanx: Complex<f64>,
    pub(crate) varsx: Complex<f64>,
    pub(crate) variancex: Complex<f64>,
    pub(crate) sdx: Complex<f64>,
    pub(crate) minx: Complex<f64>,
    pub(crate) maxx: Complex<f64>,
    pub(crate) deltax: Complex<f64>,
}

impl Default for AggregatePool {
    fn default() -> AggregatePool {
        let zero = Complex::new(0.0, 0.0);
        AggregatePool {
            sumx: zero,
            meanx: zero,
            varsx: zero,
            variancex: zero,
            sdx: zero,
            minx: zero,
            maxx: zero,
            deltax: zero,
        }
    }
}

impl AggregatePool {
    /// Folds iteration `n`'s orbit value into every aggregate the run
    /// uses.  `prev` is the orbit value of the previous iteration.
    pub(crate) fn update(&mut self, newx: Complex<f64>, prev: Complex<f64>, n: i32, modes: &SeqModes) {
        if modes.sum {
            self.sumx = self.sumx + newx;
        }
        if modes.mean {
            let delta = newx - self.meanx;
            self.meanx = self.meanx + delta / n as f64;
            if modes.varsx {
                self.varsx = self.varsx + delta * (newx - self.meanx);
                if modes.variance && n != 1 {
                    self.variancex = self.varsx / (n as f64 - 1.0);
                    if modes.stddev {
                        self.sdx = self.variancex.sqrt();
                    }
                }
            }
        }
        if modes.min {
            if n == 1 || newx.norm() < self.minx.norm() {
                self.minx = newx;
            }
        }
        if modes.max {
            if n == 1 || newx.norm() > self.maxx.norm() {
                self.maxx = newx;
            }
        }
        if modes.delta {
            self.deltax = newx - prev;
        }
    }

    /// The aggregate a layer with sequence type `seq` follows, given the
    /// newest raw orbit value.
    pub(crate) fn select(&self, seq: SeqType, newx: Complex<f64>) -> Complex<f64> {
        match seq {
            SeqType::Normal => newx,
            SeqType::Sum => self.sumx,
            SeqType::Mean => self.meanx,
            SeqType::VarSx => self.varsx,
            SeqType::Variance => self.variancex,
            SeqType::StdDev => self.sdx,
            SeqType::Min => self.minx,
            SeqType::Max => self.maxx,
            SeqType::Delta => self.deltax,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modes_closure_pulls_dependencies() {
        let mut modes = SeqModes::default();
        modes.note(SeqType::StdDev);
        modes.close();
        assert!(modes.stddev);
        assert!(modes.variance);
        assert!(modes.varsx);
        assert!(modes.mean);
        assert!(!modes.sum);
        assert!(!modes.min);
    }

    #[test]
    fn modes_for_layers_unions_sequence_types() {
        let mut a = ProcessLayer::new(4.0, 100);
        a.seqtype = SeqType::Sum;
        let mut b = ProcessLayer::new(4.0, 100);
        b.seqtype = SeqType::Mean;
        let modes = SeqModes::for_layers(&[a, b]);
        assert!(modes.sum);
        assert!(modes.mean);
        assert!(!modes.varsx);
    }

    #[test]
    fn welford_variance_matches_direct_computation() {
        let mut modes = SeqModes::default();
        modes.note(SeqType::StdDev);
        modes.close();
        let mut pool = AggregatePool::default();
        let mut prev = Complex::new(0.0, 0.0);
        for n in 1..=8 {
            let v = Complex::new(n as f64, 0.0);
            pool.update(v, prev, n, &modes);
            prev = v;
        }
        // 1..8 has mean 4.5 and sample variance 6, both exact in binary.
        assert_eq!(pool.meanx, Complex::new(4.5, 0.0));
        assert_eq!(pool.variancex, Complex::new(6.0, 0.0));
        assert_eq!(pool.sdx, Complex::new(6.0f64.sqrt(), 0.0));
    }

    #[test]
    fn min_max_track_magnitude() {
        let mut modes = SeqModes::default();
        modes.note(SeqType::Min);
        modes.note(SeqType::Max);
        let seq = [
            Complex::new(3.0, 0.0),
            Complex::new(-1.0, 0.0),
            Complex::new(0.0, 2.0),
        ];
        let mut pool = AggregatePool::default();
        let mut prev = Complex::new(0.0, 0.0);
        for (i, &v) in seq.iter().enumerate() {
            pool.update(v, prev, i as i32 + 1, &modes);
            prev = v;
        }
        assert_eq!(pool.minx, Complex::new(-1.0, 0.0));
        assert_eq!(pool.maxx, Complex::new(3.0, 0.0));
        assert_eq!(pool.select(SeqType::Min, prev), Complex::new(-1.0, 0.0));
    }

    #[test]
    fn delta_tracks_last_step() {
        let mut modes = SeqModes::default();
        modes.note(SeqType::Delta);
        let mut pool = AggregatePool::default();
        pool.update(Complex::new(5.0, 1.0), Complex::new(2.0, 0.0), 3, &modes);
        assert_eq!(pool.deltax, Complex::new(3.0, 1.0));
    }

    #[test]
    fn begin_point_resets_running_state() {
        let mut pl = ProcessLayer::new(4.0, 64);
        pl.calc = 7.5;
        pl.n = 12;
        pl.isin = true;
        pl.resx = Complex::new(1.0, 1.0);
        pl.resn = 9;
        let start = Complex::new(0.25, -0.5);
        pl.begin_point(start);
        assert!(pl.active);
        assert!(!pl.isin);
        assert_eq!(pl.x, start);
        assert_eq!(pl.oldx, start);
        assert_eq!(pl.old2x, start);
        assert_eq!(pl.calc, 0.0);
        assert_eq!(pl.cmean, 0.0);
        assert_eq!(pl.cvarsx, 0.0);
        assert_eq!(pl.cvariance, 0.0);
        assert_eq!(pl.n, 0);
        assert_eq!(pl.resx, Complex::new(0.0, 0.0));
        assert_eq!(pl.resn, 0);
    }

    #[test]
    fn similar_ignores_running_state() {
        let mut a = ProcessLayer::new(4.0, 64);
        a.seqtype = SeqType::Mean;
        let mut b = a.clone();
        b.begin_point(Complex::new(1.0, 2.0));
        b.calc = 99.0;
        assert!(a.similar(&b));
        b.bailout = 16.0;
        assert!(!a.similar(&b));
    }
}

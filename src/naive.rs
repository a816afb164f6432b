// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The interpreted engine.
//!
//! "Naive" here means the evaluator re-reads the layer configuration on
//! every iteration of every point: which aggregate a layer follows,
//! which measurement it takes, how the measurements fold, and when it
//! bails out are all decided with a fresh `match` each time around the
//! loop.  That makes this the slowest engine and also the one to read
//! first, because the whole iteration model is laid out in one place.
//! Every other engine is measured against the answers this one gives.
//!
//! Points are queued by `submit`, evaluated in bulk by `flush`, and
//! drained by `take`, all on the calling thread.

use std::collections::VecDeque;

use num::Complex;

use calc::{self, CalcResult, Calculator, CalculatorFactory, FractalKind, PointJob, PointResult};
use formula::Formula;
use layer::{AggregatePool, ConvCheck, OrbitTrap, ProcessLayer, SeqCheck, SeqModes, SeqType};

/// Builds interpreted calculators.  The factory itself is stateless;
/// every calculator owns its own templates and queues.
pub struct NaiveFactory;

impl CalculatorFactory for NaiveFactory {
    fn configure(
        &self,
        layers: &[ProcessLayer],
        kind: FractalKind,
        formula: &str,
        default_layer: usize,
    ) -> CalcResult<Box<dyn Calculator>> {
        calc::check_configure(layers, default_layer)?;
        let program = if kind.uses_formula() {
            Some(Formula::parse(formula)?)
        } else {
            None
        };
        Ok(Box::new(NaiveCalculator {
            templates: layers.to_vec(),
            kind,
            formula: program,
            default_layer,
            param: 0.0,
            jobs: VecDeque::new(),
            ready: VecDeque::new(),
        }))
    }
}

struct NaiveCalculator {
    templates: Vec<ProcessLayer>,
    kind: FractalKind,
    formula: Option<Formula>,
    default_layer: usize,
    param: f64,
    jobs: VecDeque<PointJob>,
    ready: VecDeque<PointResult>,
}

impl Calculator for NaiveCalculator {
    fn init(&mut self, layers: &[ProcessLayer], param: f64, _expected: usize) -> CalcResult<()> {
        calc::check_init(&self.templates, layers)?;
        self.param = param;
        self.jobs.clear();
        self.ready.clear();
        Ok(())
    }

    fn submit(&mut self, px: i32, py: i32, start: Complex<f64>, constant: Complex<f64>) -> CalcResult<()> {
        self.jobs.push_back(PointJob { px, py, start, constant });
        Ok(())
    }

    fn flush(&mut self) -> CalcResult<()> {
        while let Some(job) = self.jobs.pop_front() {
            let result = self.evaluate(&job);
            self.ready.push_back(result);
        }
        Ok(())
    }

    fn take(&mut self) -> Option<PointResult> {
        self.ready.pop_front()
    }

    fn end_batch(&mut self, is_final: bool) -> CalcResult<()> {
        if is_final {
            self.jobs.clear();
            self.ready.clear();
        }
        Ok(())
    }
}

impl NaiveCalculator {
    fn step(&self, x: Complex<f64>, c: Complex<f64>, n: i32) -> Complex<f64> {
        match self.kind {
            FractalKind::Mandel => calc::step_mandel(x, c),
            FractalKind::MandelN => calc::step_mandel_n(x, c, self.param),
            FractalKind::BurningShip => calc::step_burning_ship(x, c),
            FractalKind::BurningShipN => calc::step_burning_ship_n(x, c, self.param),
            FractalKind::Divergent | FractalKind::Convergent => match self.formula {
                Some(ref f) => f.eval(x, c, n, self.param),
                None => x,
            },
        }
    }

    /// Runs one point's orbit to completion and returns the filled-in
    /// layer states.
    fn evaluate(&self, job: &PointJob) -> PointResult {
        let mut layers = self.templates.clone();
        let c = job.constant;
        for pl in layers.iter_mut() {
            pl.begin_point(job.start);
        }
        let modes = SeqModes::for_layers(&layers);
        let fractdiv = self.kind.is_divergent();
        let trinorm = triangle_norm(&layers, self.kind, c);

        let mut pool = AggregatePool::default();
        let mut x = job.start;
        let mut n: i32 = 0;
        loop {
            n += 1;
            let newx = self.step(x, c, n);
            pool.update(newx, x, n, &modes);
            for pl in layers.iter_mut() {
                if !pl.active {
                    continue;
                }
                pl.n = n;
                pl.old2x = pl.oldx;
                pl.oldx = pl.x;
                pl.x = pool.select(pl.seqtype, newx);
                let newd = measure(pl, self.kind, fractdiv, c, trinorm);
                fold(pl, newd);
                if bails_out(pl, fractdiv) {
                    pl.active = false;
                }
                if pl.n >= pl.nlimit {
                    pl.active = false;
                    pl.isin = true;
                }
                if !pl.active {
                    finish_layer(pl, c, trinorm);
                }
            }
            x = newx;
            if !layers[self.default_layer].active {
                break;
            }
        }
        PointResult { px: job.px, py: job.py, layers }
    }
}

/// The triangle-inequality reference magnitude, computed once per point
/// when any layer takes a triangle measurement.  The plain quadratic
/// kind compares squared step magnitudes against `|c|`; every other
/// kind uses the squared magnitude of the constant.
pub(crate) fn triangle_norm(layers: &[ProcessLayer], kind: FractalKind, c: Complex<f64>) -> f64 {
    let wanted = layers.iter().any(|pl| {
        pl.checktype == SeqCheck::Triangle || pl.checktype == SeqCheck::TriangleSmooth
    });
    if !wanted {
        0.0
    } else if kind == FractalKind::Mandel {
        c.norm()
    } else {
        c.norm_sqr()
    }
}

/// One triangle-inequality term: how far `value` sits between the
/// lower and upper bounds the inequality allows, or 0 for a degenerate
/// bound.
pub(crate) fn tri_term(newxnorm: f64, trinorm: f64, value: f64) -> f64 {
    let lowbound = (newxnorm - trinorm).abs();
    let denom = newxnorm + trinorm - lowbound;
    if denom == 0.0 {
        0.0
    } else {
        (value - lowbound) / denom
    }
}

/// The scalar measurement a layer takes from its sequence value this
/// iteration.
pub(crate) fn measure(
    pl: &ProcessLayer,
    kind: FractalKind,
    fractdiv: bool,
    c: Complex<f64>,
    trinorm: f64,
) -> f64 {
    match pl.checktype {
        SeqCheck::Normal => 0.0,
        SeqCheck::Smooth => {
            if fractdiv {
                (-pl.x.norm()).exp()
            } else {
                (-(pl.x - pl.oldx).norm()).exp()
            }
        }
        SeqCheck::Real => pl.x.re,
        SeqCheck::Imag => pl.x.im,
        SeqCheck::Arg => pl.x.arg(),
        SeqCheck::Abs => pl.x.norm(),
        SeqCheck::Curvature => {
            // exact compare: the guard is against dividing by zero, not
            // against nearly-equal values
            if pl.oldx != pl.old2x {
                ((pl.x - pl.oldx) / (pl.oldx - pl.old2x)).atan().norm()
            } else {
                0.0
            }
        }
        SeqCheck::Triangle | SeqCheck::TriangleSmooth => {
            if kind == FractalKind::Mandel {
                tri_term(pl.oldx.norm_sqr(), trinorm, pl.x.norm())
            } else {
                tri_term(pl.x.norm(), trinorm, (pl.x - c).norm())
            }
        }
        SeqCheck::OrbitTrap => match pl.traptype {
            OrbitTrap::Point => (pl.x - pl.point_a).norm(),
            OrbitTrap::Line => {
                if pl.point_a.re == 1.0 {
                    pl.x.re.abs()
                } else {
                    pl.x.im.abs()
                }
            }
            OrbitTrap::Gauss => {
                let gauss = Complex::new(pl.x.re.round(), pl.x.im.round());
                (gauss - pl.x).norm()
            }
        },
    }
}

/// Folds this iteration's measurement into the layer's running value.
pub(crate) fn fold(pl: &mut ProcessLayer, newd: f64) {
    match pl.checkseqtype {
        SeqType::Normal => pl.calc = newd,
        SeqType::Sum | SeqType::Mean => pl.calc += newd,
        SeqType::VarSx => {
            let delta = newd - pl.cmean;
            pl.cmean += delta / pl.n as f64;
            pl.calc += delta * (newd - pl.cmean);
        }
        SeqType::Variance => {
            let delta = newd - pl.cmean;
            pl.cmean += delta / pl.n as f64;
            pl.cvarsx += delta * (newd - pl.cmean);
            if pl.n != 1 {
                pl.calc = pl.cvarsx / (pl.n as f64 - 1.0);
            }
        }
        SeqType::StdDev => {
            let delta = newd - pl.cmean;
            pl.cmean += delta / pl.n as f64;
            pl.cvarsx += delta * (newd - pl.cmean);
            if pl.n != 1 {
                pl.cvariance = pl.cvarsx / (pl.n as f64 - 1.0);
            }
            pl.calc = pl.cvariance.sqrt();
        }
        SeqType::Min => {
            if pl.n == 1 {
                pl.calc = newd;
            } else if pl.calc > newd {
                pl.calc = newd;
                pl.resx = pl.x;
                pl.resn = pl.n;
            }
        }
        SeqType::Max => {
            if pl.n == 1 {
                pl.calc = newd;
            } else if pl.calc < newd {
                pl.calc = newd;
                pl.resx = pl.x;
                pl.resn = pl.n;
            }
        }
        SeqType::Delta => pl.calc = newd - pl.calc,
    }
}

fn crossed(value: f64, bailout: f64, fractdiv: bool) -> bool {
    if fractdiv {
        value > bailout
    } else {
        value < bailout
    }
}

/// Whether the layer's sequence value has crossed its bailout this
/// iteration, under the layer's own convergence test.
pub(crate) fn bails_out(pl: &ProcessLayer, fractdiv: bool) -> bool {
    let x = pl.x;
    match pl.convcheck {
        ConvCheck::Real => crossed(x.re * x.re, pl.bailout, fractdiv),
        ConvCheck::Imag => crossed(x.im * x.im, pl.bailout, fractdiv),
        ConvCheck::Or => {
            crossed(x.re * x.re, pl.bailout, fractdiv)
                || crossed(x.im * x.im, pl.bailout, fractdiv)
        }
        ConvCheck::And => {
            crossed(x.re * x.re, pl.bailout, fractdiv)
                && crossed(x.im * x.im, pl.bailout, fractdiv)
        }
        ConvCheck::Manh => {
            let d = x.re.abs() + x.im.abs();
            crossed(d * d, pl.bailout, fractdiv)
        }
        ConvCheck::ManR => {
            let d = x.re + x.im;
            crossed(d * d, pl.bailout, fractdiv)
        }
        ConvCheck::Normal => crossed(x.norm_sqr(), pl.bailout, fractdiv),
    }
}

/// The work done the moment a layer goes inactive: the triangle-smooth
/// finisher runs the fractional-iteration blend (two extra quadratic
/// steps feed the estimate), and a mean fold closes its average.
pub(crate) fn finish_layer(pl: &mut ProcessLayer, c: Complex<f64>, trinorm: f64) {
    if pl.checktype == SeqCheck::TriangleSmooth {
        if !pl.isin {
            pl.oldx = pl.x;
            pl.x = calc::step_mandel(pl.x, c);
            pl.n += 1;
            pl.calc += tri_term(pl.oldx.norm_sqr(), trinorm, pl.x.norm());
            let oldsum = pl.calc / (pl.n as f64 + 1.0);
            let il2 = 1.0 / (2.0f64).ln();
            let f = il2 * pl.bailout.ln().ln() - il2 * pl.x.norm().ln().ln() + 2.0;
            let az2 = pl.x.norm_sqr();
            pl.oldx = pl.x;
            pl.x = calc::step_mandel(pl.oldx, c);
            pl.calc += tri_term(az2, trinorm, pl.x.norm());
            pl.n += 1;
            pl.calc /= pl.n as f64 + 1.0;
            pl.calc = oldsum + (pl.calc - oldsum) * (f - 1.0);
        } else {
            pl.calc /= pl.n as f64 + 1.0;
        }
    } else if pl.checkseqtype == SeqType::Mean {
        pl.calc /= pl.n as f64 + 1.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_default(bailout: f64, nlimit: i32) -> Vec<ProcessLayer> {
        let mut pl = ProcessLayer::new(bailout, nlimit);
        pl.default = true;
        vec![pl]
    }

    fn run_one(
        layers: &[ProcessLayer],
        kind: FractalKind,
        formula: &str,
        param: f64,
        start: Complex<f64>,
        constant: Complex<f64>,
    ) -> PointResult {
        let mut calc = NaiveFactory.configure(layers, kind, formula, 0).unwrap();
        calc.init(layers, param, 1).unwrap();
        calc.submit(7, 9, start, constant).unwrap();
        calc.flush().unwrap();
        let out = calc.take().unwrap();
        assert!(calc.take().is_none());
        calc.end_batch(true).unwrap();
        out
    }

    #[test]
    fn inside_point_runs_to_the_limit() {
        let layers = single_default(4.0, 50);
        let zero = Complex::new(0.0, 0.0);
        let out = run_one(&layers, FractalKind::Mandel, "", 0.0, zero, zero);
        assert_eq!(out.px, 7);
        assert_eq!(out.py, 9);
        assert_eq!(out.layers[0].n, 50);
        assert!(out.layers[0].isin);
        assert!(!out.layers[0].active);
    }

    #[test]
    fn outside_point_escapes_quickly() {
        let layers = single_default(4.0, 1000);
        let two = Complex::new(2.0, 0.0);
        let out = run_one(&layers, FractalKind::Mandel, "", 0.0, two, two);
        assert!(!out.layers[0].isin);
        assert!(out.layers[0].n < 5);
    }

    #[test]
    fn results_queue_and_drain_in_bulk() {
        let layers = single_default(4.0, 10);
        let mut calc = NaiveFactory
            .configure(&layers, FractalKind::Mandel, "", 0)
            .unwrap();
        calc.init(&layers, 0.0, 2).unwrap();
        calc.submit(0, 0, Complex::new(0.0, 0.0), Complex::new(0.0, 0.0)).unwrap();
        calc.submit(1, 0, Complex::new(2.0, 0.0), Complex::new(2.0, 0.0)).unwrap();
        assert!(calc.take().is_none());
        calc.flush().unwrap();
        let a = calc.take().unwrap();
        let b = calc.take().unwrap();
        assert!(calc.take().is_none());
        assert_eq!((a.px, a.py), (0, 0));
        assert_eq!((b.px, b.py), (1, 0));
        calc.end_batch(false).unwrap();
        calc.end_batch(true).unwrap();
    }

    #[test]
    fn init_revalidates_the_layer_stack() {
        let layers = single_default(4.0, 10);
        let mut calc = NaiveFactory
            .configure(&layers, FractalKind::Mandel, "", 0)
            .unwrap();
        let mut other = layers.clone();
        other[0].bailout = 16.0;
        assert!(calc.init(&other, 0.0, 1).is_err());
        other.push(ProcessLayer::new(4.0, 10));
        assert!(calc.init(&other, 0.0, 1).is_err());
        assert!(calc.init(&layers, 0.0, 1).is_ok());
    }

    #[test]
    fn formula_kind_requires_a_parseable_formula() {
        let layers = single_default(4.0, 10);
        assert!(NaiveFactory
            .configure(&layers, FractalKind::Divergent, "x*x+c-1.0/n", 0)
            .is_ok());
        assert!(NaiveFactory
            .configure(&layers, FractalKind::Divergent, "x*(", 0)
            .is_err());
        // built-in kinds never look at the formula text
        assert!(NaiveFactory
            .configure(&layers, FractalKind::Mandel, "x*(", 0)
            .is_ok());
    }

    // The orbit of `x+1.0` from 0 is 1, 2, 3, ... which gives the
    // real-measurement folds known closed forms over L iterations.
    #[test]
    fn measurement_folds_match_closed_forms() {
        let limit = 12;
        let mut variance = ProcessLayer::new(1e6, limit);
        variance.default = true;
        variance.checktype = SeqCheck::Real;
        variance.checkseqtype = SeqType::Variance;
        let mut stddev = ProcessLayer::new(1e6, limit);
        stddev.checktype = SeqCheck::Real;
        stddev.checkseqtype = SeqType::StdDev;
        let mut mean = ProcessLayer::new(1e6, limit);
        mean.checktype = SeqCheck::Real;
        mean.checkseqtype = SeqType::Mean;
        let layers = vec![variance, stddev, mean];

        let zero = Complex::new(0.0, 0.0);
        let out = run_one(&layers, FractalKind::Divergent, "x+1.0", 0.0, zero, zero);
        let l = limit as f64;
        // sample variance of 1..=L, its square root, and the closing
        // mean division by L+1
        let want_variance = l * (l + 1.0) / 12.0;
        assert!((out.layers[0].calc - want_variance).abs() < 1e-9);
        assert!((out.layers[1].calc - want_variance.sqrt()).abs() < 1e-9);
        assert!((out.layers[2].calc - l / 2.0).abs() < 1e-9);
        for pl in &out.layers {
            assert_eq!(pl.n, limit);
            assert!(pl.isin);
        }
    }

    #[test]
    fn min_fold_records_where_the_extremum_happened() {
        let limit = 12;
        let mut trap = ProcessLayer::new(1e6, limit);
        trap.default = true;
        trap.checktype = SeqCheck::OrbitTrap;
        trap.traptype = OrbitTrap::Point;
        trap.checkseqtype = SeqType::Min;
        let layers = vec![trap];

        // orbit 9, 8, ..., passes through the trap point at n = 10
        let start = Complex::new(10.0, 0.0);
        let out = run_one(&layers, FractalKind::Divergent, "x-1.0", 0.0, start, Complex::new(0.0, 0.0));
        let pl = &out.layers[0];
        assert_eq!(pl.calc, 0.0);
        assert_eq!(pl.resn, 10);
        assert_eq!(pl.resx, Complex::new(0.0, 0.0));
    }

    #[test]
    fn layer_templates_are_not_disturbed_between_points() {
        let layers = single_default(4.0, 30);
        let zero = Complex::new(0.0, 0.0);
        let a = run_one(&layers, FractalKind::Mandel, "", 0.0, zero, zero);
        let b = run_one(&layers, FractalKind::Mandel, "", 0.0, zero, zero);
        assert_eq!(a.layers, b.layers);
    }

    #[test]
    fn burning_ship_folds_the_mixed_term() {
        let layers = single_default(4.0, 200);
        // the mixed term 2·re·im is negative here, so the two maps part
        // ways on the very first step
        let c = Complex::new(1.2, -1.5);
        let m = run_one(&layers, FractalKind::Mandel, "", 0.0, c, c);
        let s = run_one(&layers, FractalKind::BurningShip, "", 0.0, c, c);
        assert_ne!(m.layers[0].x, s.layers[0].x);
        assert!(s.layers[0].x.im > m.layers[0].x.im);
    }
}

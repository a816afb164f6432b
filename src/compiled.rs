// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The specializing engine.
//!
//! Where the interpreted engine re-reads the layer configuration on
//! every iteration, this one reads it exactly once: `configure` lowers
//! the layer set into a [`PointProgram`] whose per-layer steps are
//! straight-line code behind function pointers, with the bailout
//! threshold, trap geometry, comparison direction, and finisher all
//! resolved while the program is generated.  The per-iteration path
//! never touches a configuration field again.
//!
//! The arithmetic is kept term-for-term identical to the interpreted
//! engine so the two produce the same bits for the same points.

use std::collections::VecDeque;

use num::Complex;

use calc::{self, CalcResult, Calculator, CalculatorFactory, FractalKind, PointJob, PointResult};
use formula::Formula;
use layer::{AggregatePool, ConvCheck, OrbitTrap, ProcessLayer, SeqCheck, SeqModes, SeqType};
use naive::tri_term;

/// Builds specializing calculators.
pub struct CompiledFactory;

impl CalculatorFactory for CompiledFactory {
    fn configure(
        &self,
        layers: &[ProcessLayer],
        kind: FractalKind,
        formula: &str,
        default_layer: usize,
    ) -> CalcResult<Box<dyn Calculator>> {
        calc::check_configure(layers, default_layer)?;
        let program = PointProgram::generate(layers, kind, formula, default_layer)?;
        Ok(Box::new(CompiledCalculator {
            templates: layers.to_vec(),
            program,
            param: 0.0,
            jobs: VecDeque::new(),
            ready: VecDeque::new(),
        }))
    }
}

type StepFn = Box<dyn Fn(Complex<f64>, Complex<f64>, i32, f64) -> Complex<f64> + Send + Sync>;
type MeasureFn = Box<dyn Fn(&ProcessLayer, Complex<f64>, f64) -> f64 + Send + Sync>;
type BailsFn = Box<dyn Fn(Complex<f64>) -> bool + Send + Sync>;
type SelectFn = fn(&AggregatePool, Complex<f64>) -> Complex<f64>;
type FoldFn = fn(&mut ProcessLayer, f64);
type FinishFn = fn(&mut ProcessLayer, Complex<f64>, f64);

/// The straight-line steps for one layer, resolved at generation time.
struct LayerCode {
    nlimit: i32,
    select: SelectFn,
    measure: MeasureFn,
    fold: FoldFn,
    bails: BailsFn,
    finish: FinishFn,
}

/// A whole layer set lowered to executable form: the iteration rule,
/// the per-point triangle reference, the aggregate mask, and one
/// [`LayerCode`] per layer in configuration order.
struct PointProgram {
    step: StepFn,
    trinorm: fn(Complex<f64>) -> f64,
    modes: SeqModes,
    layers: Vec<LayerCode>,
    default_layer: usize,
}

impl PointProgram {
    fn generate(
        layers: &[ProcessLayer],
        kind: FractalKind,
        formula: &str,
        default_layer: usize,
    ) -> CalcResult<PointProgram> {
        let fractdiv = kind.is_divergent();
        let step: StepFn = match kind {
            FractalKind::Mandel => Box::new(|x, c, _, _| calc::step_mandel(x, c)),
            FractalKind::MandelN => Box::new(|x, c, _, p| calc::step_mandel_n(x, c, p)),
            FractalKind::BurningShip => Box::new(|x, c, _, _| calc::step_burning_ship(x, c)),
            FractalKind::BurningShipN => Box::new(|x, c, _, p| calc::step_burning_ship_n(x, c, p)),
            FractalKind::Divergent | FractalKind::Convergent => {
                let f = Formula::parse(formula)?;
                Box::new(move |x, c, n, p| f.eval(x, c, n, p))
            }
        };

        let has_triangle = layers.iter().any(|pl| {
            pl.checktype == SeqCheck::Triangle || pl.checktype == SeqCheck::TriangleSmooth
        });
        let trinorm: fn(Complex<f64>) -> f64 = if !has_triangle {
            |_| 0.0
        } else if kind == FractalKind::Mandel {
            |c| c.norm()
        } else {
            |c| c.norm_sqr()
        };

        let mut coded = Vec::with_capacity(layers.len());
        for pl in layers {
            coded.push(LayerCode {
                nlimit: pl.nlimit,
                select: gen_select(pl.seqtype),
                measure: gen_measure(pl, kind, fractdiv),
                fold: gen_fold(pl.checkseqtype),
                bails: gen_bails(pl.convcheck, pl.bailout, fractdiv),
                finish: gen_finish(pl.checktype, pl.checkseqtype),
            });
        }

        Ok(PointProgram {
            step,
            trinorm,
            modes: SeqModes::for_layers(layers),
            layers: coded,
            default_layer,
        })
    }
}

fn gen_select(seq: SeqType) -> SelectFn {
    match seq {
        SeqType::Normal => |_, newx| newx,
        SeqType::Sum => |pool, _| pool.sumx,
        SeqType::Mean => |pool, _| pool.meanx,
        SeqType::VarSx => |pool, _| pool.varsx,
        SeqType::Variance => |pool, _| pool.variancex,
        SeqType::StdDev => |pool, _| pool.sdx,
        SeqType::Min => |pool, _| pool.minx,
        SeqType::Max => |pool, _| pool.maxx,
        SeqType::Delta => |pool, _| pool.deltax,
    }
}

fn gen_measure(pl: &ProcessLayer, kind: FractalKind, fractdiv: bool) -> MeasureFn {
    match pl.checktype {
        SeqCheck::Normal => Box::new(|_, _, _| 0.0),
        SeqCheck::Smooth => {
            if fractdiv {
                Box::new(|pl, _, _| (-pl.x.norm()).exp())
            } else {
                Box::new(|pl, _, _| (-(pl.x - pl.oldx).norm()).exp())
            }
        }
        SeqCheck::Real => Box::new(|pl, _, _| pl.x.re),
        SeqCheck::Imag => Box::new(|pl, _, _| pl.x.im),
        SeqCheck::Arg => Box::new(|pl, _, _| pl.x.arg()),
        SeqCheck::Abs => Box::new(|pl, _, _| pl.x.norm()),
        SeqCheck::Curvature => Box::new(|pl, _, _| {
            if pl.oldx != pl.old2x {
                ((pl.x - pl.oldx) / (pl.oldx - pl.old2x)).atan().norm()
            } else {
                0.0
            }
        }),
        SeqCheck::Triangle | SeqCheck::TriangleSmooth => {
            if kind == FractalKind::Mandel {
                Box::new(|pl, _, trinorm| tri_term(pl.oldx.norm_sqr(), trinorm, pl.x.norm()))
            } else {
                Box::new(|pl, c, trinorm| tri_term(pl.x.norm(), trinorm, (pl.x - c).norm()))
            }
        }
        SeqCheck::OrbitTrap => match pl.traptype {
            OrbitTrap::Point => {
                let point_a = pl.point_a;
                Box::new(move |pl, _, _| (pl.x - point_a).norm())
            }
            OrbitTrap::Line => {
                // axis choice is part of the configuration, so it is
                // resolved here rather than per iteration
                if pl.point_a.re == 1.0 {
                    Box::new(|pl, _, _| pl.x.re.abs())
                } else {
                    Box::new(|pl, _, _| pl.x.im.abs())
                }
            }
            OrbitTrap::Gauss => Box::new(|pl, _, _| {
                let gauss = Complex::new(pl.x.re.round(), pl.x.im.round());
                (gauss - pl.x).norm()
            }),
        },
    }
}

fn fold_normal(pl: &mut ProcessLayer, newd: f64) {
    pl.calc = newd;
}

fn fold_sum(pl: &mut ProcessLayer, newd: f64) {
    pl.calc += newd;
}

fn fold_varsx(pl: &mut ProcessLayer, newd: f64) {
    let delta = newd - pl.cmean;
    pl.cmean += delta / pl.n as f64;
    pl.calc += delta * (newd - pl.cmean);
}

fn fold_variance(pl: &mut ProcessLayer, newd: f64) {
    let delta = newd - pl.cmean;
    pl.cmean += delta / pl.n as f64;
    pl.cvarsx += delta * (newd - pl.cmean);
    if pl.n != 1 {
        pl.calc = pl.cvarsx / (pl.n as f64 - 1.0);
    }
}

fn fold_stddev(pl: &mut ProcessLayer, newd: f64) {
    let delta = newd - pl.cmean;
    pl.cmean += delta / pl.n as f64;
    pl.cvarsx += delta * (newd - pl.cmean);
    if pl.n != 1 {
        pl.cvariance = pl.cvarsx / (pl.n as f64 - 1.0);
    }
    pl.calc = pl.cvariance.sqrt();
}

fn fold_min(pl: &mut ProcessLayer, newd: f64) {
    if pl.n == 1 {
        pl.calc = newd;
    } else if pl.calc > newd {
        pl.calc = newd;
        pl.resx = pl.x;
        pl.resn = pl.n;
    }
}

fn fold_max(pl: &mut ProcessLayer, newd: f64) {
    if pl.n == 1 {
        pl.calc = newd;
    } else if pl.calc < newd {
        pl.calc = newd;
        pl.resx = pl.x;
        pl.resn = pl.n;
    }
}

fn fold_delta(pl: &mut ProcessLayer, newd: f64) {
    pl.calc = newd - pl.calc;
}

fn gen_fold(fold: SeqType) -> FoldFn {
    match fold {
        SeqType::Normal => fold_normal,
        SeqType::Sum | SeqType::Mean => fold_sum,
        SeqType::VarSx => fold_varsx,
        SeqType::Variance => fold_variance,
        SeqType::StdDev => fold_stddev,
        SeqType::Min => fold_min,
        SeqType::Max => fold_max,
        SeqType::Delta => fold_delta,
    }
}

fn gen_bails(check: ConvCheck, bailout: f64, fractdiv: bool) -> BailsFn {
    let b = bailout;
    match (check, fractdiv) {
        (ConvCheck::Real, true) => Box::new(move |x| x.re * x.re > b),
        (ConvCheck::Real, false) => Box::new(move |x| x.re * x.re < b),
        (ConvCheck::Imag, true) => Box::new(move |x| x.im * x.im > b),
        (ConvCheck::Imag, false) => Box::new(move |x| x.im * x.im < b),
        (ConvCheck::Or, true) => Box::new(move |x| x.re * x.re > b || x.im * x.im > b),
        (ConvCheck::Or, false) => Box::new(move |x| x.re * x.re < b || x.im * x.im < b),
        (ConvCheck::And, true) => Box::new(move |x| x.re * x.re > b && x.im * x.im > b),
        (ConvCheck::And, false) => Box::new(move |x| x.re * x.re < b && x.im * x.im < b),
        (ConvCheck::Manh, true) => Box::new(move |x| {
            let d = x.re.abs() + x.im.abs();
            d * d > b
        }),
        (ConvCheck::Manh, false) => Box::new(move |x| {
            let d = x.re.abs() + x.im.abs();
            d * d < b
        }),
        (ConvCheck::ManR, true) => Box::new(move |x| {
            let d = x.re + x.im;
            d * d > b
        }),
        (ConvCheck::ManR, false) => Box::new(move |x| {
            let d = x.re + x.im;
            d * d < b
        }),
        (ConvCheck::Normal, true) => Box::new(move |x| x.norm_sqr() > b),
        (ConvCheck::Normal, false) => Box::new(move |x| x.norm_sqr() < b),
    }
}

fn finish_none(_: &mut ProcessLayer, _: Complex<f64>, _: f64) {}

fn finish_mean(pl: &mut ProcessLayer, _: Complex<f64>, _: f64) {
    pl.calc /= pl.n as f64 + 1.0;
}

fn finish_tri_smooth(pl: &mut ProcessLayer, c: Complex<f64>, trinorm: f64) {
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
}

fn gen_finish(check: SeqCheck, fold: SeqType) -> FinishFn {
    if check == SeqCheck::TriangleSmooth {
        finish_tri_smooth
    } else if fold == SeqType::Mean {
        finish_mean
    } else {
        finish_none
    }
}

struct CompiledCalculator {
    templates: Vec<ProcessLayer>,
    program: PointProgram,
    param: f64,
    jobs: VecDeque<PointJob>,
    ready: VecDeque<PointResult>,
}

impl Calculator for CompiledCalculator {
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
            let result = self.run_program(&job);
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

impl CompiledCalculator {
    fn run_program(&self, job: &PointJob) -> PointResult {
        let mut layers = self.templates.clone();
        let c = job.constant;
        for pl in layers.iter_mut() {
            pl.begin_point(job.start);
        }
        let trinorm = (self.program.trinorm)(c);

        let mut pool = AggregatePool::default();
        let mut x = job.start;
        let mut n: i32 = 0;
        loop {
            n += 1;
            let newx = (self.program.step)(x, c, n, self.param);
            pool.update(newx, x, n, &self.program.modes);
            for (pl, code) in layers.iter_mut().zip(self.program.layers.iter()) {
                if !pl.active {
                    continue;
                }
                pl.n = n;
                pl.old2x = pl.oldx;
                pl.oldx = pl.x;
                pl.x = (code.select)(&pool, newx);
                let newd = (code.measure)(pl, c, trinorm);
                (code.fold)(pl, newd);
                if (code.bails)(pl.x) {
                    pl.active = false;
                }
                if pl.n >= code.nlimit {
                    pl.active = false;
                    pl.isin = true;
                }
                if !pl.active {
                    (code.finish)(pl, c, trinorm);
                }
            }
            x = newx;
            if !layers[self.program.default_layer].active {
                break;
            }
        }
        PointResult { px: job.px, py: job.py, layers }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use naive::NaiveFactory;

    // A deliberately mixed stack: pure escape time, a stddev-folded
    // triangle, a min-folded line trap over the mean sequence, and a
    // sum-folded curvature over the delta sequence.
    fn mixed_layers() -> Vec<ProcessLayer> {
        let mut plain = ProcessLayer::new(40.0, 64);
        plain.default = true;
        let mut tri = ProcessLayer::new(64.0, 64);
        tri.seqtype = SeqType::StdDev;
        tri.checktype = SeqCheck::Triangle;
        tri.checkseqtype = SeqType::StdDev;
        let mut trap = ProcessLayer::new(4.0, 64);
        trap.seqtype = SeqType::Mean;
        trap.checktype = SeqCheck::OrbitTrap;
        trap.traptype = OrbitTrap::Line;
        trap.point_a = Complex::new(1.0, 0.0);
        trap.checkseqtype = SeqType::Min;
        let mut curve = ProcessLayer::new(4.0, 64);
        curve.seqtype = SeqType::Delta;
        curve.checktype = SeqCheck::Curvature;
        curve.checkseqtype = SeqType::Sum;
        vec![plain, tri, trap, curve]
    }

    fn grid() -> Vec<(i32, i32, Complex<f64>)> {
        let mut points = Vec::new();
        for py in 0..4 {
            for px in 0..5 {
                let point = Complex::new(
                    -2.0 + px as f64 * 0.65,
                    -1.0 + py as f64 * 0.55,
                );
                points.push((px, py, point));
            }
        }
        points
    }

    fn run_grid(
        factory: &dyn CalculatorFactory,
        layers: &[ProcessLayer],
        kind: FractalKind,
        formula: &str,
        param: f64,
    ) -> Vec<PointResult> {
        let mut calc = factory.configure(layers, kind, formula, 0).unwrap();
        calc.init(layers, param, 20).unwrap();
        for (px, py, point) in grid() {
            calc.submit(px, py, point, point).unwrap();
        }
        calc.flush().unwrap();
        let mut out = Vec::new();
        while let Some(r) = calc.take() {
            out.push(r);
        }
        calc.end_batch(true).unwrap();
        out.sort_by_key(|r| (r.py, r.px));
        out
    }

    #[test]
    fn agrees_with_the_interpreted_engine_on_a_formula_scene() {
        let layers = mixed_layers();
        let naive = run_grid(&NaiveFactory, &layers, FractalKind::Divergent, "x*x+c-1.0/n", 0.0);
        let compiled = run_grid(&CompiledFactory, &layers, FractalKind::Divergent, "x*x+c-1.0/n", 0.0);
        assert_eq!(naive, compiled);
    }

    #[test]
    fn agrees_with_the_interpreted_engine_on_the_quadratic_scene() {
        let layers = mixed_layers();
        let naive = run_grid(&NaiveFactory, &layers, FractalKind::Mandel, "", 0.0);
        let compiled = run_grid(&CompiledFactory, &layers, FractalKind::Mandel, "", 0.0);
        assert_eq!(naive, compiled);
    }

    #[test]
    fn agrees_on_the_power_map_with_a_parameter() {
        let mut layers = mixed_layers();
        layers[1].checktype = SeqCheck::Smooth;
        let naive = run_grid(&NaiveFactory, &layers, FractalKind::BurningShipN, "", 3.0);
        let compiled = run_grid(&CompiledFactory, &layers, FractalKind::BurningShipN, "", 3.0);
        assert_eq!(naive, compiled);
    }

    #[test]
    fn triangle_smooth_is_generated_and_agrees() {
        let mut plain = ProcessLayer::new(4.0, 80);
        plain.default = true;
        let mut smooth = ProcessLayer::new(4.0, 80);
        smooth.checktype = SeqCheck::TriangleSmooth;
        smooth.checkseqtype = SeqType::Sum;
        let layers = vec![plain, smooth];
        let naive = run_grid(&NaiveFactory, &layers, FractalKind::Mandel, "", 0.0);
        let compiled = run_grid(&CompiledFactory, &layers, FractalKind::Mandel, "", 0.0);
        assert_eq!(naive, compiled);
    }

    #[test]
    fn rejects_what_the_interpreted_engine_rejects() {
        let layers = mixed_layers();
        assert!(CompiledFactory
            .configure(&layers, FractalKind::Divergent, "x*(", 0)
            .is_err());
        assert!(CompiledFactory.configure(&layers, FractalKind::Mandel, "", 2).is_err());
    }
}

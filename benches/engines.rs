#[macro_use]
extern crate criterion;
extern crate layerfract;
extern crate num;

use criterion::Criterion;
use num::Complex;

use layerfract::{Calculator, Engine, FractalKind, OrbitTrap, ProcessLayer, SeqCheck, SeqType};

const BATCH: i32 = 64;

fn mandel_stack() -> Vec<ProcessLayer> {
    let mut plain = ProcessLayer::new(4.0, 256);
    plain.default = true;
    vec![plain]
}

fn stats_stack() -> Vec<ProcessLayer> {
    let mut plain = ProcessLayer::new(40.0, 256);
    plain.default = true;
    let mut spread = ProcessLayer::new(64.0, 256);
    spread.seqtype = SeqType::StdDev;
    spread.checktype = SeqCheck::Triangle;
    spread.checkseqtype = SeqType::StdDev;
    let mut trap = ProcessLayer::new(4.0, 256);
    trap.seqtype = SeqType::Mean;
    trap.checktype = SeqCheck::OrbitTrap;
    trap.traptype = OrbitTrap::Line;
    trap.point_a = Complex::new(1.0, 0.0);
    trap.checkseqtype = SeqType::Min;
    vec![plain, spread, trap]
}

/// One frame of `BATCH` points straddling the set boundary, so the
/// batch mixes early escapes with points that run to the limit.
fn frame(calc: &mut dyn Calculator, layers: &[ProcessLayer]) {
    calc.init(layers, 0.0, BATCH as usize).unwrap();
    for i in 0..BATCH {
        let c = Complex::new(-2.0 + f64::from(i) * 0.04, 0.3);
        calc.submit(i, 0, c, c).unwrap();
    }
    calc.flush().unwrap();
    while calc.take().is_some() {}
    calc.end_batch(true).unwrap();
}

fn bench_engines(c: &mut Criterion) {
    c.bench_function("naive mandel batch", |b| {
        let layers = mandel_stack();
        let mut calc = Engine::Naive
            .factory()
            .configure(&layers, FractalKind::Mandel, "", 0)
            .unwrap();
        b.iter(|| frame(calc.as_mut(), &layers));
    });
    c.bench_function("compiled mandel batch", |b| {
        let layers = mandel_stack();
        let mut calc = Engine::Compiled
            .factory()
            .configure(&layers, FractalKind::Mandel, "", 0)
            .unwrap();
        b.iter(|| frame(calc.as_mut(), &layers));
    });
    c.bench_function("naive statistics batch", |b| {
        let layers = stats_stack();
        let mut calc = Engine::Naive
            .factory()
            .configure(&layers, FractalKind::Divergent, "x*x+c-1.0/n", 0)
            .unwrap();
        b.iter(|| frame(calc.as_mut(), &layers));
    });
    c.bench_function("compiled statistics batch", |b| {
        let layers = stats_stack();
        let mut calc = Engine::Compiled
            .factory()
            .configure(&layers, FractalKind::Divergent, "x*x+c-1.0/n", 0)
            .unwrap();
        b.iter(|| frame(calc.as_mut(), &layers));
    });
}

criterion_group!(benches, bench_engines);
criterion_main!(benches);

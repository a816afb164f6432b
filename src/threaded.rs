// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The thread-pool engine.
//!
//! A wrapper that fans submitted points out over `k` worker threads,
//! each owning a private calculator built from an inner factory.  The
//! workers share one inbound job channel and one outbound result
//! channel; because results carry their own pixel coordinates, whatever
//! interleaving the workers produce is a correct answer.
//!
//! Worker lifetime is tied to the channels: `end_batch(true)` drops the
//! job sender, each worker drains what is left, tears down its inner
//! engine, and exits, and the wrapper joins them.  Between batches the
//! workers just park on the empty channel.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::thread;

use crossbeam::channel::{unbounded, Receiver, Sender};
use num::Complex;
use tracing::{debug, warn};

use calc::{CalcError, CalcResult, Calculator, CalculatorFactory, FractalKind, PointJob, PointResult};
use layer::ProcessLayer;

/// Builds thread-pool calculators around an inner engine.
pub struct ThreadedFactory {
    workers: usize,
    inner: Arc<dyn CalculatorFactory>,
}

impl ThreadedFactory {
    /// A pool of `workers` threads, each running a calculator from
    /// `inner`.
    pub fn new(workers: usize, inner: Arc<dyn CalculatorFactory>) -> ThreadedFactory {
        ThreadedFactory { workers, inner }
    }
}

impl CalculatorFactory for ThreadedFactory {
    fn configure(
        &self,
        layers: &[ProcessLayer],
        kind: FractalKind,
        formula: &str,
        default_layer: usize,
    ) -> CalcResult<Box<dyn Calculator>> {
        if self.workers < 1 {
            return Err(CalcError::config("thread pool needs at least one worker"));
        }
        // probe the inner configuration now so a bad layer set or
        // formula fails here instead of at first init
        self.inner.configure(layers, kind, formula, default_layer)?;
        Ok(Box::new(ThreadedCalculator {
            factory: self.inner.clone(),
            layers: layers.to_vec(),
            kind,
            formula: formula.to_string(),
            default_layer,
            workers: self.workers,
            pool: None,
            ready: VecDeque::new(),
            in_flight: 0,
        }))
    }
}

struct WorkerPool {
    jobs: Option<Sender<PointJob>>,
    results: Receiver<CalcResult<PointResult>>,
    handles: Vec<thread::JoinHandle<()>>,
}

struct ThreadedCalculator {
    factory: Arc<dyn CalculatorFactory>,
    layers: Vec<ProcessLayer>,
    kind: FractalKind,
    formula: String,
    default_layer: usize,
    workers: usize,
    pool: Option<WorkerPool>,
    ready: VecDeque<PointResult>,
    in_flight: usize,
}

fn pool_gone() -> CalcError {
    CalcError::Io(io::Error::new(
        io::ErrorKind::BrokenPipe,
        "worker pool disconnected",
    ))
}

impl Calculator for ThreadedCalculator {
    fn init(&mut self, layers: &[ProcessLayer], param: f64, expected: usize) -> CalcResult<()> {
        self.teardown();
        let (job_tx, job_rx) = unbounded::<PointJob>();
        let (result_tx, result_rx) = unbounded::<CalcResult<PointResult>>();
        let share = expected / self.workers + 1;
        let mut handles = Vec::with_capacity(self.workers);
        for _ in 0..self.workers {
            let mut inner =
                self.factory
                    .configure(&self.layers, self.kind, &self.formula, self.default_layer)?;
            inner.init(layers, param, share)?;
            let jobs = job_rx.clone();
            let results = result_tx.clone();
            handles.push(thread::spawn(move || worker_loop(inner, jobs, results)));
        }
        debug!("started {} pool workers", handles.len());
        self.pool = Some(WorkerPool {
            jobs: Some(job_tx),
            results: result_rx,
            handles,
        });
        self.ready.clear();
        self.in_flight = 0;
        Ok(())
    }

    fn submit(&mut self, px: i32, py: i32, start: Complex<f64>, constant: Complex<f64>) -> CalcResult<()> {
        let sent = match self.pool {
            Some(ref pool) => match pool.jobs {
                Some(ref jobs) => jobs.send(PointJob { px, py, start, constant }).is_ok(),
                None => false,
            },
            None => return Err(CalcError::config("submit before init")),
        };
        if !sent {
            return Err(pool_gone());
        }
        self.in_flight += 1;
        Ok(())
    }

    fn flush(&mut self) -> CalcResult<()> {
        let pool = match self.pool {
            Some(ref pool) => pool,
            None => return Err(CalcError::config("flush before init")),
        };
        while self.in_flight > 0 {
            match pool.results.recv() {
                Ok(Ok(result)) => {
                    self.in_flight -= 1;
                    self.ready.push_back(result);
                }
                Ok(Err(e)) => {
                    self.in_flight -= 1;
                    return Err(e);
                }
                Err(_) => return Err(pool_gone()),
            }
        }
        Ok(())
    }

    fn take(&mut self) -> Option<PointResult> {
        self.ready.pop_front()
    }

    fn end_batch(&mut self, is_final: bool) -> CalcResult<()> {
        if is_final {
            self.teardown();
        }
        Ok(())
    }
}

impl ThreadedCalculator {
    fn teardown(&mut self) {
        if let Some(mut pool) = self.pool.take() {
            pool.jobs.take();
            for handle in pool.handles.drain(..) {
                if handle.join().is_err() {
                    warn!("pool worker exited abnormally");
                }
            }
        }
        self.in_flight = 0;
    }
}

impl Drop for ThreadedCalculator {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// One worker: pull a job, run it through the privately-owned inner
/// calculator, push exactly one outcome per job.
fn worker_loop(
    mut calc: Box<dyn Calculator>,
    jobs: Receiver<PointJob>,
    results: Sender<CalcResult<PointResult>>,
) {
    for job in jobs.iter() {
        let outcome = run_job(&mut *calc, &job);
        if results.send(outcome).is_err() {
            break;
        }
    }
    if let Err(e) = calc.end_batch(true) {
        warn!("pool worker teardown failed: {}", e);
    }
}

fn run_job(calc: &mut dyn Calculator, job: &PointJob) -> CalcResult<PointResult> {
    calc.submit(job.px, job.py, job.start, job.constant)?;
    calc.flush()?;
    let first = calc
        .take()
        .ok_or_else(|| CalcError::protocol("inner engine produced no result for a point"))?;
    while calc.take().is_some() {
        debug!("inner engine produced a surplus result; dropping it");
    }
    Ok(first)
}

#[cfg(test)]
mod tests {
    use super::*;
    use naive::NaiveFactory;

    fn layers() -> Vec<ProcessLayer> {
        let mut pl = ProcessLayer::new(4.0, 40);
        pl.default = true;
        vec![pl]
    }

    fn grid() -> Vec<(i32, i32, Complex<f64>)> {
        let mut points = Vec::new();
        for py in 0..4 {
            for px in 0..4 {
                let point = Complex::new(-2.0 + px as f64 * 0.8, -1.2 + py as f64 * 0.7);
                points.push((px, py, point));
            }
        }
        points
    }

    fn run_batch(calc: &mut Box<dyn Calculator>, layers: &[ProcessLayer]) -> Vec<PointResult> {
        calc.init(layers, 0.0, 16).unwrap();
        for (px, py, point) in grid() {
            calc.submit(px, py, point, point).unwrap();
        }
        calc.flush().unwrap();
        let mut out = Vec::new();
        while let Some(r) = calc.take() {
            out.push(r);
        }
        out.sort_by_key(|r| (r.py, r.px));
        out
    }

    #[test]
    fn coordinates_survive_a_two_worker_pool() {
        let layers = layers();
        let factory = ThreadedFactory::new(2, Arc::new(NaiveFactory));
        let mut pooled = factory.configure(&layers, FractalKind::Mandel, "", 0).unwrap();
        let mut single = NaiveFactory.configure(&layers, FractalKind::Mandel, "", 0).unwrap();
        let a = run_batch(&mut pooled, &layers);
        let b = run_batch(&mut single, &layers);
        pooled.end_batch(true).unwrap();
        single.end_batch(true).unwrap();
        assert_eq!(a.len(), grid().len());
        assert_eq!(a, b);
    }

    #[test]
    fn pool_restarts_for_a_second_frame() {
        let layers = layers();
        let factory = ThreadedFactory::new(3, Arc::new(NaiveFactory));
        let mut calc = factory.configure(&layers, FractalKind::Mandel, "", 0).unwrap();
        let first = run_batch(&mut calc, &layers);
        calc.end_batch(true).unwrap();
        let second = run_batch(&mut calc, &layers);
        calc.end_batch(true).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn submit_before_init_is_refused() {
        let layers = layers();
        let factory = ThreadedFactory::new(2, Arc::new(NaiveFactory));
        let mut calc = factory.configure(&layers, FractalKind::Mandel, "", 0).unwrap();
        assert!(calc.submit(0, 0, Complex::new(0.0, 0.0), Complex::new(0.0, 0.0)).is_err());
    }

    #[test]
    fn inner_configuration_problems_fail_the_probe() {
        let layers = layers();
        let factory = ThreadedFactory::new(2, Arc::new(NaiveFactory));
        assert!(factory
            .configure(&layers, FractalKind::Divergent, "x*(", 0)
            .is_err());
        assert!(factory.configure(&layers, FractalKind::Mandel, "", 1).is_err());
    }
}

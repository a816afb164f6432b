// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The worker side of the distributed engine.
//!
//! [`serve`] accepts connections forever and gives each one its own
//! thread and its own calculator, built from whatever engine the worker
//! was told to host.  A session reads one action frame at a time and
//! finishes it completely before looking at the next, so the stream is
//! never interleaved.  A malformed frame or a dead socket ends that
//! session alone; the listener and every other session keep going.

use std::io::{self, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

use tracing::{info, warn};

use calc::{CalcError, CalcResult, Calculator, CalculatorFactory, Engine, FractalKind};
use wire::{
    put_result, read_f64, read_i32, read_i64, read_job, read_layers, read_str, ACTION_BATCH,
    ACTION_CLOSE, ACTION_CONFIGURE, ACTION_END_BATCH, ACTION_END_BATCH_FINAL, ACTION_INIT,
};

/// Accepts calculation sessions on `listener` until the process dies.
/// Every connection gets a thread and a private calculator built from
/// `engine`; a failed accept is logged and the loop moves on.
pub fn serve(listener: TcpListener, engine: &Engine) -> CalcResult<()> {
    let factory: Arc<dyn CalculatorFactory> = Arc::from(engine.factory());
    info!("worker serving {:?} on {}", engine, listener.local_addr()?);
    for stream in listener.incoming() {
        let stream = match stream {
            Ok(s) => s,
            Err(e) => {
                warn!("accept failed: {}", e);
                continue;
            }
        };
        let peer = match stream.peer_addr() {
            Ok(a) => a.to_string(),
            Err(_) => "unknown peer".to_string(),
        };
        let factory = factory.clone();
        thread::spawn(move || {
            info!("session opened by {}", peer);
            match session(factory.as_ref(), stream) {
                Ok(()) => info!("session with {} closed", peer),
                Err(e) => warn!("session with {} failed: {}", peer, e),
            }
        });
    }
    Ok(())
}

/// Runs one connection to completion: frames in, result records out.
fn session(factory: &dyn CalculatorFactory, stream: TcpStream) -> CalcResult<()> {
    stream.set_nodelay(true)?;
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = stream;
    let mut calc: Option<Box<dyn Calculator>> = None;

    loop {
        let tag = match read_i32(&mut reader) {
            Ok(tag) => tag,
            // a client that simply vanishes at a frame boundary is no
            // worse than one that said goodbye
            Err(CalcError::Io(ref e)) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        };
        match tag {
            ACTION_CONFIGURE => {
                let layers = read_layers(&mut reader)?;
                let code = read_i32(&mut reader)?;
                let formula = read_str(&mut reader)?;
                let default_layer = read_i32(&mut reader)?;
                let kind = FractalKind::from_code(code)
                    .ok_or_else(|| CalcError::protocol(format!("unknown fractal kind code {}", code)))?;
                if default_layer < 0 {
                    return Err(CalcError::protocol(format!(
                        "negative default layer index {}",
                        default_layer
                    )));
                }
                calc = Some(factory.configure(&layers, kind, &formula, default_layer as usize)?);
            }
            ACTION_INIT => {
                let layers = read_layers(&mut reader)?;
                let param = read_f64(&mut reader)?;
                let expected = read_i64(&mut reader)?.max(0) as usize;
                let calc = calc
                    .as_mut()
                    .ok_or_else(|| CalcError::protocol("init before configure"))?;
                calc.init(&layers, param, expected)?;
            }
            ACTION_BATCH => {
                let count = read_i32(&mut reader)?;
                if count < 0 {
                    return Err(CalcError::protocol(format!("negative batch count {}", count)));
                }
                let calc = calc
                    .as_mut()
                    .ok_or_else(|| CalcError::protocol("batch before configure"))?;
                for _ in 0..count {
                    let job = read_job(&mut reader)?;
                    calc.submit(job.px, job.py, job.start, job.constant)?;
                }
                calc.flush()?;
                let mut response = Vec::new();
                let mut served = 0usize;
                while let Some(result) = calc.take() {
                    put_result(&mut response, &result);
                    served += 1;
                }
                if served != count as usize {
                    return Err(CalcError::protocol(format!(
                        "engine produced {} results for a batch of {}",
                        served, count
                    )));
                }
                writer.write_all(&response)?;
            }
            ACTION_END_BATCH | ACTION_END_BATCH_FINAL => {
                let calc = calc
                    .as_mut()
                    .ok_or_else(|| CalcError::protocol("end of batch before configure"))?;
                calc.end_batch(tag == ACTION_END_BATCH_FINAL)?;
            }
            ACTION_CLOSE => return Ok(()),
            other => return Err(CalcError::protocol(format!("unknown action tag {}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener;

    use num::Complex;

    use calc::{CalculatorFactory, PointResult};
    use layer::{OrbitTrap, ProcessLayer, SeqCheck, SeqType};
    use naive::NaiveFactory;
    use remote::RemoteFactory;

    fn spawn_worker(engine: Engine) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        thread::spawn(move || {
            let _ = serve(listener, &engine);
        });
        addr
    }

    /// The showcase stack: a plain layer plus three statistics layers
    /// over the same formula orbit.
    fn stats_stack() -> Vec<ProcessLayer> {
        let mut plain = ProcessLayer::new(40.0, 64);
        plain.default = true;

        let mut spread = ProcessLayer::new(64.0, 64);
        spread.seqtype = SeqType::StdDev;
        spread.checktype = SeqCheck::Triangle;
        spread.checkseqtype = SeqType::StdDev;

        let mut near_one = ProcessLayer::new(4.0, 64);
        near_one.seqtype = SeqType::Mean;
        near_one.checktype = SeqCheck::OrbitTrap;
        near_one.traptype = OrbitTrap::Line;
        near_one.point_a = Complex::new(1.0, 0.0);
        near_one.checkseqtype = SeqType::Min;

        let mut near_axis = near_one.clone();
        near_axis.point_a = Complex::new(0.0, 0.0);

        vec![plain, spread, near_one, near_axis]
    }

    fn grid() -> Vec<(i32, i32, Complex<f64>)> {
        let mut points = Vec::new();
        for py in 0..4 {
            for px in 0..6 {
                let point = Complex::new(-2.2 + px as f64 * 0.55, -1.1 + py as f64 * 0.6);
                points.push((px, py, point));
            }
        }
        points
    }

    fn run_frame(factory: &dyn CalculatorFactory, layers: &[ProcessLayer]) -> Vec<PointResult> {
        let mut calc = factory
            .configure(layers, FractalKind::Divergent, "x*x+c-1.0/n", 0)
            .unwrap();
        calc.init(layers, 0.0, grid().len()).unwrap();
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
    fn loopback_worker_matches_local_evaluation() {
        let addr = spawn_worker(Engine::Naive);
        let remote = RemoteFactory::new(vec![addr]);
        let layers = stats_stack();
        let over_the_wire = run_frame(&remote, &layers);
        let local = run_frame(&NaiveFactory, &layers);
        assert_eq!(over_the_wire.len(), grid().len());
        assert_eq!(over_the_wire, local);
    }

    #[test]
    fn two_workers_split_one_frame() {
        let first = spawn_worker(Engine::Naive);
        let second = spawn_worker(Engine::Compiled);
        let remote = RemoteFactory::new(vec![first, second]);
        let layers = stats_stack();
        let sharded = run_frame(&remote, &layers);
        let local = run_frame(&NaiveFactory, &layers);
        assert_eq!(sharded, local);
    }

    #[test]
    fn a_bad_client_does_not_stop_the_worker() {
        let addr = spawn_worker(Engine::Naive);

        let mut garbage = TcpStream::connect(&addr).unwrap();
        garbage.write_all(&77i32.to_le_bytes()).unwrap();
        let mut scratch = [0u8; 1];
        // the worker drops the session rather than answering
        assert!(matches!(garbage.read(&mut scratch), Ok(0) | Err(_)));

        let remote = RemoteFactory::new(vec![addr]);
        let layers = stats_stack();
        let results = run_frame(&remote, &layers);
        assert_eq!(results.len(), grid().len());
    }

    #[test]
    fn batches_can_repeat_within_a_frame() {
        let addr = spawn_worker(Engine::Naive);
        let remote = RemoteFactory::new(vec![addr]);
        let mut pl = ProcessLayer::new(4.0, 40);
        pl.default = true;
        let layers = vec![pl];

        let mut calc = remote
            .configure(&layers, FractalKind::Mandel, "", 0)
            .unwrap();
        calc.init(&layers, 0.0, 2).unwrap();
        let mut seen = Vec::new();
        for round in 0..3 {
            for px in 0..2 {
                let point = Complex::new(-1.5 + px as f64, -0.8 + round as f64 * 0.8);
                calc.submit(px, round, point, point).unwrap();
            }
            calc.flush().unwrap();
            while let Some(r) = calc.take() {
                seen.push((r.px, r.py));
            }
            calc.end_batch(round == 2).unwrap();
        }
        seen.sort();
        assert_eq!(seen.len(), 6);
        assert_eq!(seen[0], (0, 0));
        assert_eq!(seen[5], (1, 2));
    }
}

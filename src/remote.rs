//! The distributed engine: point evaluation farmed out to worker
//! processes over TCP.
//!
//! One connection is opened per peer when the engine is configured, and
//! configuration travels immediately so every worker holds an identical
//! calculator before the first point arrives.  Submitted points are
//! sharded round robin by submission order; `flush` sends each peer its
//! batch and reads the full reply before moving to the next peer, so a
//! session is always in strict request/response lockstep.  When a peer
//! dies mid-frame the results read from the surviving peers are kept
//! and the failure is reported after the round completes.

use std::collections::VecDeque;
use std::io::{BufReader, Write};
use std::net::TcpStream;

use num::Complex;
use tracing::{debug, warn};

use calc::{
    check_configure, check_init, CalcError, CalcResult, Calculator, CalculatorFactory,
    FractalKind, PointJob, PointResult,
};
use formula::Formula;
use layer::ProcessLayer;
use wire::{
    put_f64, put_i32, put_i64, put_job, put_layers, put_str, read_result, ACTION_BATCH,
    ACTION_CLOSE, ACTION_CONFIGURE, ACTION_END_BATCH, ACTION_END_BATCH_FINAL, ACTION_INIT,
};

/// Factory for calculators backed by remote worker processes.
pub struct RemoteFactory {
    peers: Vec<String>,
}

impl RemoteFactory {
    /// Remembers the worker addresses to connect to.  Nothing is
    /// contacted until a calculator is configured.
    pub fn new(peers: Vec<String>) -> RemoteFactory {
        RemoteFactory { peers }
    }
}

impl CalculatorFactory for RemoteFactory {
    fn configure(
        &self,
        layers: &[ProcessLayer],
        kind: FractalKind,
        formula: &str,
        default_layer: usize,
    ) -> CalcResult<Box<dyn Calculator>> {
        if self.peers.is_empty() {
            return Err(CalcError::config("no worker addresses given"));
        }
        check_configure(layers, default_layer)?;
        if kind.uses_formula() {
            // validated locally so a bad formula never reaches the wire
            Formula::parse(formula)?;
        }

        let mut frame = Vec::new();
        put_i32(&mut frame, ACTION_CONFIGURE);
        put_layers(&mut frame, layers);
        put_i32(&mut frame, kind as i32);
        put_str(&mut frame, formula);
        put_i32(&mut frame, default_layer as i32);

        let mut peers = Vec::with_capacity(self.peers.len());
        for addr in &self.peers {
            let mut peer = Peer::connect(addr)?;
            peer.send(&frame)?;
            debug!("configured worker at {}", addr);
            peers.push(peer);
        }
        Ok(Box::new(RemoteCalculator {
            templates: layers.to_vec(),
            peers,
            seq: 0,
            ready: VecDeque::new(),
        }))
    }
}

/// One connected worker with the jobs queued for its next batch.
struct Peer {
    addr: String,
    stream: TcpStream,
    reader: BufReader<TcpStream>,
    jobs: Vec<PointJob>,
}

impl Peer {
    fn connect(addr: &str) -> CalcResult<Peer> {
        let stream =
            TcpStream::connect(addr).map_err(|e| CalcError::connection(addr, e))?;
        stream
            .set_nodelay(true)
            .map_err(|e| CalcError::connection(addr, e))?;
        let reader = BufReader::new(
            stream
                .try_clone()
                .map_err(|e| CalcError::connection(addr, e))?,
        );
        Ok(Peer {
            addr: addr.to_string(),
            stream,
            reader,
            jobs: Vec::new(),
        })
    }

    fn send(&mut self, frame: &[u8]) -> CalcResult<()> {
        self.stream
            .write_all(frame)
            .map_err(|e| CalcError::connection(self.addr.clone(), e))
    }

    /// Sends the queued batch and reads one result per job.
    fn exchange(&mut self, templates: &[ProcessLayer]) -> CalcResult<Vec<PointResult>> {
        let mut frame = Vec::with_capacity(8 + self.jobs.len() * 40);
        put_i32(&mut frame, ACTION_BATCH);
        put_i32(&mut frame, self.jobs.len() as i32);
        for job in &self.jobs {
            put_job(&mut frame, job);
        }
        self.stream
            .write_all(&frame)
            .map_err(|e| CalcError::connection(self.addr.clone(), e))?;

        let mut results = Vec::with_capacity(self.jobs.len());
        for _ in 0..self.jobs.len() {
            let result = read_result(&mut self.reader, templates).map_err(|e| match e {
                CalcError::Io(cause) => CalcError::connection(self.addr.clone(), cause),
                other => other,
            })?;
            results.push(result);
        }
        Ok(results)
    }
}

/// A calculator whose evaluation happens on the far side of one or more
/// TCP connections.
struct RemoteCalculator {
    templates: Vec<ProcessLayer>,
    peers: Vec<Peer>,
    seq: usize,
    ready: VecDeque<PointResult>,
}

impl Calculator for RemoteCalculator {
    fn init(&mut self, layers: &[ProcessLayer], param: f64, expected: usize) -> CalcResult<()> {
        check_init(&self.templates, layers)?;
        let mut frame = Vec::new();
        put_i32(&mut frame, ACTION_INIT);
        put_layers(&mut frame, layers);
        put_f64(&mut frame, param);
        put_i64(&mut frame, expected as i64);
        for peer in &mut self.peers {
            peer.send(&frame)?;
        }
        self.seq = 0;
        Ok(())
    }

    fn submit(
        &mut self,
        px: i32,
        py: i32,
        start: Complex<f64>,
        constant: Complex<f64>,
    ) -> CalcResult<()> {
        let slot = self.seq % self.peers.len();
        self.seq += 1;
        self.peers[slot].jobs.push(PointJob { px, py, start, constant });
        Ok(())
    }

    fn flush(&mut self) -> CalcResult<()> {
        let mut failure = None;
        for peer in &mut self.peers {
            if peer.jobs.is_empty() {
                continue;
            }
            match peer.exchange(&self.templates) {
                Ok(results) => self.ready.extend(results),
                Err(e) => {
                    warn!("worker at {} failed mid-batch: {}", peer.addr, e);
                    if failure.is_none() {
                        failure = Some(e);
                    }
                }
            }
            peer.jobs.clear();
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn take(&mut self) -> Option<PointResult> {
        self.ready.pop_front()
    }

    fn end_batch(&mut self, is_final: bool) -> CalcResult<()> {
        let tag = if is_final { ACTION_END_BATCH_FINAL } else { ACTION_END_BATCH };
        let mut frame = Vec::new();
        put_i32(&mut frame, tag);
        for peer in &mut self.peers {
            peer.send(&frame)?;
        }
        Ok(())
    }
}

impl Drop for RemoteCalculator {
    fn drop(&mut self) {
        let mut frame = Vec::new();
        put_i32(&mut frame, ACTION_CLOSE);
        for peer in &mut self.peers {
            // a peer that is already gone cannot be told goodbye
            let _ = peer.stream.write_all(&frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;
    use wire::{put_result, read_f64, read_i32, read_i64, read_job, read_layers, read_str};

    fn layers() -> Vec<ProcessLayer> {
        let mut pl = ProcessLayer::new(4.0, 40);
        pl.default = true;
        vec![pl]
    }

    /// A worker that answers one configure, one init, and one batch,
    /// echoing each job back as a freshly started layer stack.  Returns
    /// how many jobs the batch carried.  With `reply` false it reads
    /// the batch and hangs up without answering.
    fn scripted_peer(listener: TcpListener, reply: bool) -> thread::JoinHandle<usize> {
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());

            assert_eq!(read_i32(&mut reader).unwrap(), ACTION_CONFIGURE);
            let templates = read_layers(&mut reader).unwrap();
            read_i32(&mut reader).unwrap();
            read_str(&mut reader).unwrap();
            read_i32(&mut reader).unwrap();

            assert_eq!(read_i32(&mut reader).unwrap(), ACTION_INIT);
            read_layers(&mut reader).unwrap();
            read_f64(&mut reader).unwrap();
            read_i64(&mut reader).unwrap();

            assert_eq!(read_i32(&mut reader).unwrap(), ACTION_BATCH);
            let count = read_i32(&mut reader).unwrap();
            let mut response = Vec::new();
            for _ in 0..count {
                let job = read_job(&mut reader).unwrap();
                let mut filled = templates.clone();
                for pl in &mut filled {
                    pl.begin_point(job.start);
                }
                put_result(&mut response, &PointResult { px: job.px, py: job.py, layers: filled });
            }
            if reply {
                stream.write_all(&response).unwrap();
            }
            count as usize
        })
    }

    fn listener() -> (TcpListener, String) {
        let l = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = l.local_addr().unwrap().to_string();
        (l, addr)
    }

    #[test]
    fn configure_without_peers_is_refused() {
        let factory = RemoteFactory::new(Vec::new());
        assert!(factory
            .configure(&layers(), FractalKind::Mandel, "", 0)
            .is_err());
    }

    #[test]
    fn bad_formula_fails_before_any_connection() {
        // nothing listens at this address; a formula error must win
        let factory = RemoteFactory::new(vec!["127.0.0.1:9".to_string()]);
        match factory.configure(&layers(), FractalKind::Divergent, "x*(", 0) {
            Err(CalcError::Formula { .. }) => {}
            other => panic!("expected a formula error, got {:?}", other.err()),
        }
    }

    #[test]
    fn unreachable_peer_reports_a_connection_error() {
        let (l, addr) = listener();
        drop(l);
        let factory = RemoteFactory::new(vec![addr]);
        match factory.configure(&layers(), FractalKind::Mandel, "", 0) {
            Err(CalcError::Connection { .. }) => {}
            other => panic!("expected a connection error, got {:?}", other.err()),
        }
    }

    #[test]
    fn jobs_shard_round_robin_across_peers() {
        let (la, addr_a) = listener();
        let (lb, addr_b) = listener();
        let ha = scripted_peer(la, true);
        let hb = scripted_peer(lb, true);

        let stack = layers();
        let factory = RemoteFactory::new(vec![addr_a, addr_b]);
        let mut calc = factory
            .configure(&stack, FractalKind::Mandel, "", 0)
            .unwrap();
        calc.init(&stack, 0.0, 5).unwrap();
        for px in 0..5 {
            calc.submit(px, 0, Complex::new(0.0, 0.0), Complex::new(0.0, 0.0))
                .unwrap();
        }
        calc.flush().unwrap();

        let mut seen = Vec::new();
        while let Some(result) = calc.take() {
            assert!(result.layers[0].active);
            seen.push(result.px);
        }
        seen.sort();
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        drop(calc);

        // odd-indexed submissions went to the second peer
        assert_eq!(ha.join().unwrap(), 3);
        assert_eq!(hb.join().unwrap(), 2);
    }

    #[test]
    fn one_dead_peer_keeps_the_survivors_results() {
        let (la, addr_a) = listener();
        let (lb, addr_b) = listener();
        let ha = scripted_peer(la, true);
        let hb = scripted_peer(lb, false);

        let stack = layers();
        let factory = RemoteFactory::new(vec![addr_a, addr_b]);
        let mut calc = factory
            .configure(&stack, FractalKind::Mandel, "", 0)
            .unwrap();
        calc.init(&stack, 0.0, 4).unwrap();
        for px in 0..4 {
            calc.submit(px, 0, Complex::new(0.0, 0.0), Complex::new(0.0, 0.0))
                .unwrap();
        }
        match calc.flush() {
            Err(CalcError::Connection { .. }) => {}
            other => panic!("expected a connection error, got {:?}", other),
        }

        let mut seen = Vec::new();
        while let Some(result) = calc.take() {
            seen.push(result.px);
        }
        seen.sort();
        assert_eq!(seen, vec![0, 2]);
        drop(calc);
        assert_eq!(ha.join().unwrap(), 2);
        assert_eq!(hb.join().unwrap(), 2);
    }
}

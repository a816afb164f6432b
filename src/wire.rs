//! Binary framing for the distributed engine.
//!
//! Client and server exchange little-endian frames over TCP: an action
//! tag (`i32`) followed by an action-specific payload.  Everything the
//! two sides share — layer configurations, point jobs, and per-layer
//! results — has an explicit fixed layout here, so a frame produced by
//! one build decodes bit-for-bit on another.
//!
//! Encoding appends to a `Vec<u8>` so a whole frame goes out in one
//! write; decoding pulls from any [`Read`] and reports truncation as an
//! I/O failure and nonsense codes as a protocol violation.

use std::io::Read;

use num::Complex;

use calc::{CalcError, CalcResult, PointJob, PointResult};
use layer::{ConvCheck, OrbitTrap, ProcessLayer, SeqCheck, SeqType};

/// Frame tag: start a frame (layer list, run parameter, batch size hint).
pub const ACTION_INIT: i32 = 0;
/// Frame tag: configure the session's calculator.
pub const ACTION_CONFIGURE: i32 = 1;
/// Frame tag: a batch of point jobs; the reply is one result per job.
pub const ACTION_BATCH: i32 = 3;
/// Frame tag: the current batch is done but the frame continues.
pub const ACTION_END_BATCH: i32 = 4;
/// Frame tag: the current batch ends the frame.
pub const ACTION_END_BATCH_FINAL: i32 = 5;
/// Frame tag: the client is finished with this session.
pub const ACTION_CLOSE: i32 = -1;

// -- encoding ----------------------------------------------------------

/// Appends a little-endian `i32`.
pub fn put_i32(buf: &mut Vec<u8>, v: i32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

/// Appends a little-endian `i64`.
pub fn put_i64(buf: &mut Vec<u8>, v: i64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

/// Appends a little-endian `f64`.
pub fn put_f64(buf: &mut Vec<u8>, v: f64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

/// Appends a complex number as real then imaginary parts.
pub fn put_complex(buf: &mut Vec<u8>, v: Complex<f64>) {
    put_f64(buf, v.re);
    put_f64(buf, v.im);
}

/// Appends a string as a `u32` byte length and its UTF-8 bytes.
pub fn put_str(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

/// Appends a layer list: a count and each layer's configuration.  Only
/// configuration travels; the receiving side starts from fresh state.
pub fn put_layers(buf: &mut Vec<u8>, layers: &[ProcessLayer]) {
    put_i32(buf, layers.len() as i32);
    for pl in layers {
        put_f64(buf, pl.bailout);
        put_i32(buf, pl.nlimit);
        put_i32(buf, pl.convcheck as i32);
        put_i32(buf, pl.seqtype as i32);
        put_i32(buf, pl.checktype as i32);
        put_i32(buf, pl.checkseqtype as i32);
        put_i32(buf, pl.traptype as i32);
        put_complex(buf, pl.point_a);
        put_complex(buf, pl.point_b);
        put_i32(buf, pl.default as i32);
    }
}

/// Appends one 40-byte point job record.
pub fn put_job(buf: &mut Vec<u8>, job: &PointJob) {
    put_i32(buf, job.px);
    put_i32(buf, job.py);
    put_complex(buf, job.start);
    put_complex(buf, job.constant);
}

/// Appends one result record: the pixel address and every layer's final
/// state, 112 bytes per layer.
pub fn put_result(buf: &mut Vec<u8>, result: &PointResult) {
    put_i32(buf, result.px);
    put_i32(buf, result.py);
    for pl in &result.layers {
        put_complex(buf, pl.old2x);
        put_complex(buf, pl.oldx);
        put_complex(buf, pl.x);
        put_complex(buf, pl.resx);
        put_f64(buf, pl.calc);
        put_f64(buf, pl.cmean);
        put_f64(buf, pl.cvarsx);
        put_f64(buf, pl.cvariance);
        put_i32(buf, pl.active as i32);
        put_i32(buf, pl.isin as i32);
        put_i32(buf, pl.n);
        put_i32(buf, pl.resn);
    }
}

// -- decoding ----------------------------------------------------------

/// Reads a little-endian `i32`.
pub fn read_i32<R: Read>(r: &mut R) -> CalcResult<i32> {
    let mut raw = [0u8; 4];
    r.read_exact(&mut raw)?;
    Ok(i32::from_le_bytes(raw))
}

/// Reads a little-endian `i64`.
pub fn read_i64<R: Read>(r: &mut R) -> CalcResult<i64> {
    let mut raw = [0u8; 8];
    r.read_exact(&mut raw)?;
    Ok(i64::from_le_bytes(raw))
}

/// Reads a little-endian `f64`.
pub fn read_f64<R: Read>(r: &mut R) -> CalcResult<f64> {
    let mut raw = [0u8; 8];
    r.read_exact(&mut raw)?;
    Ok(f64::from_le_bytes(raw))
}

/// Reads a complex number written by [`put_complex`].
pub fn read_complex<R: Read>(r: &mut R) -> CalcResult<Complex<f64>> {
    let re = read_f64(r)?;
    let im = read_f64(r)?;
    Ok(Complex::new(re, im))
}

/// Reads a string written by [`put_str`].
pub fn read_str<R: Read>(r: &mut R) -> CalcResult<String> {
    let mut raw = [0u8; 4];
    r.read_exact(&mut raw)?;
    let len = u32::from_le_bytes(raw) as usize;
    if len > 65536 {
        return Err(CalcError::protocol(format!("string length {} is absurd", len)));
    }
    let mut bytes = vec![0u8; len];
    r.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|_| CalcError::protocol("string is not UTF-8"))
}

fn conv_check_from(code: i32) -> CalcResult<ConvCheck> {
    match code {
        1 => Ok(ConvCheck::Normal),
        2 => Ok(ConvCheck::Real),
        4 => Ok(ConvCheck::Imag),
        8 => Ok(ConvCheck::Or),
        16 => Ok(ConvCheck::And),
        32 => Ok(ConvCheck::Manh),
        64 => Ok(ConvCheck::ManR),
        _ => Err(CalcError::protocol(format!("unknown convergence check code {}", code))),
    }
}

fn seq_type_from(code: i32) -> CalcResult<SeqType> {
    match code {
        0 => Ok(SeqType::Normal),
        1 => Ok(SeqType::Sum),
        2 => Ok(SeqType::Mean),
        4 => Ok(SeqType::VarSx),
        8 => Ok(SeqType::Variance),
        16 => Ok(SeqType::StdDev),
        32 => Ok(SeqType::Min),
        64 => Ok(SeqType::Max),
        128 => Ok(SeqType::Delta),
        _ => Err(CalcError::protocol(format!("unknown sequence type code {}", code))),
    }
}

fn seq_check_from(code: i32) -> CalcResult<SeqCheck> {
    match code {
        1 => Ok(SeqCheck::Normal),
        2 => Ok(SeqCheck::Smooth),
        4 => Ok(SeqCheck::Triangle),
        8 => Ok(SeqCheck::TriangleSmooth),
        16 => Ok(SeqCheck::OrbitTrap),
        32 => Ok(SeqCheck::Real),
        64 => Ok(SeqCheck::Imag),
        128 => Ok(SeqCheck::Arg),
        256 => Ok(SeqCheck::Abs),
        512 => Ok(SeqCheck::Curvature),
        _ => Err(CalcError::protocol(format!("unknown measurement code {}", code))),
    }
}

fn orbit_trap_from(code: i32) -> CalcResult<OrbitTrap> {
    match code {
        1 => Ok(OrbitTrap::Point),
        2 => Ok(OrbitTrap::Line),
        4 => Ok(OrbitTrap::Gauss),
        _ => Err(CalcError::protocol(format!("unknown trap shape code {}", code))),
    }
}

/// Reads a layer list written by [`put_layers`].
pub fn read_layers<R: Read>(r: &mut R) -> CalcResult<Vec<ProcessLayer>> {
    let count = read_i32(r)?;
    if count < 0 {
        return Err(CalcError::protocol(format!("negative layer count {}", count)));
    }
    let mut layers = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let bailout = read_f64(r)?;
        let nlimit = read_i32(r)?;
        let mut pl = ProcessLayer::new(bailout, nlimit);
        pl.convcheck = conv_check_from(read_i32(r)?)?;
        pl.seqtype = seq_type_from(read_i32(r)?)?;
        pl.checktype = seq_check_from(read_i32(r)?)?;
        pl.checkseqtype = seq_type_from(read_i32(r)?)?;
        pl.traptype = orbit_trap_from(read_i32(r)?)?;
        pl.point_a = read_complex(r)?;
        pl.point_b = read_complex(r)?;
        pl.default = read_i32(r)? != 0;
        layers.push(pl);
    }
    Ok(layers)
}

/// Reads one point job record written by [`put_job`].
pub fn read_job<R: Read>(r: &mut R) -> CalcResult<PointJob> {
    let px = read_i32(r)?;
    let py = read_i32(r)?;
    let start = read_complex(r)?;
    let constant = read_complex(r)?;
    Ok(PointJob { px, py, start, constant })
}

/// Reads one result record written by [`put_result`].  The record only
/// carries state, so the receiver rebuilds each layer by cloning its
/// configured template and overwriting the state fields.
pub fn read_result<R: Read>(r: &mut R, templates: &[ProcessLayer]) -> CalcResult<PointResult> {
    let px = read_i32(r)?;
    let py = read_i32(r)?;
    let mut layers = Vec::with_capacity(templates.len());
    for template in templates {
        let mut pl = template.clone();
        pl.old2x = read_complex(r)?;
        pl.oldx = read_complex(r)?;
        pl.x = read_complex(r)?;
        pl.resx = read_complex(r)?;
        pl.calc = read_f64(r)?;
        pl.cmean = read_f64(r)?;
        pl.cvarsx = read_f64(r)?;
        pl.cvariance = read_f64(r)?;
        pl.active = read_i32(r)? != 0;
        pl.isin = read_i32(r)? != 0;
        pl.n = read_i32(r)?;
        pl.resn = read_i32(r)?;
        layers.push(pl);
    }
    Ok(PointResult { px, py, layers })
}

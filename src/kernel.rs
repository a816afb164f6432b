// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The kernel engine: layer evaluation as a generated compute shader.
//!
//! `configure` assembles a WGSL kernel specialized for the layer stack
//! the same way the compiled engine specializes closures: every branch
//! the interpreted engine would take per iteration is resolved while
//! the source is written, and bailouts, iteration limits, and trap
//! points are baked in as literals.  Each point becomes one invocation;
//! each layer gets one read-write storage buffer of 64-byte records.
//!
//! The device does all arithmetic in `f32`, so results converge with
//! the other engines' `f64` answers rather than matching them bit for
//! bit.  A `flush` is one round trip: upload, dispatch, copy to a
//! staging buffer, and a single blocking map.
//!
//! Layers whose measurement needs the fractional smoothing pass are
//! refused while the source is generated, as is any stack deeper than
//! the storage-buffer budget of common adapters.

use std::collections::VecDeque;
use std::sync::mpsc;

use bytemuck::{Pod, Zeroable};
use num::Complex;
use tracing::{debug, info};

use calc::{
    check_configure, check_init, CalcError, CalcResult, Calculator, CalculatorFactory,
    FractalKind, PointJob, PointResult,
};
use formula::{BinOp, Expr, Formula, Func, Var};
use layer::{ConvCheck, OrbitTrap, ProcessLayer, SeqCheck, SeqModes, SeqType};

/// Two read-only inputs plus one output per layer must fit in the
/// eight storage-buffer bindings baseline adapters guarantee.
const MAX_LAYERS: usize = 6;

const WORKGROUP_SIZE: u32 = 256;

/// Uniform block shared by every invocation of one dispatch.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
struct GpuParams {
    count: u32,
    param: f32,
    _pad0: u32,
    _pad1: u32,
}

/// One layer's state as the shader writes it back, matching the WGSL
/// `LayerOut` struct member for member.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
struct LayerOut {
    old2x: [f32; 2],
    oldx: [f32; 2],
    x: [f32; 2],
    resx: [f32; 2],
    calc: f32,
    cmean: f32,
    cvarsx: f32,
    cvariance: f32,
    active: i32,
    isin: i32,
    n: i32,
    resn: i32,
}

/// Factory for calculators that run as generated compute kernels.
pub struct KernelFactory;

impl CalculatorFactory for KernelFactory {
    fn configure(
        &self,
        layers: &[ProcessLayer],
        kind: FractalKind,
        formula: &str,
        default_layer: usize,
    ) -> CalcResult<Box<dyn Calculator>> {
        check_configure(layers, default_layer)?;
        if layers.len() > MAX_LAYERS {
            return Err(CalcError::config(format!(
                "the kernel engine supports at most {} layers, got {}",
                MAX_LAYERS,
                layers.len()
            )));
        }
        let program = if kind.uses_formula() {
            Some(Formula::parse(formula)?)
        } else {
            None
        };
        let source = kernel_source(layers, kind, program.as_ref(), default_layer)?;
        debug!("generated a {} byte kernel for {} layers", source.len(), layers.len());

        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .map_err(|e| CalcError::device(format!("no usable adapter: {}", e)))?;
        let info = adapter.get_info();
        info!("kernel engine using {} ({:?})", info.name, info.backend);

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("layer kernel device"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            memory_hints: wgpu::MemoryHints::Performance,
            trace: Default::default(),
            experimental_features: wgpu::ExperimentalFeatures::disabled(),
        }))
        .map_err(|e| CalcError::device(format!("device request failed: {}", e)))?;

        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("layer kernel"),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });

        let mut entries = vec![
            storage_entry(0, true),
            storage_entry(1, true),
            wgpu::BindGroupLayoutEntry {
                binding: 2,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            },
        ];
        for i in 0..layers.len() {
            entries.push(storage_entry(3 + i as u32, false));
        }
        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("layer kernel bindings"),
            entries: &entries,
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("layer kernel layout"),
            bind_group_layouts: &[&layout],
            immediate_size: 0,
        });
        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("layer kernel pipeline"),
            layout: Some(&pipeline_layout),
            module: &module,
            entry_point: Some("main"),
            compilation_options: Default::default(),
            cache: None,
        });

        Ok(Box::new(KernelCalculator {
            device,
            queue,
            pipeline,
            layout,
            templates: layers.to_vec(),
            param: 0.0,
            jobs: VecDeque::new(),
            ready: VecDeque::new(),
        }))
    }
}

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

struct KernelCalculator {
    device: wgpu::Device,
    queue: wgpu::Queue,
    pipeline: wgpu::ComputePipeline,
    layout: wgpu::BindGroupLayout,
    templates: Vec<ProcessLayer>,
    param: f64,
    jobs: VecDeque<PointJob>,
    ready: VecDeque<PointResult>,
}

impl Calculator for KernelCalculator {
    fn init(&mut self, layers: &[ProcessLayer], param: f64, _expected: usize) -> CalcResult<()> {
        check_init(&self.templates, layers)?;
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
        if self.jobs.is_empty() {
            return Ok(());
        }
        let jobs: Vec<PointJob> = self.jobs.drain(..).collect();
        let count = jobs.len();
        let nlayers = self.templates.len();

        let mut inx = Vec::with_capacity(count);
        let mut inc = Vec::with_capacity(count);
        for job in &jobs {
            inx.push([job.start.re as f32, job.start.im as f32]);
            inc.push([job.constant.re as f32, job.constant.im as f32]);
        }
        let layer_bytes = (count * std::mem::size_of::<LayerOut>()) as u64;

        let in_x = self.input_buffer("kernel starts", &inx);
        let in_c = self.input_buffer("kernel constants", &inc);
        let params = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("kernel params"),
            size: std::mem::size_of::<GpuParams>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        self.queue.write_buffer(
            &params,
            0,
            bytemuck::bytes_of(&GpuParams {
                count: count as u32,
                param: self.param as f32,
                _pad0: 0,
                _pad1: 0,
            }),
        );
        let mut outputs = Vec::with_capacity(nlayers);
        for _ in 0..nlayers {
            outputs.push(self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("kernel layer out"),
                size: layer_bytes,
                usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
                mapped_at_creation: false,
            }));
        }
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("kernel staging"),
            size: layer_bytes * nlayers as u64,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut entries = vec![
            wgpu::BindGroupEntry { binding: 0, resource: in_x.as_entire_binding() },
            wgpu::BindGroupEntry { binding: 1, resource: in_c.as_entire_binding() },
            wgpu::BindGroupEntry { binding: 2, resource: params.as_entire_binding() },
        ];
        for (i, buf) in outputs.iter().enumerate() {
            entries.push(wgpu::BindGroupEntry {
                binding: 3 + i as u32,
                resource: buf.as_entire_binding(),
            });
        }
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("kernel bind group"),
            layout: &self.layout,
            entries: &entries,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("kernel flush") });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("kernel pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            let groups = (count as u32 + WORKGROUP_SIZE - 1) / WORKGROUP_SIZE;
            debug!("dispatching {} points over {} workgroups", count, groups);
            pass.dispatch_workgroups(groups, 1, 1);
        }
        for (i, buf) in outputs.iter().enumerate() {
            encoder.copy_buffer_to_buffer(buf, 0, &staging, layer_bytes * i as u64, layer_bytes);
        }
        self.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.device
            .poll(wgpu::PollType::Wait {
                submission_index: None,
                timeout: None,
            })
            .map_err(|e| CalcError::device(format!("device poll failed: {:?}", e)))?;
        rx.recv()
            .map_err(|e| CalcError::device(format!("map result never arrived: {}", e)))?
            .map_err(|e| CalcError::device(format!("staging map failed: {:?}", e)))?;

        {
            let data = slice.get_mapped_range();
            let records: &[LayerOut] = bytemuck::cast_slice(&data);
            for (i, job) in jobs.iter().enumerate() {
                let mut filled = Vec::with_capacity(nlayers);
                for (l, template) in self.templates.iter().enumerate() {
                    let rec = &records[l * count + i];
                    let mut pl = template.clone();
                    pl.old2x = widen(rec.old2x);
                    pl.oldx = widen(rec.oldx);
                    pl.x = widen(rec.x);
                    pl.resx = widen(rec.resx);
                    pl.calc = rec.calc as f64;
                    pl.cmean = rec.cmean as f64;
                    pl.cvarsx = rec.cvarsx as f64;
                    pl.cvariance = rec.cvariance as f64;
                    pl.active = rec.active != 0;
                    pl.isin = rec.isin != 0;
                    pl.n = rec.n;
                    pl.resn = rec.resn;
                    filled.push(pl);
                }
                self.ready.push_back(PointResult { px: job.px, py: job.py, layers: filled });
            }
        }
        staging.unmap();
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

impl KernelCalculator {
    fn input_buffer(&self, label: &str, values: &[[f32; 2]]) -> wgpu::Buffer {
        let buf = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: (values.len() * 8) as u64,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        self.queue.write_buffer(&buf, 0, bytemuck::cast_slice(values));
        buf
    }
}

fn widen(v: [f32; 2]) -> Complex<f64> {
    Complex::new(v[0] as f64, v[1] as f64)
}

/// An `f32` literal in shader syntax.
fn lit(v: f64) -> String {
    format!("{:?}f", v as f32)
}

/// Complex helper functions and the layer record, shared by every
/// generated kernel.
const PRELUDE: &str = r#"fn cmul(a: vec2<f32>, b: vec2<f32>) -> vec2<f32> {
    return vec2<f32>(a.x * b.x - a.y * b.y, a.y * b.x + a.x * b.y);
}

fn cdiv(a: vec2<f32>, b: vec2<f32>) -> vec2<f32> {
    let d = b.x * b.x + b.y * b.y;
    return vec2<f32>((a.x * b.x + a.y * b.y) / d, (a.y * b.x - a.x * b.y) / d);
}

fn cnormsq(a: vec2<f32>) -> f32 {
    return a.x * a.x + a.y * a.y;
}

fn cabs(a: vec2<f32>) -> f32 {
    return sqrt(cnormsq(a));
}

fn carg(a: vec2<f32>) -> f32 {
    return atan2(a.y, a.x);
}

fn cln(a: vec2<f32>) -> vec2<f32> {
    return vec2<f32>(log(cabs(a)), carg(a));
}

fn cexp(a: vec2<f32>) -> vec2<f32> {
    let r = exp(a.x);
    return vec2<f32>(r * cos(a.y), r * sin(a.y));
}

fn cpowf(a: vec2<f32>, p: f32) -> vec2<f32> {
    if (cnormsq(a) == 0.0f) {
        return vec2<f32>(0.0f, 0.0f);
    }
    let r = pow(cabs(a), p);
    let t = carg(a) * p;
    return vec2<f32>(r * cos(t), r * sin(t));
}

fn cpow(a: vec2<f32>, b: vec2<f32>) -> vec2<f32> {
    if (cnormsq(a) == 0.0f) {
        return vec2<f32>(0.0f, 0.0f);
    }
    return cexp(cmul(b, cln(a)));
}

fn csin(a: vec2<f32>) -> vec2<f32> {
    return vec2<f32>(sin(a.x) * cosh(a.y), cos(a.x) * sinh(a.y));
}

fn ccos(a: vec2<f32>) -> vec2<f32> {
    return vec2<f32>(cos(a.x) * cosh(a.y), -sin(a.x) * sinh(a.y));
}

fn catan(a: vec2<f32>) -> vec2<f32> {
    let iz = vec2<f32>(-a.y, a.x);
    let one = vec2<f32>(1.0f, 0.0f);
    return cmul(vec2<f32>(0.0f, 0.5f), cln(one - iz) - cln(one + iz));
}

struct Params {
    count: u32,
    param: f32,
    _pad0: u32,
    _pad1: u32,
}

struct LayerOut {
    old2x: vec2<f32>,
    oldx: vec2<f32>,
    x: vec2<f32>,
    resx: vec2<f32>,
    calc: f32,
    cmean: f32,
    cvarsx: f32,
    cvariance: f32,
    live: i32,
    isin: i32,
    n: i32,
    resn: i32,
}

@group(0) @binding(0) var<storage, read> in_x: array<vec2<f32>>;
@group(0) @binding(1) var<storage, read> in_c: array<vec2<f32>>;
@group(0) @binding(2) var<uniform> params: Params;
"#;

/// Assembles the WGSL for one layer stack.  Everything the interpreted
/// engine reads from the configuration at run time is resolved here
/// instead, so the emitted kernel contains only the branches this stack
/// can actually take.
fn kernel_source(
    layers: &[ProcessLayer],
    kind: FractalKind,
    program: Option<&Formula>,
    default_layer: usize,
) -> CalcResult<String> {
    let fractdiv = kind.is_divergent();
    let modes = SeqModes::for_layers(layers);
    let mut hastriangle = false;
    for (i, pl) in layers.iter().enumerate() {
        if pl.checktype == SeqCheck::TriangleSmooth {
            return Err(CalcError::not_implemented(
                "the fractional triangle smoothing pass is unavailable on the kernel engine",
            ));
        }
        if pl.checktype == SeqCheck::Triangle {
            hastriangle = true;
        }
        if pl.checktype == SeqCheck::OrbitTrap
            && pl.traptype == OrbitTrap::Point
            && !(pl.point_a.re.is_finite() && pl.point_a.im.is_finite())
        {
            return Err(CalcError::codegen(format!(
                "layer {} has a non-finite orbit trap point",
                i
            )));
        }
    }

    let mut src = String::from(PRELUDE);
    for i in 0..layers.len() {
        src.push_str(&format!(
            "@group(0) @binding({}) var<storage, read_write> out_p{}: array<LayerOut>;\n",
            3 + i,
            i
        ));
    }

    src.push_str(&format!(
        r#"
@compute @workgroup_size({})
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {{
    let i = gid.x;
    if (i >= params.count) {{
        return;
    }}
    let start = in_x[i];
    let c = in_c[i];
    var sumx = vec2<f32>(0.0f, 0.0f);
    var meanx = vec2<f32>(0.0f, 0.0f);
    var varsx = vec2<f32>(0.0f, 0.0f);
    var variancex = vec2<f32>(0.0f, 0.0f);
    var sdx = vec2<f32>(0.0f, 0.0f);
    var minx = vec2<f32>(0.0f, 0.0f);
    var maxx = vec2<f32>(0.0f, 0.0f);
    var deltax = vec2<f32>(0.0f, 0.0f);
    var newd: f32 = 0.0f;
    var newxnorm: f32 = 0.0f;
    var lowbound: f32 = 0.0f;
    var md: f32 = 0.0f;
    var n: i32 = 0;
    var end = false;
    var x = start;
    var newx = vec2<f32>(0.0f, 0.0f);
"#,
        WORKGROUP_SIZE
    ));

    if hastriangle {
        if kind == FractalKind::Mandel {
            src.push_str("    let trinorm = cabs(c);\n");
        } else {
            src.push_str("    let trinorm = cnormsq(c);\n");
        }
    }
    for i in 0..layers.len() {
        src.push_str(&format!(
            "    var p{i}: LayerOut;\n    p{i}.live = 1;\n    p{i}.x = start;\n    p{i}.oldx = start;\n    p{i}.old2x = start;\n",
            i = i
        ));
    }

    src.push_str("    while (!end) {\n        n = n + 1;\n");
    src.push_str(&format!("        newx = {};\n", step_expr(kind, program)));
    src.push_str(&aggregate_block(&modes));

    for (i, pl) in layers.iter().enumerate() {
        src.push_str(&layer_block(pl, i, kind, fractdiv, i == default_layer));
    }
    src.push_str("        x = newx;\n    }\n");
    for i in 0..layers.len() {
        src.push_str(&format!("    out_p{}[i] = p{};\n", i, i));
    }
    src.push_str("}\n");
    Ok(src)
}

/// The iteration rule as one WGSL expression over `x`, `c`, and `n`.
fn step_expr(kind: FractalKind, program: Option<&Formula>) -> String {
    match kind {
        FractalKind::Mandel => {
            "vec2<f32>(x.x * x.x - x.y * x.y, 2.0f * x.x * x.y) + c".to_string()
        }
        FractalKind::MandelN => "cpowf(x, params.param) + c".to_string(),
        FractalKind::BurningShip => {
            "vec2<f32>(x.x * x.x - x.y * x.y, 2.0f * abs(x.x * x.y)) + c".to_string()
        }
        FractalKind::BurningShipN => {
            "cpowf(vec2<f32>(abs(x.x), abs(x.y)), params.param) + c".to_string()
        }
        FractalKind::Divergent | FractalKind::Convergent => match program {
            Some(f) => lower_expr(f.ast()),
            None => "x".to_string(),
        },
    }
}

/// Lowers a parsed formula to a WGSL expression producing `vec2<f32>`.
fn lower_expr(e: &Expr) -> String {
    match *e {
        Expr::Num(v) => format!("vec2<f32>({}, 0.0f)", lit(v)),
        Expr::Var(Var::X) => "x".to_string(),
        Expr::Var(Var::C) => "c".to_string(),
        Expr::Var(Var::N) => "vec2<f32>(f32(n), 0.0f)".to_string(),
        Expr::Var(Var::P) => "vec2<f32>(params.param, 0.0f)".to_string(),
        Expr::Neg(ref inner) => format!("(-{})", lower_expr(inner)),
        Expr::Bin(BinOp::Add, ref a, ref b) => {
            format!("({} + {})", lower_expr(a), lower_expr(b))
        }
        Expr::Bin(BinOp::Sub, ref a, ref b) => {
            format!("({} - {})", lower_expr(a), lower_expr(b))
        }
        Expr::Bin(BinOp::Mul, ref a, ref b) => {
            format!("cmul({}, {})", lower_expr(a), lower_expr(b))
        }
        Expr::Bin(BinOp::Div, ref a, ref b) => {
            format!("cdiv({}, {})", lower_expr(a), lower_expr(b))
        }
        Expr::Bin(BinOp::Pow, ref a, ref b) => {
            format!("cpow({}, {})", lower_expr(a), lower_expr(b))
        }
        Expr::Call(Func::Sqrt, ref a) => format!("cpowf({}, 0.5f)", lower_expr(a)),
        Expr::Call(Func::Abs, ref a) => format!("vec2<f32>(cabs({}), 0.0f)", lower_expr(a)),
        Expr::Call(Func::Exp, ref a) => format!("cexp({})", lower_expr(a)),
        Expr::Call(Func::Ln, ref a) => format!("cln({})", lower_expr(a)),
        Expr::Call(Func::Sin, ref a) => format!("csin({})", lower_expr(a)),
        Expr::Call(Func::Cos, ref a) => format!("ccos({})", lower_expr(a)),
        Expr::Call(Func::Atan, ref a) => format!("catan({})", lower_expr(a)),
    }
}

/// The orbit aggregates every layer shares, updated once per iteration.
/// Only the aggregates some layer follows are emitted.
fn aggregate_block(modes: &SeqModes) -> String {
    let mut src = String::new();
    if modes.sum {
        src.push_str("        sumx = sumx + newx;\n");
    }
    if modes.mean {
        src.push_str("        let wd = newx - meanx;\n");
        src.push_str("        meanx = meanx + wd / f32(n);\n");
        if modes.varsx {
            src.push_str("        varsx = varsx + cmul(wd, newx - meanx);\n");
            if modes.variance {
                src.push_str("        if (n != 1) {\n");
                src.push_str("            variancex = varsx / (f32(n) - 1.0f);\n");
                if modes.stddev {
                    src.push_str("            sdx = cpowf(variancex, 0.5f);\n");
                }
                src.push_str("        }\n");
            }
        }
    }
    if modes.min {
        src.push_str("        if (n == 1) { minx = newx; } else if (cnormsq(newx) < cnormsq(minx)) { minx = newx; }\n");
    }
    if modes.max {
        src.push_str("        if (n == 1) { maxx = newx; } else if (cnormsq(newx) > cnormsq(maxx)) { maxx = newx; }\n");
    }
    if modes.delta {
        src.push_str("        deltax = newx - x;\n");
    }
    src
}

fn select_expr(seq: SeqType) -> &'static str {
    match seq {
        SeqType::Normal => "newx",
        SeqType::Sum => "sumx",
        SeqType::Mean => "meanx",
        SeqType::VarSx => "varsx",
        SeqType::Variance => "variancex",
        SeqType::StdDev => "sdx",
        SeqType::Min => "minx",
        SeqType::Max => "maxx",
        SeqType::Delta => "deltax",
    }
}

/// One layer's per-iteration block: advance histories, measure, fold,
/// and decide whether the layer (and possibly the whole point) is done.
fn layer_block(
    pl: &ProcessLayer,
    i: usize,
    kind: FractalKind,
    fractdiv: bool,
    is_default: bool,
) -> String {
    let p = format!("p{}", i);
    let mut src = String::new();
    src.push_str(&format!("        if ({}.live != 0) {{\n", p));
    src.push_str(&format!("            {p}.n = n;\n            {p}.old2x = {p}.oldx;\n            {p}.oldx = {p}.x;\n", p = p));
    src.push_str(&format!("            {}.x = {};\n", p, select_expr(pl.seqtype)));
    src.push_str(&measure_block(pl, &p, kind, fractdiv));
    src.push_str(&fold_block(pl.checkseqtype, &p));
    src.push_str(&bails_block(pl, &p, fractdiv));
    src.push_str(&format!(
        "            if ({p}.n >= {limit}) {{ {p}.live = 0; {p}.isin = 1; }}\n",
        p = p,
        limit = pl.nlimit
    ));
    if pl.checkseqtype == SeqType::Mean {
        src.push_str(&format!(
            "            if ({p}.live == 0) {{ {p}.calc = {p}.calc / (f32({p}.n) + 1.0f); }}\n",
            p = p
        ));
    }
    if is_default {
        src.push_str(&format!("            if ({}.live == 0) {{ end = true; }}\n", p));
    }
    src.push_str("        }\n");
    src
}

fn measure_block(pl: &ProcessLayer, p: &str, kind: FractalKind, fractdiv: bool) -> String {
    match pl.checktype {
        SeqCheck::Normal => "            newd = 0.0f;\n".to_string(),
        SeqCheck::Smooth => {
            if fractdiv {
                format!("            newd = exp(-cabs({}.x));\n", p)
            } else {
                format!("            newd = exp(-cabs({p}.x - {p}.oldx));\n", p = p)
            }
        }
        SeqCheck::Real => format!("            newd = {}.x.x;\n", p),
        SeqCheck::Imag => format!("            newd = {}.x.y;\n", p),
        SeqCheck::Arg => format!("            newd = carg({}.x);\n", p),
        SeqCheck::Abs => format!("            newd = cabs({}.x);\n", p),
        SeqCheck::Curvature => format!(
            "            if (any({p}.oldx != {p}.old2x)) {{ newd = cabs(catan(cdiv({p}.x - {p}.oldx, {p}.oldx - {p}.old2x))); }} else {{ newd = 0.0f; }}\n",
            p = p
        ),
        SeqCheck::Triangle | SeqCheck::TriangleSmooth => {
            let (norm_src, value_src) = if kind == FractalKind::Mandel {
                (format!("cnormsq({}.oldx)", p), format!("cabs({}.x)", p))
            } else {
                (format!("cabs({}.x)", p), format!("cabs({}.x - c)", p))
            };
            format!(
                "            newxnorm = {norm};\n            lowbound = abs(newxnorm - trinorm);\n            if ((newxnorm + trinorm - lowbound) == 0.0f) {{ newd = 0.0f; }} else {{ newd = ({value} - lowbound) / (newxnorm + trinorm - lowbound); }}\n",
                norm = norm_src,
                value = value_src
            )
        }
        SeqCheck::OrbitTrap => match pl.traptype {
            OrbitTrap::Point => format!(
                "            newd = cabs({}.x - vec2<f32>({}, {}));\n",
                p,
                lit(pl.point_a.re),
                lit(pl.point_a.im)
            ),
            OrbitTrap::Line => {
                if pl.point_a.re == 1.0 {
                    format!("            newd = abs({}.x.x);\n", p)
                } else {
                    format!("            newd = abs({}.x.y);\n", p)
                }
            }
            OrbitTrap::Gauss => format!(
                "            newd = cabs(vec2<f32>(round({p}.x.x), round({p}.x.y)) - {p}.x);\n",
                p = p
            ),
        },
    }
}

fn fold_block(fold: SeqType, p: &str) -> String {
    match fold {
        SeqType::Normal => format!("            {}.calc = newd;\n", p),
        SeqType::Sum | SeqType::Mean => format!("            {p}.calc = {p}.calc + newd;\n", p = p),
        SeqType::VarSx => format!(
            "            let d{p} = newd - {p}.cmean;\n            {p}.cmean = {p}.cmean + d{p} / f32({p}.n);\n            {p}.calc = {p}.calc + d{p} * (newd - {p}.cmean);\n",
            p = p
        ),
        SeqType::Variance => format!(
            "            let d{p} = newd - {p}.cmean;\n            {p}.cmean = {p}.cmean + d{p} / f32({p}.n);\n            {p}.cvarsx = {p}.cvarsx + d{p} * (newd - {p}.cmean);\n            if ({p}.n != 1) {{ {p}.calc = {p}.cvarsx / (f32({p}.n) - 1.0f); }}\n",
            p = p
        ),
        SeqType::StdDev => format!(
            "            let d{p} = newd - {p}.cmean;\n            {p}.cmean = {p}.cmean + d{p} / f32({p}.n);\n            {p}.cvarsx = {p}.cvarsx + d{p} * (newd - {p}.cmean);\n            if ({p}.n != 1) {{ {p}.cvariance = {p}.cvarsx / (f32({p}.n) - 1.0f); }}\n            {p}.calc = sqrt({p}.cvariance);\n",
            p = p
        ),
        SeqType::Min => format!(
            "            if ({p}.n == 1) {{ {p}.calc = newd; }} else if ({p}.calc > newd) {{ {p}.calc = newd; {p}.resx = {p}.x; {p}.resn = {p}.n; }}\n",
            p = p
        ),
        SeqType::Max => format!(
            "            if ({p}.n == 1) {{ {p}.calc = newd; }} else if ({p}.calc < newd) {{ {p}.calc = newd; {p}.resx = {p}.x; {p}.resn = {p}.n; }}\n",
            p = p
        ),
        SeqType::Delta => format!("            {p}.calc = newd - {p}.calc;\n", p = p),
    }
}

fn bails_block(pl: &ProcessLayer, p: &str, fractdiv: bool) -> String {
    let cmp = if fractdiv { ">" } else { "<" };
    let bail = lit(pl.bailout);
    match pl.convcheck {
        ConvCheck::Real => format!(
            "            if ({p}.x.x * {p}.x.x {cmp} {bail}) {{ {p}.live = 0; }}\n",
            p = p, cmp = cmp, bail = bail
        ),
        ConvCheck::Imag => format!(
            "            if ({p}.x.y * {p}.x.y {cmp} {bail}) {{ {p}.live = 0; }}\n",
            p = p, cmp = cmp, bail = bail
        ),
        ConvCheck::Or => format!(
            "            if (({p}.x.x * {p}.x.x {cmp} {bail}) || ({p}.x.y * {p}.x.y {cmp} {bail})) {{ {p}.live = 0; }}\n",
            p = p, cmp = cmp, bail = bail
        ),
        ConvCheck::And => format!(
            "            if (({p}.x.x * {p}.x.x {cmp} {bail}) && ({p}.x.y * {p}.x.y {cmp} {bail})) {{ {p}.live = 0; }}\n",
            p = p, cmp = cmp, bail = bail
        ),
        ConvCheck::Manh => format!(
            "            md = abs({p}.x.x) + abs({p}.x.y);\n            if (md * md {cmp} {bail}) {{ {p}.live = 0; }}\n",
            p = p, cmp = cmp, bail = bail
        ),
        ConvCheck::ManR => format!(
            "            md = {p}.x.x + {p}.x.y;\n            if (md * md {cmp} {bail}) {{ {p}.live = 0; }}\n",
            p = p, cmp = cmp, bail = bail
        ),
        ConvCheck::Normal => format!(
            "            if (cnormsq({p}.x) {cmp} {bail}) {{ {p}.live = 0; }}\n",
            p = p, cmp = cmp, bail = bail
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use naive::NaiveFactory;

    fn plain_stack() -> Vec<ProcessLayer> {
        let mut pl = ProcessLayer::new(4.0, 64);
        pl.default = true;
        vec![pl]
    }

    #[test]
    fn layer_record_is_sixty_four_bytes() {
        assert_eq!(std::mem::size_of::<LayerOut>(), 64);
        assert_eq!(std::mem::size_of::<GpuParams>(), 16);
    }

    #[test]
    fn stacks_beyond_the_binding_budget_are_refused() {
        let mut layers = vec![ProcessLayer::new(4.0, 64); 7];
        layers[0].default = true;
        match KernelFactory.configure(&layers, FractalKind::Mandel, "", 0) {
            Err(CalcError::Config(_)) => {}
            other => panic!("expected a configuration error, got {:?}", other.err()),
        }
    }

    #[test]
    fn triangle_smoothing_is_refused_while_generating() {
        let mut layers = plain_stack();
        layers[0].checktype = SeqCheck::TriangleSmooth;
        match KernelFactory.configure(&layers, FractalKind::Mandel, "", 0) {
            Err(CalcError::NotImplemented(_)) => {}
            other => panic!("expected not-implemented, got {:?}", other.err()),
        }
    }

    #[test]
    fn formula_errors_beat_device_acquisition() {
        let layers = plain_stack();
        match KernelFactory.configure(&layers, FractalKind::Divergent, "x*(", 0) {
            Err(CalcError::Formula { .. }) => {}
            other => panic!("expected a formula error, got {:?}", other.err()),
        }
    }

    #[test]
    fn generated_source_bakes_the_configuration_in() {
        let mut layers = plain_stack();
        layers[0].bailout = 40.0;
        layers[0].nlimit = 96;
        let mut trap = ProcessLayer::new(4.0, 96);
        trap.checktype = SeqCheck::OrbitTrap;
        trap.traptype = OrbitTrap::Point;
        trap.point_a = Complex::new(1.5, -0.25);
        trap.checkseqtype = SeqType::Min;
        layers.push(trap);

        let f = Formula::parse("x*x+c-1.0/n").unwrap();
        let src = kernel_source(&layers, FractalKind::Divergent, Some(&f), 0).unwrap();
        assert!(src.contains("@workgroup_size(256)"));
        assert!(src.contains("@binding(3)"));
        assert!(src.contains("@binding(4)"));
        assert!(src.contains("40.0f"));
        assert!(src.contains("p0.n >= 96"));
        assert!(src.contains("cmul(x, x)"));
        assert!(src.contains("vec2<f32>(f32(n), 0.0f)"));
        assert!(src.contains("vec2<f32>(1.5f, -0.25f)"));
        // nothing in this stack follows the shared statistics
        assert!(!src.contains("meanx = meanx"));
    }

    #[test]
    fn statistics_are_emitted_only_when_followed() {
        let mut layers = plain_stack();
        layers[0].seqtype = SeqType::StdDev;
        let src = kernel_source(&layers, FractalKind::Mandel, None, 0).unwrap();
        assert!(src.contains("meanx = meanx + wd / f32(n)"));
        assert!(src.contains("sdx = cpowf(variancex, 0.5f)"));
        assert!(src.contains("p0.x = sdx;"));
        assert!(!src.contains("sumx = sumx"));
    }

    // Exercises a real adapter when one exists; machines without one
    // skip the comparison rather than fail.
    #[test]
    fn kernel_agrees_with_the_interpreter_far_from_the_boundary() {
        let layers = plain_stack();
        let mut kernel = match KernelFactory.configure(&layers, FractalKind::Mandel, "", 0) {
            Ok(calc) => calc,
            Err(e) => {
                println!("kernel engine unavailable, skipping: {}", e);
                return;
            }
        };
        let mut naive = NaiveFactory.configure(&layers, FractalKind::Mandel, "", 0).unwrap();
        let points = [
            Complex::new(0.0, 0.0),
            Complex::new(-1.0, 0.0),
            Complex::new(2.0, 2.0),
            Complex::new(0.5, 0.5),
        ];
        kernel.init(&layers, 0.0, points.len()).unwrap();
        naive.init(&layers, 0.0, points.len()).unwrap();
        for (i, &point) in points.iter().enumerate() {
            kernel.submit(i as i32, 0, point, point).unwrap();
            naive.submit(i as i32, 0, point, point).unwrap();
        }
        kernel.flush().unwrap();
        naive.flush().unwrap();
        let mut pairs = 0;
        while let (Some(k), Some(s)) = (kernel.take(), naive.take()) {
            assert_eq!(k.px, s.px);
            assert_eq!(k.layers[0].n, s.layers[0].n);
            assert_eq!(k.layers[0].isin, s.layers[0].isin);
            pairs += 1;
        }
        assert_eq!(pairs, points.len());
        kernel.end_batch(true).unwrap();
        naive.end_batch(true).unwrap();
    }
}

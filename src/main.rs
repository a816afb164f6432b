// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

extern crate clap;
extern crate image;
extern crate itertools;
extern crate layerfract;
extern crate num;
extern crate num_cpus;
extern crate tracing;
extern crate tracing_subscriber;

use clap::{App, Arg, ArgMatches};
use image::pnm::PNMEncoder;
use image::pnm::{PNMSubtype, SampleEncoding};
use image::ColorType;
use itertools::iproduct;
use num::{clamp, Complex};
use std::fs::File;
use std::str::FromStr;
use tracing::{info, warn, Level};

use layerfract::{
    CalcError, CalcResult, Engine, FractalKind, OrbitTrap, PlaneMap, ProcessLayer, SeqCheck,
    SeqType,
};

fn parse_pair<T>(s: &str, separator: char) -> Option<(T, T)>
where
    T: FromStr,
{
    match s.find(separator) {
        None => None,
        Some(index) => match (T::from_str(&s[..index]), T::from_str(&s[index + 1..])) {
            (Ok(l), Ok(r)) => Some((l, r)),
            _ => None,
        },
    }
}

/// Parses "re,im,radius" into the window a frame looks at.
fn parse_view(s: &str) -> Option<(Complex<f64>, f64)> {
    let parts: Vec<&str> = s.split(',').collect();
    if parts.len() != 3 {
        return None;
    }
    match (
        f64::from_str(parts[0]),
        f64::from_str(parts[1]),
        f64::from_str(parts[2]),
    ) {
        (Ok(re), Ok(im), Ok(radius)) => Some((Complex::new(re, im), radius)),
        _ => None,
    }
}

fn validate_pair<T: FromStr>(s: &str, separator: char, err: &str) -> Result<(), String> {
    match parse_pair::<T>(s, separator) {
        Some(_) => Ok(()),
        None => Err(err.to_string()),
    }
}

fn validate_range<T: FromStr + Ord>(
    s: &str,
    low: T,
    high: T,
    isnotanumber_err: &str,
    isnotinrange_err: &str,
) -> Result<(), String> {
    match T::from_str(s) {
        Ok(i) => {
            if i >= low && i <= high {
                Ok(())
            } else {
                Err(isnotinrange_err.to_string())
            }
        }
        Err(_) => Err(isnotanumber_err.to_string()),
    }
}

const OUTPUT: &str = "output";
const SIZE: &str = "size";
const VIEW: &str = "view";
const ENGINE: &str = "engine";
const WORKERS: &str = "workers";
const PEERS: &str = "peers";
const SCENE: &str = "scene";
const VERBOSE: &str = "verbose";

const SCENES: [&str; 3] = ["mandel", "stats", "ship"];

fn args<'a>() -> ArgMatches<'a> {
    App::new("layerfract")
        .version("0.1.0")
        .author("elf")
        .about("Multi-layer escape-time fractal renderer")
        .arg(
            Arg::with_name(OUTPUT)
                .required(true)
                .long(OUTPUT)
                .short("o")
                .takes_value(true)
                .help("Output file (binary graymap)"),
        )
        .arg(
            Arg::with_name(SIZE)
                .required(false)
                .long(SIZE)
                .short("s")
                .takes_value(true)
                .default_value("800x600")
                .validator(|s| validate_pair::<u16>(&s, 'x', "Could not parse output image size"))
                .help("Size of output image"),
        )
        .arg(
            Arg::with_name(VIEW)
                .required(false)
                .long(VIEW)
                .takes_value(true)
                .default_value("-0.5,0.0,2.0")
                .validator(|s| match parse_view(&s) {
                    Some(_) => Ok(()),
                    None => Err("Could not parse view as re,im,radius".to_string()),
                })
                .help("Center and radius of the rendered window"),
        )
        .arg(
            Arg::with_name(ENGINE)
                .required(false)
                .long(ENGINE)
                .short("e")
                .takes_value(true)
                .default_value("s")
                .validator(|s| match s.as_str() {
                    "s" | "c" | "g" | "t" | "d" => Ok(()),
                    _ => Err("Engine must be one of s, c, g, t, d".to_string()),
                })
                .help("Execution engine: s simple, c compiled, g kernel, t threaded, d distributed"),
        )
        .arg(
            Arg::with_name(WORKERS)
                .required(false)
                .long(WORKERS)
                .short("w")
                .takes_value(true)
                .validator(|s| {
                    validate_range(
                        &s,
                        1,
                        256,
                        "Could not parse worker count",
                        "Worker count must be between 1 and 256",
                    )
                })
                .help("Worker threads for the threaded engine (default: one per cpu)"),
        )
        .arg(
            Arg::with_name(PEERS)
                .required(false)
                .long(PEERS)
                .takes_value(true)
                .required_if(ENGINE, "d")
                .validator(|s| {
                    for peer in s.split(',') {
                        if !peer.contains(':') {
                            return Err(format!("Peer {:?} is not host:port", peer));
                        }
                    }
                    Ok(())
                })
                .help("Comma-separated host:port list for the distributed engine"),
        )
        .arg(
            Arg::with_name(SCENE)
                .required(false)
                .long(SCENE)
                .takes_value(true)
                .default_value("mandel")
                .validator(|s| {
                    if SCENES.contains(&s.as_str()) {
                        Ok(())
                    } else {
                        Err(format!("Scene must be one of {}", SCENES.join(", ")))
                    }
                })
                .help("Layer preset to render"),
        )
        .arg(
            Arg::with_name(VERBOSE)
                .required(false)
                .long(VERBOSE)
                .short("v")
                .takes_value(false)
                .help("Log batch-level detail"),
        )
        .get_matches()
}

/// A renderable preset: the layer stack plus the iteration rule that
/// drives it.
struct Scene {
    layers: Vec<ProcessLayer>,
    kind: FractalKind,
    formula: &'static str,
    default_layer: usize,
}

fn scene(name: &str) -> CalcResult<Scene> {
    match name {
        "mandel" => {
            let mut plain = ProcessLayer::new(40.0, 1024);
            plain.default = true;
            Ok(Scene {
                layers: vec![plain],
                kind: FractalKind::Mandel,
                formula: "",
                default_layer: 0,
            })
        }
        "ship" => {
            let mut plain = ProcessLayer::new(40.0, 1024);
            plain.default = true;
            Ok(Scene {
                layers: vec![plain],
                kind: FractalKind::BurningShip,
                formula: "",
                default_layer: 0,
            })
        }
        "stats" => {
            let mut plain = ProcessLayer::new(40.0, 4096);
            plain.default = true;
            let mut spread = ProcessLayer::new(64.0, 4096);
            spread.seqtype = SeqType::StdDev;
            spread.checktype = SeqCheck::Triangle;
            spread.checkseqtype = SeqType::StdDev;
            let mut real_axis = ProcessLayer::new(4.0, 4096);
            real_axis.seqtype = SeqType::Mean;
            real_axis.checktype = SeqCheck::OrbitTrap;
            real_axis.traptype = OrbitTrap::Line;
            real_axis.point_a = Complex::new(1.0, 0.0);
            real_axis.checkseqtype = SeqType::Min;
            let mut imag_axis = real_axis.clone();
            imag_axis.point_a = Complex::new(0.0, 0.0);
            Ok(Scene {
                layers: vec![plain, spread, real_axis, imag_axis],
                kind: FractalKind::Divergent,
                formula: "x*x+c-1.0/n",
                default_layer: 0,
            })
        }
        other => Err(CalcError::config(format!("unknown scene {:?}", other))),
    }
}

/// Evaluates the frame one scan line per batch and collects the default
/// layer's iteration count and inside flag per pixel.
fn render(scene: &Scene, plane: &PlaneMap, engine: &Engine) -> CalcResult<Vec<(i32, bool)>> {
    let factory = engine.factory();
    let mut calc = factory.configure(
        &scene.layers,
        scene.kind,
        scene.formula,
        scene.default_layer,
    )?;
    calc.init(&scene.layers, 0.0, plane.width())?;

    let mut counts = vec![(0, false); plane.len()];
    let mut served = 0;
    for py in 0..plane.height() {
        for px in 0..plane.width() {
            let point = plane.point(px, py);
            calc.submit(px as i32, py as i32, point, point)?;
        }
        calc.flush()?;
        while let Some(result) = calc.take() {
            let pl = &result.layers[scene.default_layer];
            let offset = result.py as usize * plane.width() + result.px as usize;
            counts[offset] = (pl.n, pl.isin);
            served += 1;
        }
        calc.end_batch(py + 1 == plane.height())?;
    }
    if served != plane.len() {
        warn!("engine returned {} of {} points", served, plane.len());
    }
    Ok(counts)
}

/// Normalized grayscale: inside points are black, escaped points scale
/// with their iteration count.  Rows flip because the plane's origin is
/// the lower-left corner while graymaps start at the top.
fn shade(counts: &[(i32, bool)], width: usize, height: usize) -> Vec<u8> {
    let mut maxn = 1;
    for &(n, isin) in counts {
        if !isin && n > maxn {
            maxn = n;
        }
    }
    let mut pixels = vec![0 as u8; counts.len()];
    for (row, px) in iproduct!(0..height, 0..width) {
        let (n, isin) = counts[(height - 1 - row) * width + px];
        pixels[row * width + px] = if isin {
            0
        } else {
            clamp((n as u32 * 255) / maxn as u32, 0, 255) as u8
        };
    }
    pixels
}

fn write_image(outfile: &str, pixels: &[u8], bounds: (usize, usize)) -> Result<(), std::io::Error> {
    let output = File::create(outfile)?;
    let mut encoder =
        PNMEncoder::new(output).with_subtype(PNMSubtype::Graymap(SampleEncoding::Binary));
    encoder.encode(pixels, bounds.0 as u32, bounds.1 as u32, ColorType::Gray(8))?;
    Ok(())
}

fn run(matches: &ArgMatches) -> CalcResult<()> {
    let size = parse_pair::<usize>(matches.value_of(SIZE).unwrap(), 'x')
        .expect("Error parsing image dimensions");
    let (center, radius) =
        parse_view(matches.value_of(VIEW).unwrap()).expect("Error parsing view");
    let workers = match matches.value_of(WORKERS) {
        Some(w) => usize::from_str(w).expect("Error parsing worker count"),
        None => num_cpus::get(),
    };
    let peers: Vec<String> = match matches.value_of(PEERS) {
        Some(list) => list.split(',').map(|p| p.to_string()).collect(),
        None => Vec::new(),
    };
    let engine = Engine::from_code(matches.value_of(ENGINE).unwrap(), workers, &peers)?;
    let scene_name = matches.value_of(SCENE).unwrap();
    let scene = scene(scene_name)?;
    let plane = PlaneMap::new(size.0, size.1, center, radius)?;

    info!(
        "rendering the {} scene at {}x{} with the {:?} engine",
        scene_name, size.0, size.1, engine
    );
    let counts = render(&scene, &plane, &engine)?;
    let pixels = shade(&counts, plane.width(), plane.height());
    let outfile = matches.value_of(OUTPUT).unwrap();
    write_image(outfile, &pixels, (plane.width(), plane.height()))?;
    info!("wrote {}", outfile);
    Ok(())
}

fn main() {
    let matches = args();
    let level = if matches.is_present(VERBOSE) {
        Level::DEBUG
    } else {
        Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    if let Err(e) = run(&matches) {
        eprintln!("render failure: {}", e);
        std::process::exit(1);
    }
}

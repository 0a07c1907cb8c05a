//! Command line front end for cube fitting
//!
//! Subcommands:
//! - `generate`: write a synthetic Gaussian test cube
//! - `crop`: cut out and collapse a region into a 2D map
//! - `fit`: fit every pixel of a cube and write the parameter file
//! - `model`: rebuild the model cube from a parameter file and count pixels
//!   with large residuals
//!
//! Usage:
//! ```
//! cargo run --bin cubefit -- fit cube.fits pars.fits --guesses 0.7,0.5,0.8 --signal-cut 0
//! ```
//!
//! `RUST_LOG` controls logging; each `-v` raises the default level.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use cubefit::{
    count_noisy_pixels, estimate_errmap, make_test_cube, subimage_integ, Collapse, CoordUnits,
    Cube, FitEachConfig, SpectralCube, SubimageRequest, TestCubeConfig,
};
use ndarray::Array2;
use std::fs;
use std::path::{Path, PathBuf};

/// Parse a comma separated list of numbers
fn parse_list(s: &str) -> Result<Vec<f64>, String> {
    s.split(',')
        .map(|part| {
            part.trim()
                .parse::<f64>()
                .map_err(|_| format!("invalid number '{}'", part.trim()))
        })
        .collect()
}

/// Parse "a,b"
fn parse_pair(s: &str) -> Result<(f64, f64), String> {
    match parse_list(s)?.as_slice() {
        [a, b] => Ok((*a, *b)),
        _ => Err("expected two comma separated values".to_string()),
    }
}

/// Parse "x,y" pixel coordinates
fn parse_pixel(s: &str) -> Result<(usize, usize), String> {
    let (x, y) = parse_pair(s)?;
    if x < 0.0 || y < 0.0 || x.fract() != 0.0 || y.fract() != 0.0 {
        return Err("pixel coordinates must be non-negative integers".to_string());
    }
    Ok((x as usize, y as usize))
}

#[derive(Parser)]
#[command(author, version, about = "Pixel-by-pixel spectral line fitting of FITS cubes", long_about = None)]
struct Cli {
    /// Increase logging verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a synthetic test cube
    Generate {
        /// Output FITS file
        output: PathBuf,

        /// JSON file with a TestCubeConfig; flags override it
        #[arg(long)]
        config: Option<PathBuf>,

        /// Cube shape as "nz,ny,nx"
        #[arg(long)]
        shape: Option<String>,

        /// Signal to noise ratio of the brightest channel
        #[arg(long)]
        snr: Option<f64>,

        /// Spectral and spatial kernel widths as "spectral,spatial"
        #[arg(long, value_parser = parse_pair)]
        sigma: Option<(f64, f64)>,

        /// Noise seed
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Crop a cube spatially and collapse it spectrally
    Crop {
        input: PathBuf,
        output: PathBuf,

        /// Region centre as "x,y"
        #[arg(long, value_parser = parse_pair)]
        center: (f64, f64),

        /// Region half widths as "x,y"
        #[arg(long, value_parser = parse_pair)]
        width: (f64, f64),

        /// Centre and widths are world coordinates (degrees)
        #[arg(long, default_value_t = false)]
        world: bool,

        /// Spectral range as "start,stop"
        #[arg(long, value_parser = parse_pair)]
        vrange: Option<(f64, f64)>,

        /// Spectral range is in CUNIT3 rather than channels
        #[arg(long, default_value_t = false)]
        world_vrange: bool,

        /// Sum channels instead of averaging them
        #[arg(long, default_value_t = false)]
        sum: bool,

        /// Multiply by the channel width
        #[arg(long, default_value_t = false)]
        dvmult: bool,

        #[arg(long, default_value_t = false)]
        overwrite: bool,
    },

    /// Fit every pixel and write the parameter file
    Fit {
        input: PathBuf,
        output: PathBuf,

        /// JSON file with a FitEachConfig; flags override it
        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long)]
        fittype: Option<String>,

        /// Starting parameters, comma separated
        #[arg(long)]
        guesses: Option<String>,

        /// Pixel to start from as "x,y"
        #[arg(long, value_parser = parse_pixel)]
        start: Option<(usize, usize)>,

        /// Minimum peak S/N; 0 fits every pixel
        #[arg(long)]
        signal_cut: Option<f64>,

        /// Header keyword holding the noise level, used as a constant error map
        #[arg(long, conflicts_with = "estimate_noise")]
        rms_key: Option<String>,

        /// Estimate each pixel's noise from its own spectrum (MAD) and use it as the error map
        #[arg(long, default_value_t = false)]
        estimate_noise: bool,

        /// Worker threads
        #[arg(long)]
        workers: Option<usize>,

        /// Start each pixel from a fit neighbour
        #[arg(long, default_value_t = false)]
        neighbor_guesses: bool,

        /// Lines are in absorption
        #[arg(long, default_value_t = false)]
        absorption: bool,

        #[arg(long, default_value_t = false)]
        overwrite: bool,
    },

    /// Rebuild the model cube from a parameter file
    Model {
        input: PathBuf,
        params: PathBuf,

        /// Parameters per pixel; read from NPARS when omitted
        #[arg(long)]
        npars: Option<usize>,

        #[arg(long)]
        fittype: Option<String>,

        /// Template pixel as "x,y"
        #[arg(long, value_parser = parse_pixel)]
        template: Option<(usize, usize)>,

        /// Where to write the model cube
        #[arg(long)]
        output: Option<PathBuf>,

        /// Residual threshold in units of RMSLVL
        #[arg(long, default_value_t = 3.0)]
        threshold: f64,

        #[arg(long, default_value_t = false)]
        overwrite: bool,
    },
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

fn generate(
    output: &Path,
    config: Option<&Path>,
    shape: Option<&str>,
    snr: Option<f64>,
    sigma: Option<(f64, f64)>,
    seed: Option<u64>,
) -> Result<()> {
    let mut cfg: TestCubeConfig = match config {
        Some(path) => read_json(path)?,
        None => TestCubeConfig::default(),
    };
    if let Some(shape) = shape {
        let dims = parse_list(shape).map_err(anyhow::Error::msg)?;
        let [nz, ny, nx] = dims.as_slice() else {
            bail!("--shape takes three values, got {}", dims.len());
        };
        cfg = cfg.with_shape((*nz as usize, *ny as usize, *nx as usize));
    }
    if let Some(snr) = snr {
        cfg = cfg.with_snr(snr);
    }
    if let Some((spectral, spatial)) = sigma {
        cfg = cfg.with_sigma(spectral, spatial);
    }
    if let Some(seed) = seed {
        cfg = cfg.with_seed(seed);
    }

    let cube = make_test_cube(&cfg).context("generating test cube")?;
    cube.write(output)
        .with_context(|| format!("writing {}", output.display()))?;
    println!("wrote {:?} test cube to {}", cfg.shape, output.display());
    Ok(())
}

fn rms_map(cube: &Cube, key: &str) -> Result<Array2<f64>> {
    let rms = cube
        .header
        .get_f64(key)
        .with_context(|| format!("header has no numeric {key}"))?;
    let (_, ny, nx) = cube.cube.dim();
    Ok(Array2::from_elem((ny, nx), rms))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match cli.command {
        Commands::Generate {
            output,
            config,
            shape,
            snr,
            sigma,
            seed,
        } => generate(&output, config.as_deref(), shape.as_deref(), snr, sigma, seed)?,

        Commands::Crop {
            input,
            output,
            center,
            width,
            world,
            vrange,
            world_vrange,
            sum,
            dvmult,
            overwrite,
        } => {
            let cube = Cube::open(&input).with_context(|| format!("opening {}", input.display()))?;
            let units = if world { CoordUnits::World } else { CoordUnits::Pixels };
            let zunits = if world_vrange { CoordUnits::World } else { CoordUnits::Pixels };
            let collapse = if sum { Collapse::Sum } else { Collapse::Mean };

            let mut request = SubimageRequest::new(center.0, width.0, center.1, width.1)
                .with_units(units)
                .with_collapse(collapse, dvmult);
            if let Some((start, stop)) = vrange {
                request = request.with_vrange(start, stop, zunits);
            }

            let map = subimage_integ(cube.cube.view(), Some(&cube.header), &request)?;
            let header = map.header.clone().unwrap_or_default();
            cubefit::io::write_image(&output, map.data.view(), &header, overwrite)
                .with_context(|| format!("writing {}", output.display()))?;
            println!(
                "wrote {:?} map (x {}..{}, y {}..{}) to {}",
                map.data.dim(),
                map.bounds.xlo,
                map.bounds.xhi,
                map.bounds.ylo,
                map.bounds.yhi,
                output.display()
            );
        }

        Commands::Fit {
            input,
            output,
            config,
            fittype,
            guesses,
            start,
            signal_cut,
            rms_key,
            estimate_noise,
            workers,
            neighbor_guesses,
            absorption,
            overwrite,
        } => {
            let mut cube =
                Cube::open(&input).with_context(|| format!("opening {}", input.display()))?;
            let mut cfg: FitEachConfig = match &config {
                Some(path) => read_json(path)?,
                None => FitEachConfig::default(),
            };
            if let Some(fittype) = fittype {
                cfg.fittype = fittype;
            }
            if let Some(guesses) = guesses {
                cfg.guesses = parse_list(&guesses).map_err(anyhow::Error::msg)?;
            }
            if let Some((x, y)) = start {
                cfg = cfg.with_start_from_point(x, y);
            }
            if let Some(cut) = signal_cut {
                cfg = cfg.with_signal_cut(cut);
            }
            if let Some(workers) = workers {
                cfg = cfg.with_multicore(workers);
            }
            if neighbor_guesses {
                cfg = cfg.with_neighbor_guesses(true);
            }
            if absorption {
                cfg = cfg.with_absorption(true);
            }
            if let Some(key) = rms_key {
                cfg = cfg.with_errmap(rms_map(&cube, &key)?);
            }
            if estimate_noise {
                cfg = cfg.with_errmap(estimate_errmap(cube.cube.view()));
            }

            let report = cube.fiteach(&cfg).context("fitting cube")?;
            for warning in &report.warnings {
                eprintln!("warning: {warning}");
            }
            cube.write_fit(&output, overwrite)
                .with_context(|| format!("writing {}", output.display()))?;
            println!(
                "{} pixels fit, {} failed, {} below signal cut, {} ineligible ({:.2?})",
                report.n_fit, report.n_failed, report.n_below_cut, report.n_ineligible, report.elapsed
            );
        }

        Commands::Model {
            input,
            params,
            npars,
            fittype,
            template,
            output,
            threshold,
            overwrite,
        } => {
            let mut cube =
                Cube::open(&input).with_context(|| format!("opening {}", input.display()))?;
            let npars = match npars {
                Some(n) => n,
                None => cubefit::ModelFit::read(&params, None, fittype.as_deref())?.0.npars,
            };
            cube.load_model_fit(&params, npars, fittype.as_deref(), template)
                .with_context(|| format!("loading {}", params.display()))?;

            if let Some(output) = &output {
                let model = cube.get_modelcube()?.clone();
                cubefit::io::write_cube(output, model.view(), &cube.header, overwrite)
                    .with_context(|| format!("writing {}", output.display()))?;
            }

            let residual = cube.residual()?;
            match cube.header.get_f64("RMSLVL") {
                Some(rms) => {
                    let noisy = count_noisy_pixels(residual.view(), threshold, rms);
                    println!("{noisy} pixels with residual std above {threshold} x RMSLVL");
                }
                None => println!("no RMSLVL keyword, skipping residual check"),
            }
        }
    }

    Ok(())
}

use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use quantsim::nn::{Conv2d, Linear, MaxPool2d};
use quantsim::quantization::{search_shift_multiplier, DEFAULT_PROBE};
use quantsim::{
    ConvGeometry, QConv2d, QLayer, QLinear, QMaxPool2d, QModule, QParamRole, QReLU, QuantConfig, QuantError,
    Result, Tape, Tensor,
};
use rand::{rngs::StdRng, SeedableRng};
use std::process::ExitCode;
use tracing::Level;

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "quantsim", version, about = "Quantization-aware simulation and integer freezing")]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Approximate a float multiplier M by Mo / 2^n
    Search {
        /// Multiplier to approximate
        multiplier: f64,

        /// Integer value the approximation must reproduce
        #[arg(long, default_value_t = DEFAULT_PROBE)]
        probe: i64,
    },
    /// Calibrate, freeze and run a small conv net on random data
    Calibrate {
        #[arg(long, default_value_t = 8)]
        bits: u32,

        #[arg(long, default_value_t = 20)]
        batches: usize,

        #[arg(long, default_value_t = 8)]
        batch_size: usize,

        #[arg(long, default_value_t = 0)]
        seed: u64,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt().with_max_level(level).with_target(false).init();

    let result = match cli.command {
        Command::Search { multiplier, probe } => search(multiplier, probe),
        Command::Calibrate {
            bits,
            batches,
            batch_size,
            seed,
        } => calibrate(bits, batches, batch_size, seed),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn search(multiplier: f64, probe: i64) -> Result<()> {
    let found = search_shift_multiplier(multiplier, probe)?;
    println!("Mo = {}, n = {}", found.mo, found.n);
    println!(
        "M = {multiplier}, Mo / 2^n = {:.10}, ({} * {probe}) >> {} = {}",
        found.as_f64(),
        found.mo,
        found.n,
        found.apply(probe)
    );
    Ok(())
}

const IN_SHAPE: [usize; 3] = [1, 8, 8];

/// conv(1 -> 4, 3x3, pad 1) -> relu -> maxpool(2) -> flatten -> linear(64 -> 10)
fn build_network(rng: &mut StdRng, config: &QuantConfig) -> Result<Vec<QLayer>> {
    let conv = Conv2d::new_with(rng, 1, 4, (3, 3), ConvGeometry::default().with_padding((1, 1)), true);
    let fc = Linear::new_with(rng, 4 * 4 * 4, 10, true);
    Ok(vec![
        QConv2d::new(conv, config.clone(), true, true)?.into(),
        QReLU::new(config.clone(), false)?.into(),
        QMaxPool2d::new(MaxPool2d::new(2, 2, 0), config.clone(), false)?.into(),
        QLinear::new(fc, config.clone(), false, true)?.into(),
    ])
}

/// Run `x` through the stack, flattening before the linear layer.
fn run<F>(layers: &mut [QLayer], x: &Tensor, mut step: F) -> Result<Tensor>
where
    F: FnMut(&mut QLayer, &Tensor) -> Result<Tensor>,
{
    let mut x = x.clone();
    for layer in layers.iter_mut() {
        if matches!(layer, QLayer::Linear(_)) {
            let n = x.shape()[0];
            x = x.reshape(&[n, x.numel() / n]);
        }
        x = step(layer, &x)?;
    }
    Ok(x)
}

fn calibrate(bits: u32, batches: usize, batch_size: usize, seed: u64) -> Result<()> {
    let config = QuantConfig::new(bits);
    config.validate()?;
    let mut rng = StdRng::seed_from_u64(seed);
    let mut layers = build_network(&mut rng, &config)?;
    let shape = [batch_size, IN_SHAPE[0], IN_SHAPE[1], IN_SHAPE[2]];

    println!("Calibrating {} layers on {batches} batches of {batch_size}", layers.len());
    println!("{}", "=".repeat(60));

    let pb = ProgressBar::new(batches as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    for _ in 0..batches {
        Tape::reset();
        let x = Tensor::randn_with(&mut rng, &shape);
        run(&mut layers, &x, |layer, x| layer.forward(x))?;
        pb.inc(1);
    }
    pb.finish_with_message("calibration complete");

    // Reference output from the observe-mode network on a fresh batch
    let x = Tensor::randn_with(&mut rng, &shape);
    let reference = run(&mut layers, &x, |layer, x| layer.forward(x))?;

    let mut upstream = None;
    for layer in layers.iter_mut() {
        let qi = if layer.qi().is_some() { None } else { upstream.take() };
        layer.freeze(qi, None)?;
        upstream = layer.qo();
    }

    let qi = layers
        .first()
        .and_then(QModule::qi)
        .ok_or(QuantError::QParamMissing { role: QParamRole::Input })?;
    let qo = layers
        .last()
        .and_then(QModule::qo)
        .ok_or(QuantError::QParamMissing { role: QParamRole::Output })?;

    let qx = qi.borrow().quantize_tensor(&x)?;
    let qy = run(&mut layers, &qx, |layer, x| layer.quantize_inference(x))?;
    let expected = qo.borrow().quantize_tensor(&reference)?;
    let dequantized = qo.borrow().dequantize_tensor(&qy)?;

    println!();
    for (i, layer) in layers.iter().enumerate() {
        println!("[{i}] {:<12} M = {:?}", layer.name(), layer.multiplier());
        if let Some(q) = layer.qi() {
            println!("      qi: {q}");
        }
        if let Some(q) = layer.qo() {
            println!("      qo: {q}");
        }
    }

    let codes = qy.numel().max(1);
    let (exact, max_code_diff) = qy
        .data()
        .iter()
        .zip(expected.data().iter())
        .fold((0usize, 0.0f32), |(exact, worst), (&a, &b)| {
            let d = (a - b).abs();
            (exact + usize::from(d == 0.0), worst.max(d))
        });
    let max_abs_err = dequantized
        .data()
        .iter()
        .zip(reference.data().iter())
        .map(|(a, b)| (a - b).abs())
        .fold(0.0f32, f32::max);

    println!();
    println!("Integer inference vs observe-mode output:");
    println!("   exact codes:   {exact}/{codes} ({:.1}%)", 100.0 * exact as f32 / codes as f32);
    println!("   max code diff: {max_code_diff}");
    println!("   max abs error: {max_abs_err:.6}");
    Ok(())
}

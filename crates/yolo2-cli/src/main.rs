//! `yolo2` — command-line interface for the YOLO2_FPGA accelerator.
//!
//! ```text
//! USAGE:
//!   yolo2 plan                       Print the arena and tile plan
//!   yolo2 check --dir <model>        Validate a model blob directory
//!   yolo2 infer --dir <model> --input <frame.bin> [--sim]
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use yolo2_chip::{plan_conv, plan_maxpool, TileParams};
use yolo2_driver::{DevMem, DmaMemory, RegisterBus, SimBus, SimPool, UdmabufPool};
use yolo2_models::prelude::*;
use yolo2_models::loading::RawBlobs;
use yolo2_models::{layout, LayerKind};

/// Fake physical base for the simulated DMA pool.
const SIM_DMA_BASE: u64 = 0x4000_0000;

#[derive(Parser)]
#[command(name = "yolo2", about = "YOLO2_FPGA accelerator CLI", version)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Print the memory and tile plan for the YOLOv2 COCO network.
    Plan,
    /// Validate a model directory against the network.
    Check {
        /// Directory holding the five blob files.
        #[arg(long)]
        dir: PathBuf,
    },
    /// Run one frame through the accelerator.
    Infer {
        /// Directory holding the five blob files.
        #[arg(long)]
        dir: PathBuf,
        /// Raw frame: little-endian f32, channel-major, 416x416x3.
        #[arg(long)]
        input: PathBuf,
        /// Original frame width before letterboxing.
        #[arg(long, default_value_t = 416)]
        width: usize,
        /// Original frame height before letterboxing.
        #[arg(long, default_value_t = 416)]
        height: usize,
        /// Run against the software model instead of hardware.
        #[arg(long)]
        sim: bool,
        /// u-dma-buf device name for the hardware path.
        #[arg(long, default_value = "udmabuf0")]
        udmabuf: String,
        /// Per-layer completion timeout in milliseconds.
        #[arg(long, default_value_t = 5000)]
        layer_timeout_ms: u64,
        /// Detection threshold.
        #[arg(long, default_value_t = 0.24)]
        thresh: f32,
        /// If set, dump every layer's output buffer here.
        #[arg(long)]
        dump_dir: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Cmd::Plan => cmd_plan()?,
        Cmd::Check { dir } => cmd_check(&dir)?,
        Cmd::Infer {
            dir,
            input,
            width,
            height,
            sim,
            udmabuf,
            layer_timeout_ms,
            thresh,
            dump_dir,
        } => {
            let config = EngineConfig {
                layer_timeout: Duration::from_millis(layer_timeout_ms),
                detect_thresh: thresh,
                dump_dir,
                ..EngineConfig::default()
            };
            cmd_infer(&dir, &input, width, height, sim, &udmabuf, config)?;
        }
    }

    Ok(())
}

fn kind_name(kind: &LayerKind) -> &'static str {
    match kind {
        LayerKind::Conv { .. } => "conv",
        LayerKind::Maxpool { .. } => "maxpool",
        LayerKind::Reorg { .. } => "reorg",
        LayerKind::Route => "route",
        LayerKind::Region { .. } => "region",
    }
}

fn tiles_for(layer: &yolo2_models::Layer) -> Option<TileParams> {
    match layer.kind {
        LayerKind::Conv { filters, size, stride, .. } => Some(plan_conv(
            layer.in_c as u32,
            filters as u32,
            layer.out_w as u32,
            layer.out_h as u32,
            size as u32,
            stride as u32,
        )),
        LayerKind::Maxpool { size, stride } => Some(plan_maxpool(
            layer.in_c as u32,
            layer.out_w as u32,
            layer.out_h as u32,
            size as u32,
            stride as u32,
        )),
        _ => None,
    }
}

fn cmd_plan() -> Result<()> {
    let net = yolov2_coco();
    let plan = layout::plan(&net)?;

    println!(
        "YOLOv2 COCO: {} layers, {}x{}x{} input",
        net.layers().len(),
        net.input_w(),
        net.input_h(),
        net.input_c()
    );
    println!(
        "Arena: {} words ({} KiB), input staged at word {}",
        plan.arena_words,
        plan.arena_words * 2 / 1024,
        plan.input_offset
    );
    println!();

    for (i, layer) in net.layers().iter().enumerate() {
        let place = &plan.placements[i];
        print!(
            "[{i:2}] {:7} {:3}x{:3}x{:3} -> {:3}x{:3}x{:3}  out@{:8}",
            kind_name(&layer.kind),
            layer.in_w,
            layer.in_h,
            layer.in_c,
            layer.out_w,
            layer.out_h,
            layer.out_c,
            place.output_offset,
        );
        if let Some(t) = tiles_for(layer) {
            print!(
                "  Tm={:2} Tn={} Tr={:2} Tc={:2} loops={}",
                t.tm, t.tn, t.tr, t.tc, t.m_loops
            );
        }
        if place.copy_route {
            print!("  (copied)");
        }
        println!();
    }

    Ok(())
}

fn cmd_check(dir: &PathBuf) -> Result<()> {
    let net = yolov2_coco();
    let blobs = RawBlobs::load(dir).context("loading blobs")?;

    println!("Weights : {} words", blobs.weights.len());
    println!("Biases  : {} words", blobs.biases.len());
    println!(
        "Q tables: {} weight / {} bias / {} activation",
        blobs.weight_q.len(),
        blobs.bias_q.len(),
        blobs.act_q.len()
    );

    WeightSet::new(blobs.weights, blobs.biases, &net).context("sizing weights")?;
    QTables::new(blobs.weight_q, blobs.bias_q, blobs.act_q, &net)
        .context("validating Q tables")?;

    println!(
        "ok: blobs match the network ({} convolutions)",
        net.conv_count()
    );
    Ok(())
}

fn read_frame(path: &PathBuf, words: usize) -> Result<Vec<f32>> {
    let raw = std::fs::read(path)
        .with_context(|| format!("reading {}", path.display()))?;
    if raw.len() != words * 4 {
        anyhow::bail!(
            "{} holds {} bytes, expected {} (416x416x3 f32)",
            path.display(),
            raw.len(),
            words * 4
        );
    }
    Ok(raw
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

fn cmd_infer(
    dir: &PathBuf,
    input: &PathBuf,
    width: usize,
    height: usize,
    sim: bool,
    udmabuf: &str,
    config: EngineConfig,
) -> Result<()> {
    let net = yolov2_coco();
    let blobs = RawBlobs::load(dir)?;
    let weights = WeightSet::new(blobs.weights, blobs.biases, &net)?;
    let tables = QTables::new(blobs.weight_q, blobs.bias_q, blobs.act_q, &net)?;
    let image = read_frame(input, net.input_words())?;

    let dets = if sim {
        let plan = layout::plan(&net)?;
        let words = plan.arena_words + weights.weights().len() + weights.biases().len();
        let mut pool = SimPool::new(SIM_DMA_BASE, words);
        let bus = SimBus::new(pool.backing(), pool.base_phys());
        run_engine(bus, &mut pool, net, weights, tables, config, &image, width, height)?
    } else {
        let bus = DevMem::open().context("mapping accelerator registers")?;
        let mut pool = UdmabufPool::open(udmabuf).context("opening DMA pool")?;
        run_engine(bus, &mut pool, net, weights, tables, config, &image, width, height)?
    };

    println!("{} detections", dets.len());
    for d in &dets {
        println!(
            "class {:3}  {:5.1}%  x={:.3} y={:.3} w={:.3} h={:.3}",
            d.class,
            d.prob * 100.0,
            d.bbox.x,
            d.bbox.y,
            d.bbox.w,
            d.bbox.h
        );
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn run_engine<B: RegisterBus>(
    bus: B,
    pool: &mut dyn DmaMemory,
    net: Network,
    weights: WeightSet,
    tables: QTables,
    config: EngineConfig,
    image: &[f32],
    width: usize,
    height: usize,
) -> Result<Vec<FinalDetection>> {
    let mut engine = InferenceEngine::new(
        bus,
        pool,
        net,
        weights,
        tables,
        &YOLOV2_ANCHORS,
        config,
    )?;

    let start = std::time::Instant::now();
    let dets = engine.run(image, width, height)?;
    tracing::info!(
        elapsed_ms = start.elapsed().as_millis() as u64,
        hw_layers = engine.hw_layers_run(),
        "Frame complete"
    );
    Ok(dets)
}

// Scenario Runner - Load and execute scenario YAML files
//
// Usage:
//   cargo run --bin scenario_runner scenarios/balance_credit.yaml
//   cargo run --bin scenario_runner scenarios/  (runs all .yaml files in directory)
//   cargo run --bin scenario_runner scenarios/outage.yaml --seed 0x1234... --csv out.csv
//
// With a directory and --csv, the csv path is a directory receiving one file
// per scenario.

mod csv_sink;

use csv_sink::CsvEventSink;
use log::LevelFilter;
use qn_sim::{CollectorEventSink, SimConfig, Simulation};
use simple_logger::SimpleLogger;
use std::cell::RefCell;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// Scenario file format
#[derive(Debug, serde::Deserialize)]
struct ScenarioFile {
    /// Scenario metadata
    #[serde(default)]
    meta: ScenarioMeta,

    /// Simulation configuration; omitted fields keep their defaults
    #[serde(default)]
    config: SimConfig,
}

#[derive(Debug, Default, serde::Deserialize)]
struct ScenarioMeta {
    name: Option<String>,
    description: Option<String>,
    hypothesis: Option<String>,
}

struct Options {
    path: PathBuf,
    seed: Option<[u8; 32]>,
    csv: Option<PathBuf>,
    verbose: bool,
}

fn main() {
    let args: Vec<String> = env::args().collect();

    let options = parse_args(&args).unwrap_or_else(|e| {
        eprintln!("{}\n", e);
        eprintln!(
            "Usage: {} <scenario.yaml | directory/> [--seed SEED_HEX] [--csv PATH] [--verbose]",
            args[0]
        );
        eprintln!("\nExamples:");
        eprintln!("  {} scenarios/balance_credit.yaml", args[0]);
        eprintln!("  {} scenarios/", args[0]);
        eprintln!("  {} scenarios/outage.yaml --seed 0x123456... --csv outage.csv", args[0]);
        std::process::exit(1);
    });

    let level = if options.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Warn
    };
    SimpleLogger::new().with_level(level).init().unwrap();

    if options.path.is_file() {
        run_scenario_file(&options.path, options.seed, options.csv.as_deref());
    } else if options.path.is_dir() {
        run_scenario_directory(&options.path, options.seed, options.csv.as_deref());
    } else {
        eprintln!("Error: Path does not exist: {}", options.path.display());
        std::process::exit(1);
    }
}

fn parse_args(args: &[String]) -> Result<Options, String> {
    let mut path = None;
    let mut seed = None;
    let mut csv = None;
    let mut verbose = false;

    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--seed" => {
                let hex = iter.next().ok_or("--seed needs a value")?;
                seed = Some(parse_seed_hex(hex)?);
            }
            "--csv" => {
                let target = iter.next().ok_or("--csv needs a path")?;
                csv = Some(PathBuf::from(target));
            }
            "--verbose" | "-v" => verbose = true,
            other if path.is_none() => path = Some(PathBuf::from(other)),
            other => return Err(format!("Unexpected argument: {}", other)),
        }
    }

    Ok(Options {
        path: path.ok_or("Missing scenario path")?,
        seed,
        csv,
        verbose,
    })
}

fn run_scenario_directory(dir: &Path, seed: Option<[u8; 32]>, csv_dir: Option<&Path>) {
    let mut scenarios = Vec::new();

    // Find all .yaml files
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) == Some("yaml") ||
               path.extension().and_then(|s| s.to_str()) == Some("yml") {
                scenarios.push(path);
            }
        }
    }

    scenarios.sort();

    if scenarios.is_empty() {
        eprintln!("No .yaml files found in {}", dir.display());
        std::process::exit(1);
    }

    if let Some(csv_dir) = csv_dir {
        if let Err(e) = fs::create_dir_all(csv_dir) {
            eprintln!("Failed to create {}: {}", csv_dir.display(), e);
            std::process::exit(1);
        }
    }

    println!("\n╔════════════════════════════════════════════════════════╗");
    println!("║  SCENARIO RUNNER - Multiple Scenarios                 ║");
    println!("╚════════════════════════════════════════════════════════╝\n");
    println!("Found {} scenario(s) to run\n", scenarios.len());

    for (i, scenario_path) in scenarios.iter().enumerate() {
        println!("\n{}/{} Running: {}\n", i + 1, scenarios.len(), scenario_path.display());
        let csv = csv_dir.map(|d| {
            let stem = scenario_path.file_stem().unwrap_or_default();
            d.join(stem).with_extension("csv")
        });
        run_scenario_file(scenario_path, seed, csv.as_deref());
    }

    println!("\n╔════════════════════════════════════════════════════════╗");
    println!("║  All scenarios complete!                               ║");
    println!("╚════════════════════════════════════════════════════════╝\n");
}

fn run_scenario_file(path: &Path, seed: Option<[u8; 32]>, csv: Option<&Path>) {
    println!("Loading scenario from: {}", path.display());

    // Load and parse YAML
    let yaml_content = fs::read_to_string(path)
        .unwrap_or_else(|e| {
            eprintln!("Failed to read {}: {}", path.display(), e);
            std::process::exit(1);
        });

    let scenario: ScenarioFile = serde_yaml::from_str(&yaml_content)
        .unwrap_or_else(|e| {
            eprintln!("Failed to parse {}: {}", path.display(), e);
            std::process::exit(1);
        });

    // Print scenario header
    println!("\n╔════════════════════════════════════════════════════════╗");
    if let Some(ref name) = scenario.meta.name {
        println!("║  {}  {}", name, " ".repeat(54_usize.saturating_sub(name.len())));
    } else {
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("unnamed");
        println!("║  Scenario: {}  ", stem);
    }
    println!("╚════════════════════════════════════════════════════════╝\n");

    if let Some(ref desc) = scenario.meta.description {
        println!("{}\n", desc);
    }

    if let Some(ref hypothesis) = scenario.meta.hypothesis {
        println!("Hypothesis:");
        println!("  {}\n", hypothesis);
    }

    let mut config = scenario.config;
    if seed.is_some() {
        config.seed = seed;
    }

    println!("Configuration:");
    println!("  Runtime: {}", config.runtime);
    for pool in &config.pools {
        println!(
            "  Pool {}: {} servers x capacity {}",
            pool.kind, pool.size, pool.capacity
        );
    }
    println!("  Route: {}", config.transaction.kinds.join(" -> "));
    println!("  Mode: {:?}", config.transaction.mode);
    println!("  Max volume: {}", config.seasonality.max_volume);
    println!("  Faults: {}", config.faults.len());
    println!("\nStarting simulation...\n");

    let mut sim = Simulation::new(config).unwrap_or_else(|e| {
        eprintln!("Invalid scenario {}: {}", path.display(), e);
        std::process::exit(1);
    });

    let collector = Rc::new(RefCell::new(CollectorEventSink::new()));
    sim.attach(Box::new(collector.clone()));

    if let Some(csv_path) = csv {
        let sink = CsvEventSink::new(csv_path).unwrap_or_else(|e| {
            eprintln!("Failed to create {}: {}", csv_path.display(), e);
            std::process::exit(1);
        });
        sim.attach(Box::new(sink));
        println!("Writing records to {}", csv_path.display());
    }

    let result = sim.run().unwrap_or_else(|e| {
        eprintln!("Run failed: {}", e);
        std::process::exit(1);
    });

    // Print results
    result.print_summary();

    let counts = collector.borrow().count_by_status();
    println!("\nRecord stream: {} info, {} error", counts.info, counts.error);
    if !result.capacity_respected() {
        println!("⚠ a server exceeded its capacity");
    }
    if result.stats.teardown_held != result.stats.teardown_released {
        println!("⚠ teardown released fewer grants than it held");
    }

    println!("\n✓ Scenario complete!\n");
}

fn parse_seed_hex(hex: &str) -> Result<[u8; 32], String> {
    let hex = hex.strip_prefix("0x").unwrap_or(hex);
    let mut seed = [0u8; 32];

    for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
        if i >= 32 {
            break;
        }
        let byte_str = std::str::from_utf8(chunk).map_err(|e| format!("Invalid hex seed: {}", e))?;
        seed[i] = u8::from_str_radix(byte_str, 16)
            .map_err(|e| format!("Invalid hex seed: {}", e))?;
    }

    Ok(seed)
}

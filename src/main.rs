use log::info;
use simple_logger::SimpleLogger;

use qn_sim::{CollectorEventSink, SimConfig, Simulation};

use std::cell::RefCell;
use std::rc::Rc;

fn main() {
    SimpleLogger::new()
        .with_level(log::LevelFilter::Info)
        .init()
        .unwrap();

    info!("starting");

    // balance -> credit with the stock pools and a daily-ish load curve
    let mut config = SimConfig {
        runtime: 100.0,
        ..SimConfig::default()
    };
    config.seasonality.samples = vec![(0.0, 0.16), (25.0, 0.9), (50.0, 1.0), (75.0, 0.5), (100.0, 0.16)];
    config.seasonality.max_volume = 100.0;

    let collector = Rc::new(RefCell::new(CollectorEventSink::new()));
    let mut sim = match Simulation::new(config) {
        Ok(sim) => sim,
        Err(e) => {
            eprintln!("invalid configuration: {}", e);
            std::process::exit(1);
        }
    };
    sim.attach(Box::new(collector.clone()));

    let result = match sim.run() {
        Ok(result) => result,
        Err(e) => {
            eprintln!("run failed: {}", e);
            std::process::exit(1);
        }
    };

    result.print_summary();

    let collector = collector.borrow();
    let counts = collector.count_by_status();
    info!("{} info records, {} error records", counts.info, counts.error);
    for record in collector.errors().take(5) {
        info!("{}", record);
    }
}

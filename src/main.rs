use flash_sim::config::{Config, Time};
use flash_sim::sim;

use log::info;
use simplelog::{ConfigBuilder, LevelFilter, SimpleLogger};
use time::macros::format_description;

fn summarize(label: &str, history: &[(Time, usize)]) {
    info!("{}:", label);
    match (history.first(), history.last()) {
        (Some(first), Some(last)) => {
            info!("- first sample at time {}", first.0);
            info!("- final dead page count: {}", last.1);
        }
        _ => info!("- no samples recorded"),
    }
}

fn main() {
    let log_cfg = ConfigBuilder::new()
        .set_time_format_custom(format_description!("[hour]:[minute]:[second].[subsecond]"))
        .build();

    SimpleLogger::init(LevelFilter::Info, log_cfg).unwrap();

    let cfg = Config::default();
    let seed = Some(7);

    info!("running simulation without wear leveling...");
    let without_wl = sim::run(&cfg, false, seed).unwrap();

    info!("running simulation with wear leveling...");
    let with_wl = sim::run(&cfg, true, seed).unwrap();

    info!("simulation results:");
    summarize("without wear leveling", &without_wl);
    summarize("with wear leveling", &with_wl);
}

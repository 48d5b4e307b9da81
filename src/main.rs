use anyhow::{bail, Context, Result};
use clap::Parser;
use log::LevelFilter;
use poke::{test_http_tracker, test_udp_tracker, Capabilities, TrackerResult};
use std::time::Duration;

#[derive(Parser, Debug)]
#[clap(
    version,
    about = "Probe a BitTorrent tracker for optional features and protocol conformance",
    group(clap::ArgGroup::new("tracker").required(true).args(["announce", "udp"]))
)]
struct Cli {
    #[clap(short, long, value_name = "URI", help = "HTTP announce URI, e.g. http://tracker.org:6881/announce")]
    announce: Option<String>,
    #[clap(short, long, value_name = "HOST:PORT", help = "UDP tracker address (udp:// URLs are accepted too)")]
    udp: Option<String>,
    #[clap(long, help = "log every announce and response")]
    debug: bool,
    #[clap(short, long, default_value = "15", help = "I/O deadline in seconds")]
    timeout: u64,
    #[clap(long, help = "print the result as JSON")]
    json: bool,
}

fn init_logging(level: LevelFilter) -> Result<()> {
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!("[{:<5}] {}", record.level(), message))
        })
        .level(LevelFilter::Warn)
        .level_for("poke", level)
        .chain(std::io::stderr())
        .apply()
        .context("failed to install logger")
}

fn verdict(v: Option<bool>) -> String {
    v.map_or_else(|| "unknown".to_string(), |v| v.to_string())
}

fn print_capabilities(caps: &Capabilities) {
    println!("Tracker supports IP spoofing: {}", verdict(caps.ip_spoofing));
    println!(
        "Tracker supports optimized announce responses: {}",
        verdict(caps.self_exclusion)
    );
    println!(
        "Tracker supports optimized seeder announce responses: {}",
        verdict(caps.optimized_seeder_response)
    );
}

fn print_tracker_result(result: &TrackerResult) {
    print_capabilities(&result.capabilities);

    println!();
    println!("Poke ran these tests:");
    for test in result.tests.iter().filter(|t| t.ran()) {
        println!();
        println!("Test: {}", test.name);
        if let Some(v) = test.verdict() {
            println!("Result: {v}");
        }
        match test.error() {
            Some(e) => println!("Error: {e}"),
            None if test.verdict().is_none() => println!("Result: passed"),
            None => {}
        }
    }

    println!();
    println!("Poke did not run these tests:");
    for test in result.tests.iter().filter(|t| !t.ran()) {
        println!("{}\t- {}", test.name, test.not_run_reason().unwrap_or_default());
    }
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_logging(if args.debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    })?;
    log::debug!("{:?}", args);
    let timeout = Duration::from_secs(args.timeout);

    match (&args.udp, &args.announce) {
        (Some(addr), _) => {
            let result = test_udp_tracker(addr, timeout)
                .with_context(|| format!("cannot probe UDP tracker {addr}"))?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_tracker_result(&result);
            }
        }
        (None, Some(uri)) => {
            let result = test_http_tracker(uri, timeout)
                .with_context(|| format!("cannot probe HTTP tracker {uri}"))?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("Tracker supports HTTP compact announces: {}", result.supports_compact);
                println!(
                    "Tracker supports HTTP non-compact announces: {}",
                    result.supports_non_compact
                );
                print_tracker_result(&result.tracker);
            }
        }
        (None, None) => bail!("one of --announce or --udp is required"),
    }
    Ok(())
}

// Fast data reading example
//
// Reads a Barst ADC channel in a tight loop and reports throughput. A
// second thread cancels the outstanding read once per second to show that
// cancelled reads return promptly with whatever was buffered.

use barst_rs::{
    AdcChannel, AdcConfig, CancelToken, Endpoint, Session, SessionConfig, SimServer, SubChannel,
};
use clap::Parser;
use std::io::{self, Write};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "fast_read")]
#[command(version = "1.0")]
#[command(about = "High-speed data acquisition from a Barst ADC channel")]
#[command(long_about = "Continuously read data from a Barst ADC channel as fast as possible. Without an endpoint a simulated server with a free-running producer is used. Great for performance testing and real-time monitoring.")]
struct Args {
    /// Server endpoint, e.g. tcp://127.0.0.1:4000
    #[arg(short, long)]
    endpoint: Option<String>,

    /// Device path on the server
    #[arg(short, long, default_value = "/dev/adc0")]
    device: String,

    /// Requested sampling rate in Hz
    #[arg(short, long, default_value_t = 30_000.0)]
    rate: f64,

    /// Stop after this many seconds
    #[arg(short, long, default_value_t = 5)]
    seconds: u64,

    /// Enable verbose logging
    #[arg(short, long, help = "Show debug information and detailed logs")]
    verbose: bool,

    /// Display only statistics (no voltage values)
    #[arg(long, help = "Show only performance statistics, not voltage readings")]
    stats_only: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if args.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::init();
    }

    let config = AdcConfig::builder()
        .sampling_rate(args.rate)
        .bit_depth(16)
        .input_range(-10.0, 10.0)
        .buffer_capacity(65_536)
        .transfer_size(1000)
        .build()?;

    let (server, endpoint) = match &args.endpoint {
        Some(endpoint) => (None, endpoint.parse::<Endpoint>()?),
        None => {
            let server = SimServer::start()?;
            let device = server.add_device(&args.device);
            let endpoint = server.endpoint();
            (Some((server, device)), endpoint)
        }
    };

    println!("Barst Fast Data Reader");
    println!("======================");
    println!("Endpoint: {}", endpoint);
    println!("Device: {}", args.device);
    println!("Sampling rate: {:.1} Hz", config.actual_rate());

    let session = Session::connect(SessionConfig::new(endpoint))?;
    let actual_rate = config.actual_rate();
    let adc = Arc::new(AdcChannel::open(&session, &args.device, config)?);
    adc.set_state(true)?;
    println!("✓ Opened {} as {}\n", args.device, adc.id());

    let deadline = Instant::now() + Duration::from_secs(args.seconds);
    let producer = server.as_ref().map(|(_, device)| {
        let device = device.clone();
        thread::spawn(move || {
            let mut code = 0u32;
            while Instant::now() < deadline {
                let n = (actual_rate / 1000.0).ceil() as usize;
                let codes: Vec<u32> = (0..n)
                    .map(|_| {
                        code = (code + 37) % 65_536;
                        code
                    })
                    .collect();
                device.append(&codes);
                thread::sleep(Duration::from_millis(1));
            }
        })
    });

    let token = CancelToken::new();
    let canceller = {
        let adc = Arc::clone(&adc);
        thread::spawn(move || {
            while Instant::now() < deadline {
                thread::sleep(Duration::from_secs(1));
                adc.cancel_read();
            }
        })
    };

    let start_time = Instant::now();
    let mut reads = 0u64;
    let mut scans = 0u64;
    let mut dropped = 0u64;
    while Instant::now() < deadline {
        let result = match adc.read_with(10_000, &token) {
            Ok(result) => result,
            Err(e) => {
                eprintln!("\nError reading data: {}", e);
                eprintln!("Retrying in 100ms...");
                thread::sleep(Duration::from_millis(100));
                continue;
            }
        };
        reads += 1;
        scans += result.count() as u64;
        dropped += result.dropped_count();
        let elapsed = start_time.elapsed();

        print!(
            "\r[{}] {} reads | {} scans | {:.0} scans/s | dropped {} | fullness {:4.1}%",
            format_duration(elapsed),
            reads,
            scans,
            scans as f64 / elapsed.as_secs_f64(),
            dropped,
            result.fullness() * 100.0
        );
        if !args.stats_only {
            let first: Vec<String> = result
                .values(SubChannel::A)
                .iter()
                .take(3)
                .map(|v| format!("{v:.3}V"))
                .collect();
            print!(" | First: [{}]", first.join(", "));
        }
        io::stdout().flush()?;
    }
    println!();

    adc.close()?;
    let _ = canceller.join();
    if let Some(producer) = producer {
        let _ = producer.join();
    }
    Ok(())
}

fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;

    if hours > 0 {
        format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{:02}:{:02}", minutes, seconds)
    }
}

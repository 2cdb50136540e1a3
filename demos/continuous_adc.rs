// Continuous acquisition example
//
// Streams two sub-channels from a simulated ADC fed with a sine and a
// square wave, printing per-read statistics and a DataFrame of the last
// read. Make the producer outrun the reader with --burst to watch overflow
// being reported.

use barst_rs::{AdcChannel, AdcConfig, RateFilter, Session, SessionConfig, SimServer, SubChannel};
use clap::Parser;
use std::f64::consts::TAU;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "continuous_adc")]
#[command(about = "Continuous two-channel acquisition from a simulated Barst ADC")]
struct Args {
    /// Requested sampling rate in Hz
    #[arg(short, long, default_value_t = 2000.0)]
    rate: f64,

    /// Number of reads to perform
    #[arg(short = 'n', long, default_value_t = 20)]
    reads: usize,

    /// Scans requested per read
    #[arg(short, long, default_value_t = 500)]
    max_samples: usize,

    /// Server buffer capacity in records
    #[arg(short, long, default_value_t = 4096)]
    capacity: usize,

    /// Average this many records per delivered scan
    #[arg(short, long)]
    average: Option<u32>,

    /// Producer pushes this many times more records than the rate allows
    #[arg(long, default_value_t = 1)]
    burst: usize,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
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

    let server = SimServer::start()?;
    let device = server.add_device("/dev/adc0");

    let session = Session::connect(SessionConfig::new(server.endpoint()))?;
    let config = AdcConfig::builder()
        .sampling_rate(args.rate)
        .bit_depth(12)
        .input_range(-5.0, 5.0)
        .buffer_capacity(args.capacity)
        .transfer_size(100)
        .chan_a(true)
        .chan_b(true)
        .rate_filter(args.average.map(RateFilter::Average))
        .build()?;
    let actual_rate = config.actual_rate();
    println!("Sampling at {:.3} Hz (requested {} Hz)", actual_rate, args.rate);

    let adc = AdcChannel::open(&session, device.path(), config)?;
    adc.set_state(true)?;

    // producer: 10 ms worth of records per tick
    let running = Arc::new(AtomicBool::new(true));
    let producer = {
        let running = Arc::clone(&running);
        let per_tick = ((actual_rate / 100.0).ceil() as usize).max(1) * args.burst;
        thread::spawn(move || {
            let mut t = 0usize;
            while running.load(Ordering::Relaxed) {
                let mut volts = Vec::with_capacity(per_tick * 2);
                for _ in 0..per_tick {
                    let phase = t as f64 / actual_rate;
                    volts.push(4.0 * (TAU * 5.0 * phase).sin());
                    volts.push(if (phase * 2.0).fract() < 0.5 { 6.0 } else { -2.0 });
                    t += 1;
                }
                device.append_volts(&volts);
                thread::sleep(Duration::from_millis(10));
            }
        })
    };

    let mut last = None;
    for i in 0..args.reads {
        let result = adc.read(args.max_samples)?;
        let a = result.values(SubChannel::A);
        let mean = a.iter().sum::<f64>() / a.len().max(1) as f64;
        let saturated = result
            .sub_channel(SubChannel::B)
            .filter(|s| s.out_of_range)
            .count();
        println!(
            "read {:3}: first index {:7} | {:5} scans | dropped {:5} | fullness {:5.1}% | rate {} | mean A {:+.3} V | B saturated {}",
            i,
            result.first_index(),
            result.count(),
            result.dropped_count(),
            result.fullness() * 100.0,
            result
                .sample_rate()
                .map_or_else(|| "-".to_string(), |r| format!("{r:.0} Hz")),
            mean,
            saturated
        );
        last = Some(result);
        thread::sleep(Duration::from_millis(50));
    }

    running.store(false, Ordering::Relaxed);
    let _ = producer.join();
    adc.close()?;

    if let Some(result) = last {
        println!("\nLast read, sub-channel B:");
        println!("{}", result.sub_channel_frame(SubChannel::B)?.head(Some(10)));
    }
    Ok(())
}

// Basic connection example
//
// Connects to a Barst server, prints what it reports about itself and opens
// and closes one ADC channel. Pass an endpoint such as tcp://host:4000 to
// use a real server; without one an in-process simulated server is started.

use barst_rs::{
    AdcChannel, AdcConfig, BarstConnector, Endpoint, Session, SessionConfig, SimServer,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging (optional)
    env_logger::init();

    println!("Barst Connection Example");
    println!("========================\n");

    println!("1. Serial ports that could host a server...");
    match BarstConnector::available_serial_endpoints() {
        Ok(candidates) if candidates.is_empty() => println!("  none found"),
        Ok(candidates) => {
            for (i, candidate) in candidates.iter().enumerate() {
                println!("  {}. {} ({})", i + 1, candidate.endpoint, candidate.description);
            }
        }
        Err(e) => println!("  could not list serial ports: {}", e),
    }
    println!();

    let (endpoint, _server) = match std::env::args().nth(1) {
        Some(endpoint) => (endpoint.parse::<Endpoint>()?, None),
        None => {
            let server = SimServer::start()?;
            server.add_device("/dev/adc0");
            println!("No endpoint given, started simulated server");
            (server.endpoint(), Some(server))
        }
    };

    println!("2. Connecting to {}...", endpoint);
    let session = Session::connect(SessionConfig::new(endpoint))?;
    println!("Connected, server version {}", session.server_version());
    println!("Max message size: {} bytes", session.max_message_size());

    let clock = session.server_clock()?;
    println!(
        "Server clock: {:.3} s monotonic, {:.3} s since epoch\n",
        clock.monotonic, clock.utc
    );

    println!("3. Opening /dev/adc0...");
    let config = AdcConfig::builder()
        .sampling_rate(1234.0)
        .bit_depth(16)
        .input_range(-10.0, 10.0)
        .build()?;
    let adc = AdcChannel::open(&session, "/dev/adc0", config)?;
    let (scale, offset) = adc.conversion_factors();
    println!("Opened as {}", adc.id());
    println!(
        "Requested {} Hz, device samples at {:.3} Hz",
        adc.config().requested_rate(),
        adc.config().actual_rate()
    );
    println!("volts = (code - {:.1}) * {:.6e}", offset, scale);

    adc.close()?;
    println!("\n4. Channel closed, connection test completed successfully!");

    Ok(())
}

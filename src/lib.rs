//! # Barst RS
//!
//! Client library for the continuous-sampling channels of a Barst
//! hardware-control server.
//!
//! A Barst server owns several acquisition devices and multiplexes them
//! over one connection. This crate opens logical channels to those devices,
//! streams their samples out of the server-side ring buffer, reports
//! overflow, and turns the packed raw codes into calibrated, timestamped
//! values.
//!
//! ## Features
//!
//! - **One connection, many channels**: requests are correlated by channel
//!   and sequence number, so reads on different channels run concurrently
//! - **Lossless ordering**: sample indices are gapless across reads; loss
//!   from buffer overflow is counted and reported with the next read
//! - **Cancellable reads**: a blocked read returns promptly with what is
//!   buffered when cancelled
//! - **Typed configuration**: invalid settings are rejected before any
//!   server round trip
//! - **DataFrame output**: read results export to `polars`
//! - **TCP, Unix socket and serial transports**
//!
//! ## Examples
//!
//! ### Continuous acquisition
//!
//! ```rust,no_run
//! use barst_rs::{AdcChannel, AdcConfig, SubChannel, Session, SessionConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let session = Session::connect(SessionConfig::new("tcp://127.0.0.1:4000".parse()?))?;
//! println!("Server version {}", session.server_version());
//!
//! let config = AdcConfig::builder()
//!     .sampling_rate(2000.0)
//!     .bit_depth(16)
//!     .input_range(-10.0, 10.0)
//!     .chan_a(true)
//!     .chan_b(true)
//!     .build()?;
//! println!("Sampling at {} Hz", config.actual_rate());
//!
//! let adc = AdcChannel::open(&session, "/dev/adc0", config)?;
//! adc.set_state(true)?;
//! for _ in 0..10 {
//!     let result = adc.read(1000)?;
//!     if result.dropped_count() > 0 {
//!         println!("lost {} records", result.dropped_count());
//!     }
//!     println!("A: {:?}", result.values(SubChannel::A));
//! }
//! adc.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! ### Cancelling a blocked read
//!
//! ```rust,no_run
//! use barst_rs::{AdcChannel, AdcConfig, CancelToken, Session, SessionConfig};
//! use std::sync::Arc;
//! use std::thread;
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let session = Session::connect(SessionConfig::new("tcp://127.0.0.1:4000".parse()?))?;
//! let adc = Arc::new(AdcChannel::open(&session, "/dev/adc0", AdcConfig::builder().build()?)?);
//! adc.set_state(true)?;
//!
//! let token = CancelToken::new();
//! let canceller = token.clone();
//! thread::spawn(move || {
//!     thread::sleep(Duration::from_millis(100));
//!     canceller.cancel();
//! });
//! let partial = adc.read_with(100_000, &token)?;
//! println!("got {} scans before cancelling", partial.count());
//! # Ok(())
//! # }
//! ```
//!
//! ### Rate filtering
//!
//! ```rust
//! use barst_rs::{AdcConfig, RateFilter};
//!
//! let config = AdcConfig::builder()
//!     .sampling_rate(10_000.0)
//!     .rate_filter(Some(RateFilter::Average(10)))
//!     .build()
//!     .unwrap();
//! assert_eq!(config.actual_rate(), 10_000.0);
//! ```
//!
//! ### Endpoint discovery
//!
//! ```rust,no_run
//! use barst_rs::BarstConnector;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! for candidate in BarstConnector::available_serial_endpoints()? {
//!     println!("{} ({})", candidate.endpoint, candidate.description);
//! }
//! # Ok(())
//! # }
//! ```

pub mod adc_channel;
pub mod adc_config;
pub mod barst_connector;
pub mod barst_session;
pub mod calibration;
pub mod cancel_token;
pub mod channel;
pub mod decoder;
pub mod rate_filter;
pub mod read_result;
pub mod sample_block;
pub mod sample_buffer;
#[cfg(feature = "sim")]
pub mod sim_server;
pub mod wire;

// Re-export the main types for convenience
pub use adc_channel::AdcChannel;
pub use adc_config::{
    AdcClock, AdcConfig, AdcConfigBuilder, CodeEncoding, ConfigError, InputRange, SubChannel,
};
pub use barst_connector::{BarstConnector, ConnectorError, Endpoint, SerialCandidate};
pub use barst_session::{
    ServerClock, ServerInfo, Session, SessionConfig, SessionError, SessionLimits,
    MIN_SERVER_VERSION,
};
pub use calibration::Calibrator;
pub use cancel_token::CancelToken;
pub use channel::{Channel, ChannelConfig, ChannelError, ChannelState, DeviceFamily};
pub use rate_filter::RateFilter;
pub use read_result::{ReadResult, Sample};
pub use sample_buffer::{BufferError, ContinuousSampleBuffer, DrainOutcome, Drained};
#[cfg(feature = "sim")]
pub use sim_server::{SimDevice, SimServer, SimServerOptions};

use std::process::exit;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use opendaq_rs::{AnalogSetup, Daq, ExpMode};

#[derive(Parser, Debug)]
#[command(name = "opendaq-demo", about = "Connect to an openDAQ and stream analog readings")]
struct Args {
    /// Serial port the device is connected to (e.g. /dev/ttyUSB0, COM3)
    port: String,
    /// Positive analog input [1:8]
    #[arg(long, default_value_t = 8)]
    pinput: u8,
    /// PGA gain id (index into the model's gain ladder)
    #[arg(long, default_value_t = 1)]
    gain: u8,
    /// Sampling period in milliseconds
    #[arg(long, default_value_t = 100)]
    period: u16,
    /// How long to stream, in seconds
    #[arg(long, default_value_t = 5)]
    seconds: u64,
}

fn main() {
    opendaq_rs::init_logging();
    if let Err(e) = run() {
        eprintln!("Error: {e}");
        exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();

    println!("--- Connecting to openDAQ on {} ---", args.port);
    let mut daq = Daq::open(&args.port)?;
    println!(
        "Hardware: {}  Firmware: {}  Serial: {}",
        daq.hw_ver(),
        daq.fw_ver(),
        daq.serial_str()
    );

    let stream = daq.create_stream(ExpMode::AnalogIn, args.period, 0, true, 1000)?;
    daq.analog_setup(
        &stream,
        AnalogSetup {
            pinput: args.pinput,
            gain: args.gain,
            ..Default::default()
        },
    )?;

    println!("Streaming A{} for {}s at {}ms...", args.pinput, args.seconds, args.period);
    daq.start()?;
    for _ in 0..args.seconds {
        thread::sleep(Duration::from_secs(1));
        let data = stream.read();
        match data.last() {
            Some(v) => println!("{:3} samples | last = {:+.4} V", data.len(), v),
            None => println!("  no samples yet"),
        }
    }

    println!("Stopping...");
    daq.stop()?;
    if daq.stream_crc_errors() > 0 {
        println!("{} frames arrived with a bad checksum", daq.stream_crc_errors());
    }
    println!("Done.");
    Ok(())
}

//! Playstream Player - headless test-tone playback
//!
//! Drives the engine through its host surface the way an embedding
//! application would: init, start, a stream of buffers, stop, delete.
//!
//! ## Command line flags
//!
//! - `--simulate`: Use the in-process simulated platform
//! - `--config <path>`: Read config from `<path>` instead of the default location
//! - `--save-config`: Write the effective config back to disk and exit
//! - `--file <path>`: Play a raw 16-bit little-endian PCM file instead of the tone
//! - `--disconnect-after <secs>`: (simulate only) unplug the simulated device mid-run
//! - `--list-devices`: Print output devices and exit (cpal-backend only)

mod config;
mod pcm;
mod tone;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};

use playstream_core::audio::{AudioPlatform, DeviceId, SimulatedPlatform, StreamParameters};
use playstream_core::EngineHost;

use config::PlayerConfig;
use tone::ToneGenerator;

/// How often progress is logged
const REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// Poll period while a file plays
const REPORT_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Default)]
struct Args {
    simulate: bool,
    config_path: Option<PathBuf>,
    save_config: bool,
    disconnect_after: Option<f32>,
    list_devices: bool,
    pcm_file: Option<PathBuf>,
}

fn parse_args() -> Result<Args> {
    let mut args = Args::default();
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--simulate" => args.simulate = true,
            "--save-config" => args.save_config = true,
            "--list-devices" => args.list_devices = true,
            "--config" => {
                let path = iter.next().context("--config needs a path")?;
                args.config_path = Some(PathBuf::from(path));
            }
            "--file" => {
                let path = iter.next().context("--file needs a path")?;
                args.pcm_file = Some(PathBuf::from(path));
            }
            "--disconnect-after" => {
                let secs = iter.next().context("--disconnect-after needs a number of seconds")?;
                args.disconnect_after = Some(
                    secs.parse()
                        .with_context(|| format!("Invalid --disconnect-after value: {}", secs))?,
                );
            }
            other => bail!("Unknown argument: {}", other),
        }
    }
    Ok(args)
}

fn main() -> Result<()> {
    let args = parse_args()?;

    // Config is read before the logger exists so its log_level can seed the filter
    let config_path = args.config_path.clone().unwrap_or_else(config::default_config_path);
    let mut player_config = config::load_config(&config_path);
    if args.simulate {
        player_config.backend.simulate = true;
    }
    if args.pcm_file.is_some() {
        player_config.playback.pcm_file = args.pcm_file.clone();
    }

    // Initialize logger - RUST_LOG overrides the configured level
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(player_config.log_level.as_str()),
    )
    .format_timestamp_millis()
    .init();

    log::info!("playstream-player starting up (config {:?})", config_path);

    if args.save_config {
        config::save_config(&player_config, &config_path)?;
        println!("Config written to {}", config_path.display());
        return Ok(());
    }

    if args.list_devices {
        return list_devices();
    }

    let (platform, simulated) = create_platform(&player_config)?;
    let params = match &player_config.backend.device {
        Some(name) => StreamParameters::playback().with_device(DeviceId::Named(name.clone())),
        None => StreamParameters::playback(),
    };

    let host = EngineHost::with_parameters(platform, params);
    if !host.init() {
        bail!("Failed to initialize the playback engine");
    }

    let result = match &player_config.playback.pcm_file {
        Some(path) => run_file(&host, path, &player_config, simulated.as_ref(), args.disconnect_after),
        None => run(&host, &player_config, simulated.as_ref(), args.disconnect_after),
    };

    let counters = host.counters()?;
    host.delete()?;

    println!();
    println!("Streams opened:     {}", counters.streams_opened);
    println!("Restarts completed: {}", counters.restarts_completed);
    println!("Restarts failed:    {}", counters.restarts_failed);
    println!("Restarts dropped:   {}", counters.restarts_dropped);
    println!("Restarts skipped:   {}", counters.restarts_skipped);
    println!("Frames written:     {}", counters.frames_written);

    result
}

fn run(
    host: &EngineHost,
    player_config: &PlayerConfig,
    simulated: Option<&SimulatedPlatform>,
    disconnect_after: Option<f32>,
) -> Result<()> {
    let properties = host.start().context("Failed to start playback")?;
    println!(
        "Playing {:.0}Hz on stream {} ({}Hz, {} frames/burst, ~{:.1}ms buffer)",
        player_config.playback.tone_frequency,
        properties.stream_id,
        properties.sample_rate,
        properties.frames_per_burst,
        properties.latency_ms()
    );

    let playback = &player_config.playback;
    let buffer_period = Duration::from_secs_f32(playback.buffer_seconds.max(0.01));
    let frames_per_buffer = (properties.sample_rate as f32 * buffer_period.as_secs_f32()) as usize;
    let mut tone = ToneGenerator::new(
        playback.tone_frequency,
        playback.amplitude,
        properties.sample_rate,
        properties.channel_count,
    );

    let mut session = Session::new(playback.run_seconds, disconnect_after);
    while !session.finished() {
        host.write_buffer(tone.next_buffer(frames_per_buffer))?;
        session.tick(host, simulated)?;
        thread::sleep(buffer_period);
    }

    host.stop().context("Failed to stop playback")?;
    Ok(())
}

/// Hand a PCM file to the engine once, then cycle start/stop over it
fn run_file(
    host: &EngineHost,
    path: &Path,
    player_config: &PlayerConfig,
    simulated: Option<&SimulatedPlatform>,
    disconnect_after: Option<f32>,
) -> Result<()> {
    let samples = pcm::load_pcm_file(path)?;
    host.write_buffer(samples)?;

    let playback = &player_config.playback;
    let cycles = playback.start_stop_cycles.max(1);
    let mut disconnect_after = disconnect_after;
    for cycle in 1..=cycles {
        let properties = host.start().context("Failed to start playback")?;
        println!(
            "Playing {} ({}/{}) on stream {} ({}Hz, {} frames/burst)",
            path.display(),
            cycle,
            cycles,
            properties.stream_id,
            properties.sample_rate,
            properties.frames_per_burst
        );

        // Only the first cycle gets the simulated disconnect
        let mut session = Session::new(playback.run_seconds, disconnect_after.take());
        while !session.finished() {
            session.tick(host, simulated)?;
            thread::sleep(REPORT_POLL);
        }

        host.stop().context("Failed to stop playback")?;
    }
    Ok(())
}

/// Run timer with progress reports and an optional simulated disconnect
struct Session {
    started: Instant,
    run_for: Duration,
    disconnect_at: Option<Instant>,
    last_report: Instant,
}

impl Session {
    fn new(run_seconds: f32, disconnect_after: Option<f32>) -> Self {
        let started = Instant::now();
        Self {
            started,
            run_for: Duration::from_secs_f32(run_seconds.max(0.0)),
            disconnect_at: disconnect_after.map(|secs| started + Duration::from_secs_f32(secs.max(0.0))),
            last_report: started,
        }
    }

    fn finished(&self) -> bool {
        self.started.elapsed() >= self.run_for
    }

    fn tick(&mut self, host: &EngineHost, simulated: Option<&SimulatedPlatform>) -> Result<()> {
        if let Some(at) = self.disconnect_at {
            if Instant::now() >= at {
                self.disconnect_at = None;
                inject_disconnect(host, simulated)?;
            }
        }

        if self.last_report.elapsed() >= REPORT_INTERVAL {
            self.last_report = Instant::now();
            let counters = host.counters()?;
            log::info!(
                "{:.1}s: {} frames written, {} restarts",
                self.started.elapsed().as_secs_f32(),
                counters.frames_written,
                counters.restarts_completed
            );
        }
        Ok(())
    }
}

fn inject_disconnect(host: &EngineHost, simulated: Option<&SimulatedPlatform>) -> Result<()> {
    let Some(platform) = simulated else {
        log::warn!("--disconnect-after only applies to the simulated platform");
        return Ok(());
    };
    let Some(properties) = host.stream_properties()? else {
        log::warn!("No stream to disconnect");
        return Ok(());
    };
    log::info!("Simulating device disconnect on stream {}", properties.stream_id);
    if let Some(callback_thread) = platform.disconnect(properties.stream_id) {
        let _ = callback_thread.join();
    }
    Ok(())
}

#[cfg(feature = "cpal-backend")]
fn create_platform(config: &PlayerConfig) -> Result<(Arc<dyn AudioPlatform>, Option<SimulatedPlatform>)> {
    if config.backend.simulate {
        let simulated = SimulatedPlatform::new();
        return Ok((Arc::new(simulated.clone()), Some(simulated)));
    }
    Ok((Arc::new(playstream_core::audio::CpalPlatform::new()), None))
}

#[cfg(not(feature = "cpal-backend"))]
fn create_platform(config: &PlayerConfig) -> Result<(Arc<dyn AudioPlatform>, Option<SimulatedPlatform>)> {
    if !config.backend.simulate {
        log::warn!("Built without cpal-backend, using the simulated platform");
    }
    let simulated = SimulatedPlatform::new();
    Ok((Arc::new(simulated.clone()), Some(simulated)))
}

#[cfg(feature = "cpal-backend")]
fn list_devices() -> Result<()> {
    let devices = playstream_core::audio::list_output_devices().context("Failed to enumerate output devices")?;
    for name in devices {
        println!("{}", name);
    }
    Ok(())
}

#[cfg(not(feature = "cpal-backend"))]
fn list_devices() -> Result<()> {
    bail!("Device listing needs the cpal-backend feature")
}

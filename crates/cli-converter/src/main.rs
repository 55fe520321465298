use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use converter::{
    config::ConverterConfig,
    journal::load_all_records,
    probe::probe_with,
    scan::{scan_inputs, ScanResult},
    validate, CodecId, ContainerFormat, JobId, JobReport, JobState, MediaInfo, OutputRequest, PixelFormat, Scheduler,
    SchedulerSettings, StreamInfo, StreamRequest,
};
use converter::media::StreamParams;
use futures::StreamExt;
use humansize::{format_size, DECIMAL};
use log::{debug, info, warn};

/// Offline media converter: WAV, AVI and Y4M natively, MP4, MOV, WebM and still images through ffmpeg
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show container and stream details
    Probe {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Print MediaInfo as JSON
        #[arg(long)]
        json: bool,
    },
    /// Convert one file
    Convert {
        input: PathBuf,
        /// Target container (wav, avi, y4m, mp4, mov, png, jpg, webp, avif); inferred from --output when omitted
        #[arg(long)]
        to: Option<ContainerFormat>,
        /// Output path; defaults to <input>_converted.<ext>
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[command(flatten)]
        streams: StreamArgs,
    },
    /// Convert every recognised file under the given directories
    Batch {
        #[arg(required = true)]
        dirs: Vec<PathBuf>,
        #[arg(long)]
        to: ContainerFormat,
        /// Jobs to run at once, overriding the config
        #[arg(short = 'j', long)]
        jobs: Option<usize>,
        #[command(flatten)]
        streams: StreamArgs,
    },
    /// List finished jobs recorded in job_state_dir
    History {
        /// Show only the most recent N records
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
}

#[derive(clap::Args, Debug, Clone)]
struct StreamArgs {
    #[arg(long)]
    audio_codec: Option<CodecId>,
    #[arg(long)]
    video_codec: Option<CodecId>,
    /// Audio bitrate in bits per second; accepts k and M suffixes (128k)
    #[arg(long, value_parser = parse_bitrate)]
    audio_bitrate: Option<u64>,
    /// Video bitrate in bits per second; accepts k and M suffixes (2M)
    #[arg(long, value_parser = parse_bitrate)]
    video_bitrate: Option<u64>,
    #[arg(long)]
    sample_rate: Option<u32>,
    #[arg(long)]
    channels: Option<u16>,
    /// Picture size as WIDTHxHEIGHT
    #[arg(long, value_parser = parse_size)]
    size: Option<(u32, u32)>,
    #[arg(long)]
    pixel_format: Option<PixelFormat>,
    #[arg(long)]
    drop_audio: bool,
    #[arg(long)]
    drop_video: bool,
    /// Keep the .part file when a conversion fails or is cancelled
    #[arg(long)]
    keep_partial: bool,
    /// Replace an existing output file
    #[arg(long)]
    overwrite: bool,
}

impl StreamArgs {
    fn request(&self, cfg: &ConverterConfig) -> OutputRequest {
        OutputRequest {
            audio: StreamRequest {
                codec: self.audio_codec.clone(),
                bitrate: self.audio_bitrate,
                sample_rate: self.sample_rate,
                channels: self.channels,
                drop: self.drop_audio,
                ..StreamRequest::default()
            },
            video: StreamRequest {
                codec: self.video_codec.clone(),
                bitrate: self.video_bitrate,
                width: self.size.map(|(w, _)| w),
                height: self.size.map(|(_, h)| h),
                pixel_format: self.pixel_format,
                drop: self.drop_video,
                ..StreamRequest::default()
            },
            keep_partial: self.keep_partial || cfg.keep_partial_output,
            overwrite: self.overwrite,
            ..OutputRequest::default()
        }
    }
}

fn parse_size(s: &str) -> Result<(u32, u32), String> {
    let (w, h) = s
        .split_once(|c| c == 'x' || c == 'X')
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got '{}'", s))?;
    let w = w.trim().parse::<u32>().map_err(|e| format!("bad width '{}': {}", w, e))?;
    let h = h.trim().parse::<u32>().map_err(|e| format!("bad height '{}': {}", h, e))?;
    Ok((w, h))
}

fn parse_bitrate(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let (digits, scale) = match s.char_indices().last() {
        Some((i, 'k' | 'K')) => (&s[..i], 1_000),
        Some((i, 'm' | 'M')) => (&s[..i], 1_000_000),
        _ => (s, 1),
    };
    let value = digits
        .parse::<f64>()
        .map_err(|e| format!("bad bitrate '{}': {}", s, e))?;
    if !value.is_finite() || value <= 0.0 {
        return Err(format!("bitrate must be positive, got '{}'", s));
    }
    Ok((value * scale as f64).round() as u64)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // --verbose forces debug regardless of RUST_LOG
    let mut logger = env_logger::Builder::from_default_env();
    if args.verbose {
        logger.filter_level(log::LevelFilter::Debug);
    }
    logger.format_timestamp_secs().init();

    let cfg = ConverterConfig::load_config(args.config.as_deref()).context("Failed to load configuration")?;
    debug!("Configuration: {:?}", cfg);

    let ok = match args.command {
        Command::Probe { files, json } => probe_files(&cfg, &files, json)?,
        Command::Convert { input, to, output, streams } => {
            let mut request = streams.request(&cfg);
            request.container = to;
            request.output = output;
            convert_one(&cfg, input, request).await?
        }
        Command::Batch { dirs, to, jobs, streams } => {
            let mut cfg = cfg;
            if let Some(jobs) = jobs {
                cfg.max_parallel_jobs = jobs.max(1);
            }
            let mut request = streams.request(&cfg);
            request.container = Some(to);
            convert_batch(&cfg, &dirs, request).await?
        }
        Command::History { limit } => show_history(&cfg, limit)?,
    };

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}

fn describe_stream(stream: &StreamInfo) -> String {
    let detail = match &stream.params {
        StreamParams::Audio { sample_rate, channels } => format!("{} Hz, {} ch", sample_rate, channels),
        StreamParams::Video { width, height, frame_rate, pixel_format } => {
            let pix = pixel_format.map(|p| format!(", {}", p)).unwrap_or_default();
            format!("{}x{} @ {} fps{}", width, height, frame_rate, pix)
        }
        StreamParams::Subtitle => String::new(),
    };
    let bitrate = stream
        .bitrate
        .map(|b| format!(", {} kb/s", b / 1000))
        .unwrap_or_default();
    format!(
        "#{} {} {} ({}{}), {:.3}s",
        stream.index,
        stream.kind,
        stream.codec,
        detail,
        bitrate,
        stream.duration.as_secs_f64()
    )
}

fn print_info(info: &MediaInfo) {
    println!(
        "{}: {}, {}, {:.3}s",
        info.path.display(),
        info.container,
        format_size(info.file_size, DECIMAL),
        info.duration.as_secs_f64()
    );
    for stream in &info.streams {
        println!("  {}", describe_stream(stream));
    }
}

fn probe_files(cfg: &ConverterConfig, files: &[PathBuf], json: bool) -> Result<bool> {
    let registry = cfg.format_registry();
    let mut ok = true;
    for file in files {
        match probe_with(file, &registry, cfg.probe_bytes) {
            Ok(info) if json => println!("{}", serde_json::to_string_pretty(&info)?),
            Ok(info) => print_info(&info),
            Err(e) => {
                eprintln!("{}", e);
                ok = false;
            }
        }
    }
    Ok(ok)
}

fn format_eta(eta: Option<Duration>) -> String {
    match eta {
        Some(d) if d.as_secs() >= 60 => format!("eta {}m{:02}s", d.as_secs() / 60, d.as_secs() % 60),
        Some(d) => format!("eta {}s", d.as_secs()),
        None => String::new(),
    }
}

/// Render a job's progress on stderr until it ends
async fn follow(scheduler: &Scheduler, id: JobId) -> Result<JobReport> {
    let mut events = scheduler.subscribe(id)?;
    let mut stderr = std::io::stderr();
    while let Some(event) = events.next().await {
        let _ = write!(
            stderr,
            "\r{}: {:<9} {:<11} {:>5.1}% {:<12}",
            event.job,
            event.state,
            event.phase,
            event.fraction * 100.0,
            format_eta(event.eta)
        );
        let _ = stderr.flush();
    }
    let _ = writeln!(stderr);
    Ok(scheduler.report(id)?)
}

fn print_report(report: &JobReport) {
    match report.state {
        JobState::Succeeded => {
            println!(
                "✅ {} -> {} ({})",
                report.input.display(),
                report.output.display(),
                format_size(report.bytes_written, DECIMAL)
            );
            for failure in &report.stream_failures {
                println!("   ⚠️  dropped: {}", failure);
            }
        }
        _ => {
            let reason = report.error.as_ref().map(|e| e.to_string()).unwrap_or_default();
            println!("❌ {} {}: {}", report.input.display(), report.state, reason);
            if let Some(partial) = &report.partial_output {
                println!("   partial output kept at {}", partial.display());
            }
        }
    }
}

/// Cancel everything on Ctrl-C
fn cancel_on_interrupt(scheduler: &Scheduler) {
    let scheduler = scheduler.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling running jobs");
            scheduler.cancel_all();
        }
    });
}

async fn convert_one(cfg: &ConverterConfig, input: PathBuf, request: OutputRequest) -> Result<bool> {
    let registry = Arc::new(cfg.format_registry());
    let info = probe_with(&input, &registry, cfg.probe_bytes)?;
    let descriptor = validate(&info, &request, &registry)
        .with_context(|| format!("Cannot convert {}", input.display()))?;

    for plan in descriptor.streams() {
        info!(
            "stream {} -> output {}: {:?} {} -> {}",
            plan.source.index,
            plan.output_index(),
            plan.action,
            plan.source.codec,
            plan.target.codec
        );
    }
    for dropped in descriptor.dropped() {
        info!("stream {} dropped", dropped);
    }

    let scheduler = Scheduler::new(registry, SchedulerSettings::from(cfg));
    cancel_on_interrupt(&scheduler);
    let id = scheduler.submit(descriptor)?;
    let report = follow(&scheduler, id).await?;
    print_report(&report);
    Ok(report.state == JobState::Succeeded)
}

async fn convert_batch(cfg: &ConverterConfig, dirs: &[PathBuf], request: OutputRequest) -> Result<bool> {
    let registry = Arc::new(cfg.format_registry());
    let results = scan_inputs(dirs, &registry)?;
    let scheduler = Scheduler::new(registry.clone(), SchedulerSettings::from(cfg));
    cancel_on_interrupt(&scheduler);

    let mut ids = Vec::new();
    let mut rejected = 0;
    for result in results {
        let (path, size) = match result {
            ScanResult::Candidate(path, size) => (path, size),
            ScanResult::Skipped(path, reason) => {
                debug!("Skipped {}: {}", path.display(), reason);
                continue;
            }
        };
        let submitted = probe_with(&path, &registry, cfg.probe_bytes)
            .map_err(anyhow::Error::from)
            .and_then(|info| validate(&info, &request, &registry).map_err(anyhow::Error::from))
            .and_then(|descriptor| scheduler.submit(descriptor).map_err(anyhow::Error::from));
        match submitted {
            Ok(id) => {
                info!("Submitted {} for {} ({})", id, path.display(), format_size(size, DECIMAL));
                ids.push(id);
            }
            Err(e) => {
                warn!("Not converting {}: {:#}", path.display(), e);
                println!("⏭️  {}: {:#}", path.display(), e);
                rejected += 1;
            }
        }
    }

    println!("Converting {} file(s), {} at a time", ids.len(), cfg.max_parallel_jobs);
    let reports = futures::future::join_all(ids.iter().map(|id| scheduler.wait(*id))).await;
    let mut succeeded = 0;
    let mut bytes = 0;
    for report in reports {
        let report = report?;
        print_report(&report);
        if report.state == JobState::Succeeded {
            succeeded += 1;
            bytes += report.bytes_written;
        }
    }
    println!(
        "{} succeeded, {} failed or cancelled, {} rejected; {} written",
        succeeded,
        ids.len() - succeeded,
        rejected,
        format_size(bytes, DECIMAL)
    );
    Ok(succeeded == ids.len() && rejected == 0)
}

fn show_history(cfg: &ConverterConfig, limit: Option<usize>) -> Result<bool> {
    let records = load_all_records(&cfg.job_state_dir)
        .with_context(|| format!("Failed to load job history from {}", cfg.job_state_dir.display()))?;
    if records.is_empty() {
        println!("No finished jobs in {}", cfg.job_state_dir.display());
        return Ok(true);
    }
    let skip = limit.map(|n| records.len().saturating_sub(n)).unwrap_or(0);
    for record in records.iter().skip(skip) {
        let took = record
            .run_time()
            .map(|d| format!("{:.1}s", d.num_milliseconds() as f64 / 1000.0))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{}  {:<9} {:>8}  {:>10}  {} -> {}",
            record.submitted_at.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S"),
            record.state,
            took,
            format_size(record.bytes_written, DECIMAL),
            record.input.display(),
            record.output.display()
        );
        if let Some(error) = &record.error {
            println!("    {}", error);
        }
        for failure in &record.stream_failures {
            println!("    dropped: {}", failure);
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("640x480"), Ok((640, 480)));
        assert_eq!(parse_size("32X16"), Ok((32, 16)));
        assert!(parse_size("640").is_err());
        assert!(parse_size("axb").is_err());
    }

    #[test]
    fn test_cli_parses_convert_flags() {
        let args = Args::try_parse_from([
            "mconv", "convert", "in.wav", "--to", "avi", "--sample-rate", "22050", "--channels", "1", "--keep-partial",
        ])
        .unwrap();
        let Command::Convert { input, to, streams, .. } = args.command else {
            panic!("expected convert");
        };
        assert_eq!(input, PathBuf::from("in.wav"));
        assert_eq!(to, Some(ContainerFormat::Avi));
        let request = streams.request(&ConverterConfig::default_config());
        assert_eq!(request.audio.sample_rate, Some(22050));
        assert_eq!(request.audio.channels, Some(1));
        assert!(request.keep_partial);
    }

    #[test]
    fn test_parse_bitrate() {
        assert_eq!(parse_bitrate("128k"), Ok(128_000));
        assert_eq!(parse_bitrate("1.5M"), Ok(1_500_000));
        assert_eq!(parse_bitrate("256000"), Ok(256_000));
        assert!(parse_bitrate("0").is_err());
        assert!(parse_bitrate("-3k").is_err());
        assert!(parse_bitrate("fast").is_err());
        assert!(parse_bitrate("k").is_err());
    }

    #[test]
    fn test_cli_bitrate_flags_reach_the_request() {
        let args = Args::try_parse_from([
            "mconv", "convert", "in.avi", "--to", "mp4", "--audio-bitrate", "96k", "--video-bitrate", "2M",
        ])
        .unwrap();
        let Command::Convert { to, streams, .. } = args.command else {
            panic!("expected convert");
        };
        assert_eq!(to, Some(ContainerFormat::Mp4));
        let request = streams.request(&ConverterConfig::default_config());
        assert_eq!(request.audio.bitrate, Some(96_000));
        assert_eq!(request.video.bitrate, Some(2_000_000));

        assert!(Args::try_parse_from(["mconv", "convert", "in.wav", "--audio-bitrate", "loud"]).is_err());
    }

    #[test]
    fn test_eta_formatting() {
        assert_eq!(format_eta(Some(Duration::from_secs(75))), "eta 1m15s");
        assert_eq!(format_eta(Some(Duration::from_secs(9))), "eta 9s");
        assert_eq!(format_eta(None), "");
    }
}

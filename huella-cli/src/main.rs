use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use huella_core::{resample, Config, Detection, Error, Key, Payload};

#[derive(Parser)]
#[command(name = "huella", about = "Blind spread-spectrum audio watermarking", version)]
struct Cli {
    /// Treat marginal problems as errors
    #[arg(long, global = true)]
    strict: bool,

    /// Disable information messages
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct MarkOptions {
    /// Watermarking key file (repeatable for get / cmp)
    #[arg(long = "key")]
    keys: Vec<PathBuf>,

    /// Watermark strength (water_delta x 1000)
    #[arg(long, default_value = "5")]
    strength: f64,

    /// Short payload mode with the given number of bits
    #[arg(long = "short")]
    short: Option<usize>,

    /// Keep data bits in linear frame order instead of shuffling them
    #[arg(long)]
    linear: bool,

    /// Apply the full spectral delta instead of cross-fading with the
    /// original spectrum
    #[arg(long)]
    no_mix: bool,
}

#[derive(Args)]
struct GetOptions {
    /// Detect and correct a playback speed difference
    #[arg(long)]
    detect_speed: bool,

    /// Slower, more accurate speed detection
    #[arg(long)]
    detect_speed_patient: bool,

    /// Assume the given playback speed instead of detecting it
    #[arg(long)]
    try_speed: Option<f64>,

    /// Final sync acceptance threshold
    #[arg(long)]
    sync_threshold: Option<f64>,

    /// Minimum number of sync matches kept per pass
    #[arg(long)]
    n_best: Option<usize>,

    /// Use synthesized block-aligned sync positions (testing only)
    #[arg(long, hide = true)]
    test_no_sync: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Create a watermarked WAV file with a message
    Add {
        input_wav: PathBuf,
        watermarked_wav: PathBuf,
        /// Message as hex (or a hex value in short mode)
        message_hex: String,

        #[command(flatten)]
        mark: MarkOptions,

        /// Report the signal-to-watermark ratio
        #[arg(long)]
        snr: bool,

        /// Disable the peak limiter (testing only)
        #[arg(long, hide = true)]
        test_no_limiter: bool,
    },
    /// Retrieve a message from a watermarked WAV file
    Get {
        watermarked_wav: PathBuf,

        #[command(flatten)]
        mark: MarkOptions,

        #[command(flatten)]
        get: GetOptions,
    },
    /// Compare the watermark message with an expected message
    Cmp {
        watermarked_wav: PathBuf,
        message_hex: String,

        #[command(flatten)]
        mark: MarkOptions,

        #[command(flatten)]
        get: GetOptions,
    },
    /// Generate a 128-bit watermarking key file
    GenKey {
        key_file: PathBuf,

        /// Human-readable key name stored in the file
        #[arg(long)]
        name: Option<String>,
    },
    /// Cut a random clip for robustness testing
    TestClip {
        input_wav: PathBuf,
        output_wav: PathBuf,
        seed: u64,
        seconds: u64,

        #[command(flatten)]
        mark: MarkOptions,
    },
    /// Change the playback speed of a file
    TestChangeSpeed {
        input_wav: PathBuf,
        output_wav: PathBuf,
        speed: f64,
    },
    /// Generate deterministic stereo noise for testing
    TestGenNoise {
        output_wav: PathBuf,
        seconds: f64,
        sample_rate: u32,

        #[command(flatten)]
        mark: MarkOptions,
    },
    /// Report the signal-to-watermark ratio between two files
    TestSnr {
        orig_wav: PathBuf,
        watermarked_wav: PathBuf,
    },
    /// Subtract two files (isolates the watermark signal)
    TestSubtract {
        input1_wav: PathBuf,
        input2_wav: PathBuf,
        output_wav: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.quiet { "warn" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("huella={default_level}"))),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("huella: {e}");
            ExitCode::from(1)
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode, Error> {
    match cli.command {
        Command::Add {
            input_wav,
            watermarked_wav,
            message_hex,
            mark,
            snr,
            test_no_limiter,
        } => {
            let config = Config {
                strict: cli.strict,
                test_no_limiter,
                ..make_config(&mark)?
            };
            let key = single_key(&mark)?;
            let payload = parse_payload(&message_hex, &config)?;

            let (samples, n_channels, rate) = load_wav(&input_wav)?;

            // embedding always runs at the internal mark rate
            let mut work = if rate != config.mark_sample_rate {
                resample::resample(&samples, n_channels, rate, config.mark_sample_rate)
            } else {
                samples
            };
            let result = huella_core::embed(&mut work, n_channels, &key, &config, &payload)?;
            let out = if rate != config.mark_sample_rate {
                resample::resample(&work, n_channels, config.mark_sample_rate, rate)
            } else {
                work
            };
            save_wav(&watermarked_wav, &out, n_channels, rate)?;

            if snr {
                println!("{:.6}", result.snr_db);
            }
            eprintln!(
                "huella: wrote {} blocks to {}",
                result.blocks_written,
                watermarked_wav.display()
            );
            Ok(ExitCode::SUCCESS)
        }
        Command::Get {
            watermarked_wav,
            mark,
            get,
        } => {
            let detections = run_get(&watermarked_wav, &mark, &get, cli.strict)?;
            print_detections(&detections);
            Ok(ExitCode::SUCCESS)
        }
        Command::Cmp {
            watermarked_wav,
            message_hex,
            mark,
            get,
        } => {
            let config = make_config(&mark)?;
            let expected = parse_payload(&message_hex, &config)?;
            let detections = run_get(&watermarked_wav, &mark, &get, cli.strict)?;
            print_detections(&detections);

            let matched = detections.iter().any(|d| d.payload == expected);
            if matched {
                Ok(ExitCode::SUCCESS)
            } else {
                eprintln!("huella: no match for message {}", expected.to_hex());
                Ok(ExitCode::from(1))
            }
        }
        Command::GenKey { key_file, name } => {
            let key = Key::generate(name)?;
            key.save(&key_file)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::TestClip {
            input_wav,
            output_wav,
            seed,
            seconds,
            mark,
        } => {
            let config = make_config(&mark)?;
            let key = single_key(&mark)?;
            let (samples, n_channels, rate) = load_wav(&input_wav)?;
            let frames = samples.len() / n_channels;
            if frames <= seconds as usize * rate as usize {
                return Err(Error::InputTooShort {
                    needed: seconds as usize * rate as usize + 1,
                    got: frames,
                });
            }

            // unbiased as long as two block lengths plus the clip fit
            let mut rng =
                huella_core::random::Random::new(&key, seed, huella_core::random::Stream::DataUpDown);
            let block_samples = config.block_frames() * config.frame_size;
            let (start, end) = loop {
                let start = (2.0 * block_samples as f64 * rng.random_double()) as usize;
                let end = start + seconds as usize * rate as usize;
                if end < frames {
                    break (start, end);
                }
            };

            save_wav(
                &output_wav,
                &samples[start * n_channels..end * n_channels],
                n_channels,
                rate,
            )?;
            Ok(ExitCode::SUCCESS)
        }
        Command::TestChangeSpeed {
            input_wav,
            output_wav,
            speed,
        } => {
            let (samples, n_channels, rate) = load_wav(&input_wav)?;
            let out = resample::resample_step(&samples, n_channels, speed, usize::MAX);
            save_wav(&output_wav, &out, n_channels, rate)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::TestGenNoise {
            output_wav,
            seconds,
            sample_rate,
            mark,
        } => {
            let key = single_key(&mark)?;
            let n_channels = 2;
            let mut rng =
                huella_core::random::Random::new(&key, 0, huella_core::random::Stream::DataUpDown);
            let noise: Vec<f32> = (0..(seconds * sample_rate as f64) as usize * n_channels)
                .map(|_| (rng.random_double() * 2.0 - 1.0) as f32)
                .collect();
            save_wav(&output_wav, &noise, n_channels, sample_rate)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::TestSnr {
            orig_wav,
            watermarked_wav,
        } => {
            let (orig, _, _) = load_wav(&orig_wav)?;
            let (wm, _, _) = load_wav(&watermarked_wav)?;
            println!("{:.6}", huella_core::embed::snr_db(&orig, &wm));
            Ok(ExitCode::SUCCESS)
        }
        Command::TestSubtract {
            input1_wav,
            input2_wav,
            output_wav,
        } => {
            let (in1, n_channels, rate) = load_wav(&input1_wav)?;
            let (in2, ch2, _) = load_wav(&input2_wav)?;
            if n_channels != ch2 {
                return Err(Error::Format(
                    "channel count mismatch between inputs".into(),
                ));
            }
            if in1.len() != in2.len() {
                let delta = in1.len().abs_diff(in2.len()) / n_channels;
                if cli.strict {
                    return Err(Error::Format(format!("size mismatch: {delta} frames")));
                }
                warn!("size mismatch: {delta} frames");
            }
            let out: Vec<f32> = in1
                .iter()
                .zip(in2.iter())
                .map(|(a, b)| a - b)
                .collect();
            save_wav(&output_wav, &out, n_channels, rate)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn make_config(mark: &MarkOptions) -> Result<Config, Error> {
    let mut config = Config {
        water_delta: mark.strength / 1000.0,
        mix: !mark.no_mix,
        linear: mark.linear,
        ..Config::default()
    };
    if let Some(bits) = mark.short {
        if !huella_core::shortcode::is_supported(bits) {
            return Err(Error::ShortCodeUnsupported(bits));
        }
        config.payload_size = bits;
        config.payload_short = true;
    }
    Ok(config)
}

fn parse_payload(message_hex: &str, config: &Config) -> Result<Payload, Error> {
    if config.payload_short {
        let value = u64::from_str_radix(message_hex.trim_start_matches("0x"), 16)
            .map_err(|_| Error::Format(format!("invalid hex value: {message_hex}")))?;
        Payload::from_value(value, config.payload_size)
    } else {
        Payload::from_hex(message_hex, config.payload_size)
    }
}

fn load_keys(mark: &MarkOptions) -> Result<Vec<Key>, Error> {
    if mark.keys.is_empty() {
        return Ok(vec![Key::default()]);
    }
    mark.keys.iter().map(|path| Key::load(path)).collect()
}

fn single_key(mark: &MarkOptions) -> Result<Key, Error> {
    let keys = load_keys(mark)?;
    if keys.len() > 1 {
        return Err(Error::Format(
            "the watermark key can be given at most once for add".into(),
        ));
    }
    Ok(keys.into_iter().next().expect("load_keys never returns empty"))
}

fn run_get(
    input: &Path,
    mark: &MarkOptions,
    get: &GetOptions,
    strict: bool,
) -> Result<Vec<Detection>, Error> {
    let mut config = Config {
        strict,
        test_no_sync: get.test_no_sync,
        ..make_config(mark)?
    };
    if let Some(threshold) = get.sync_threshold {
        config.sync_threshold2 = threshold;
    }
    if let Some(n_best) = get.n_best {
        config.get_n_best = n_best;
    }

    let speed_options =
        get.detect_speed as u32 + get.detect_speed_patient as u32 + get.try_speed.is_some() as u32;
    if speed_options > 1 {
        return Err(Error::Format(
            "can only use one of --detect-speed / --detect-speed-patient / --try-speed".into(),
        ));
    }

    let (samples, n_channels, rate) = load_wav(input)?;
    let samples = if rate != config.mark_sample_rate {
        resample::resample(&samples, n_channels, rate, config.mark_sample_rate)
    } else {
        samples
    };

    let keys = load_keys(mark)?;
    let mut all = Vec::new();
    for key in &keys {
        let speed = if let Some(speed) = get.try_speed {
            Some(speed)
        } else if get.detect_speed || get.detect_speed_patient {
            let result = huella_core::detect_speed(
                &samples,
                n_channels,
                key,
                &config,
                get.detect_speed_patient,
            );
            match result {
                Some(r) => {
                    println!("speed {:.6} {:.3}", r.speed, r.quality);
                    Some(r.speed)
                }
                None => {
                    warn!("no speed difference detected, assuming 1.0");
                    None
                }
            }
        } else {
            None
        };

        let corrected;
        let detect_input: &[f32] = match speed {
            Some(speed) => {
                corrected =
                    resample::resample_step(&samples, n_channels, 1.0 / speed, usize::MAX);
                &corrected
            }
            None => &samples,
        };

        match huella_core::detect(detect_input, n_channels, key, &config) {
            Ok(detections) => all.extend(detections),
            Err(Error::DecodeFail) => {}
            Err(e) => return Err(e),
        }
    }

    all.sort_by(|a, b| {
        a.bit_errors.cmp(&b.bit_errors).then(
            b.quality
                .partial_cmp(&a.quality)
                .unwrap_or(std::cmp::Ordering::Equal),
        )
    });
    if all.is_empty() {
        return Err(Error::DecodeFail);
    }
    Ok(all)
}

fn print_detections(detections: &[Detection]) {
    let config = Config::default();
    for d in detections {
        let seconds = d.index.max(0) as f64 / config.mark_sample_rate as f64;
        println!(
            "pattern {:2}:{:05.2} {} {} {:.3} {:?}",
            (seconds / 60.0) as u32,
            seconds % 60.0,
            d.payload.to_hex(),
            d.bit_errors,
            d.quality,
            d.block_type,
        );
    }
    println!("match count: {}", detections.len());
}

fn load_wav(path: &Path) -> Result<(Vec<f32>, usize, u32), Error> {
    let reader = hound::WavReader::open(path)
        .map_err(|e| Error::Format(format!("{}: {e}", path.display())))?;
    let spec = reader.spec();

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<Result<Vec<f32>, _>>()
            .map_err(|e| Error::Format(e.to_string()))?,
        hound::SampleFormat::Int => {
            let bits = spec.bits_per_sample;
            if !(8..=32).contains(&bits) {
                return Err(Error::Format(format!("unsupported bit depth: {bits}")));
            }
            let max = (1i64 << (bits - 1)) as f32;
            reader
                .into_samples::<i32>()
                .collect::<Result<Vec<i32>, _>>()
                .map_err(|e| Error::Format(e.to_string()))?
                .into_iter()
                .map(|s| s as f32 / max)
                .collect()
        }
    };

    Ok((samples, spec.channels as usize, spec.sample_rate))
}

fn save_wav(path: &Path, samples: &[f32], n_channels: usize, rate: u32) -> Result<(), Error> {
    let spec = hound::WavSpec {
        channels: n_channels as u16,
        sample_rate: rate,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut writer = hound::WavWriter::create(path, spec)
        .map_err(|e| Error::Format(format!("{}: {e}", path.display())))?;
    for &s in samples {
        writer
            .write_sample(s)
            .map_err(|e| Error::Format(e.to_string()))?;
    }
    writer
        .finalize()
        .map_err(|e| Error::Format(e.to_string()))?;
    Ok(())
}

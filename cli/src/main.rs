mod wav;

use audiolink_core::{send, try_recv, AsyncReader, Configuration};
use clap::{Parser, Subcommand};
use log::{info, LevelFilter};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Cursor, Read, Write};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "audiolink")]
#[command(about = "Acoustic data modem: send bytes as audio and receive them back")]
struct Cli {
    /// Modem bitrate in kb/s (see `audiolink bitrates`)
    #[arg(short, long, env = "AUDIOLINK_BITRATE", default_value_t = 1, global = true)]
    bitrate: u32,

    /// More logging (repeat for trace output)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Modulate data into s16le PCM audio (or WAV, by extension)
    Send {
        /// Input data file (default: stdin)
        #[arg(short, long, value_name = "INPUT")]
        input: Option<PathBuf>,

        /// Output audio file (default: stdout)
        #[arg(short, long, value_name = "OUTPUT")]
        output: Option<PathBuf>,

        /// Linear gain applied to every output sample
        #[arg(short, long, default_value_t = 1.0)]
        gain: f64,

        /// Extra leading silence in seconds
        #[arg(short, long, default_value_t = 0.0)]
        silence: f64,
    },

    /// Demodulate s16le PCM audio (or WAV, by extension) back into data
    Recv {
        /// Input audio file (default: stdin)
        #[arg(short, long, value_name = "INPUT")]
        input: Option<PathBuf>,

        /// Output data file (default: stdout)
        #[arg(short, long, value_name = "OUTPUT")]
        output: Option<PathBuf>,

        /// Also write the raw received audio to this file
        #[arg(short, long, value_name = "DUMP")]
        dump: Option<PathBuf>,
    },

    /// List the supported bitrates
    Bitrates,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    match cli.command {
        Commands::Send {
            input,
            output,
            gain,
            silence,
        } => {
            let config = Configuration::for_bitrate(cli.bitrate)?;
            send_command(&config, input.as_deref(), output.as_deref(), gain, silence)?
        }
        Commands::Recv {
            input,
            output,
            dump,
        } => {
            let config = Configuration::for_bitrate(cli.bitrate)?;
            recv_command(&config, input.as_deref(), output.as_deref(), dump.as_deref())?
        }
        Commands::Bitrates => bitrates_command()?,
    }

    Ok(())
}

fn init_logging(verbose: u8, quiet: bool) {
    let level = match (quiet, verbose) {
        (true, _) => LevelFilter::Warn,
        (false, 0) => LevelFilter::Info,
        (false, 1) => LevelFilter::Debug,
        (false, _) => LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_env("RUST_LOG")
        .format_timestamp_millis()
        .init();
}

fn open_input(path: Option<&Path>) -> io::Result<Box<dyn Read>> {
    Ok(match path {
        Some(path) => Box::new(BufReader::new(File::open(path)?)),
        None => Box::new(io::stdin().lock()),
    })
}

fn open_output(path: Option<&Path>) -> io::Result<Box<dyn Write>> {
    Ok(match path {
        Some(path) => Box::new(BufWriter::new(File::create(path)?)),
        None => Box::new(io::stdout().lock()),
    })
}

fn send_command(
    config: &Configuration,
    input: Option<&Path>,
    output: Option<&Path>,
    gain: f64,
    silence: f64,
) -> Result<(), Box<dyn std::error::Error>> {
    info!("Sending: {}", config);
    let src = open_input(input)?;

    let stats = match output {
        Some(path) if wav::is_wav(path) => {
            let mut pcm = Vec::new();
            let stats = send(config, src, &mut pcm, gain, silence)?;
            wav::write_pcm(path, &pcm, config.fs as u32)?;
            stats
        }
        _ => send(config, src, open_output(output)?, gain, silence)?,
    };

    info!(
        "Sent {} bytes as {:.3} seconds of audio",
        stats.bytes, stats.duration
    );
    Ok(())
}

fn recv_command(
    config: &Configuration,
    input: Option<&Path>,
    output: Option<&Path>,
    dump: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let src: Box<dyn Read> = match input {
        Some(path) if wav::is_wav(path) => {
            Box::new(Cursor::new(wav::read_pcm(path, config.fs as u32)?))
        }
        Some(path) => Box::new(BufReader::new(File::open(path)?)),
        // a sound card pipe must keep draining while we demodulate
        None => Box::new(AsyncReader::new(io::stdin())?),
    };
    let dst = open_output(output)?;

    let mut dump_file = match dump {
        Some(path) => Some(BufWriter::new(File::create(path)?)),
        None => None,
    };
    let dump_sink = dump_file.as_mut().map(|f| f as &mut dyn Write);

    let stats = try_recv(config, src, dst, dump_sink)?;
    if let Some(mut file) = dump_file {
        file.flush()?;
    }

    info!(
        "Received {} bytes in {} frames (amplitude {:.3}, drift {:+.2} ppm)",
        stats.bytes, stats.frames, stats.amplitude, stats.freq_err_ppm
    );
    Ok(())
}

fn bitrates_command() -> Result<(), Box<dyn std::error::Error>> {
    let mut out = io::stdout().lock();
    for kbps in audiolink_core::bitrates() {
        let config = Configuration::for_bitrate(kbps)?;
        writeln!(out, "{:>3}: {}", kbps, config)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_send() {
        let cli = Cli::try_parse_from([
            "audiolink", "-b", "8", "send", "-i", "in.bin", "-o", "out.wav", "-g", "0.5",
        ])
        .unwrap();
        assert_eq!(cli.bitrate, 8);
        match cli.command {
            Commands::Send {
                input,
                output,
                gain,
                silence,
            } => {
                assert_eq!(input, Some(PathBuf::from("in.bin")));
                assert_eq!(output, Some(PathBuf::from("out.wav")));
                assert_eq!(gain, 0.5);
                assert_eq!(silence, 0.0);
            }
            _ => panic!("Expected send"),
        }
    }

    #[test]
    fn test_quiet_conflicts_with_verbose() {
        assert!(Cli::try_parse_from(["audiolink", "-q", "-v", "bitrates"]).is_err());
    }
}

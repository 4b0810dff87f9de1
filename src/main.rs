use std::fs::File;
use std::io::{self, Read, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use bgzf2::{Reader, ThreadPool, Writer};

const IO_CHUNK: usize = 65536;

#[derive(Parser)]
#[command(
    name = "bgzip2",
    version,
    about = "Block compression/decompression with random access, built on Zstandard"
)]
struct Cli {
    /// Decompress instead of compress
    #[arg(short = 'd', long)]
    decompress: bool,

    /// Write to standard output
    #[arg(short = 'c', long)]
    stdout: bool,

    /// Uncompressed block size; accepts k, M and G suffixes
    #[arg(short = 'b', long, default_value = "256000", value_parser = parse_block_size)]
    block_size: usize,

    /// Zstd compression level (1-19); digit flags like -9 or -19 also work
    #[arg(short = 'l', long, default_value_t = bgzf2::DEFAULT_LEVEL)]
    level: i32,

    /// Number of worker threads (0 runs synchronously)
    #[arg(short = '@', long = "threads", default_value_t = 0)]
    threads: usize,

    /// Input file, or "-" for standard input
    #[arg(default_value = "-")]
    input: String,

    /// Output file, or "-" for standard output
    #[arg(default_value = "-")]
    output: String,
}

/// Rewrites bare digit flags (`-5`, `-19`) into `-l <digits>` so the level
/// can be given the way the classic compression tools accept it.
fn expand_level_flags<I>(args: I) -> Vec<std::ffi::OsString>
where
    I: IntoIterator<Item = std::ffi::OsString>,
{
    let mut out = Vec::new();
    let mut past_separator = false;
    for arg in args {
        if !past_separator {
            if arg == "--" {
                past_separator = true;
            } else if let Some(s) = arg.to_str() {
                if s.len() >= 2
                    && s.starts_with('-')
                    && s[1..].bytes().all(|b| b.is_ascii_digit())
                {
                    out.push("-l".into());
                    out.push(s[1..].into());
                    continue;
                }
            }
        }
        out.push(arg);
    }
    out
}

fn parse_block_size(value: &str) -> std::result::Result<usize, String> {
    let (digits, shift) = match value.as_bytes().last() {
        Some(b'k' | b'K') => (&value[..value.len() - 1], 10),
        Some(b'm' | b'M') => (&value[..value.len() - 1], 20),
        Some(b'g' | b'G') => (&value[..value.len() - 1], 30),
        _ => (value, 0),
    };
    let base: usize = digits
        .parse()
        .map_err(|_| format!("invalid block size: {value:?}"))?;
    base.checked_shl(shift)
        .filter(|sz| *sz <= bgzf2::MAX_BLOCK_SIZE)
        .ok_or_else(|| format!("block size out of range: {value:?}"))
}

fn open_input(path: &str) -> Result<Box<dyn Read>> {
    if path == "-" {
        Ok(Box::new(io::stdin()))
    } else {
        let file = File::open(path).with_context(|| format!("opening {path:?}"))?;
        Ok(Box::new(file))
    }
}

fn open_output(path: &str) -> Result<Box<dyn Write + Send>> {
    if path == "-" {
        Ok(Box::new(io::stdout()))
    } else {
        let file = File::create(path).with_context(|| format!("creating {path:?}"))?;
        Ok(Box::new(io::BufWriter::new(file)))
    }
}

fn compress(cli: &Cli, output: &str) -> Result<()> {
    let mut input = open_input(&cli.input)?;
    let sink = open_output(output)?;

    let mut writer = Writer::<Box<dyn Write + Send>>::builder()
        .level(cli.level)
        .block_size(cli.block_size)
        .build(sink)?;
    if cli.threads > 0 {
        writer.attach_thread_pool(Arc::new(ThreadPool::new(cli.threads)), 0)?;
    }

    let mut buf = vec![0u8; IO_CHUNK];
    loop {
        let n = input.read(&mut buf).context("reading input")?;
        if n == 0 {
            break;
        }
        writer.write(&buf[..n], true)?;
    }
    writer.finish()?;
    Ok(())
}

fn decompress(cli: &Cli, output: &str) -> Result<()> {
    let mut sink = open_output(output)?;
    if cli.input == "-" {
        let mut reader = Reader::new(io::stdin());
        io::copy(&mut reader, &mut sink).context("decompressing standard input")?;
    } else {
        let file = File::open(&cli.input).with_context(|| format!("opening {:?}", cli.input))?;
        let mut reader = Reader::new(io::BufReader::new(file));
        if cli.threads > 0 {
            reader.attach_thread_pool(Arc::new(ThreadPool::new(cli.threads)), 0)?;
        }
        io::copy(&mut reader, &mut sink).context("decompressing input")?;
    }
    sink.flush()?;
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse_from(expand_level_flags(std::env::args_os()));
    let output = if cli.stdout {
        "-".to_string()
    } else {
        cli.output.clone()
    };

    if cli.decompress {
        decompress(&cli, &output)
    } else {
        compress(&cli, &output)
    }
}

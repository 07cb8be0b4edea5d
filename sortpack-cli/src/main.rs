// sortpack-cli/src/main.rs

use clap::{ArgGroup, Parser, Subcommand};
use std::path::PathBuf;
use anyhow::{bail, Result};

use compress::compress_dir;
use decompress::{extract_archive, ExtractMode};
use sortpack_common::DEFAULT_LEVEL;

#[derive(Parser)]
#[command(name = "sortpack")]
#[command(about = "Sortpack: deduplicating archiver built on content-defined chunks", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Pack a directory into a single archive blob
    Compress {
        #[arg(short, long)]
        input: PathBuf,

        #[arg(short, long)]
        output: PathBuf,

        /// Deflate level, 0 (store) to 9 (smallest)
        #[arg(short, long, default_value_t = DEFAULT_LEVEL, value_parser = clap::value_parser!(u32).range(0..=9))]
        level: u32,
    },

    /// Extract an archive blob into a directory
    #[command(group(ArgGroup::new("single").args(["only", "native"])))]
    Extract {
        #[arg(short, long)]
        input: PathBuf,

        #[arg(short, long)]
        output: PathBuf,

        /// Extract only files with this name
        #[arg(long, requires = "rename")]
        only: Option<String>,

        /// File name to write the --only match to
        #[arg(long, requires = "only")]
        rename: Option<String>,

        /// Extract only the library built for this platform, under this name
        #[arg(long)]
        native: Option<String>,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Compress { input, output, level } => {
            let report = compress_dir(&input, &output, level)?;
            println!("\n✅ Compression done:");
            println!("📁 Files:                {}", report.total_files);
            println!("📂 Directories:          {}", report.total_dirs);
            println!("📥 Stream bytes:         {}", report.total_bytes_in);
            println!("📤 Archive bytes:        {}", report.total_bytes_out);
            println!("🧩 Chunks:               {}", report.chunks);
            println!("🔁 Unique chunks:        {}", report.unique_chunks);
            println!("🗂️  Segments / levels:    {} / {}", report.initial_segments, report.merge_levels);
            println!("📊 Space saved:          {:.2}%", report.compression_ratio);
        }

        Commands::Extract { input, output, only, rename, native } => {
            let mode = match (only, rename, native) {
                (Some(expected_name), Some(alt_name), None) => ExtractMode::SingleTarget { expected_name, alt_name },
                (None, None, Some(alt_name)) => ExtractMode::native_library(alt_name),
                (None, None, None) => ExtractMode::Full,
                _ => bail!("--only needs --rename and cannot be combined with --native"),
            };
            let report = extract_archive(&input, &output, mode)?;
            println!("\n✅ Extraction done:");
            println!("📂 Directories created:  {}", report.dirs_created);
            println!("📁 Files written:        {}", report.files_written);
            println!("⏭️  Files skipped:        {}", report.files_skipped);
            println!("📤 Bytes written:        {}", report.bytes_written);
            println!("📥 Stream bytes:         {}", report.stream_bytes);
        }
    }

    Ok(())
}

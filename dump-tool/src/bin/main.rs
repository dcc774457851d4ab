use std::path::PathBuf;

use clap::{Parser, Subcommand};
use pill_dispenser_dump::{EepromImage, LogSlot, format_record};

#[derive(Parser)]
#[command(name = "dispenser-dump")]
#[command(about = "Decode a pill dispenser EEPROM image", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the dispensing record
    Record {
        /// Raw 32 KiB EEPROM image
        input: PathBuf,
    },
    /// Print the log ring
    Log {
        /// Raw 32 KiB EEPROM image
        input: PathBuf,

        /// Also print the raw bytes of corrupted slots
        #[arg(short, long)]
        raw: bool,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Record { input } => {
            let image = EepromImage::from_file(&input)?;
            match image.record() {
                Ok(record) => println!("{}", format_record(&record)),
                Err(e) => println!("No valid record in {}: {e}", input.display()),
            }
            Ok(())
        }
        Commands::Log { input, raw } => {
            let image = EepromImage::from_file(&input)?;
            let log = image.log();

            for (index, slot) in &log {
                match slot {
                    LogSlot::Message(message) => println!("[{index:3}] {message}"),
                    LogSlot::Corrupt(bytes) if raw => println!("[{index:3}] <corrupt> {bytes}"),
                    LogSlot::Corrupt(_) => println!("[{index:3}] <corrupt>"),
                    LogSlot::Empty => {}
                }
            }

            println!("{} entries, next write at slot {}", log.len(), image.resume_index());
            Ok(())
        }
    }
}

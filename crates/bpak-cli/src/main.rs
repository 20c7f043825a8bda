use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::filter::LevelFilter;

mod cmds;

#[derive(Debug, Parser)]
#[command(name = "bpak", version, about = "Create, sign, verify, and transport BPAK archives")]
struct Args {
    /// Increase verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Create a fresh archive with an initialized header.
    Create(cmds::CreateCmd),
    /// Append a part or a metadata entry.
    Add(cmds::AddCmd),
    /// Set the signing identity fields.
    Set(cmds::SetCmd),
    /// Refresh the payload hash and sign the header.
    Sign(cmds::SignCmd),
    /// Recompute the payload hash and verify the signature.
    Verify(cmds::VerifyCmd),
    /// Dump the archive header in human-readable form.
    Show(cmds::ShowCmd),
    /// Transport encode or decode an archive.
    Transport(cmds::TransportCmd),
    /// Compare the headers of two archives.
    Compare(cmds::CompareCmd),
}

fn verbosity(args: &Args) -> u8 {
    let env = std::env::var("BPAK_VERBOSE")
        .ok()
        .and_then(|value| value.parse::<u8>().ok())
        .unwrap_or(0);
    args.verbose.max(env)
}

fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    let format = tracing_subscriber::fmt::format()
        .without_time()
        .with_target(false)
        .compact();
    tracing_subscriber::fmt()
        .with_max_level(level)
        .event_format(format)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(verbosity(&args));
    let result = match args.cmd {
        Cmd::Create(cmd) => cmds::create(cmd),
        Cmd::Add(cmd) => cmds::add(cmd),
        Cmd::Set(cmd) => cmds::set(cmd),
        Cmd::Sign(cmd) => cmds::sign(cmd),
        Cmd::Verify(cmd) => cmds::verify(cmd),
        Cmd::Show(cmd) => cmds::show(cmd),
        Cmd::Transport(cmd) => cmds::transport(cmd),
        Cmd::Compare(cmd) => cmds::compare(cmd),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            let code = err
                .downcast_ref::<bpak::Error>()
                .map(bpak::Error::code)
                .unwrap_or(1);
            ExitCode::from(code)
        }
    }
}

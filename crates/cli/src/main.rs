use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use switchboard::commands::{
    exec_command, harden_command, ids_command, list_backends_command, plt_sim_command, scan_binary_command,
    sled_sim_command, stats_command, ArchArg, HardenOptions, PltSimOptions, SledSimOptions,
};
use switchboard::parse_u64;

/// Control-flow integrity by indirect-call elimination.
///
/// This CLI is a thin wrapper around `switchboard-core` (exposed in code as
/// `switchboard_core`). Programs and facts are exchanged as JSON or YAML
/// documents, chosen by file extension.
#[derive(Parser, Debug)]
#[command(
    name = "switchboard",
    version,
    about = "Replace indirect calls with identifier dispatch",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Rewrite a program so every indirect call dispatches over identifiers.
    Harden {
        /// Serialized program to harden.
        #[arg(long)]
        program: PathBuf,

        /// Precollected facts. When omitted, facts are collected from the program.
        #[arg(long)]
        facts: Option<PathBuf>,

        /// Configuration file (JSON or YAML).
        #[arg(long)]
        config: Option<PathBuf>,

        /// Apply `TG_*` environment overrides on top of the configuration.
        #[arg(long, default_value_t = false)]
        env: bool,

        /// Where to write the hardened program.
        #[arg(long)]
        output: Option<PathBuf>,

        /// Directory for the identifier listing and statistics files.
        #[arg(long)]
        side_dir: Option<PathBuf>,

        /// Record the run in this statistics database.
        #[arg(long)]
        stats_db: Option<PathBuf>,

        /// Emit the full report as JSON.
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Run a function of a serialized program in the reference interpreter.
    Exec {
        #[arg(long)]
        program: PathBuf,

        #[arg(long, default_value = "main")]
        function: String,

        /// Argument, typed by the signature; `@name` passes a function address.
        #[arg(long = "arg", allow_hyphen_values = true)]
        args: Vec<String>,

        /// `NAME=VALUE`: answer calls to declaration NAME with VALUE.
        #[arg(long = "stub")]
        stubs: Vec<String>,

        /// Run the program's constructors first.
        #[arg(long, default_value_t = false)]
        ctors: bool,

        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Print the identifier assigned to every function.
    Ids {
        #[arg(long)]
        program: PathBuf,

        #[arg(long)]
        facts: Option<PathBuf>,

        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long, default_value_t = false)]
        env: bool,
    },

    /// Show runs recorded in a statistics database.
    Stats {
        #[arg(long)]
        db: PathBuf,

        /// Only runs of this program.
        #[arg(long)]
        program: Option<String>,

        /// Report site hashes shared by at least this many sites.
        #[arg(long, default_value_t = 2)]
        min_sites: u64,

        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Simulate the runtime branch sled in a scratch buffer.
    SledSim {
        /// Address of the first sled word.
        #[arg(long, default_value = "0x400000", value_parser = parse_u64)]
        base: u64,

        /// Words before the fallback word.
        #[arg(long, default_value_t = 3071)]
        capacity: usize,

        /// Resolver address for misses. Without it the sled traps.
        #[arg(long, value_parser = parse_u64)]
        resolver: Option<u64>,

        /// `ID=TARGET` entry to learn; repeatable.
        #[arg(long)]
        learn: Vec<String>,

        /// `HANDLER:MIN:MAX` range to register; repeatable.
        #[arg(long)]
        handler: Vec<String>,

        /// Identifier to route; repeatable.
        #[arg(long)]
        route: Vec<String>,

        /// Print every sled word.
        #[arg(long, default_value_t = false)]
        dump: bool,

        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Patch a dumped procedure linkage table against given GOT contents.
    PltSim {
        #[arg(long, value_enum, default_value = "aarch64")]
        arch: ArchArg,

        /// Raw table bytes, header included.
        #[arg(long)]
        table: PathBuf,

        /// Load address of the table.
        #[arg(long, value_parser = parse_u64)]
        base: u64,

        /// `SLOT=TARGET` GOT contents; repeatable.
        #[arg(long = "slot")]
        slots: Vec<String>,

        /// Where to write the patched table.
        #[arg(long)]
        output: Option<PathBuf>,

        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Look for indirect branches left in a linked binary.
    ScanBinary {
        /// ELF file to scan.
        path: PathBuf,

        /// Scan backend (see `backends`).
        #[arg(long, default_value = "pattern")]
        backend: String,

        /// Override the architecture from the ELF header.
        #[arg(long)]
        arch: Option<String>,

        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// List the available scan backends.
    Backends {
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("SWITCHBOARD_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).try_init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Command::Harden { program, facts, config, env, output, side_dir, stats_db, json } => {
            harden_command(&HardenOptions { program, facts, config, env, output, side_dir, stats_db, json })
        }
        Command::Exec { program, function, args, stubs, ctors, json } => {
            exec_command(&program, &function, &args, &stubs, ctors, json)
        }
        Command::Ids { program, facts, config, env } => {
            ids_command(&program, facts.as_deref(), config.as_deref(), env)
        }
        Command::Stats { db, program, min_sites, json } => stats_command(&db, program.as_deref(), min_sites, json),
        Command::SledSim { base, capacity, resolver, learn, handler, route, dump, json } => {
            sled_sim_command(&SledSimOptions {
                base,
                capacity,
                resolver,
                learn,
                handlers: handler,
                routes: route,
                dump,
                json,
            })
        }
        Command::PltSim { arch, table, base, slots, output, json } => {
            plt_sim_command(&PltSimOptions { arch: arch.into(), table, base, slots, output, json })
        }
        Command::ScanBinary { path, backend, arch, json } => {
            scan_binary_command(&path, &backend, arch.as_deref(), json)
        }
        Command::Backends { json } => list_backends_command(json),
    }
}

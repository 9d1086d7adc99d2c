use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ilweave::il::printer::disassemble_module;
use ilweave::il::Module;
use ilweave::weave::{classify, WeaveRequest};
use ilweave::Config;
use std::fs;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "ilweave")]
#[command(about = "Method-body weaving engine")]
#[command(version)]
struct Cli {
    /// Verbose output (repeat for more)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Weave the targets of a request and write the rewritten module
    Weave {
        /// Request file: module plus targets
        #[arg(value_name = "REQUEST")]
        input: PathBuf,

        /// Output module file (stdout when omitted)
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,

        /// Configuration file, `key = value` lines or a weaver element
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,

        #[arg(long)]
        reverse_call_ending: bool,

        #[arg(long)]
        reverse_call_non_entry: bool,

        #[arg(long)]
        enumerable_returns: bool,

        #[arg(long, value_name = "N")]
        mo_array_threshold: Option<usize>,

        /// Leave every target untouched
        #[arg(long)]
        disable: bool,
    },

    /// Print the shape of every target in a request
    Classify {
        #[arg(value_name = "REQUEST")]
        input: PathBuf,
    },

    /// Disassemble a module
    Dump {
        #[arg(value_name = "MODULE")]
        input: PathBuf,

        /// Only this method, as `Namespace.Type::Method`
        #[arg(short, long)]
        method: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        _ => log::LevelFilter::Debug,
    };
    env_logger::Builder::new().filter_level(level).init();

    match cli.command {
        Commands::Weave {
            input,
            output,
            config,
            reverse_call_ending,
            reverse_call_non_entry,
            enumerable_returns,
            mo_array_threshold,
            disable,
        } => {
            let mut settings = match &config {
                Some(path) => Config::from_file(path).with_context(|| format!("reading {}", path.display()))?,
                None => Config::default(),
            };
            settings.reverse_call_ending |= reverse_call_ending;
            settings.reverse_call_non_entry |= reverse_call_non_entry;
            settings.enumerable_returns |= enumerable_returns;
            if let Some(threshold) = mo_array_threshold {
                settings.mo_array_threshold = threshold;
            }
            if disable {
                settings.enabled = false;
            }
            weave_file(&input, output.as_ref(), &settings)?;
        }
        Commands::Classify { input } => {
            classify_file(&input)?;
        }
        Commands::Dump { input, method } => {
            let text = fs::read_to_string(&input).with_context(|| format!("reading {}", input.display()))?;
            let module = Module::from_json(&text)?;
            print!("{}", disassemble_module(&module, method.as_deref()));
        }
    }

    Ok(())
}

fn weave_file(input: &PathBuf, output: Option<&PathBuf>, config: &Config) -> Result<()> {
    let text = fs::read_to_string(input).with_context(|| format!("reading {}", input.display()))?;
    let (module, report) = ilweave::weave_json(&text, config)?;

    for woven in &report.woven {
        eprintln!("woven   {} ({})", woven.method, woven.shape);
    }
    for skipped in &report.skipped {
        eprintln!("skipped {} (no interceptors)", skipped);
    }

    let json = module.to_json()?;
    match output {
        Some(path) => fs::write(path, json).with_context(|| format!("writing {}", path.display()))?,
        None => println!("{}", json),
    }
    Ok(())
}

fn classify_file(input: &PathBuf) -> Result<()> {
    let text = fs::read_to_string(input).with_context(|| format!("reading {}", input.display()))?;
    let request = WeaveRequest::from_json(&text)?;
    for target in &request.targets {
        let handle = request
            .module
            .find_method(&target.type_name, &target.method)
            .with_context(|| format!("{}::{} not found", target.type_name, target.method))?;
        println!(
            "{}::{}\t{}",
            target.type_name,
            target.method,
            classify(request.module.method(handle))
        );
    }
    Ok(())
}

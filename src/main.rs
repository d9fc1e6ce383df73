use std::env;
use std::io::Read;
use std::process::ExitCode;

use clap::Parser;

use latchy::{AssetList, BuildOptions, Error, IMPLICIT_CONFIG};

/// Unseal Clevis/Tang-bound secrets and deliver them to local consumers.
///
/// A configuration is taken from --cfg, then the LATCHYCFG environment
/// variable, then stdin. Stdin starting with '{' or '[' is a configuration;
/// anything else is treated as a JWE under the implicit stdin-to-stdout
/// configuration.
#[derive(Debug, Parser)]
#[command(name = "latchy", version)]
struct Cli {
    /// JSON formatted configuration string
    #[arg(short = 'c', long = "cfg")]
    cfg: Option<String>,

    /// Enable debug output on stderr, includes informational output as well
    #[arg(short = 'd', long)]
    debug: bool,

    /// Enable informational output on stderr
    #[arg(short = 't', long)]
    trace: bool,

    /// Parse the JWE and print the protected header; perform no decryption
    #[arg(long)]
    dump: bool,

    /// Relax tang server response handling where strict parsing would fail
    #[arg(long)]
    compatible: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.debug {
        log::LevelFilter::Debug
    } else if cli.trace {
        log::LevelFilter::Info
    } else {
        log::LevelFilter::Warn
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Unexpected exception - {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> latchy::Result<()> {
    let (config_text, stdin_payload) = resolve_configuration(cli.cfg)?;
    log::debug!("the configuration string is {config_text}");
    let config = latchy::parse_config(&config_text)?;

    let mut list = AssetList::build(
        &config,
        BuildOptions {
            dump: cli.dump,
            compatible: cli.compatible,
            stdin_payload,
            ..BuildOptions::default()
        },
    )?;

    if cli.dump {
        return Ok(());
    }

    if let Err(err) = list.start_all() {
        list.stop_all();
        return Err(err);
    }

    // All assets are running; this may hang here long (tang retries, slow
    // consumers). Only completion or a signal ends it.
    list.run_to_completion()
}

/// Precedence, high to low: --cfg, LATCHYCFG, stdin. When stdin carries a
/// JWE instead of a configuration, its bytes ride along for the implicit
/// stdin-ingress secret.
fn resolve_configuration(explicit: Option<String>) -> latchy::Result<(String, Option<Vec<u8>>)> {
    if let Some(cfg) = explicit {
        return Ok((cfg, None));
    }
    if let Ok(cfg) = env::var("LATCHYCFG") {
        if !cfg.is_empty() {
            log::debug!("configuration taken from LATCHYCFG");
            return Ok((cfg, None));
        }
    }

    let mut data = Vec::new();
    std::io::stdin()
        .lock()
        .read_to_end(&mut data)
        .map_err(Error::Io)?;
    if data.is_empty() {
        return Err(Error::ConfigInvalid(
            "we are expecting a configuration or a JWE from stdin but got nothing".into(),
        ));
    }

    if latchy::looks_like_config(data[0]) {
        let text = String::from_utf8(data)
            .map_err(|_| Error::ConfigInvalid("configuration is not valid UTF-8".into()))?;
        Ok((text, None))
    } else {
        // Presume a JWE and fall back to the implicit configuration
        Ok((IMPLICIT_CONFIG.to_owned(), Some(data)))
    }
}

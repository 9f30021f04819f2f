use clap::Parser;
use regex::Regex;
use sshenum::fingerprint::Fingerprinting;
use sshenum::scanner::{self, ScanOutcome};
use sshenum::{DEFAULT_CLIENT_ID, Error, ProbeConfig, check_user};
use std::io::{self, BufRead};
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::process::exit;
use std::time::Duration;

/// Timeout for every socket operation of an enumeration probe
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default connect timeout for the scan phase, overridable with -t
const SCAN_TIMEOUT_SECS: u64 = 5;

/// Upper bound accepted for -t
const MAX_TIMEOUT_SECS: u64 = 3600;

/// Tries to enumerate users on an OpenSSH server using a dictionary read
/// from standard input, one username per line
#[derive(Parser)]
#[command(name = "sshenum", version)]
struct Args {
    /// Single target port
    #[arg(short = 'p')]
    port: Option<u16>,

    /// Scan mode: verify ssh services over a port range before enumerating
    #[arg(short = 's')]
    scan: bool,

    /// Lower port of the scan range
    #[arg(short = 'm')]
    min_port: Option<u16>,

    /// Upper port of the scan range
    #[arg(short = 'M')]
    max_port: Option<u16>,

    /// Regular expression a scanned banner must match to count as verified
    #[arg(short = 'r')]
    regexp: Option<String>,

    /// Scan only; no user enumeration is performed
    #[arg(short = 'n')]
    scan_only: bool,

    /// Connect timeout in seconds for the scan phase
    #[arg(short = 't')]
    timeout: Option<u64>,

    /// Client identification string sent during handshakes
    #[arg(short = 'c')]
    client_id: Option<String>,

    /// Identity file prefix under ~/.ssh (e.g. id_rsa)
    #[arg(short = 'i', default_value = "id_rsa")]
    identity: String,

    /// Fingerprint database path; enables the OS tally report
    #[arg(short = 'F')]
    fingerprint_db: Option<PathBuf>,

    /// Verbose trace on standard error
    #[arg(short = 'd')]
    debug: bool,

    /// Target hostname or address
    host: String,
}

/// Arguments after flag-interplay validation
struct Config {
    host: String,
    ports: RangeInclusive<u16>,
    regexp: Option<Regex>,
    scan_only: bool,
    scan_timeout: Duration,
    client_id: String,
    identity: String,
    fingerprint_db: Option<PathBuf>,
}

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let is_help = matches!(
                err.kind(),
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion
            );
            let _ = err.print();
            exit(if is_help { 0 } else { 1 });
        }
    };

    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_target(false)
        .with_max_level(if args.debug {
            tracing::Level::DEBUG
        } else {
            tracing::Level::WARN
        })
        .init();

    let config = match validate(args) {
        Ok(config) => config,
        Err(msg) => {
            eprintln!("{msg}");
            eprintln!("Run with -h for usage.");
            exit(1);
        }
    };

    if let Err(err) = run(&config) {
        eprintln!("{err}");
        exit(2);
    }
}

/// Enforces the flag interplay: -p and -s are exclusive and one is
/// required, -s needs its range and regex, and -n, -t, -r, -c only make
/// sense while scanning
fn validate(args: Args) -> Result<Config, String> {
    if args.port.is_none() && !args.scan {
        return Err("You must specify -p or -s.".to_string());
    }
    if args.port.is_some() && args.scan {
        return Err("-s and -p can't be used together.".to_string());
    }
    if args.scan_only && !args.scan {
        return Err("-n requires -s.".to_string());
    }
    if args.scan_only && args.fingerprint_db.is_some() {
        return Err("-n is not compatible with -F.".to_string());
    }
    if args.timeout.is_some() && !args.scan {
        return Err("-t requires -s.".to_string());
    }
    if args.regexp.is_some() && !args.scan {
        return Err("-r requires -s.".to_string());
    }
    if args.client_id.is_some() && !args.scan {
        return Err("-c requires -s.".to_string());
    }
    if args.min_port.is_some() != args.max_port.is_some() {
        return Err("-m and -M must be given together.".to_string());
    }

    let ports = if let Some(port) = args.port {
        port..=port
    } else {
        match (args.min_port, args.max_port, &args.regexp) {
            (Some(min), Some(max), Some(_)) => {
                if min > max {
                    return Err("-m must not exceed -M.".to_string());
                }
                min..=max
            }
            _ => return Err("-s requires -m, -M and -r.".to_string()),
        }
    };

    let regexp = match &args.regexp {
        Some(pattern) => {
            Some(Regex::new(pattern).map_err(|err| format!("invalid -r expression: {err}"))?)
        }
        None => None,
    };

    let scan_timeout = match args.timeout {
        Some(secs) if (1..=MAX_TIMEOUT_SECS).contains(&secs) => Duration::from_secs(secs),
        Some(_) => {
            return Err(format!(
                "-t must be between 1 and {MAX_TIMEOUT_SECS} seconds."
            ));
        }
        None => Duration::from_secs(SCAN_TIMEOUT_SECS),
    };

    Ok(Config {
        host: args.host,
        ports,
        regexp,
        scan_only: args.scan_only,
        scan_timeout,
        client_id: args
            .client_id
            .unwrap_or_else(|| DEFAULT_CLIENT_ID.to_string()),
        identity: args.identity,
        fingerprint_db: args.fingerprint_db,
    })
}

/// Scans the configured ports, then probes every dictionary user against
/// every verified port
fn run(config: &Config) -> Result<(), Error> {
    let mut verified: Vec<u16> = Vec::new();
    for port in config.ports.clone() {
        match scanner::check_port(
            &config.host,
            port,
            &config.client_id,
            config.regexp.as_ref(),
            config.scan_timeout,
        ) {
            ScanOutcome::Verified(banner) => {
                println!("{port}:VERIFIED:{banner}");
                verified.push(port);
            }
            ScanOutcome::NotVerified(banner) => println!("{port}:NOTVERIFIED:{banner}"),
            ScanOutcome::NoPortAddr => println!("{port}:NO-PORT-ADDR"),
            ScanOutcome::TimeExceed => println!("{port}:TIME-EXCEED"),
        }
    }

    if config.scan_only {
        return Ok(());
    }
    if verified.is_empty() {
        println!("No verified ssh port to enumerate.");
        return Ok(());
    }

    let home = std::env::var("HOME")
        .map_err(|_| Error::Config("HOME is not set, cannot locate ~/.ssh".to_string()))?;
    let ssh_dir = PathBuf::from(home).join(".ssh");

    let mut fingerprinting = match &config.fingerprint_db {
        Some(path) => Some(Fingerprinting::load(path).unwrap_or_else(|err| {
            tracing::warn!("could not load fingerprint db: {err}");
            Fingerprinting::new()
        })),
        None => None,
    };

    for line in io::stdin().lock().lines() {
        let user = match line {
            Ok(user) => user,
            Err(err) => {
                // A broken dictionary source still gets its report flushed
                tracing::warn!("standard input failed: {err}");
                break;
            }
        };
        if user.is_empty() {
            continue;
        }
        for port in &verified {
            if let Some(fingerprinting) = fingerprinting.as_mut() {
                fingerprinting.insert(&user);
            }
            let probe = ProbeConfig {
                host: &config.host,
                port: *port,
                user: &user,
                client_id: &config.client_id,
                identity_prefix: &config.identity,
                ssh_dir: &ssh_dir,
                timeout: PROBE_TIMEOUT,
            };
            match check_user(&probe) {
                Ok(true) => println!("{user}:OK"),
                Ok(false) => println!("{user}:NOK"),
                Err(err) => {
                    tracing::debug!(user = %user, port = *port, "probe failed: {err}");
                    println!("{user}:NOK");
                }
            }
        }
    }

    if let Some(fingerprinting) = fingerprinting {
        print_fingerprint_report(&fingerprinting);
    }
    Ok(())
}

/// Emits the OS tally, most frequent first
fn print_fingerprint_report(fingerprinting: &Fingerprinting) {
    let statistics = fingerprinting.report();
    for (count, os) in &statistics {
        eprintln!("{os} - {count}");
    }
    println!();
    println!("=======================");
    println!("Fingerprint statistics:");
    println!("=======================");
    for (count, os) in statistics {
        println!("{count} # {os}");
    }
}

use anyhow::{anyhow, Context};
use clap::{Arg, ArgAction, ArgMatches, Command};
use memc_load::config::{DEFAULT_PATTERN, DEFAULT_QUEUE_CAPACITY, DEFAULT_WORKERS};
use memc_load::logging::{init_logging, LogConfig, LogFormat};
use memc_load::{
    decode_user_apps, parse_apps_installed, Loader, LoaderConfig, ProtobufEncoder, RecordEncoder,
    ShardAddrs, SourceOptions, UserApps, DEFAULT_MAX_LINE_LENGTH,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;
use tracing::{info, warn, Level};

const SELF_TEST_SAMPLE: &str = "idfa\t1rfw452y52g2gq4g\t55.55\t42.42\t1423,43,567,3,7,23\n\
                                gaid\t7rfw452y52g2gq4g\t55.55\t42.42\t7423,424";

/// Any file failed, was read partially, or loaded with a high error rate.
const EXIT_UNCLEAN: u8 = 2;

fn cli() -> Command {
    let defaults = ShardAddrs::default();
    let addr = |name: &'static str, default: String, env: &'static str| {
        Arg::new(name)
            .long(name)
            .env(env)
            .default_value(default)
            .help(format!("{} memcached address", name.to_uppercase()))
    };

    Command::new("memc-load")
        .about("Load gzip'd installed-apps dumps into sharded memcached")
        .arg(Arg::new("test").short('t').long("test").help("Run the encoder self-check and exit").action(ArgAction::SetTrue))
        .arg(Arg::new("log").short('l').long("log").env("MEMC_LOAD_LOG").help("Append logs to this file instead of stderr").value_parser(clap::value_parser!(PathBuf)))
        .arg(Arg::new("log-level").long("log-level").env("MEMC_LOAD_LOG_LEVEL").help("Defaults to info, or debug with --dry").value_parser(clap::value_parser!(Level)))
        .arg(Arg::new("log-format").long("log-format").env("MEMC_LOAD_LOG_FORMAT").default_value("text").value_parser(clap::value_parser!(LogFormat)))
        .arg(Arg::new("dry").long("dry").env("MEMC_LOAD_DRY").help("Parse and encode, but don't write to memcached").action(ArgAction::SetTrue))
        .arg(Arg::new("pattern").long("pattern").env("MEMC_LOAD_PATTERN").default_value(DEFAULT_PATTERN))
        .arg(addr("idfa", defaults.idfa, "MEMC_LOAD_IDFA"))
        .arg(addr("gaid", defaults.gaid, "MEMC_LOAD_GAID"))
        .arg(addr("adid", defaults.adid, "MEMC_LOAD_ADID"))
        .arg(addr("dvid", defaults.dvid, "MEMC_LOAD_DVID"))
        .arg(Arg::new("workers").long("workers").env("MEMC_LOAD_WORKERS").default_value(DEFAULT_WORKERS.to_string()).value_parser(clap::value_parser!(usize)))
        .arg(Arg::new("queue-capacity").long("queue-capacity").env("MEMC_LOAD_QUEUE_CAPACITY").default_value(DEFAULT_QUEUE_CAPACITY.to_string()).value_parser(clap::value_parser!(usize)))
        .arg(Arg::new("charset").long("charset").env("MEMC_LOAD_CHARSET").default_value("utf-8").help("Input text encoding label"))
}

fn string_arg(matches: &ArgMatches, name: &str) -> anyhow::Result<String> {
    matches
        .get_one::<String>(name)
        .cloned()
        .ok_or_else(|| anyhow!("missing --{name}"))
}

fn loader_config(matches: &ArgMatches) -> anyhow::Result<LoaderConfig> {
    let charset_label = string_arg(matches, "charset")?;
    let charset = encoding_rs::Encoding::for_label(charset_label.as_bytes())
        .ok_or_else(|| anyhow!("unknown charset: {charset_label}"))?;

    Ok(LoaderConfig {
        dry_run: matches.get_flag("dry"),
        pattern: string_arg(matches, "pattern")?,
        workers: matches.get_one::<usize>("workers").copied().unwrap_or(DEFAULT_WORKERS),
        queue_capacity: matches
            .get_one::<usize>("queue-capacity")
            .copied()
            .unwrap_or(DEFAULT_QUEUE_CAPACITY),
        shards: ShardAddrs {
            idfa: string_arg(matches, "idfa")?,
            gaid: string_arg(matches, "gaid")?,
            adid: string_arg(matches, "adid")?,
            dvid: string_arg(matches, "dvid")?,
        },
        source: SourceOptions {
            charset,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
        },
    })
}

/// Encode the built-in sample lines and check they decode back unchanged.
fn self_test() -> anyhow::Result<()> {
    for line in SELF_TEST_SAMPLE.lines() {
        let record = parse_apps_installed(line.trim())?;
        let packed = ProtobufEncoder.encode(&record)?;
        let unpacked = decode_user_apps(&packed)?;
        anyhow::ensure!(
            unpacked == UserApps::from(&record),
            "round trip mismatch for {}",
            record.key()
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let matches = cli().get_matches();
    let config = loader_config(&matches)?;

    let default_level = if config.dry_run { Level::DEBUG } else { Level::INFO };
    let log_config = LogConfig {
        level: matches.get_one::<Level>("log-level").copied().unwrap_or(default_level),
        format: matches.get_one::<LogFormat>("log-format").copied().unwrap_or_default(),
        file: matches.get_one::<PathBuf>("log").cloned(),
    };
    let _guard = init_logging(&log_config)?;

    if matches.get_flag("test") {
        self_test().context("self-test failed")?;
        info!("Self-test passed");
        return Ok(ExitCode::SUCCESS);
    }

    info!(?config, "Memc loader started");
    let start = Instant::now();

    let loader = Loader::from_config(&config)?;
    let summary = loader.load_pattern(&config.pattern).await?;
    let totals = summary.totals();

    if summary.reports.is_empty() && summary.failed.is_empty() {
        warn!(pattern = %config.pattern, "No files matched");
    }
    info!(
        files = summary.reports.len(),
        failed = summary.failed.len(),
        processed = totals.processed,
        errors = totals.errors,
        "Execution time: {:.3}s",
        start.elapsed().as_secs_f64()
    );

    if summary.is_clean() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(EXIT_UNCLEAN))
    }
}

//! Reference front-end for natus: loads an engine plugin, wires up
//! `require`, evaluates a file or inline script, and maps the result (or
//! failure) onto a process exit code.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use natus::require::RequireConfig;
use natus::{Context, EngineLoader, NatusError, NatusResult, Value};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "natus", about = "Run JavaScript on a pluggable embedded engine")]
struct Cli {
    /// Named engine plugin to load, or a direct path to one. Defaults to the
    /// first plugin found under `NATUS_PATH`/the current directory.
    #[arg(short = 'e', long = "engine", value_name = "NAME|PATH")]
    engine: Option<String>,

    /// A `key=jsonval` pair, or a path to a JSON file whose top-level object
    /// is merged onto the global object. May be repeated.
    #[arg(short = 'C', long = "config", value_name = "KEY=VALUE|FILE")]
    config: Vec<String>,

    /// Evaluate `script` instead of reading a file.
    #[arg(short = 'c', long = "eval", value_name = "SCRIPT")]
    eval: Option<String>,

    /// Skip installing the `require` subsystem.
    #[arg(short = 'n', long = "no-require")]
    no_require: bool,

    /// Script file to run.
    file: Option<PathBuf>,

    /// Arguments passed through to the script as `natus.args`.
    args: Vec<String>,
}

fn natus_path() -> Vec<PathBuf> {
    std::env::var_os("NATUS_PATH")
        .map(|v| std::env::split_paths(&v).collect())
        .unwrap_or_default()
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{}", err.cli_line());
            ExitCode::from(exit_code_for(&err))
        }
    }
}

fn exit_code_for(err: &NatusError) -> u8 {
    match err {
        NatusError::Backend(_) => 2,
        NatusError::Os { .. } => 3,
        NatusError::Script { .. } => 8,
        _ => 8,
    }
}

fn run(cli: Cli) -> NatusResult<ExitCode> {
    let search_paths = natus_path();
    let engines_dir = search_paths.first().cloned().unwrap_or_else(|| PathBuf::from("."));
    let engine = EngineLoader::new(engines_dir).load(cli.engine.as_deref())?;
    let ctx = Context::new(engine)?;

    let mut config = serde_json::Map::new();
    for pair in &cli.config {
        merge_config(&mut config, pair)?;
    }
    for (key, value) in &config {
        let native = natus::json::from_serde(&ctx, value);
        ctx.global().set(key.as_str(), &native)?;
    }

    if !cli.no_require {
        ctx.init_require(require_config_from(&config, &search_paths));
    }

    install_args(&ctx, &cli.args)?;

    let source = match (&cli.eval, &cli.file) {
        (Some(script), _) => script.clone(),
        (None, Some(path)) => std::fs::read_to_string(path).map_err(NatusError::os)?,
        (None, None) => {
            eprintln!("natus: no script given (pass -c <script> or a file path)");
            return Ok(ExitCode::from(3));
        }
    };

    let filename = cli
        .file
        .as_deref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "<eval>".to_string());

    let global = ctx.global();
    let result = ctx.evaluate(&global, &source, &filename, 1)?;
    if result.is_exception() {
        let message = result.to_rust_string().unwrap_or_else(|_| "uncaught exception".to_string());
        return Err(NatusError::script(message));
    }

    if result.type_name() == "number" {
        let code = result.to_number();
        if code.is_finite() {
            return Ok(ExitCode::from(code as u8));
        }
    }

    Ok(ExitCode::SUCCESS)
}

/// Installs `natus.args`, the CLI's trailing positional arguments, as an
/// array visible to the running script.
fn install_args(ctx: &Context, args: &[String]) -> NatusResult<()> {
    let values: Vec<Value> = args.iter().map(|a| ctx.string(a)).collect();
    let array = ctx.array(&values);
    let natus_ns = ctx.object();
    natus_ns.set("args", &array)?;
    ctx.global().set("natus", &natus_ns)?;
    Ok(())
}

/// Merges one `-C` argument into `config`: either `key=jsonval`, merged as
/// a single top-level key, or a path to a JSON file whose top-level object
/// is merged key-by-key. Applied to the global object only after every
/// `-C` flag has been folded in, so `require_config_from` can read
/// `natus.require`/`natus.origins` back out of the fully merged config
/// before `init_require` installs the module loader.
fn merge_config(config: &mut serde_json::Map<String, serde_json::Value>, pair: &str) -> NatusResult<()> {
    if let Some((key, value)) = pair.split_once('=') {
        let json: serde_json::Value =
            serde_json::from_str(value).map_err(|e| NatusError::logic(format!("invalid JSON for -C {key}: {e}")))?;
        config.insert(key.to_string(), json);
        return Ok(());
    }

    let text = std::fs::read_to_string(pair).map_err(NatusError::os)?;
    let json: serde_json::Value =
        serde_json::from_str(&text).map_err(|e| NatusError::logic(format!("invalid JSON in {pair}: {e}")))?;
    let serde_json::Value::Object(map) = json else {
        return Err(NatusError::logic(format!("{pair}: config file must contain a JSON object")));
    };
    config.extend(map);
    Ok(())
}

fn string_list(value: Option<&serde_json::Value>) -> Option<Vec<String>> {
    value?.as_array().map(|entries| entries.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
}

/// Builds the `require` subsystem configuration from the merged `-C`
/// config's `natus.require`/`natus.origins` objects, falling back to
/// `NATUS_PATH` for the search path when `natus.require.path` is absent.
fn require_config_from(config: &serde_json::Map<String, serde_json::Value>, natus_path: &[PathBuf]) -> RequireConfig {
    let natus_ns = config.get("natus").and_then(serde_json::Value::as_object);
    let require_ns = natus_ns.and_then(|n| n.get("require")).and_then(serde_json::Value::as_object);
    let origins_ns = natus_ns.and_then(|n| n.get("origins")).and_then(serde_json::Value::as_object);

    let mut search_paths = natus_path.to_vec();
    if let Some(extra) = string_list(require_ns.and_then(|r| r.get("path"))) {
        search_paths.extend(extra.into_iter().map(PathBuf::from));
    }

    RequireConfig {
        search_paths,
        whitelist: string_list(require_ns.and_then(|r| r.get("whitelist"))),
        origins_whitelist: string_list(origins_ns.and_then(|o| o.get("whitelist"))),
        origins_blacklist: string_list(origins_ns.and_then(|o| o.get("blacklist"))),
    }
}

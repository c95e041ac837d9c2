//! `covrt ctl`: send control commands to a running process.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use covrt::{ClientProxy, CommandDescriptor, CommandId, Payload, Properties, Settings};
use covrt_proto::parse_bool;
use tracing::{debug, info};

/// Arguments for `covrt ctl`.
///
/// Usage: `covrt ctl [-a HOST:PORT] -c COMMAND[,ARG...]... [-D KEY=VALUE]...`
#[derive(clap::Args)]
pub struct CtlArgs {
    /// Control endpoint (`host`, `host:port`, or `:port`).
    #[arg(short = 'a', long = "address")]
    pub address: Option<String>,

    /// Command and comma-separated arguments, e.g. `coverage.get,out.ec`.
    /// An empty argument keeps its default.
    #[arg(short = 'c', long = "command", required = true)]
    pub commands: Vec<String>,

    /// Set a runtime property.
    #[arg(short = 'D', value_name = "KEY=VALUE")]
    pub defines: Vec<String>,

    /// Properties file (JSON).
    #[arg(long = "props")]
    pub props: Option<PathBuf>,

    /// Seconds to wait for each response.
    #[arg(long, default_value_t = 300)]
    pub timeout: u64,
}

impl CtlArgs {
    pub fn run(self) -> Result<()> {
        let overrides = parse_defines(&self.defines)?;
        let props = Properties::load(self.props.as_deref(), &overrides)
            .context("cannot load runtime properties")?;
        let settings = Settings::from_properties(&props);

        let client = match &self.address {
            Some(addr) => ClientProxy::from_connection_string(addr)?,
            None => ClientProxy::create(&settings.control_host, settings.control_port)?,
        }
        .connect_timeout(Duration::from_secs(10))
        .io_timeout(Duration::from_secs(self.timeout));

        for spec in &self.commands {
            run_command(&client, &settings, spec)?;
        }
        Ok(())
    }
}

fn run_command(client: &ClientProxy, settings: &Settings, spec: &str) -> Result<()> {
    let (name, args) = tokenize(spec)?;
    let descriptor = CommandDescriptor::lookup(&name)?;
    let mut request = descriptor.request(args)?;
    descriptor.populate_defaults(&mut request, &settings.client_defaults());

    debug!(%request, "executing control command");
    let payload = client
        .call(&request)
        .with_context(|| format!("command [{request}] failed"))?;

    match (descriptor.id, payload) {
        (CommandId::GetCoverage, Payload::Coverage(snapshot)) if !snapshot.is_empty() => {
            let path = request
                .arg(0)
                .map_or_else(|| settings.out_file.clone(), PathBuf::from);
            let merge = request.arg(1).map_or(settings.out_merge, parse_bool);
            save(&snapshot, &path, merge)?;
        }
        (CommandId::GetCoverage, _) => info!("no runtime coverage data received"),
        (_, Payload::Int(v)) => println!("{v}"),
        (_, Payload::Str(msg)) => info!("{msg}"),
        (_, Payload::None) => debug!(%request, "no result"),
        (_, other) => debug!(%request, result = ?other, "unexpected result"),
    }
    Ok(())
}

fn save(snapshot: &covrt::CoverageSnapshot, path: &Path, merge: bool) -> Result<()> {
    let merged = merge && path.is_file();
    covrt::data::persist(snapshot, path, merge)
        .with_context(|| format!("cannot write coverage data to {}", path.display()))?;
    info!(
        "runtime coverage data {} [{}]",
        if merged { "merged into" } else { "written to" },
        path.display()
    );
    Ok(())
}

/// Splits `name,arg,,arg` into a command name and argument slots.
///
/// Empty arguments are absent; trailing empty arguments are dropped.
fn tokenize(spec: &str) -> Result<(String, Vec<Option<String>>)> {
    let mut tokens: Vec<&str> = spec.split(',').map(str::trim).collect();
    while tokens.last().is_some_and(|t| t.is_empty()) {
        tokens.pop();
    }
    let Some((name, args)) = tokens.split_first() else {
        bail!("empty command [{spec}]");
    };
    if name.is_empty() {
        bail!("missing command name in [{spec}]");
    }
    let args = args
        .iter()
        .map(|t| (!t.is_empty()).then(|| (*t).to_owned()))
        .collect();
    Ok(((*name).to_owned(), args))
}

fn parse_defines(defines: &[String]) -> Result<Properties> {
    defines
        .iter()
        .map(|d| {
            d.split_once('=')
                .map(|(k, v)| (k.trim(), v))
                .filter(|(k, _)| !k.is_empty())
                .with_context(|| format!("invalid property [{d}], expected KEY=VALUE"))
        })
        .collect()
}

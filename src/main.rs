use anyhow::{bail, Context as _, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tapsocks::config::CONFIG_FILE;
use tapsocks::{
  CertificateStore, Config, ConfigWatcher, Context, Exporter, HistorySink, JsonLinesSink, Server,
  TracingSink,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

const DATA_DIR: &str = ".tapsocks";

#[derive(Parser)]
#[command(name = "tapsocks")]
#[command(version)]
#[command(about = "TLS-intercepting SOCKS5 proxy that records HTTP traffic", long_about = None)]
struct Cli {
  /// Directory holding the data directory, defaults to $HOME
  #[arg(short, long)]
  base: Option<PathBuf>,

  /// Logged listener address, overrides the config file
  #[arg(short, long)]
  listen: Option<String>,

  /// Unlogged listener address, overrides the config file
  #[arg(long)]
  listen_alt: Option<String>,

  /// Append exported records to this JSON lines file
  #[arg(short, long)]
  export: Option<PathBuf>,

  /// Enable verbose logging
  #[arg(short, long)]
  verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
  let cli = Cli::parse();

  let filter = if cli.verbose {
    EnvFilter::new("debug")
  } else {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
  };
  tracing_subscriber::fmt().with_env_filter(filter).init();

  let base = match cli.base {
    Some(base) => base,
    None => dirs::home_dir().context("cannot determine the home directory, pass --base")?,
  };
  let data = base.join(DATA_DIR);
  prepare_data_dir(&data)?;
  info!("Data directory: {}", data.display());

  let config_path = data.join(CONFIG_FILE);
  let mut config = Config::load_or_default(&config_path)
    .with_context(|| format!("loading {}", config_path.display()))?;
  if let Some(listen) = cli.listen {
    config.listen = listen;
  }
  if let Some(listen_alt) = cli.listen_alt {
    config.listen_alt = Some(listen_alt);
  }
  if let Some(export) = cli.export {
    config.export_path = Some(export);
  }

  let store = CertificateStore::new(&data);
  let ca = store
    .load_or_create(config.key_algorithm, &config.organization)
    .await
    .context("loading the root CA")?;
  info!("Root CA: {}", store.cert_path().display());
  let roots = store.trusted_roots().await.context("loading trusted roots")?;

  let mut exporter = Exporter::default();
  exporter.push(Arc::new(TracingSink));
  exporter.push(Arc::new(HistorySink::new(config.history_size)));
  if let Some(path) = &config.export_path {
    info!("Exporting records to {}", path.display());
    exporter.push(Arc::new(JsonLinesSink::new(path)));
  }

  let ctx = Arc::new(Context::new(&config, ca, roots, exporter)?);
  let watched = ctx.clone();
  ConfigWatcher::watch(config_path, move |config| watched.apply(&config))
    .context("watching the config file")?;

  let server = Server::bind(ctx, &config.listen, config.listen_alt.as_deref())
    .await
    .context("binding listeners")?;
  server.run().await;
  Ok(())
}

/// Create the data directory if needed and refuse one other users could
/// tamper with.
fn prepare_data_dir(path: &Path) -> Result<()> {
  match std::fs::symlink_metadata(path) {
    Ok(meta) => {
      if meta.file_type().is_symlink() {
        bail!("{} is a symlink", path.display());
      }
      if !meta.is_dir() {
        bail!("{} is not a directory", path.display());
      }
      #[cfg(unix)]
      {
        use std::os::unix::fs::PermissionsExt;
        if meta.permissions().mode() & 0o007 != 0 {
          bail!("{} is accessible by other users", path.display());
        }
      }
    }
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
      let mut builder = std::fs::DirBuilder::new();
      builder.recursive(true);
      #[cfg(unix)]
      {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
      }
      builder
        .create(path)
        .with_context(|| format!("creating {}", path.display()))?;
    }
    Err(e) => return Err(e).with_context(|| format!("inspecting {}", path.display())),
  }
  Ok(())
}

//! txguard - run SQL statements with retry-safe transaction handling.

mod cli;
mod output;

use anyhow::{anyhow, bail, Context as _};
use cli::{Cli, ParamArg};
use tracing::{error, info, warn};
use txguard::logging::{default_log_path, init_file_logging, init_stderr_logging};
use txguard::{Config, Connection, ConnectionConfig, Driver, TxGuardError};

#[tokio::main]
async fn main() {
    // A missing .env file is fine
    let _ = dotenvy::dotenv();

    let cli = Cli::parse_args();
    match &cli.log_file {
        Some(path) => {
            let path = path.clone().unwrap_or_else(default_log_path);
            init_file_logging(&path);
        }
        None => init_stderr_logging(),
    }

    if let Err(e) = run(cli).await {
        let category = e
            .downcast_ref::<TxGuardError>()
            .map(TxGuardError::category)
            .unwrap_or("Error");
        error!("{}: {:#}", category, e);
        eprintln!("{}: {:#}", category, e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config_path = cli.config_path();
    info!("Loading config from: {}", config_path.display());
    let config = Config::load_from_file(&config_path)?;

    let connection = resolve_connection(&cli, &config)?.ok_or_else(|| {
        anyhow!("No connection configured. Pass a connection string or use --connection")
    })?;
    info!("Connection: {}", connection.display_string());

    if cli.statements.is_empty() {
        bail!("Nothing to execute. Pass statements with -e/--execute");
    }
    let params = cli.parse_params().map_err(|e| anyhow!(e))?;

    let driver = Driver::new();
    let mut conn = driver
        .connect(&connection)
        .await
        .with_context(|| format!("Failed to open {}", connection.display_string()))?;

    let outcome = run_statements(&mut conn, &cli, &params).await;
    let closed = conn.close().await;
    driver.shutdown().await;

    outcome?;
    closed?;
    Ok(())
}

async fn run_statements(
    conn: &mut Connection,
    cli: &Cli,
    params: &[ParamArg],
) -> anyhow::Result<()> {
    if cli.transaction {
        conn.set_auto_commit(false)?;
    }
    if cli.read_only {
        conn.set_read_only(true)?;
    }

    for sql in &cli.statements {
        let mut binder = conn.prepare(sql)?;
        let names: Vec<String> = binder.slot_names().iter().map(|n| n.to_string()).collect();
        for param in params.iter().filter(|p| names.contains(&p.name)) {
            binder.set_by_name(&param.name, param.value.clone(), param.hint.clone())?;
        }

        let result = match conn.execute(&binder).await {
            Ok(result) => result,
            Err(e) => {
                if cli.transaction {
                    warn!("Statement failed, rolling back transaction");
                    conn.rollback().await?;
                }
                return Err(anyhow::Error::new(e).context(format!("Statement failed: {sql}")));
            }
        };

        if cli.json {
            println!("{}", output::render_json(sql, &result));
        } else {
            println!("{}", output::render_text(&result));
        }
    }

    if cli.transaction {
        let outcome = conn.commit().await?;
        info!("Transaction committed ({:?})", outcome);
    }
    Ok(())
}

/// Resolves the final connection configuration from CLI args, config file, and environment.
///
/// Precedence: connection string, then `--connection NAME`, then the
/// `default` connection from the config file.
fn resolve_connection(cli: &Cli, config: &Config) -> anyhow::Result<Option<ConnectionConfig>> {
    let mut connection = cli.to_connection_config()?;

    if connection.is_none() {
        if let Some(name) = cli.connection_name() {
            connection = Some(config.get_connection(Some(name)).ok_or_else(|| {
                TxGuardError::config(format!("Connection '{}' not found in config file", name))
            })?);
        }
    }

    if connection.is_none() {
        connection = config.get_connection(None);
    }

    if let Some(ref mut conn) = connection {
        conn.apply_env_defaults();
    }

    Ok(connection)
}

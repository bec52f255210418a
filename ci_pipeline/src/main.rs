//! BIRTHNON CI/CD pipeline in containers: the `test` and `deploy` jobs of
//! the GitHub workflow as Dagger stages.

mod containers;
mod stages;

use std::path::Path;

use clap::{Args, Parser, Subcommand};
use dagger_sdk::{Directory, HostDirectoryOpts, Query};
use sha2::{Digest, Sha256};

use crate::stages::deploy::Target;
use crate::stages::PythonEnv;

/// Lock file that keys the pip cache, relative to the checkout.
pub const REQUIREMENTS: &str = "bscore/requirements.txt";

#[derive(Parser)]
#[command(name = "birthnon-ci-pipeline", about = "BIRTHNON CI/CD Pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct SourceArgs {
    #[arg(long)]
    source: String,

    #[arg(long, env = "PYTHON_VERSION", default_value = "3.12.7")]
    python_version: String,
}

#[derive(Subcommand)]
enum Command {
    /// Install dependencies only
    Install {
        #[command(flatten)]
        src: SourceArgs,
    },
    /// Migrations and Django tests
    Test {
        #[command(flatten)]
        src: SourceArgs,
    },
    /// collectstatic --noinput
    Collectstatic {
        #[command(flatten)]
        src: SourceArgs,
    },
    /// Run deploy_django.py on the server (DO_HOST, DO_USERNAME, DO_PASSWORD)
    Deploy,
    /// Print the pip cache volume name for a checkout
    #[command(name = "cache-key")]
    CacheKey {
        #[arg(long)]
        source: String,
    },
    /// Full pipeline (test, then collectstatic + deploy on main)
    All {
        #[command(flatten)]
        src: SourceArgs,

        /// Branch being built; only `main` deploys
        #[arg(long, env = "GITHUB_REF_NAME", default_value = "main")]
        branch: String,
    },
}

fn host_directory(client: &Query, source: &str) -> Directory {
    client.host().directory_opts(
        source,
        HostDirectoryOpts {
            exclude: Some(vec![
                ".git/",
                "ci/",
                "**/__pycache__/",
                "**/.venv/",
                "bscore/staticfiles/",
            ]),
            include: None,
            gitignore: None,
            no_cache: None,
        },
    )
}

/// SHA-256 of the requirements file, hex encoded.
fn requirements_hash(source: &Path) -> eyre::Result<String> {
    let path = source.join(REQUIREMENTS);
    let bytes = std::fs::read(&path)
        .map_err(|e| eyre::eyre!("reading {}: {e}", path.display()))?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

fn python_env(src: &SourceArgs) -> eyre::Result<PythonEnv> {
    Ok(PythonEnv {
        version: src.python_version.clone(),
        requirements_hash: requirements_hash(Path::new(&src.source))?,
    })
}

fn deploy_target() -> eyre::Result<Target> {
    Target::from_lookup(|key| std::env::var(key).ok())
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    let Cli { command } = Cli::parse();

    if let Command::CacheKey { source } = &command {
        println!("pip-{}", requirements_hash(Path::new(source))?);
        return Ok(());
    }

    dagger_sdk::connect(|client| async move {
        match command {
            Command::Install { src } => {
                let env = python_env(&src)?;
                let dir = host_directory(&client, &src.source);
                let out = stages::install::run(&client, dir, &env).await?;
                println!("{out}");
            }
            Command::Test { src } => {
                let env = python_env(&src)?;
                let dir = host_directory(&client, &src.source);
                let out = stages::test::run(&client, dir, &env).await?;
                println!("{out}");
            }
            Command::Collectstatic { src } => {
                let env = python_env(&src)?;
                let dir = host_directory(&client, &src.source);
                let out = stages::collectstatic::run(&client, dir, &env).await?;
                println!("{out}");
            }
            Command::Deploy => {
                let target = deploy_target()?;
                let out = stages::deploy::run(&client, &target).await?;
                println!("{out}");
            }
            Command::CacheKey { .. } => {}
            Command::All { src, branch } => {
                let env = python_env(&src)?;
                let dir = host_directory(&client, &src.source);

                println!("=== Job: test ===");
                let test_out = stages::test::run(&client, dir.clone(), &env).await?;
                println!("{test_out}");

                if branch != "main" {
                    println!("Skipping deploy: branch '{branch}' is not main");
                } else {
                    // Checked before collectstatic so a missing secret fails fast.
                    let target = deploy_target()?;

                    println!("=== Job: deploy ===");
                    let static_out = stages::collectstatic::run(&client, dir, &env).await?;
                    println!("{static_out}");
                    let deploy_out = stages::deploy::run(&client, &target).await?;
                    println!("{deploy_out}");
                }

                println!("\n=== BIRTHNON CI/CD Pipeline Complete ===");
            }
        }
        Ok(())
    })
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requirements_hash() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("bscore")).unwrap();
        std::fs::write(dir.path().join(REQUIREMENTS), "Django==5.0\n").unwrap();

        let first = requirements_hash(dir.path()).unwrap();
        assert_eq!(first.len(), 64);
        assert_eq!(first, hex::encode(Sha256::digest(b"Django==5.0\n")));

        std::fs::write(dir.path().join(REQUIREMENTS), "Django==5.1\n").unwrap();
        assert_ne!(requirements_hash(dir.path()).unwrap(), first);
    }

    #[test]
    fn test_requirements_hash_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = requirements_hash(dir.path()).unwrap_err();
        assert!(err.to_string().contains("requirements.txt"));
    }

    #[test]
    fn test_cli_parses_all() {
        let cli = Cli::try_parse_from([
            "birthnon-ci-pipeline",
            "all",
            "--source",
            ".",
            "--branch",
            "feature/x",
        ])
        .unwrap();
        match cli.command {
            Command::All { src, branch } => {
                assert_eq!(branch, "feature/x");
                assert_eq!(src.source, ".");
            }
            _ => panic!("expected all"),
        }
    }
}

use dagger_sdk::{Directory, Query};

use crate::containers;
use crate::stages::PythonEnv;

/// Upgrade pip and install `bscore/requirements.txt`.
pub async fn run(client: &Query, source: Directory, env: &PythonEnv) -> eyre::Result<String> {
    let output = containers::django_base(client, source, &env.version, &env.requirements_hash)
        .with_exec(vec!["pip", "freeze"])
        .stdout()
        .await?;

    Ok(format!("[install] Dependencies installed.\n{output}"))
}

use dagger_sdk::{Directory, Query};

use crate::containers;
use crate::stages::PythonEnv;

pub async fn run(client: &Query, source: Directory, env: &PythonEnv) -> eyre::Result<String> {
    let output = containers::django_base(client, source, &env.version, &env.requirements_hash)
        .with_workdir("/app/bscore")
        .with_exec(vec!["python", "manage.py", "collectstatic", "--noinput"])
        .stdout()
        .await?;

    Ok(format!("[collectstatic] Static files collected.\n{output}"))
}

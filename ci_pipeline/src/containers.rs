use dagger_sdk::{Container, Directory, Query};

/// Python image with the pip cache mounted under a volume keyed by the
/// requirements hash, so a changed lock file starts from a fresh cache.
pub fn python_base(
    client: &Query,
    source: Directory,
    python_version: &str,
    requirements_hash: &str,
) -> Container {
    client
        .container()
        .from(format!("python:{python_version}-slim"))
        .with_mounted_cache(
            "/root/.cache/pip",
            client.cache_volume(format!("pip-{requirements_hash}")),
        )
        .with_workdir("/app")
        .with_directory("/app", source)
        .with_env_variable("PYTHONUNBUFFERED", "1")
}

/// Python container with the project requirements installed.
pub fn django_base(
    client: &Query,
    source: Directory,
    python_version: &str,
    requirements_hash: &str,
) -> Container {
    python_base(client, source, python_version, requirements_hash)
        .with_exec(vec!["python", "-m", "pip", "install", "--upgrade", "pip"])
        .with_exec(vec!["pip", "install", "-r", crate::REQUIREMENTS])
}

/// Slim Debian container carrying the ssh client and sshpass.
pub fn ssh_client(client: &Query) -> Container {
    client
        .container()
        .from("debian:bookworm-slim")
        .with_exec(vec!["apt-get", "update"])
        .with_exec(vec![
            "apt-get", "install", "-y",
            "sshpass", "openssh-client",
        ])
}

use dagger_sdk::Query;

/// Droplet credentials. The password never leaves a Dagger secret.
#[cfg_attr(test, derive(Debug))]
pub struct Target {
    pub host: String,
    pub username: String,
    pub password: String,
}

impl Target {
    /// `DO_HOST` and `DO_PASSWORD` are required; `DO_USERNAME` defaults to `root`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> eyre::Result<Self> {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.is_empty());

        let host = non_empty("DO_HOST")
            .ok_or_else(|| eyre::eyre!("DO_HOST environment variable not set"))?;
        let password = non_empty("DO_PASSWORD")
            .ok_or_else(|| eyre::eyre!("DO_PASSWORD environment variable not set"))?;
        let username = non_empty("DO_USERNAME").unwrap_or_else(|| "root".to_string());

        Ok(Self {
            host,
            username,
            password,
        })
    }

    pub fn destination(&self) -> String {
        format!("{}@{}", self.username, self.host)
    }
}

/// Run `deploy_django.py` on the server over password SSH.
pub async fn run(client: &Query, target: &Target) -> eyre::Result<String> {
    let password = client.set_secret("DO_PASSWORD", target.password.as_str());
    let destination = target.destination();

    let output = crate::containers::ssh_client(client)
        .with_secret_variable("SSHPASS", password)
        .with_exec(vec![
            "sshpass", "-e", "ssh",
            "-o", "StrictHostKeyChecking=no",
            destination.as_str(),
            "python3 deploy_django.py",
        ])
        .stdout()
        .await?;

    Ok(format!("[deploy] Deployed to {}.\n{output}", target.host))
}

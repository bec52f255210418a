pub mod collectstatic;
pub mod deploy;
pub mod install;

/// Image and cache selection shared by the Python stages.
#[derive(Clone, Debug)]
pub struct PythonEnv {
    pub version: String,
    pub requirements_hash: String,
}

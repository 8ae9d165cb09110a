use std::path::PathBuf;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "heimdall",
    about = "Supervises a redundant fleet of validator nodes running one staking \
             identity and keeps at most one of them promoted to block-producing leader."
)]
pub struct CommandLine {
    /// YAML configuration for this supervisor instance.
    #[structopt(name = "config")]
    pub config: PathBuf,
}

impl CommandLine {
    pub fn load() -> Self {
        Self::from_args()
    }
}
